//! Per-request parse session.
//!
//! An [`UploadSession`] consumes a multipart body in two stages.
//! [`UploadSession::process`] reads up to and including the `map` field and
//! returns the operations document with [`Upload`](crate::Upload) placeholders
//! spliced in. The returned [`UploadDriver`] must then be run alongside the
//! caller's own work: it streams the remaining file parts into their buffers
//! and settles every upload.
//!
//! Two handles connect the session to the surrounding server:
//!
//! - [`AbortHandle::disconnect`] is called when the connection closes early.
//! - [`CleanupHandle::release`] is called once the response has completed and
//!   frees every file buffer.

use std::future::Future;
use std::io;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::Stream;
use futures_util::future::{Either, select};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::multipart::{MultipartEvent, PartHeaders, PartStream};
use crate::spill::SpillBuffer;
use crate::upload::FileUpload;
use crate::upload_map::UploadMap;
use crate::value::Value;

const DEFAULT_MIMETYPE: &str = "text/plain";
const DEFAULT_ENCODING: &str = "7bit";

#[derive(Debug, Default)]
struct SessionState {
    exit_error: Option<UploadError>,
    uploads: Option<UploadMap>,
    current: Option<Arc<SpillBuffer>>,
    body_ended: bool,
}

/// State shared between the parser, the driver and the lifecycle handles.
#[derive(Debug)]
struct Shared {
    config: UploadConfig,
    state: Mutex<SessionState>,
    released: AtomicBool,
    aborted: watch::Sender<bool>,
    /// Set by every disconnect before the body ends, even after a fatal error.
    closed: watch::Sender<bool>,
}

impl Shared {
    fn new(config: UploadConfig) -> Self {
        let (aborted, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            config,
            state: Mutex::new(SessionState::default()),
            released: AtomicBool::new(false),
            aborted,
            closed,
        }
    }

    /// Enter the terminal state. The first error wins and is returned.
    fn exit(&self, error: UploadError) -> UploadError {
        let mut state = self.state.lock();
        self.exit_locked(&mut state, error)
    }

    fn exit_locked(&self, state: &mut SessionState, error: UploadError) -> UploadError {
        if let Some(first) = &state.exit_error {
            return first.clone();
        }
        warn!(status = error.status(), error = %error, "graphql multipart request failed");

        if let Some(buffer) = state.current.take() {
            buffer.destroy(Some(error.clone()));
        }
        if let Some(uploads) = &state.uploads {
            let rejected = uploads.reject_pending(&error);
            debug!(rejected, "rejected pending uploads");
        }
        state.exit_error = Some(error.clone());
        self.aborted.send_replace(true);
        error
    }

    fn disconnect(&self) -> bool {
        let mut state = self.state.lock();
        if state.body_ended {
            return false;
        }
        self.closed.send_replace(true);
        if state.exit_error.is_some() {
            return false;
        }
        self.exit_locked(&mut state, UploadError::Disconnect);
        true
    }

    fn exit_error(&self) -> Option<UploadError> {
        self.state.lock().exit_error.clone()
    }

    fn body_ended(&self) -> bool {
        self.state.lock().body_ended
    }

    fn install_uploads(&self, uploads: UploadMap) -> Result<(), UploadError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.exit_error {
            uploads.reject_pending(err);
            return Err(err.clone());
        }
        state.uploads = Some(uploads);
        Ok(())
    }

    /// Resolve the pending upload named by `headers` with a fresh buffer.
    ///
    /// Returns `None` for extraneous parts, which must be discarded.
    fn begin_file(&self, headers: &PartHeaders) -> Option<Arc<SpillBuffer>> {
        let mut state = self.state.lock();
        if state.exit_error.is_some() {
            return None;
        }
        let upload = state.uploads.as_ref()?.pending(&headers.name)?.clone();
        if self.released.load(Ordering::Acquire) {
            upload.reject(UploadError::Released);
            return None;
        }

        let buffer = Arc::new(SpillBuffer::from_config(&self.config));
        let file = FileUpload::new(
            headers.name.clone(),
            headers.filename.clone().unwrap_or_default(),
            header_token(headers.content_type.as_deref(), DEFAULT_MIMETYPE),
            header_token(headers.transfer_encoding.as_deref(), DEFAULT_ENCODING),
            Arc::clone(&buffer),
        );
        upload.resolve(file);
        state.current = Some(Arc::clone(&buffer));
        Some(buffer)
    }

    fn finish_file(&self) {
        self.state.lock().current = None;
    }

    /// Record the end of the body; returns how many uploads never got a part.
    fn end_body(&self) -> usize {
        let mut state = self.state.lock();
        state.body_ended = true;
        state.current = None;
        if state.exit_error.is_some() {
            return 0;
        }
        state
            .uploads
            .as_ref()
            .map_or(0, |uploads| uploads.reject_pending(&UploadError::FileMissing))
    }

    fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let state = self.state.lock();
        let destroyed = state.uploads.as_ref().map_or(0, UploadMap::release_buffers);
        debug!(destroyed, "released upload buffers");
        destroyed
    }
}

/// Lowercased `type/subtype` (or encoding token) without parameters.
fn header_token(value: Option<&str>, default: &str) -> String {
    let token = value
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    if token.is_empty() {
        default.to_string()
    } else {
        token.to_ascii_lowercase()
    }
}

fn parse_operations(raw: &[u8]) -> Result<Value, UploadError> {
    let parsed: serde_json::Value = serde_json::from_slice(raw).map_err(|_| {
        UploadError::InvalidJson {
            field: "operations",
        }
    })?;
    match parsed {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => Ok(Value::from(parsed)),
        _ => Err(UploadError::InvalidFieldType {
            field: "operations",
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ExpectOperations,
    ExpectMap,
    ExpectFiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentField {
    Operations,
    Map,
}

impl DocumentField {
    fn name(self) -> &'static str {
        match self {
            Self::Operations => "operations",
            Self::Map => "map",
        }
    }
}

#[derive(Debug)]
enum CurrentPart {
    Idle,
    Field {
        field: DocumentField,
        bytes: Vec<u8>,
    },
    File {
        buffer: Arc<SpillBuffer>,
        received: u64,
    },
    Discard,
}

impl CurrentPart {
    fn field(field: DocumentField) -> Self {
        Self::Field {
            field,
            bytes: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct ParseSession<S> {
    shared: Arc<Shared>,
    parts: PartStream<S>,
    aborted: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
    phase: Phase,
    part: CurrentPart,
    file_count: usize,
}

impl<S> ParseSession<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    fn new(shared: Arc<Shared>, parts: PartStream<S>) -> Self {
        let aborted = shared.aborted.subscribe();
        let closed = shared.closed.subscribe();
        Self {
            shared,
            parts,
            aborted,
            closed,
            phase: Phase::ExpectOperations,
            part: CurrentPart::Idle,
            file_count: 0,
        }
    }

    /// Next demultiplexer event, or the session's exit error once aborted.
    async fn next_event(&mut self) -> Result<MultipartEvent, UploadError> {
        if let Some(err) = self.shared.exit_error() {
            return Err(err);
        }

        let outcome = {
            let aborted = pin!(self.aborted.wait_for(|aborted| *aborted));
            let next = pin!(self.parts.next_event());
            match select(aborted, next).await {
                Either::Left(_) => None,
                Either::Right((result, _)) => Some(result),
            }
        };

        match outcome {
            Some(result) => result.map_err(UploadError::from),
            None => Err(self.shared.exit_error().unwrap_or(UploadError::Disconnect)),
        }
    }

    /// Read and discard the rest of the body, stopping early if the
    /// connection closes.
    async fn discard_body(&mut self) {
        if self.parts.body_ended() || self.shared.body_ended() {
            return;
        }

        let drained = {
            let closed = pin!(self.closed.wait_for(|closed| *closed));
            let drain = pin!(self.parts.drain());
            matches!(select(closed, drain).await, Either::Right(_))
        };

        if drained {
            self.shared.end_body();
            trace!("discarded remaining request body");
        } else {
            debug!("connection closed while discarding request body");
        }
    }

    async fn read_document(&mut self) -> Result<Value, UploadError> {
        let mut operations: Option<Value> = None;

        loop {
            match self.next_event().await? {
                MultipartEvent::PartStart(headers) => self.start_document_part(&headers)?,
                MultipartEvent::PartData(chunk) => self.push_field_data(&chunk)?,
                MultipartEvent::PartEnd => {
                    match std::mem::replace(&mut self.part, CurrentPart::Idle) {
                        CurrentPart::Field {
                            field: DocumentField::Operations,
                            bytes,
                        } => {
                            operations = Some(parse_operations(&bytes)?);
                            self.phase = Phase::ExpectMap;
                            debug!(size = bytes.len(), "parsed operations field");
                        }
                        CurrentPart::Field {
                            field: DocumentField::Map,
                            bytes,
                        } => {
                            let mut document =
                                operations.take().ok_or(UploadError::MapBeforeOperations)?;
                            let uploads = UploadMap::build(
                                &mut document,
                                &bytes,
                                self.shared.config.get_max_files(),
                            )?;
                            debug!(uploads = uploads.len(), size = bytes.len(), "parsed map field");
                            self.shared.install_uploads(uploads)?;
                            self.phase = Phase::ExpectFiles;
                            return Ok(document);
                        }
                        _ => {}
                    }
                }
                MultipartEvent::Finished => {
                    self.shared.end_body();
                    let field = match self.phase {
                        Phase::ExpectOperations => DocumentField::Operations,
                        Phase::ExpectMap | Phase::ExpectFiles => DocumentField::Map,
                    };
                    return Err(UploadError::MissingField {
                        field: field.name(),
                    });
                }
            }
        }
    }

    fn start_document_part(&mut self, headers: &PartHeaders) -> Result<(), UploadError> {
        if headers.is_file() {
            return Err(UploadError::FilesBeforeMap);
        }

        self.part = match (self.phase, headers.name.as_str()) {
            (Phase::ExpectOperations, "operations") => CurrentPart::field(DocumentField::Operations),
            (Phase::ExpectOperations, "map") => return Err(UploadError::MapBeforeOperations),
            (Phase::ExpectOperations, name) => {
                return Err(UploadError::UnexpectedField {
                    name: name.to_string(),
                });
            }
            (_, "map") => CurrentPart::field(DocumentField::Map),
            (_, name) => {
                trace!(field = name, "ignoring multipart field");
                CurrentPart::Discard
            }
        };
        Ok(())
    }

    fn push_field_data(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        if let CurrentPart::Field { field, bytes } = &mut self.part {
            let max = self.shared.config.get_max_field_size();
            if bytes.len().saturating_add(chunk.len()) > max {
                return Err(UploadError::MaxFieldSize {
                    field: field.name(),
                    max,
                });
            }
            bytes.extend_from_slice(chunk);
        }
        Ok(())
    }

    async fn pipe_files(&mut self) -> Result<(), UploadError> {
        loop {
            match self.next_event().await? {
                MultipartEvent::PartStart(headers) => self.start_file_part(&headers)?,
                MultipartEvent::PartData(chunk) => self.push_file_data(&chunk),
                MultipartEvent::PartEnd => self.finish_file_part(),
                MultipartEvent::Finished => {
                    let missing = self.shared.end_body();
                    debug!(files = self.file_count, missing, "request body finished");
                    return Ok(());
                }
            }
        }
    }

    fn start_file_part(&mut self, headers: &PartHeaders) -> Result<(), UploadError> {
        self.part = CurrentPart::Discard;
        if headers.is_field() {
            trace!(field = %headers.name, "ignoring multipart field");
            return Ok(());
        }

        self.file_count += 1;
        if let Some(max) = self.shared.config.get_max_files() {
            if self.file_count > max {
                return Err(UploadError::MaxFiles { max });
            }
        }

        match self.shared.begin_file(headers) {
            Some(buffer) => {
                debug!(
                    field_id = %headers.name,
                    filename = headers.filename.as_deref().unwrap_or_default(),
                    "upload resolved"
                );
                self.part = CurrentPart::File {
                    buffer,
                    received: 0,
                };
            }
            None => trace!(field_id = %headers.name, "discarding extraneous file"),
        }
        Ok(())
    }

    fn push_file_data(&mut self, chunk: &[u8]) {
        let CurrentPart::File { buffer, received } = &mut self.part else {
            return;
        };
        *received = received.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));

        let failure = match self.shared.config.get_max_file_size() {
            Some(max) if *received > max => {
                let err = UploadError::MaxFileSize { max };
                buffer.destroy(Some(err.clone()));
                Some(err)
            }
            _ => buffer.write(chunk).err(),
        };

        if let Some(err) = failure {
            debug!(error = %err, "stopped buffering file");
            self.shared.finish_file();
            self.part = CurrentPart::Discard;
        }
    }

    fn finish_file_part(&mut self) {
        if let CurrentPart::File { buffer, received } =
            std::mem::replace(&mut self.part, CurrentPart::Idle)
        {
            buffer.finish();
            self.shared.finish_file();
            debug!(size = received, "file received");
        }
    }
}

impl<S> Drop for ParseSession<S> {
    fn drop(&mut self) {
        if self.shared.disconnect() {
            debug!("parse session dropped before the request body ended");
        }
    }
}

/// Entry point for processing one GraphQL multipart request.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use futures_util::stream;
/// use graphql_upload_core::{UploadConfig, UploadSession};
///
/// let body = concat!(
///     "--b\r\n",
///     "Content-Disposition: form-data; name=\"operations\"\r\n\r\n",
///     "{\"variables\":{\"file\":null}}\r\n",
///     "--b\r\n",
///     "Content-Disposition: form-data; name=\"map\"\r\n\r\n",
///     "{\"1\":[\"variables.file\"]}\r\n",
///     "--b\r\n",
///     "Content-Disposition: form-data; name=\"1\"; filename=\"a.txt\"\r\n\r\n",
///     "a\r\n",
///     "--b--\r\n",
/// );
/// let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(body.as_bytes()))];
///
/// futures_executor::block_on(async {
///     let session = UploadSession::new(UploadConfig::default());
///     let cleanup = session.cleanup_handle();
///     let request = session
///         .process("multipart/form-data; boundary=b", stream::iter(chunks))
///         .await
///         .unwrap();
///     let upload = request.operations["variables"]["file"].as_upload().unwrap().clone();
///     request.driver.run().await.unwrap();
///
///     let file = upload.file().await.unwrap();
///     assert_eq!(file.filename, "a.txt");
///     let bytes = file.create_read_stream().unwrap().read_to_end().await.unwrap();
///     assert_eq!(bytes, b"a");
///     assert_eq!(cleanup.release(), 1);
/// });
/// ```
#[derive(Debug)]
pub struct UploadSession {
    shared: Arc<Shared>,
}

impl UploadSession {
    /// Create a session for one request.
    #[must_use]
    pub fn new(config: UploadConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    /// The configuration this session enforces.
    #[must_use]
    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    /// Handle to signal that the connection closed early.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Handle to release file buffers once the response has completed.
    #[must_use]
    pub fn cleanup_handle(&self) -> CleanupHandle {
        CleanupHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Read the request up to and including `map`.
    ///
    /// Resolves with the operations document as soon as `map` is validated;
    /// file parts are read by the returned [`UploadDriver`]. On failure the
    /// rest of the body is read and discarded before the error is returned,
    /// unless the connection closes first.
    pub async fn process<S>(
        self,
        content_type: &str,
        body: S,
    ) -> Result<ProcessedRequest<S>, UploadError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let parts = match PartStream::from_content_type(body, content_type) {
            Ok(parts) => parts,
            Err(err) => return Err(self.shared.exit(UploadError::Multipart(err))),
        };

        let mut session = ParseSession::new(self.shared, parts);
        match session.read_document().await {
            Ok(operations) => Ok(ProcessedRequest {
                operations,
                driver: UploadDriver { session },
            }),
            Err(err) => {
                let first = session.shared.exit(err);
                if first != UploadError::Disconnect {
                    session.discard_body().await;
                }
                Err(first)
            }
        }
    }
}

impl Default for UploadSession {
    fn default() -> Self {
        Self::new(UploadConfig::default())
    }
}

/// The operations document plus the driver that feeds its uploads.
#[derive(Debug)]
pub struct ProcessedRequest<S> {
    /// Operations with every mapped location holding an [`Upload`](crate::Upload).
    pub operations: Value,
    /// Must be run to completion for uploads to settle.
    pub driver: UploadDriver<S>,
}

impl<S> ProcessedRequest<S> {
    pub fn into_parts(self) -> (Value, UploadDriver<S>) {
        (self.operations, self.driver)
    }
}

/// Streams the file parts that follow `map` into their uploads.
///
/// Dropping the driver before the body ends rejects every pending upload with
/// [`UploadError::Disconnect`].
#[derive(Debug)]
pub struct UploadDriver<S> {
    session: ParseSession<S>,
}

impl<S> UploadDriver<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Read the rest of the body.
    ///
    /// Returns the session's fatal error, if any. Errors scoped to a single
    /// file only reach that file's upload. After a fatal error other than a
    /// disconnect the remaining body is read and discarded until it ends or
    /// [`AbortHandle::disconnect`] is called.
    pub async fn run(mut self) -> Result<(), UploadError> {
        let Err(err) = self.session.pipe_files().await else {
            return Ok(());
        };

        let first = self.session.shared.exit(err);
        if first != UploadError::Disconnect {
            self.session.discard_body().await;
        }
        Err(first)
    }

    /// Number of file parts seen so far, extraneous ones included.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.session.file_count
    }
}

/// Signals an early connection close.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    /// Abort the session unless the body has already ended.
    ///
    /// Also stops a driver that is discarding the body after a fatal error.
    /// Returns true if this call aborted the session.
    pub fn disconnect(&self) -> bool {
        self.shared.disconnect()
    }

    /// The error that terminated the session, if any.
    #[must_use]
    pub fn error(&self) -> Option<UploadError> {
        self.shared.exit_error()
    }
}

/// Releases file buffers after the response completes.
#[derive(Debug, Clone)]
pub struct CleanupHandle {
    shared: Arc<Shared>,
}

impl CleanupHandle {
    /// Destroy every resolved upload's buffer.
    ///
    /// Only the first call does any work; it returns the number of buffers
    /// destroyed, later calls return 0.
    pub fn release(&self) -> usize {
        self.shared.release()
    }

    /// Wait for `signal` (typically response completion), then release.
    pub async fn release_after<F: Future>(&self, signal: F) -> usize {
        signal.await;
        self.release()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }
}
