//! Deferred uploads and the file metadata they settle to.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::UploadError;
use crate::spill::{SpillBuffer, SpillReader};

/// A file received in the request body.
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// The multipart part name this file arrived under.
    pub field_id: String,
    /// Client-supplied file name.
    pub filename: String,
    /// Declared content type, `text/plain` when absent.
    pub mimetype: String,
    /// Declared transfer encoding, `7bit` when absent.
    pub encoding: String,
    buffer: Arc<SpillBuffer>,
}

impl FileUpload {
    pub(crate) fn new(
        field_id: String,
        filename: String,
        mimetype: String,
        encoding: String,
        buffer: Arc<SpillBuffer>,
    ) -> Self {
        Self {
            field_id,
            filename,
            mimetype,
            encoding,
            buffer,
        }
    }

    /// Open an independent stream over the file content.
    ///
    /// Each call starts from the first byte. Streams opened before the body has
    /// been fully received wait for more bytes. Fails once the buffer has been
    /// released or has failed.
    pub fn create_read_stream(&self) -> Result<SpillReader, UploadError> {
        self.buffer.reader()
    }

    /// Bytes received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.buffer.len()
    }

    /// Returns true once the whole file has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.buffer.is_finished()
    }

    /// Path of the temporary file holding the content, once spooled to disk.
    #[must_use]
    pub fn spooled_path(&self) -> Option<std::path::PathBuf> {
        self.buffer.spooled_path()
    }

    pub(crate) fn buffer(&self) -> &Arc<SpillBuffer> {
        &self.buffer
    }
}

/// Settlement state of an [`Upload`].
#[derive(Debug, Clone)]
pub enum UploadState {
    Pending,
    Resolved(FileUpload),
    Rejected(UploadError),
}

impl UploadState {
    /// Returns true while the upload has not settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

struct UploadInner {
    field_id: String,
    state: watch::Sender<UploadState>,
}

/// A placeholder for a file that arrives later in the request body.
///
/// Every location the `map` field points at for the same key holds a clone of
/// the same `Upload`. It settles exactly once; later attempts are ignored.
#[derive(Clone)]
pub struct Upload {
    inner: Arc<UploadInner>,
}

impl Upload {
    pub(crate) fn new(field_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(UploadState::Pending);
        Self {
            inner: Arc::new(UploadInner {
                field_id: field_id.into(),
                state,
            }),
        }
    }

    /// The `map` key this upload was declared under.
    #[must_use]
    pub fn field_id(&self) -> &str {
        &self.inner.field_id
    }

    /// Returns true if both handles refer to the same upload.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> UploadState {
        self.inner.state.borrow().clone()
    }

    /// Returns true while the upload has not settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.borrow().is_pending()
    }

    /// The settled outcome, or `None` while pending.
    #[must_use]
    pub fn try_file(&self) -> Option<Result<FileUpload, UploadError>> {
        match &*self.inner.state.borrow() {
            UploadState::Pending => None,
            UploadState::Resolved(file) => Some(Ok(file.clone())),
            UploadState::Rejected(err) => Some(Err(err.clone())),
        }
    }

    /// Wait until the upload settles.
    pub async fn file(&self) -> Result<FileUpload, UploadError> {
        let mut rx = self.inner.state.subscribe();
        let settled = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so the channel cannot close while we wait.
            Err(_) => UploadState::Rejected(UploadError::Disconnect),
        };
        match settled {
            UploadState::Resolved(file) => Ok(file),
            UploadState::Rejected(err) => Err(err),
            UploadState::Pending => Err(UploadError::Disconnect),
        }
    }

    pub(crate) fn resolve(&self, file: FileUpload) -> bool {
        self.settle(UploadState::Resolved(file))
    }

    pub(crate) fn reject(&self, error: UploadError) -> bool {
        self.settle(UploadState::Rejected(error))
    }

    fn settle(&self, next: UploadState) -> bool {
        self.inner.state.send_if_modified(move |state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl PartialEq for Upload {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.borrow() {
            UploadState::Pending => "pending",
            UploadState::Resolved(_) => "resolved",
            UploadState::Rejected(_) => "rejected",
        };
        f.debug_struct("Upload")
            .field("field_id", &self.inner.field_id)
            .field("state", &state)
            .finish()
    }
}
