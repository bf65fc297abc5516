//! Re-readable file buffers that spill from memory to a temporary file.
//!
//! A [`SpillBuffer`] has a single writer (the parse session piping a file part
//! into it) and any number of [`SpillReader`]s. Readers keep their own cursor,
//! can start before the writer finishes, and wait for more bytes when they
//! catch up with the writer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::UploadConfig;
use crate::error::UploadError;

#[derive(Debug)]
enum SpillStorage {
    InMemory(Vec<u8>),
    SpooledTempFile { path: PathBuf, file: File },
    Released,
}

#[derive(Debug)]
struct SpillState {
    storage: SpillStorage,
    len: u64,
    finished: bool,
    destroyed: bool,
    error: Option<UploadError>,
}

impl SpillState {
    fn failure(&self) -> Option<UploadError> {
        match &self.error {
            Some(err) => Some(err.clone()),
            None if self.destroyed => Some(UploadError::Released),
            None => None,
        }
    }

    fn release_storage(&mut self) {
        let storage = std::mem::replace(&mut self.storage, SpillStorage::Released);
        if let SpillStorage::SpooledTempFile { path, file } = storage {
            drop(file);
            let _ = std::fs::remove_file(path);
        }
    }
}

enum ReadOutcome {
    Data(Bytes),
    Pending,
    End,
    Failed(UploadError),
}

/// A byte buffer held in memory up to a threshold, then in a temporary file.
#[derive(Debug)]
pub struct SpillBuffer {
    state: Mutex<SpillState>,
    progress: watch::Sender<u64>,
    spool_threshold: usize,
    spool_dir: PathBuf,
    read_chunk_size: usize,
}

impl SpillBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new(spool_threshold: usize, spool_dir: impl Into<PathBuf>, read_chunk_size: usize) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            state: Mutex::new(SpillState {
                storage: SpillStorage::InMemory(Vec::new()),
                len: 0,
                finished: false,
                destroyed: false,
                error: None,
            }),
            progress,
            spool_threshold,
            spool_dir: spool_dir.into(),
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    /// Create an empty buffer using the thresholds from an [`UploadConfig`].
    #[must_use]
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.get_spool_threshold(),
            config.spool_location(),
            config.get_read_chunk_size(),
        )
    }

    /// Append bytes, spooling to disk once the threshold is crossed.
    ///
    /// Fails with the stored error once the buffer has failed or been destroyed.
    /// An I/O failure destroys the buffer.
    pub fn write(&self, chunk: &[u8]) -> Result<(), UploadError> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if let Some(err) = state.failure() {
            return Err(err);
        }

        let result = match &mut state.storage {
            SpillStorage::InMemory(data) => {
                if data.len().saturating_add(chunk.len()) > self.spool_threshold {
                    spool_to_tempfile(&self.spool_dir, data, chunk)
                        .map(|(path, file)| Some(SpillStorage::SpooledTempFile { path, file }))
                } else {
                    data.extend_from_slice(chunk);
                    Ok(None)
                }
            }
            SpillStorage::SpooledTempFile { file, .. } => file.write_all(chunk).map(|()| None),
            SpillStorage::Released => Err(std::io::Error::other("buffer storage released")),
        };

        match result {
            Ok(Some(storage)) => state.storage = storage,
            Ok(None) => {}
            Err(err) => {
                let error = UploadError::Io {
                    detail: err.to_string(),
                };
                state.error = Some(error.clone());
                state.destroyed = true;
                state.release_storage();
                drop(state);
                self.notify();
                return Err(error);
            }
        }

        state.len = state
            .len
            .saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        drop(state);
        self.notify();
        Ok(())
    }

    /// Mark the content complete; readers see end-of-stream after the last byte.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.notify();
    }

    /// Destroy the buffer, freeing memory and removing any temporary file.
    ///
    /// `error` becomes the error every reader observes; without one readers see
    /// [`UploadError::Released`]. An error stored earlier is kept. Returns false
    /// when the buffer was already destroyed.
    pub fn destroy(&self, error: Option<UploadError>) -> bool {
        let mut state = self.state.lock();
        if state.destroyed {
            return false;
        }
        state.destroyed = true;
        if state.error.is_none() {
            state.error = error;
        }
        state.release_storage();
        drop(state);
        self.notify();
        true
    }

    /// Create an independent reader positioned at the start of the content.
    pub fn reader(self: &Arc<Self>) -> Result<SpillReader, UploadError> {
        if let Some(err) = self.state.lock().failure() {
            return Err(err);
        }
        Ok(SpillReader {
            buffer: Arc::clone(self),
            progress: self.progress.subscribe(),
            position: 0,
            done: false,
        })
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the writer has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Returns true once the buffer has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// The error readers observe, if the buffer has failed or been destroyed.
    #[must_use]
    pub fn error(&self) -> Option<UploadError> {
        self.state.lock().failure()
    }

    /// Path to the spooled temporary file, if this buffer is backed by disk.
    #[must_use]
    pub fn spooled_path(&self) -> Option<PathBuf> {
        match &self.state.lock().storage {
            SpillStorage::SpooledTempFile { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Returns true when the content lives in a temporary file.
    #[must_use]
    pub fn is_spooled(&self) -> bool {
        self.spooled_path().is_some()
    }

    fn read_at(&self, position: u64, max: usize) -> ReadOutcome {
        let state = self.state.lock();
        if let Some(err) = state.failure() {
            return ReadOutcome::Failed(err);
        }
        if position >= state.len {
            return if state.finished {
                ReadOutcome::End
            } else {
                ReadOutcome::Pending
            };
        }

        let available = state.len - position;
        let len = usize::try_from(available.min(u64::try_from(max).unwrap_or(u64::MAX)))
            .unwrap_or(max);
        match &state.storage {
            SpillStorage::InMemory(data) => {
                let start = usize::try_from(position).unwrap_or(usize::MAX);
                match data.get(start..start.saturating_add(len)) {
                    Some(slice) => ReadOutcome::Data(Bytes::copy_from_slice(slice)),
                    None => ReadOutcome::Failed(UploadError::Io {
                        detail: "read past buffered content".to_string(),
                    }),
                }
            }
            SpillStorage::SpooledTempFile { path, .. } => match read_file_range(path, position, len) {
                Ok(bytes) => ReadOutcome::Data(bytes),
                Err(err) => ReadOutcome::Failed(UploadError::Io {
                    detail: err.to_string(),
                }),
            },
            SpillStorage::Released => ReadOutcome::Failed(UploadError::Released),
        }
    }

    fn notify(&self) {
        self.progress
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl Drop for SpillBuffer {
    fn drop(&mut self) {
        self.state.get_mut().release_storage();
    }
}

/// An independent cursor over a [`SpillBuffer`].
#[derive(Debug)]
pub struct SpillReader {
    buffer: Arc<SpillBuffer>,
    progress: watch::Receiver<u64>,
    position: u64,
    done: bool,
}

impl SpillReader {
    /// Await the next chunk.
    ///
    /// Returns `None` at end of content. After an error is returned the reader
    /// is exhausted.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, UploadError>> {
        if self.done {
            return None;
        }

        loop {
            // Mark the current generation seen before inspecting the buffer so a
            // write racing with this check still wakes `changed()`.
            self.progress.borrow_and_update();
            match self.buffer.read_at(self.position, self.buffer.read_chunk_size) {
                ReadOutcome::Data(bytes) => {
                    self.position = self
                        .position
                        .saturating_add(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
                    return Some(Ok(bytes));
                }
                ReadOutcome::End => {
                    self.done = true;
                    return None;
                }
                ReadOutcome::Failed(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
                ReadOutcome::Pending => {}
            }

            if self.progress.changed().await.is_err() {
                self.done = true;
                return Some(Err(UploadError::Released));
            }
        }
    }

    /// Read everything that remains.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, UploadError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Bytes consumed by this reader so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Convert into a `Stream` of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, UploadError>> + Send {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }
}

fn read_file_range(path: &Path, position: u64, len: usize) -> std::io::Result<Bytes> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(position))?;
    let mut out = vec![0u8; len];
    file.read_exact(&mut out)?;
    Ok(Bytes::from(out))
}

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(1);

fn create_spool_tempfile(dir: &Path) -> std::io::Result<(PathBuf, File)> {
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    for _ in 0..32 {
        let counter = SPOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = dir.join(format!(
            "graphql-upload-{}-{ts_nanos}-{counter}.tmp",
            std::process::id()
        ));

        match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "failed to allocate unique spool file",
    ))
}

fn spool_to_tempfile(
    dir: &Path,
    buffered: &mut Vec<u8>,
    chunk: &[u8],
) -> std::io::Result<(PathBuf, File)> {
    let (path, mut file) = create_spool_tempfile(dir)?;
    let written = file.write_all(buffered).and_then(|()| file.write_all(chunk));
    if let Err(err) = written {
        drop(file);
        let _ = std::fs::remove_file(&path);
        return Err(err);
    }
    *buffered = Vec::new();
    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn memory_buffer() -> Arc<SpillBuffer> {
        Arc::new(SpillBuffer::new(1024, std::env::temp_dir(), 4))
    }

    #[test]
    fn test_in_memory_readers_are_independent() {
        let buffer = memory_buffer();
        buffer.write(b"hello world").unwrap();
        buffer.finish();
        assert!(!buffer.is_spooled());

        let mut first = buffer.reader().unwrap();
        let mut second = buffer.reader().unwrap();
        futures_executor::block_on(async {
            let chunk = first.next_chunk().await.unwrap().unwrap();
            assert_eq!(&chunk[..], b"hell");
            assert_eq!(second.read_to_end().await.unwrap(), b"hello world".to_vec());
            assert_eq!(first.read_to_end().await.unwrap(), b"o world".to_vec());
            assert!(first.next_chunk().await.is_none());
        });
    }

    #[test]
    fn test_spools_to_disk_past_threshold() {
        let buffer = Arc::new(SpillBuffer::new(8, std::env::temp_dir(), 64));
        buffer.write(b"12345").unwrap();
        assert!(!buffer.is_spooled());
        buffer.write(b"67890").unwrap();
        buffer.write(b"abc").unwrap();
        buffer.finish();

        let path = buffer.spooled_path().expect("spooled path");
        assert!(path.exists());
        assert_eq!(buffer.len(), 13);

        let mut reader = buffer.reader().unwrap();
        let content = futures_executor::block_on(reader.read_to_end()).unwrap();
        assert_eq!(content, b"1234567890abc".to_vec());

        assert!(buffer.destroy(None));
        assert!(!path.exists(), "destroy should remove the spool file");
    }

    #[test]
    fn test_spool_file_naming() {
        let dir = std::env::temp_dir();
        let buffer = SpillBuffer::new(0, &dir, 64);
        buffer.write(b"x").unwrap();
        let path = buffer.spooled_path().expect("spooled path");
        assert_eq!(path.parent(), Some(dir.as_path()));

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let pattern = regex::Regex::new(r"^graphql-upload-\d+-\d+-\d+\.tmp$").unwrap();
        assert!(pattern.is_match(&name), "unexpected spool file name {name}");
    }

    #[test]
    fn test_drop_removes_spool_file() {
        let buffer = SpillBuffer::new(0, std::env::temp_dir(), 64);
        buffer.write(b"data").unwrap();
        let path = buffer.spooled_path().expect("spooled path");
        assert!(path.exists());
        drop(buffer);
        assert!(!path.exists());
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let buffer = memory_buffer();
        let mut reader = buffer.reader().unwrap();

        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                buffer.write(b"ab").unwrap();
                std::thread::sleep(Duration::from_millis(20));
                buffer.write(b"cd").unwrap();
                std::thread::sleep(Duration::from_millis(20));
                buffer.finish();
            })
        };

        let content = futures_executor::block_on(reader.read_to_end()).unwrap();
        writer.join().unwrap();
        assert_eq!(content, b"abcd".to_vec());
    }

    #[test]
    fn test_destroy_with_error_reaches_open_readers() {
        let buffer = memory_buffer();
        buffer.write(b"partial").unwrap();
        let mut reader = buffer.reader().unwrap();

        assert!(buffer.destroy(Some(UploadError::Disconnect)));
        let result = futures_executor::block_on(reader.read_to_end());
        assert_eq!(result, Err(UploadError::Disconnect));
        assert_eq!(buffer.reader().err(), Some(UploadError::Disconnect));
        assert_eq!(buffer.write(b"more"), Err(UploadError::Disconnect));
    }

    #[test]
    fn test_destroy_without_error_reports_released() {
        let buffer = memory_buffer();
        buffer.write(b"done").unwrap();
        buffer.finish();

        assert!(buffer.destroy(None));
        assert!(!buffer.destroy(Some(UploadError::Disconnect)));
        assert_eq!(buffer.error(), Some(UploadError::Released));
        assert_eq!(buffer.reader().err(), Some(UploadError::Released));
    }

    #[test]
    fn test_into_stream_yields_all_chunks() {
        let buffer = memory_buffer();
        buffer.write(b"0123456789").unwrap();
        buffer.finish();

        let chunks: Vec<_> = futures_executor::block_on(
            buffer.reader().unwrap().into_stream().collect::<Vec<_>>(),
        );
        assert_eq!(chunks.len(), 3);
        let joined: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(joined, b"0123456789".to_vec());
    }
}
