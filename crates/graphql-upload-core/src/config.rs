//! Limits and buffering settings for a parse session.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default maximum size of the `operations` and `map` fields (1,000,000 bytes).
pub const DEFAULT_MAX_FIELD_SIZE: usize = 1_000_000;

/// Default threshold for spilling a file buffer to a temporary file (1MB).
pub const DEFAULT_SPOOL_THRESHOLD: usize = 1024 * 1024;

/// Default maximum chunk handed out by a single reader call (64KB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration for processing a GraphQL multipart request.
///
/// File size and file count are unbounded unless configured.
///
/// # Example
///
/// ```
/// use graphql_upload_core::UploadConfig;
///
/// let config = UploadConfig::new().max_file_size(10_000_000).max_files(10);
/// assert_eq!(config.get_max_files(), Some(10));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum size of a non-file field in bytes.
    max_field_size: usize,
    /// Maximum size per file in bytes.
    max_file_size: Option<u64>,
    /// Maximum number of file parts.
    max_files: Option<usize>,
    /// Buffered bytes per file above which the buffer moves to disk.
    spool_threshold: usize,
    /// Directory for spilled buffers; the system temp dir when unset.
    spool_dir: Option<PathBuf>,
    /// Upper bound on the chunk size yielded by readers.
    read_chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_field_size: DEFAULT_MAX_FIELD_SIZE,
            max_file_size: None,
            max_files: None,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            spool_dir: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl UploadConfig {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum size of the `operations` and `map` fields.
    #[must_use]
    pub fn max_field_size(mut self, size: usize) -> Self {
        self.max_field_size = size;
        self
    }

    /// Set the maximum file size.
    #[must_use]
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = Some(size);
        self
    }

    /// Set the maximum number of files.
    #[must_use]
    pub fn max_files(mut self, count: usize) -> Self {
        self.max_files = Some(count);
        self
    }

    /// Set the threshold above which file buffers are spooled to disk.
    #[must_use]
    pub fn spool_threshold(mut self, size: usize) -> Self {
        self.spool_threshold = size;
        self
    }

    /// Set the directory used for spooled file buffers.
    #[must_use]
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Set the maximum chunk size yielded by file readers.
    #[must_use]
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Get the maximum field size.
    #[must_use]
    pub fn get_max_field_size(&self) -> usize {
        self.max_field_size
    }

    /// Get the maximum file size, if bounded.
    #[must_use]
    pub fn get_max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// Get the maximum number of files, if bounded.
    #[must_use]
    pub fn get_max_files(&self) -> Option<usize> {
        self.max_files
    }

    /// Get the spool-to-disk threshold.
    #[must_use]
    pub fn get_spool_threshold(&self) -> usize {
        self.spool_threshold
    }

    /// Get the spool directory override.
    #[must_use]
    pub fn get_spool_dir(&self) -> Option<&Path> {
        self.spool_dir.as_deref()
    }

    /// Get the reader chunk size.
    #[must_use]
    pub fn get_read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    /// Directory where spooled buffers are created.
    pub(crate) fn spool_location(&self) -> PathBuf {
        self.spool_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
