//! Core engine for GraphQL multipart requests.
//!
//! This crate turns a `multipart/form-data` body laid out as `operations`,
//! `map`, then files into:
//! - the operations document as a [`Value`] tree, with every mapped location
//!   holding a deferred [`Upload`]
//! - an [`UploadDriver`] that streams the file parts into re-readable
//!   [`SpillBuffer`]s and settles each upload
//!
//! # Design Principles
//!
//! - The document is available before any file bytes are read
//! - Memory per file is bounded; large files spill to a temporary file
//! - Any number of independent readers per file
//! - One abort transition fans out to every pending upload and open reader
//! - Runtime-agnostic: only `tokio::sync` primitives, no executor required
//!
//! # Lifecycle
//!
//! ```text
//! UploadSession::new(config)
//!   ├── abort_handle()    -> AbortHandle::disconnect()    on connection close
//!   ├── cleanup_handle()  -> CleanupHandle::release()     on response completion
//!   └── process(content_type, body)
//!         └── ProcessedRequest { operations, driver }
//!               └── driver.run()   (concurrently with the GraphQL execution)
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod multipart;
pub mod path;
mod session;
pub mod spill;
mod upload;
mod upload_map;
mod value;

pub use config::{
    DEFAULT_MAX_FIELD_SIZE, DEFAULT_READ_CHUNK_SIZE, DEFAULT_SPOOL_THRESHOLD, UploadConfig,
};
pub use error::{MapEntryError, SPEC_URL, STATUS_CLIENT_CLOSED_REQUEST, UploadError};
pub use multipart::{MultipartError, MultipartEvent, PartHeaders, PartStream};
pub use path::PathError;
pub use session::{AbortHandle, CleanupHandle, ProcessedRequest, UploadDriver, UploadSession};
pub use spill::{SpillBuffer, SpillReader};
pub use upload::{FileUpload, Upload, UploadState};
pub use upload_map::UploadMap;
pub use value::Value;
