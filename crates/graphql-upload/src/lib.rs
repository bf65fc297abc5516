//! GraphQL multipart request uploads.
//!
//! graphql-upload reads requests laid out per the GraphQL multipart request
//! convention and hands back the operations document with every file slot
//! holding a deferred [`Upload`]:
//!
//! - **Document first**: the operations resolve once `map` is parsed, before
//!   any file bytes arrive
//! - **Re-readable files**: each resolved file can open any number of
//!   independent streams
//! - **Bounded memory**: large files spill to temporary files
//! - **Explicit lifecycle**: abort on connection close, release on response
//!   completion
//!
//! # Quick Start
//!
//! ```ignore
//! use graphql_upload::prelude::*;
//!
//! async fn handle(content_type: &str, body: impl Stream<Item = std::io::Result<Bytes>> + Unpin) {
//!     let request = match process_request(UploadConfig::default(), content_type, body).await {
//!         Ok(request) => request,
//!         Err(err) => return respond(err.status(), error_body(&err)),
//!     };
//!     let GraphqlRequest { operations, driver, abort, cleanup } = request;
//!
//!     // Run the driver alongside execution; call `abort.disconnect()` if the
//!     // connection drops and `cleanup.release()` once the response is sent.
//!     let (_, response) = futures_util::join!(driver.run(), execute(operations));
//!     send(response).await;
//!     cleanup.release();
//! }
//! ```
//!
//! # Crate Structure
//!
//! - [`graphql_upload_core`]: session, demultiplexer, spill buffer, value tree

#![forbid(unsafe_code)]

use std::io;

use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;

pub use graphql_upload_core as core;

pub use graphql_upload_core::{
    AbortHandle, CleanupHandle, DEFAULT_MAX_FIELD_SIZE, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_SPOOL_THRESHOLD, FileUpload, MapEntryError, MultipartError, PathError,
    ProcessedRequest, SPEC_URL, STATUS_CLIENT_CLOSED_REQUEST, SpillBuffer, SpillReader, Upload,
    UploadConfig, UploadDriver, UploadError, UploadSession, UploadState, Value,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        AbortHandle, CleanupHandle, FileUpload, GraphqlRequest, SpillReader, Upload, UploadConfig,
        UploadDriver, UploadError, UploadSession, Value, error_body, is_multipart,
        process_request,
    };
    pub use bytes::Bytes;
    pub use futures_util::Stream;
}

/// Returns true if a Content-Type header value names a multipart form body.
#[must_use]
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("multipart/form-data"))
}

/// A processed request together with its lifecycle handles.
#[derive(Debug)]
pub struct GraphqlRequest<S> {
    /// Operations with uploads spliced in.
    pub operations: Value,
    /// Feeds file parts into uploads; run it alongside execution.
    pub driver: UploadDriver<S>,
    /// Call [`AbortHandle::disconnect`] when the connection closes early.
    pub abort: AbortHandle,
    /// Call [`CleanupHandle::release`] once the response has completed.
    pub cleanup: CleanupHandle,
}

/// Create a session, take its handles and process the request in one call.
pub async fn process_request<S>(
    config: UploadConfig,
    content_type: &str,
    body: S,
) -> Result<GraphqlRequest<S>, UploadError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let session = UploadSession::new(config);
    let abort = session.abort_handle();
    let cleanup = session.cleanup_handle();

    let ProcessedRequest { operations, driver } = session.process(content_type, body).await?;
    tracing::debug!(uploads = operations.uploads().len(), "graphql multipart request processed");
    Ok(GraphqlRequest {
        operations,
        driver,
        abort,
        cleanup,
    })
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    status: u16,
}

/// JSON body describing an error to the client: `{"message": ..., "status": ...}`.
#[must_use]
pub fn error_body(err: &UploadError) -> serde_json::Value {
    serde_json::to_value(ErrorBody {
        message: err.to_string(),
        status: err.status(),
    })
    .unwrap_or(serde_json::Value::Null)
}
