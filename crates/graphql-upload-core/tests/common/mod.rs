//! Multipart body builder shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, stream};
use graphql_upload_core::{Upload, Value};
use tokio::sync::mpsc;

pub const BOUNDARY: &str = "graphql-upload-test";
pub const CONTENT_TYPE: &str = "multipart/form-data; boundary=graphql-upload-test";

pub type ChunkBody = stream::Iter<std::vec::IntoIter<io::Result<Bytes>>>;
pub type ChannelBody = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Builds a `multipart/form-data` body part by part.
#[derive(Debug, Default)]
pub struct MultipartBuilder {
    raw: Vec<u8>,
}

impl MultipartBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.raw.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    pub fn operations(self, value: &serde_json::Value) -> Self {
        self.field("operations", &value.to_string())
    }

    pub fn map(self, value: &serde_json::Value) -> Self {
        self.field("map", &value.to_string())
    }

    pub fn file(self, name: &str, filename: &str, content: &[u8]) -> Self {
        self.file_part(name, filename, None, content)
    }

    pub fn typed_file(self, name: &str, filename: &str, content_type: &str, content: &[u8]) -> Self {
        self.file_part(name, filename, Some(content_type), content)
    }

    fn file_part(
        mut self,
        name: &str,
        filename: &str,
        content_type: Option<&str>,
        content: &[u8],
    ) -> Self {
        self.raw.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        if let Some(content_type) = content_type {
            self.raw
                .extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        self.raw.extend_from_slice(b"\r\n");
        self.raw.extend_from_slice(content);
        self.raw.extend_from_slice(b"\r\n");
        self
    }

    /// Start a file part and write only `content`, leaving the part open.
    pub fn open_file(mut self, name: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        self.raw.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\r\n"
            )
            .as_bytes(),
        );
        self.raw.extend_from_slice(content);
        self.raw
    }

    /// The body so far, without the closing delimiter.
    pub fn unfinished(self) -> Vec<u8> {
        self.raw
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.raw
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.raw
    }
}

/// A body stream yielding `raw` in chunks of `size` bytes.
pub fn chunked(raw: &[u8], size: usize) -> ChunkBody {
    let chunks: Vec<io::Result<Bytes>> = raw
        .chunks(size.max(1))
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}

/// A body stream yielding `raw` as a single chunk.
pub fn whole(raw: Vec<u8>) -> ChunkBody {
    stream::iter(vec![Ok(Bytes::from(raw))])
}

/// A body fed through a channel; it stays pending until the sender sends or drops.
pub fn channel_body() -> (mpsc::UnboundedSender<io::Result<Bytes>>, ChannelBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (tx, Box::pin(body))
}

/// The upload stored at `path` in the document.
pub fn upload_at(document: &Value, path: &str) -> Upload {
    document
        .pointer(path)
        .and_then(Value::as_upload)
        .cloned()
        .unwrap_or_else(|| panic!("no upload at {path}"))
}
