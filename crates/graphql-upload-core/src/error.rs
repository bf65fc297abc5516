//! Error taxonomy for GraphQL multipart request processing.
//!
//! Every error maps to an HTTP status through [`UploadError::status`] and renders
//! a client-facing message through `Display`. Errors are `Clone` because a single
//! failure fans out to every pending upload and every open reader.

use crate::multipart::MultipartError;

/// Where clients can read about the request format.
pub const SPEC_URL: &str = "https://github.com/jaydenseric/graphql-multipart-request-spec";

/// Non-standard "client closed request" status.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// A malformed entry in the `map` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEntryError {
    /// The entry value is not an array.
    NotArray { key: String },
    /// An array item is not a string.
    NotString { key: String, index: usize },
    /// An array item does not address a location in the operations document.
    InvalidPath {
        key: String,
        index: usize,
        path: String,
    },
}

impl MapEntryError {
    /// The map key the problem was found under.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::NotArray { key }
            | Self::NotString { key, .. }
            | Self::InvalidPath { key, .. } => key,
        }
    }
}

impl std::fmt::Display for MapEntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotArray { key } => write!(
                f,
                "Invalid type for the ‘map’ multipart field entry key ‘{key}’ array ({SPEC_URL})."
            ),
            Self::NotString { key, index } => write!(
                f,
                "Invalid type for the ‘map’ multipart field entry key ‘{key}’ array index ‘{index}’ value ({SPEC_URL})."
            ),
            Self::InvalidPath { key, index, path } => write!(
                f,
                "Invalid object path for the ‘map’ multipart field entry key ‘{key}’ array index ‘{index}’ value ‘{path}’ ({SPEC_URL})."
            ),
        }
    }
}

/// Errors produced while processing a GraphQL multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// `operations` or `map` is not valid JSON.
    InvalidJson { field: &'static str },
    /// `operations` or `map` has the wrong JSON shape.
    InvalidFieldType { field: &'static str },
    /// `map` arrived before `operations`.
    MapBeforeOperations,
    /// A file part arrived before `map` was complete.
    FilesBeforeMap,
    /// A field other than `operations` arrived first.
    UnexpectedField { name: String },
    /// A `map` entry is malformed or addresses nothing.
    InvalidMapEntry(MapEntryError),
    /// `operations` or `map` never arrived.
    MissingField { field: &'static str },
    /// A declared upload never received its file part.
    FileMissing,
    /// Malformed multipart framing or Content-Type.
    Multipart(MultipartError),
    /// `operations` or `map` exceeds the configured size.
    MaxFieldSize { field: &'static str, max: usize },
    /// Too many files.
    MaxFiles { max: usize },
    /// A file exceeds the configured size.
    MaxFileSize { max: u64 },
    /// The client went away before the body was fully received.
    Disconnect,
    /// The file buffer was released after the response completed.
    Released,
    /// Spill buffer I/O failed.
    Io { detail: String },
}

impl UploadError {
    /// HTTP status code to report for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidJson { .. }
            | Self::InvalidFieldType { .. }
            | Self::MapBeforeOperations
            | Self::FilesBeforeMap
            | Self::UnexpectedField { .. }
            | Self::InvalidMapEntry(_)
            | Self::MissingField { .. }
            | Self::FileMissing
            | Self::Multipart(_) => 400,
            Self::MaxFieldSize { .. } | Self::MaxFiles { .. } | Self::MaxFileSize { .. } => 413,
            Self::Disconnect => STATUS_CLIENT_CLOSED_REQUEST,
            Self::Released | Self::Io { .. } => 500,
        }
    }

    /// Returns true when the error was caused by the client's request.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true when a configured limit was exceeded.
    #[must_use]
    pub fn is_limit(&self) -> bool {
        self.status() == 413
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson { field } => {
                write!(f, "Invalid JSON in the ‘{field}’ multipart field ({SPEC_URL}).")
            }
            Self::InvalidFieldType { field } => {
                write!(f, "Invalid type for the ‘{field}’ multipart field ({SPEC_URL}).")
            }
            Self::MapBeforeOperations => write!(
                f,
                "Misordered multipart fields; ‘map’ should follow ‘operations’ ({SPEC_URL})."
            ),
            Self::FilesBeforeMap => write!(
                f,
                "Misordered multipart fields; files should follow ‘map’ ({SPEC_URL})."
            ),
            Self::UnexpectedField { name } => write!(
                f,
                "Misordered multipart fields; expected ‘operations’ first, got ‘{name}’ ({SPEC_URL})."
            ),
            Self::InvalidMapEntry(entry) => write!(f, "{entry}"),
            Self::MissingField { field } => {
                write!(f, "Missing multipart field ‘{field}’ ({SPEC_URL}).")
            }
            Self::FileMissing => write!(f, "File missing in the request."),
            Self::Multipart(err) => write!(f, "Malformed multipart request: {err}."),
            Self::MaxFieldSize { field, max } => write!(
                f,
                "The ‘{field}’ multipart field value exceeds the {max} byte size limit."
            ),
            Self::MaxFiles { max } => write!(f, "{max} max file uploads exceeded."),
            Self::MaxFileSize { max } => {
                write!(f, "File truncated as it exceeds the {max} byte size limit.")
            }
            Self::Disconnect => write!(f, "Request disconnected during file upload stream parsing."),
            Self::Released => write!(f, "Upload buffer was released after the response completed."),
            Self::Io { detail } => write!(f, "Upload buffer I/O error: {detail}"),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Multipart(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MapEntryError> for UploadError {
    fn from(err: MapEntryError) -> Self {
        Self::InvalidMapEntry(err)
    }
}

impl From<MultipartError> for UploadError {
    /// Framing errors stay 400s; a failing or truncated body means the client left.
    fn from(err: MultipartError) -> Self {
        match err {
            MultipartError::Io { .. } | MultipartError::UnexpectedEof => Self::Disconnect,
            other => Self::Multipart(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert_eq!(UploadError::InvalidJson { field: "map" }.status(), 400);
        assert_eq!(UploadError::FileMissing.status(), 400);
        assert_eq!(UploadError::MaxFiles { max: 1 }.status(), 413);
        assert_eq!(UploadError::MaxFileSize { max: 1 }.status(), 413);
        assert_eq!(UploadError::Disconnect.status(), 499);
        assert!(UploadError::Disconnect.is_client_error());
        assert!(!UploadError::Released.is_client_error());
        assert!(UploadError::MaxFieldSize { field: "map", max: 2 }.is_limit());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            UploadError::MaxFiles { max: 2 }.to_string(),
            "2 max file uploads exceeded."
        );
        assert_eq!(
            UploadError::MaxFileSize { max: 1 }.to_string(),
            "File truncated as it exceeds the 1 byte size limit."
        );
        assert_eq!(
            UploadError::MaxFieldSize {
                field: "operations",
                max: 1
            }
            .to_string(),
            "The ‘operations’ multipart field value exceeds the 1 byte size limit."
        );
        assert_eq!(
            UploadError::MissingField { field: "map" }.to_string(),
            format!("Missing multipart field ‘map’ ({SPEC_URL}).")
        );
        assert_eq!(
            UploadError::from(MapEntryError::InvalidPath {
                key: "1".to_string(),
                index: 0,
                path: "variables.file".to_string(),
            })
            .to_string(),
            format!(
                "Invalid object path for the ‘map’ multipart field entry key ‘1’ array index ‘0’ value ‘variables.file’ ({SPEC_URL})."
            )
        );
    }

    #[test]
    fn test_body_failures_map_to_disconnect() {
        assert_eq!(
            UploadError::from(MultipartError::UnexpectedEof),
            UploadError::Disconnect
        );
        assert_eq!(
            UploadError::from(MultipartError::Io {
                detail: "reset".to_string()
            }),
            UploadError::Disconnect
        );
        assert_eq!(
            UploadError::from(MultipartError::MissingBoundary),
            UploadError::Multipart(MultipartError::MissingBoundary)
        );
    }
}
