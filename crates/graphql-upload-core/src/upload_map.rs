//! The `map` field: one deferred upload per field id, spliced into the document.

use indexmap::IndexMap;

use crate::error::{MapEntryError, UploadError};
use crate::path;
use crate::upload::Upload;
use crate::value::Value;

/// Registry of the uploads declared by the `map` field, in map order.
#[derive(Debug, Default)]
pub struct UploadMap {
    uploads: IndexMap<String, Upload>,
}

impl UploadMap {
    /// Parse the raw `map` field and splice uploads into `operations`.
    ///
    /// On failure every upload created so far is rejected with the same error.
    pub fn build(
        operations: &mut Value,
        raw: &[u8],
        max_files: Option<usize>,
    ) -> Result<Self, UploadError> {
        let parsed: serde_json::Value =
            serde_json::from_slice(raw).map_err(|_| UploadError::InvalidJson { field: "map" })?;
        let serde_json::Value::Object(entries) = parsed else {
            return Err(UploadError::InvalidFieldType { field: "map" });
        };

        if let Some(max) = max_files {
            if entries.len() > max {
                return Err(UploadError::MaxFiles { max });
            }
        }

        let mut map = Self::default();
        for (field_id, paths) in entries {
            if let Err(err) = map.insert_entry(operations, field_id, paths) {
                map.reject_pending(&err);
                return Err(err);
            }
        }
        Ok(map)
    }

    fn insert_entry(
        &mut self,
        operations: &mut Value,
        field_id: String,
        paths: serde_json::Value,
    ) -> Result<(), UploadError> {
        let upload = Upload::new(field_id.clone());
        self.uploads.insert(field_id.clone(), upload.clone());

        let serde_json::Value::Array(paths) = paths else {
            return Err(MapEntryError::NotArray { key: field_id }.into());
        };
        for (index, item) in paths.iter().enumerate() {
            let Some(dot_path) = item.as_str() else {
                return Err(MapEntryError::NotString {
                    key: field_id,
                    index,
                }
                .into());
            };
            if path::set(operations, dot_path, Value::Upload(upload.clone())).is_err() {
                return Err(MapEntryError::InvalidPath {
                    key: field_id,
                    index,
                    path: dot_path.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Number of declared uploads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.uploads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
    }

    /// The upload declared under `field_id`.
    #[must_use]
    pub fn get(&self, field_id: &str) -> Option<&Upload> {
        self.uploads.get(field_id)
    }

    /// The upload for `field_id` if it is still waiting for its file part.
    #[must_use]
    pub fn pending(&self, field_id: &str) -> Option<&Upload> {
        self.get(field_id).filter(|upload| upload.is_pending())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Upload)> {
        self.uploads.iter().map(|(id, upload)| (id.as_str(), upload))
    }

    /// Reject every pending upload; returns how many were rejected.
    pub fn reject_pending(&self, error: &UploadError) -> usize {
        self.uploads
            .values()
            .filter(|upload| upload.reject(error.clone()))
            .count()
    }

    /// Destroy the buffer of every resolved upload; returns how many were destroyed.
    pub fn release_buffers(&self) -> usize {
        self.uploads
            .values()
            .filter_map(|upload| upload.try_file().and_then(Result::ok))
            .filter(|file| file.buffer().destroy(None))
            .count()
    }
}
