//! Dot-path addressing into a [`Value`] tree.
//!
//! Segments are separated by `.`. Against an object a segment is a key;
//! against an array it must be a decimal index. Every segment but the last
//! must name an existing container. The last segment may add a new object key
//! but must name an existing array slot.

use crate::value::Value;

/// Why a dot path could not be followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path is empty.
    Empty,
    /// The segment names nothing in its container.
    Missing { segment: String },
    /// The segment was applied to something that is not an object or array.
    NotContainer { segment: String },
    /// The segment is not a valid index for the array it was applied to.
    BadIndex { segment: String },
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty path"),
            Self::Missing { segment } => write!(f, "no value at segment '{segment}'"),
            Self::NotContainer { segment } => {
                write!(f, "segment '{segment}' applied to a non-container value")
            }
            Self::BadIndex { segment } => write!(f, "segment '{segment}' is not an array index"),
        }
    }
}

impl std::error::Error for PathError {}

/// Store `value` at `path` inside `root`.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(PathError::Empty);
    };

    let mut node = root;
    for segment in parents {
        node = child_mut(node, segment)?;
    }

    match node {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last)?;
            let slot = items.get_mut(index).ok_or_else(|| PathError::Missing {
                segment: (*last).to_string(),
            })?;
            *slot = value;
            Ok(())
        }
        _ => Err(PathError::NotContainer {
            segment: (*last).to_string(),
        }),
    }
}

/// Look up the value at `path`.
#[must_use]
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => parse_index(segment).ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Result<&'a mut Value, PathError> {
    let found = match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => items.get_mut(parse_index(segment)?),
        _ => {
            return Err(PathError::NotContainer {
                segment: segment.to_string(),
            });
        }
    };
    found.ok_or_else(|| PathError::Missing {
        segment: segment.to_string(),
    })
}

fn parse_index(segment: &str) -> Result<usize, PathError> {
    let bad = || PathError::BadIndex {
        segment: segment.to_string(),
    };
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    segment.parse().map_err(|_| bad())
}
