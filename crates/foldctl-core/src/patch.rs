use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// One step of a patch path: a mapping key, a sequence index, or the
/// one-past-the-end append position (valid only as the final segment of an
/// add).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    End,
}

impl Segment {
    pub fn key(name: &str) -> Self {
        Segment::Key(name.to_string())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "{index}"),
            Segment::End => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Add { path: Vec<Segment>, value: Value },
    Replace { path: Vec<Segment>, value: Value },
    Remove { path: Vec<Segment> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("path segment \"{0}\" not found")]
    PathNotFound(String),
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("segment \"{0}\" does not match the node it addresses")]
    TypeMismatch(String),
    #[error("append segment is only valid as the last segment of an add")]
    AppendNotAllowed,
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
}

/// Apply one operation to the tree in place. Missing intermediate containers
/// are never created; `add` may create the final segment, `remove` of an
/// absent mapping key is a no-op.
pub fn apply(tree: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    match op {
        PatchOp::Replace { path, value } if path.is_empty() => {
            *tree = value.clone();
            Ok(())
        }
        PatchOp::Add { path, value } if path.is_empty() => {
            *tree = value.clone();
            Ok(())
        }
        PatchOp::Remove { path } if path.is_empty() => Err(PatchError::MalformedUpdate(
            "remove at the root path".to_string(),
        )),
        PatchOp::Replace { path, value } => {
            let (parent, last) = descend(tree, path)?;
            match (parent, last) {
                (Value::Object(map), Segment::Key(key)) => {
                    if !map.contains_key(key) {
                        return Err(PatchError::PathNotFound(key.clone()));
                    }
                    map.insert(key.clone(), value.clone());
                    Ok(())
                }
                (Value::Array(items), Segment::Index(index)) => {
                    let len = items.len();
                    match items.get_mut(*index) {
                        Some(slot) => {
                            *slot = value.clone();
                            Ok(())
                        }
                        None => Err(PatchError::IndexOutOfRange { index: *index, len }),
                    }
                }
                (Value::Array(_), Segment::End) => Err(PatchError::AppendNotAllowed),
                (_, last) => Err(PatchError::TypeMismatch(last.to_string())),
            }
        }
        PatchOp::Add { path, value } => {
            let (parent, last) = descend(tree, path)?;
            match (parent, last) {
                (Value::Object(map), Segment::Key(key)) => {
                    map.insert(key.clone(), value.clone());
                    Ok(())
                }
                (Value::Array(items), Segment::Index(index)) => {
                    let len = items.len();
                    if *index < len {
                        items[*index] = value.clone();
                        Ok(())
                    } else if *index == len {
                        items.push(value.clone());
                        Ok(())
                    } else {
                        Err(PatchError::IndexOutOfRange { index: *index, len })
                    }
                }
                (Value::Array(items), Segment::End) => {
                    items.push(value.clone());
                    Ok(())
                }
                (_, last) => Err(PatchError::TypeMismatch(last.to_string())),
            }
        }
        PatchOp::Remove { path } => {
            let (parent, last) = descend(tree, path)?;
            match (parent, last) {
                (Value::Object(map), Segment::Key(key)) => {
                    // tolerated: the protocol may resend removals
                    map.shift_remove(key);
                    Ok(())
                }
                (Value::Array(items), Segment::Index(index)) => {
                    let len = items.len();
                    if *index < len {
                        items.remove(*index);
                        Ok(())
                    } else {
                        Err(PatchError::IndexOutOfRange { index: *index, len })
                    }
                }
                (Value::Array(_), Segment::End) => Err(PatchError::AppendNotAllowed),
                (_, last) => Err(PatchError::TypeMismatch(last.to_string())),
            }
        }
    }
}

/// Walk to the parent of the final segment. The path must be non-empty.
fn descend<'a>(
    tree: &'a mut Value,
    path: &[Segment],
) -> Result<(&'a mut Value, &Segment), PatchError> {
    let (last, parents) = path
        .split_last()
        .ok_or_else(|| PatchError::MalformedUpdate("empty path".to_string()))?;
    let mut node = tree;
    for segment in parents {
        node = match segment {
            Segment::Key(key) => match node {
                Value::Object(map) => map
                    .get_mut(key)
                    .ok_or_else(|| PatchError::PathNotFound(key.clone()))?,
                _ => return Err(PatchError::TypeMismatch(segment.to_string())),
            },
            Segment::Index(index) => match node {
                Value::Array(items) => {
                    let len = items.len();
                    items
                        .get_mut(*index)
                        .ok_or(PatchError::IndexOutOfRange { index: *index, len })?
                }
                _ => return Err(PatchError::TypeMismatch(segment.to_string())),
            },
            Segment::End => return Err(PatchError::AppendNotAllowed),
        };
    }
    Ok((node, last))
}
