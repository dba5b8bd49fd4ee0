use serde_json::Value;
use thiserror::Error;

use crate::id::ObjectId;

/// An operation referenced state that does not exist (or already exists).
///
/// Rejected operations are never applied and never reach listeners.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown object `{0}`")]
    MissingObject(ObjectId),
    #[error("unknown array `{0}`")]
    MissingArray(ObjectId),
    #[error("element {element} not found in array `{array}`")]
    MissingElement { array: ObjectId, element: Value },
    #[error("index {index} out of bounds for array `{array}` of length {len}")]
    IndexOutOfBounds {
        array: ObjectId,
        index: usize,
        len: usize,
    },
    #[error("id `{0}` already exists")]
    DuplicateId(ObjectId),
}

/// Errors raised while building or restoring a document session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("document type `{found}` does not match editor type `{expected}`")]
    DocTypeMismatch { expected: String, found: String },
    #[error("history replay failed at operation {index}: {source}")]
    Replay {
        index: usize,
        #[source]
        source: GraphError,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}
