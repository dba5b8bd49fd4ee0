//! Object, array and document identifiers.
//!
//! Ids are generated fresh per document, so nothing in the graph may rely
//! on a fixed id. The human-readable prefix makes logs and persisted
//! histories easy to scan:
//!
//! ```text
//! cube_6f1c0d8e2b9a4c51a0a7d3e5f4b2c1d0
//! ^^^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^
//! tag  uuid v4 (simple form)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Prefix used for arrays created by the command generator.
pub const ARRAY_PREFIX: &str = "arr";
/// Prefix used for objects created without a string `type` property.
pub const OBJECT_PREFIX: &str = "obj";
/// Prefix used for document ids.
pub const DOC_PREFIX: &str = "doc";

/// Identifier of an object or array in a [`DocGraph`](crate::DocGraph).
///
/// Objects and arrays share one id space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap an existing id string (e.g. one read back from history).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id of the form `<prefix>_<uuid>`.
    pub fn generate(prefix: &str) -> Self {
        Self(gen_id(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The human-readable tag before the first `_`, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once('_').map(|(p, _)| p)
    }

    /// Interpret a property or element value as an id reference.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(Self::new)
    }

    /// The JSON form used when an id is stored as a property or element.
    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::String(id.0)
    }
}

impl From<&ObjectId> for Value {
    fn from(id: &ObjectId) -> Self {
        id.to_value()
    }
}

/// Generate a unique `<prefix>_<uuid>` token.
pub fn gen_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Generate a fresh document id.
pub fn generate_doc_id() -> String {
    gen_id(DOC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = ObjectId::generate("cube");
        let b = ObjectId::generate("cube");
        assert_ne!(a, b);
        assert_eq!(a.prefix(), Some("cube"));
        assert!(a.as_str().len() > "cube_".len());
    }

    #[test]
    fn test_value_conversion() {
        let id = ObjectId::new("scene_1");
        let v: Value = id.clone().into();
        assert_eq!(v, Value::String("scene_1".into()));
        assert_eq!(ObjectId::from_value(&v), Some(id));
        assert_eq!(ObjectId::from_value(&Value::Bool(true)), None);
    }

    #[test]
    fn test_doc_id_prefix() {
        assert!(generate_doc_id().starts_with("doc_"));
    }

    #[test]
    fn test_serde_transparent() {
        let id = ObjectId::new("obj_x");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"obj_x\"");
    }
}
