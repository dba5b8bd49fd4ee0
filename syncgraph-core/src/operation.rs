//! Operation records: the unit of mutation, replication and undo.
//!
//! Wire format (JSON, one object per operation):
//! ```text
//! { "type": "SET_PROPERTY", "object": "cube_…", "name": "tx", "value": 1.5, "previous": 0 }
//! { "type": "INSERT_ELEMENT", "object": "arr_…", "after": "cube_…", "value": "text_…", "index": 3 }
//! { "type": "REMOVE_ELEMENT", "object": "arr_…", "index": 2, "value": "cube_…" }
//! ```
//!
//! `previous`, `index` and the removed `value` exist so that an operation
//! can be inverted without consulting the graph that produced it.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::id::ObjectId;

/// One immutable mutation of a document graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    CreateObject {
        object: ObjectId,
    },
    CreateArray {
        object: ObjectId,
    },
    /// `value: None` (or JSON null) clears the property.
    SetProperty {
        object: ObjectId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<Value>,
    },
    /// Insert `value` right after the first element equal to `after`,
    /// or at the head when `after` is absent (null or empty string).
    ///
    /// `index`, when present, is where the element landed on the
    /// producing replica. It picks among duplicate `after` values: if the
    /// element at `index - 1` still equals `after`, that occurrence is the
    /// anchor.
    InsertElement {
        object: ObjectId,
        #[serde(default, deserialize_with = "head_anchor")]
        after: Option<Value>,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    RemoveElement {
        object: ObjectId,
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
}

/// Type tag of an [`Operation`], as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    CreateObject,
    CreateArray,
    SetProperty,
    InsertElement,
    RemoveElement,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::CreateObject => "CREATE_OBJECT",
            OpKind::CreateArray => "CREATE_ARRAY",
            OpKind::SetProperty => "SET_PROPERTY",
            OpKind::InsertElement => "INSERT_ELEMENT",
            OpKind::RemoveElement => "REMOVE_ELEMENT",
        }
    }

    /// Whether ops of this kind change array membership.
    pub fn is_structural(&self) -> bool {
        !matches!(self, OpKind::SetProperty)
    }
}

/// Where an operation entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A local edit from the UI or a command.
    Local,
    /// Received from the sync channel.
    Remote,
    /// Inverse applied by the undo queue.
    Undo,
    /// Re-application by the undo queue.
    Redo,
    /// Rebuilding a graph from persisted history.
    Replay,
}

impl Origin {
    /// Whether ops of this origin must be sent to other clients.
    pub fn is_published(&self) -> bool {
        matches!(self, Origin::Local | Origin::Undo | Origin::Redo)
    }
}

impl Operation {
    pub fn create_object(object: ObjectId) -> Self {
        Operation::CreateObject { object }
    }

    pub fn create_array(object: ObjectId) -> Self {
        Operation::CreateArray { object }
    }

    pub fn set_property(
        object: ObjectId,
        name: impl Into<String>,
        value: Option<Value>,
        previous: Option<Value>,
    ) -> Self {
        Operation::SetProperty {
            object,
            name: name.into(),
            value: value.filter(|v| !v.is_null()),
            previous: previous.filter(|v| !v.is_null()),
        }
    }

    pub fn insert_element(object: ObjectId, after: Option<Value>, value: Value) -> Self {
        Operation::InsertElement {
            object,
            after: after.filter(|v| !is_head_anchor(v)),
            value,
            index: None,
        }
    }

    /// Like [`Operation::insert_element`], pinned to the occurrence of
    /// `after` sitting just before `index`.
    pub fn insert_element_at(
        object: ObjectId,
        after: Option<Value>,
        value: Value,
        index: usize,
    ) -> Self {
        Operation::InsertElement {
            object,
            after: after.filter(|v| !is_head_anchor(v)),
            value,
            index: Some(index),
        }
    }

    pub fn remove_element(object: ObjectId, index: usize, value: Option<Value>) -> Self {
        Operation::RemoveElement { object, index, value }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::CreateObject { .. } => OpKind::CreateObject,
            Operation::CreateArray { .. } => OpKind::CreateArray,
            Operation::SetProperty { .. } => OpKind::SetProperty,
            Operation::InsertElement { .. } => OpKind::InsertElement,
            Operation::RemoveElement { .. } => OpKind::RemoveElement,
        }
    }

    /// The object or array this operation targets.
    pub fn target(&self) -> &ObjectId {
        match self {
            Operation::CreateObject { object }
            | Operation::CreateArray { object }
            | Operation::SetProperty { object, .. }
            | Operation::InsertElement { object, .. }
            | Operation::RemoveElement { object, .. } => object,
        }
    }

    /// Property name for `SET_PROPERTY`, `None` otherwise.
    pub fn property_name(&self) -> Option<&str> {
        match self {
            Operation::SetProperty { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Encode as a single JSON record.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// `after` values meaning "insert at the head".
pub(crate) fn is_head_anchor(value: &Value) -> bool {
    value.is_null() || value.as_str() == Some("")
}

fn head_anchor<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let after = Option::<Value>::deserialize(deserializer)?;
    Ok(after.filter(|v| !is_head_anchor(v)))
}
