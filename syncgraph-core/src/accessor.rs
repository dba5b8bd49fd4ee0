//! Convenience object view over a graph.
//!
//! Handles are live: every read goes to the graph, every write becomes an
//! operation on the underlying sink. Unknown ids produce
//! [`ObjectRef::Missing`] instead of an error so UI code can look ids up freely.
//!
//! Tree convention used by the editors: a container object has a
//! `children` property holding an array id, and each child stores its
//! container's id in `parent`.

use indexmap::IndexMap;
use serde_json::Value;

use crate::command::GraphMutations;
use crate::error::GraphError;
use crate::graph::OperationSink;
use crate::id::ObjectId;

pub const CHILDREN: &str = "children";
pub const PARENT: &str = "parent";

pub struct GraphAccessor<'a, S: OperationSink + ?Sized> {
    sink: &'a mut S,
}

impl<'a, S: OperationSink + ?Sized> GraphAccessor<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink }
    }

    pub fn object(&mut self, id: &ObjectId) -> ObjectRef<'_, S> {
        if self.sink.graph().has_object(id) {
            ObjectRef::Found(ObjectHandle {
                sink: &mut *self.sink,
                id: id.clone(),
            })
        } else {
            ObjectRef::Missing
        }
    }

    /// Ids stored in the `children` array of `id` (empty if none).
    pub fn children_of(&self, id: &ObjectId) -> Vec<ObjectId> {
        array_ids(self.sink, id, CHILDREN)
    }
}

/// Result of looking up an object by id.
pub enum ObjectRef<'a, S: OperationSink + ?Sized> {
    Found(ObjectHandle<'a, S>),
    Missing,
}

impl<'a, S: OperationSink + ?Sized> ObjectRef<'a, S> {
    pub fn exists(&self) -> bool {
        matches!(self, ObjectRef::Found(_))
    }

    pub fn found(self) -> Option<ObjectHandle<'a, S>> {
        match self {
            ObjectRef::Found(handle) => Some(handle),
            ObjectRef::Missing => None,
        }
    }
}

/// Live handle on one existing object.
pub struct ObjectHandle<'a, S: OperationSink + ?Sized> {
    sink: &'a mut S,
    id: ObjectId,
}

impl<'a, S: OperationSink + ?Sized> ObjectHandle<'a, S> {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn exists(&self) -> bool {
        self.sink.graph().has_object(&self.id)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.sink.graph().property(&self.id, key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Current property values as a map (a copy, not a live view).
    pub fn props(&self) -> IndexMap<String, Value> {
        self.sink
            .graph()
            .properties(&self.id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<&mut Self, GraphError> {
        self.sink.set_property(&self.id, key, value)?;
        Ok(self)
    }

    /// Elements of the array stored under `key`. Empty if it is not an array.
    pub fn array(&self, key: &str) -> Vec<Value> {
        let graph = self.sink.graph();
        graph
            .property(&self.id, key)
            .and_then(ObjectId::from_value)
            .and_then(|arr| graph.elements(&arr))
            .map(<[Value]>::to_vec)
            .unwrap_or_default()
    }

    pub fn children(&self) -> Vec<ObjectId> {
        array_ids(self.sink, &self.id, CHILDREN)
    }

    pub fn child(&self, index: usize) -> Option<ObjectId> {
        self.children().into_iter().nth(index)
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.get(PARENT).and_then(ObjectId::from_value)
    }

    fn children_array(&self) -> Result<ObjectId, GraphError> {
        let graph = self.sink.graph();
        graph
            .property(&self.id, CHILDREN)
            .and_then(ObjectId::from_value)
            .filter(|arr| graph.has_array(arr))
            .ok_or_else(|| GraphError::MissingArray(ObjectId::new(format!("{}.{CHILDREN}", self.id))))
    }

    /// Append `child` to this object's children and point it back here.
    pub fn insert_child_last(&mut self, child: &ObjectId) -> Result<(), GraphError> {
        let arr = self.children_array()?;
        self.require(child)?;
        let len = self.sink.graph().array_len(&arr).unwrap_or_default();
        self.sink.insert_at(&arr, len, child)?;
        self.sink.set_property(child, PARENT, &self.id)
    }

    /// Prepend `child` to this object's children and point it back here.
    pub fn insert_first_child(&mut self, child: &ObjectId) -> Result<(), GraphError> {
        let arr = self.children_array()?;
        self.require(child)?;
        self.sink.insert_after(&arr, None, child)?;
        self.sink.set_property(child, PARENT, &self.id)
    }

    fn require(&self, id: &ObjectId) -> Result<(), GraphError> {
        if self.sink.graph().has_object(id) {
            Ok(())
        } else {
            Err(GraphError::MissingObject(id.clone()))
        }
    }

    /// Unlink this object from its parent's children. The object itself
    /// stays in the graph.
    ///
    /// Returns `Ok(false)` if it has no parent or is not listed there.
    pub fn remove_from_parent(&mut self) -> Result<bool, GraphError> {
        let Some(parent) = self.parent() else {
            return Ok(false);
        };
        let graph = self.sink.graph();
        let Some(arr) = graph
            .property(&parent, CHILDREN)
            .and_then(ObjectId::from_value)
        else {
            return Ok(false);
        };
        match graph.index_of(&arr, &self.id.to_value()) {
            Some(index) => {
                self.sink.remove_element(&arr, index)?;
                Ok(true)
            }
            None => {
                log::warn!("{} not found in children of {parent}", self.id);
                Ok(false)
            }
        }
    }

    /// Copy this object's own properties into a new object.
    ///
    /// Children are not copied: a source `children` array becomes a fresh
    /// empty array on the clone.
    pub fn clone_object(&mut self) -> Result<ObjectId, GraphError> {
        let props = self.props();
        let mut copied = Vec::with_capacity(props.len());
        for (key, value) in props {
            if key == CHILDREN {
                let arr = self.sink.create_array()?;
                copied.push((key, arr.to_value()));
            } else {
                copied.push((key, value));
            }
        }
        self.sink.create_object(copied)
    }
}

fn array_ids<S: OperationSink + ?Sized>(sink: &S, id: &ObjectId, key: &str) -> Vec<ObjectId> {
    let graph = sink.graph();
    graph
        .property(id, key)
        .and_then(ObjectId::from_value)
        .and_then(|arr| graph.elements(&arr))
        .map(|elems| elems.iter().filter_map(ObjectId::from_value).collect())
        .unwrap_or_default()
}
