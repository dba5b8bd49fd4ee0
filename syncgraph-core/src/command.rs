//! Translation of high-level edits into well-formed operations.
//!
//! The generator reads the current graph to fill in inversion data
//! (`previous`, removed `value`) and assigns fresh ids on creation, then
//! hands every operation to the sink's `process`. It holds nothing but
//! the borrow of its sink.

use serde_json::Value;

use crate::error::GraphError;
use crate::graph::OperationSink;
use crate::id::{ObjectId, ARRAY_PREFIX, OBJECT_PREFIX};
use crate::operation::Operation;

pub struct CommandGenerator<'a, S: OperationSink + ?Sized> {
    sink: &'a mut S,
}

impl<'a, S: OperationSink + ?Sized> CommandGenerator<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink }
    }

    /// Create an object and set its initial properties.
    ///
    /// The id prefix is the `type` property when it is a string.
    pub fn create_object<K, I>(&mut self, props: I) -> Result<ObjectId, GraphError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let props: Vec<(String, Value)> = props.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let prefix = props
            .iter()
            .find(|(k, _)| k == "type")
            .and_then(|(_, v)| v.as_str())
            .unwrap_or(OBJECT_PREFIX);
        let id = ObjectId::generate(prefix);

        self.sink.process(Operation::create_object(id.clone()))?;
        for (key, value) in props {
            self.sink
                .process(Operation::set_property(id.clone(), key, Some(value), None))?;
        }
        Ok(id)
    }

    pub fn create_array(&mut self) -> Result<ObjectId, GraphError> {
        let id = ObjectId::generate(ARRAY_PREFIX);
        self.sink.process(Operation::create_array(id.clone()))?;
        Ok(id)
    }

    pub fn set_property(
        &mut self,
        id: &ObjectId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let previous = self.sink.graph().property(id, key).cloned();
        self.sink.process(Operation::set_property(
            id.clone(),
            key,
            Some(value.into()),
            previous,
        ))
    }

    pub fn clear_property(&mut self, id: &ObjectId, key: &str) -> Result<(), GraphError> {
        let previous = self.sink.graph().property(id, key).cloned();
        self.sink
            .process(Operation::set_property(id.clone(), key, None, previous))
    }

    /// Insert `value` after `after`, or at the head when `after` is `None`.
    pub fn insert_after(
        &mut self,
        array: &ObjectId,
        after: Option<Value>,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        self.sink
            .process(Operation::insert_element(array.clone(), after, value.into()))
    }

    /// Insert `value` so that it lands at `index` (`0..=len`).
    ///
    /// The anchor is the element currently at `index - 1`, pinned by
    /// position so equal values elsewhere in the array do not capture it.
    pub fn insert_at(
        &mut self,
        array: &ObjectId,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let graph = self.sink.graph();
        let len = graph
            .array_len(array)
            .ok_or_else(|| GraphError::MissingArray(array.clone()))?;
        if index > len {
            return Err(GraphError::IndexOutOfBounds {
                array: array.clone(),
                index,
                len,
            });
        }
        let after = index
            .checked_sub(1)
            .and_then(|i| graph.element_at(array, i))
            .cloned();
        self.sink.process(Operation::insert_element_at(
            array.clone(),
            after,
            value.into(),
            index,
        ))
    }

    /// Remove the element at `index`, returning the removed value.
    pub fn remove_element(&mut self, array: &ObjectId, index: usize) -> Result<Value, GraphError> {
        let graph = self.sink.graph();
        let len = graph
            .array_len(array)
            .ok_or_else(|| GraphError::MissingArray(array.clone()))?;
        let value = graph
            .element_at(array, index)
            .cloned()
            .ok_or_else(|| GraphError::IndexOutOfBounds {
                array: array.clone(),
                index,
                len,
            })?;
        self.sink.process(Operation::remove_element(
            array.clone(),
            index,
            Some(value.clone()),
        ))?;
        Ok(value)
    }
}

/// The DocGraph mutation surface, available on every [`OperationSink`].
///
/// Each call goes through a [`CommandGenerator`], so the resulting
/// operations are identical whichever layer was called.
pub trait GraphMutations: OperationSink {
    fn create_object<K, I>(&mut self, props: I) -> Result<ObjectId, GraphError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        CommandGenerator::new(self).create_object(props)
    }

    fn create_array(&mut self) -> Result<ObjectId, GraphError> {
        CommandGenerator::new(self).create_array()
    }

    fn set_property(
        &mut self,
        id: &ObjectId,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        CommandGenerator::new(self).set_property(id, key, value)
    }

    fn clear_property(&mut self, id: &ObjectId, key: &str) -> Result<(), GraphError> {
        CommandGenerator::new(self).clear_property(id, key)
    }

    fn insert_after(
        &mut self,
        array: &ObjectId,
        after: Option<Value>,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        CommandGenerator::new(self).insert_after(array, after, value)
    }

    fn insert_at(
        &mut self,
        array: &ObjectId,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        CommandGenerator::new(self).insert_at(array, index, value)
    }

    fn remove_element(&mut self, array: &ObjectId, index: usize) -> Result<Value, GraphError> {
        CommandGenerator::new(self).remove_element(array, index)
    }
}

impl<S: OperationSink + ?Sized> GraphMutations for S {}
