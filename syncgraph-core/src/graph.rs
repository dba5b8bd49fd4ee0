//! The replicated document graph.
//!
//! ```text
//!   Operation ──► validate ──► mutate ──► on_change listeners ──► history.push
//!                    │
//!                    └── GraphError (nothing applied, nothing fired)
//! ```
//!
//! `process` is the only mutation path. Local commands, remote operations
//! and history replay all go through it, so the resulting state does not
//! depend on where an operation came from.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::GraphError;
use crate::events::{SubscriptionId, Subscribers};
use crate::id::ObjectId;
use crate::operation::{is_head_anchor, Operation, Origin};

/// Anything operations can be pushed into.
///
/// Implemented by [`DocGraph`] itself and by every layer wrapping it
/// (coalescer, session), so commands and accessors work against any of
/// them.
pub trait OperationSink {
    /// Read access to the underlying graph.
    fn graph(&self) -> &DocGraph;

    /// Apply one operation, tagged with where it came from.
    fn apply(&mut self, op: Operation, origin: Origin) -> Result<(), GraphError>;

    /// Apply a locally originated operation.
    fn process(&mut self, op: Operation) -> Result<(), GraphError> {
        self.apply(op, Origin::Local)
    }
}

/// Value-level image of a graph, comparable across replicas.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GraphSnapshot {
    pub objects: BTreeMap<ObjectId, BTreeMap<String, Value>>,
    pub arrays: BTreeMap<ObjectId, Vec<Value>>,
}

/// Operation-log backed store of objects, properties and ordered arrays.
#[derive(Debug, Default)]
pub struct DocGraph {
    /// Objects in creation order, each with properties in first-set order.
    objects: IndexMap<ObjectId, IndexMap<String, Value>>,
    arrays: HashMap<ObjectId, Vec<Value>>,
    history: Vec<Operation>,
    listeners: Subscribers<Operation>,
}

impl DocGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph by replaying `history` from empty state.
    ///
    /// On failure returns the index of the offending operation.
    pub fn from_history<'a, I>(history: I) -> Result<Self, (usize, GraphError)>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut graph = Self::new();
        for (index, op) in history.into_iter().enumerate() {
            graph
                .apply(op.clone(), Origin::Replay)
                .map_err(|e| (index, e))?;
        }
        Ok(graph)
    }

    /// Register a listener fired once per applied operation, after mutation.
    pub fn on_change(
        &mut self,
        callback: impl FnMut(&Operation) + Send + 'static,
    ) -> SubscriptionId {
        self.listeners.subscribe(callback)
    }

    pub fn remove_listener(&mut self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn has_array(&self, id: &ObjectId) -> bool {
        self.arrays.contains_key(id)
    }

    pub fn property(&self, id: &ObjectId, key: &str) -> Option<&Value> {
        self.objects.get(id).and_then(|props| props.get(key))
    }

    pub fn has_property_value(&self, id: &ObjectId, key: &str) -> bool {
        self.property(id, key).is_some()
    }

    /// Property keys of an object, in first-set order. Empty for unknown ids.
    pub fn property_keys(&self, id: &ObjectId) -> Vec<&str> {
        self.objects
            .get(id)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn properties(&self, id: &ObjectId) -> Option<&IndexMap<String, Value>> {
        self.objects.get(id)
    }

    pub fn array_len(&self, id: &ObjectId) -> Option<usize> {
        self.arrays.get(id).map(Vec::len)
    }

    pub fn element_at(&self, id: &ObjectId, index: usize) -> Option<&Value> {
        self.arrays.get(id).and_then(|elems| elems.get(index))
    }

    pub fn elements(&self, id: &ObjectId) -> Option<&[Value]> {
        self.arrays.get(id).map(Vec::as_slice)
    }

    /// Position of the first element equal to `value`.
    pub fn index_of(&self, id: &ObjectId, value: &Value) -> Option<usize> {
        self.arrays
            .get(id)
            .and_then(|elems| elems.iter().position(|e| e == value))
    }

    /// First object (in creation order) whose `key` equals `value`.
    pub fn object_by_property(&self, key: &str, value: &Value) -> Option<&ObjectId> {
        self.objects
            .iter()
            .find(|(_, props)| props.get(key) == Some(value))
            .map(|(id, _)| id)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Every operation applied so far, in apply order.
    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            objects: self
                .objects
                .iter()
                .map(|(id, props)| {
                    let props = props.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (id.clone(), props)
                })
                .collect(),
            arrays: self
                .arrays
                .iter()
                .map(|(id, elems)| (id.clone(), elems.clone()))
                .collect(),
        }
    }

    /// Detached copy of the current state: no history, no listeners.
    pub fn fork(&self) -> DocGraph {
        DocGraph {
            objects: self.objects.clone(),
            arrays: self.arrays.clone(),
            ..DocGraph::default()
        }
    }

    // ─── Apply ────────────────────────────────────────────────────────

    fn validate(&self, op: &Operation) -> Result<(), GraphError> {
        match op {
            Operation::CreateObject { object } | Operation::CreateArray { object } => {
                if self.has_object(object) || self.has_array(object) {
                    return Err(GraphError::DuplicateId(object.clone()));
                }
            }
            Operation::SetProperty { object, .. } => {
                if !self.has_object(object) {
                    return Err(GraphError::MissingObject(object.clone()));
                }
            }
            Operation::InsertElement {
                object,
                after,
                index,
                ..
            } => {
                let elems = self
                    .arrays
                    .get(object)
                    .ok_or_else(|| GraphError::MissingArray(object.clone()))?;
                if insert_position(elems, after.as_ref(), *index).is_none() {
                    return Err(GraphError::MissingElement {
                        array: object.clone(),
                        element: after.clone().unwrap_or_default(),
                    });
                }
            }
            Operation::RemoveElement { object, index, .. } => {
                let len = self
                    .array_len(object)
                    .ok_or_else(|| GraphError::MissingArray(object.clone()))?;
                if *index >= len {
                    return Err(GraphError::IndexOutOfBounds {
                        array: object.clone(),
                        index: *index,
                        len,
                    });
                }
            }
        }
        Ok(())
    }

    /// Mutate state. Only called after `validate` succeeded.
    fn mutate(&mut self, op: &Operation) {
        match op {
            Operation::CreateObject { object } => {
                self.objects.insert(object.clone(), IndexMap::new());
            }
            Operation::CreateArray { object } => {
                self.arrays.insert(object.clone(), Vec::new());
            }
            Operation::SetProperty {
                object,
                name,
                value,
                ..
            } => {
                if let Some(props) = self.objects.get_mut(object) {
                    match value {
                        Some(v) if !v.is_null() => {
                            props.insert(name.clone(), v.clone());
                        }
                        _ => {
                            props.shift_remove(name);
                        }
                    }
                }
            }
            Operation::InsertElement {
                object,
                after,
                value,
                index,
            } => {
                if let Some(elems) = self.arrays.get_mut(object) {
                    if let Some(at) = insert_position(elems, after.as_ref(), *index) {
                        elems.insert(at, value.clone());
                    }
                }
            }
            Operation::RemoveElement { object, index, .. } => {
                if let Some(elems) = self.arrays.get_mut(object) {
                    elems.remove(*index);
                }
            }
        }
    }
}

/// Where an element inserted after `after` lands, `None` if the anchor is gone.
///
/// `hint` selects among equal anchors: when the element just before it
/// equals `after`, that occurrence wins over the first match.
fn insert_position(elems: &[Value], after: Option<&Value>, hint: Option<usize>) -> Option<usize> {
    let Some(after) = after.filter(|v| !is_head_anchor(v)) else {
        return Some(0);
    };
    if let Some(i) = hint.filter(|&i| i > 0) {
        if elems.get(i - 1) == Some(after) {
            return Some(i);
        }
    }
    elems.iter().position(|e| e == after).map(|i| i + 1)
}

impl OperationSink for DocGraph {
    fn graph(&self) -> &DocGraph {
        self
    }

    fn apply(&mut self, op: Operation, _origin: Origin) -> Result<(), GraphError> {
        self.validate(&op)?;
        self.mutate(&op);
        log::trace!("applied {} on {}", op.kind().as_str(), op.target());
        self.listeners.emit(&op);
        self.history.push(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    fn graph_with_array() -> DocGraph {
        let mut g = DocGraph::new();
        g.process(Operation::create_array(id("arr"))).unwrap();
        g
    }

    #[test]
    fn test_create_and_set() {
        let mut g = DocGraph::new();
        g.process(Operation::create_object(id("o"))).unwrap();
        g.process(Operation::set_property(id("o"), "type", Some(json!("root")), None))
            .unwrap();

        assert!(g.has_object(&id("o")));
        assert_eq!(g.property(&id("o"), "type"), Some(&json!("root")));
        assert_eq!(g.property_keys(&id("o")), vec!["type"]);
        assert_eq!(g.object_by_property("type", &json!("root")), Some(&id("o")));
    }

    #[test]
    fn test_set_on_missing_object_rejected() {
        let mut g = DocGraph::new();
        let err = g
            .process(Operation::set_property(id("ghost"), "k", Some(json!(1)), None))
            .unwrap_err();
        assert_eq!(err, GraphError::MissingObject(id("ghost")));
        assert!(g.history().is_empty());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let mut g = graph_with_array();
        assert_eq!(
            g.process(Operation::create_object(id("arr"))),
            Err(GraphError::DuplicateId(id("arr")))
        );
    }

    #[test]
    fn test_insert_after_and_head() {
        let mut g = graph_with_array();
        g.process(Operation::insert_element(id("arr"), None, json!("a"))).unwrap();
        g.process(Operation::insert_element(id("arr"), Some(json!("a")), json!("c")))
            .unwrap();
        g.process(Operation::insert_element(id("arr"), Some(json!("a")), json!("b")))
            .unwrap();
        g.process(Operation::insert_element(id("arr"), None, json!("z"))).unwrap();

        assert_eq!(
            g.elements(&id("arr")).unwrap(),
            &[json!("z"), json!("a"), json!("b"), json!("c")]
        );
        let prev = g.index_of(&id("arr"), &json!("a")).unwrap();
        assert_eq!(g.element_at(&id("arr"), prev + 1), Some(&json!("b")));
    }

    #[test]
    fn test_index_hint_picks_duplicate_anchor() {
        let mut g = graph_with_array();
        let arr = id("arr");
        g.process(Operation::insert_element(arr.clone(), None, json!("x"))).unwrap();
        g.process(Operation::insert_element(arr.clone(), Some(json!("x")), json!("a")))
            .unwrap();
        g.process(Operation::insert_element_at(arr.clone(), Some(json!("a")), json!("x"), 2))
            .unwrap();
        // [x, a, x]: anchor on the second x.
        g.process(Operation::insert_element_at(arr.clone(), Some(json!("x")), json!("b"), 3))
            .unwrap();
        assert_eq!(
            g.elements(&arr).unwrap(),
            &[json!("x"), json!("a"), json!("x"), json!("b")]
        );

        // A stale hint falls back to the first match.
        g.process(Operation::insert_element_at(arr.clone(), Some(json!("b")), json!("c"), 9))
            .unwrap();
        assert_eq!(g.element_at(&arr, 4), Some(&json!("c")));
        g.process(Operation::insert_element_at(arr.clone(), Some(json!("x")), json!("y"), 4))
            .unwrap();
        assert_eq!(g.element_at(&arr, 1), Some(&json!("y")));
    }

    #[test]
    fn test_fork_is_detached() {
        let mut g = graph_with_array();
        g.process(Operation::create_object(id("o"))).unwrap();
        let mut copy = g.fork();
        assert_eq!(copy.snapshot(), g.snapshot());
        assert!(copy.history().is_empty());

        copy.process(Operation::insert_element(id("arr"), None, json!("o"))).unwrap();
        assert_eq!(g.array_len(&id("arr")), Some(0));
    }

    #[test]
    fn test_insert_after_missing_element_rejected() {
        let mut g = graph_with_array();
        let err = g
            .process(Operation::insert_element(id("arr"), Some(json!("nope")), json!("x")))
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingElement { .. }));
        assert_eq!(g.array_len(&id("arr")), Some(0));
    }

    #[test]
    fn test_remove_out_of_bounds_rejected() {
        let mut g = graph_with_array();
        let err = g
            .process(Operation::remove_element(id("arr"), 0, None))
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::IndexOutOfBounds {
                array: id("arr"),
                index: 0,
                len: 0
            }
        );
    }

    #[test]
    fn test_clear_property() {
        let mut g = DocGraph::new();
        g.process(Operation::create_object(id("o"))).unwrap();
        g.process(Operation::set_property(id("o"), "k", Some(json!(1)), None)).unwrap();
        g.process(Operation::set_property(id("o"), "k", None, Some(json!(1)))).unwrap();
        assert!(!g.has_property_value(&id("o"), "k"));
        assert!(g.property_keys(&id("o")).is_empty());
    }

    #[test]
    fn test_listener_fires_after_mutation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut g = DocGraph::new();
        let s = seen.clone();
        g.on_change(move |op| s.lock().unwrap().push(op.kind()));

        g.process(Operation::create_object(id("o"))).unwrap();
        let _ = g.process(Operation::create_object(id("o")));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut g = graph_with_array();
        g.process(Operation::create_object(id("o"))).unwrap();
        g.process(Operation::insert_element(id("arr"), None, json!("o"))).unwrap();
        g.process(Operation::set_property(id("o"), "n", Some(json!(3)), None)).unwrap();

        let a = DocGraph::from_history(g.history()).unwrap();
        let b = DocGraph::from_history(g.history()).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot(), g.snapshot());
    }

    #[test]
    fn test_replay_reports_failing_index() {
        let history = vec![
            Operation::create_object(id("o")),
            Operation::set_property(id("missing"), "k", Some(json!(1)), None),
        ];
        let (index, err) = DocGraph::from_history(&history).unwrap_err();
        assert_eq!(index, 1);
        assert_eq!(err, GraphError::MissingObject(id("missing")));
    }
}
