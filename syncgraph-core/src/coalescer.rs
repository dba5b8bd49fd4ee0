//! Event coalescing between the graph and its consumers.
//!
//! ```text
//!                 ┌──────────────► on_raw_change  (every op, apply order)
//!   apply(op) ──► DocGraph ──┤
//!                 └──► pending ──tick()──► on_change (≤ 1 ChangeBatch per tick)
//! ```
//!
//! Pausing only holds back the coalesced stream. Raw changes keep
//! flowing so undo recording and replication never miss an operation.

use std::collections::BTreeSet;

use crate::error::GraphError;
use crate::events::{SubscriptionId, Subscribers};
use crate::graph::{DocGraph, OperationSink};
use crate::id::ObjectId;
use crate::operation::{Operation, Origin};

/// One applied operation, as seen on the raw stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub op: Operation,
    pub origin: Origin,
}

/// Coalesced UI-facing notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Operations since the previous batch, in apply order.
    pub operations: Vec<Operation>,
    /// At least one create/insert/remove happened.
    pub structure_changed: bool,
    /// At least one property was set or cleared.
    pub properties_changed: bool,
}

impl ChangeBatch {
    fn from_ops(operations: Vec<Operation>) -> Self {
        let structure_changed = operations.iter().any(|op| op.kind().is_structural());
        let properties_changed = operations.iter().any(|op| !op.kind().is_structural());
        Self {
            operations,
            structure_changed,
            properties_changed,
        }
    }

    /// Objects and arrays touched by this batch.
    pub fn touched(&self) -> BTreeSet<&ObjectId> {
        self.operations.iter().map(Operation::target).collect()
    }

    /// Whether `property` of `object` was set in this batch.
    pub fn touches_property(&self, object: &ObjectId, property: &str) -> bool {
        self.operations
            .iter()
            .any(|op| op.target() == object && op.property_name() == Some(property))
    }
}

/// Owns the graph and fans its changes out to raw and coalesced listeners.
#[derive(Debug, Default)]
pub struct EventCoalescer {
    graph: DocGraph,
    raw: Subscribers<RawChange>,
    coalesced: Subscribers<ChangeBatch>,
    pending: Vec<Operation>,
    paused: bool,
}

impl EventCoalescer {
    pub fn new(graph: DocGraph) -> Self {
        Self {
            graph,
            ..Self::default()
        }
    }

    /// Coalesced listener, fired from [`tick`](Self::tick).
    pub fn on_change(
        &mut self,
        callback: impl FnMut(&ChangeBatch) + Send + 'static,
    ) -> SubscriptionId {
        self.coalesced.subscribe(callback)
    }

    /// Uncoalesced listener, fired synchronously for every applied op.
    pub fn on_raw_change(
        &mut self,
        callback: impl FnMut(&RawChange) + Send + 'static,
    ) -> SubscriptionId {
        self.raw.subscribe(callback)
    }

    pub fn remove_listener(&mut self, id: SubscriptionId) -> bool {
        self.raw.unsubscribe(id) || self.coalesced.unsubscribe(id)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume coalesced notifications. Pending changes go out on the next tick.
    pub fn unpause(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Operations waiting for the next coalesced notification.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Update tick: fire one batch if anything changed and not paused.
    pub fn tick(&mut self) -> bool {
        if self.paused || self.pending.is_empty() {
            return false;
        }
        let batch = ChangeBatch::from_ops(std::mem::take(&mut self.pending));
        log::trace!("coalesced {} operations", batch.operations.len());
        self.coalesced.emit(&batch);
        true
    }

    pub fn into_graph(self) -> DocGraph {
        self.graph
    }

    /// Swap in another graph, keeping every listener. Pending changes of
    /// the old graph are dropped; the returned graph is the old one.
    pub fn replace_graph(&mut self, graph: DocGraph) -> DocGraph {
        self.pending.clear();
        std::mem::replace(&mut self.graph, graph)
    }
}

impl OperationSink for EventCoalescer {
    fn graph(&self) -> &DocGraph {
        &self.graph
    }

    fn apply(&mut self, op: Operation, origin: Origin) -> Result<(), GraphError> {
        self.graph.apply(op.clone(), origin)?;
        let change = RawChange { op, origin };
        self.raw.emit(&change);
        self.pending.push(change.op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GraphMutations;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn counting(c: &mut EventCoalescer) -> (Arc<Mutex<Vec<Operation>>>, Arc<Mutex<usize>>) {
        let raw = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(Mutex::new(0));
        let r = raw.clone();
        c.on_raw_change(move |change| r.lock().unwrap().push(change.op.clone()));
        let b = batches.clone();
        c.on_change(move |_| *b.lock().unwrap() += 1);
        (raw, batches)
    }

    #[test]
    fn test_many_raw_one_coalesced() {
        let mut c = EventCoalescer::default();
        let id = c.create_object([("tx", json!(0))]).unwrap();
        c.tick();
        let (raw, batches) = counting(&mut c);

        for i in 0..25 {
            c.set_property(&id, "tx", i).unwrap();
        }
        assert_eq!(raw.lock().unwrap().len(), 25);
        assert!(c.tick());
        assert!(!c.tick());
        assert_eq!(*batches.lock().unwrap(), 1);

        // Raw order equals apply order.
        assert_eq!(raw.lock().unwrap().as_slice(), &c.graph().history()[2..]);
    }

    #[test]
    fn test_pause_keeps_raw_stream() {
        let mut c = EventCoalescer::default();
        let (raw, batches) = counting(&mut c);

        c.pause();
        let arr = c.create_array().unwrap();
        c.insert_after(&arr, None, "x").unwrap();
        assert!(!c.tick());
        assert_eq!(raw.lock().unwrap().len(), 2);
        assert_eq!(*batches.lock().unwrap(), 0);
        assert_eq!(c.pending(), 2);

        c.unpause();
        assert_eq!(*batches.lock().unwrap(), 0);
        assert!(c.tick());
        assert_eq!(*batches.lock().unwrap(), 1);
    }

    #[test]
    fn test_rejected_ops_not_forwarded() {
        let mut c = EventCoalescer::default();
        let (raw, _) = counting(&mut c);
        assert!(c.set_property(&ObjectId::new("ghost"), "k", 1).is_err());
        assert!(raw.lock().unwrap().is_empty());
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_batch_classification() {
        let mut c = EventCoalescer::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        c.on_change(move |batch| s.lock().unwrap().push(batch.clone()));

        let id = c.create_object([("title", json!("a"))]).unwrap();
        c.tick();
        c.set_property(&id, "title", "b").unwrap();
        c.tick();

        let seen = seen.lock().unwrap();
        assert!(seen[0].structure_changed && seen[0].properties_changed);
        assert!(!seen[1].structure_changed && seen[1].properties_changed);
        assert!(seen[1].touches_property(&id, "title"));
        assert_eq!(seen[1].touched().len(), 1);
    }

    #[test]
    fn test_replace_graph_keeps_listeners() {
        let mut c = EventCoalescer::default();
        let (raw, _) = counting(&mut c);
        c.create_array().unwrap();

        let old = c.replace_graph(DocGraph::new());
        assert_eq!(old.history().len(), 1);
        assert_eq!(c.pending(), 0);
        c.create_array().unwrap();
        assert_eq!(raw.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_origin_carried_on_raw_stream() {
        let mut c = EventCoalescer::default();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let o = origins.clone();
        c.on_raw_change(move |change| o.lock().unwrap().push(change.origin));

        c.apply(Operation::create_object(ObjectId::new("r")), Origin::Remote)
            .unwrap();
        c.process(Operation::create_object(ObjectId::new("l"))).unwrap();
        assert_eq!(*origins.lock().unwrap(), vec![Origin::Remote, Origin::Local]);
    }
}
