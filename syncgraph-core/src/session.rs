//! One open document and its local editing pipeline.
//!
//! ```text
//!                    ┌──────────────────────────────────────────────┐
//!  commands() ──►    │ DocumentSession                              │
//!  accessor() ──►    │   apply(op, origin)                          │
//!  apply_remote ──►  │     ├─► EventCoalescer ─► DocGraph           │
//!                    │     │        ├─► on_raw_change  (sync, undo) │
//!                    │     │        └─► on_change      (per tick)   │
//!                    │     └─► UndoQueue.submit   (Local only)      │
//!                    └──────────────────────────────────────────────┘
//! ```
//!
//! Undo and redo push their operations back through the coalescer with
//! [`Origin::Undo`]/[`Origin::Redo`], so they are published like any
//! local edit but never re-recorded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::accessor::GraphAccessor;
use crate::coalescer::{ChangeBatch, EventCoalescer, RawChange};
use crate::command::CommandGenerator;
use crate::error::{GraphError, SessionError};
use crate::events::{SubscriptionId, Subscribers};
use crate::graph::{DocGraph, OperationSink};
use crate::id::{generate_doc_id, ObjectId};
use crate::operation::{Operation, Origin};
use crate::registry::DocumentKind;
use crate::selection::SelectionContext;
use crate::undo::{UndoConfig, UndoQueue};

/// Stored form of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub history: Vec<Operation>,
}

impl PersistedDocument {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Session-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A different document (or a fresh copy of this one) is now open.
    DocumentSwapped { doc_id: String },
    Saved { doc_id: String },
    ConnectionChanged { connected: bool },
}

pub struct DocumentSession {
    doc_id: String,
    kind: Arc<dyn DocumentKind>,
    coalescer: EventCoalescer,
    undo: UndoQueue,
    selection: SelectionContext,
    events: Subscribers<SessionEvent>,
    connected: bool,
}

impl DocumentSession {
    fn with_graph(kind: Arc<dyn DocumentKind>, doc_id: String, graph: DocGraph) -> Self {
        Self {
            doc_id,
            kind,
            coalescer: EventCoalescer::new(graph),
            undo: UndoQueue::default(),
            selection: SelectionContext::new(),
            events: Subscribers::new(),
            connected: true,
        }
    }

    /// A document holding only an empty root, under a fresh id.
    pub fn new_empty(kind: Arc<dyn DocumentKind>) -> Result<Self, GraphError> {
        let mut graph = DocGraph::new();
        kind.make_empty_root(&mut graph)?;
        Ok(Self::with_graph(kind, generate_doc_id(), graph))
    }

    /// A new document with the kind's starter content.
    pub fn new_document(kind: Arc<dyn DocumentKind>) -> Result<Self, GraphError> {
        let mut graph = DocGraph::new();
        let root = kind.make_empty_root(&mut graph)?;
        kind.populate(&mut graph, &root)?;
        Ok(Self::with_graph(kind, generate_doc_id(), graph))
    }

    /// Rebuild a session by replaying a stored history.
    pub fn from_persisted(
        kind: Arc<dyn DocumentKind>,
        payload: &PersistedDocument,
    ) -> Result<Self, SessionError> {
        if payload.doc_type != kind.doc_type() {
            return Err(SessionError::DocTypeMismatch {
                expected: kind.doc_type().to_string(),
                found: payload.doc_type.clone(),
            });
        }
        let graph = DocGraph::from_history(&payload.history)
            .map_err(|(index, source)| SessionError::Replay { index, source })?;
        log::debug!(
            "replayed {} operations for {}",
            payload.history.len(),
            payload.id
        );
        Ok(Self::with_graph(kind, payload.id.clone(), graph))
    }

    pub fn to_persisted(&self) -> PersistedDocument {
        PersistedDocument {
            id: self.doc_id.clone(),
            doc_type: self.kind.doc_type().to_string(),
            history: self.graph().history().to_vec(),
        }
    }

    pub fn with_undo_config(mut self, config: UndoConfig) -> Self {
        self.undo = UndoQueue::new(config);
        self
    }

    /// Take over `other`'s document, keeping this session's listeners.
    ///
    /// Undo history and selection are cleared.
    pub fn swap(&mut self, other: DocumentSession) {
        let DocumentSession {
            doc_id,
            kind,
            coalescer,
            ..
        } = other;
        self.coalescer.replace_graph(coalescer.into_graph());
        self.doc_id = doc_id;
        self.kind = kind;
        self.undo.clear();
        self.selection.clear();
        log::info!("document swapped in: {}", self.doc_id);
        self.events.emit(&SessionEvent::DocumentSwapped {
            doc_id: self.doc_id.clone(),
        });
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn doc_type(&self) -> &str {
        self.kind.doc_type()
    }

    pub fn kind(&self) -> Arc<dyn DocumentKind> {
        Arc::clone(&self.kind)
    }

    /// The root object, found by its type marker.
    pub fn root(&self) -> Option<ObjectId> {
        self.kind.find_root(self.graph())
    }

    pub fn root_children(&mut self) -> Vec<ObjectId> {
        match self.root() {
            Some(root) => GraphAccessor::new(self).children_of(&root),
            None => Vec::new(),
        }
    }

    pub fn accessor(&mut self) -> GraphAccessor<'_, Self> {
        GraphAccessor::new(self)
    }

    pub fn commands(&mut self) -> CommandGenerator<'_, Self> {
        CommandGenerator::new(self)
    }

    pub fn selection(&self) -> &SelectionContext {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut SelectionContext {
        &mut self.selection
    }

    pub fn undo_queue(&self) -> &UndoQueue {
        &self.undo
    }

    pub fn coalescer(&self) -> &EventCoalescer {
        &self.coalescer
    }

    // ─── Events ───────────────────────────────────────────────────────

    pub fn on_change(
        &mut self,
        callback: impl FnMut(&ChangeBatch) + Send + 'static,
    ) -> SubscriptionId {
        self.coalescer.on_change(callback)
    }

    pub fn on_raw_change(
        &mut self,
        callback: impl FnMut(&RawChange) + Send + 'static,
    ) -> SubscriptionId {
        self.coalescer.on_raw_change(callback)
    }

    pub fn on_session_event(
        &mut self,
        callback: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    pub fn remove_listener(&mut self, id: SubscriptionId) -> bool {
        self.coalescer.remove_listener(id) || self.events.unsubscribe(id)
    }

    pub fn mark_saved(&mut self) {
        self.events.emit(&SessionEvent::Saved {
            doc_id: self.doc_id.clone(),
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Record the sync connection state. Fires only on change.
    pub fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.events
                .emit(&SessionEvent::ConnectionChanged { connected });
        }
    }

    pub fn toggle_connected(&mut self) -> bool {
        let next = !self.connected;
        self.set_connected(next);
        next
    }

    // ─── Pipeline ─────────────────────────────────────────────────────

    pub fn apply_remote(&mut self, op: Operation) -> Result<(), GraphError> {
        self.apply(op, Origin::Remote)
    }

    pub fn undo(&mut self) -> Result<bool, GraphError> {
        self.undo.undo(&mut self.coalescer).inspect_err(|e| {
            log::error!("undo failed on {}: {e}", self.doc_id);
        })
    }

    pub fn redo(&mut self) -> Result<bool, GraphError> {
        self.undo.redo(&mut self.coalescer).inspect_err(|e| {
            log::error!("redo failed on {}: {e}", self.doc_id);
        })
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// End the current undo unit.
    pub fn boundary(&mut self) {
        self.undo.boundary();
    }

    /// Deliver pending coalesced changes. Returns whether anything fired.
    pub fn tick(&mut self) -> bool {
        self.coalescer.tick()
    }

    pub fn pause_queue(&mut self) {
        self.coalescer.pause();
    }

    pub fn unpause_queue(&mut self) {
        self.coalescer.unpause();
    }
}

impl OperationSink for DocumentSession {
    fn graph(&self) -> &DocGraph {
        self.coalescer.graph()
    }

    fn apply(&mut self, op: Operation, origin: Origin) -> Result<(), GraphError> {
        let record = (origin == Origin::Local).then(|| op.clone());
        self.coalescer.apply(op, origin)?;
        if let Some(op) = record {
            self.undo.submit(op);
        }
        Ok(())
    }
}

impl fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSession")
            .field("doc_id", &self.doc_id)
            .field("doc_type", &self.kind.doc_type())
            .field("operations", &self.graph().history().len())
            .field("connected", &self.connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GraphMutations;
    use crate::registry::{Editor360Document, VrDocument};
    use serde_json::json;
    use std::sync::Mutex;

    fn vr() -> Arc<dyn DocumentKind> {
        Arc::new(VrDocument)
    }

    fn session() -> DocumentSession {
        DocumentSession::new_empty(vr())
            .unwrap()
            .with_undo_config(UndoConfig::for_testing())
    }

    #[test]
    fn test_new_empty_has_childless_root() {
        let mut s = session();
        assert!(s.doc_id().starts_with("doc_"));
        assert!(s.root().is_some());
        assert!(s.root_children().is_empty());
        assert!(!s.can_undo());
    }

    #[test]
    fn test_new_document_populates() {
        let mut s = DocumentSession::new_document(Arc::new(Editor360Document)).unwrap();
        assert_eq!(s.doc_type(), "360");
        assert_eq!(s.root_children().len(), 1);
    }

    #[test]
    fn test_local_edits_are_undoable_remote_are_not() {
        let mut s = session();
        let root = s.root().unwrap();
        s.set_property(&root, "title", "mine").unwrap();
        s.boundary();
        s.apply_remote(Operation::set_property(
            root.clone(),
            "color",
            Some(json!("red")),
            None,
        ))
        .unwrap();

        assert!(s.undo().unwrap());
        assert_eq!(s.graph().property(&root, "title"), Some(&json!("root")));
        assert_eq!(s.graph().property(&root, "color"), Some(&json!("red")));
        assert!(!s.undo().unwrap());
        assert!(s.redo().unwrap());
        assert_eq!(s.graph().property(&root, "title"), Some(&json!("mine")));
    }

    #[test]
    fn test_raw_stream_tags_undo() {
        let mut s = session();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let o = origins.clone();
        s.on_raw_change(move |c| o.lock().unwrap().push(c.origin));

        let root = s.root().unwrap();
        s.commands().set_property(&root, "title", "x").unwrap();
        s.undo().unwrap();
        assert_eq!(*origins.lock().unwrap(), vec![Origin::Local, Origin::Undo]);
    }

    #[test]
    fn test_persisted_roundtrip() {
        let mut s = session();
        let root = s.root().unwrap();
        let arr = s.create_array().unwrap();
        s.set_property(&root, "extra", &arr).unwrap();

        let payload = s.to_persisted();
        assert_eq!(payload.doc_type, "vr");
        let bytes = payload.to_json().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"vr\""));

        let restored =
            DocumentSession::from_persisted(vr(), &PersistedDocument::from_json(&bytes).unwrap())
                .unwrap();
        assert_eq!(restored.doc_id(), s.doc_id());
        assert_eq!(restored.graph().snapshot(), s.graph().snapshot());
        assert!(!restored.can_undo());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let payload = session().to_persisted();
        let err = DocumentSession::from_persisted(Arc::new(Editor360Document), &payload)
            .unwrap_err();
        assert!(matches!(err, SessionError::DocTypeMismatch { .. }));
    }

    #[test]
    fn test_corrupt_history_reports_index() {
        let payload = PersistedDocument {
            id: "doc_x".into(),
            doc_type: "vr".into(),
            history: vec![Operation::set_property(
                ObjectId::new("ghost"),
                "k",
                Some(json!(1)),
                None,
            )],
        };
        let err = DocumentSession::from_persisted(vr(), &payload).unwrap_err();
        assert!(matches!(err, SessionError::Replay { index: 0, .. }));
    }

    #[test]
    fn test_swap_keeps_listeners_and_clears_state() {
        let mut s = session();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        s.on_session_event(move |ev| e.lock().unwrap().push(ev.clone()));
        let batches = Arc::new(Mutex::new(0));
        let b = batches.clone();
        s.on_change(move |_| *b.lock().unwrap() += 1);

        let root = s.root().unwrap();
        s.set_property(&root, "title", "old").unwrap();
        s.selection_mut().set(root.clone());

        let other = DocumentSession::new_empty(vr()).unwrap();
        let other_id = other.doc_id().to_string();
        s.swap(other);

        assert_eq!(s.doc_id(), other_id);
        assert!(!s.can_undo());
        assert!(s.selection().selection().is_empty());
        assert!(!s.tick());

        let new_root = s.root().unwrap();
        s.set_property(&new_root, "title", "new").unwrap();
        assert!(s.tick());
        assert_eq!(*batches.lock().unwrap(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![SessionEvent::DocumentSwapped { doc_id: other_id }]
        );
    }

    #[test]
    fn test_connection_events_fire_on_change() {
        let mut s = session();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        s.on_session_event(move |ev| e.lock().unwrap().push(ev.clone()));

        s.set_connected(true);
        assert!(!s.toggle_connected());
        s.mark_saved();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SessionEvent::ConnectionChanged { connected: false });
    }

    #[test]
    fn test_pause_queue_holds_coalesced() {
        let mut s = session();
        let root = s.root().unwrap();
        s.pause_queue();
        s.set_property(&root, "title", "a").unwrap();
        assert!(!s.tick());
        s.unpause_queue();
        assert!(s.tick());
    }
}
