//! # syncgraph-core — Replicated document graph
//!
//! An operation-log backed graph of objects, properties and ordered
//! arrays, plus the local editing pipeline built on top of it.
//!
//! ## Architecture
//!
//! ```text
//!   UI edit
//!     │
//!     ▼
//! ┌──────────────────┐   Operation   ┌────────────────┐   ┌───────────┐
//! │ CommandGenerator │ ────────────► │ EventCoalescer │ ─►│ DocGraph  │
//! │ / GraphAccessor  │               └──┬──────────┬──┘   └───────────┘
//! └──────────────────┘      raw stream  │          │ coalesced (per tick)
//!                                       ▼          ▼
//!                              UndoQueue, sync      views
//! ```
//!
//! ## Modules
//!
//! - [`graph`] — `DocGraph`, the single source of truth
//! - [`operation`] — wire shape of mutations and their origin tags
//! - [`command`] — high-level edits → operations
//! - [`coalescer`] — raw vs. per-tick change streams
//! - [`undo`] — grouped, invertible units
//! - [`accessor`] — object handles for UI code
//! - [`registry`] — object and document kinds
//! - [`session`] — one open document wired end to end

pub mod accessor;
pub mod coalescer;
pub mod command;
pub mod error;
pub mod events;
pub mod graph;
pub mod id;
pub mod operation;
pub mod registry;
pub mod selection;
pub mod session;
pub mod undo;

pub use accessor::{GraphAccessor, ObjectHandle, ObjectRef};
pub use coalescer::{ChangeBatch, EventCoalescer, RawChange};
pub use command::{CommandGenerator, GraphMutations};
pub use error::{GraphError, SessionError};
pub use events::{SubscriptionId, Subscribers};
pub use graph::{DocGraph, GraphSnapshot, OperationSink};
pub use id::{gen_id, generate_doc_id, ObjectId};
pub use operation::{OpKind, Operation, Origin};
pub use registry::{
    builtin_document, DocumentKind, Editor360Document, FamilyTreeDocument, KindRegistry,
    ObjectKind, PropertyUpdate, VrDocument,
};
pub use selection::{SelectionChanged, SelectionContext};
pub use session::{DocumentSession, PersistedDocument, SessionEvent};
pub use undo::{UndoConfig, UndoQueue, UndoUnit};
