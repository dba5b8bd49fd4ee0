//! # syncgraph-collab — Real-time sync and persistence for syncgraph documents
//!
//! Replicates a [`DocumentSession`](syncgraph_core::DocumentSession)'s
//! operation log through a relay that puts every batch into one order per
//! document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                    ┌─────────────┐
//! │ DocumentSession  │                    │ SyncServer  │
//! │   ▲        │raw  │     WebSocket      │ (relay)     │
//! │   │remote  ▼     │ ◄────────────────► │             │
//! │ SyncWrapper<T>   │    Binary Proto    └──────┬──────┘
//! └────────┬─────────┘                           │
//!          │ Transport                   ┌───────┴───────┐
//!          ├── SyncClient (ws)           │ BroadcastGroup│
//!          └── LocalTransport (hub)      │ (seq, fan-out)│
//!                                        └───────┬───────┘
//!                                                ▼
//!                                         DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Per-document rooms: sequencing and fan-out
//! - [`transport`] — The `Transport` seam and the in-process hub
//! - [`client`] — WebSocket transport
//! - [`sync`] — Backlog, pause and reconnect around a transport
//! - [`server`] — WebSocket relay
//! - [`storage`] — `DocumentStore` with memory and RocksDB backends
//! - [`loader`] — Load / save / reload flow

pub mod broadcast;
pub mod client;
pub mod loader;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ClientConfig, PeerEvent, SyncClient};
pub use loader::{load_document, reload_document, save_document, DocumentError};
pub use protocol::{
    Cursor, MessageType, OperationBatch, PeerInfo, ProtocolError, SyncMessage, Welcome,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError,
};
pub use sync::{ReconnectPolicy, SyncConfig, SyncState, SyncWrapper};
pub use transport::{
    ConnectionState, LocalHub, LocalTransport, PublishedBatch, RemoteBatch, Subscription,
    Transport, TransportError,
};
