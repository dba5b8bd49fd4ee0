//! Persistence integration tests.
//!
//! Verifies:
//! - Document save/load roundtrip through the RocksDB store
//! - Restart recovery: drop the store, reopen, history survives
//! - Relayed batches land in the store behind a running server
//! - Multi-document isolation

use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::Duration;

use syncgraph_collab::client::{ClientConfig, SyncClient};
use syncgraph_collab::protocol::PeerInfo;
use syncgraph_collab::server::{ServerConfig, SyncServer};
use syncgraph_collab::storage::{DocumentStore, RocksStore, StoreConfig};
use syncgraph_collab::sync::{SyncConfig, SyncWrapper};
use syncgraph_collab::{load_document, reload_document, save_document};
use syncgraph_core::{
    DocumentKind, DocumentSession, FamilyTreeDocument, GraphMutations, KindRegistry, Operation,
    OperationSink, VrDocument,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn vr() -> Arc<dyn DocumentKind> {
    Arc::new(VrDocument)
}

fn open_store(path: &std::path::Path) -> RocksStore {
    RocksStore::open(StoreConfig::for_testing(path)).unwrap()
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ─── Document Save/Load Roundtrip ────────────────────────────────────────────

#[test]
fn test_document_roundtrip_via_store() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let mut session = DocumentSession::new_document(vr()).unwrap();
    let root = session.root().unwrap();
    let cube = KindRegistry::with_builtin()
        .make(&mut session, "cube", &root)
        .unwrap()
        .unwrap();
    session.set_property(&cube, "ty", 1.5).unwrap();
    save_document(&store, &mut session).unwrap();

    let meta = store.metadata(session.doc_id()).unwrap().unwrap();
    assert_eq!(meta.doc_type, "vr");
    assert_eq!(meta.op_count as usize, session.graph().history().len());
    assert_eq!(meta.chunk_count, 1);

    let mut loaded = load_document(&store, vr(), session.doc_id()).unwrap();
    assert_eq!(loaded.graph().snapshot(), session.graph().snapshot());
    assert!(loaded.root_children().contains(&cube));
}

#[test]
fn test_missing_document_opens_empty_root() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let mut session = load_document(&store, vr(), "doc_nowhere").unwrap();
    assert_ne!(session.doc_id(), "doc_nowhere");
    assert!(session.root_children().is_empty());
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn test_wrong_document_type_is_not_opened() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut tree = DocumentSession::new_document(Arc::new(FamilyTreeDocument)).unwrap();
    save_document(&store, &mut tree).unwrap();

    let session = load_document(&store, vr(), tree.doc_id()).unwrap();
    assert_ne!(session.doc_id(), tree.doc_id());
    assert_eq!(session.doc_type(), "vr");
}

// ─── Restart Recovery ────────────────────────────────────────────────────────

#[test]
fn test_appended_history_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    // Phase 1: save and append, then drop the store
    let (doc_id, root, expected) = {
        let store = open_store(&db_path);
        let mut session = DocumentSession::new_empty(vr()).unwrap();
        save_document(&store, &mut session).unwrap();
        let root = session.root().unwrap();

        for i in 0..5 {
            let op = Operation::set_property(root.clone(), "title", Some(json!(i)), None);
            session.apply_remote(op.clone()).unwrap();
            let len = store.append(session.doc_id(), &[op]).unwrap();
            assert_eq!(len, session.graph().history().len());
        }
        (
            session.doc_id().to_string(),
            root,
            session.graph().snapshot(),
        )
    };

    // Phase 2: reopen and recover
    let store = open_store(&db_path);
    assert_eq!(store.list().unwrap(), vec![doc_id.clone()]);
    assert_eq!(store.metadata(&doc_id).unwrap().unwrap().chunk_count, 6);

    let session = load_document(&store, vr(), &doc_id).unwrap();
    assert_eq!(session.doc_id(), doc_id);
    assert_eq!(session.graph().snapshot(), expected);
    assert_eq!(session.graph().property(&root, "title"), Some(&json!(4)));
}

#[test]
fn test_save_after_appends_compacts_to_one_chunk() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mut session = DocumentSession::new_empty(vr()).unwrap();
    save_document(&store, &mut session).unwrap();
    let root = session.root().unwrap();

    for v in ["a", "b", "c"] {
        session.set_property(&root, "title", v).unwrap();
        let op = session.graph().history().last().cloned().unwrap();
        store.append(session.doc_id(), &[op]).unwrap();
    }
    assert_eq!(store.metadata(session.doc_id()).unwrap().unwrap().chunk_count, 4);

    save_document(&store, &mut session).unwrap();
    let meta = store.metadata(session.doc_id()).unwrap().unwrap();
    assert_eq!(meta.chunk_count, 1);
    assert_eq!(meta.op_count as usize, session.graph().history().len());

    let before = session.graph().snapshot();
    reload_document(&store, &mut session).unwrap();
    assert_eq!(session.graph().snapshot(), before);
}

// ─── Multi-Document Isolation ────────────────────────────────────────────────

#[test]
fn test_multi_document_isolation() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let mut a = DocumentSession::new_document(vr()).unwrap();
    let mut b = DocumentSession::new_document(Arc::new(FamilyTreeDocument)).unwrap();
    save_document(&store, &mut a).unwrap();
    save_document(&store, &mut b).unwrap();

    let root_a = a.root().unwrap();
    let op = Operation::set_property(root_a, "title", Some(json!("only a")), None);
    a.apply_remote(op.clone()).unwrap();
    store.append(a.doc_id(), &[op]).unwrap();

    let mut ids = vec![a.doc_id().to_string(), b.doc_id().to_string()];
    ids.sort();
    assert_eq!(store.list().unwrap(), ids);

    let loaded_b = store.load(b.doc_id()).unwrap().unwrap();
    assert_eq!(loaded_b.history, b.graph().history());

    assert!(store.delete(a.doc_id()).unwrap());
    assert!(!store.delete(a.doc_id()).unwrap());
    assert!(store.load(a.doc_id()).unwrap().is_none());
    assert_eq!(store.list().unwrap(), vec![b.doc_id().to_string()]);
    assert_eq!(store.load(b.doc_id()).unwrap().unwrap().history, b.graph().history());
}

// ─── Server Integration ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_persistence_config() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::for_testing("127.0.0.1:0")
    };
    let server = SyncServer::new(config).unwrap();
    assert!(server.store().is_some());

    let stats = server.stats().await;
    assert_eq!(stats.persisted_batches, 0);
}

#[tokio::test]
async fn test_server_in_memory_mode_no_store() {
    let server = SyncServer::new(ServerConfig::for_testing("127.0.0.1:0")).unwrap();
    assert!(server.store().is_none());
}

#[tokio::test]
async fn test_server_persists_relayed_operations() {
    let dir = tempdir().unwrap();
    let port = free_port().await;
    let config = ServerConfig {
        storage_path: Some(dir.path().join("db")),
        ..ServerConfig::for_testing(format!("127.0.0.1:{port}"))
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let store = server.store().unwrap().clone();
    let mut session = DocumentSession::new_document(vr()).unwrap();
    save_document(store.as_ref(), &mut session).unwrap();

    let client = SyncClient::new(
        PeerInfo::new("Alice"),
        ClientConfig::for_testing(format!("ws://127.0.0.1:{port}")),
    );
    let mut sync = SyncWrapper::new(client, SyncConfig::for_testing());
    sync.attach(&mut session);
    sync.start().await.unwrap();

    let root = session.root().unwrap();
    let cube = KindRegistry::with_builtin()
        .make(&mut session, "cube", &root)
        .unwrap()
        .unwrap();
    session.set_property(&cube, "color", "#00ff00").unwrap();
    let sent = sync.flush().await.unwrap();
    assert!(sent > 0);

    let recovered = load_document(store.as_ref(), vr(), session.doc_id()).unwrap();
    assert_eq!(recovered.doc_id(), session.doc_id());
    assert_eq!(recovered.graph().snapshot(), session.graph().snapshot());

    let stats = server.stats().await;
    assert!(stats.persisted_batches >= 1);
    assert_eq!(stats.relayed_batches, stats.persisted_batches);
}
