//! Opening, saving and reloading documents against a [`DocumentStore`].
//!
//! `load_document` falls back to a fresh empty document when the id is
//! missing or names a document of another type, and logs why. A stored
//! history that no longer replays is an error: handing out an empty
//! document in its place would lose the stored one. `reload_document`
//! surfaces every failure, leaving the open session untouched.

use std::sync::Arc;
use syncgraph_core::{DocumentKind, DocumentSession, GraphError, SessionError};
use thiserror::Error;

use crate::storage::{DocumentStore, StoreError};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

fn fetch(
    store: &dyn DocumentStore,
    kind: Arc<dyn DocumentKind>,
    doc_id: &str,
) -> Result<DocumentSession, DocumentError> {
    let payload = store
        .load(doc_id)?
        .ok_or_else(|| DocumentError::NotFound(doc_id.to_string()))?;
    Ok(DocumentSession::from_persisted(kind, &payload)?)
}

/// Open `doc_id`, or a new empty document if there is none of this type.
pub fn load_document(
    store: &dyn DocumentStore,
    kind: Arc<dyn DocumentKind>,
    doc_id: &str,
) -> Result<DocumentSession, DocumentError> {
    match fetch(store, kind.clone(), doc_id) {
        Ok(session) => {
            log::info!("loaded {doc_id} ({})", kind.doc_type());
            Ok(session)
        }
        Err(DocumentError::NotFound(_)) => {
            let session = DocumentSession::new_empty(kind)?;
            log::info!("{doc_id} not found, created {}", session.doc_id());
            Ok(session)
        }
        Err(e @ DocumentError::Session(SessionError::DocTypeMismatch { .. })) => {
            let session = DocumentSession::new_empty(kind)?;
            log::warn!("could not open {doc_id} ({e}), created {}", session.doc_id());
            Ok(session)
        }
        Err(e) => {
            log::error!("stored {doc_id} does not replay: {e}");
            Err(e)
        }
    }
}

/// Replace the stored payload with the session's full history.
pub fn save_document(
    store: &dyn DocumentStore,
    session: &mut DocumentSession,
) -> Result<(), DocumentError> {
    let payload = session.to_persisted();
    store.save(&payload)?;
    log::debug!("saved {} ({} ops)", payload.id, payload.history.len());
    session.mark_saved();
    Ok(())
}

/// Re-read the session's document from the store and swap it in.
pub fn reload_document(
    store: &dyn DocumentStore,
    session: &mut DocumentSession,
) -> Result<(), DocumentError> {
    let fresh = fetch(store, session.kind(), session.doc_id())?;
    session.swap(fresh);
    Ok(())
}
