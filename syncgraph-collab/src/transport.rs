//! Pub/sub channel abstraction used by the sync wrapper.
//!
//! A [`Transport`] joins one document channel, publishes operation batches
//! and hands back a receiver of batches published by other peers, already
//! in channel order. Joining with a [`Cursor`] first delivers what was
//! published since that position. Two implementations exist:
//!
//! - [`LocalTransport`]: in-process, over a shared [`LocalHub`]; the hub
//!   can be taken offline to simulate outages
//! - [`SyncClient`](crate::client::SyncClient): WebSocket connection to a
//!   [`SyncServer`](crate::server::SyncServer)

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use syncgraph_core::Operation;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{Cursor, MessageType, OperationBatch, PeerInfo, ProtocolError, SyncMessage};

/// Operations published by another peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBatch {
    pub seq: u64,
    pub peer_id: Uuid,
    pub operations: Vec<Operation>,
}

/// A joined channel.
///
/// `incoming` is unbounded: delivery never waits on the application, so
/// acks and pongs are read while remote batches pile up undrained.
#[derive(Debug)]
pub struct Subscription {
    pub incoming: mpsc::UnboundedReceiver<RemoteBatch>,
    /// Position after which every batch arrives on `incoming`.
    pub cursor: Cursor,
    /// False when batches published since the requested resume point
    /// could not all be delivered.
    pub caught_up: bool,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for the relay")]
    Timeout,

    #[error("relay rejected the request: {0}")]
    Rejected(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A document-scoped publish/subscribe channel.
pub trait Transport: Send {
    /// Join `doc_id`'s channel. Batches from other peers arrive on the
    /// returned receiver in channel order, starting after `resume` when
    /// given, or after the channel's current position otherwise.
    fn connect(
        &mut self,
        doc_id: &str,
        resume: Option<Cursor>,
    ) -> impl Future<Output = Result<Subscription, TransportError>> + Send;

    /// Publish a batch; resolves to its channel sequence number.
    fn publish(
        &mut self,
        batch: &OperationBatch,
    ) -> impl Future<Output = Result<u64, TransportError>> + Send;

    /// Leave the channel. Idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    fn is_connected(&self) -> bool;
}

/// Forward sequenced `Operations` from a room receiver, skipping our own.
pub(crate) fn decode_remote(bytes: &[u8], me: Uuid) -> Option<RemoteBatch> {
    let msg = SyncMessage::decode(bytes).ok()?;
    if msg.peer_id == me || msg.msg_type != MessageType::Operations {
        return None;
    }
    match msg.batch() {
        Ok(batch) => Some(RemoteBatch {
            seq: msg.seq,
            peer_id: msg.peer_id,
            operations: batch.operations,
        }),
        Err(e) => {
            log::warn!("dropping undecodable batch seq={}: {e}", msg.seq);
            None
        }
    }
}

// ─── In-process hub ──────────────────────────────────────────────────

/// A record of one batch accepted by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedBatch {
    pub doc_id: String,
    pub seq: u64,
    pub peer_id: Uuid,
    pub batch: OperationBatch,
}

/// Shared in-process channel for [`LocalTransport`]s.
pub struct LocalHub {
    rooms: RoomManager,
    online: AtomicBool,
    published: Mutex<Vec<PublishedBatch>>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            rooms: RoomManager::new(capacity),
            online: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Toggle availability. While offline, connects and publishes fail.
    pub fn set_online(&self, online: bool) {
        log::info!("local hub {}", if online { "online" } else { "offline" });
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Every accepted batch, in acceptance order.
    pub async fn published(&self) -> Vec<PublishedBatch> {
        self.published.lock().await.clone()
    }

    /// Operations accepted for `doc_id`, flattened in order.
    pub async fn published_operations(&self, doc_id: &str) -> Vec<Operation> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|p| p.doc_id == doc_id)
            .flat_map(|p| p.batch.operations.iter().cloned())
            .collect()
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }
}

/// [`Transport`] over a [`LocalHub`].
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    peer: PeerInfo,
    room: Option<Arc<BroadcastGroup>>,
    forwarder: Option<JoinHandle<()>>,
}

impl LocalTransport {
    pub fn new(hub: Arc<LocalHub>, peer: PeerInfo) -> Self {
        Self {
            hub,
            peer,
            room: None,
            forwarder: None,
        }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer
    }
}

impl Transport for LocalTransport {
    async fn connect(
        &mut self,
        doc_id: &str,
        resume: Option<Cursor>,
    ) -> Result<Subscription, TransportError> {
        self.disconnect().await;
        if !self.hub.is_online() {
            return Err(TransportError::Connect("hub offline".into()));
        }

        let epoch = self.hub.rooms.epoch();
        let since = resume.map(|c| if c.epoch == epoch { c.seq } else { 0 });
        let room = self.hub.rooms.get_or_create(doc_id).await;
        let joined = room.join(self.peer.clone(), since).await;
        let caught_up = joined.caught_up && resume.map_or(true, |c| c.epoch == epoch);
        let (tx, out) = mpsc::unbounded_channel();
        let me = self.peer.peer_id;
        for frame in &joined.replay {
            if let Some(batch) = decode_remote(frame, me) {
                let _ = tx.send(batch);
            }
        }

        let mut rx = joined.rx;
        let lag_room = room.clone();
        self.forwarder = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => {
                        if let Some(batch) = decode_remote(&bytes, me) {
                            if tx.send(batch).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("peer {me} lagged, {n} messages skipped");
                        lag_room.record_dropped(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        self.room = Some(room);
        log::debug!(
            "peer {} joined {doc_id}, {} batches replayed",
            self.peer.name,
            joined.replay.len()
        );
        Ok(Subscription {
            incoming: out,
            cursor: Cursor {
                epoch,
                seq: joined.resume_from,
            },
            caught_up,
        })
    }

    async fn publish(&mut self, batch: &OperationBatch) -> Result<u64, TransportError> {
        let room = self.room.as_ref().ok_or(TransportError::NotConnected)?;
        if !self.hub.is_online() {
            return Err(TransportError::ConnectionClosed);
        }
        let accepted = room.publish(self.peer.peer_id, batch).await?;
        if !accepted.duplicate {
            self.hub.published.lock().await.push(PublishedBatch {
                doc_id: room.doc_id().to_string(),
                seq: accepted.seq,
                peer_id: self.peer.peer_id,
                batch: batch.clone(),
            });
        }
        Ok(accepted.seq)
    }

    async fn disconnect(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        if let Some(room) = self.room.take() {
            room.remove_peer(&self.peer.peer_id).await;
            self.hub.rooms.remove_if_empty(room.doc_id()).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.room.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncgraph_core::ObjectId;
    use tokio::time::{timeout, Duration};

    fn batch(id: u64) -> OperationBatch {
        OperationBatch::new(id, vec![Operation::create_array(ObjectId::new(format!("arr_{id}")))])
    }

    #[tokio::test]
    async fn test_publish_reaches_other_peers_only() {
        let hub = LocalHub::new(64);
        let mut a = LocalTransport::new(hub.clone(), PeerInfo::new("a"));
        let mut b = LocalTransport::new(hub.clone(), PeerInfo::new("b"));
        let mut rx_a = a.connect("doc", None).await.unwrap().incoming;
        let mut rx_b = b.connect("doc", None).await.unwrap().incoming;

        assert_eq!(a.publish(&batch(1)).await.unwrap(), 1);
        let got = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.seq, 1);
        assert_eq!(got.peer_id, a.peer_info().peer_id);

        // No echo of our own batch.
        assert!(timeout(Duration::from_millis(50), rx_a.recv()).await.is_err());
        assert_eq!(hub.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let hub = LocalHub::new(64);
        let mut a = LocalTransport::new(hub, PeerInfo::new("a"));
        assert!(matches!(
            a.publish(&batch(1)).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_outage_fails_publish_and_connect() {
        let hub = LocalHub::new(64);
        let mut a = LocalTransport::new(hub.clone(), PeerInfo::new("a"));
        let _sub = a.connect("doc", None).await.unwrap();

        hub.set_online(false);
        assert!(matches!(
            a.publish(&batch(1)).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(a.connect("doc", None).await.is_err());
        assert!(!a.is_connected());

        hub.set_online(true);
        let _sub = a.connect("doc", None).await.unwrap();
        assert_eq!(a.publish(&batch(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_delivers_missed_batches() {
        let hub = LocalHub::new(64);
        let mut a = LocalTransport::new(hub.clone(), PeerInfo::new("a"));
        let mut b = LocalTransport::new(hub.clone(), PeerInfo::new("b"));
        let _sub_a = a.connect("doc", None).await.unwrap();
        let sub = b.connect("doc", None).await.unwrap();
        assert_eq!(sub.cursor.seq, 0);
        assert!(sub.caught_up);

        a.publish(&batch(1)).await.unwrap();
        b.disconnect().await;
        a.publish(&batch(2)).await.unwrap();
        a.publish(&batch(3)).await.unwrap();

        let resume = Cursor {
            epoch: sub.cursor.epoch,
            seq: 1,
        };
        let mut sub = b.connect("doc", Some(resume)).await.unwrap();
        assert!(sub.caught_up);
        assert_eq!(sub.cursor.seq, 1);
        let seqs = [
            sub.incoming.recv().await.unwrap().seq,
            sub.incoming.recv().await.unwrap().seq,
        ];
        assert_eq!(seqs, [2, 3]);

        // A cursor from another run cannot be trusted.
        let foreign = Cursor {
            epoch: Uuid::new_v4(),
            seq: 3,
        };
        let sub = b.connect("doc", Some(foreign)).await.unwrap();
        assert!(!sub.caught_up);
        assert_eq!(sub.cursor.seq, 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_empty_room() {
        let hub = LocalHub::new(64);
        let mut a = LocalTransport::new(hub.clone(), PeerInfo::new("a"));
        let _sub = a.connect("doc", None).await.unwrap();
        assert_eq!(hub.rooms().room_count().await, 1);
        a.disconnect().await;
        a.disconnect().await;
        assert_eq!(hub.rooms().room_count().await, 0);
    }
}
