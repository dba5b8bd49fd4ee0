//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (join handshake with resume, leave, close detection)
//! - Ack-awaiting publish with a timeout
//! - Delivery of other peers' batches as [`RemoteBatch`]es
//! - Peer presence notifications
//!
//! ```text
//!  publish(batch) ─► pending[batch_id] ─► writer task ─► ws
//!                          ▲                             │
//!                          └─ Ack / Welcome / Error ◄─ reader task ◄┘
//!                                              │
//!                           RemoteBatch ◄──────┘ (others' Operations, unbounded)
//! ```
//!
//! The reader never waits on the application: remote batches go to an
//! unbounded channel, so an ack is resolved as soon as its frame arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Cursor, MessageType, OperationBatch, PeerInfo, SyncMessage};
use crate::transport::{
    decode_remote, ConnectionState, RemoteBatch, Subscription, Transport, TransportError,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// How long to wait for the relay to acknowledge a join or a batch
    pub ack_timeout: Duration,
    /// Buffer size of the outgoing and presence channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            ack_timeout: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ack_timeout: Duration::from_secs(2),
            channel_capacity: 64,
        }
    }
}

/// Presence changes in the joined room.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Joined(PeerInfo),
    Left(Uuid),
}

/// The relay's answer to a request: the `Ack` or `Welcome` frame, or a
/// rejection reason.
type AckResult = Result<SyncMessage, String>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckResult>>>>;

/// The join handshake is acknowledged under this batch id.
const JOIN_ACK: u64 = 0;

/// WebSocket [`Transport`].
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,

    config: ClientConfig,

    /// Document we joined, if any
    doc_id: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Cleared by the reader task when the socket closes
    alive: Arc<AtomicBool>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Acks we are waiting for, by batch id
    pending: PendingAcks,

    reader: Option<JoinHandle<()>>,

    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Option<mpsc::Receiver<PeerEvent>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        Self {
            peer_info,
            config,
            doc_id: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            alive: Arc::new(AtomicBool::new(false)),
            outgoing_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            reader: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the presence event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.doc_id.as_deref()
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Send a heartbeat. The relay answers with `Pong`.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id).encode()?;
        self.send_raw(encoded).await
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(encoded)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Register interest in the ack for `id`, send `encoded` and wait.
    async fn request(&self, id: u64, encoded: Vec<u8>) -> Result<SyncMessage, TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, ack_tx);

        if let Err(e) = self.send_raw(encoded).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(reason))) => Err(TransportError::Rejected(reason)),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn spawn_reader<S>(&mut self, mut ws_reader: S, incoming: mpsc::UnboundedSender<RemoteBatch>)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
    {
        let me = self.peer_info.peer_id;
        let state = self.state.clone();
        let alive = self.alive.clone();
        let pending = self.pending.clone();
        let events = self.event_tx.clone();

        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let sync_msg = match SyncMessage::decode(&bytes) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("undecodable frame from relay: {e}");
                        continue;
                    }
                };

                match sync_msg.msg_type {
                    MessageType::Operations => {
                        if let Some(batch) = decode_remote(&bytes, me) {
                            if incoming.send(batch).is_err() {
                                log::debug!("remote batch receiver dropped");
                            }
                        }
                    }
                    MessageType::Ack => match sync_msg.acked_batch() {
                        Ok(id) => {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(Ok(sync_msg));
                            }
                        }
                        Err(e) => log::warn!("bad ack: {e}"),
                    },
                    MessageType::Welcome => {
                        if let Some(tx) = pending.lock().await.remove(&JOIN_ACK) {
                            let _ = tx.send(Ok(sync_msg));
                        }
                    }
                    MessageType::Error => {
                        let reason = sync_msg.error_reason().unwrap_or_default();
                        match pending.lock().await.remove(&sync_msg.seq) {
                            Some(tx) => {
                                let _ = tx.send(Err(reason));
                            }
                            None => log::warn!("relay error: {reason}"),
                        }
                    }
                    MessageType::PeerJoined if sync_msg.peer_id != me => {
                        if let Ok(info) = sync_msg.peer_info() {
                            let _ = events.try_send(PeerEvent::Joined(info));
                        }
                    }
                    MessageType::PeerLeft if sync_msg.peer_id != me => {
                        let _ = events.try_send(PeerEvent::Left(sync_msg.peer_id));
                    }
                    MessageType::Pong => log::trace!("pong"),
                    _ => {}
                }
            }

            // Connection lost
            alive.store(false, Ordering::Release);
            *state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails every in-flight request.
            pending.lock().await.clear();
            log::info!("relay connection closed for peer {me}");
        }));
    }
}

impl Transport for SyncClient {
    /// Open the socket, join `doc_id`'s room and wait for the relay to
    /// confirm the subscription. Batches the relay replays from `resume`
    /// are already queued on the returned receiver.
    async fn connect(
        &mut self,
        doc_id: &str,
        resume: Option<Cursor>,
    ) -> Result<Subscription, TransportError> {
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.config.server_url, doc_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the socket, then close it.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);
        self.alive.store(true, Ordering::Release);

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.spawn_reader(ws_reader, in_tx);

        let join = SyncMessage::join(&self.peer_info, doc_id, resume)?.encode()?;
        let welcome = self
            .request(JOIN_ACK, join)
            .await
            .and_then(|reply| Ok(reply.welcome_info()?));
        match welcome {
            Ok(welcome) => {
                self.doc_id = Some(doc_id.to_string());
                *self.state.write().await = ConnectionState::Connected;
                log::info!(
                    "peer {} joined {doc_id} at seq {}, resuming after {}",
                    self.peer_info.name,
                    welcome.last_seq,
                    welcome.resume_from
                );
                Ok(Subscription {
                    incoming: in_rx,
                    cursor: Cursor {
                        epoch: welcome.epoch,
                        seq: welcome.resume_from,
                    },
                    caught_up: welcome.caught_up,
                })
            }
            Err(e) => {
                log::warn!("join of {doc_id} failed: {e}");
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn publish(&mut self, batch: &OperationBatch) -> Result<u64, TransportError> {
        let doc_id = self.doc_id.as_deref().ok_or(TransportError::NotConnected)?;
        let encoded = SyncMessage::operations(self.peer_info.peer_id, doc_id, 0, batch)?.encode()?;
        Ok(self.request(batch.batch_id, encoded).await?.seq)
    }

    async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            if let (Some(doc_id), true) = (&self.doc_id, self.alive.load(Ordering::Acquire)) {
                if let Ok(encoded) = SyncMessage::leave(self.peer_info.peer_id, doc_id).encode() {
                    let _ = tx.send(encoded).await;
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
        self.alive.store(false, Ordering::Release);
        self.doc_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.doc_id.is_some() && self.alive.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncgraph_core::{ObjectId, Operation};

    fn client() -> SyncClient {
        SyncClient::new(PeerInfo::new("Alice"), ClientConfig::for_testing("ws://127.0.0.1:1"))
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.peer_info().name, "Alice");
        assert_eq!(client.server_url(), "ws://127.0.0.1:1");
        assert!(client.doc_id().is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected() {
        let mut client = client();
        let batch = OperationBatch::new(1, vec![Operation::create_object(ObjectId::new("obj_1"))]);
        assert!(matches!(
            client.publish(&batch).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            client.send_ping().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = client();
        assert!(matches!(
            client.connect("doc", None).await,
            Err(TransportError::Connect(_))
        ));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
