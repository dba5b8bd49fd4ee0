//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Ack(seq) ──► sender
//!            ├── Room (doc_id) ── sequencer ──┤
//! Client B ──┘                       ├── writer task ── DocumentStore::append
//!                                    │   (spawn_blocking, room order)
//!                          ┌─────────┼──────────┐
//!                          ▼         ▼          ▼
//!                       Client A  Client B   Client C
//! ```
//!
//! The relay holds no document state of its own. It gives every batch a
//! room sequence number, fans it out, acknowledges it to the sender and,
//! when a store is configured, appends it to the stored history in the
//! same order. Appends run on a per-room writer task off the async
//! workers; the ack is sent once the append finished.
//!
//! A joining peer gets a `Welcome`, followed by the logged batches after
//! its resume cursor. A batch re-sent after a lost ack is acknowledged
//! again with its original sequence number and not relayed twice.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use syncgraph_core::Operation;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{JoinRequest, MessageType, PeerInfo, SyncMessage, Welcome};
use crate::storage::{DocumentStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Sequenced batches each room keeps for reconnecting peers
    pub replay_capacity: usize,
    /// RocksDB directory for relayed history (None = not persisted)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            replay_capacity: 1024,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            replay_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub relayed_batches: u64,
    pub persisted_batches: u64,
    pub rejected_requests: u64,
}

/// State shared by every connection task.
struct RelayState {
    config: ServerConfig,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
    store: Option<Arc<dyn DocumentStore>>,
    /// One append queue per open room, created on its first stored batch.
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<AppendJob>>>,
}

/// A sequenced batch waiting to be appended to the stored history.
struct AppendJob {
    seq: u64,
    operations: Vec<Operation>,
    done: oneshot::Sender<bool>,
}

/// What a connection is joined to.
struct Membership {
    peer_id: Uuid,
    room: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// The relay server.
pub struct SyncServer {
    state: Arc<RelayState>,
}

impl SyncServer {
    /// Create a server. Opens a RocksDB store when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store: Arc<dyn DocumentStore> =
                    Arc::new(RocksStore::open(StoreConfig {
                        path: path.clone(),
                        ..StoreConfig::default()
                    })?);
                Some(store)
            }
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// Create a server persisting into `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn DocumentStore>>) -> Self {
        let rooms = RoomManager::with_replay(config.broadcast_capacity, config.replay_capacity);
        Self {
            state: Arc::new(RelayState {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
                store,
                writers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("relay listening on {}", self.state.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<RelayState>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Membership> = None;
        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = state.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };
                            if let Err(e) = Self::handle_message(&state, &mut member, sync_msg, &mut ws_sender).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                // Outgoing room traffic
                msg = async {
                    match member.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            let own = member.as_ref().map(|m| m.peer_id);
                            // Don't echo back to sender
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if Some(sync_msg.peer_id) == own {
                                    continue;
                                }
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer lagged by {n} messages on {addr}");
                            if let Some(m) = &member {
                                m.room.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        if let Some(m) = member.take() {
            Self::leave(&state, m).await;
        }
        {
            let mut s = state.stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = state.rooms.room_count().await;
        }
        result
    }

    async fn handle_message<S>(
        state: &RelayState,
        member: &mut Option<Membership>,
        msg: SyncMessage,
        ws_sender: &mut S,
    ) -> Result<(), BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        match msg.msg_type {
            MessageType::Join => {
                if let Some(old) = member.take() {
                    Self::leave(state, old).await;
                }
                let request = msg.join_request().unwrap_or_else(|_| JoinRequest {
                    peer: PeerInfo::with_id(msg.peer_id, "anonymous"),
                    resume: None,
                });
                let info = request.peer;
                let room = state.rooms.get_or_create(&msg.doc_id).await;

                if room.peer_count().await >= state.config.max_peers_per_room {
                    log::warn!("room {} full, rejecting {}", msg.doc_id, info.name);
                    state.rooms.remove_if_empty(&msg.doc_id).await;
                    state.stats.write().await.rejected_requests += 1;
                    let reply = SyncMessage::error(Uuid::nil(), &msg.doc_id, 0, "room full");
                    return send(ws_sender, &reply).await;
                }

                // Cursors from another relay run say nothing about this
                // room's numbering.
                let epoch = state.rooms.epoch();
                let since = request.resume.map(|c| if c.epoch == epoch { c.seq } else { 0 });
                let joined = room.join(info.clone(), since).await;
                let welcome = Welcome {
                    epoch,
                    last_seq: joined.last_seq,
                    resume_from: joined.resume_from,
                    caught_up: joined.caught_up
                        && request.resume.map_or(true, |c| c.epoch == epoch),
                };
                send(ws_sender, &SyncMessage::welcome(&msg.doc_id, &welcome)?).await?;
                for frame in &joined.replay {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }
                if !welcome.caught_up {
                    log::warn!(
                        "peer {} resumed {} past the room log, replayed from {}",
                        info.name,
                        msg.doc_id,
                        welcome.resume_from
                    );
                }
                room.broadcast(&SyncMessage::peer_joined(&info, &msg.doc_id)?)?;
                state.stats.write().await.active_rooms = state.rooms.room_count().await;
                log::info!(
                    "peer {} ({}) joined doc {}, {} batches replayed",
                    info.name,
                    info.peer_id,
                    msg.doc_id,
                    joined.replay.len()
                );

                *member = Some(Membership {
                    peer_id: info.peer_id,
                    room,
                    rx: joined.rx,
                });
            }

            MessageType::Operations => {
                let batch = match msg.batch() {
                    Ok(b) => b,
                    Err(e) => {
                        state.stats.write().await.rejected_requests += 1;
                        let reply = SyncMessage::error(Uuid::nil(), &msg.doc_id, 0, e.to_string());
                        return send(ws_sender, &reply).await;
                    }
                };
                let room = match member.as_ref() {
                    Some(m) if m.room.doc_id() == msg.doc_id && m.peer_id == msg.peer_id => {
                        m.room.clone()
                    }
                    _ => {
                        state.stats.write().await.rejected_requests += 1;
                        let reply =
                            SyncMessage::error(Uuid::nil(), &msg.doc_id, batch.batch_id, "not joined");
                        return send(ws_sender, &reply).await;
                    }
                };

                // Batches the sender already saved with its document are
                // in the stored history.
                let writer = match batch.saved {
                    true => None,
                    false => Self::writer(state, room.doc_id()).await,
                };
                let mut appended = None;
                let accepted = room
                    .publish_and(msg.peer_id, &batch, |seq| {
                        if let Some(writer) = &writer {
                            let (done, rx) = oneshot::channel();
                            let job = AppendJob {
                                seq,
                                operations: batch.operations.clone(),
                                done,
                            };
                            if writer.send(job).is_ok() {
                                appended = Some(rx);
                            }
                        }
                    })
                    .await?;
                let stored = match appended {
                    Some(rx) => rx.await.unwrap_or(false),
                    None => false,
                };
                if !accepted.duplicate {
                    let mut s = state.stats.write().await;
                    s.relayed_batches += 1;
                    if stored {
                        s.persisted_batches += 1;
                    }
                }
                let ack = SyncMessage::ack(Uuid::nil(), &msg.doc_id, accepted.seq, batch.batch_id)?;
                send(ws_sender, &ack).await?;
            }

            MessageType::Leave => {
                if let Some(m) = member.take() {
                    Self::leave(state, m).await;
                }
            }

            MessageType::Ping => {
                send(ws_sender, &SyncMessage::pong(Uuid::nil())).await?;
            }

            other => {
                log::debug!("unhandled message type: {other:?}");
            }
        }
        Ok(())
    }

    /// The append queue of `doc_id`'s room, `None` without a store.
    async fn writer(state: &RelayState, doc_id: &str) -> Option<mpsc::UnboundedSender<AppendJob>> {
        let store = state.store.clone()?;
        let mut writers = state.writers.lock().await;
        let tx = writers
            .entry(doc_id.to_string())
            .or_insert_with(|| spawn_writer(store, doc_id.to_string()));
        Some(tx.clone())
    }

    /// Append a sequenced batch to the stored history. Returns whether it
    /// was stored.
    fn persist(store: &dyn DocumentStore, doc_id: &str, seq: u64, operations: &[Operation]) -> bool {
        match store.append(doc_id, operations) {
            Ok(len) => {
                log::trace!("persisted seq {seq} of {doc_id}, history now {len}");
                true
            }
            Err(StoreError::NotFound(_)) => {
                log::debug!("{doc_id} was never saved, seq {seq} not persisted");
                false
            }
            Err(e) => {
                log::error!("failed to persist seq {seq} of {doc_id}: {e}");
                false
            }
        }
    }

    async fn leave(state: &RelayState, member: Membership) {
        let doc_id = member.room.doc_id().to_string();
        member.room.remove_peer(&member.peer_id).await;
        if let Err(e) = member.room.broadcast(&SyncMessage::peer_left(member.peer_id, &doc_id)) {
            log::warn!("could not announce departure from {doc_id}: {e}");
        }
        if state.rooms.remove_if_empty(&doc_id).await {
            // The writer drains what is queued, then stops.
            state.writers.lock().await.remove(&doc_id);
            log::info!("room {doc_id} removed (empty)");
        }
        log::info!("peer {} left doc {doc_id}", member.peer_id);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.state.stats.read().await.clone();
        stats.active_rooms = self.state.rooms.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.state.rooms
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<dyn DocumentStore>> {
        self.state.store.as_ref()
    }
}

/// Run the appends of one room in sequence order on the blocking pool.
fn spawn_writer(store: Arc<dyn DocumentStore>, doc_id: String) -> mpsc::UnboundedSender<AppendJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<AppendJob>();
    tokio::spawn(async move {
        while let Some(AppendJob { seq, operations, done }) = rx.recv().await {
            let store = store.clone();
            let doc = doc_id.clone();
            let stored = tokio::task::spawn_blocking(move || {
                SyncServer::persist(store.as_ref(), &doc, seq, &operations)
            })
            .await
            .unwrap_or_else(|e| {
                log::error!("append task for seq {seq} of {doc_id} failed: {e}");
                false
            });
            let _ = done.send(stored);
        }
        log::debug!("writer for {doc_id} stopped");
    });
    tx
}

async fn send<S>(ws_sender: &mut S, msg: &SyncMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
