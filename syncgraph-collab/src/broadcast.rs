//! Per-document rooms: sequencing, fan-out and catch-up.
//!
//! Every batch relayed through a room gets the next room sequence number
//! under the room's sequencer lock, and is sent while that lock is held.
//! All subscribers therefore observe batches in one total order, which is
//! the order every replica applies them in.
//!
//! ```text
//!   publish(batch) ──► sequencer.lock() ──► seq += 1 ──► encode ──► broadcast::send
//!                            │                                         │
//!                            └──► replay log (bounded)  ┌──────────────┼───────────┐
//!                                        │              ▼              ▼           ▼
//!                       join(since) ◄────┘            peer A         peer B      peer C
//! ```
//!
//! The sequencer also keeps a bounded log of recent batches, so a replica
//! rejoining after an outage gets what it missed, and the last batch id
//! accepted from each sender, so a batch re-sent after a lost ack is
//! acknowledged again instead of being relayed twice.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{OperationBatch, PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub duplicates: u64,
    pub active_peers: usize,
    pub last_seq: u64,
}

/// Outcome of [`BroadcastGroup::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub seq: u64,
    /// The sender already had this batch accepted; nothing was relayed.
    pub duplicate: bool,
}

/// A new member's subscription, with what it missed.
pub struct Joined {
    pub rx: broadcast::Receiver<Arc<Vec<u8>>>,
    pub last_seq: u64,
    /// Every batch after this one reaches the member, from `replay` or `rx`.
    pub resume_from: u64,
    /// Whether `replay` covers everything after the requested position.
    pub caught_up: bool,
    /// Encoded batches in `(resume_from, last_seq]` from other senders.
    pub replay: Vec<Arc<Vec<u8>>>,
}

#[derive(Clone)]
struct Sequenced {
    seq: u64,
    sender: Uuid,
    frame: Arc<Vec<u8>>,
}

#[derive(Clone, Default)]
struct Sequencer {
    last: u64,
    log: VecDeque<Sequenced>,
    /// Last `(batch_id, seq)` accepted from each sender.
    accepted: HashMap<Uuid, (u64, u64)>,
}

impl Sequencer {
    /// Whether the log still holds every batch after `seq`.
    fn covers(&self, seq: u64) -> bool {
        let first = self.log.front().map_or(self.last + 1, |e| e.seq);
        seq + 1 >= first
    }
}

/// One document's room: its members, sequencer and fan-out channel.
pub struct BroadcastGroup {
    doc_id: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashMap<Uuid, PeerInfo>>,
    sequencer: Mutex<Sequencer>,
    replay_capacity: usize,
    sent: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

impl BroadcastGroup {
    /// Create a room whose receivers buffer up to `capacity` messages
    /// before lagging, keeping as many batches for catch-up.
    pub fn new(doc_id: impl Into<String>, capacity: usize) -> Self {
        Self::resuming(doc_id, capacity, capacity, 0)
    }

    /// Create a room numbering batches after `last_seq`, with a replay
    /// log of `replay_capacity` batches.
    pub fn resuming(
        doc_id: impl Into<String>,
        capacity: usize,
        replay_capacity: usize,
        last_seq: u64,
    ) -> Self {
        let sequencer = Sequencer {
            last: last_seq,
            ..Sequencer::default()
        };
        Self::reopen(doc_id, capacity, replay_capacity, sequencer)
    }

    fn reopen(
        doc_id: impl Into<String>,
        capacity: usize,
        replay_capacity: usize,
        sequencer: Sequencer,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            doc_id: doc_id.into(),
            sender,
            members: RwLock::new(HashMap::new()),
            sequencer: Mutex::new(sequencer),
            replay_capacity,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Register `info` as a member and subscribe it to the room.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.join(info, None).await.rx
    }

    /// Register `info` as a member. With `since`, also collect the logged
    /// batches after it.
    ///
    /// Subscription and log read happen under the sequencer lock, so no
    /// batch falls between `replay` and `rx`. A `since` past the room's
    /// last sequence number comes from another relay run: everything
    /// logged is replayed and the member is not caught up.
    pub async fn join(&self, info: PeerInfo, since: Option<u64>) -> Joined {
        let seq = self.sequencer.lock().await;
        let peer_id = info.peer_id;
        self.members.write().await.insert(peer_id, info);
        let rx = self.sender.subscribe();

        let (resume_from, caught_up) = match since {
            None => (seq.last, true),
            Some(s) if s <= seq.last => (s, seq.covers(s)),
            Some(_) => (0, false),
        };
        let replay = seq
            .log
            .iter()
            .filter(|e| e.seq > resume_from && e.sender != peer_id)
            .map(|e| e.frame.clone())
            .collect();
        Joined {
            rx,
            last_seq: seq.last,
            resume_from,
            caught_up,
            replay,
        }
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.members.write().await.remove(peer_id)
    }

    /// Sequence `batch` from `sender` and fan it out to every receiver
    /// (the sender included; it filters its own echo by `peer_id`).
    pub async fn publish(&self, sender: Uuid, batch: &OperationBatch) -> Result<Accepted, ProtocolError> {
        self.publish_and(sender, batch, |_| {}).await
    }

    /// Like [`publish`](Self::publish), running `sequenced` with the new
    /// sequence number before the sequencer lock is released. Whatever it
    /// records is therefore in room order. Not run for duplicates.
    pub async fn publish_and(
        &self,
        sender: Uuid,
        batch: &OperationBatch,
        sequenced: impl FnOnce(u64),
    ) -> Result<Accepted, ProtocolError> {
        let mut seq = self.sequencer.lock().await;
        if let Some(&(batch_id, at)) = seq.accepted.get(&sender) {
            if batch_id == batch.batch_id {
                log::debug!("batch {batch_id} from {sender} already sequenced as {at}");
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(Accepted {
                    seq: at,
                    duplicate: true,
                });
            }
        }

        let next = seq.last + 1;
        let frame = Arc::new(SyncMessage::operations(sender, &self.doc_id, next, batch)?.encode()?);
        seq.last = next;
        seq.accepted.insert(sender, (batch.batch_id, next));
        seq.log.push_back(Sequenced {
            seq: next,
            sender,
            frame: frame.clone(),
        });
        while seq.log.len() > self.replay_capacity {
            seq.log.pop_front();
        }
        sequenced(next);
        self.broadcast_raw(frame);
        Ok(Accepted {
            seq: next,
            duplicate: false,
        })
    }

    /// Broadcast an unsequenced message (peer notifications).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes. Returns the number of receivers.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for a room.
        self.sender.send(encoded).unwrap_or(0)
    }

    /// Record messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn last_seq(&self) -> u64 {
        self.sequencer.lock().await.last
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_member(&self, peer_id: &Uuid) -> bool {
        self.members.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
            last_seq: self.last_seq().await,
        }
    }

    /// Subscribe without becoming a member.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps document ids to their rooms.
///
/// Sequence numbers of a document keep counting up across room closures
/// for the lifetime of the manager, whose `epoch` tells runs apart.
pub struct RoomManager {
    epoch: Uuid,
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    /// Sequencer of each closed room: numbering, replay log and the
    /// batches accepted per sender.
    closed: RwLock<HashMap<String, Sequencer>>,
    capacity: usize,
    replay_capacity: usize,
}

impl RoomManager {
    /// Rooms created here buffer `capacity` messages per receiver and log
    /// as many batches for catch-up.
    pub fn new(capacity: usize) -> Self {
        Self::with_replay(capacity, capacity)
    }

    pub fn with_replay(capacity: usize, replay_capacity: usize) -> Self {
        Self {
            epoch: Uuid::new_v4(),
            rooms: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            capacity,
            replay_capacity,
        }
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    pub async fn get_or_create(&self, doc_id: &str) -> Arc<BroadcastGroup> {
        if let Some(room) = self.get(doc_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }
        let sequencer = self.closed.write().await.remove(doc_id).unwrap_or_default();
        log::debug!("opening room {doc_id} after seq {}", sequencer.last);
        let room = Arc::new(BroadcastGroup::reopen(
            doc_id,
            self.capacity,
            self.replay_capacity,
            sequencer,
        ));
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove the room if nobody is in it.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                let sequencer = room.sequencer.lock().await.clone();
                let last_seq = sequencer.last;
                rooms.remove(doc_id);
                self.closed.write().await.insert(doc_id.to_string(), sequencer);
                log::debug!("closed empty room {doc_id} at seq {last_seq}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of the documents with an open room, sorted.
    pub async fn active_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
