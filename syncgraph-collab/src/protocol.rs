//! Wire protocol for operation relay.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `Operations` payloads are a JSON [`OperationBatch`], since operation
//! values are arbitrary JSON. `seq` is 0 on client → server batches and
//! carries the room sequence number on everything the relay sends back.
//!
//! Joining:
//! ```text
//!   client                              relay
//!     │── Join { peer, resume: Cursor? } ──►│
//!     │◄── Welcome { epoch, resume_from } ──│
//!     │◄── Operations (seq > resume_from) ──│  replayed from the room log
//!     │◄── Operations ...                 ──│  live
//! ```

use serde::{Deserialize, Serialize};
use syncgraph_core::Operation;
use thiserror::Error;
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Subscribe to a document room
    Join = 1,
    /// Batch of operations (client → relay, or relayed fan-out)
    Operations = 2,
    /// Relay accepted a join (batch id 0) or a batch; `seq` is the room
    /// sequence number
    Ack = 3,
    /// Peer joined notification
    PeerJoined = 4,
    /// Peer left notification
    PeerLeft = 5,
    /// Unsubscribe from a document room
    Leave = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Relay rejected a request; payload is a UTF-8 reason
    Error = 9,
    /// Relay accepted a join; payload is a [`Welcome`]
    Welcome = 10,
}

/// Position in a relay's sequence of a document's batches.
///
/// Sequence numbers are only comparable within one relay run, which
/// `epoch` identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub epoch: Uuid,
    pub seq: u64,
}

/// `Join` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer: PeerInfo,
    /// Last sequence number the joining replica applied, if it was
    /// subscribed before.
    pub resume: Option<Cursor>,
}

/// `Welcome` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub epoch: Uuid,
    /// Room sequence number at join time.
    pub last_seq: u64,
    /// Every batch after this one is delivered, replayed or live.
    pub resume_from: u64,
    /// False when batches the replica missed are no longer in the room
    /// log (or the relay restarted since it last joined).
    pub caught_up: bool,
}

/// Peer identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Operations published together, in apply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Sender-local counter used to match the relay's ack. A batch sent
    /// again under the same id is acknowledged, not relayed twice.
    pub batch_id: u64,
    pub operations: Vec<Operation>,
    /// The operations are already part of the saved document: relay
    /// them, but do not append them to the stored history.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub saved: bool,
}

impl OperationBatch {
    pub fn new(batch_id: u64, operations: Vec<Operation>) -> Self {
        Self {
            batch_id,
            operations,
            saved: false,
        }
    }

    pub fn already_saved(mut self) -> Self {
        self.saved = true;
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Room sequence number (0 when not yet sequenced)
    pub seq: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn bare(msg_type: MessageType, peer_id: Uuid, doc_id: &str) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Join a document room, optionally resuming after `resume`.
    pub fn join(
        info: &PeerInfo,
        doc_id: &str,
        resume: Option<Cursor>,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Join, info.peer_id, doc_id);
        msg.payload = encode_payload(&JoinRequest {
            peer: info.clone(),
            resume,
        })?;
        Ok(msg)
    }

    pub fn welcome(doc_id: &str, welcome: &Welcome) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Welcome, Uuid::nil(), doc_id);
        msg.seq = welcome.last_seq;
        msg.payload = encode_payload(welcome)?;
        Ok(msg)
    }

    /// Publish (or relay, with `seq` set) a batch of operations.
    pub fn operations(
        peer_id: Uuid,
        doc_id: &str,
        seq: u64,
        batch: &OperationBatch,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Operations, peer_id, doc_id);
        msg.seq = seq;
        msg.payload = serde_json::to_vec(batch)?;
        Ok(msg)
    }

    /// Acknowledge batch `batch_id`, sequenced as `seq`.
    pub fn ack(peer_id: Uuid, doc_id: &str, seq: u64, batch_id: u64) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Ack, peer_id, doc_id);
        msg.seq = seq;
        msg.payload = encode_payload(&batch_id)?;
        Ok(msg)
    }

    pub fn peer_joined(info: &PeerInfo, doc_id: &str) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::PeerJoined, info.peer_id, doc_id);
        msg.payload = encode_payload(info)?;
        Ok(msg)
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::bare(MessageType::PeerLeft, peer_id, doc_id)
    }

    pub fn leave(peer_id: Uuid, doc_id: &str) -> Self {
        Self::bare(MessageType::Leave, peer_id, doc_id)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, peer_id, "")
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, peer_id, "")
    }

    /// Reject a request. `seq` names the rejected batch id (0 for a join).
    pub fn error(peer_id: Uuid, doc_id: &str, seq: u64, reason: impl Into<String>) -> Self {
        let mut msg = Self::bare(MessageType::Error, peer_id, doc_id);
        msg.seq = seq;
        msg.payload = reason.into().into_bytes();
        msg
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        Ok(())
    }

    /// Parse an `Operations` payload.
    pub fn batch(&self) -> Result<OperationBatch, ProtocolError> {
        self.expect(MessageType::Operations)?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Parse the acknowledged batch id of an `Ack`.
    pub fn acked_batch(&self) -> Result<u64, ProtocolError> {
        self.expect(MessageType::Ack)?;
        decode_payload(&self.payload)
    }

    /// Parse peer info from `Join` or `PeerJoined`.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        match self.msg_type {
            MessageType::Join => Ok(self.join_request()?.peer),
            MessageType::PeerJoined => decode_payload(&self.payload),
            found => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::PeerJoined,
                found,
            }),
        }
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    pub fn welcome_info(&self) -> Result<Welcome, ProtocolError> {
        self.expect(MessageType::Welcome)?;
        decode_payload(&self.payload)
    }

    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Error)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("operation payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("expected {expected:?} message, got {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncgraph_core::ObjectId;

    fn sample_batch() -> OperationBatch {
        OperationBatch::new(
            7,
            vec![
                Operation::create_object(ObjectId::new("cube_1")),
                Operation::set_property(ObjectId::new("cube_1"), "tx", Some(json!(1.5)), None),
                Operation::insert_element(ObjectId::new("arr_1"), None, json!("cube_1")),
            ],
        )
    }

    #[test]
    fn test_operations_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::operations(peer, "doc_a", 42, &sample_batch()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Operations);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, "doc_a");
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.batch().unwrap(), sample_batch());
    }

    #[test]
    fn test_payload_is_wire_json() {
        let msg = SyncMessage::operations(Uuid::nil(), "d", 0, &sample_batch()).unwrap();
        let text = String::from_utf8(msg.payload).unwrap();
        assert!(text.contains("\"type\":\"SET_PROPERTY\""));
        assert!(text.contains("\"object\":\"cube_1\""));
    }

    #[test]
    fn test_ack_and_join() {
        let info = PeerInfo::new("alice");
        let ack = SyncMessage::ack(info.peer_id, "d", 9, 7).unwrap();
        let ack = SyncMessage::decode(&ack.encode().unwrap()).unwrap();
        assert_eq!(ack.seq, 9);
        assert_eq!(ack.acked_batch().unwrap(), 7);

        let join = SyncMessage::join(&info, "d", None).unwrap();
        let join = SyncMessage::decode(&join.encode().unwrap()).unwrap();
        assert_eq!(join.peer_info().unwrap(), info);
        assert_eq!(join.join_request().unwrap().resume, None);
    }

    #[test]
    fn test_resume_and_welcome() {
        let info = PeerInfo::new("bob");
        let cursor = Cursor {
            epoch: Uuid::new_v4(),
            seq: 12,
        };
        let join = SyncMessage::join(&info, "d", Some(cursor)).unwrap();
        let join = SyncMessage::decode(&join.encode().unwrap()).unwrap();
        assert_eq!(join.join_request().unwrap().resume, Some(cursor));

        let welcome = Welcome {
            epoch: cursor.epoch,
            last_seq: 15,
            resume_from: 12,
            caught_up: true,
        };
        let msg = SyncMessage::welcome("d", &welcome).unwrap();
        let msg = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg.seq, 15);
        assert_eq!(msg.welcome_info().unwrap(), welcome);
        assert!(msg.join_request().is_err());
    }

    #[test]
    fn test_saved_flag_only_on_the_wire_when_set() {
        let plain = serde_json::to_value(sample_batch()).unwrap();
        assert!(plain.get("saved").is_none());

        let saved = sample_batch().already_saved();
        let msg = SyncMessage::operations(Uuid::nil(), "d", 0, &saved).unwrap();
        assert!(msg.batch().unwrap().saved);
    }

    #[test]
    fn test_error_reason() {
        let msg = SyncMessage::error(Uuid::nil(), "d", 4, "room full");
        assert_eq!(msg.seq, 4);
        assert_eq!(msg.error_reason().unwrap(), "room full");
    }

    #[test]
    fn test_wrong_type_rejected() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(
            msg.batch(),
            Err(ProtocolError::InvalidMessageType {
                found: MessageType::Ping,
                ..
            })
        ));
        assert!(msg.acked_batch().is_err());
        assert!(msg.peer_info().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }
}
