//! Binary protocol for operation-based document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                                   relay
//!   │── SyncRequest { state vector } ───────►│
//!   │◄── SyncResponse { diff | snapshot,     │
//!   │                   relay state vector } │
//!   │── Update { ops the relay is missing } ►│
//! ```
//!
//! Every message kind is idempotent on the receiving side: operations and
//! snapshots merge as a set, awareness is last-writer-wins.
//!
//! Reference: Kleppmann, Chapter 4: Encoding and Evolution

use folio_core::{Operation, StateVector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector of the connecting replica
    SyncRequest = 1,
    /// Missing operations (or full snapshot) plus the responder's state vector
    SyncResponse = 2,
    /// Incremental operation batch
    Update = 3,
    /// Presence delta
    Awareness = 4,
    /// Peer left notification (sent by the relay)
    PeerLeft = 5,
    /// Heartbeat ping; `clock` carries the ping nonce
    Ping = 6,
    /// Heartbeat pong; echoes the ping nonce
    Pong = 7,
}

/// Document content carried by sync responses and updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Exactly the operations the receiver is missing.
    Ops(Vec<Operation>),
    /// Full replica snapshot, used when a diff cannot be produced.
    Snapshot(Vec<u8>),
}

impl SyncPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            SyncPayload::Ops(ops) => ops.is_empty(),
            SyncPayload::Snapshot(bytes) => bytes.is_empty(),
        }
    }
}

/// Body of a [`MessageType::SyncResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Responder's state vector, so the requester can send back its own diff.
    pub state_vector: StateVector,
    pub content: SyncPayload,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender's Lamport clock for updates, ping nonce for ping/pong
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

/// Empty on failure; the receiver then rejects the payload as undecodable.
fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_else(|e| {
        log::error!("Failed to encode message payload: {e}");
        Vec::new()
    })
}

impl SyncMessage {
    /// Create a sync request (handshake opener).
    pub fn sync_request(peer_id: Uuid, doc_id: Uuid, state_vector: &StateVector) -> Self {
        Self {
            msg_type: MessageType::SyncRequest,
            peer_id,
            doc_id,
            clock: 0,
            payload: encode_payload(state_vector),
        }
    }

    /// Create a sync response.
    pub fn sync_response(peer_id: Uuid, doc_id: Uuid, response: &SyncResponse) -> Self {
        Self {
            msg_type: MessageType::SyncResponse,
            peer_id,
            doc_id,
            clock: 0,
            payload: encode_payload(response),
        }
    }

    /// Create an operation batch update.
    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, content: &SyncPayload) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            doc_id,
            clock,
            payload: encode_payload(content),
        }
    }

    /// Shorthand for an update carrying operations.
    pub fn ops(peer_id: Uuid, doc_id: Uuid, clock: u64, ops: Vec<Operation>) -> Self {
        Self::update(peer_id, doc_id, clock, &SyncPayload::Ops(ops))
    }

    /// Create an awareness update message.
    pub fn awareness(peer_id: Uuid, doc_id: Uuid, msg: &AwarenessMessage) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id,
            clock: 0,
            payload: encode_payload(msg),
        }
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message carrying a nonce.
    pub fn ping(peer_id: Uuid, doc_id: Uuid, nonce: u64) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id,
            clock: nonce,
            payload: Vec::new(),
        }
    }

    /// Create a pong answering `ping`.
    pub fn pong(peer_id: Uuid, ping: &SyncMessage) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            doc_id: ping.doc_id,
            clock: ping.clock,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Parse sync request payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.parse(MessageType::SyncRequest)
    }

    /// Parse sync response payload.
    pub fn sync_response_body(&self) -> Result<SyncResponse, ProtocolError> {
        self.parse(MessageType::SyncResponse)
    }

    /// Parse update payload.
    pub fn update_payload(&self) -> Result<SyncPayload, ProtocolError> {
        self.parse(MessageType::Update)
    }

    /// Parse awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.parse(MessageType::Awareness)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
