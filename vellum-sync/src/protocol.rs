//! Binary wire protocol for document synchronization.
//!
//! Every frame is self-describing: the leading bytes select the variant,
//! mirroring the CRDT substrate's own framing so the core stays
//! substrate-agnostic. No length prefix — the transport preserves message
//! boundaries (one WebSocket binary frame per message).
//!
//! ```text
//! ┌──────┬──────┬──────────────────────────────┐
//! │ 0x00 │ 0x00 │ state vector                 │  SyncStep1
//! │ 0x00 │ 0x01 │ update fragment              │  SyncStep2
//! │ 0x00 │ 0x02 │ uuid (16B) │ update fragment │  DocumentUpdate
//! │ 0x01 │ payload …                           │  Awareness
//! │ 0x02 │ 0x00 │ uuid (16B)                   │  Ack
//! │ 0x02 │ 0x01 │                              │  Ping
//! │ 0x02 │ 0x02 │                              │  Pong
//! └──────┴──────┴──────────────────────────────┘
//! ```
//!
//! Anything else decodes to [`ProtocolMessage::Unknown`] so the caller can
//! decide between ignoring the frame and tearing the connection down.
//! Awareness payload interiors are bincode-encoded ([`AwarenessUpdate`]);
//! the outer framing never inspects them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level message category: sync protocol.
const TAG_SYNC: u8 = 0x00;
/// Top-level message category: ephemeral awareness.
const TAG_AWARENESS: u8 = 0x01;
/// Top-level message category: control plane (acks, heartbeats).
const TAG_CONTROL: u8 = 0x02;

const SYNC_STEP1: u8 = 0x00;
const SYNC_STEP2: u8 = 0x01;
const SYNC_UPDATE: u8 = 0x02;

const CONTROL_ACK: u8 = 0x00;
const CONTROL_PING: u8 = 0x01;
const CONTROL_PONG: u8 = 0x02;

/// Opaque encoded state vector: which operations a replica has incorporated.
///
/// Never interpreted by this crate outside the CRDT adapter. Two replicas
/// with equal state vectors hold convergent documents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateVector(Vec<u8>);

impl StateVector {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Opaque encoded update fragment: one or more CRDT operations.
///
/// Merging the same fragment twice is a no-op by substrate guarantee, which
/// is what makes at-least-once delivery (and ack-timeout resubmission) safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFragment(Vec<u8>);

impl UpdateFragment {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pre-validated identity attached to a session by the authentication
/// collaborator. This crate performs no authorization checks of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub client_id: Uuid,
    pub display_name: String,
}

impl Principal {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            display_name: display_name.into(),
        }
    }

    /// Create with an explicit client id (reconnecting clients keep theirs).
    pub fn with_id(client_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
        }
    }
}

/// Closed union of every wire message.
///
/// `Unknown` is produced by [`decode`](ProtocolMessage::decode) for
/// unrecognized tags and is not re-encodable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// "Here is what I have." Opens the handshake in both directions.
    SyncStep1 { state_vector: StateVector },
    /// "Here is what you're missing." Diff reply to a `SyncStep1`.
    SyncStep2 { update: UpdateFragment },
    /// Live edit with a client-generated correlation id.
    DocumentUpdate { uuid: Uuid, update: UpdateFragment },
    /// Ephemeral presence payload, last-write-wins per origin client.
    Awareness { payload: Vec<u8> },
    /// Server confirmation that the update with this uuid is durable.
    Ack { uuid: Uuid },
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Unrecognized leading bytes. Never silently dropped: the session
    /// layer decides whether to ignore or disconnect.
    Unknown { tag: [u8; 2] },
}

impl ProtocolMessage {
    /// Serialize to the tagged wire format.
    ///
    /// Total for every constructible variant. Encoding `Unknown` is a
    /// programming error and panics immediately rather than emitting an
    /// unparseable frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SyncStep1 { state_vector } => {
                let mut out = Vec::with_capacity(2 + state_vector.as_bytes().len());
                out.push(TAG_SYNC);
                out.push(SYNC_STEP1);
                out.extend_from_slice(state_vector.as_bytes());
                out
            }
            Self::SyncStep2 { update } => {
                let mut out = Vec::with_capacity(2 + update.len());
                out.push(TAG_SYNC);
                out.push(SYNC_STEP2);
                out.extend_from_slice(update.as_bytes());
                out
            }
            Self::DocumentUpdate { uuid, update } => {
                let mut out = Vec::with_capacity(18 + update.len());
                out.push(TAG_SYNC);
                out.push(SYNC_UPDATE);
                out.extend_from_slice(uuid.as_bytes());
                out.extend_from_slice(update.as_bytes());
                out
            }
            Self::Awareness { payload } => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(TAG_AWARENESS);
                out.extend_from_slice(payload);
                out
            }
            Self::Ack { uuid } => {
                let mut out = Vec::with_capacity(18);
                out.push(TAG_CONTROL);
                out.push(CONTROL_ACK);
                out.extend_from_slice(uuid.as_bytes());
                out
            }
            Self::Ping => vec![TAG_CONTROL, CONTROL_PING],
            Self::Pong => vec![TAG_CONTROL, CONTROL_PONG],
            Self::Unknown { tag } => {
                panic!("attempted to encode an Unknown message (tag {tag:02x?})")
            }
        }
    }

    /// Parse a frame from the tagged wire format.
    ///
    /// Fewer than two leading bytes is [`DecodeError::Truncated`] (so an
    /// awareness frame always carries a non-empty payload). Unrecognized
    /// tags decode to [`ProtocolMessage::Unknown`] rather than erroring, so
    /// callers choose their own rejection policy.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::Truncated);
        }

        match bytes[0] {
            TAG_SYNC => match bytes[1] {
                SYNC_STEP1 => Ok(Self::SyncStep1 {
                    state_vector: StateVector::new(bytes[2..].to_vec()),
                }),
                SYNC_STEP2 => Ok(Self::SyncStep2 {
                    update: UpdateFragment::new(bytes[2..].to_vec()),
                }),
                SYNC_UPDATE => {
                    if bytes.len() < 18 {
                        return Err(DecodeError::Truncated);
                    }
                    let uuid = Uuid::from_slice(&bytes[2..18]).map_err(|_| DecodeError::Truncated)?;
                    Ok(Self::DocumentUpdate {
                        uuid,
                        update: UpdateFragment::new(bytes[18..].to_vec()),
                    })
                }
                other => Ok(Self::Unknown {
                    tag: [TAG_SYNC, other],
                }),
            },
            TAG_AWARENESS => Ok(Self::Awareness {
                payload: bytes[1..].to_vec(),
            }),
            TAG_CONTROL => match bytes[1] {
                CONTROL_ACK => {
                    if bytes.len() < 18 {
                        return Err(DecodeError::Truncated);
                    }
                    let uuid = Uuid::from_slice(&bytes[2..18]).map_err(|_| DecodeError::Truncated)?;
                    Ok(Self::Ack { uuid })
                }
                CONTROL_PING => Ok(Self::Ping),
                CONTROL_PONG => Ok(Self::Pong),
                other => Ok(Self::Unknown {
                    tag: [TAG_CONTROL, other],
                }),
            },
            other => Ok(Self::Unknown {
                tag: [other, bytes[1]],
            }),
        }
    }

    /// Short variant name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "sync-step1",
            Self::SyncStep2 { .. } => "sync-step2",
            Self::DocumentUpdate { .. } => "document-update",
            Self::Awareness { .. } => "awareness",
            Self::Ack { .. } => "ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Interior of an `Awareness` frame: the presence payload plus the origin
/// client key it is stored under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: Uuid,
    pub data: Vec<u8>,
}

impl AwarenessUpdate {
    pub fn new(client_id: Uuid, data: Vec<u8>) -> Self {
        Self { client_id, data }
    }

    /// Encode into an `Awareness` frame payload.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("awareness payload encoding cannot fail")
    }

    /// Decode from an `Awareness` frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DecodeError::Payload(e.to_string()))?;
        Ok(update)
    }
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the variant's fixed-size header requires.
    Truncated,
    /// Unrecognized tag, raised by the session layer when it rejects an
    /// `Unknown` frame.
    UnknownTag([u8; 2]),
    /// Malformed payload interior (awareness).
    Payload(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame truncated"),
            Self::UnknownTag(tag) => write!(f, "unknown message tag {:#04x},{:#04x}", tag[0], tag[1]),
            Self::Payload(e) => write!(f, "malformed payload: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}
