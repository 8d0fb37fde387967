//! Per-connection sync protocol state machine.
//!
//! ```text
//! Handshaking ──► Syncing ──► Live
//!      │             │          │
//!      └─────────────┴──────────┴──► Closed   (decode failure, corrupt
//!                                              fragment, or teardown)
//! ```
//!
//! The machine is pure: it performs no I/O and owns no sockets. It consumes
//! one inbound [`ProtocolMessage`] at a time, mutates the replica it is
//! handed, and returns the frames to send plus typed side-effects for the
//! server/client plumbing to interpret. Both endpoints run the same machine;
//! the server merely interprets [`SessionEffect::Committed`] as
//! append-and-broadcast while the client ignores it beyond surfacing an
//! event.
//!
//! `Live` requires a `SyncStep2` to have been both sent and received —
//! either side may open first, so the flags are tracked independently.
//!
//! A failed step is terminal: the machine moves to `Closed`, the
//! collaborator tears the transport down, and recovery is a fresh session
//! starting over with `SyncStep1` — never partial repair.

use uuid::Uuid;

use crate::document::{DocumentReplica, MergeError};
use crate::outcome::Outcome;
use crate::protocol::{DecodeError, ProtocolMessage, UpdateFragment};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    Syncing,
    Live,
    Closed,
}

/// Side-effects of one protocol step, interpreted by the plumbing.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// The phase advanced. Collaborators feed this into their
    /// "reconnecting… / synced" indicators.
    PhaseChanged(SessionPhase),
    /// A `DocumentUpdate` was merged. Server plumbing appends it to the
    /// document log, broadcasts to other sessions, and acks the origin —
    /// duplicates included, so retransmissions are re-acked.
    Committed { uuid: Uuid, update: UpdateFragment },
    /// An awareness payload arrived while `Live`.
    AwarenessReceived { payload: Vec<u8> },
    /// The server confirmed durability of a local update.
    Acked { uuid: Uuid },
}

/// Frames to send plus effects to interpret, produced by one step.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub outbound: Vec<ProtocolMessage>,
    pub effects: Vec<SessionEffect>,
}

/// Step failures. All of them are terminal for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Decode(DecodeError),
    Merge(MergeError),
    /// A message arrived after the session closed.
    SessionClosed,
    /// The handshake did not reach `Live` within the bounded window.
    /// Raised by the connection plumbing, not by the machine itself.
    HandshakeTimeout,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "protocol decode failure: {e}"),
            Self::Merge(e) => write!(f, "merge failure: {e}"),
            Self::SessionClosed => write!(f, "session is closed"),
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<MergeError> for SessionError {
    fn from(e: MergeError) -> Self {
        Self::Merge(e)
    }
}

/// The per-connection state machine.
pub struct SyncSession {
    session_id: Uuid,
    document_id: Uuid,
    phase: SessionPhase,
    sent_step2: bool,
    received_step2: bool,
}

impl SyncSession {
    pub fn new(session_id: Uuid, document_id: Uuid) -> Self {
        Self {
            session_id,
            document_id,
            phase: SessionPhase::Handshaking,
            sent_step2: false,
            received_step2: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        self.phase == SessionPhase::Live
    }

    /// First frame of the handshake: announce what this replica has.
    pub fn open(&self, replica: &DocumentReplica) -> ProtocolMessage {
        ProtocolMessage::SyncStep1 {
            state_vector: replica.state_vector(),
        }
    }

    /// Process one inbound message.
    ///
    /// A failed outcome means the session is now `Closed`; the caller tears
    /// down the transport and starts over with a fresh handshake.
    pub fn handle(
        &mut self,
        replica: &mut DocumentReplica,
        msg: ProtocolMessage,
    ) -> Outcome<StepOutput, SessionError> {
        if self.phase == SessionPhase::Closed {
            return Outcome::fail(SessionError::SessionClosed);
        }

        let mut out = StepOutput::default();

        match msg {
            ProtocolMessage::SyncStep1 { state_vector } => {
                let update = match replica.diff(&state_vector) {
                    Ok(update) => update,
                    Err(e) => return self.close_with(e.into()),
                };
                out.outbound.push(ProtocolMessage::SyncStep2 { update });
                self.sent_step2 = true;
                self.advance(&mut out);
            }

            ProtocolMessage::SyncStep2 { update } => {
                if let Err(e) = replica.merge(&update) {
                    return self.close_with(e.into());
                }
                self.received_step2 = true;
                self.advance(&mut out);
            }

            ProtocolMessage::DocumentUpdate { uuid, update } => {
                // Accepted in every open phase: merge is order-independent
                // and a retransmitted duplicate is a no-op that still
                // deserves a fresh ack.
                if let Err(e) = replica.merge(&update) {
                    return self.close_with(e.into());
                }
                out.effects.push(SessionEffect::Committed { uuid, update });
            }

            ProtocolMessage::Awareness { payload } => {
                // Presence has no value outside Live; dropped silently.
                if self.phase == SessionPhase::Live {
                    out.effects.push(SessionEffect::AwarenessReceived { payload });
                }
            }

            ProtocolMessage::Ack { uuid } => {
                out.effects.push(SessionEffect::Acked { uuid });
            }

            ProtocolMessage::Ping => {
                out.outbound.push(ProtocolMessage::Pong);
            }

            ProtocolMessage::Pong => {}

            ProtocolMessage::Unknown { tag } => {
                return self.close_with(SessionError::Decode(DecodeError::UnknownTag(tag)));
            }
        }

        Outcome::ok(out)
    }

    /// Wrap freshly captured local operations as a `DocumentUpdate`.
    ///
    /// Only meaningful while `Live`; returns the correlation id the caller
    /// tracks until the matching ack arrives.
    pub fn capture_local(
        &mut self,
        replica: &mut DocumentReplica,
    ) -> Option<(Uuid, ProtocolMessage)> {
        if self.phase != SessionPhase::Live {
            return None;
        }
        let update = replica.capture_local_update()?;
        let uuid = Uuid::new_v4();
        Some((uuid, ProtocolMessage::DocumentUpdate { uuid, update }))
    }

    /// Mark the session closed from the outside (transport teardown).
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    fn advance(&mut self, out: &mut StepOutput) {
        let next = if self.sent_step2 && self.received_step2 {
            SessionPhase::Live
        } else {
            SessionPhase::Syncing
        };
        if next != self.phase {
            self.phase = next;
            out.effects.push(SessionEffect::PhaseChanged(next));
        }
    }

    fn close_with(&mut self, error: SessionError) -> Outcome<StepOutput, SessionError> {
        self.phase = SessionPhase::Closed;
        Outcome::fail(error)
    }
}
