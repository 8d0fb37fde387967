//! Fan-out of encoded frames to the other sessions of a document.
//!
//! Built on `tokio::sync::broadcast`: one channel per document, one receiver
//! per attached session. Frames are pre-encoded `Arc<Vec<u8>>` so a
//! keystroke fanned out to N peers is serialized once, not N times. Each
//! frame carries its origin session id; receivers skip their own frames, so
//! the sender never echoes back to itself.
//!
//! The group is owned by the document's writer actor and mutated only from
//! its task, which is why no interior locking is needed here. Targeted
//! messages (handshake replies, acks) do not go through the group — they use
//! the per-session direct channel held by the actor.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::Principal;

/// An encoded frame tagged with the session that caused it.
pub type Frame = (Uuid, Arc<Vec<u8>>);

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub attached_sessions: usize,
}

/// Fan-out group for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    sessions: HashMap<Uuid, Principal>,
    capacity: usize,
    frames_sent: u64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a lagging receiver may buffer
    /// before it starts missing messages and must resync.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: HashMap::new(),
            capacity,
            frames_sent: 0,
        }
    }

    /// Register a session and hand back its receiver.
    pub fn attach(&mut self, session_id: Uuid, principal: Principal) -> broadcast::Receiver<Frame> {
        self.sessions.insert(session_id, principal);
        self.sender.subscribe()
    }

    /// Deregister a session. Its receiver dies with the connection task.
    pub fn detach(&mut self, session_id: &Uuid) -> Option<Principal> {
        self.sessions.remove(session_id)
    }

    /// Fan a pre-encoded frame out to every receiver. Returns how many
    /// receivers currently exist (including the origin, which filters
    /// itself out).
    pub fn broadcast(&mut self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        self.frames_sent += 1;
        self.sender.send((origin, frame)).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn principals(&self) -> Vec<Principal> {
        self.sessions.values().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent,
            attached_sessions: self.sessions.len(),
        }
    }
}
