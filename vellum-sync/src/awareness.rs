//! Ephemeral presence ("awareness") channel.
//!
//! Presence payloads — cursors, selections, who-is-here — are opaque to this
//! crate. They are keyed by origin client and last-write-wins: each new
//! payload overwrites the previous one for that client. No history, no acks,
//! no durability; a payload missed while disconnected is worthless by the
//! time the connection returns, so [`publish`](AwarenessChannel::publish) is
//! a silent no-op unless the session is `Live`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{AwarenessUpdate, ProtocolMessage};

/// Callback invoked whenever a remote client's presence state changes.
pub type AwarenessCallback = Box<dyn Fn(Uuid, &[u8]) + Send + Sync>;

/// Last-writer-wins presence map for one document session.
pub struct AwarenessChannel {
    local_client: Uuid,
    /// Shared with the connection plumbing; flipped on `Live`/disconnect.
    live: Arc<AtomicBool>,
    states: HashMap<Uuid, Vec<u8>>,
    subscribers: Vec<AwarenessCallback>,
}

impl AwarenessChannel {
    pub fn new(local_client: Uuid, live: Arc<AtomicBool>) -> Self {
        Self {
            local_client,
            live,
            states: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Publish the local client's presence payload.
    ///
    /// Returns the frame to put on the wire, or `None` when the session is
    /// not `Live` — presence is dropped, never queued.
    pub fn publish(&mut self, payload: Vec<u8>) -> Option<ProtocolMessage> {
        if !self.live.load(Ordering::Acquire) {
            return None;
        }

        self.states.insert(self.local_client, payload.clone());
        let update = AwarenessUpdate::new(self.local_client, payload);
        Some(ProtocolMessage::Awareness {
            payload: update.encode(),
        })
    }

    /// Apply a remote client's presence payload, overwriting whatever that
    /// client published before, and notify subscribers.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) {
        for callback in &self.subscribers {
            callback(update.client_id, &update.data);
        }
        self.states.insert(update.client_id, update.data);
    }

    /// Register a callback for remote presence changes.
    pub fn subscribe(&mut self, callback: AwarenessCallback) {
        self.subscribers.push(callback);
    }

    /// Drop a departed client's presence state.
    pub fn remove(&mut self, client_id: &Uuid) -> Option<Vec<u8>> {
        self.states.remove(client_id)
    }

    /// Latest payload for a client, if any.
    pub fn state_of(&self, client_id: &Uuid) -> Option<&[u8]> {
        self.states.get(client_id).map(Vec::as_slice)
    }

    /// Clients with known presence state.
    pub fn clients(&self) -> Vec<Uuid> {
        self.states.keys().copied().collect()
    }

    pub fn local_client(&self) -> Uuid {
        self.local_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn live_flag(value: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(value))
    }

    #[test]
    fn test_publish_requires_live() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4(), live_flag(false));
        assert!(channel.publish(b"cursor".to_vec()).is_none());
        // Not even stored locally — dropped outright
        assert!(channel.state_of(&channel.local_client()).is_none());
    }

    #[test]
    fn test_publish_when_live_produces_frame() {
        let client = Uuid::new_v4();
        let mut channel = AwarenessChannel::new(client, live_flag(true));

        let msg = channel.publish(b"cursor:3".to_vec()).unwrap();
        match msg {
            ProtocolMessage::Awareness { payload } => {
                let update = AwarenessUpdate::decode(&payload).unwrap();
                assert_eq!(update.client_id, client);
                assert_eq!(update.data, b"cursor:3");
            }
            other => panic!("expected Awareness, got {other:?}"),
        }
        assert_eq!(channel.state_of(&client), Some(&b"cursor:3"[..]));
    }

    #[test]
    fn test_last_writer_wins() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4(), live_flag(true));
        let remote = Uuid::new_v4();

        channel.apply_remote(AwarenessUpdate::new(remote, b"first".to_vec()));
        channel.apply_remote(AwarenessUpdate::new(remote, b"second".to_vec()));

        assert_eq!(channel.state_of(&remote), Some(&b"second"[..]));
        assert_eq!(channel.clients(), vec![remote]);
    }

    #[test]
    fn test_subscribers_notified() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4(), live_flag(true));
        let seen: Arc<Mutex<Vec<(Uuid, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        channel.subscribe(Box::new(move |client_id, data| {
            sink.lock().unwrap().push((client_id, data.to_vec()));
        }));

        let remote = Uuid::new_v4();
        channel.apply_remote(AwarenessUpdate::new(remote, b"here".to_vec()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(remote, b"here".to_vec())]);
    }

    #[test]
    fn test_remove_departed_client() {
        let mut channel = AwarenessChannel::new(Uuid::new_v4(), live_flag(true));
        let remote = Uuid::new_v4();
        channel.apply_remote(AwarenessUpdate::new(remote, b"bye".to_vec()));

        assert_eq!(channel.remove(&remote), Some(b"bye".to_vec()));
        assert!(channel.state_of(&remote).is_none());
        assert!(channel.remove(&remote).is_none());
    }

    #[test]
    fn test_live_flag_flip_reenables_publish() {
        let flag = live_flag(false);
        let mut channel = AwarenessChannel::new(Uuid::new_v4(), flag.clone());

        assert!(channel.publish(b"x".to_vec()).is_none());
        flag.store(true, Ordering::Release);
        assert!(channel.publish(b"x".to_vec()).is_some());
    }
}
