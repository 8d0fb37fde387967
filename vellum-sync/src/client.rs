//! WebSocket sync client with offline accumulation and resubmission.
//!
//! Provides:
//! - Connection lifecycle (connect, bounded handshake, reconnect-by-retry)
//! - Local edit capture into acknowledged `DocumentUpdate`s
//! - The reconnection manager: [`PendingUpdates`] survives session
//!   teardown, so unacked updates are resubmitted — with their original
//!   correlation ids — after the next handshake reaches `Live`
//! - Awareness publishing, silently dropped while not `Live`
//!
//! Edits made while disconnected accumulate inside the replica itself (the
//! editor keeps applying them locally) and are drained into fresh
//! `DocumentUpdate`s once a connection reaches `Live` again.
//!
//! All session-machine access is serialized through one driver task per
//! connection; the public API talks to it over a command channel.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessCallback, AwarenessChannel};
use crate::document::DocumentReplica;
use crate::outcome::TranslatedOutcome;
use crate::protocol::{AwarenessUpdate, DecodeError, Principal, ProtocolMessage, UpdateFragment};
use crate::session::{SessionEffect, SessionError, SyncSession};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Bound on the `Handshaking → Live` transition; on expiry the
    /// connection is torn down and retried from scratch.
    pub handshake_timeout: Duration,
    /// How long an unacked update may wait before being resubmitted.
    pub ack_timeout: Duration,
    /// How often the pending queue is scanned for ack timeouts.
    pub ack_scan_interval: Duration,
    /// Maximum retained unacked updates.
    pub max_pending: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            handshake_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            ack_scan_interval: Duration::from_secs(1),
            max_pending: 10_000,
        }
    }
}

/// Connection lifecycle as observed by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Syncing,
    Live,
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Transport established, handshake underway
    Connected,
    /// Handshake complete; edits flow
    Live,
    /// Connection lost
    Disconnected,
    /// A remote update was merged into the local replica
    RemoteUpdate { uuid: Uuid },
    /// A remote client's presence payload changed
    AwarenessChanged { client_id: Uuid, payload: Vec<u8> },
    /// The server confirmed durability of a local update
    UpdateAcked { uuid: Uuid },
    /// An unacked update hit the ack timeout and was sent again
    UpdateResubmitted { uuid: Uuid },
    /// The session failed and was torn down; reconnect to resync
    SyncFailure { message: String },
}

/// Client-side failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    Connect(String),
    ConnectionClosed,
    HandshakeTimeout,
    MalformedFrame(DecodeError),
    Session(SessionError),
    /// The pending queue is at capacity; the edit stays in the replica.
    QueueFull,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
            Self::MalformedFrame(e) => write!(f, "malformed frame: {e}"),
            Self::Session(e) => write!(f, "session error: {e}"),
            Self::QueueFull => write!(f, "pending update queue is full"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// One locally submitted update awaiting its ack.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub uuid: Uuid,
    pub update: UpdateFragment,
    submitted_at: Instant,
}

/// The reconnection manager's durable half: unacked updates ordered by
/// submission. Entries leave only on a matching ack; they deliberately
/// outlive any single session so a reconnect can resubmit them under their
/// original correlation ids (the server re-acks duplicates, so this is
/// always safe).
pub struct PendingUpdates {
    entries: VecDeque<PendingUpdate>,
    max_size: usize,
}

impl PendingUpdates {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Track an update until its ack arrives. Returns `false` when full.
    pub fn enqueue(&mut self, uuid: Uuid, update: UpdateFragment) -> bool {
        if self.entries.len() >= self.max_size {
            return false;
        }
        self.entries.push_back(PendingUpdate {
            uuid,
            update,
            submitted_at: Instant::now(),
        });
        true
    }

    /// Clear the entry matching an ack. Returns whether it was present, so
    /// a second ack for the same uuid is observably a no-op.
    pub fn acknowledge(&mut self, uuid: &Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.uuid != *uuid);
        self.entries.len() != before
    }

    /// Every retained entry, for resubmission after a reconnect. Resets
    /// the ack-timeout clocks.
    pub fn resubmit_batch(&mut self) -> Vec<(Uuid, UpdateFragment)> {
        let now = Instant::now();
        self.entries
            .iter_mut()
            .map(|e| {
                e.submitted_at = now;
                (e.uuid, e.update.clone())
            })
            .collect()
    }

    /// Entries whose ack has been outstanding longer than `window`. Their
    /// clocks reset so a resubmission is not repeated every scan.
    pub fn timed_out(&mut self, window: Duration) -> Vec<(Uuid, UpdateFragment)> {
        let now = Instant::now();
        self.entries
            .iter_mut()
            .filter(|e| now.duration_since(e.submitted_at) >= window)
            .map(|e| {
                e.submitted_at = now;
                (e.uuid, e.update.clone())
            })
            .collect()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.iter().any(|e| e.uuid == *uuid)
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.update.len()).sum()
    }

    /// Hard reconnection: drop everything without waiting for acks.
    pub fn discard(&mut self) {
        self.entries.clear();
    }
}

/// Commands from the public API to the connection's driver task.
enum LocalCmd {
    /// Capture accumulated local edits and submit them.
    Commit {
        reply: oneshot::Sender<Result<Option<Uuid>, ClientError>>,
    },
    /// Put a pre-encoded frame on the wire (awareness).
    Forward(Vec<u8>),
    /// Tear the connection down.
    Shutdown,
}

/// The sync client.
pub struct SyncClient {
    principal: Principal,
    document_id: Uuid,
    config: ClientConfig,

    replica: Arc<Mutex<DocumentReplica>>,
    pending: Arc<Mutex<PendingUpdates>>,
    awareness: Arc<Mutex<AwarenessChannel>>,
    live: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,

    cmd_tx: Arc<RwLock<Option<mpsc::Sender<LocalCmd>>>>,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(principal: Principal, document_id: Uuid, server_url: impl Into<String>) -> Self {
        let config = ClientConfig {
            server_url: server_url.into(),
            ..ClientConfig::default()
        };
        Self::with_config(principal, document_id, config)
    }

    pub fn with_config(principal: Principal, document_id: Uuid, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let live = Arc::new(AtomicBool::new(false));
        let awareness = AwarenessChannel::new(principal.client_id, live.clone());
        let max_pending = config.max_pending;
        Self {
            principal,
            document_id,
            config,
            replica: Arc::new(Mutex::new(DocumentReplica::new())),
            pending: Arc::new(Mutex::new(PendingUpdates::new(max_pending))),
            awareness: Arc::new(Mutex::new(awareness)),
            live,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            cmd_tx: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, complete the handshake within the configured bound, then
    /// resubmit retained pending updates and drain offline edits.
    ///
    /// On failure the client is back in `Disconnected` and a fresh
    /// `connect()` starts over with a new handshake.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/{}/{}",
            self.config.server_url, self.document_id, self.principal.client_id
        );
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => return Err(self.fail_with(ClientError::Connect(e.to_string()))),
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut session = SyncSession::new(Uuid::new_v4(), self.document_id);

        // Announce what we have
        {
            let replica = self.replica.lock().await;
            let hello = session.open(&replica).encode();
            ws_sender
                .send(Message::Binary(hello.into()))
                .await
                .map_err(|_| self.fail_with(ClientError::ConnectionClosed))?;
        }

        *self.state.write().await = ConnectionState::Syncing;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Drive the handshake within the bounded window
        let deadline = Instant::now() + self.config.handshake_timeout;
        while !session.is_live() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| self.fail_handshake())?;

            let frame = tokio::time::timeout(remaining, ws_receiver.next())
                .await
                .map_err(|_| self.fail_handshake())?;

            let bytes: Vec<u8> = match frame {
                Some(Ok(Message::Binary(data))) => data.into(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(self.fail_with(ClientError::ConnectionClosed))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(self.fail_with(ClientError::Connect(e.to_string())))
                }
            };

            let msg = ProtocolMessage::decode(&bytes)
                .map_err(|e| self.fail_with(ClientError::MalformedFrame(e)))?;

            let output = {
                let mut replica = self.replica.lock().await;
                session
                    .handle(&mut replica, msg)
                    .into_result()
                    .map_err(|e| self.fail_with(ClientError::Session(e)))?
            };

            for reply in output.outbound {
                ws_sender
                    .send(Message::Binary(reply.encode().into()))
                    .await
                    .map_err(|_| self.fail_with(ClientError::ConnectionClosed))?;
            }
            self.apply_effects(output.effects).await;
        }

        self.live.store(true, Ordering::Release);
        *self.state.write().await = ConnectionState::Live;
        let _ = self.event_tx.send(SyncEvent::Live).await;
        log::info!(
            "client {} live on document {}",
            self.principal.client_id,
            self.document_id
        );

        // Resubmit everything still unacked from before the disconnect,
        // under the original uuids, before accepting new local edits.
        let retained = self.pending.lock().await.resubmit_batch();
        if !retained.is_empty() {
            log::info!("resubmitting {} retained updates", retained.len());
            for (uuid, update) in retained {
                let frame = ProtocolMessage::DocumentUpdate { uuid, update }.encode();
                ws_sender
                    .send(Message::Binary(frame.into()))
                    .await
                    .map_err(|_| self.fail_with(ClientError::ConnectionClosed))?;
                let _ = self
                    .event_tx
                    .send(SyncEvent::UpdateResubmitted { uuid })
                    .await;
            }
        }

        // Drain edits accumulated while offline into a fresh update.
        {
            let mut replica = self.replica.lock().await;
            if let Some((uuid, msg)) = session.capture_local(&mut replica) {
                drop(replica);
                if let ProtocolMessage::DocumentUpdate { ref update, .. } = msg {
                    self.pending.lock().await.enqueue(uuid, update.clone());
                }
                ws_sender
                    .send(Message::Binary(msg.encode().into()))
                    .await
                    .map_err(|_| self.fail_with(ClientError::ConnectionClosed))?;
            }
        }

        // Hand the connection to the driver task.
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        *self.cmd_tx.write().await = Some(cmd_tx);

        let driver = Driver {
            session,
            replica: self.replica.clone(),
            pending: self.pending.clone(),
            awareness: self.awareness.clone(),
            live: self.live.clone(),
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            ack_timeout: self.config.ack_timeout,
            ack_scan_interval: self.config.ack_scan_interval,
        };
        tokio::spawn(driver.run(ws_sender, ws_receiver, cmd_rx));

        Ok(())
    }

    /// Retry `connect()` with a fixed backoff between attempts.
    pub async fn connect_with_retry(
        &mut self,
        attempts: usize,
        backoff: Duration,
    ) -> Result<(), ClientError> {
        let mut last = ClientError::ConnectionClosed;
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("connect attempt {attempt}/{attempts} failed: {e}");
                    last = e;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(last)
    }

    /// Apply a local insert. Works offline; the edit accumulates in the
    /// replica until committed.
    pub async fn insert_text(&self, index: u32, content: &str) {
        self.replica.lock().await.insert_text(index, content);
    }

    /// Apply a local deletion. Works offline.
    pub async fn delete_text(&self, index: u32, len: u32) {
        self.replica.lock().await.delete_text(index, len);
    }

    /// Current contents of the shared text root.
    pub async fn text_content(&self) -> String {
        self.replica.lock().await.text_content()
    }

    /// Capture accumulated local edits and submit them as one acknowledged
    /// update. Returns its correlation id, or `None` when there was nothing
    /// to send or no live connection (the edits keep accumulating).
    pub async fn commit_local_edits(&self) -> Result<Option<Uuid>, ClientError> {
        if self.pending.lock().await.is_full() {
            return Err(ClientError::QueueFull);
        }
        let sender = self.cmd_tx.read().await.clone();
        let Some(sender) = sender else {
            return Ok(None);
        };
        let (reply, reply_rx) = oneshot::channel();
        if sender.send(LocalCmd::Commit { reply }).await.is_err() {
            return Ok(None);
        }
        reply_rx.await.unwrap_or(Ok(None))
    }

    /// Publish the local presence payload. A silent no-op while not `Live`.
    pub async fn publish_awareness(&self, payload: Vec<u8>) {
        let frame = self.awareness.lock().await.publish(payload);
        let Some(frame) = frame else { return };
        let sender = self.cmd_tx.read().await.clone();
        if let Some(sender) = sender {
            let _ = sender.send(LocalCmd::Forward(frame.encode())).await;
        }
    }

    /// Register a callback for remote presence changes.
    pub async fn subscribe_awareness(&self, callback: AwarenessCallback) {
        self.awareness.lock().await.subscribe(callback);
    }

    /// Tear the connection down. Pending updates are retained for the next
    /// `connect()`.
    pub async fn disconnect(&self) {
        let sender = self.cmd_tx.write().await.take();
        if let Some(sender) = sender {
            let _ = sender.send(LocalCmd::Shutdown).await;
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// UI-facing status line for the presence indicator.
    pub async fn user_status(&self) -> TranslatedOutcome<()> {
        match *self.state.read().await {
            ConnectionState::Live => TranslatedOutcome::ok(()),
            ConnectionState::Connecting | ConnectionState::Syncing => {
                TranslatedOutcome::fail("Connecting…")
            }
            ConnectionState::Disconnected => TranslatedOutcome::fail("Reconnecting…"),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn fail_handshake(&self) -> ClientError {
        self.fail_with(ClientError::HandshakeTimeout)
    }

    fn fail_with(&self, error: ClientError) -> ClientError {
        self.live.store(false, Ordering::Release);
        // State flips to Disconnected on the blocking path; the async lock
        // is not available here, so use the cheap signal the tasks share.
        let state = self.state.clone();
        tokio::spawn(async move {
            *state.write().await = ConnectionState::Disconnected;
        });
        error
    }

    async fn apply_effects(&self, effects: Vec<SessionEffect>) {
        apply_session_effects(effects, &self.pending, &self.awareness, &self.event_tx).await;
    }
}

/// Interpret one step's effects on the client side: clear acked entries,
/// fold in remote presence, surface events.
async fn apply_session_effects(
    effects: Vec<SessionEffect>,
    pending: &Arc<Mutex<PendingUpdates>>,
    awareness: &Arc<Mutex<AwarenessChannel>>,
    event_tx: &mpsc::Sender<SyncEvent>,
) {
    for effect in effects {
        match effect {
            SessionEffect::Committed { uuid, .. } => {
                let _ = event_tx.send(SyncEvent::RemoteUpdate { uuid }).await;
            }
            SessionEffect::Acked { uuid } => {
                // `acknowledge` reports whether the uuid was still pending,
                // so a re-acked duplicate clears the queue exactly once.
                if pending.lock().await.acknowledge(&uuid) {
                    let _ = event_tx.send(SyncEvent::UpdateAcked { uuid }).await;
                }
            }
            SessionEffect::AwarenessReceived { payload } => {
                match AwarenessUpdate::decode(&payload) {
                    Ok(update) => {
                        let client_id = update.client_id;
                        let data = update.data.clone();
                        awareness.lock().await.apply_remote(update);
                        let _ = event_tx
                            .send(SyncEvent::AwarenessChanged {
                                client_id,
                                payload: data,
                            })
                            .await;
                    }
                    Err(e) => log::warn!("undecodable awareness payload: {e}"),
                }
            }
            SessionEffect::PhaseChanged(phase) => {
                log::debug!("session phase: {phase:?}");
            }
        }
    }
}

/// Owns the socket and the session machine for one connection.
struct Driver {
    session: SyncSession,
    replica: Arc<Mutex<DocumentReplica>>,
    pending: Arc<Mutex<PendingUpdates>>,
    awareness: Arc<Mutex<AwarenessChannel>>,
    live: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SyncEvent>,
    ack_timeout: Duration,
    ack_scan_interval: Duration,
}

impl Driver {
    async fn run<S, R>(mut self, mut ws_sender: S, mut ws_receiver: R, mut cmd_rx: mpsc::Receiver<LocalCmd>)
    where
        S: futures_util::Sink<Message> + Unpin,
        R: futures_util::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let mut ack_scan = tokio::time::interval(self.ack_scan_interval);
        ack_scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            if !self.handle_frame(&mut ws_sender, bytes).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("websocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(LocalCmd::Commit { reply }) => {
                            let result = self.commit(&mut ws_sender).await;
                            let _ = reply.send(result);
                        }
                        Some(LocalCmd::Forward(bytes)) => {
                            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(LocalCmd::Shutdown) | None => break,
                    }
                }

                _ = ack_scan.tick() => {
                    let expired = self.pending.lock().await.timed_out(self.ack_timeout);
                    for (uuid, update) in expired {
                        log::info!("update {uuid} unacked past timeout, resubmitting");
                        let frame = ProtocolMessage::DocumentUpdate { uuid, update }.encode();
                        if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                        let _ = self.event_tx.send(SyncEvent::UpdateResubmitted { uuid }).await;
                    }
                }
            }
        }

        // Connection gone: session dies, pending updates survive for the
        // next connect().
        self.live.store(false, Ordering::Release);
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        log::info!("connection closed, {} updates retained", self.pending.lock().await.len());
    }

    /// Returns `false` when the session must be torn down.
    async fn handle_frame<S>(&mut self, ws_sender: &mut S, bytes: Vec<u8>) -> bool
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let msg = match ProtocolMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable frame: {e}");
                return false;
            }
        };

        let outcome = {
            let mut replica = self.replica.lock().await;
            self.session.handle(&mut replica, msg)
        };

        if outcome.is_failed() {
            let error = outcome.error();
            log::warn!("session failed: {error}");
            let _ = self
                .event_tx
                .send(SyncEvent::SyncFailure {
                    message: error.to_string(),
                })
                .await;
            return false;
        }

        let output = outcome.into_value();
        for reply in output.outbound {
            if ws_sender
                .send(Message::Binary(reply.encode().into()))
                .await
                .is_err()
            {
                return false;
            }
        }

        apply_session_effects(output.effects, &self.pending, &self.awareness, &self.event_tx)
            .await;

        true
    }

    async fn commit<S>(&mut self, ws_sender: &mut S) -> Result<Option<Uuid>, ClientError>
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let captured = {
            let mut replica = self.replica.lock().await;
            self.session.capture_local(&mut replica)
        };
        let Some((uuid, msg)) = captured else {
            return Ok(None);
        };

        if let ProtocolMessage::DocumentUpdate { ref update, .. } = msg {
            if !self.pending.lock().await.enqueue(uuid, update.clone()) {
                return Err(ClientError::QueueFull);
            }
        }

        ws_sender
            .send(Message::Binary(msg.encode().into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        Ok(Some(uuid))
    }
}
