//! WebSocket relay server with per-document writer actors.
//!
//! ```text
//! Client A ──┐                        ┌── DocumentActor (doc 1) ──┐
//! Client B ──┼── accept loop ── mpsc ─┤    replica + log + group  ├─ hook
//! Client C ──┘                        └── DocumentActor (doc 2) ──┘
//! ```
//!
//! All state for one document — the authoritative replica, the append-only
//! [`DocumentLog`] and the [`BroadcastGroup`] — is owned by exactly one
//! actor task. Connection tasks never touch it directly; they forward
//! decoded-or-not frames over the actor's command channel and receive
//! frames back over a per-session direct channel (handshake replies, acks)
//! and the broadcast channel (fan-out). That single-writer discipline gives
//! the log a total order without any fragment-level locking, while separate
//! documents proceed fully in parallel.
//!
//! The actor never blocks on a slow session: direct sends use `try_send`
//! and drop the frame when the session's buffer is full — the client's
//! ack-timeout resubmission makes that safe.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::document::DocumentReplica;
use crate::journal::{Appended, DocumentLog, DurabilityHook, NoopDurability};
use crate::protocol::{Principal, ProtocolMessage};
use crate::session::{SessionEffect, SyncSession};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Per-session direct channel capacity
    pub session_buffer: usize,
    /// Actor command channel capacity per document
    pub command_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            session_buffer: 256,
            command_buffer: 256,
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_documents: usize,
}

/// Per-document counters, answered by the actor.
#[derive(Debug, Clone, Default)]
pub struct DocumentStats {
    pub sessions: usize,
    pub log_len: usize,
    pub last_seq: u64,
}

/// Server-side failures surfaced to connection tasks.
#[derive(Debug, Clone)]
pub enum ServerError {
    /// The document actor is gone; the connection cannot proceed.
    DocumentClosed,
    /// Connection upgrade or socket failure.
    Transport(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentClosed => write!(f, "document actor closed"),
            Self::Transport(e) => write!(f, "transport failure: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Frames the actor pushes to one session's connection task.
#[derive(Debug)]
pub enum SessionOutbound {
    Frame(Vec<u8>),
    /// The session is closed server-side; tear the transport down.
    Close,
}

enum DocCommand {
    Attach {
        session_id: Uuid,
        principal: Principal,
        outbound: mpsc::Sender<SessionOutbound>,
        reply: oneshot::Sender<broadcast::Receiver<Frame>>,
    },
    Inbound {
        session_id: Uuid,
        frame: Vec<u8>,
    },
    Detach {
        session_id: Uuid,
    },
    Stats {
        reply: oneshot::Sender<DocumentStats>,
    },
}

/// Cloneable address of one document's writer actor.
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: Uuid,
    tx: mpsc::Sender<DocCommand>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Register a session with the document. The actor replies with the
    /// broadcast receiver and immediately opens the handshake by sending
    /// its `SyncStep1` down the session's direct channel.
    pub async fn attach(
        &self,
        session_id: Uuid,
        principal: Principal,
        outbound: mpsc::Sender<SessionOutbound>,
    ) -> Result<broadcast::Receiver<Frame>, ServerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(DocCommand::Attach {
                session_id,
                principal,
                outbound,
                reply,
            })
            .await
            .map_err(|_| ServerError::DocumentClosed)?;
        reply_rx.await.map_err(|_| ServerError::DocumentClosed)
    }

    /// Forward a raw inbound frame for the actor to decode and process.
    pub async fn inbound(&self, session_id: Uuid, frame: Vec<u8>) -> Result<(), ServerError> {
        self.tx
            .send(DocCommand::Inbound { session_id, frame })
            .await
            .map_err(|_| ServerError::DocumentClosed)
    }

    pub async fn detach(&self, session_id: Uuid) {
        let _ = self.tx.send(DocCommand::Detach { session_id }).await;
    }

    pub async fn stats(&self) -> Result<DocumentStats, ServerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(DocCommand::Stats { reply })
            .await
            .map_err(|_| ServerError::DocumentClosed)?;
        reply_rx.await.map_err(|_| ServerError::DocumentClosed)
    }
}

struct SessionSlot {
    session: SyncSession,
    outbound: mpsc::Sender<SessionOutbound>,
    principal: Principal,
}

/// Single writer for one document's shared state.
struct DocumentActor {
    document_id: Uuid,
    replica: DocumentReplica,
    log: DocumentLog,
    group: BroadcastGroup,
    sessions: HashMap<Uuid, SessionSlot>,
}

impl DocumentActor {
    fn new(document_id: Uuid, broadcast_capacity: usize, hook: Arc<dyn DurabilityHook>) -> Self {
        Self {
            document_id,
            replica: DocumentReplica::new(),
            log: DocumentLog::new(document_id, hook),
            group: BroadcastGroup::new(broadcast_capacity),
            sessions: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        log::info!("document {} actor started", self.document_id);

        while let Some(cmd) = rx.recv().await {
            match cmd {
                DocCommand::Attach {
                    session_id,
                    principal,
                    outbound,
                    reply,
                } => self.attach(session_id, principal, outbound, reply),
                DocCommand::Inbound { session_id, frame } => {
                    self.handle_inbound(session_id, frame);
                }
                DocCommand::Detach { session_id } => self.detach(session_id),
                DocCommand::Stats { reply } => {
                    let _ = reply.send(DocumentStats {
                        sessions: self.sessions.len(),
                        log_len: self.log.len(),
                        last_seq: self.log.last_seq(),
                    });
                }
            }
        }

        log::info!("document {} actor stopped", self.document_id);
    }

    fn attach(
        &mut self,
        session_id: Uuid,
        principal: Principal,
        outbound: mpsc::Sender<SessionOutbound>,
        reply: oneshot::Sender<broadcast::Receiver<Frame>>,
    ) {
        let session = SyncSession::new(session_id, self.document_id);
        let hello = session.open(&self.replica);

        let receiver = self.group.attach(session_id, principal.clone());
        self.sessions.insert(
            session_id,
            SessionSlot {
                session,
                outbound,
                principal: principal.clone(),
            },
        );

        self.send_direct(&session_id, hello);
        let _ = reply.send(receiver);

        log::info!(
            "client {} joined document {} (session {}, {} sessions attached)",
            principal.client_id,
            self.document_id,
            session_id,
            self.sessions.len()
        );
    }

    fn detach(&mut self, session_id: Uuid) {
        self.group.detach(&session_id);
        if let Some(slot) = self.sessions.remove(&session_id) {
            log::info!(
                "client {} left document {} ({} sessions attached)",
                slot.principal.client_id,
                self.document_id,
                self.sessions.len()
            );
        }
    }

    fn handle_inbound(&mut self, session_id: Uuid, frame: Vec<u8>) {
        let raw = Arc::new(frame);

        let msg = match ProtocolMessage::decode(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!(
                    "document {}: undecodable frame from session {session_id}: {e}",
                    self.document_id
                );
                self.close_session(&session_id);
                return;
            }
        };

        let stepped = {
            let Some(slot) = self.sessions.get_mut(&session_id) else {
                log::debug!(
                    "document {}: frame from unattached session {session_id} dropped",
                    self.document_id
                );
                return;
            };
            let outcome = slot.session.handle(&mut self.replica, msg);
            if outcome.is_failed() {
                log::warn!(
                    "document {}: session {session_id} failed: {}",
                    self.document_id,
                    outcome.error()
                );
                None
            } else {
                Some(outcome.into_value())
            }
        };

        let Some(output) = stepped else {
            self.close_session(&session_id);
            return;
        };

        for reply in output.outbound {
            self.send_direct(&session_id, reply);
        }

        for effect in output.effects {
            match effect {
                SessionEffect::Committed { uuid, update } => {
                    match self.log.append(uuid, update, session_id) {
                        Appended::Fresh(seq) => {
                            self.group.broadcast(session_id, raw.clone());
                            log::debug!(
                                "document {}: update {uuid} appended as seq {seq}",
                                self.document_id
                            );
                        }
                        Appended::Duplicate => {
                            log::debug!(
                                "document {}: duplicate update {uuid} re-acknowledged",
                                self.document_id
                            );
                        }
                    }
                    self.send_direct(&session_id, ProtocolMessage::Ack { uuid });
                }
                SessionEffect::AwarenessReceived { .. } => {
                    self.group.broadcast(session_id, raw.clone());
                }
                SessionEffect::PhaseChanged(phase) => {
                    log::debug!(
                        "document {}: session {session_id} entered {phase:?}",
                        self.document_id
                    );
                }
                // Clients never send acks; nothing to do server-side.
                SessionEffect::Acked { .. } => {}
            }
        }
    }

    /// Push a frame to one session without ever blocking the writer: a full
    /// buffer means a slow consumer and the frame is dropped (resubmission
    /// recovers updates; presence is disposable).
    fn send_direct(&self, session_id: &Uuid, msg: ProtocolMessage) {
        let Some(slot) = self.sessions.get(session_id) else {
            return;
        };
        if slot
            .outbound
            .try_send(SessionOutbound::Frame(msg.encode()))
            .is_err()
        {
            log::warn!(
                "document {}: dropped {} frame for slow session {session_id}",
                self.document_id,
                msg.kind()
            );
        }
    }

    fn close_session(&mut self, session_id: &Uuid) {
        if let Some(slot) = self.sessions.get_mut(session_id) {
            slot.session.close();
            let _ = slot.outbound.try_send(SessionOutbound::Close);
        }
    }
}

/// Registry of live document actors. Actors are spawned lazily on first
/// attach and live for the process lifetime.
pub struct DocumentRegistry {
    docs: RwLock<HashMap<Uuid, DocumentHandle>>,
    config: ServerConfig,
    hook: Arc<dyn DurabilityHook>,
}

impl DocumentRegistry {
    pub fn new(config: ServerConfig, hook: Arc<dyn DurabilityHook>) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            config,
            hook,
        }
    }

    /// Get the handle for a document, spawning its actor if this is the
    /// first session for it.
    pub async fn get_or_create(&self, document_id: Uuid) -> DocumentHandle {
        // Fast path: read lock
        {
            let docs = self.docs.read().await;
            if let Some(handle) = docs.get(&document_id) {
                return handle.clone();
            }
        }

        // Slow path: write lock, re-check, spawn
        let mut docs = self.docs.write().await;
        if let Some(handle) = docs.get(&document_id) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.command_buffer);
        let actor = DocumentActor::new(
            document_id,
            self.config.broadcast_capacity,
            self.hook.clone(),
        );
        tokio::spawn(actor.run(rx));

        let handle = DocumentHandle { document_id, tx };
        docs.insert(document_id, handle.clone());
        handle
    }

    pub async fn document_count(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.docs.read().await.keys().copied().collect()
    }

    /// Handle for an already-created document, if any.
    pub async fn get(&self, document_id: &Uuid) -> Option<DocumentHandle> {
        self.docs.read().await.get(document_id).cloned()
    }
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_durability(config, Arc::new(NoopDurability))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with a collaborator-supplied durability hook; every fresh
    /// log append is handed to it synchronously.
    pub fn with_durability(config: ServerConfig, hook: Arc<dyn DurabilityHook>) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.clone(), hook));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Listen for WebSocket connections. Runs the accept loop forever; call
    /// from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection for its whole lifetime.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<DocumentRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The request path carries the pre-validated document/principal
        // pair: /{document_id}/{client_id}. Authorization happened before
        // this core ever sees the connection.
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;

        let Some((document_id, client_id)) = parse_session_path(&path) else {
            log::warn!("rejected connection from {addr}: malformed path {path:?}");
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let session_id = Uuid::new_v4();
        let principal = Principal::with_id(client_id, "anonymous");

        let handle = registry.get_or_create(document_id).await;
        let (direct_tx, mut direct_rx) = mpsc::channel(config.session_buffer);
        let mut broadcast_rx = handle.attach(session_id, principal, direct_tx).await?;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_documents = registry.document_count().await;
        }

        log::info!("session {session_id} on document {document_id} from {addr}");

        loop {
            tokio::select! {
                // Inbound WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            if handle.inbound(session_id, bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Targeted frame from the document actor
                out = direct_rx.recv() => {
                    match out {
                        Some(SessionOutbound::Frame(bytes)) => {
                            ws_sender.send(Message::Binary(bytes.into())).await?;
                        }
                        Some(SessionOutbound::Close) => {
                            log::info!("session {session_id} closed by document actor");
                            break;
                        }
                        None => break,
                    }
                }

                // Fan-out frame from other sessions of this document
                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok((origin, bytes)) => {
                            if origin == session_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed fan-out frames cannot be replayed;
                            // force the client into a fresh resync.
                            log::warn!("session {session_id} lagged by {n} frames, closing");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        handle.detach(session_id).await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Registry of live documents, usable for out-of-band inspection.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }
}

/// Parse `/{document_id}/{client_id}` into the session's identity pair.
fn parse_session_path(path: &str) -> Option<(Uuid, Uuid)> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let document_id = Uuid::parse_str(segments.next()?).ok()?;
    let client_id = Uuid::parse_str(segments.next()?).ok()?;
    if segments.next().is_some() {
        return None;
    }
    Some((document_id, client_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.session_buffer, 256);
        assert_eq!(config.command_buffer, 256);
    }

    #[test]
    fn test_parse_session_path() {
        let doc = Uuid::new_v4();
        let client = Uuid::new_v4();
        let parsed = parse_session_path(&format!("/{doc}/{client}"));
        assert_eq!(parsed, Some((doc, client)));

        assert!(parse_session_path("/").is_none());
        assert!(parse_session_path("/not-a-uuid/also-not").is_none());
        assert!(parse_session_path(&format!("/{doc}")).is_none());
        assert!(parse_session_path(&format!("/{doc}/{client}/extra")).is_none());
    }

    #[tokio::test]
    async fn test_registry_spawns_actor_lazily() {
        let registry =
            DocumentRegistry::new(ServerConfig::default(), Arc::new(NoopDurability));
        assert_eq!(registry.document_count().await, 0);

        let doc_id = Uuid::new_v4();
        let handle = registry.get_or_create(doc_id).await;
        assert_eq!(handle.document_id(), doc_id);
        assert_eq!(registry.document_count().await, 1);

        // Second lookup reuses the same actor
        let again = registry.get_or_create(doc_id).await;
        assert_eq!(again.document_id(), doc_id);
        assert_eq!(registry.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_attach_opens_handshake() {
        let registry =
            DocumentRegistry::new(ServerConfig::default(), Arc::new(NoopDurability));
        let handle = registry.get_or_create(Uuid::new_v4()).await;

        let (direct_tx, mut direct_rx) = mpsc::channel(16);
        let session_id = Uuid::new_v4();
        let _rx = handle
            .attach(session_id, Principal::new("Ada"), direct_tx)
            .await
            .unwrap();

        // The actor opens with its SyncStep1
        match direct_rx.recv().await {
            Some(SessionOutbound::Frame(bytes)) => {
                let msg = ProtocolMessage::decode(&bytes).unwrap();
                assert!(matches!(msg, ProtocolMessage::SyncStep1 { .. }));
            }
            other => panic!("expected handshake frame, got {other:?}"),
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.log_len, 0);
    }

    #[tokio::test]
    async fn test_actor_appends_and_acks_update() {
        let registry =
            DocumentRegistry::new(ServerConfig::default(), Arc::new(NoopDurability));
        let handle = registry.get_or_create(Uuid::new_v4()).await;

        let (direct_tx, mut direct_rx) = mpsc::channel(16);
        let session_id = Uuid::new_v4();
        let _rx = handle
            .attach(session_id, Principal::new("Ada"), direct_tx)
            .await
            .unwrap();
        // Drain the opening SyncStep1
        let _ = direct_rx.recv().await;

        let mut editor = crate::document::DocumentReplica::new();
        editor.insert_text(0, "hi");
        let update = editor.capture_local_update().unwrap();
        let uuid = Uuid::new_v4();
        let frame = ProtocolMessage::DocumentUpdate { uuid, update }.encode();

        handle.inbound(session_id, frame.clone()).await.unwrap();

        // Ack arrives on the direct channel
        match direct_rx.recv().await {
            Some(SessionOutbound::Frame(bytes)) => {
                let msg = ProtocolMessage::decode(&bytes).unwrap();
                assert_eq!(msg, ProtocolMessage::Ack { uuid });
            }
            other => panic!("expected ack frame, got {other:?}"),
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.log_len, 1);
        assert_eq!(stats.last_seq, 1);

        // Retransmission: re-acked, not re-appended
        handle.inbound(session_id, frame).await.unwrap();
        match direct_rx.recv().await {
            Some(SessionOutbound::Frame(bytes)) => {
                let msg = ProtocolMessage::decode(&bytes).unwrap();
                assert_eq!(msg, ProtocolMessage::Ack { uuid });
            }
            other => panic!("expected re-ack frame, got {other:?}"),
        }
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.log_len, 1);
    }

    #[tokio::test]
    async fn test_actor_closes_session_on_garbage() {
        let registry =
            DocumentRegistry::new(ServerConfig::default(), Arc::new(NoopDurability));
        let handle = registry.get_or_create(Uuid::new_v4()).await;

        let (direct_tx, mut direct_rx) = mpsc::channel(16);
        let session_id = Uuid::new_v4();
        let _rx = handle
            .attach(session_id, Principal::new("Ada"), direct_tx)
            .await
            .unwrap();
        let _ = direct_rx.recv().await; // SyncStep1

        // A truncated frame forces the session closed
        handle.inbound(session_id, vec![0x00]).await.unwrap();
        match direct_rx.recv().await {
            Some(SessionOutbound::Close) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
    }
}
