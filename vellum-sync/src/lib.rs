//! # vellum-sync — Realtime document synchronization core for Vellum
//!
//! Keeps editing clients and a relay server converged on one shared
//! document using a CRDT update stream, explicit durability acks, and
//! ephemeral presence broadcast.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer       │
//! │ (per user)  │    Tagged frames   │ (relay)          │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ SyncSession │                    │ DocumentActor    │
//! │ + replica   │                    │ (single writer)  │
//! │ + pending   │                    │ replica + log    │
//! └─────────────┘                    └────────┬─────────┘
//!                                             │
//!                                    ┌────────┴─────────┐
//!                                    │ BroadcastGroup   │
//!                                    │ (fan-out + acks) │
//!                                    └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — tagged binary wire codec
//! - [`outcome`] — explicit success/failure wrapper for boundary crossings
//! - [`document`] — opaque adapter over the CRDT substrate (Yrs)
//! - [`session`] — pure per-connection state machine
//! - [`journal`] — append-only per-document update log + durability hook
//! - [`broadcast`] — per-document fan-out
//! - [`server`] — relay server with one writer actor per document
//! - [`client`] — sync client with offline accumulation and resubmission
//! - [`awareness`] — last-writer-wins presence channel
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Convergence | state-vector diff exchange on every handshake |
//! | At-least-once safety | idempotent merge; duplicates re-acked |
//! | Durable ordering | single-writer actor assigns log sequence numbers |
//! | Bounded late join | one diff fragment, never raw log replay |

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod document;
pub mod journal;
pub mod outcome;
pub mod protocol;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use awareness::{AwarenessCallback, AwarenessChannel};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use client::{
    ClientConfig, ClientError, ConnectionState, PendingUpdates, SyncClient, SyncEvent,
};
pub use document::{DocumentReplica, MergeError};
pub use journal::{Appended, DocumentLog, DurabilityHook, LogEntry, NoopDurability};
pub use outcome::{Outcome, TranslatedOutcome};
pub use protocol::{
    AwarenessUpdate, DecodeError, Principal, ProtocolMessage, StateVector, UpdateFragment,
};
pub use server::{
    DocumentHandle, DocumentRegistry, DocumentStats, ServerConfig, ServerError, ServerStats,
    SyncServer,
};
pub use session::{SessionEffect, SessionError, SessionPhase, StepOutput, SyncSession};
