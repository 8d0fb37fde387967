//! Opaque adapter around the CRDT substrate (Yrs).
//!
//! This is the only module that touches `yrs` types directly. Everything
//! else in the crate traffics in the encoded [`StateVector`] and
//! [`UpdateFragment`] byte forms, so the substrate could be swapped without
//! touching the protocol or session layers.
//!
//! The substrate contract this crate relies on:
//! - merge is commutative, associative, and idempotent over fragments
//! - a diff against a remote state vector contains exactly what the remote
//!   is missing (plus the full delete set, which re-applies as a no-op)
//! - two replicas with equal state vectors are convergent
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Snapshot, Text, Transact, Update, WriteTxn};

use crate::protocol::{StateVector, UpdateFragment};

/// Name of the shared text root. Must match across all replicas of a
/// document.
const TEXT_ROOT: &str = "content";

/// One replica of a shared document.
///
/// Local edits accumulate inside the replica regardless of connectivity and
/// are drained with [`capture_local_update`]. The capture baseline is a full
/// snapshot (state vector + delete set) so that pure deletions — which do
/// not advance the state vector — are still detected and propagated.
///
/// [`capture_local_update`]: DocumentReplica::capture_local_update
pub struct DocumentReplica {
    doc: Doc,
    /// Snapshot at the last capture; the baseline the next capture diffs
    /// against. Fast-forwarded over remote merges when no local edits are
    /// pending, so remote operations are not echoed back.
    captured: Snapshot,
}

impl DocumentReplica {
    pub fn new() -> Self {
        let doc = Doc::new();
        let captured = {
            let txn = doc.transact();
            txn.snapshot()
        };
        Self { doc, captured }
    }

    /// Encoded summary of every operation this replica has incorporated.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        StateVector::new(txn.state_vector().encode_v1())
    }

    /// Fragment containing only the operations the remote is missing.
    ///
    /// An already-converged remote receives an empty-effect fragment, which
    /// it merges as a no-op. Fails with [`MergeError::Corrupt`] when the
    /// remote vector does not decode.
    pub fn diff(&self, remote: &StateVector) -> Result<UpdateFragment, MergeError> {
        let remote_sv = yrs::StateVector::decode_v1(remote.as_bytes())
            .map_err(|e| MergeError::Corrupt(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(UpdateFragment::new(txn.encode_diff_v1(&remote_sv)))
    }

    /// Merge a fragment into this replica. Idempotent: re-applying a known
    /// fragment is a no-op. Fails only on fragments that are not a valid
    /// encoding for the substrate — never due to arrival order.
    pub fn merge(&mut self, fragment: &UpdateFragment) -> Result<(), MergeError> {
        let update = Update::decode_v1(fragment.as_bytes())
            .map_err(|e| MergeError::Corrupt(e.to_string()))?;

        let clean = {
            let txn = self.doc.transact();
            txn.snapshot() == self.captured
        };

        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| MergeError::Corrupt(e.to_string()))?;
        }

        // Nothing local was pending, so the merged remote operations can be
        // folded into the capture baseline instead of being echoed back on
        // the next capture.
        if clean {
            let txn = self.doc.transact();
            self.captured = txn.snapshot();
        }

        Ok(())
    }

    /// Drain operations produced by local edits since the last capture.
    ///
    /// Returns `None` when nothing changed. When local edits interleave
    /// with remote merges the fragment may also carry already-known remote
    /// operations; recipients merge those as no-ops.
    pub fn capture_local_update(&mut self) -> Option<UpdateFragment> {
        let (snapshot, diff) = {
            let txn = self.doc.transact();
            let snapshot = txn.snapshot();
            if snapshot == self.captured {
                return None;
            }
            let diff = txn.encode_diff_v1(&self.captured.state_map);
            (snapshot, diff)
        };
        self.captured = snapshot;
        Some(UpdateFragment::new(diff))
    }

    /// Insert into the shared text root at a character offset.
    ///
    /// Edit surface for the editor collaborator; applied locally whether or
    /// not a connection exists.
    pub fn insert_text(&self, index: u32, content: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.insert(&mut txn, index, content);
    }

    /// Delete a character range from the shared text root.
    pub fn delete_text(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(TEXT_ROOT);
        text.remove_range(&mut txn, index, len);
    }

    /// Whether two replicas have incorporated the same set of operations.
    ///
    /// Compares decoded state vectors, not their encodings — the encoded
    /// byte order is not canonical across replicas.
    pub fn is_converged_with(&self, other: &Self) -> bool {
        let ours = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        let theirs = {
            let txn = other.doc.transact();
            txn.state_vector()
        };
        ours == theirs
    }

    /// Current contents of the shared text root.
    pub fn text_content(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(TEXT_ROOT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge failures. Ordering never causes one — only fragments that are not
/// a valid substrate encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    Corrupt(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corrupt(e) => write!(f, "corrupt update fragment: {e}"),
        }
    }
}

impl std::error::Error for MergeError {}
