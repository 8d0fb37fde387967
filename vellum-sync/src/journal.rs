//! Append-only per-document update log.
//!
//! The log is owned exclusively by the document's writer actor (see
//! [`server`](crate::server)), which serializes all appends — sequence
//! numbers therefore reflect server arrival order even though CRDT merge
//! itself is commutative.
//!
//! Late-joining sessions never replay raw log entries; they receive a single
//! state-vector diff instead. The log exists for durability (via the
//! collaborator-supplied [`DurabilityHook`]) and for sequencing.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-Structured Storage)

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::UpdateFragment;

/// One accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Monotonically increasing per-document sequence number, from 1.
    pub seq: u64,
    /// Correlation id supplied by the origin client.
    pub uuid: Uuid,
    /// The merged fragment.
    pub update: UpdateFragment,
    /// Session that submitted the update.
    pub origin: Uuid,
}

/// Collaborator-supplied durability callback, invoked synchronously after
/// each fresh append. Storage engine and retention policy are the
/// collaborator's concern, not this crate's.
pub trait DurabilityHook: Send + Sync {
    fn persist(&self, document_id: Uuid, entry: &LogEntry);
}

/// Default hook: updates are durable only in process memory.
pub struct NoopDurability;

impl DurabilityHook for NoopDurability {
    fn persist(&self, _document_id: Uuid, _entry: &LogEntry) {}
}

/// Result of offering an update to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// First acceptance; carries the assigned sequence number.
    Fresh(u64),
    /// The uuid was already accepted. The caller re-acks but does not
    /// broadcast — the fragment is already durable and already fanned out.
    Duplicate,
}

/// Ordered, append-only sequence of accepted updates for one document.
pub struct DocumentLog {
    document_id: Uuid,
    entries: Vec<LogEntry>,
    next_seq: u64,
    /// Correlation ids already accepted, for retransmission detection.
    seen: HashSet<Uuid>,
    hook: Arc<dyn DurabilityHook>,
}

impl DocumentLog {
    pub fn new(document_id: Uuid, hook: Arc<dyn DurabilityHook>) -> Self {
        Self {
            document_id,
            entries: Vec::new(),
            next_seq: 1,
            seen: HashSet::new(),
            hook,
        }
    }

    /// Append a freshly merged update, assigning the next sequence number
    /// and invoking the durability hook. Retransmitted uuids are detected
    /// and not appended again.
    pub fn append(&mut self, uuid: Uuid, update: UpdateFragment, origin: Uuid) -> Appended {
        if !self.seen.insert(uuid) {
            return Appended::Duplicate;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = LogEntry {
            seq,
            uuid,
            update,
            origin,
        };
        self.hook.persist(self.document_id, &entry);
        self.entries.push(entry);

        Appended::Fresh(seq)
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest assigned sequence number, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.seen.contains(uuid)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHook {
        persisted: Mutex<Vec<(Uuid, u64)>>,
    }

    impl RecordingHook {
        fn new() -> Self {
            Self {
                persisted: Mutex::new(Vec::new()),
            }
        }
    }

    impl DurabilityHook for RecordingHook {
        fn persist(&self, document_id: Uuid, entry: &LogEntry) {
            self.persisted
                .lock()
                .unwrap()
                .push((document_id, entry.seq));
        }
    }

    fn fragment(bytes: &[u8]) -> UpdateFragment {
        UpdateFragment::new(bytes.to_vec())
    }

    #[test]
    fn test_sequence_numbers_are_monotonic_from_one() {
        let mut log = DocumentLog::new(Uuid::new_v4(), Arc::new(NoopDurability));
        let origin = Uuid::new_v4();

        assert_eq!(
            log.append(Uuid::new_v4(), fragment(&[1]), origin),
            Appended::Fresh(1)
        );
        assert_eq!(
            log.append(Uuid::new_v4(), fragment(&[2]), origin),
            Appended::Fresh(2)
        );
        assert_eq!(
            log.append(Uuid::new_v4(), fragment(&[3]), origin),
            Appended::Fresh(3)
        );
        assert_eq!(log.last_seq(), 3);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_duplicate_uuid_not_reappended() {
        let mut log = DocumentLog::new(Uuid::new_v4(), Arc::new(NoopDurability));
        let origin = Uuid::new_v4();
        let uuid = Uuid::new_v4();

        assert_eq!(log.append(uuid, fragment(&[1]), origin), Appended::Fresh(1));
        assert_eq!(log.append(uuid, fragment(&[1]), origin), Appended::Duplicate);

        // The retransmission did not consume a sequence number
        assert_eq!(log.last_seq(), 1);
        assert_eq!(log.len(), 1);
        assert!(log.contains(&uuid));
    }

    #[test]
    fn test_entries_record_arrival_order() {
        let mut log = DocumentLog::new(Uuid::new_v4(), Arc::new(NoopDurability));
        let origin_a = Uuid::new_v4();
        let origin_b = Uuid::new_v4();

        log.append(Uuid::new_v4(), fragment(&[0xA]), origin_a);
        log.append(Uuid::new_v4(), fragment(&[0xB]), origin_b);

        let entries = log.entries();
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].origin, origin_a);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(entries[1].origin, origin_b);
    }

    #[test]
    fn test_durability_hook_invoked_once_per_fresh_append() {
        let hook = Arc::new(RecordingHook::new());
        let doc_id = Uuid::new_v4();
        let mut log = DocumentLog::new(doc_id, hook.clone());
        let uuid = Uuid::new_v4();

        log.append(uuid, fragment(&[7]), Uuid::new_v4());
        log.append(uuid, fragment(&[7]), Uuid::new_v4());
        log.append(Uuid::new_v4(), fragment(&[8]), Uuid::new_v4());

        let persisted = hook.persisted.lock().unwrap();
        assert_eq!(persisted.as_slice(), &[(doc_id, 1), (doc_id, 2)]);
    }

    #[test]
    fn test_file_backed_hook() {
        // A hook writing one file per entry, the way a storage collaborator
        // would plug in.
        struct FileHook {
            dir: std::path::PathBuf,
        }

        impl DurabilityHook for FileHook {
            fn persist(&self, _document_id: Uuid, entry: &LogEntry) {
                let path = self.dir.join(format!("{:08}.update", entry.seq));
                std::fs::write(path, entry.update.as_bytes()).unwrap();
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let hook = Arc::new(FileHook {
            dir: dir.path().to_path_buf(),
        });
        let mut log = DocumentLog::new(Uuid::new_v4(), hook);

        log.append(Uuid::new_v4(), fragment(&[1, 2, 3]), Uuid::new_v4());
        log.append(Uuid::new_v4(), fragment(&[4, 5]), Uuid::new_v4());

        let written = std::fs::read(dir.path().join("00000001.update")).unwrap();
        assert_eq!(written, vec![1, 2, 3]);
        let written = std::fs::read(dir.path().join("00000002.update")).unwrap();
        assert_eq!(written, vec![4, 5]);
    }
}
