//! Append-only activity trail for committed mutations.
//!
//! Every committed mutation can append one record describing who did what.
//! Recording is fire and forget from the mutation path: a failed append is
//! logged and swallowed, never surfaced to the caller, and never rolls back
//! the mutation it describes.
//!
//! Records carry an FNV-folded checksum so a persisted trail can be
//! verified on recovery and corrupted rows skipped instead of replayed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tabula_core::{epoch_secs, OrderedItem, Scope};
use uuid::Uuid;

/// What a mutation did to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ActivityAction {
    Created = 1,
    Renamed = 2,
    Reordered = 3,
    Deleted = 4,
}

impl ActivityAction {
    pub fn verb(&self) -> &'static str {
        match self {
            ActivityAction::Created => "created",
            ActivityAction::Renamed => "renamed",
            ActivityAction::Reordered => "reordered",
            ActivityAction::Deleted => "deleted",
        }
    }
}

/// Unsequenced activity data as the mutation path hands it to a sink.
///
/// The sink assigns the sequence number; callers never pick one.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub item_id: Uuid,
    pub scope: Scope,
    pub action: ActivityAction,
    pub actor: Uuid,
    pub description: String,
}

impl ActivityEvent {
    /// Build the event for an action on `item`, with a human-readable
    /// description like `deleted task "Fix login"`.
    pub fn for_item(action: ActivityAction, item: &OrderedItem, actor: Uuid) -> Self {
        let description = format!(
            "{} {} \"{}\"",
            action.verb(),
            item.scope.resource_name(),
            item.name
        );
        Self {
            item_id: item.id,
            scope: item.scope,
            action,
            actor,
            description,
        }
    }
}

/// A single sequenced record in the activity trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Monotonically increasing sequence number
    pub sequence: u64,
    pub item_id: Uuid,
    pub scope: Scope,
    pub action: ActivityAction,
    pub actor: Uuid,
    pub description: String,
    /// Seconds since epoch at append time
    pub recorded_at: u64,
    /// FNV-folded checksum for integrity verification
    pub checksum: u32,
}

impl ActivityRecord {
    /// Sequence an event into a record with computed checksum.
    pub fn from_event(sequence: u64, event: ActivityEvent) -> Self {
        let recorded_at = epoch_secs();
        let checksum = Self::compute_checksum(
            sequence,
            event.action,
            &event.item_id,
            &event.actor,
            &event.description,
            recorded_at,
        );
        Self {
            sequence,
            item_id: event.item_id,
            scope: event.scope,
            action: event.action,
            actor: event.actor,
            description: event.description,
            recorded_at,
            checksum,
        }
    }

    /// Verify the record's checksum.
    pub fn verify(&self) -> bool {
        let expected = Self::compute_checksum(
            self.sequence,
            self.action,
            &self.item_id,
            &self.actor,
            &self.description,
            self.recorded_at,
        );
        self.checksum == expected
    }

    /// FNV-1a style fold over the integrity-relevant fields.
    fn compute_checksum(
        sequence: u64,
        action: ActivityAction,
        item_id: &Uuid,
        actor: &Uuid,
        description: &str,
        recorded_at: u64,
    ) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        // Mix sequence
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        // Mix action
        hash ^= action as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        // Mix ids
        for byte in item_id.as_bytes().iter().chain(actor.as_bytes()) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        // Mix description
        for chunk in description.as_bytes().chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        // Mix timestamp
        hash ^= recorded_at as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= (recorded_at >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash
    }

    /// Serialize record to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, AuditError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AuditError::SerializationError(e.to_string()))
    }

    /// Deserialize record from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, AuditError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| AuditError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Audit sink errors.
#[derive(Debug, Clone)]
pub enum AuditError {
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Sink no longer accepts records
    SinkClosed,
    /// Persisted record failed verification
    ChecksumMismatch { sequence: u64 },
    /// Backing store rejected the append
    Backend(String),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::SerializationError(e) => write!(f, "Audit serialization error: {e}"),
            AuditError::DeserializationError(e) => write!(f, "Audit deserialization error: {e}"),
            AuditError::SinkClosed => write!(f, "Audit sink is closed"),
            AuditError::ChecksumMismatch { sequence } => {
                write!(f, "Audit checksum mismatch at sequence {sequence}")
            }
            AuditError::Backend(e) => write!(f, "Audit backend error: {e}"),
        }
    }
}

impl std::error::Error for AuditError {}

/// Where activity records go.
///
/// The mutation path holds this as a trait object so the durable trail and
/// the in-memory test sink are interchangeable.
pub trait AuditSink: Send + Sync {
    /// Append one record, returning its assigned sequence.
    fn record(&self, event: ActivityEvent) -> Result<u64, AuditError>;
}

/// Decode a batch of persisted records, skipping rows that fail checksum
/// verification. Returns valid records sorted by sequence and the count of
/// corrupted rows skipped.
pub fn recover_records(serialized: &[Vec<u8>]) -> (Vec<ActivityRecord>, usize) {
    let mut valid = Vec::with_capacity(serialized.len());
    let mut corrupted = 0;

    for bytes in serialized {
        match ActivityRecord::decode(bytes) {
            Ok(record) => {
                if record.verify() {
                    valid.push(record);
                } else {
                    corrupted += 1;
                }
            }
            Err(_) => {
                corrupted += 1;
            }
        }
    }

    valid.sort_by_key(|r| r.sequence);
    (valid, corrupted)
}

/// In-memory sink for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<ActivityRecord>>,
    next_sequence: AtomicU64,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent records fail, for exercising the swallow path.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: ActivityEvent) -> Result<u64, AuditError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AuditError::SinkClosed);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let record = ActivityRecord::from_event(sequence, event);
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(sequence)
    }
}
