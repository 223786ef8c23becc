use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::types::ChangeEvent;

/// Lifecycle state of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// The entry awaits an operator decision.
    Pending,
    /// The entry has been replayed or discarded.
    Resolved,
}

/// Operator decision applied to a pending dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterResolution {
    /// The event was re-dispatched through the pipeline.
    Replay,
    /// The event was dropped deliberately.
    Discard,
}

/// An event parked after its dispatch exhausted the retry policy.
///
/// The entry carries the full original event so replay needs no access to the
/// source, plus a snapshot of the final error for diagnosis. Entries are
/// immutable except for their resolution state.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Unique identifier of the entry.
    pub id: Uuid,
    /// The event whose dispatch failed.
    pub event: ChangeEvent,
    /// Shard the event came from, for sharded sources.
    pub shard_id: Option<String>,
    /// Classification of the final dispatch error.
    pub error_kind: ErrorKind,
    /// Static description of the final dispatch error.
    pub error_description: String,
    /// Dynamic detail of the final dispatch error, when present.
    pub error_detail: Option<String>,
    /// When the final dispatch attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Lifecycle state of the entry.
    pub status: DeadLetterStatus,
    /// Decision applied when the entry was resolved.
    pub resolution: Option<DeadLetterResolution>,
}

impl DeadLetterEntry {
    /// Creates a pending entry from a failed event and its final error.
    pub fn new(event: ChangeEvent, shard_id: Option<String>, error: &CdcError) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            shard_id,
            error_kind: error.kind(),
            error_description: error.description().to_string(),
            error_detail: error.detail().map(str::to_string),
            failed_at: Utc::now(),
            status: DeadLetterStatus::Pending,
            resolution: None,
        }
    }
}

/// Contract for persisting and resolving dead-lettered events.
///
/// Resolution is single-shot: once an entry is resolved it can never be
/// resolved again. A replay that fails again produces a fresh pending entry
/// rather than reopening the resolved one, so the store keeps a complete
/// failure history.
pub trait DeadLetterStore: Clone + Send + Sync + 'static {
    /// Persists a new pending entry.
    fn add(&self, entry: DeadLetterEntry) -> impl Future<Output = CdcResult<()>> + Send;

    /// Returns up to `max_count` pending entries, oldest first.
    fn get_pending(
        &self,
        max_count: usize,
    ) -> impl Future<Output = CdcResult<Vec<DeadLetterEntry>>> + Send;

    /// Looks up one entry by id, regardless of its status.
    fn get(&self, entry_id: Uuid) -> impl Future<Output = CdcResult<Option<DeadLetterEntry>>> + Send;

    /// Marks a pending entry as resolved with `resolution` and returns the
    /// resolved entry.
    ///
    /// Fails with [`ErrorKind::DeadLetterEntryNotFound`] for an unknown id and
    /// with [`ErrorKind::DeadLetterEntryResolved`] for an entry that was
    /// already resolved.
    fn resolve(
        &self,
        entry_id: Uuid,
        resolution: DeadLetterResolution,
    ) -> impl Future<Output = CdcResult<DeadLetterEntry>> + Send;
}
