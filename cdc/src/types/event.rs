use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::concurrency::shutdown::ShutdownRx;
use crate::types::CdcPosition;

/// Kind of change captured from a source table.
///
/// [`ChangeOperation::Snapshot`] describes a row read during an initial or
/// incremental snapshot rather than from the change log; it is dispatched
/// through the insert path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    /// Row insertion with new row data.
    Insert,
    /// Row update with old and new row data.
    Update,
    /// Row deletion with deleted row data.
    Delete,
    /// Row emitted by a snapshot read.
    Snapshot,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "Insert"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
            Self::Snapshot => write!(f, "Snapshot"),
        }
    }
}

/// Provenance and position metadata attached to every captured change.
#[derive(Debug, Clone)]
pub struct ChangeMetadata {
    /// Position of this change in its connector's stream.
    pub position: CdcPosition,
    /// When the connector captured the change.
    pub captured_at: DateTime<Utc>,
    /// Source transaction identifier, when the provider exposes one.
    pub transaction_id: Option<String>,
    /// Name of the source database, when known.
    pub source_database: Option<String>,
    /// Name of the source schema, when known.
    pub source_schema: Option<String>,
}

impl ChangeMetadata {
    /// Creates metadata with the given position, captured now, without
    /// provider-specific provenance.
    pub fn at_position(position: CdcPosition) -> Self {
        Self {
            position,
            captured_at: Utc::now(),
            transaction_id: None,
            source_database: None,
            source_schema: None,
        }
    }
}

/// One captured change with its row images and provenance.
///
/// Row images are opaque JSON values; the dispatcher deserializes them into
/// the entity type expected by the registered handler. The constructors
/// enforce the image shape per operation: no `before` for inserts and
/// snapshots, no `after` for deletes, and at least one image for updates.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Fully qualified name of the changed table.
    pub table_name: String,
    /// Kind of change.
    pub operation: ChangeOperation,
    /// Row image before the change, when the provider supplies one.
    pub before: Option<Value>,
    /// Row image after the change.
    pub after: Option<Value>,
    /// Provenance and position metadata.
    pub metadata: ChangeMetadata,
}

impl ChangeEvent {
    /// Creates an insert event carrying the new row image.
    pub fn insert(table_name: impl Into<String>, after: Value, metadata: ChangeMetadata) -> Self {
        Self {
            table_name: table_name.into(),
            operation: ChangeOperation::Insert,
            before: None,
            after: Some(after),
            metadata,
        }
    }

    /// Creates an update event. The old row image may be absent when the
    /// provider only replicates key columns.
    pub fn update(
        table_name: impl Into<String>,
        before: Option<Value>,
        after: Value,
        metadata: ChangeMetadata,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            operation: ChangeOperation::Update,
            before,
            after: Some(after),
            metadata,
        }
    }

    /// Creates a delete event. The deleted row image may be absent when the
    /// provider only replicates key columns.
    pub fn delete(
        table_name: impl Into<String>,
        before: Option<Value>,
        metadata: ChangeMetadata,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            operation: ChangeOperation::Delete,
            before,
            after: None,
            metadata,
        }
    }

    /// Creates a snapshot event carrying the row image read from the source.
    pub fn snapshot(table_name: impl Into<String>, after: Value, metadata: ChangeMetadata) -> Self {
        Self {
            table_name: table_name.into(),
            operation: ChangeOperation::Snapshot,
            before: None,
            after: Some(after),
            metadata,
        }
    }
}

/// Context passed to every handler and interceptor invocation.
///
/// Carries no mutable state: handlers observe the table, the event metadata
/// and the pipeline cancellation signal, nothing else.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    /// Fully qualified name of the changed table.
    pub table_name: String,
    /// Provenance and position metadata of the event being handled.
    pub metadata: ChangeMetadata,
    shutdown_rx: ShutdownRx,
}

impl ChangeContext {
    /// Creates a context for one handler invocation.
    pub fn new(table_name: String, metadata: ChangeMetadata, shutdown_rx: ShutdownRx) -> Self {
        Self {
            table_name,
            metadata,
            shutdown_rx,
        }
    }

    /// Returns whether pipeline shutdown has been requested.
    ///
    /// Long-running handlers should check this cooperatively and return early
    /// when cancellation is observed.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown_rx.has_changed().unwrap_or(true)
    }
}

/// A change event wrapped with the identity of the shard it came from.
///
/// Positions are shard-local, never global, so consumers of an aggregated
/// multi-shard stream need the shard id to interpret `shard_position`.
#[derive(Debug, Clone)]
pub struct ShardedChangeEvent {
    /// Identifier of the shard that produced the event.
    pub shard_id: String,
    /// The captured change.
    pub event: ChangeEvent,
    /// Position of the event within its shard's stream.
    pub shard_position: CdcPosition,
}
