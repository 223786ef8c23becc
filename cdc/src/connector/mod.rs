//! Connector contracts for provider-specific change capture.
//!
//! A connector wraps one source's native change-capture mechanism (a
//! change-tracking table, WAL decoding, binlog parsing, a change stream
//! cursor) behind a uniform streaming contract. The capture core never looks
//! inside a connector; it only consumes the event stream and the position
//! cursor.

pub mod sharded;

use std::collections::HashMap;
use std::future::Future;

use futures::stream::BoxStream;

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::CdcResult;
use crate::types::{CdcPosition, ChangeEvent};

/// Stream of change-event results produced by a connector.
///
/// The stream is conceptually infinite: it suspends while the source is idle
/// and ends only when the source closes the capture channel. An error item
/// signals a stream-level failure; the connector does not recover internally.
pub type EventStream = BoxStream<'static, CdcResult<ChangeEvent>>;

/// Contract implemented per database technology to produce change events.
///
/// Implementations are restartable by re-invoking [`Connector::stream_changes`]
/// with a previously persisted position blob, which the connector decodes into
/// its own position type to resume exactly where processing left off.
pub trait Connector: Send + Sync + 'static {
    /// Stable identifier under which this connector's position is persisted.
    fn id(&self) -> &str;

    /// Starts streaming change events.
    ///
    /// `resume` is the opaque position blob previously persisted for this
    /// connector, or [`None`] to start from the connector-defined default
    /// (the beginning of the change log or the current end, depending on the
    /// provider). The stream observes `shutdown_rx` cooperatively and stops
    /// yielding once shutdown is signaled.
    fn stream_changes(
        &self,
        resume: Option<Vec<u8>>,
        shutdown_rx: ShutdownRx,
    ) -> impl Future<Output = CdcResult<EventStream>> + Send;

    /// Returns the connector's current position in the source change log.
    fn current_position(&self) -> impl Future<Output = CdcResult<CdcPosition>> + Send;

    /// Releases provider resources held by this connector.
    ///
    /// Override this method if the connector holds connections or replication
    /// slots that need explicit teardown. The default implementation is a
    /// no-op.
    fn dispose(&self) -> impl Future<Output = CdcResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Topology entry describing one shard of a sharded source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    /// Identifier of the shard, unique within its topology.
    pub shard_id: String,
    /// Free-form provider settings needed to open the shard's change stream.
    pub properties: HashMap<String, String>,
}

impl ShardInfo {
    /// Creates a topology entry without provider settings.
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            properties: HashMap::new(),
        }
    }
}
