use std::future::Future;

use crate::error::CdcResult;
use crate::types::CdcPosition;

/// Contract for persisting the last successfully processed position per
/// connector.
///
/// Positions are stored as the opaque byte blobs produced by
/// [`crate::types::PositionToken::to_bytes`]; only the connector that wrote a
/// blob can decode it. The store never interprets or orders blobs, and it
/// does not enforce monotonicity: the processor guarantees it by saving only
/// after successful dispatch, in stream order.
///
/// For sharded sources the processor derives one key per shard, so a single
/// store instance serves an entire sharded connector.
pub trait PositionStore: Clone + Send + Sync + 'static {
    /// Loads the persisted position blob for `connector_id`.
    ///
    /// Returns [`None`] when no position has ever been saved, which the
    /// processor treats as a start from the connector's default position.
    fn get_position(
        &self,
        connector_id: &str,
    ) -> impl Future<Output = CdcResult<Option<Vec<u8>>>> + Send;

    /// Persists `position` for `connector_id`, replacing any previous value.
    fn save_position(
        &self,
        connector_id: &str,
        position: &CdcPosition,
    ) -> impl Future<Output = CdcResult<()>> + Send;

    /// Deletes the persisted position for `connector_id`.
    ///
    /// Returns whether a position existed. Used to reset a connector to its
    /// default start position.
    fn delete_position(&self, connector_id: &str) -> impl Future<Output = CdcResult<bool>> + Send;
}
