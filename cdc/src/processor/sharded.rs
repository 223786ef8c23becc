//! Capture loop for aggregated multi-shard streams.
//!
//! The sharded processor is the single consumer of a
//! [`ShardedConnector`]'s fan-in stream. Positions are tracked per shard
//! under derived keys, dead-letter entries carry the shard identity, and a
//! failing shard only stops its own flow; the loop keeps draining sibling
//! shards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cdc_config::shared::CaptureConfig;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cdc_error;
use crate::concurrency::shutdown::{
    ShutdownResult, ShutdownRx, ShutdownTx, create_shutdown_channel,
};
use crate::concurrency::stream::BatchStream;
use crate::connector::sharded::ShardedConnector;
use crate::connector::{Connector, ShardInfo};
use crate::dispatch::Dispatcher;
use crate::error::{CdcResult, ErrorKind};
use crate::processor::retry::{DispatchOutcome, dispatch_with_retry};
use crate::processor::{ProcessorHandle, RetryPolicy};
use crate::store::{DeadLetterEntry, DeadLetterStore, PositionStore};
use crate::types::ShardedChangeEvent;

/// Derives the position-store key for one shard of a sharded connector.
///
/// Shard positions live in their own key space so a sharded connector and a
/// plain connector with the same id never collide.
pub fn shard_position_key(connector_id: &str, shard_id: &str) -> String {
    format!("{connector_id}/{shard_id}")
}

/// Tracks the time of the last successful dispatch per shard.
///
/// The tracker only records observations against the configured lag
/// threshold; deriving health from them is left to the caller. A shard that
/// never dispatched successfully is measured from when the capture loop first
/// observed it.
#[derive(Debug, Clone)]
pub struct ShardLagTracker {
    last_success: Arc<Mutex<HashMap<String, Instant>>>,
    threshold: Duration,
}

impl ShardLagTracker {
    /// Creates a tracker reporting shards quiet for at least `threshold`.
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_success: Arc::new(Mutex::new(HashMap::new())),
            threshold,
        }
    }

    /// Registers a shard with the current time as its baseline, unless it was
    /// already observed.
    pub(crate) async fn observe(&self, shard_id: &str) {
        let mut last_success = self.last_success.lock().await;
        last_success
            .entry(shard_id.to_string())
            .or_insert_with(Instant::now);
    }

    /// Records a successful dispatch for a shard.
    pub(crate) async fn record_success(&self, shard_id: &str) {
        let mut last_success = self.last_success.lock().await;
        last_success.insert(shard_id.to_string(), Instant::now());
    }

    /// Returns the ids of shards without a successful dispatch for at least
    /// the configured threshold, sorted.
    pub async fn lagging_shards(&self) -> Vec<String> {
        let last_success = self.last_success.lock().await;
        let now = Instant::now();

        let mut lagging: Vec<String> = last_success
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= self.threshold)
            .map(|(shard_id, _)| shard_id.clone())
            .collect();
        lagging.sort();
        lagging
    }
}

/// Drives an aggregated multi-shard stream through dispatch.
///
/// Shares the delivery semantics of [`crate::processor::Processor`]: a shard
/// position is persisted strictly after successful dispatch, dead-lettered
/// events never advance it, and without a dead-letter store retry exhaustion
/// halts the whole loop.
pub struct ShardedProcessor<C, F, P, D> {
    connector: Arc<ShardedConnector<C, F>>,
    dispatcher: Arc<Dispatcher>,
    position_store: P,
    dead_letter_store: Option<D>,
    config: Arc<CaptureConfig>,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
    lag_tracker: ShardLagTracker,
}

impl<C, F, P, D> ShardedProcessor<C, F, P, D>
where
    C: Connector,
    F: Fn(&ShardInfo) -> CdcResult<C> + Send + Sync + 'static,
    P: PositionStore,
    D: DeadLetterStore,
{
    /// Creates a processor over a sharded connector and its stores.
    pub fn new(
        connector: Arc<ShardedConnector<C, F>>,
        dispatcher: Arc<Dispatcher>,
        position_store: P,
        dead_letter_store: Option<D>,
        config: Arc<CaptureConfig>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let lag_tracker = ShardLagTracker::new(Duration::from_millis(config.max_lag_ms));

        Self {
            connector,
            dispatcher,
            position_store,
            dead_letter_store,
            config,
            shutdown_tx,
            shutdown_rx,
            lag_tracker,
        }
    }

    /// Returns a transmitter that requests graceful shutdown of this
    /// processor.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Returns the lag tracker observed by this processor's capture loop.
    pub fn lag_tracker(&self) -> ShardLagTracker {
        self.lag_tracker.clone()
    }

    /// Validates configuration and launches the capture loop.
    pub fn start(self) -> CdcResult<ProcessorHandle> {
        self.config.validate().map_err(|err| {
            cdc_error!(
                ErrorKind::ConfigError,
                "Invalid capture configuration",
                source: err
            )
        })?;

        let span = info_span!(
            "sharded_capture_processor",
            sharded_connector_id = %self.connector.id()
        );
        let handle = tokio::spawn(self.run().instrument(span));

        Ok(ProcessorHandle {
            handle: Some(handle),
        })
    }

    async fn run(mut self) -> CdcResult<()> {
        let connector_id = self.connector.id().to_string();
        let shard_ids = self.connector.shard_ids().await;

        let mut resume_by_shard = HashMap::new();
        for shard_id in &shard_ids {
            self.lag_tracker.observe(shard_id).await;

            if !self.config.enable_position_tracking {
                continue;
            }

            let key = shard_position_key(&connector_id, shard_id);
            let resume = self.position_store.get_position(&key).await.map_err(|err| {
                cdc_error!(
                    ErrorKind::PositionStoreError,
                    "Failed to load persisted shard position",
                    format!("shard '{shard_id}'"),
                    source: err
                )
            })?;

            if let Some(blob) = resume {
                resume_by_shard.insert(shard_id.clone(), blob);
            }
        }

        info!(
            shard_count = shard_ids.len(),
            resumed_shards = resume_by_shard.len(),
            "starting sharded capture loop"
        );

        let stream = self
            .connector
            .stream_all_shards(resume_by_shard, self.shutdown_rx.clone())
            .await?;
        let mut stream = Box::pin(BatchStream::wrap(
            stream,
            self.config.batch.clone(),
            self.shutdown_rx.clone(),
        ));

        let retry = RetryPolicy::from_config(&self.config);

        loop {
            // The batch stream only observes shutdown when an item or timer
            // wakes it, so the signal is raced explicitly here too.
            let batch = tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    info!("shutdown observed, stopping sharded capture loop");
                    return Ok(());
                }
                batch = stream.next() => batch,
            };

            let Some(batch) = batch else {
                break;
            };

            let items = match batch {
                ShutdownResult::Ok(items) => items,
                ShutdownResult::Shutdown(items) => {
                    info!(
                        drained = items.len(),
                        "shutdown observed, stopping sharded capture loop"
                    );
                    return Ok(());
                }
            };

            for item in items {
                let sharded_event = match item {
                    Ok(sharded_event) => sharded_event,
                    // One shard failing must not take down its siblings.
                    Err(err) => {
                        warn!(error = %err, "shard stream failed, continuing with remaining shards");
                        continue;
                    }
                };

                if !self
                    .config
                    .table_filter
                    .matches(&sharded_event.event.table_name)
                {
                    debug!(
                        table = %sharded_event.event.table_name,
                        shard_id = %sharded_event.shard_id,
                        "table filtered out, skipping event"
                    );
                    continue;
                }

                match dispatch_with_retry(
                    &self.dispatcher,
                    &sharded_event.event,
                    &retry,
                    &mut self.shutdown_rx,
                )
                .await
                {
                    DispatchOutcome::Dispatched => {
                        self.lag_tracker.record_success(&sharded_event.shard_id).await;
                        self.save_shard_position(&connector_id, &sharded_event).await;
                    }
                    DispatchOutcome::Exhausted(err) => {
                        let Some(store) = &self.dead_letter_store else {
                            error!(
                                table = %sharded_event.event.table_name,
                                shard_id = %sharded_event.shard_id,
                                error = %err,
                                "retries exhausted without dead-letter store, halting"
                            );
                            return Err(err);
                        };

                        warn!(
                            table = %sharded_event.event.table_name,
                            shard_id = %sharded_event.shard_id,
                            error = %err,
                            "retries exhausted, dead-lettering event"
                        );

                        // The parked event's shard position is never
                        // advanced; a restart re-delivers it.
                        let entry = DeadLetterEntry::new(
                            sharded_event.event,
                            Some(sharded_event.shard_id),
                            &err,
                        );
                        if let Err(store_err) = store.add(entry).await {
                            error!(
                                error = %store_err,
                                "failed to record dead-letter entry"
                            );
                        }
                    }
                    DispatchOutcome::Stopped => {
                        info!(
                            "shutdown observed during retry backoff, stopping sharded capture loop"
                        );
                        return Ok(());
                    }
                }
            }
        }

        info!("all shard streams ended, stopping sharded capture loop");

        Ok(())
    }

    /// Persists the event's shard position, logging instead of failing on
    /// store errors.
    async fn save_shard_position(&self, connector_id: &str, sharded_event: &ShardedChangeEvent) {
        if !self.config.enable_position_tracking {
            return;
        }

        let key = shard_position_key(connector_id, &sharded_event.shard_id);
        if let Err(err) = self
            .position_store
            .save_position(&key, &sharded_event.shard_position)
            .await
        {
            error!(
                shard_id = %sharded_event.shard_id,
                error = %err,
                "failed to persist shard position, continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_keys_are_namespaced_by_connector() {
        assert_eq!(shard_position_key("orders", "shard-0"), "orders/shard-0");
        assert_ne!(
            shard_position_key("orders", "shard-0"),
            shard_position_key("payments", "shard-0")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lag_tracker_reports_stale_shards() {
        let tracker = ShardLagTracker::new(Duration::from_secs(60));
        tracker.observe("shard-0").await;
        tracker.observe("shard-1").await;

        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.record_success("shard-1").await;
        tokio::time::advance(Duration::from_secs(40)).await;

        let lagging = tracker.lagging_shards().await;
        assert_eq!(lagging, vec!["shard-0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn lag_threshold_bounds_reporting() {
        let tracker = ShardLagTracker::new(Duration::from_millis(5_000));
        tracker.observe("shard-0").await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(tracker.lagging_shards().await.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.lagging_shards().await, vec!["shard-0".to_string()]);
    }
}
