//! Capture processors driving connectors through dispatch.
//!
//! A processor owns one connector's capture loop: it resumes the stream from
//! the persisted position, batches events, dispatches them through the retry
//! policy, persists positions after success and parks exhausted events in the
//! dead-letter store. [`Processor`] drives a single connector;
//! [`sharded::ShardedProcessor`] drives an aggregated multi-shard stream.

pub mod replay;
mod retry;
pub mod sharded;

pub use retry::RetryPolicy;

use std::sync::Arc;

use cdc_config::shared::CaptureConfig;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cdc_error;
use crate::concurrency::shutdown::{
    ShutdownResult, ShutdownRx, ShutdownTx, create_shutdown_channel,
};
use crate::concurrency::stream::BatchStream;
use crate::connector::Connector;
use crate::dispatch::Dispatcher;
use crate::error::{CdcResult, ErrorKind};
use crate::processor::retry::{DispatchOutcome, dispatch_with_retry};
use crate::store::{DeadLetterEntry, DeadLetterStore, PositionStore};
use crate::types::ChangeEvent;

/// Handle to a running processor task.
///
/// Dropping the handle detaches the task; shutdown is requested through the
/// [`ShutdownTx`] obtained before start, and [`ProcessorHandle::wait`] awaits
/// completion.
#[derive(Debug)]
pub struct ProcessorHandle {
    handle: Option<JoinHandle<CdcResult<()>>>,
}

impl ProcessorHandle {
    /// Waits for the processor task to finish and returns its outcome.
    ///
    /// A panicking task surfaces as [`ErrorKind::ProcessorPanic`], an
    /// externally aborted one as [`ErrorKind::ProcessorCancelled`].
    pub async fn wait(mut self) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(cdc_error!(
                ErrorKind::ProcessorCancelled,
                "Processor task was cancelled",
                source: err
            )),
            Err(err) => Err(cdc_error!(
                ErrorKind::ProcessorPanic,
                "Processor task panicked",
                source: err
            )),
        }
    }
}

/// Drives one connector's change stream through dispatch.
///
/// Position persistence happens strictly after successful dispatch, never
/// before. A dead-lettered event's position is not advanced either, so a
/// restart re-delivers it until a later success moves the position past it.
/// Without a dead-letter store, retry exhaustion halts the processor with
/// the position still pointing before the failed event.
pub struct Processor<C, P, D> {
    connector: Arc<C>,
    dispatcher: Arc<Dispatcher>,
    position_store: P,
    dead_letter_store: Option<D>,
    config: Arc<CaptureConfig>,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<C, P, D> Processor<C, P, D>
where
    C: Connector,
    P: PositionStore,
    D: DeadLetterStore,
{
    /// Creates a processor over a connector and its stores.
    ///
    /// Passing [`None`] for the dead-letter store makes retry exhaustion
    /// fatal to the processor instead of parking the event.
    pub fn new(
        connector: Arc<C>,
        dispatcher: Arc<Dispatcher>,
        position_store: P,
        dead_letter_store: Option<D>,
        config: Arc<CaptureConfig>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            connector,
            dispatcher,
            position_store,
            dead_letter_store,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Returns a transmitter that requests graceful shutdown of this
    /// processor.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Validates configuration and launches the capture loop.
    ///
    /// A configuration marked for sharded capture is rejected: driving a
    /// sharded source through this loop would collapse its per-shard position
    /// keys into one.
    pub fn start(self) -> CdcResult<ProcessorHandle> {
        self.config.validate().map_err(|err| {
            cdc_error!(
                ErrorKind::ConfigError,
                "Invalid capture configuration",
                source: err
            )
        })?;

        if self.config.sharded_capture {
            return Err(cdc_error!(
                ErrorKind::ConfigError,
                "Capture configuration enables sharded capture",
                "use the sharded processor for this source"
            ));
        }

        let span = info_span!("capture_processor", connector_id = %self.connector.id());
        let handle = tokio::spawn(self.run().instrument(span));

        Ok(ProcessorHandle {
            handle: Some(handle),
        })
    }

    async fn run(mut self) -> CdcResult<()> {
        let connector_id = self.connector.id().to_string();

        let resume = if self.config.enable_position_tracking {
            let resume = self
                .position_store
                .get_position(&connector_id)
                .await
                .map_err(|err| {
                    cdc_error!(
                        ErrorKind::PositionStoreError,
                        "Failed to load persisted position",
                        format!("connector '{connector_id}'"),
                        source: err
                    )
                })?;

            match &resume {
                Some(_) => info!("resuming from persisted position"),
                None => info!("no persisted position, starting from connector default"),
            }

            resume
        } else {
            None
        };

        let stream = self
            .connector
            .stream_changes(resume, self.shutdown_rx.clone())
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
                    info!("shutdown observed, stopping capture loop");
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
                        "shutdown observed, stopping capture loop"
                    );
                    return Ok(());
                }
            };

            for item in items {
                let event = item?;

                if !self.config.table_filter.matches(&event.table_name) {
                    debug!(table = %event.table_name, "table filtered out, skipping event");
                    continue;
                }

                match dispatch_with_retry(&self.dispatcher, &event, &retry, &mut self.shutdown_rx)
                    .await
                {
                    DispatchOutcome::Dispatched => {
                        self.save_position(&connector_id, &event).await;
                    }
                    DispatchOutcome::Exhausted(err) => {
                        let Some(store) = &self.dead_letter_store else {
                            error!(
                                table = %event.table_name,
                                error = %err,
                                "retries exhausted without dead-letter store, halting"
                            );
                            return Err(err);
                        };

                        warn!(
                            table = %event.table_name,
                            error = %err,
                            "retries exhausted, dead-lettering event"
                        );

                        // The parked event's position is never advanced: a
                        // restart re-delivers it until a later success moves
                        // the position past it.
                        let entry = DeadLetterEntry::new(event, None, &err);
                        if let Err(store_err) = store.add(entry).await {
                            error!(
                                error = %store_err,
                                "failed to record dead-letter entry"
                            );
                        }
                    }
                    DispatchOutcome::Stopped => {
                        info!("shutdown observed during retry backoff, stopping capture loop");
                        return Ok(());
                    }
                }
            }
        }

        info!("source stream ended, stopping capture loop");

        Ok(())
    }

    /// Persists the event's position, logging instead of failing on store
    /// errors.
    ///
    /// A failed save only widens the re-delivery window after restart, which
    /// at-least-once delivery already allows.
    async fn save_position(&self, connector_id: &str, event: &ChangeEvent) {
        if !self.config.enable_position_tracking {
            return;
        }

        if let Err(err) = self
            .position_store
            .save_position(connector_id, &event.metadata.position)
            .await
        {
            error!(error = %err, "failed to persist position, continuing");
        }
    }
}
