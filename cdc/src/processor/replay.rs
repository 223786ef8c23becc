//! Operator-driven resolution of dead-lettered events.
//!
//! Replay re-dispatches a parked event through the same dispatcher the live
//! pipeline uses; discard drops it deliberately. Both resolutions are
//! single-shot: a replay that fails again parks the event as a fresh pending
//! entry instead of reopening the resolved one, so the store keeps a complete
//! failure history.

use std::sync::Arc;

use cdc_config::shared::{CaptureConfig, ReplayMode};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cdc_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::dispatch::Dispatcher;
use crate::error::{CdcResult, ErrorKind};
use crate::processor::RetryPolicy;
use crate::processor::retry::{DispatchOutcome, dispatch_with_retry};
use crate::store::{DeadLetterEntry, DeadLetterResolution, DeadLetterStore};

/// Replays and discards dead-letter entries against a dispatcher.
pub struct DeadLetterReplayer<D> {
    dispatcher: Arc<Dispatcher>,
    store: D,
    retry: RetryPolicy,
    mode: ReplayMode,
}

impl<D> DeadLetterReplayer<D>
where
    D: DeadLetterStore,
{
    /// Creates a replayer sharing the pipeline's dispatcher and retry
    /// configuration.
    pub fn new(dispatcher: Arc<Dispatcher>, store: D, config: &CaptureConfig) -> Self {
        Self {
            dispatcher,
            store,
            retry: RetryPolicy::from_config(config),
            mode: config.dead_letter_replay,
        }
    }

    /// Resolves a pending entry as replayed and re-dispatches its event.
    ///
    /// In [`ReplayMode::SingleAttempt`] the event is dispatched exactly once;
    /// in [`ReplayMode::WithRetries`] it goes through the configured retry
    /// policy first. A failed replay parks the event again as a fresh pending
    /// entry and returns the dispatch error.
    pub async fn replay(&self, entry_id: Uuid, mut shutdown_rx: ShutdownRx) -> CdcResult<()> {
        let entry = self
            .store
            .resolve(entry_id, DeadLetterResolution::Replay)
            .await?;

        info!(
            entry_id = %entry.id,
            table = %entry.event.table_name,
            "replaying dead-lettered event"
        );

        let result = match self.mode {
            ReplayMode::SingleAttempt => {
                self.dispatcher
                    .dispatch(&entry.event, shutdown_rx.clone())
                    .await
            }
            ReplayMode::WithRetries => {
                match dispatch_with_retry(
                    &self.dispatcher,
                    &entry.event,
                    &self.retry,
                    &mut shutdown_rx,
                )
                .await
                {
                    DispatchOutcome::Dispatched => Ok(()),
                    DispatchOutcome::Exhausted(err) => Err(err),
                    DispatchOutcome::Stopped => Err(cdc_error!(
                        ErrorKind::ProcessorCancelled,
                        "Shutdown observed during dead-letter replay"
                    )),
                }
            }
        };

        let Err(err) = result else {
            info!(entry_id = %entry.id, "replay succeeded");
            return Ok(());
        };

        warn!(
            entry_id = %entry.id,
            error = %err,
            "replay failed, parking event as a new entry"
        );

        let reparked = DeadLetterEntry::new(entry.event, entry.shard_id, &err);
        if let Err(store_err) = self.store.add(reparked).await {
            error!(error = %store_err, "failed to park replayed event again");
        }

        Err(err)
    }

    /// Resolves a pending entry as discarded and returns it.
    ///
    /// The event is dropped deliberately; the resolved entry remains in the
    /// store as history.
    pub async fn discard(&self, entry_id: Uuid) -> CdcResult<DeadLetterEntry> {
        let entry = self
            .store
            .resolve(entry_id, DeadLetterResolution::Discard)
            .await?;

        info!(
            entry_id = %entry.id,
            table = %entry.event.table_name,
            "discarded dead-lettered event"
        );

        Ok(entry)
    }
}
