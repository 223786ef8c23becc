use std::time::Duration;

use cdc_config::shared::CaptureConfig;
use tracing::warn;

use crate::concurrency::shutdown::ShutdownRx;
use crate::dispatch::Dispatcher;
use crate::error::CdcError;
use crate::types::ChangeEvent;

/// Exponential backoff policy applied to failed dispatches.
///
/// The delay before retry `n` is `base * 2^n`, capped at the configured
/// maximum. The policy is pure; it computes delays but never sleeps.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Derives the policy from validated capture configuration.
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay to wait before retry number `attempt`, zero-indexed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Outcome of dispatching one event through the retry policy.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    /// The event was handled, possibly after retries.
    Dispatched,
    /// Every attempt failed; carries the final error.
    Exhausted(CdcError),
    /// Shutdown was observed during a backoff wait.
    Stopped,
}

/// Dispatches `event`, retrying with backoff until success, exhaustion or
/// shutdown.
///
/// The initial attempt does not count as a retry, so an event is tried
/// `max_retries + 1` times in total. Backoff waits race against the shutdown
/// signal; an event interrupted mid-backoff is neither dispatched nor
/// dead-lettered, and is re-delivered on the next start.
pub(crate) async fn dispatch_with_retry(
    dispatcher: &Dispatcher,
    event: &ChangeEvent,
    retry: &RetryPolicy,
    shutdown_rx: &mut ShutdownRx,
) -> DispatchOutcome {
    let mut attempt = 0u32;

    loop {
        let err = match dispatcher.dispatch(event, shutdown_rx.clone()).await {
            Ok(()) => return DispatchOutcome::Dispatched,
            Err(err) => err,
        };

        if attempt >= retry.max_retries() {
            return DispatchOutcome::Exhausted(err);
        }

        let delay = retry.delay_for(attempt);
        warn!(
            table = %event.table_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "dispatch failed, backing off before retry"
        );
        attempt += 1;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return DispatchOutcome::Stopped,
        }
    }
}
