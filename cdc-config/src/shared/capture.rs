use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, TableFilterConfig, ValidationError};

/// Controls whether dead-letter replay re-enters the normal retry policy.
///
/// Replay of a dead-lettered event can either be attempted exactly once, so
/// that a persistent failure surfaces immediately, or go through the same
/// retry and backoff policy as live dispatch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Dispatch the replayed event once, without retries.
    SingleAttempt,
    /// Run the replayed event through the configured retry policy.
    WithRetries,
}

impl Default for ReplayMode {
    fn default() -> Self {
        Self::SingleAttempt
    }
}

const fn default_replay_mode() -> ReplayMode {
    ReplayMode::SingleAttempt
}

/// Configuration for a CDC capture processor.
///
/// Contains all settings required to drive one connector (or one sharded
/// connector) through dispatch: polling, batching, retry policy, position
/// tracking, table filtering and shard health reporting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CaptureConfig {
    /// Number of milliseconds to wait between polls when the source has no new changes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Batch processing configuration.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Maximum number of dispatch retries before an event is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay, in milliseconds, before the first dispatch retry. The delay
    /// doubles on every subsequent attempt.
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Upper bound, in milliseconds, on the delay between retries.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Whether processed positions are persisted for resumption after restart.
    #[serde(default = "default_enable_position_tracking")]
    pub enable_position_tracking: bool,
    /// Table filter applied before dispatch.
    #[serde(default)]
    pub table_filter: TableFilterConfig,
    /// Whether the source is sharded and should be captured through the
    /// sharded connector.
    #[serde(default)]
    pub sharded_capture: bool,
    /// Threshold, in milliseconds, after which a shard with no successful
    /// dispatch is reported as lagging. Health itself is derived externally.
    #[serde(default = "default_max_lag_ms")]
    pub max_lag_ms: u64,
    /// How dead-letter replay interacts with the retry policy.
    #[serde(default = "default_replay_mode")]
    pub dead_letter_replay: ReplayMode,
}

impl CaptureConfig {
    /// Validates capture configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "poll_interval_ms".to_string(),
                constraint: "must be greater than zero".to_string(),
            });
        }

        if self.max_retries == 0 {
            return Err(ValidationError::MaxRetriesZero);
        }

        if self.base_retry_delay_ms == 0 {
            return Err(ValidationError::BaseRetryDelayZero);
        }

        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "max_retry_delay_ms".to_string(),
                constraint: "must be greater than or equal to `base_retry_delay_ms`".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch: BatchConfig::default(),
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            enable_position_tracking: default_enable_position_tracking(),
            table_filter: TableFilterConfig::default(),
            sharded_capture: false,
            max_lag_ms: default_max_lag_ms(),
            dead_letter_replay: default_replay_mode(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    200
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_enable_position_tracking() -> bool {
    true
}

fn default_max_lag_ms() -> u64 {
    60_000
}
