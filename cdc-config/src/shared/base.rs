use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Maximum retry attempts for event dispatch cannot be zero.
    #[error("`max_retries` cannot be zero")]
    MaxRetriesZero,
    /// Base retry delay must be non-zero to avoid busy retry loops.
    #[error("`base_retry_delay_ms` cannot be zero")]
    BaseRetryDelayZero,
    /// A field holds a value outside its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue {
        field: String,
        constraint: String,
    },
}
