//! Shared configuration types for CDC capture pipelines.

mod base;
mod batch;
mod capture;
mod filter;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use capture::{CaptureConfig, ReplayMode};
pub use filter::TableFilterConfig;
