//! Persistence contracts backing the capture pipeline.
//!
//! Two stores exist: the position store, which persists the opaque resume
//! blob per connector, and the dead-letter store, which holds events whose
//! dispatch exhausted the retry policy. Both are contracts; the in-memory
//! implementations here back tests and non-durable deployments.

mod dead_letter;
mod memory;
mod position;

pub use dead_letter::{DeadLetterEntry, DeadLetterResolution, DeadLetterStatus, DeadLetterStore};
pub use memory::{MemoryDeadLetterStore, MemoryPositionStore};
pub use position::PositionStore;
