//! Concurrency utilities for coordinating capture pipeline operations.
//!
//! The capture core runs one long-running task per connector (or per shard in
//! the sharded case). These utilities provide the coordination primitives
//! those tasks share: a broadcast shutdown channel that lets a single signal
//! terminate every worker cooperatively, and a batching stream adapter that
//! groups events for efficient pulling while leaving success and position
//! advancement strictly per event.

pub mod shutdown;
pub mod stream;
