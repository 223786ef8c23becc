//! Core change-data-capture pipeline: connectors, dispatch and resumable
//! processing.
//!
//! The crate streams change events from one or more independently progressing
//! sources, routes each event to a typed handler plus zero or more
//! interceptors, and tracks a resumable position per source so processing
//! survives restarts with at-least-once delivery. Sharded sources are fanned
//! into a single aggregated stream while preserving per-shard ordering.

pub mod concurrency;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod macros;
pub mod processor;
pub mod store;
pub mod types;
