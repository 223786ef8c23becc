//! Shared configuration types for CDC capture pipelines.

pub mod shared;
