//! Core data types describing captured changes and their provenance.

mod event;
mod position;

pub use event::{ChangeContext, ChangeEvent, ChangeMetadata, ChangeOperation, ShardedChangeEvent};
pub use position::{CdcPosition, PositionToken};
