//! Typed routing of change events to handlers and interceptors.
//!
//! Routing is reified as an explicit table-to-handler registry built at
//! configuration time: each registration stores a type-erased descriptor that
//! deserializes row images into the handler's entity type and invokes the
//! matching typed method. No runtime type inspection is involved.

mod dispatcher;
mod handler;
mod registry;

pub use dispatcher::Dispatcher;
pub use handler::{ChangeHandler, Interceptor};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
