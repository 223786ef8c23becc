use std::sync::Arc;

use tracing::debug;

use crate::cdc_error;
use crate::concurrency::shutdown::ShutdownRx;
use crate::dispatch::handler::Interceptor;
use crate::dispatch::registry::HandlerRegistry;
use crate::error::{CdcResult, ErrorKind};
use crate::types::{ChangeContext, ChangeEvent};

/// Routes one change event to its registered handler and interceptors.
///
/// The dispatcher holds no retryable state: a failed dispatch is reported to
/// the caller, whose retry policy decides what happens next. An event for a
/// table without a registered handler is not an error; untracked tables may
/// intentionally lack handlers, so the event is logged and skipped.
#[derive(Clone)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Dispatcher {
    /// Creates a dispatcher over a configured registry, without interceptors.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            interceptors: Vec::new(),
        }
    }

    /// Appends an interceptor; interceptors run in registration order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Dispatches one event to its handler, then to every interceptor.
    ///
    /// Interceptors run only after the typed handler succeeded, in
    /// registration order. An interceptor failure fails the whole dispatch
    /// even though the handler's side effects already happened and are not
    /// rolled back: the caller's retry re-invokes the handler too. This
    /// asymmetry is a deliberate at-least-once design choice.
    pub async fn dispatch(&self, event: &ChangeEvent, shutdown_rx: ShutdownRx) -> CdcResult<()> {
        let Some(handler) = self.registry.get(&event.table_name) else {
            debug!(
                table = %event.table_name,
                operation = %event.operation,
                "no handler registered for table, skipping event"
            );
            return Ok(());
        };

        let ctx = ChangeContext::new(
            event.table_name.clone(),
            event.metadata.clone(),
            shutdown_rx,
        );

        handler.handle(event, &ctx).await?;

        for interceptor in &self.interceptors {
            interceptor
                .on_event_dispatched(event, &ctx)
                .await
                .map_err(|err| {
                    cdc_error!(
                        ErrorKind::InterceptorFailed,
                        "Interceptor failed after handler success",
                        format!("table '{}'", event.table_name),
                        source: err
                    )
                })?;
        }

        Ok(())
    }
}
