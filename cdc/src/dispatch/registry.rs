use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cdc_error;
use crate::dispatch::handler::ChangeHandler;
use crate::error::{CdcResult, ErrorKind};
use crate::types::{ChangeContext, ChangeEvent, ChangeOperation};

/// Type-erased handler descriptor stored in the registry.
///
/// Each descriptor wraps a typed handler together with the deserialization of
/// row images into its entity type, so the dispatcher can route events
/// without knowing the entity types involved.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent, ctx: &ChangeContext) -> CdcResult<()>;
}

/// Adapter binding a typed handler to the erased descriptor contract.
struct TypedHandler<T, H> {
    handler: H,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, H> ErasedHandler for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + Sync + 'static,
    H: ChangeHandler<T>,
{
    async fn handle(&self, event: &ChangeEvent, ctx: &ChangeContext) -> CdcResult<()> {
        match event.operation {
            // Snapshot rows go through the insert path.
            ChangeOperation::Insert | ChangeOperation::Snapshot => {
                let after = required_image::<T>(event.after.as_ref(), event, "after")?;
                self.handler.handle_insert(after, ctx).await
            }
            ChangeOperation::Update => {
                let before = optional_image::<T>(event.before.as_ref(), event, "before")?;
                let after = required_image::<T>(event.after.as_ref(), event, "after")?;
                self.handler.handle_update(before, after, ctx).await
            }
            ChangeOperation::Delete => {
                let before = optional_image::<T>(event.before.as_ref(), event, "before")?;
                self.handler.handle_delete(before, ctx).await
            }
        }
    }
}

/// Deserializes a row image that must be present for the operation.
fn required_image<T>(image: Option<&Value>, event: &ChangeEvent, side: &str) -> CdcResult<T>
where
    T: DeserializeOwned,
{
    let Some(image) = image else {
        return Err(cdc_error!(
            ErrorKind::DeserializationError,
            "Missing row image",
            format!(
                "{} operation on table '{}' carries no {side} image",
                event.operation, event.table_name
            )
        ));
    };

    deserialize_image(image, event, side)
}

/// Deserializes a row image that the provider may omit.
fn optional_image<T>(image: Option<&Value>, event: &ChangeEvent, side: &str) -> CdcResult<Option<T>>
where
    T: DeserializeOwned,
{
    image
        .map(|image| deserialize_image(image, event, side))
        .transpose()
}

fn deserialize_image<T>(image: &Value, event: &ChangeEvent, side: &str) -> CdcResult<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(image.clone()).map_err(|err| {
        cdc_error!(
            ErrorKind::DeserializationError,
            "Failed to deserialize row image",
            format!(
                "{side} image of {} on table '{}'",
                event.operation, event.table_name
            ),
            source: err
        )
    })
}

/// Immutable table-to-handler registry built at configuration time.
///
/// Lookups are by exact table name. Tables without a registered handler are
/// intentionally allowed; the dispatcher skips their events.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    /// Starts building a registry.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Returns the descriptor registered for `table_name`, if any.
    pub(crate) fn get(&self, table_name: &str) -> Option<&Arc<dyn ErasedHandler>> {
        self.handlers.get(table_name)
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder collecting typed handler registrations.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistryBuilder {
    /// Registers `handler` for events of `table_name`, deserializing row
    /// images into `T`.
    ///
    /// Registering a second handler for the same table replaces the first.
    pub fn handler<T, H>(mut self, table_name: impl Into<String>, handler: H) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
        H: ChangeHandler<T> + 'static,
    {
        self.handlers.insert(
            table_name.into(),
            Arc::new(TypedHandler {
                handler,
                _entity: PhantomData,
            }),
        );
        self
    }

    /// Finalizes the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
