use async_trait::async_trait;

use crate::error::CdcResult;
use crate::types::{ChangeContext, ChangeEvent};

/// Typed handler for change events of one entity type.
///
/// One handler is registered per tracked table; the dispatcher deserializes
/// the row images into `T` before invoking it. Snapshot events are delivered
/// through [`ChangeHandler::handle_insert`].
///
/// Handlers must be idempotent where possible: delivery is at-least-once, so
/// an event whose dispatch failed after the handler committed side effects
/// will be retried and the handler re-invoked.
#[async_trait]
pub trait ChangeHandler<T>: Send + Sync {
    /// Handles a newly inserted (or snapshot-read) entity.
    async fn handle_insert(&self, entity: T, ctx: &ChangeContext) -> CdcResult<()>;

    /// Handles an updated entity.
    ///
    /// `before` is absent when the provider only replicates key columns for
    /// old row images.
    async fn handle_update(&self, before: Option<T>, after: T, ctx: &ChangeContext)
    -> CdcResult<()>;

    /// Handles a deleted entity.
    ///
    /// `entity` is absent when the provider only replicates key columns for
    /// deleted row images.
    async fn handle_delete(&self, entity: Option<T>, ctx: &ChangeContext) -> CdcResult<()>;
}

/// Shared handlers can be registered directly; calls go to the pointee.
#[async_trait]
impl<T, H> ChangeHandler<T> for std::sync::Arc<H>
where
    T: Send + Sync + 'static,
    H: ChangeHandler<T> + ?Sized,
{
    async fn handle_insert(&self, entity: T, ctx: &ChangeContext) -> CdcResult<()> {
        (**self).handle_insert(entity, ctx).await
    }

    async fn handle_update(
        &self,
        before: Option<T>,
        after: T,
        ctx: &ChangeContext,
    ) -> CdcResult<()> {
        (**self).handle_update(before, after, ctx).await
    }

    async fn handle_delete(&self, entity: Option<T>, ctx: &ChangeContext) -> CdcResult<()> {
        (**self).handle_delete(entity, ctx).await
    }
}

/// Hook invoked after the typed handler for an event has succeeded.
///
/// Interceptors run in registration order and see the raw event. A failing
/// interceptor fails the whole dispatch even though the handler's side
/// effects already happened; they are not compensated. This is the
/// at-least-once, no-rollback semantics of the pipeline: the retry that
/// follows re-invokes the handler as well.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Called once per successfully handled event.
    async fn on_event_dispatched(&self, event: &ChangeEvent, ctx: &ChangeContext) -> CdcResult<()>;
}
