//! Fan-in aggregation of per-shard connectors into one stream.
//!
//! A sharded source is a set of independently-replicated partitions, each
//! with its own change stream and position space. [`ShardedConnector`]
//! composes one connector per shard behind a single aggregated stream while
//! preserving per-shard ordering. No ordering is guaranteed across shards;
//! consumers needing a deterministic tie-break can sort on
//! `(captured_at, shard_id)` themselves.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{Connector, ShardInfo};
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::types::{CdcPosition, ShardedChangeEvent};
use crate::{bail, cdc_error};

/// Stream of sharded change-event results aggregated across shards.
pub type ShardedEventStream = BoxStream<'static, CdcResult<ShardedChangeEvent>>;

/// Registry state guarded by the single exclusion lock.
#[derive(Debug)]
struct Registry<C> {
    shards: HashMap<String, Arc<C>>,
    disposed: bool,
}

/// Composes many per-shard connectors into one aggregated stream with dynamic
/// shard membership.
///
/// The connector owns the lifecycle of its per-shard connectors: they are
/// created from a topology snapshot through the factory, can be added and
/// removed while a stream is active, and are disposed together with the
/// aggregate. Streaming always operates on a registry snapshot taken at call
/// start, so topology changes only take effect on the next stream invocation.
#[derive(Debug)]
pub struct ShardedConnector<C, F> {
    id: String,
    factory: F,
    registry: Mutex<Registry<C>>,
}

impl<C, F> ShardedConnector<C, F>
where
    C: Connector,
    F: Fn(&ShardInfo) -> CdcResult<C> + Send + Sync,
{
    /// Creates a sharded connector from a topology snapshot.
    ///
    /// One connector is created per shard through `factory`; a factory failure
    /// for any shard fails construction as a whole.
    pub fn new(id: impl Into<String>, topology: &[ShardInfo], factory: F) -> CdcResult<Self> {
        let id = id.into();

        let mut shards = HashMap::with_capacity(topology.len());
        for shard_info in topology {
            let connector = factory(shard_info)?;
            shards.insert(shard_info.shard_id.clone(), Arc::new(connector));
        }

        info!(
            sharded_connector_id = %id,
            shard_count = shards.len(),
            "created sharded connector"
        );

        Ok(Self {
            id,
            factory,
            registry: Mutex::new(Registry {
                shards,
                disposed: false,
            }),
        })
    }

    /// Identifier of the aggregate, used to key per-shard persisted positions.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the ids of all currently registered shards, sorted.
    pub async fn shard_ids(&self) -> Vec<String> {
        let registry = self.registry.lock().await;

        let mut ids: Vec<String> = registry.shards.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Streams changes from every registered shard as one aggregated stream.
    ///
    /// One task is launched per shard in the registry snapshot taken at call
    /// start; each task reads its own stream and writes into a shared fan-in
    /// channel, so per-shard order is preserved while no ordering exists
    /// across shards. A failing shard contributes a single error result and
    /// stops; sibling shards continue uninterrupted. The aggregated stream
    /// ends once every shard task has finished.
    ///
    /// `resume_by_shard` carries the previously persisted position blob per
    /// shard id; shards without an entry start from their default position.
    pub async fn stream_all_shards(
        &self,
        mut resume_by_shard: HashMap<String, Vec<u8>>,
        shutdown_rx: ShutdownRx,
    ) -> CdcResult<ShardedEventStream> {
        let snapshot = self.snapshot().await?;

        info!(
            sharded_connector_id = %self.id,
            shard_count = snapshot.len(),
            "streaming all shards"
        );

        let (tx, rx) = mpsc::unbounded_channel::<CdcResult<ShardedChangeEvent>>();

        for (shard_id, connector) in snapshot {
            let resume = resume_by_shard.remove(&shard_id);
            let span = info_span!("shard_stream", shard_id = %shard_id);
            let tx = tx.clone();
            let shutdown_rx = shutdown_rx.clone();

            tokio::spawn(
                async move {
                    stream_shard_into(shard_id, connector, resume, shutdown_rx, tx).await;
                }
                .instrument(span),
            );
        }

        // The receiver closes once every per-shard sender is dropped.
        drop(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    /// Streams changes from a single named shard.
    ///
    /// Returns [`ErrorKind::ShardNotFound`] when the id is unknown, without
    /// affecting any other shard.
    pub async fn stream_shard(
        &self,
        shard_id: &str,
        resume: Option<Vec<u8>>,
        shutdown_rx: ShutdownRx,
    ) -> CdcResult<ShardedEventStream> {
        let connector = {
            let registry = self.registry.lock().await;

            if registry.disposed {
                bail!(
                    ErrorKind::ConnectorDisposed,
                    "Sharded connector is disposed",
                    format!("sharded connector '{}'", self.id)
                );
            }

            let Some(connector) = registry.shards.get(shard_id) else {
                bail!(
                    ErrorKind::ShardNotFound,
                    "Shard not found",
                    format!("shard '{shard_id}' is not registered")
                );
            };

            connector.clone()
        };

        let stream = connector.stream_changes(resume, shutdown_rx).await?;

        let shard_id = shard_id.to_string();
        Ok(stream
            .map(move |item| match item {
                Ok(event) => Ok(ShardedChangeEvent {
                    shard_id: shard_id.clone(),
                    shard_position: event.metadata.position.clone(),
                    event,
                }),
                Err(err) => Err(shard_stream_error(&shard_id, err)),
            })
            .boxed())
    }

    /// Queries every registered shard's current position.
    ///
    /// If any shard's query fails the whole call returns that failure; partial
    /// results are never silently returned. Callers needing resilience should
    /// query shard by shard instead.
    pub async fn get_all_positions(&self) -> CdcResult<HashMap<String, CdcPosition>> {
        let snapshot = self.snapshot().await?;

        let mut positions = HashMap::with_capacity(snapshot.len());
        for (shard_id, connector) in snapshot {
            let position = connector.current_position().await.map_err(|err| {
                cdc_error!(
                    ErrorKind::SourcePositionUnavailable,
                    "Failed to query shard position",
                    format!("shard '{shard_id}'"),
                    source: err
                )
            })?;
            positions.insert(shard_id, position);
        }

        Ok(positions)
    }

    /// Creates and registers a connector for a new shard.
    ///
    /// Idempotent: returns `false` without touching the registry when a
    /// connector already exists for the shard id. A shard added while a
    /// stream is active is picked up on the next [`Self::stream_all_shards`]
    /// call.
    pub async fn add_connector(&self, shard_info: &ShardInfo) -> CdcResult<bool> {
        let mut registry = self.registry.lock().await;

        if registry.disposed {
            bail!(
                ErrorKind::ConnectorDisposed,
                "Sharded connector is disposed",
                format!("sharded connector '{}'", self.id)
            );
        }

        if registry.shards.contains_key(&shard_info.shard_id) {
            debug!(shard_id = %shard_info.shard_id, "shard already registered, skipping add");
            return Ok(false);
        }

        let connector = (self.factory)(shard_info)?;
        registry
            .shards
            .insert(shard_info.shard_id.clone(), Arc::new(connector));

        info!(shard_id = %shard_info.shard_id, "registered new shard connector");

        Ok(true)
    }

    /// Removes a shard's connector from the registry and disposes it.
    ///
    /// Returns whether the shard existed. The shard is unregistered before
    /// disposal, so a dispose failure is reported to the caller but cannot
    /// resurrect the shard; calling again returns `false` without a second
    /// teardown.
    pub async fn remove_connector(&self, shard_id: &str) -> CdcResult<bool> {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.shards.remove(shard_id)
        };

        let Some(connector) = removed else {
            debug!(shard_id = %shard_id, "shard not registered, nothing to remove");
            return Ok(false);
        };

        connector.dispose().await?;

        info!(shard_id = %shard_id, "removed and disposed shard connector");

        Ok(true)
    }

    /// Disposes every still-registered shard connector.
    ///
    /// Idempotent and terminal: subsequent streaming or topology calls fail
    /// with [`ErrorKind::ConnectorDisposed`]. Per-shard dispose failures are
    /// collected and returned aggregated once all shards have been torn down.
    pub async fn dispose(&self) -> CdcResult<()> {
        let shards = {
            let mut registry = self.registry.lock().await;

            if registry.disposed {
                debug!(sharded_connector_id = %self.id, "sharded connector already disposed");
                return Ok(());
            }

            registry.disposed = true;
            registry.shards.drain().collect::<Vec<_>>()
        };

        let mut errors = vec![];
        for (shard_id, connector) in shards {
            if let Err(err) = connector.dispose().await {
                warn!(shard_id = %shard_id, error = %err, "failed to dispose shard connector");
                errors.push(err);
            }
        }

        info!(sharded_connector_id = %self.id, "disposed sharded connector");

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Takes an immutable snapshot of the registered shards.
    async fn snapshot(&self) -> CdcResult<Vec<(String, Arc<C>)>> {
        let registry = self.registry.lock().await;

        if registry.disposed {
            bail!(
                ErrorKind::ConnectorDisposed,
                "Sharded connector is disposed",
                format!("sharded connector '{}'", self.id)
            );
        }

        Ok(registry
            .shards
            .iter()
            .map(|(shard_id, connector)| (shard_id.clone(), connector.clone()))
            .collect())
    }
}

/// Reads one shard's stream into the fan-in channel.
///
/// A stream-level failure contributes a single error result and ends the
/// task; the aggregate keeps draining the remaining shards.
async fn stream_shard_into<C>(
    shard_id: String,
    connector: Arc<C>,
    resume: Option<Vec<u8>>,
    shutdown_rx: ShutdownRx,
    tx: mpsc::UnboundedSender<CdcResult<ShardedChangeEvent>>,
) where
    C: Connector,
{
    let mut stream = match connector.stream_changes(resume, shutdown_rx).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to open shard stream");
            let _ = tx.send(Err(shard_stream_error(&shard_id, err)));
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                let sharded_event = ShardedChangeEvent {
                    shard_id: shard_id.clone(),
                    shard_position: event.metadata.position.clone(),
                    event,
                };

                // The receiver dropping means the consumer went away; stop
                // reading this shard.
                if tx.send(Ok(sharded_event)).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "shard stream failed, ending shard task");
                let _ = tx.send(Err(shard_stream_error(&shard_id, err)));
                return;
            }
        }
    }

    debug!("shard stream ended");
}

/// Wraps a shard failure with the shard identity for the aggregate consumer.
fn shard_stream_error(shard_id: &str, err: CdcError) -> CdcError {
    cdc_error!(
        ErrorKind::ShardStreamFailed,
        "Shard stream failed",
        format!("shard '{shard_id}'"),
        source: err
    )
}
