use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::store::dead_letter::{
    DeadLetterEntry, DeadLetterResolution, DeadLetterStatus, DeadLetterStore,
};
use crate::store::position::PositionStore;
use crate::types::CdcPosition;

#[derive(Debug, Default)]
struct PositionStoreInner {
    positions: HashMap<String, Vec<u8>>,
    save_history: Vec<(String, Vec<u8>)>,
}

/// In-memory [`PositionStore`] implementation.
///
/// Positions are lost on restart, so this store suits tests and deployments
/// that deliberately re-read from the connector default on every start. Every
/// save is additionally recorded in an append-only history so tests can
/// assert on the exact save sequence.
#[derive(Debug, Clone, Default)]
pub struct MemoryPositionStore {
    inner: Arc<Mutex<PositionStoreInner>>,
}

impl MemoryPositionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every save in order of occurrence, as `(connector_id, blob)`.
    pub async fn save_history(&self) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.lock().await;
        inner.save_history.clone()
    }
}

impl PositionStore for MemoryPositionStore {
    async fn get_position(&self, connector_id: &str) -> CdcResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner.positions.get(connector_id).cloned())
    }

    async fn save_position(&self, connector_id: &str, position: &CdcPosition) -> CdcResult<()> {
        let blob = position.to_bytes();

        let mut inner = self.inner.lock().await;
        inner
            .save_history
            .push((connector_id.to_string(), blob.clone()));
        inner.positions.insert(connector_id.to_string(), blob);

        Ok(())
    }

    async fn delete_position(&self, connector_id: &str) -> CdcResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.positions.remove(connector_id).is_some())
    }
}

#[derive(Debug, Default)]
struct DeadLetterStoreInner {
    entries: HashMap<Uuid, DeadLetterEntry>,
    insertion_order: Vec<Uuid>,
}

/// In-memory [`DeadLetterStore`] implementation.
///
/// Entries are kept in insertion order so [`DeadLetterStore::get_pending`]
/// returns the oldest failures first. Resolved entries stay in the store as
/// failure history.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterStore {
    inner: Arc<Mutex<DeadLetterStoreInner>>,
}

impl MemoryDeadLetterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries, pending and resolved.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.entries.len()
    }

    /// Returns whether the store holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.is_empty()
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    async fn add(&self, entry: DeadLetterEntry) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;

        debug!(
            entry_id = %entry.id,
            table = %entry.event.table_name,
            "recorded dead-letter entry"
        );

        inner.insertion_order.push(entry.id);
        inner.entries.insert(entry.id, entry);

        Ok(())
    }

    async fn get_pending(&self, max_count: usize) -> CdcResult<Vec<DeadLetterEntry>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|entry| entry.status == DeadLetterStatus::Pending)
            .take(max_count)
            .cloned()
            .collect())
    }

    async fn get(&self, entry_id: Uuid) -> CdcResult<Option<DeadLetterEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&entry_id).cloned())
    }

    async fn resolve(
        &self,
        entry_id: Uuid,
        resolution: DeadLetterResolution,
    ) -> CdcResult<DeadLetterEntry> {
        let mut inner = self.inner.lock().await;

        let Some(entry) = inner.entries.get_mut(&entry_id) else {
            bail!(
                ErrorKind::DeadLetterEntryNotFound,
                "Dead-letter entry not found",
                format!("entry '{entry_id}'")
            );
        };

        if entry.status == DeadLetterStatus::Resolved {
            bail!(
                ErrorKind::DeadLetterEntryResolved,
                "Dead-letter entry already resolved",
                format!("entry '{entry_id}'")
            );
        }

        entry.status = DeadLetterStatus::Resolved;
        entry.resolution = Some(resolution);

        Ok(entry.clone())
    }
}
