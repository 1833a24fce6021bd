use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{SnapshotKey, SnapshotStore};
use crate::domain::WideTable;
use crate::error::Result;

/// In-memory snapshot store for development/testing
#[derive(Default)]
pub struct InMemorySnapshotStore {
    tables: RwLock<HashMap<SnapshotKey, WideTable>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot directly.
    pub async fn insert(&self, key: SnapshotKey, table: WideTable) {
        self.tables.write().await.insert(key, table);
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<WideTable>> {
        Ok(self.tables.read().await.get(key).cloned())
    }

    async fn keys(&self) -> Result<Vec<SnapshotKey>> {
        let mut keys = self.tables.read().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    async fn replace_all(&self, batch: Vec<(SnapshotKey, WideTable)>) -> Result<()> {
        // One write lock for the whole batch
        let mut tables = self.tables.write().await;
        let count = batch.len();
        for (key, table) in batch {
            tables.insert(key, table);
        }
        debug!("Replaced {} snapshots in memory", count);
        Ok(())
    }
}
