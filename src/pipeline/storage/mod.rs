// Snapshot persistence: the last reconciled table per (domain, entity)

pub mod fs;
pub mod in_memory;

pub use fs::FsSnapshotStore;
pub use in_memory::InMemorySnapshotStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::WideTable;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub domain: String,
    pub entity: String,
}

impl SnapshotKey {
    pub fn new(domain: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            entity: entity.into(),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.entity)
    }
}

/// Storage for reconciled snapshots.
///
/// Readers only ever observe a complete snapshot: `replace_all` either swaps
/// in every table of the batch or leaves the previous state untouched.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The last persisted table for `key`, if any.
    async fn load(&self, key: &SnapshotKey) -> Result<Option<WideTable>>;

    /// Every key with a persisted snapshot, sorted.
    async fn keys(&self) -> Result<Vec<SnapshotKey>>;

    /// Replace the snapshots of every key in `batch`.
    async fn replace_all(&self, batch: Vec<(SnapshotKey, WideTable)>) -> Result<()>;
}
