//! Filesystem snapshot store.
//!
//! Layout: `<root>/<hex(domain)>/<hex(entity)>.json`, each file carrying the
//! table and a sha256 checksum of its canonical JSON. Hex names keep distinct
//! keys on distinct paths and decode back into the key. Writes go to a temporary file
//! in the same directory and are renamed into place only after every file of
//! the batch has been written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{SnapshotKey, SnapshotStore};
use crate::domain::WideTable;
use crate::error::{ReconcileError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    key: SnapshotKey,
    saved_at: DateTime<Utc>,
    checksum: String,
    table: WideTable,
}

pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &SnapshotKey) -> PathBuf {
        self.root
            .join(hex::encode(&key.domain))
            .join(format!("{}.json", hex::encode(&key.entity)))
    }

    async fn write_temp(&self, key: &SnapshotKey, table: &WideTable, tag: &str) -> Result<(PathBuf, PathBuf)> {
        let target = self.path_for(key);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }
        let file = SnapshotFile {
            key: key.clone(),
            saved_at: Utc::now(),
            checksum: checksum(table)?,
            table: table.clone(),
        };
        let tmp = target.with_extension(format!("json.{tag}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
        Ok((tmp, target))
    }
}

/// Hex sha256 of the table's JSON encoding.
pub fn checksum(table: &WideTable) -> Result<String> {
    let bytes = serde_json::to_vec(table)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Inverse of the hex file naming; `None` for anything this store did not write.
fn decode_name(name: &str) -> Option<String> {
    hex::decode(name).ok().and_then(|bytes| String::from_utf8(bytes).ok())
}

async fn list_dir(dir: &Path) -> Result<Vec<(String, PathBuf, bool)>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        out.push((entry.file_name().to_string_lossy().into_owned(), entry.path(), is_dir));
    }
    Ok(out)
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn load(&self, key: &SnapshotKey) -> Result<Option<WideTable>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: SnapshotFile = serde_json::from_slice(&bytes)?;
        if file.key != *key {
            return Err(ReconcileError::SnapshotCorrupt {
                key: key.to_string(),
                reason: format!("file holds snapshot for {}", file.key),
            });
        }
        let actual = checksum(&file.table)?;
        if actual != file.checksum {
            return Err(ReconcileError::SnapshotCorrupt {
                key: key.to_string(),
                reason: format!("checksum mismatch: stored {}, computed {}", file.checksum, actual),
            });
        }

        debug!("Loaded snapshot {} ({} rows)", key, file.table.len());
        Ok(Some(file.table))
    }

    async fn keys(&self) -> Result<Vec<SnapshotKey>> {
        let mut keys = Vec::new();
        for (dir_name, dir, is_dir) in list_dir(&self.root).await? {
            let Some(domain) = decode_name(&dir_name).filter(|_| is_dir) else {
                continue;
            };
            for (file_name, _, is_dir) in list_dir(&dir).await? {
                // Staged `.tmp` files and foreign files are not snapshots
                let entity = file_name
                    .strip_suffix(".json")
                    .filter(|_| !is_dir)
                    .and_then(decode_name);
                match entity {
                    Some(entity) => keys.push(SnapshotKey::new(domain.clone(), entity)),
                    None => debug!("Ignoring {} in {}", file_name, dir.display()),
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn replace_all(&self, batch: Vec<(SnapshotKey, WideTable)>) -> Result<()> {
        let tag = Uuid::new_v4().simple().to_string();
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(batch.len());

        for (key, table) in &batch {
            match self.write_temp(key, table, &tag).await {
                Ok(paths) => staged.push(paths),
                Err(e) => {
                    warn!("Snapshot write for {} failed, discarding {} staged files", key, staged.len());
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp).await;
                    }
                    let _ = fs::remove_file(self.path_for(key).with_extension(format!("json.{tag}.tmp"))).await;
                    return Err(e);
                }
            }
        }

        for (tmp, target) in &staged {
            fs::rename(tmp, target).await?;
        }

        info!("💾 Replaced {} snapshots under {}", staged.len(), self.root.display());
        Ok(())
    }
}
