//! Compact prune backups: the removed edges and their prior magnitudes,
//! one record per committed prune operation.
//!
//! Durable mode writes one fsync'd bincode file per op under the prunes
//! directory; memory-only pipelines keep the records in a map. Backups are
//! garbage-collected once their rollback window elapses.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::PrunerError;

/// Result alias for backup operations.
pub type BackupResult<T> = std::result::Result<T, PrunerError>;

/// The diff a committed prune can be reverted from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneBackup {
    pub prune_id: String,
    /// Commit time (seconds since UNIX epoch); ages the rollback window.
    pub committed_at: u64,
    pub w_version_before: u64,
    pub w_version_after: u64,
    /// Removed edges with their prior magnitudes.
    pub edges: Vec<(u64, u64, f32)>,
}

enum Backend {
    Memory(Mutex<HashMap<String, PruneBackup>>),
    Disk(PathBuf),
}

/// Store of prune backups.
pub struct BackupStore {
    backend: Backend,
}

impl BackupStore {
    /// In-memory store for memory-only pipelines.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
        }
    }

    /// Durable store writing one file per op under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> BackupResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PrunerError::BackupWrite {
            message: format!("create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            backend: Backend::Disk(dir),
        })
    }

    fn file_path(dir: &PathBuf, prune_id: &str) -> PathBuf {
        dir.join(format!("{prune_id}.bak"))
    }

    /// Persist a backup. Must succeed before the prune commits.
    pub fn save(&self, backup: &PruneBackup) -> BackupResult<()> {
        match &self.backend {
            Backend::Memory(map) => {
                map.lock()
                    .expect("backup store poisoned")
                    .insert(backup.prune_id.clone(), backup.clone());
                Ok(())
            }
            Backend::Disk(dir) => {
                let bytes = bincode::serialize(backup).map_err(|e| PrunerError::BackupWrite {
                    message: e.to_string(),
                })?;
                let path = Self::file_path(dir, &backup.prune_id);
                let mut file =
                    std::fs::File::create(&path).map_err(|e| PrunerError::BackupWrite {
                        message: format!("create {}: {e}", path.display()),
                    })?;
                file.write_all(&bytes).map_err(|e| PrunerError::BackupWrite {
                    message: e.to_string(),
                })?;
                file.sync_all().map_err(|e| PrunerError::BackupWrite {
                    message: e.to_string(),
                })?;
                Ok(())
            }
        }
    }

    /// Load a backup; `Ok(None)` when it never existed or was collected.
    pub fn load(&self, prune_id: &str) -> BackupResult<Option<PruneBackup>> {
        match &self.backend {
            Backend::Memory(map) => Ok(map
                .lock()
                .expect("backup store poisoned")
                .get(prune_id)
                .cloned()),
            Backend::Disk(dir) => {
                let path = Self::file_path(dir, prune_id);
                let bytes = match std::fs::read(&path) {
                    Ok(b) => b,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => {
                        return Err(PrunerError::BackupWrite {
                            message: format!("read {}: {e}", path.display()),
                        });
                    }
                };
                let backup =
                    bincode::deserialize(&bytes).map_err(|e| PrunerError::BackupWrite {
                        message: format!("decode {}: {e}", path.display()),
                    })?;
                Ok(Some(backup))
            }
        }
    }

    /// Remove one backup (after a successful revert).
    pub fn remove(&self, prune_id: &str) {
        match &self.backend {
            Backend::Memory(map) => {
                map.lock().expect("backup store poisoned").remove(prune_id);
            }
            Backend::Disk(dir) => {
                let _ = std::fs::remove_file(Self::file_path(dir, prune_id));
            }
        }
    }

    /// Drop backups whose rollback window has elapsed. Returns the ids
    /// collected.
    pub fn collect_expired(&self, now_secs: u64, window_secs: u64) -> Vec<String> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.lock().expect("backup store poisoned");
                let expired: Vec<String> = map
                    .iter()
                    .filter(|(_, b)| now_secs.saturating_sub(b.committed_at) > window_secs)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &expired {
                    map.remove(id);
                }
                expired
            }
            Backend::Disk(dir) => {
                let mut expired = Vec::new();
                let Ok(entries) = std::fs::read_dir(dir) else {
                    return expired;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("bak") {
                        continue;
                    }
                    let Ok(bytes) = std::fs::read(&path) else {
                        continue;
                    };
                    let Ok(backup) = bincode::deserialize::<PruneBackup>(&bytes) else {
                        continue;
                    };
                    if now_secs.saturating_sub(backup.committed_at) > window_secs {
                        if std::fs::remove_file(&path).is_ok() {
                            expired.push(backup.prune_id);
                        }
                    }
                }
                expired
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backup(id: &str, committed_at: u64) -> PruneBackup {
        PruneBackup {
            prune_id: id.to_string(),
            committed_at,
            w_version_before: 3,
            w_version_after: 4,
            edges: vec![(1, 2, 0.0005), (2, 3, -0.0007)],
        }
    }

    #[test]
    fn memory_round_trip_and_gc() {
        let store = BackupStore::in_memory();
        store.save(&backup("prune-1", 100)).unwrap();
        assert!(store.load("prune-1").unwrap().is_some());
        assert!(store.load("prune-2").unwrap().is_none());

        let expired = store.collect_expired(100 + 10, 5);
        assert_eq!(expired, vec!["prune-1".to_string()]);
        assert!(store.load("prune-1").unwrap().is_none());
    }

    #[test]
    fn disk_round_trip_and_gc() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::open(dir.path()).unwrap();
        store.save(&backup("prune-1", 100)).unwrap();
        store.save(&backup("prune-2", 200)).unwrap();

        let loaded = store.load("prune-1").unwrap().unwrap();
        assert_eq!(loaded.edges.len(), 2);
        assert_eq!(loaded.w_version_before, 3);

        let mut expired = store.collect_expired(200, 50);
        expired.sort();
        assert_eq!(expired, vec!["prune-1".to_string()]);
        assert!(store.load("prune-1").unwrap().is_none());
        assert!(store.load("prune-2").unwrap().is_some());

        store.remove("prune-2");
        assert!(store.load("prune-2").unwrap().is_none());
    }
}
