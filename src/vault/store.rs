//! ACID episode storage backed by redb.
//!
//! Two tables: the episode log keyed by the 16-byte content address, and a
//! time-ordered secondary index keyed by `(created_at_ns, id)` used for
//! reverse-chronological listing and insertion-order eviction. Running
//! count/byte totals live in a small stats table and are updated in the same
//! write transaction as the data, so they stay exact across crashes.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::episode::{Episode, EpisodeId};
use crate::error::VaultError;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, VaultError>;

const EPISODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("episodes");
const TIME_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("time_index");
const STATS: TableDefinition<&str, u64> = TableDefinition::new("stats");

const STAT_COUNT: &str = "count";
const STAT_BYTES: &str = "bytes";

/// Position of an episode in the time index: `(created_at_ns, id)`.
///
/// Serves as the opaque `ListRecent` cursor; stable across eviction because
/// it names a point in key space, not an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeKey {
    pub created_at: u64,
    pub id: EpisodeId,
}

impl TimeKey {
    fn encode(&self) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&self.created_at.to_be_bytes());
        key[8..].copy_from_slice(self.id.as_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[8..]);
        Some(Self {
            created_at: u64::from_be_bytes(ts),
            id: EpisodeId(id),
        })
    }

    /// Hex rendering used as the wire cursor.
    pub fn to_cursor(&self) -> String {
        self.encode().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse a wire cursor.
    pub fn from_cursor(cursor: &str) -> StoreResult<Self> {
        if cursor.len() != 48 {
            return Err(VaultError::BadCursor);
        }
        let mut bytes = [0u8; 24];
        for (i, chunk) in cursor.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).ok_or(VaultError::BadCursor)?;
            let lo = (chunk[1] as char).to_digit(16).ok_or(VaultError::BadCursor)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        TimeKey::decode(&bytes).ok_or(VaultError::BadCursor)
    }
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub count: u64,
    pub bytes: u64,
    pub oldest_at: Option<u64>,
    pub newest_at: Option<u64>,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> VaultError {
    VaultError::Storage {
        message: format!("{context}: {e}"),
    }
}

/// The durable episode store.
pub struct EpisodeStore {
    db: Database,
}

impl EpisodeStore {
    /// Open or create the store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|source| VaultError::Io { source })?;
        let path = data_dir.join("vault.redb");
        let db = Database::create(&path)
            .map_err(|e| storage_err(&format!("open {}", path.display()), e))?;
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Fully in-memory store for memory-only pipelines and tests.
    pub fn in_memory() -> StoreResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| storage_err("create in-memory store", e))?;
        let store = Self { db };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables so first reads do not race first writes.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("begin_write", e))?;
        {
            txn.open_table(EPISODES)
                .map_err(|e| storage_err("open episodes", e))?;
            txn.open_table(TIME_INDEX)
                .map_err(|e| storage_err("open time_index", e))?;
            txn.open_table(STATS)
                .map_err(|e| storage_err("open stats", e))?;
        }
        txn.commit().map_err(|e| storage_err("commit", e))?;
        Ok(())
    }

    /// Insert an episode if absent. Returns `true` when a new record was
    /// written, `false` when the content address already existed (in which
    /// case nothing is written).
    pub fn put(&self, episode: &Episode, encoded: &[u8]) -> StoreResult<bool> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("begin_write", e))?;
        let inserted = {
            let mut episodes = txn
                .open_table(EPISODES)
                .map_err(|e| storage_err("open episodes", e))?;
            let exists = episodes
                .get(episode.id.as_bytes().as_slice())
                .map_err(|e| storage_err("get", e))?
                .is_some();
            if exists {
                false
            } else {
                episodes
                    .insert(episode.id.as_bytes().as_slice(), encoded)
                    .map_err(|e| storage_err("insert episode", e))?;
                let mut index = txn
                    .open_table(TIME_INDEX)
                    .map_err(|e| storage_err("open time_index", e))?;
                let key = TimeKey {
                    created_at: episode.created_at,
                    id: episode.id,
                }
                .encode();
                index
                    .insert(key.as_slice(), [].as_slice())
                    .map_err(|e| storage_err("insert index", e))?;
                let mut stats = txn
                    .open_table(STATS)
                    .map_err(|e| storage_err("open stats", e))?;
                bump(&mut stats, STAT_COUNT, 1)?;
                bump(&mut stats, STAT_BYTES, encoded.len() as u64)?;
                true
            }
        };
        txn.commit().map_err(|e| storage_err("commit", e))?;
        Ok(inserted)
    }

    /// Constant-time lookup by content address.
    pub fn get(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let table = txn
            .open_table(EPISODES)
            .map_err(|e| storage_err("open episodes", e))?;
        let Some(guard) = table
            .get(id.as_bytes().as_slice())
            .map_err(|e| storage_err("get", e))?
        else {
            return Ok(None);
        };
        let episode = bincode::deserialize(guard.value()).map_err(|e| VaultError::Encoding {
            message: e.to_string(),
        })?;
        Ok(Some(episode))
    }

    /// Whether an episode with this id exists.
    pub fn contains(&self, id: EpisodeId) -> StoreResult<bool> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let table = txn
            .open_table(EPISODES)
            .map_err(|e| storage_err("open episodes", e))?;
        Ok(table
            .get(id.as_bytes().as_slice())
            .map_err(|e| storage_err("get", e))?
            .is_some())
    }

    /// List episodes in reverse chronological order, strictly before the
    /// cursor position if one is given. Returns episodes plus the position
    /// of the last one (the next cursor).
    pub fn list_desc(
        &self,
        before: Option<TimeKey>,
        limit: usize,
    ) -> StoreResult<(Vec<Episode>, Option<TimeKey>)> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let index = txn
            .open_table(TIME_INDEX)
            .map_err(|e| storage_err("open time_index", e))?;
        let episodes_table = txn
            .open_table(EPISODES)
            .map_err(|e| storage_err("open episodes", e))?;

        let upper = before.map(|k| k.encode());
        let range = match &upper {
            Some(key) => index.range(..key.as_slice()),
            None => index.range::<&[u8]>(..),
        }
        .map_err(|e| storage_err("range", e))?;

        let mut out = Vec::with_capacity(limit.min(256));
        let mut last = None;
        for item in range.rev().take(limit) {
            let (key_guard, _) = item.map_err(|e| storage_err("scan", e))?;
            let Some(time_key) = TimeKey::decode(key_guard.value()) else {
                continue;
            };
            let Some(record) = episodes_table
                .get(time_key.id.as_bytes().as_slice())
                .map_err(|e| storage_err("get", e))?
            else {
                // Index entry without a record: skip (eviction races are
                // resolved in favor of the log).
                continue;
            };
            let episode: Episode =
                bincode::deserialize(record.value()).map_err(|e| VaultError::Encoding {
                    message: e.to_string(),
                })?;
            last = Some(time_key);
            out.push(episode);
        }
        Ok((out, last))
    }

    /// Evict oldest episodes (insertion order) until `count ≤ max_count` and
    /// `bytes ≤ max_bytes`. Returns `(episodes_removed, bytes_removed)`.
    pub fn evict_to_fit(&self, max_count: u64, max_bytes: u64) -> StoreResult<(u64, u64)> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| storage_err("begin_write", e))?;
        let (removed, freed) = {
            let mut episodes = txn
                .open_table(EPISODES)
                .map_err(|e| storage_err("open episodes", e))?;
            let mut index = txn
                .open_table(TIME_INDEX)
                .map_err(|e| storage_err("open time_index", e))?;
            let mut stats = txn
                .open_table(STATS)
                .map_err(|e| storage_err("open stats", e))?;

            let mut count = read_stat(&stats, STAT_COUNT)?;
            let mut bytes = read_stat(&stats, STAT_BYTES)?;
            let mut removed = 0u64;
            let mut freed = 0u64;

            while count > max_count || bytes > max_bytes {
                // Oldest entry in the time index.
                let oldest = {
                    let mut range = index
                        .range::<&[u8]>(..)
                        .map_err(|e| storage_err("range", e))?;
                    match range.next() {
                        Some(item) => {
                            let (key_guard, _) = item.map_err(|e| storage_err("scan", e))?;
                            TimeKey::decode(key_guard.value())
                        }
                        None => None,
                    }
                };
                let Some(oldest) = oldest else { break };

                let record_len = episodes
                    .remove(oldest.id.as_bytes().as_slice())
                    .map_err(|e| storage_err("remove episode", e))?
                    .map(|guard| guard.value().len() as u64)
                    .unwrap_or(0);
                index
                    .remove(oldest.encode().as_slice())
                    .map_err(|e| storage_err("remove index", e))?;

                count = count.saturating_sub(1);
                bytes = bytes.saturating_sub(record_len);
                removed += 1;
                freed += record_len;
            }

            stats
                .insert(STAT_COUNT, count)
                .map_err(|e| storage_err("stats", e))?;
            stats
                .insert(STAT_BYTES, bytes)
                .map_err(|e| storage_err("stats", e))?;
            (removed, freed)
        };
        txn.commit().map_err(|e| storage_err("commit", e))?;
        Ok((removed, freed))
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| storage_err("begin_read", e))?;
        let stats = txn
            .open_table(STATS)
            .map_err(|e| storage_err("open stats", e))?;
        let index = txn
            .open_table(TIME_INDEX)
            .map_err(|e| storage_err("open time_index", e))?;

        let count = read_stat(&stats, STAT_COUNT)?;
        let bytes = read_stat(&stats, STAT_BYTES)?;

        let mut range = index
            .range::<&[u8]>(..)
            .map_err(|e| storage_err("range", e))?;
        let oldest_at = match range.next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| storage_err("scan", e))?;
                TimeKey::decode(key.value()).map(|k| k.created_at)
            }
            None => None,
        };
        let mut range = index
            .range::<&[u8]>(..)
            .map_err(|e| storage_err("range", e))?;
        let newest_at = match range.next_back() {
            Some(item) => {
                let (key, _) = item.map_err(|e| storage_err("scan", e))?;
                TimeKey::decode(key.value()).map(|k| k.created_at)
            }
            None => None,
        };

        Ok(StoreStats {
            count,
            bytes,
            oldest_at,
            newest_at,
        })
    }
}

fn bump(
    table: &mut redb::Table<'_, &'static str, u64>,
    key: &str,
    delta: u64,
) -> StoreResult<()> {
    let current = table
        .get(key)
        .map_err(|e| storage_err("stats get", e))?
        .map(|g| g.value())
        .unwrap_or(0);
    table
        .insert(key, current + delta)
        .map_err(|e| storage_err("stats insert", e))?;
    Ok(())
}

fn read_stat(table: &impl ReadableTable<&'static str, u64>, key: &str) -> StoreResult<u64> {
    Ok(table
        .get(key)
        .map_err(|e| storage_err("stats get", e))?
        .map(|g| g.value())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::concept::ConceptId;

    fn episode(created_at: u64, seed: f32) -> (Episode, Vec<u8>) {
        let ep = Episode::new(
            created_at,
            vec![ConceptId::new(1).unwrap(), ConceptId::new(2).unwrap()],
            vec![seed, -seed],
            BTreeMap::new(),
        )
        .unwrap();
        let encoded = bincode::serialize(&ep).unwrap();
        (ep, encoded)
    }

    #[test]
    fn put_get_round_trip_and_idempotence() {
        let store = EpisodeStore::in_memory().unwrap();
        let (ep, encoded) = episode(10, 0.5);

        assert!(store.put(&ep, &encoded).unwrap());
        assert!(!store.put(&ep, &encoded).unwrap());

        let loaded = store.get(ep.id).unwrap().unwrap();
        assert_eq!(loaded.id, ep.id);
        assert_eq!(loaded.activation_vector, ep.activation_vector);

        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.bytes, encoded.len() as u64);
    }

    #[test]
    fn list_desc_is_reverse_chronological_with_cursor() {
        let store = EpisodeStore::in_memory().unwrap();
        for t in 1..=5u64 {
            let (ep, encoded) = episode(t, 0.1 * t as f32);
            store.put(&ep, &encoded).unwrap();
        }

        let (page1, cursor) = store.list_desc(None, 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].created_at, 5);
        assert_eq!(page1[1].created_at, 4);

        let (page2, _) = store.list_desc(cursor, 10).unwrap();
        assert_eq!(page2.len(), 3);
        assert_eq!(page2[0].created_at, 3);
        assert_eq!(page2[2].created_at, 1);
    }

    #[test]
    fn cursor_wire_round_trip() {
        let key = TimeKey {
            created_at: 12345,
            id: EpisodeId([7u8; 16]),
        };
        let cursor = key.to_cursor();
        assert_eq!(TimeKey::from_cursor(&cursor).unwrap(), key);
        assert!(matches!(
            TimeKey::from_cursor("zz"),
            Err(VaultError::BadCursor)
        ));
    }

    #[test]
    fn eviction_removes_oldest_until_bounds_hold() {
        let store = EpisodeStore::in_memory().unwrap();
        for t in 1..=10u64 {
            let (ep, encoded) = episode(t, 0.05 * t as f32);
            store.put(&ep, &encoded).unwrap();
        }
        let (removed, freed) = store.evict_to_fit(4, u64::MAX).unwrap();
        assert_eq!(removed, 6);
        assert!(freed > 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.oldest_at, Some(7));
        assert_eq!(stats.newest_at, Some(10));
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = TempDir::new().unwrap();
        let (ep, encoded) = episode(42, 0.9);
        {
            let store = EpisodeStore::open(dir.path()).unwrap();
            store.put(&ep, &encoded).unwrap();
        }
        let store = EpisodeStore::open(dir.path()).unwrap();
        assert!(store.contains(ep.id).unwrap());
        assert_eq!(store.stats().unwrap().count, 1);
    }
}
