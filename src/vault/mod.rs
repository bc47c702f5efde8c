//! EpisodicVault: durable, crash-safe storage of episodes with
//! content-addressed ids and a bounded total footprint.
//!
//! `put` commits to the episode store (durable on transaction commit) before
//! publishing `episode.created` and before returning, so a reader that
//! observes the id always finds the episode. Ids are content addresses:
//! re-putting an identical episode returns the existing id and writes
//! nothing.
//!
//! When either the count or byte bound is exceeded the oldest episodes are
//! evicted in insertion order. Eviction normally runs in a background sweep,
//! but a `put` that would violate the bounds attempts it inline first; a
//! well-formed `put` is rejected with `QuotaExceeded` only after eviction
//! failed to make room.
//!
//! Any storage failure on the write path flips the vault into read-only
//! degraded mode: reads keep working, writes fail fast with `Unavailable`.
//! The vault itself never retries; callers do.

pub mod store;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{Event, EventBus};
use crate::concept::ConceptId;
use crate::config::VaultConfig;
use crate::episode::{Episode, EpisodeId};
use crate::error::VaultError;
use crate::metrics::{Counter, Metrics};

use store::{EpisodeStore, StoreStats, TimeKey};

/// Result alias for vault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// Input to [`EpisodicVault::put`].
///
/// `created_at` is part of the content address; leave it `None` to have the
/// vault stamp a process-monotonic capture time.
#[derive(Debug, Clone)]
pub struct EpisodeDraft {
    pub created_at: Option<u64>,
    pub concept_ids: Vec<ConceptId>,
    pub activation_vector: Vec<f32>,
    pub meta: BTreeMap<String, String>,
}

/// Outcome of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub id: EpisodeId,
    /// `true` when a new record was written; `false` for an idempotent
    /// re-put of existing content.
    pub accepted: bool,
    /// Encoded record size in bytes.
    pub size: usize,
}

/// Vault statistics for the admin surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VaultStats {
    pub count: u64,
    pub bytes: u64,
    pub oldest_at: Option<u64>,
    pub newest_at: Option<u64>,
    pub degraded: bool,
}

/// The episodic vault service.
pub struct EpisodicVault {
    store: EpisodeStore,
    config: RwLock<VaultConfig>,
    degraded: AtomicBool,
    bus: Arc<EventBus>,
    puts: Counter,
    duplicate_puts: Counter,
    evicted: Counter,
}

impl EpisodicVault {
    /// Open the vault, durable under `data_dir` or fully in memory when
    /// `data_dir` is `None`.
    pub fn open(
        data_dir: Option<&Path>,
        config: VaultConfig,
        bus: Arc<EventBus>,
        metrics: &Metrics,
    ) -> VaultResult<Self> {
        let store = match data_dir {
            Some(dir) => EpisodeStore::open(dir)?,
            None => EpisodeStore::in_memory()?,
        };
        tracing::info!(
            durable = data_dir.is_some(),
            max_episodes = config.max_episodes,
            max_bytes = config.max_bytes,
            "episodic vault up"
        );
        Ok(Self {
            store,
            config: RwLock::new(config),
            degraded: AtomicBool::new(false),
            bus,
            puts: metrics.counter("vault.puts"),
            duplicate_puts: metrics.counter("vault.duplicate_puts"),
            evicted: metrics.counter("vault.episodes_evicted"),
        })
    }

    /// Whether the vault is in read-only degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn degrade<T>(&self, err: VaultError) -> VaultResult<T> {
        self.degraded.store(true, Ordering::Release);
        tracing::warn!(error = %err, "vault entering read-only degraded mode");
        Err(err)
    }

    /// Store an episode. Idempotent on content address.
    pub fn put(&self, draft: EpisodeDraft) -> VaultResult<PutOutcome> {
        if self.is_degraded() {
            return Err(VaultError::Degraded);
        }
        let created_at = draft.created_at.unwrap_or_else(monotonic_now_ns);
        let episode = Episode::new(
            created_at,
            draft.concept_ids,
            draft.activation_vector,
            draft.meta,
        )?;
        let encoded = bincode::serialize(&episode).map_err(|e| VaultError::Encoding {
            message: e.to_string(),
        })?;

        let limit = self.config.read().expect("vault config poisoned").episode_size_limit;
        if encoded.len() > limit {
            return Err(VaultError::SizeExceeded {
                size: encoded.len(),
                limit,
            });
        }

        self.make_room(encoded.len() as u64)?;

        match self.store.put(&episode, &encoded) {
            Ok(true) => {
                self.puts.inc();
                self.bus.publish(Event::EpisodeCreated {
                    id: episode.id,
                    created_at: episode.created_at,
                    size: encoded.len() as u64,
                });
                tracing::debug!(id = %episode.id, size = encoded.len(), "episode stored");
                Ok(PutOutcome {
                    id: episode.id,
                    accepted: true,
                    size: encoded.len(),
                })
            }
            Ok(false) => {
                self.duplicate_puts.inc();
                Ok(PutOutcome {
                    id: episode.id,
                    accepted: false,
                    size: encoded.len(),
                })
            }
            Err(e) => self.degrade(e),
        }
    }

    /// Evict inline if storing `incoming` more bytes would violate bounds.
    fn make_room(&self, incoming: u64) -> VaultResult<()> {
        let (max_episodes, max_bytes) = {
            let cfg = self.config.read().expect("vault config poisoned");
            (cfg.max_episodes, cfg.max_bytes)
        };
        let stats = self.store.stats()?;
        if stats.count + 1 <= max_episodes && stats.bytes + incoming <= max_bytes {
            return Ok(());
        }
        let target_bytes = max_bytes.saturating_sub(incoming);
        let (removed, _freed) = match self
            .store
            .evict_to_fit(max_episodes.saturating_sub(1), target_bytes)
        {
            Ok(r) => r,
            Err(e) => return self.degrade(e),
        };
        self.evicted.add(removed);

        let stats = self.store.stats()?;
        if stats.count + 1 > max_episodes || stats.bytes + incoming > max_bytes {
            return Err(VaultError::QuotaExceeded);
        }
        Ok(())
    }

    /// Constant-time lookup. `Ok(None)` when the id is unknown or evicted.
    pub fn get(&self, id: EpisodeId) -> VaultResult<Option<Episode>> {
        self.store.get(id)
    }

    /// Reverse-chronological listing with an opaque cursor.
    ///
    /// Returns `(episodes, next_cursor, total)`; `next_cursor` is `None`
    /// once the listing is exhausted.
    pub fn list_recent(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> VaultResult<(Vec<Episode>, Option<String>, u64)> {
        let before = match cursor {
            Some(c) if !c.is_empty() => Some(TimeKey::from_cursor(c)?),
            _ => None,
        };
        let (episodes, last) = self.store.list_desc(before, limit)?;
        let total = self.store.stats()?.count;
        let next_cursor = if episodes.len() < limit {
            None
        } else {
            last.map(|k| k.to_cursor())
        };
        Ok((episodes, next_cursor, total))
    }

    /// Aggregate statistics plus the degraded flag.
    pub fn stats(&self) -> VaultResult<VaultStats> {
        let StoreStats {
            count,
            bytes,
            oldest_at,
            newest_at,
        } = self.store.stats()?;
        Ok(VaultStats {
            count,
            bytes,
            oldest_at,
            newest_at,
            degraded: self.is_degraded(),
        })
    }

    /// Background eviction sweep; returns episodes removed.
    pub fn sweep(&self) -> VaultResult<u64> {
        let (max_episodes, max_bytes) = {
            let cfg = self.config.read().expect("vault config poisoned");
            (cfg.max_episodes, cfg.max_bytes)
        };
        let (removed, _) = self.store.evict_to_fit(max_episodes, max_bytes)?;
        if removed > 0 {
            self.evicted.add(removed);
            tracing::debug!(removed, "vault sweep evicted episodes");
        }
        Ok(removed)
    }

    /// Replace the vault bounds (from `UpdateConfig`).
    pub fn set_config(&self, config: VaultConfig) {
        *self.config.write().expect("vault config poisoned") = config;
    }
}

/// Process-monotonic wall-clock nanoseconds: never repeats, never goes
/// backwards within the process even if the system clock does.
pub fn monotonic_now_ns() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    loop {
        let last = LAST.load(Ordering::Relaxed);
        let candidate = now.max(last + 1);
        if LAST
            .compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    fn vault_with(config: VaultConfig) -> (EpisodicVault, Arc<EventBus>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let vault = EpisodicVault::open(None, config, Arc::clone(&bus), &metrics).unwrap();
        (vault, bus, metrics)
    }

    fn draft(created_at: u64, activations: Vec<f32>) -> EpisodeDraft {
        EpisodeDraft {
            created_at: Some(created_at),
            concept_ids: (1..=activations.len() as u64).map(|i| cid(i)).collect(),
            activation_vector: activations,
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn put_publishes_and_get_round_trips() {
        let (vault, bus, _) = vault_with(VaultConfig::default());
        let sub = bus.subscribe("test", &[Topic::EpisodeCreated]);

        let outcome = vault.put(draft(100, vec![0.5, -0.5])).unwrap();
        assert!(outcome.accepted);

        let episode = vault.get(outcome.id).unwrap().unwrap();
        assert_eq!(episode.activation_vector, vec![0.5, -0.5]);
        assert_eq!(episode.rehash(), episode.id);

        match sub.try_recv().unwrap() {
            Event::EpisodeCreated { id, created_at, .. } => {
                assert_eq!(id, outcome.id);
                assert_eq!(created_at, 100);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn second_put_is_idempotent_and_silent() {
        let (vault, bus, _) = vault_with(VaultConfig::default());
        let sub = bus.subscribe("test", &[Topic::EpisodeCreated]);

        let first = vault.put(draft(100, vec![0.5])).unwrap();
        let second = vault.put(draft(100, vec![0.5])).unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.accepted);
        assert!(!second.accepted);

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
        assert_eq!(vault.stats().unwrap().count, 1);
    }

    #[test]
    fn size_limit_enforced() {
        let config = VaultConfig {
            episode_size_limit: 64,
            ..VaultConfig::default()
        };
        let (vault, _, _) = vault_with(config);
        let err = vault.put(draft(1, vec![0.1; 256])).unwrap_err();
        assert!(matches!(err, VaultError::SizeExceeded { .. }));
    }

    #[test]
    fn count_bound_evicts_oldest_inline() {
        let config = VaultConfig {
            max_episodes: 3,
            ..VaultConfig::default()
        };
        let (vault, _, _) = vault_with(config);
        let mut ids = Vec::new();
        for t in 1..=5u64 {
            ids.push(vault.put(draft(t, vec![0.1 * t as f32])).unwrap().id);
        }
        let stats = vault.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.oldest_at, Some(3));
        // The evicted ids are gone; the survivors remain.
        assert!(vault.get(ids[0]).unwrap().is_none());
        assert!(vault.get(ids[4]).unwrap().is_some());
    }

    #[test]
    fn list_recent_pages_newest_first() {
        let (vault, _, _) = vault_with(VaultConfig::default());
        for t in 1..=5u64 {
            vault.put(draft(t, vec![0.1])).unwrap();
        }
        let (page, cursor, total) = vault.list_recent(3, None).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].created_at, 5);
        let cursor = cursor.unwrap();
        let (rest, next, _) = vault.list_recent(3, Some(&cursor)).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].created_at, 2);
        assert!(next.is_none());
    }

    #[test]
    fn bad_cursor_is_invalid_argument() {
        let (vault, _, _) = vault_with(VaultConfig::default());
        let err = vault.list_recent(10, Some("not-a-cursor")).unwrap_err();
        assert!(matches!(err, VaultError::BadCursor));
    }

    #[test]
    fn monotonic_clock_never_repeats() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        let c = monotonic_now_ns();
        assert!(a < b && b < c);
    }
}
