//! SparsePruner: periodic sparsification of `W` under a quality budget.
//!
//! A prune removes low-magnitude edges outside the protected set `A` (edges
//! incident to concepts changed by recent `concept.delta` events). Retained
//! edges are left bit-identical, so after a commit every edge outside `A` is
//! either untouched or was below the threshold. Each committed prune writes
//! a compact diff backup (edge list + prior magnitudes) before the new
//! version is published; within the rollback window `revert` restores the
//! removed edges exactly.
//!
//! Trigger modes: scheduled (every `prune_interval`), event-driven (edge
//! count above `max_edges · soft_cap`), and manual RPC. Only one prune op
//! may be active; commits serialize against consolidation cycles through
//! the weight matrix's writer lock.

pub mod backup;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::concept::{ConceptId, ConceptTable, unix_now_secs};
use crate::config::PrunerConfig;
use crate::error::PrunerError;
use crate::metrics::{Counter, Metrics};
use crate::rpc::{CancelToken, Deadline};
use crate::weights::{WeightMatrix, WeightSnapshot};

use backup::{BackupStore, PruneBackup};

/// Result alias for pruner operations.
pub type PrunerResult<T> = std::result::Result<T, PrunerError>;

/// Prune op lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneState {
    Running,
    Completed,
    Failed,
    Reverted,
}

impl std::fmt::Display for PruneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PruneState::Running => "running",
            PruneState::Completed => "completed",
            PruneState::Failed => "failed",
            PruneState::Reverted => "reverted",
        };
        write!(f, "{s}")
    }
}

/// Record of a prune operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneOpRecord {
    pub id: String,
    pub state: PruneState,
    pub edges_removed: usize,
    /// Relative L2 mass removed, as a negative delta. Committed ops satisfy
    /// `quality_delta ≥ −quality_budget`.
    pub quality_delta: f64,
    pub backup_ref: Option<String>,
    pub dry_run: bool,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub message: String,
}

/// Pure preview of a prune outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrunePreview {
    pub total_edges: usize,
    pub prunable_edges: usize,
    pub prunable_percentage: f64,
    pub estimated_quality_impact: f64,
}

/// Outcome of a committed (or dry-run) prune.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneOutcome {
    pub pruning_id: String,
    pub edges_pruned: usize,
    pub quality_impact: f64,
    pub message: String,
}

/// The sparse pruner service.
pub struct SparsePruner {
    weights: Arc<WeightMatrix>,
    concepts: Arc<ConceptTable>,
    bus: Arc<EventBus>,
    config: RwLock<PrunerConfig>,
    backups: BackupStore,
    ops: DashMap<String, PruneOpRecord>,
    active: AtomicBool,
    op_seq: AtomicU64,
    /// Sliding window of recently changed concepts: `(observed_at, ids)`.
    recent_deltas: Mutex<VecDeque<(u64, HashSet<u64>)>>,
    last_scheduled_at: Mutex<u64>,
    max_edges: usize,
    prunes_committed: Counter,
    prunes_reverted: Counter,
    edges_pruned: Counter,
}

impl SparsePruner {
    /// Wire up the pruner. `backups` decides durability.
    pub fn new(
        weights: Arc<WeightMatrix>,
        concepts: Arc<ConceptTable>,
        bus: Arc<EventBus>,
        config: PrunerConfig,
        backups: BackupStore,
        max_edges: usize,
        metrics: &Metrics,
    ) -> Self {
        tracing::info!(
            threshold = config.prune_threshold,
            quality_budget = config.quality_budget,
            "sparse pruner up"
        );
        Self {
            weights,
            concepts,
            bus,
            config: RwLock::new(config),
            backups,
            ops: DashMap::new(),
            active: AtomicBool::new(false),
            op_seq: AtomicU64::new(0),
            recent_deltas: Mutex::new(VecDeque::new()),
            last_scheduled_at: Mutex::new(unix_now_secs()),
            max_edges,
            prunes_committed: metrics.counter("pruner.prunes_committed"),
            prunes_reverted: metrics.counter("pruner.prunes_reverted"),
            edges_pruned: metrics.counter("pruner.edges_pruned"),
        }
    }

    /// Record a `concept.delta` observation; its concepts protect their
    /// incident edges for the retention window.
    pub fn note_delta(&self, changed: &[ConceptId]) {
        let mut window = self.recent_deltas.lock().expect("delta window poisoned");
        window.push_back((
            unix_now_secs(),
            changed.iter().map(|c| c.get()).collect(),
        ));
        self.trim_deltas(&mut window);
    }

    fn trim_deltas(&self, window: &mut VecDeque<(u64, HashSet<u64>)>) {
        let retention = self
            .config
            .read()
            .expect("pruner config poisoned")
            .delta_retention_secs;
        let now = unix_now_secs();
        while let Some((at, _)) = window.front() {
            if now.saturating_sub(*at) > retention {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// The currently protected concepts.
    fn protected_concepts(&self) -> HashSet<u64> {
        let mut window = self.recent_deltas.lock().expect("delta window poisoned");
        self.trim_deltas(&mut window);
        let mut protected = HashSet::new();
        for (_, ids) in window.iter() {
            protected.extend(ids.iter().copied());
        }
        protected
    }

    /// Candidate edges for removal under `threshold`, honouring the
    /// protected set and the `target_sparsity` removal cap.
    fn candidates(
        &self,
        snapshot: &WeightSnapshot,
        threshold: f64,
        target_sparsity: f64,
    ) -> Vec<(u64, u64, f32)> {
        let protected = self.protected_concepts();
        let mut candidates: Vec<(u64, u64, f32)> = snapshot
            .edges()
            .filter(|&(&(i, j), &w)| {
                f64::from(w.abs()) < threshold
                    && !protected.contains(&i)
                    && !protected.contains(&j)
            })
            .map(|(&(i, j), &w)| (i, j, w))
            .collect();
        // The sparsity target caps how much of the matrix one op may remove.
        let cap = (snapshot.nnz() as f64 * target_sparsity.clamp(0.0, 1.0)) as usize;
        if candidates.len() > cap {
            // Keep the smallest magnitudes within the cap.
            candidates.sort_by(|a, b| {
                a.2.abs()
                    .partial_cmp(&b.2.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.truncate(cap);
        }
        candidates
    }

    fn quality_impact(snapshot: &WeightSnapshot, candidates: &[(u64, u64, f32)]) -> f64 {
        let total = snapshot.edge_mass();
        if total <= 0.0 {
            return 0.0;
        }
        let removed: f64 = candidates.iter().map(|(_, _, w)| f64::from(*w).powi(2)).sum();
        (removed / total).sqrt()
    }

    /// Compute the outcome of a prune without mutating `W`.
    pub fn preview(&self, threshold: f64, target_sparsity: f64) -> PrunerResult<PrunePreview> {
        validate_threshold(threshold)?;
        let snapshot = self.weights.snapshot();
        let candidates = self.candidates(&snapshot, threshold, target_sparsity);
        let total_edges = snapshot.nnz();
        let prunable_edges = candidates.len();
        Ok(PrunePreview {
            total_edges,
            prunable_edges,
            prunable_percentage: if total_edges == 0 {
                0.0
            } else {
                100.0 * prunable_edges as f64 / total_edges as f64
            },
            estimated_quality_impact: Self::quality_impact(&snapshot, &candidates),
        })
    }

    /// Run a prune operation.
    pub fn trigger(
        &self,
        threshold: f64,
        target_sparsity: f64,
        dry_run: bool,
        create_backup: bool,
        deadline: Deadline,
        cancel: CancelToken,
    ) -> PrunerResult<PruneOutcome> {
        validate_threshold(threshold)?;
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PrunerError::OpInFlight);
        }
        let _active = ActiveGuard(self);

        let seq = self.op_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("prune-{seq:08x}");
        self.ops.insert(
            id.clone(),
            PruneOpRecord {
                id: id.clone(),
                state: PruneState::Running,
                edges_removed: 0,
                quality_delta: 0.0,
                backup_ref: None,
                dry_run,
                started_at: unix_now_secs(),
                finished_at: None,
                message: String::new(),
            },
        );

        let result = self.run_prune(&id, threshold, target_sparsity, dry_run, create_backup, deadline, cancel);
        match &result {
            Ok(outcome) => {
                self.finish_op(&id, PruneState::Completed, |op| {
                    op.edges_removed = outcome.edges_pruned;
                    op.quality_delta = -outcome.quality_impact;
                    op.message = outcome.message.clone();
                    if !dry_run && create_backup && outcome.edges_pruned > 0 {
                        op.backup_ref = Some(id.clone());
                    }
                });
            }
            Err(e) => {
                let message = e.to_string();
                self.finish_op(&id, PruneState::Failed, |op| {
                    op.message = message;
                });
            }
        }
        result
    }

    fn finish_op(&self, id: &str, state: PruneState, fill: impl FnOnce(&mut PruneOpRecord)) {
        if let Some(mut op) = self.ops.get_mut(id) {
            op.state = state;
            op.finished_at = Some(unix_now_secs());
            fill(&mut op);
        }
    }

    fn run_prune(
        &self,
        id: &str,
        threshold: f64,
        target_sparsity: f64,
        dry_run: bool,
        create_backup: bool,
        deadline: Deadline,
        cancel: CancelToken,
    ) -> PrunerResult<PruneOutcome> {
        let budget = self
            .config
            .read()
            .expect("pruner config poisoned")
            .quality_budget;

        // Serialize against consolidation before candidate selection so the
        // snapshot cannot move under the commit.
        let txn = self.weights.begin();
        if cancel.is_cancelled() || deadline.expired() {
            txn.abandon();
            return Err(PrunerError::Cancelled);
        }
        let snapshot = self.weights.snapshot();
        let candidates = self.candidates(&snapshot, threshold, target_sparsity);
        let impact = Self::quality_impact(&snapshot, &candidates);

        if impact > budget {
            txn.abandon();
            return Err(PrunerError::QualityBudget {
                estimated: impact,
                budget,
            });
        }

        if dry_run {
            txn.abandon();
            return Ok(PruneOutcome {
                pruning_id: id.to_string(),
                edges_pruned: candidates.len(),
                quality_impact: impact,
                message: format!(
                    "dry run: {} of {} edges below {threshold}",
                    candidates.len(),
                    snapshot.nnz()
                ),
            });
        }

        if candidates.is_empty() {
            txn.abandon();
            return Ok(PruneOutcome {
                pruning_id: id.to_string(),
                edges_pruned: 0,
                quality_impact: 0.0,
                message: "nothing to prune".to_string(),
            });
        }

        // Backup precedes the commit; a failed backup aborts untouched.
        if create_backup {
            let backup = PruneBackup {
                prune_id: id.to_string(),
                committed_at: unix_now_secs(),
                w_version_before: snapshot.version(),
                w_version_after: snapshot.version() + 1,
                edges: candidates.clone(),
            };
            self.backups.save(&backup)?;
        }

        let mut txn = txn;
        for (i, j, _) in &candidates {
            if let (Some(a), Some(b)) = (ConceptId::new(*i), ConceptId::new(*j)) {
                txn.remove(a, b);
            }
        }
        let committed = txn.commit();

        // Refresh cached degrees for every concept the removals touched.
        let mut touched = HashSet::new();
        for (i, j, _) in &candidates {
            touched.insert(*i);
            touched.insert(*j);
        }
        for raw in touched {
            if let Some(cid) = ConceptId::new(raw) {
                self.concepts.set_degree(cid, committed.degree(cid));
            }
        }

        let quality_delta = -impact;
        self.bus.publish(Event::GraphPruned {
            prune_id: id.to_string(),
            edges_removed: candidates.len(),
            quality_delta,
        });
        self.prunes_committed.inc();
        self.edges_pruned.add(candidates.len() as u64);
        tracing::info!(
            op = id,
            removed = candidates.len(),
            impact,
            w_version = committed.version(),
            "prune committed"
        );

        Ok(PruneOutcome {
            pruning_id: id.to_string(),
            edges_pruned: candidates.len(),
            quality_impact: impact,
            message: format!("removed {} edges at version {}", candidates.len(), committed.version()),
        })
    }

    /// Revert a committed prune within its rollback window.
    pub fn revert(&self, prune_id: &str) -> PrunerResult<()> {
        let record = self
            .ops
            .get(prune_id)
            .map(|r| r.value().clone());
        let backup = self.backups.load(prune_id)?;

        let Some(backup) = backup else {
            // Known op without a live backup: expired or never backed up.
            return match record {
                Some(_) => Err(PrunerError::BackupExpired {
                    id: prune_id.to_string(),
                }),
                None => Err(PrunerError::OpNotFound {
                    id: prune_id.to_string(),
                }),
            };
        };

        let window = self
            .config
            .read()
            .expect("pruner config poisoned")
            .rollback_window_secs;
        if unix_now_secs().saturating_sub(backup.committed_at) > window {
            return Err(PrunerError::BackupExpired {
                id: prune_id.to_string(),
            });
        }

        let mut txn = self.weights.begin();
        for (i, j, w) in &backup.edges {
            if let (Some(a), Some(b)) = (ConceptId::new(*i), ConceptId::new(*j)) {
                txn.set(a, b, *w);
            }
        }
        let committed = txn.commit();
        for (i, j, _) in &backup.edges {
            for raw in [*i, *j] {
                if let Some(cid) = ConceptId::new(raw) {
                    self.concepts.set_degree(cid, committed.degree(cid));
                }
            }
        }
        self.backups.remove(prune_id);
        if let Some(mut op) = self.ops.get_mut(prune_id) {
            op.state = PruneState::Reverted;
            op.backup_ref = None;
            op.message = format!("reverted at version {}", committed.version());
        }
        self.prunes_reverted.inc();
        tracing::info!(op = prune_id, restored = backup.edges.len(), "prune reverted");
        Ok(())
    }

    /// Fetch a prune op record.
    pub fn op(&self, id: &str) -> Option<PruneOpRecord> {
        self.ops.get(id).map(|r| r.value().clone())
    }

    /// All retained op records, newest first.
    pub fn ops(&self) -> Vec<PruneOpRecord> {
        let mut all: Vec<PruneOpRecord> = self.ops.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Garbage-collect expired backups and clear their records' refs.
    pub fn gc_backups(&self) -> usize {
        let window = self
            .config
            .read()
            .expect("pruner config poisoned")
            .rollback_window_secs;
        let expired = self.backups.collect_expired(unix_now_secs(), window);
        for id in &expired {
            if let Some(mut op) = self.ops.get_mut(id) {
                op.backup_ref = None;
            }
        }
        expired.len()
    }

    /// Periodic maintenance tick: fire the scheduled or event-driven
    /// trigger when due, refusing over-budget prunes via preview.
    pub fn maintenance_tick(&self) {
        self.gc_backups();

        let cfg = self.config.read().expect("pruner config poisoned").clone();
        let now = unix_now_secs();
        let scheduled_due = cfg.prune_interval_secs > 0 && {
            let last = *self.last_scheduled_at.lock().expect("schedule poisoned");
            now.saturating_sub(last) >= cfg.prune_interval_secs
        };
        let over_soft_cap =
            self.weights.snapshot().nnz() as f64 > self.max_edges as f64 * cfg.soft_cap;

        if !scheduled_due && !over_soft_cap {
            return;
        }
        let Ok(preview) = self.preview(cfg.prune_threshold, cfg.target_sparsity) else {
            return;
        };
        if preview.prunable_edges == 0 {
            if scheduled_due {
                *self.last_scheduled_at.lock().expect("schedule poisoned") = now;
            }
            return;
        }
        if preview.estimated_quality_impact > cfg.quality_budget {
            tracing::warn!(
                impact = preview.estimated_quality_impact,
                budget = cfg.quality_budget,
                "auto prune refused by quality budget"
            );
            return;
        }
        match self.trigger(
            cfg.prune_threshold,
            cfg.target_sparsity,
            false,
            true,
            Deadline::NONE,
            CancelToken::new(),
        ) {
            Ok(outcome) => {
                if scheduled_due {
                    *self.last_scheduled_at.lock().expect("schedule poisoned") = now;
                }
                tracing::debug!(op = %outcome.pruning_id, removed = outcome.edges_pruned, "auto prune");
            }
            Err(PrunerError::OpInFlight) => {}
            Err(e) => tracing::warn!(error = %e, "auto prune failed"),
        }
    }

    /// Replace the pruner configuration.
    pub fn set_config(&self, config: PrunerConfig) {
        *self.config.write().expect("pruner config poisoned") = config;
    }
}

/// Clears the active flag when a prune call unwinds.
struct ActiveGuard<'a>(&'a SparsePruner);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::Release);
    }
}

fn validate_threshold(threshold: f64) -> PrunerResult<()> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(PrunerError::BadThreshold { value: threshold });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    fn rig(config: PrunerConfig) -> (Arc<WeightMatrix>, SparsePruner, Arc<EventBus>) {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let weights = Arc::new(WeightMatrix::new(1.0, 100_000));
        let pruner = SparsePruner::new(
            Arc::clone(&weights),
            Arc::new(ConceptTable::new()),
            Arc::clone(&bus),
            config,
            BackupStore::in_memory(),
            100_000,
            &metrics,
        );
        (weights, pruner, bus)
    }

    /// 10 strong edges and `weak` weak ones.
    fn seed_weights(weights: &WeightMatrix, weak: usize) {
        let mut txn = weights.begin();
        for k in 0..10u64 {
            txn.set(cid(k + 1), cid(k + 2), 0.5);
        }
        for k in 0..weak as u64 {
            txn.set(cid(100 + k), cid(200 + k), 1e-4);
        }
        txn.commit();
    }

    #[test]
    fn preview_counts_sub_threshold_edges() {
        let (weights, pruner, _) = rig(PrunerConfig::default());
        seed_weights(&weights, 30);

        let preview = pruner.preview(1e-3, 0.9).unwrap();
        assert_eq!(preview.total_edges, 40);
        assert_eq!(preview.prunable_edges, 30);
        assert!((preview.prunable_percentage - 75.0).abs() < 1e-9);
        assert!(preview.estimated_quality_impact < 0.01);
        // Preview never mutates.
        assert_eq!(weights.snapshot().nnz(), 40);
    }

    #[test]
    fn commit_removes_only_unprotected_weak_edges() {
        let (weights, pruner, bus) = rig(PrunerConfig::default());
        seed_weights(&weights, 30);
        let sub = bus.subscribe("test", &[crate::bus::Topic::GraphPruned]);
        // Protect one weak edge's endpoint.
        pruner.note_delta(&[cid(100)]);

        let outcome = pruner
            .trigger(1e-3, 0.9, false, true, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(outcome.edges_pruned, 29);

        let snap = weights.snapshot();
        assert_eq!(snap.nnz(), 11);
        // Protected weak edge intact, strong edges intact.
        assert_eq!(snap.get(cid(100), cid(200)), 1e-4);
        assert_eq!(snap.get(cid(1), cid(2)), 0.5);
        assert!(matches!(sub.try_recv(), Some(Event::GraphPruned { .. })));
    }

    #[test]
    fn dry_run_reports_without_mutating() {
        let (weights, pruner, _) = rig(PrunerConfig::default());
        seed_weights(&weights, 10);
        let version = weights.version();

        let outcome = pruner
            .trigger(1e-3, 0.9, true, false, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(outcome.edges_pruned, 10);
        assert_eq!(weights.version(), version);
        let op = pruner.op(&outcome.pruning_id).unwrap();
        assert!(op.dry_run);
        assert_eq!(op.state, PruneState::Completed);
    }

    #[test]
    fn revert_restores_prior_magnitudes() {
        let (weights, pruner, _) = rig(PrunerConfig::default());
        seed_weights(&weights, 20);
        let before = weights.snapshot().edge_map();

        let outcome = pruner
            .trigger(1e-3, 0.9, false, true, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(weights.snapshot().nnz(), 10);

        pruner.revert(&outcome.pruning_id).unwrap();
        assert_eq!(weights.snapshot().edge_map(), before);
        assert_eq!(
            pruner.op(&outcome.pruning_id).unwrap().state,
            PruneState::Reverted
        );
        // The backup is consumed.
        assert!(matches!(
            pruner.revert(&outcome.pruning_id),
            Err(PrunerError::BackupExpired { .. })
        ));
    }

    #[test]
    fn quality_budget_refuses_heavy_prunes() {
        let config = PrunerConfig {
            quality_budget: 1e-6,
            ..PrunerConfig::default()
        };
        let (weights, pruner, _) = rig(config);
        seed_weights(&weights, 50);

        let err = pruner
            .trigger(1e-3, 0.9, false, true, Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PrunerError::QualityBudget { .. }));
        assert_eq!(weights.snapshot().nnz(), 60);
        let ops = pruner.ops();
        assert_eq!(ops[0].state, PruneState::Failed);
    }

    #[test]
    fn unknown_op_and_bad_threshold() {
        let (_, pruner, _) = rig(PrunerConfig::default());
        assert!(matches!(
            pruner.revert("prune-zzz"),
            Err(PrunerError::OpNotFound { .. })
        ));
        assert!(matches!(
            pruner.preview(-1.0, 0.9),
            Err(PrunerError::BadThreshold { .. })
        ));
    }

    #[test]
    fn sparsity_cap_limits_removal() {
        let (weights, pruner, _) = rig(PrunerConfig::default());
        seed_weights(&weights, 100);
        // Cap at 50% of 110 edges = 55; all 100 weak edges qualify.
        let outcome = pruner
            .trigger(1e-3, 0.5, false, false, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(outcome.edges_pruned, 55);
        assert_eq!(weights.snapshot().nnz(), 55);
    }

    #[test]
    fn delta_window_expires() {
        let config = PrunerConfig {
            delta_retention_secs: 0,
            ..PrunerConfig::default()
        };
        let (weights, pruner, _) = rig(config);
        seed_weights(&weights, 5);
        pruner.note_delta(&[cid(100)]);
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let preview = pruner.preview(1e-3, 0.9).unwrap();
        // Protection lapsed with the window.
        assert_eq!(preview.prunable_edges, 5);
    }
}
