//! SleepScheduler: turns raw episodes into incremental weight updates while
//! keeping batch energy non-increasing.
//!
//! One consolidation cycle: sample a batch from the vault, anneal through
//! `K_anneal` temperatures of wake–sleep updates on a working copy of `W`,
//! then either commit (checkpoint first, then publish the new version and
//! the `concept.delta` / `activation.trace` events) or roll back when the
//! energy guard trips. The working copy means rollback is simply dropping
//! the copy; readers never observe a partial cycle.
//!
//! The scheduler is the exclusive writer of `W` for the duration of a cycle
//! (it holds the write transaction from fetch to commit), and at most one
//! cycle runs at a time. `Cancel` and deadlines are honoured at phase
//! boundaries: Fetching → Annealing → (per-iteration) → Committing.

pub mod anneal;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::concept::{ConceptTable, unix_now_secs};
use crate::config::SchedulerConfig;
use crate::episode::Episode;
use crate::error::{SchedulerError, VaultError};
use crate::metrics::{Counter, Metrics};
use crate::rpc::{CancelToken, Deadline};
use crate::vault::EpisodicVault;
use crate::weights::{WeightCheckpoint, WeightMatrix};

use anneal::{CyclePattern, EdgeMap, anneal_iteration, mean_energy};

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Upper bound on cycles per `start_consolidation(once = false)` call.
const MAX_CYCLES_PER_RUN: u32 = 16;

/// Consolidation job lifecycle. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A consolidation job record, retained for the inspection window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationJob {
    pub id: String,
    pub state: JobState,
    pub energy_before: Option<f64>,
    pub energy_after: Option<f64>,
    pub episodes_processed: u32,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    /// Failure reason for `Failed`/`Cancelled` jobs (`EnergyDrift`, ...).
    pub failure: Option<String>,
    pub w_version_before: u64,
    pub w_version_after: Option<u64>,
}

/// Scheduler state machine, observable on the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Fetching,
    Annealing,
    Committing,
    RollingBack,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Annealing => "annealing",
            Phase::Committing => "committing",
            Phase::RollingBack => "rolling-back",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a completed `start_consolidation` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub job_id: String,
    pub energy_delta: f64,
    pub episodes_processed: u32,
    pub w_version: u64,
}

struct CycleStats {
    energy_before: f64,
    energy_after: f64,
    processed: u32,
    w_version: u64,
}

/// The sleep scheduler service.
pub struct SleepScheduler {
    vault: Arc<EpisodicVault>,
    weights: Arc<WeightMatrix>,
    checkpoint: Option<WeightCheckpoint>,
    concepts: Arc<ConceptTable>,
    bus: Arc<EventBus>,
    config: RwLock<SchedulerConfig>,
    jobs: DashMap<String, ConsolidationJob>,
    running: AtomicBool,
    checkpoint_healthy: AtomicBool,
    phase: RwLock<Phase>,
    job_seq: AtomicU64,
    current_cancel: RwLock<Option<CancelToken>>,
    seed_base: u64,
    cycles_completed: Counter,
    rollbacks: Counter,
    episodes_consolidated: Counter,
}

impl SleepScheduler {
    /// Wire up the scheduler. `checkpoint` is `None` in memory-only mode.
    pub fn new(
        vault: Arc<EpisodicVault>,
        weights: Arc<WeightMatrix>,
        checkpoint: Option<WeightCheckpoint>,
        concepts: Arc<ConceptTable>,
        bus: Arc<EventBus>,
        config: SchedulerConfig,
        metrics: &Metrics,
    ) -> Self {
        let seed_base = config.seed.unwrap_or_else(rand::random);
        tracing::info!(
            k_anneal = config.k_anneal,
            m_gibbs = config.m_gibbs,
            eta = config.learning_eta,
            seeded = config.seed.is_some(),
            "sleep scheduler up"
        );
        Self {
            vault,
            weights,
            checkpoint,
            concepts,
            bus,
            config: RwLock::new(config),
            jobs: DashMap::new(),
            running: AtomicBool::new(false),
            checkpoint_healthy: AtomicBool::new(true),
            phase: RwLock::new(Phase::Idle),
            job_seq: AtomicU64::new(0),
            current_cancel: RwLock::new(None),
            seed_base,
            cycles_completed: metrics.counter("scheduler.cycles_completed"),
            rollbacks: metrics.counter("scheduler.rollbacks"),
            episodes_consolidated: metrics.counter("scheduler.episodes_consolidated"),
        }
    }

    /// Current state-machine phase.
    pub fn phase(&self) -> Phase {
        *self.phase.read().expect("scheduler phase poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write().expect("scheduler phase poisoned") = phase;
        tracing::debug!(phase = %phase, "scheduler phase");
    }

    /// Whether a cycle is currently executing.
    pub fn is_busy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the checkpoint subsystem is accepting cycles.
    pub fn checkpoint_healthy(&self) -> bool {
        self.checkpoint_healthy.load(Ordering::Acquire)
    }

    /// Probe the checkpoint directory; a success clears the unhealthy latch.
    pub fn probe_checkpoint(&self) -> bool {
        let healthy = match &self.checkpoint {
            Some(ckpt) => ckpt.probe().is_ok(),
            None => true,
        };
        self.checkpoint_healthy.store(healthy, Ordering::Release);
        healthy
    }

    /// Request cancellation of the in-flight cycle, if any.
    pub fn cancel_current(&self) -> bool {
        let guard = self.current_cancel.read().expect("cancel slot poisoned");
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Fetch a job record.
    pub fn job(&self, id: &str) -> Option<ConsolidationJob> {
        self.jobs.get(id).map(|r| r.value().clone())
    }

    /// All retained job records, newest first.
    pub fn jobs(&self) -> Vec<ConsolidationJob> {
        let mut all: Vec<ConsolidationJob> =
            self.jobs.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Drop terminal jobs older than the retention window.
    pub fn sweep_jobs(&self) {
        let retention = self
            .config
            .read()
            .expect("scheduler config poisoned")
            .job_retention_secs;
        let now = unix_now_secs();
        self.jobs.retain(|_, job| {
            !(job.state.is_terminal()
                && job.finished_at.map(|t| now.saturating_sub(t) > retention).unwrap_or(false))
        });
    }

    /// Replace the scheduler configuration (from `UpdateConfig`).
    pub fn set_config(&self, config: SchedulerConfig) {
        *self.config.write().expect("scheduler config poisoned") = config;
    }

    /// Current configuration.
    pub fn config(&self) -> SchedulerConfig {
        self.config.read().expect("scheduler config poisoned").clone()
    }

    /// Run consolidation synchronously.
    ///
    /// `max_episodes` bounds the batch of a single cycle (0 uses the
    /// configured default). With `once = false`, cycles repeat while they
    /// keep improving energy on full batches, up to an internal bound.
    pub fn start_consolidation(
        &self,
        max_episodes: u32,
        once: bool,
        deadline: Deadline,
        cancel: CancelToken,
    ) -> SchedulerResult<CycleOutcome> {
        let job_id = self.reserve(&cancel)?;
        self.run_reserved(&job_id, max_episodes, once, deadline, cancel)
    }

    /// Reserve the exclusive cycle slot and create the job record.
    ///
    /// On success the caller must follow up with [`Self::run_reserved`]
    /// (possibly from a worker thread); the returned id is immediately
    /// visible on the status surface as a `Running` job.
    pub fn reserve(&self, cancel: &CancelToken) -> SchedulerResult<String> {
        if !self.checkpoint_healthy() && !self.probe_checkpoint() {
            return Err(SchedulerError::CheckpointUnhealthy);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("cons-{seq:08x}");
        let job = ConsolidationJob {
            id: job_id.clone(),
            state: JobState::Running,
            energy_before: None,
            energy_after: None,
            episodes_processed: 0,
            started_at: unix_now_secs(),
            finished_at: None,
            failure: None,
            w_version_before: self.weights.version(),
            w_version_after: None,
        };
        self.jobs.insert(job_id.clone(), job);
        *self.current_cancel.write().expect("cancel slot poisoned") = Some(cancel.clone());
        Ok(job_id)
    }

    /// Execute a reserved consolidation job to completion.
    pub fn run_reserved(
        &self,
        job_id: &str,
        max_episodes: u32,
        once: bool,
        deadline: Deadline,
        cancel: CancelToken,
    ) -> SchedulerResult<CycleOutcome> {
        // Reset on every exit path.
        let _running = ResetGuard(self);
        let job_id = job_id.to_string();

        let batch_limit = if max_episodes == 0 {
            self.config().batch_size
        } else {
            max_episodes
        };

        let mut energy_before_first: Option<f64> = None;
        let mut energy_after_last = 0.0f64;
        let mut processed_total = 0u32;
        let mut last_version = self.weights.version();

        let cycles = if once { 1 } else { MAX_CYCLES_PER_RUN };
        let mut result = Ok(());
        for cycle_index in 0..cycles {
            match self.run_cycle(&job_id, cycle_index, batch_limit, deadline, &cancel) {
                Ok(stats) => {
                    energy_before_first.get_or_insert(stats.energy_before);
                    energy_after_last = stats.energy_after;
                    processed_total += stats.processed;
                    last_version = stats.w_version;
                    let improving = stats.energy_after < stats.energy_before;
                    let full_batch = stats.processed >= batch_limit;
                    if once || !improving || !full_batch {
                        break;
                    }
                }
                Err(e) => {
                    // A later cycle failing does not undo earlier commits.
                    result = Err(e);
                    break;
                }
            }
        }

        *self.current_cancel.write().expect("cancel slot poisoned") = None;
        self.set_phase(Phase::Idle);

        let outcome = match result {
            Ok(()) => {
                let energy_before = energy_before_first.unwrap_or(0.0);
                self.finish_job(&job_id, JobState::Completed, None, |job| {
                    job.energy_before = Some(energy_before);
                    job.energy_after = Some(energy_after_last);
                    job.episodes_processed = processed_total;
                    job.w_version_after = Some(last_version);
                });
                Ok(CycleOutcome {
                    job_id: job_id.clone(),
                    energy_delta: energy_after_last - energy_before,
                    episodes_processed: processed_total,
                    w_version: last_version,
                })
            }
            Err(e) => {
                let state = if matches!(e, SchedulerError::Cancelled) {
                    JobState::Cancelled
                } else {
                    JobState::Failed
                };
                let reason = failure_reason(&e);
                self.finish_job(&job_id, state, Some(reason), |job| {
                    job.episodes_processed = processed_total;
                });
                Err(e)
            }
        };
        outcome
    }

    fn finish_job(
        &self,
        id: &str,
        state: JobState,
        failure: Option<String>,
        fill: impl FnOnce(&mut ConsolidationJob),
    ) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if job.state.is_terminal() {
                return;
            }
            job.state = state;
            job.failure = failure;
            job.finished_at = Some(unix_now_secs());
            fill(&mut job);
            tracing::info!(
                job = id,
                state = %state,
                episodes = job.episodes_processed,
                "consolidation finished"
            );
        }
    }

    /// One full cycle. On any error the working copy is dropped and `W` is
    /// untouched by this cycle.
    fn run_cycle(
        &self,
        job_id: &str,
        cycle_index: u32,
        batch_limit: u32,
        deadline: Deadline,
        cancel: &CancelToken,
    ) -> SchedulerResult<CycleStats> {
        let cfg = self.config();

        // -- Fetching ------------------------------------------------------
        self.set_phase(Phase::Fetching);
        let episodes = self.fetch_batch(&cfg, batch_limit, cycle_index)?;
        if episodes.is_empty() {
            return Err(SchedulerError::EmptyBatch);
        }
        check_boundary(deadline, cancel)?;

        // Exclusive writer for the rest of the cycle: prunes serialize
        // against us and the pre-cycle snapshot cannot move underneath the
        // working copy.
        let txn = self.weights.begin();
        let start_edges: EdgeMap = self.weights.snapshot().edge_map();
        let mut edges = start_edges.clone();

        let mut patterns: Vec<CyclePattern> =
            episodes.iter().map(CyclePattern::from_episode).collect();
        for pattern in &patterns {
            for id in pattern.concept_ids() {
                self.concepts.ensure(id);
            }
        }
        let energy_before = mean_energy(&edges, &patterns);

        // -- Annealing -----------------------------------------------------
        self.set_phase(Phase::Annealing);
        let cycle_seed = self
            .seed_base
            .wrapping_add(u64::from(cycle_index))
            .wrapping_mul(0x2545_F491_4F6C_DD1D)
            ^ self.job_seq.load(Ordering::Relaxed);
        for k in 1..=cfg.k_anneal {
            check_boundary(deadline, cancel)?;
            let temp = cfg.anneal_t0 * cfg.anneal_alpha.powi(k as i32);
            anneal_iteration(
                &mut edges,
                &mut patterns,
                temp,
                cfg.m_gibbs,
                cfg.learning_eta,
                self.weights.w_clip(),
                cycle_seed,
                k,
            );
        }
        let energy_after = mean_energy(&edges, &patterns);

        // -- Energy guard --------------------------------------------------
        if energy_after > energy_before + cfg.energy_drift_epsilon {
            self.set_phase(Phase::RollingBack);
            self.rollbacks.inc();
            txn.abandon();
            tracing::warn!(
                job = job_id,
                energy_before,
                energy_after,
                "energy drift: cycle rolled back"
            );
            return Err(SchedulerError::EnergyDrift {
                energy_before,
                energy_after,
                epsilon: cfg.energy_drift_epsilon,
            });
        }

        // -- Committing ----------------------------------------------------
        check_boundary(deadline, cancel)?;
        self.set_phase(Phase::Committing);

        let mut txn = txn;
        txn.replace(edges);

        // Durable checkpoint first; a failed checkpoint aborts the cycle
        // before readers can observe the new version.
        let candidate_version = self.weights.version() + 1;
        if let Some(ckpt) = &self.checkpoint {
            if let Err(e) = ckpt.save_edges(candidate_version, txn.staged()) {
                self.checkpoint_healthy.store(false, Ordering::Release);
                txn.abandon();
                tracing::error!(error = %e, "checkpoint write failed; cycle aborted");
                return Err(SchedulerError::CheckpointUnhealthy);
            }
        }

        let snapshot = txn.commit();

        let changed = changed_concepts(&start_edges, &snapshot.edge_map());
        for raw in &changed {
            if let Some(id) = crate::concept::ConceptId::new(*raw) {
                self.concepts.set_degree(id, snapshot.degree(id));
            }
        }

        let energy_delta = energy_after - energy_before;
        self.bus.publish(Event::ConceptDelta {
            job_id: job_id.to_string(),
            changed_concepts: changed
                .iter()
                .filter_map(|&raw| crate::concept::ConceptId::new(raw))
                .collect(),
            energy_delta,
            w_version: snapshot.version(),
        });
        for (episode, pattern) in episodes.iter().zip(&patterns) {
            self.bus.publish(Event::ActivationTrace {
                episode_id: episode.id,
                concept_ids: pattern.concept_ids(),
                trajectory: pattern.trajectory.clone(),
            });
        }

        self.cycles_completed.inc();
        self.episodes_consolidated.add(episodes.len() as u64);
        tracing::info!(
            job = job_id,
            episodes = episodes.len(),
            energy_delta,
            w_version = snapshot.version(),
            "cycle committed"
        );

        Ok(CycleStats {
            energy_before,
            energy_after,
            processed: episodes.len() as u32,
            w_version: snapshot.version(),
        })
    }

    /// Fetch the sampling window and draw the batch: uniform over the last
    /// `window_size` episodes, without replacement within the cycle.
    /// Transient vault errors back off exponentially with jitter.
    fn fetch_batch(
        &self,
        cfg: &SchedulerConfig,
        batch_limit: u32,
        cycle_index: u32,
    ) -> SchedulerResult<Vec<Episode>> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_window(cfg.window_size as usize) {
                Ok(window) => {
                    let take = (batch_limit as usize).min(window.len());
                    if take == 0 {
                        return Ok(Vec::new());
                    }
                    if take == window.len() {
                        return Ok(window);
                    }
                    let mut rng = anneal::episode_rng(
                        self.seed_base.wrapping_add(u64::from(cycle_index)),
                        usize::MAX,
                    );
                    let chosen = rand::seq::index::sample(&mut rng, window.len(), take);
                    let mut batch: Vec<Episode> = chosen
                        .into_iter()
                        .map(|i| window[i].clone())
                        .collect();
                    // Keep deterministic order for replay.
                    batch.sort_by_key(|e| e.created_at);
                    return Ok(batch);
                }
                Err(VaultError::Storage { .. }) | Err(VaultError::Io { .. }) => {
                    attempt += 1;
                    if attempt > cfg.max_fetch_retries {
                        return Err(SchedulerError::VaultUnavailable { attempts: attempt });
                    }
                    let base = Duration::from_millis(10 << attempt.min(8));
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..10));
                    tracing::warn!(attempt, "vault fetch failed, backing off");
                    std::thread::sleep(base + jitter);
                }
                Err(_) => {
                    return Err(SchedulerError::VaultUnavailable { attempts: attempt });
                }
            }
        }
    }

    fn fetch_window(&self, window_size: usize) -> Result<Vec<Episode>, VaultError> {
        let mut window = Vec::with_capacity(window_size.min(4096));
        let mut cursor: Option<String> = None;
        while window.len() < window_size {
            let page = (window_size - window.len()).min(512);
            let (episodes, next, _) = self.vault.list_recent(page, cursor.as_deref())?;
            let done = next.is_none() || episodes.is_empty();
            window.extend(episodes);
            if done {
                break;
            }
            cursor = next;
        }
        Ok(window)
    }
}

/// Clears the running flag when a consolidation call unwinds.
struct ResetGuard<'a>(&'a SleepScheduler);

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

fn check_boundary(deadline: Deadline, cancel: &CancelToken) -> SchedulerResult<()> {
    if cancel.is_cancelled() || deadline.expired() {
        return Err(SchedulerError::Cancelled);
    }
    Ok(())
}

fn failure_reason(e: &SchedulerError) -> String {
    match e {
        SchedulerError::EnergyDrift { .. } => "EnergyDrift".to_string(),
        SchedulerError::VaultUnavailable { .. } => "VaultUnavailable".to_string(),
        SchedulerError::CheckpointUnhealthy => "CheckpointWrite".to_string(),
        SchedulerError::EmptyBatch => "EmptyBatch".to_string(),
        SchedulerError::Cancelled => "Cancelled".to_string(),
        other => other.to_string(),
    }
}

/// Concepts incident to any edge that differs between two edge maps.
fn changed_concepts(before: &EdgeMap, after: &EdgeMap) -> Vec<u64> {
    let mut changed = std::collections::BTreeSet::new();
    for (key, w) in after {
        if before.get(key) != Some(w) {
            changed.insert(key.0);
            changed.insert(key.1);
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changed.insert(key.0);
            changed.insert(key.1);
        }
    }
    changed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::concept::ConceptId;
    use crate::config::VaultConfig;
    use crate::vault::EpisodeDraft;

    fn rig(scheduler_cfg: SchedulerConfig) -> (Arc<EpisodicVault>, SleepScheduler, Arc<EventBus>) {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let vault = Arc::new(
            EpisodicVault::open(None, VaultConfig::default(), Arc::clone(&bus), &metrics)
                .unwrap(),
        );
        let weights = Arc::new(WeightMatrix::new(1.0, 100_000));
        let concepts = Arc::new(ConceptTable::new());
        let scheduler = SleepScheduler::new(
            Arc::clone(&vault),
            weights,
            None,
            concepts,
            Arc::clone(&bus),
            scheduler_cfg,
            &metrics,
        );
        (vault, scheduler, bus)
    }

    fn seed_episodes(vault: &EpisodicVault, count: u64) {
        for t in 1..=count {
            vault
                .put(EpisodeDraft {
                    created_at: Some(t),
                    concept_ids: vec![
                        ConceptId::new(1).unwrap(),
                        ConceptId::new(2).unwrap(),
                        ConceptId::new(3).unwrap(),
                        ConceptId::new(4).unwrap(),
                    ],
                    activation_vector: vec![1.0, 1.0, -1.0, -1.0],
                    meta: BTreeMap::new(),
                })
                .unwrap();
        }
    }

    fn deterministic_cfg() -> SchedulerConfig {
        SchedulerConfig {
            seed: Some(42),
            k_anneal: 4,
            m_gibbs: 2,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn consolidation_on_structured_batch_reduces_energy() {
        let (vault, scheduler, _) = rig(deterministic_cfg());
        // Identical episodes need distinct timestamps to be distinct content.
        seed_episodes(&vault, 20);

        let outcome = scheduler
            .start_consolidation(20, true, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(outcome.episodes_processed, 20);
        assert!(outcome.energy_delta < 0.0, "delta {}", outcome.energy_delta);
        assert_eq!(outcome.w_version, 1);

        let job = scheduler.job(&outcome.job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.energy_after.unwrap() <= job.energy_before.unwrap() + 1e-3);
    }

    #[test]
    fn anti_learning_trips_the_drift_guard() {
        let cfg = SchedulerConfig {
            learning_eta: -0.05, // inverted update: energy rises
            ..deterministic_cfg()
        };
        let (vault, scheduler, _) = rig(cfg);
        seed_episodes(&vault, 20);
        let version_before = 0;

        let err = scheduler
            .start_consolidation(20, true, Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::EnergyDrift { .. }));

        let jobs = scheduler.jobs();
        assert_eq!(jobs[0].state, JobState::Failed);
        assert_eq!(jobs[0].failure.as_deref(), Some("EnergyDrift"));
        // No version advance, no deltas.
        assert_eq!(jobs[0].w_version_before, version_before);
    }

    #[test]
    fn empty_vault_refuses() {
        let (_vault, scheduler, _) = rig(deterministic_cfg());
        let err = scheduler
            .start_consolidation(10, true, Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::EmptyBatch));
    }

    #[test]
    fn pre_cancelled_token_cancels_at_first_boundary() {
        let (vault, scheduler, _) = rig(deterministic_cfg());
        seed_episodes(&vault, 5);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = scheduler
            .start_consolidation(5, true, Deadline::NONE, cancel)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled));
        let jobs = scheduler.jobs();
        assert_eq!(jobs[0].state, JobState::Cancelled);
    }

    #[test]
    fn events_are_published_on_success() {
        let (vault, scheduler, bus) = rig(deterministic_cfg());
        let sub = bus.subscribe("test", &[crate::bus::Topic::ConceptDelta, crate::bus::Topic::ActivationTrace]);
        seed_episodes(&vault, 8);

        scheduler
            .start_consolidation(8, true, Deadline::NONE, CancelToken::new())
            .unwrap();

        let events = sub.drain();
        let deltas = events
            .iter()
            .filter(|e| matches!(e, Event::ConceptDelta { .. }))
            .count();
        let traces = events
            .iter()
            .filter(|e| matches!(e, Event::ActivationTrace { .. }))
            .count();
        assert_eq!(deltas, 1);
        assert_eq!(traces, 8);
    }

    #[test]
    fn replay_with_same_seed_reproduces_w_version_content() {
        let run = || {
            let (vault, scheduler, _) = rig(deterministic_cfg());
            seed_episodes(&vault, 10);
            scheduler
                .start_consolidation(10, true, Deadline::NONE, CancelToken::new())
                .unwrap();
            scheduler.weights.snapshot().edge_map()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn second_start_while_running_is_refused() {
        // The flag itself: simulate by setting running manually.
        let (vault, scheduler, _) = rig(deterministic_cfg());
        seed_episodes(&vault, 3);
        scheduler.running.store(true, Ordering::Release);
        let err = scheduler
            .start_consolidation(3, true, Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));
        scheduler.running.store(false, Ordering::Release);
    }

    #[test]
    fn job_sweep_honours_retention() {
        let (vault, scheduler, _) = rig(SchedulerConfig {
            job_retention_secs: 0,
            ..deterministic_cfg()
        });
        seed_episodes(&vault, 3);
        scheduler
            .start_consolidation(3, true, Deadline::NONE, CancelToken::new())
            .unwrap();
        assert_eq!(scheduler.jobs().len(), 1);
        std::thread::sleep(Duration::from_millis(1100));
        scheduler.sweep_jobs();
        assert!(scheduler.jobs().is_empty());
    }
}
