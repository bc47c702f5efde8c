//! Pipeline facade: owns the bus and the four services, wires the event
//! pumps between them, and exposes the whole RPC surface as typed methods.
//!
//! Startup order is vault → scheduler → pruner → learner (leaves first);
//! shutdown drains in reverse: new work is refused, pumps stop and close
//! their subscriptions, in-flight work finishes, and the final weight
//! checkpoint is flushed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, Topic};
use crate::concept::{ConceptId, ConceptTable};
use crate::config::{ConfigScalar, PipelineConfig};
use crate::episode::{Episode, EpisodeId};
use crate::error::{EngineError, OneirosError, OneirosResult};
use crate::koopman::{BatchOutcome, KoopmanLearner, TraceInput, trace_from_event};
use crate::metrics::Metrics;
use crate::pruner::backup::BackupStore;
use crate::pruner::{PruneOpRecord, PruneOutcome, PrunePreview, SparsePruner};
use crate::rpc::{CancelToken, Deadline};
use crate::scheduler::{ConsolidationJob, CycleOutcome, Phase, SleepScheduler};
use crate::vault::{EpisodeDraft, EpisodicVault, PutOutcome, VaultStats};
use crate::weights::{WeightCheckpoint, WeightMatrix};

/// Result of `start_consolidation`: the job id immediately, the outcome
/// only when the caller waited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedConsolidation {
    pub job_id: String,
    pub outcome: Option<CycleOutcome>,
}

/// Aggregated health for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub accepting: bool,
    pub vault_degraded: bool,
    pub koopman_degraded: bool,
    pub checkpoint_healthy: bool,
    pub scheduler_phase: String,
    pub w_version: u64,
    pub w_edges: usize,
    pub concepts: usize,
    pub mode_count: usize,
    pub counters: BTreeMap<String, u64>,
}

impl HealthReport {
    /// Healthy means every service accepts its normal workload.
    pub fn healthy(&self) -> bool {
        self.accepting
            && !self.vault_degraded
            && !self.koopman_degraded
            && self.checkpoint_healthy
    }
}

/// The assembled four-service pipeline.
pub struct Pipeline {
    config: Mutex<PipelineConfig>,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
    vault: Arc<EpisodicVault>,
    weights: Arc<WeightMatrix>,
    concepts: Arc<ConceptTable>,
    scheduler: Arc<SleepScheduler>,
    pruner: Arc<SparsePruner>,
    koopman: Arc<KoopmanLearner>,
    weights_dir: Option<PathBuf>,
    accepting: AtomicBool,
    shutdown: Arc<AtomicBool>,
    pumps: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Pipeline {
    /// Bring up the pipeline in dependency order.
    pub fn new(config: PipelineConfig) -> OneirosResult<Arc<Self>> {
        if !(config.w_clip > 0.0) || config.max_edges == 0 {
            return Err(EngineError::InvalidConfig {
                message: "w_clip must be positive and max_edges non-zero".to_string(),
            }
            .into());
        }

        let dirs = match &config.data_dir {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|_| EngineError::DataDir {
                    path: root.display().to_string(),
                })?;
                Some((
                    root.join("vault"),
                    root.join("weights"),
                    root.join("modes"),
                    root.join("prunes"),
                ))
            }
            None => None,
        };

        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        tracing::info!(durable = dirs.is_some(), "pipeline starting");

        // Vault first: everything downstream consumes from it.
        let vault = Arc::new(EpisodicVault::open(
            dirs.as_ref().map(|(v, _, _, _)| v.as_path()),
            config.vault.clone(),
            Arc::clone(&bus),
            &metrics,
        )?);

        // Weights and their checkpoint, restored when one exists.
        let weights_dir = dirs.as_ref().map(|(_, w, _, _)| w.clone());
        let (weights, checkpoint) = match &weights_dir {
            Some(dir) => {
                let checkpoint = WeightCheckpoint::open(dir)?;
                let weights = match checkpoint.load()? {
                    Some((version, edges)) => {
                        tracing::info!(version, edges = edges.len(), "restored W checkpoint");
                        WeightMatrix::restore(
                            config.w_clip as f32,
                            config.max_edges,
                            version,
                            edges,
                        )
                    }
                    None => WeightMatrix::new(config.w_clip as f32, config.max_edges),
                };
                (Arc::new(weights), Some(checkpoint))
            }
            None => (
                Arc::new(WeightMatrix::new(config.w_clip as f32, config.max_edges)),
                None,
            ),
        };

        let concepts = Arc::new(ConceptTable::new());
        {
            let snapshot = weights.snapshot();
            for raw in snapshot.touched_concepts() {
                if let Some(id) = ConceptId::new(raw) {
                    concepts.ensure(id);
                    concepts.set_degree(id, snapshot.degree(id));
                }
            }
        }

        let scheduler = Arc::new(SleepScheduler::new(
            Arc::clone(&vault),
            Arc::clone(&weights),
            checkpoint,
            Arc::clone(&concepts),
            Arc::clone(&bus),
            config.scheduler.clone(),
            &metrics,
        ));

        let backups = match &dirs {
            Some((_, _, _, p)) => BackupStore::open(p)?,
            None => BackupStore::in_memory(),
        };
        let pruner = Arc::new(SparsePruner::new(
            Arc::clone(&weights),
            Arc::clone(&concepts),
            Arc::clone(&bus),
            config.pruner.clone(),
            backups,
            config.max_edges,
            &metrics,
        ));

        let koopman = Arc::new(KoopmanLearner::open(
            dirs.as_ref().map(|(_, _, m, _)| m.as_path()),
            config.koopman.clone(),
            Arc::clone(&bus),
            &metrics,
        )?);

        let pipeline = Arc::new(Self {
            config: Mutex::new(config),
            metrics,
            bus,
            vault,
            weights,
            concepts,
            scheduler,
            pruner,
            koopman,
            weights_dir,
            accepting: AtomicBool::new(true),
            shutdown: Arc::new(AtomicBool::new(false)),
            pumps: Mutex::new(Vec::new()),
        });
        pipeline.spawn_pumps();
        tracing::info!("pipeline up");
        Ok(pipeline)
    }

    /// Background pumps: concept.delta → pruner protection + auto triggers;
    /// activation.trace → learner ingestion; periodic housekeeping.
    fn spawn_pumps(self: &Arc<Self>) {
        let mut pumps = self.pumps.lock().expect("pump registry poisoned");

        // Pruner pump.
        {
            let shutdown = Arc::clone(&self.shutdown);
            let pruner = Arc::clone(&self.pruner);
            let sub = self.bus.subscribe("pruner", &[Topic::ConceptDelta]);
            pumps.push(std::thread::spawn(move || {
                let mut last_tick = Instant::now();
                while !shutdown.load(Ordering::Acquire) {
                    if let Some(event) = sub.recv_timeout(Duration::from_millis(200)) {
                        if let crate::bus::Event::ConceptDelta {
                            changed_concepts, ..
                        } = event
                        {
                            pruner.note_delta(&changed_concepts);
                        }
                    }
                    if last_tick.elapsed() >= Duration::from_secs(1) {
                        pruner.maintenance_tick();
                        last_tick = Instant::now();
                    }
                }
                sub.close();
            }));
        }

        // Learner pump: batch traces between timeouts.
        {
            let shutdown = Arc::clone(&self.shutdown);
            let koopman = Arc::clone(&self.koopman);
            let sub = self.bus.subscribe("koopman", &[Topic::ActivationTrace]);
            pumps.push(std::thread::spawn(move || {
                let mut batch_seq = 0u64;
                while !shutdown.load(Ordering::Acquire) {
                    let mut traces: Vec<TraceInput> = Vec::new();
                    let wait_until = Instant::now() + Duration::from_millis(200);
                    while traces.len() < 64 {
                        let left = wait_until.saturating_duration_since(Instant::now());
                        if left.is_zero() {
                            break;
                        }
                        match sub.recv_timeout(left) {
                            Some(event) => {
                                if let Some(trace) = trace_from_event(&event) {
                                    traces.push(trace);
                                }
                            }
                            None => break,
                        }
                    }
                    if traces.is_empty() {
                        continue;
                    }
                    batch_seq += 1;
                    let batch_id = format!("bus-{batch_seq:08x}");
                    match koopman.process_activation_batch(
                        &batch_id,
                        &traces,
                        Deadline::NONE,
                        CancelToken::new(),
                    ) {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(batch = %batch_id, error = %e, "trace batch dropped")
                        }
                    }
                }
                sub.close();
            }));
        }

        // Housekeeping: vault eviction sweep and job-table retention.
        {
            let shutdown = Arc::clone(&self.shutdown);
            let vault = Arc::clone(&self.vault);
            let scheduler = Arc::clone(&self.scheduler);
            pumps.push(std::thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(500));
                    let _ = vault.sweep();
                    scheduler.sweep_jobs();
                }
            }));
        }
    }

    /// Drain and stop: refuse new work, stop pumps, flush the checkpoint.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.accepting.store(false, Ordering::Release);
        tracing::info!("pipeline draining");

        let pumps: Vec<_> = {
            let mut registry = self.pumps.lock().expect("pump registry poisoned");
            registry.drain(..).collect()
        };
        for pump in pumps {
            let _ = pump.join();
        }

        if let Some(dir) = &self.weights_dir {
            match WeightCheckpoint::open(dir) {
                Ok(ckpt) => {
                    if let Err(e) = ckpt.save(&self.weights.snapshot()) {
                        tracing::error!(error = %e, "final checkpoint flush failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "final checkpoint flush failed"),
            }
        }
        tracing::info!("pipeline stopped");
    }

    fn check_accepting(&self) -> OneirosResult<()> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::ShuttingDown.into())
        }
    }

    // -- Vault surface -----------------------------------------------------

    pub fn put_episode(&self, draft: EpisodeDraft) -> OneirosResult<PutOutcome> {
        self.check_accepting()?;
        Ok(self.vault.put(draft)?)
    }

    pub fn get_episode(&self, id: EpisodeId) -> OneirosResult<Option<Episode>> {
        Ok(self.vault.get(id)?)
    }

    pub fn list_recent(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> OneirosResult<(Vec<Episode>, Option<String>, u64)> {
        Ok(self.vault.list_recent(limit, cursor)?)
    }

    pub fn vault_stats(&self) -> OneirosResult<VaultStats> {
        Ok(self.vault.stats()?)
    }

    // -- Scheduler surface -------------------------------------------------

    /// Start consolidation; waits for completion or returns the running
    /// job's id immediately.
    pub fn start_consolidation(
        self: &Arc<Self>,
        max_episodes: u32,
        once: bool,
        wait_for_completion: bool,
        deadline: Deadline,
    ) -> OneirosResult<StartedConsolidation> {
        self.check_accepting()?;
        let cancel = CancelToken::new();
        if wait_for_completion {
            let outcome = self
                .scheduler
                .start_consolidation(max_episodes, once, deadline, cancel)?;
            return Ok(StartedConsolidation {
                job_id: outcome.job_id.clone(),
                outcome: Some(outcome),
            });
        }

        let job_id = self.scheduler.reserve(&cancel)?;
        let scheduler = Arc::clone(&self.scheduler);
        let thread_job_id = job_id.clone();
        std::thread::spawn(move || {
            if let Err(e) =
                scheduler.run_reserved(&thread_job_id, max_episodes, once, deadline, cancel)
            {
                tracing::warn!(job = %thread_job_id, error = %e, "background consolidation failed");
            }
        });
        Ok(StartedConsolidation {
            job_id,
            outcome: None,
        })
    }

    pub fn consolidation_status(&self, job_id: &str) -> Option<ConsolidationJob> {
        self.scheduler.job(job_id)
    }

    pub fn consolidation_jobs(&self) -> Vec<ConsolidationJob> {
        self.scheduler.jobs()
    }

    pub fn cancel_consolidation(&self) -> bool {
        self.scheduler.cancel_current()
    }

    pub fn scheduler_phase(&self) -> Phase {
        self.scheduler.phase()
    }

    // -- Pruner surface ----------------------------------------------------

    /// Trigger a prune. `None` thresholds fall back to the configuration.
    pub fn trigger_pruning(
        &self,
        threshold: Option<f64>,
        target_sparsity: Option<f64>,
        dry_run: bool,
        create_backup: bool,
        deadline: Deadline,
    ) -> OneirosResult<PruneOutcome> {
        self.check_accepting()?;
        let cfg = self.config.lock().expect("config poisoned").pruner.clone();
        Ok(self.pruner.trigger(
            threshold.unwrap_or(cfg.prune_threshold),
            target_sparsity.unwrap_or(cfg.target_sparsity),
            dry_run,
            create_backup,
            deadline,
            CancelToken::new(),
        )?)
    }

    pub fn preview_pruning(
        &self,
        threshold: Option<f64>,
        target_sparsity: Option<f64>,
    ) -> OneirosResult<PrunePreview> {
        let cfg = self.config.lock().expect("config poisoned").pruner.clone();
        Ok(self.pruner.preview(
            threshold.unwrap_or(cfg.prune_threshold),
            target_sparsity.unwrap_or(cfg.target_sparsity),
        )?)
    }

    pub fn pruning_status(&self, pruning_id: &str) -> Option<PruneOpRecord> {
        self.pruner.op(pruning_id)
    }

    pub fn pruning_ops(&self) -> Vec<PruneOpRecord> {
        self.pruner.ops()
    }

    pub fn revert_prune(&self, pruning_id: &str) -> OneirosResult<()> {
        self.check_accepting()?;
        Ok(self.pruner.revert(pruning_id)?)
    }

    // -- Learner surface ---------------------------------------------------

    pub fn process_activation_batch(
        &self,
        batch_id: &str,
        traces: &[TraceInput],
        deadline: Deadline,
    ) -> OneirosResult<BatchOutcome> {
        self.check_accepting()?;
        Ok(self
            .koopman
            .process_activation_batch(batch_id, traces, deadline, CancelToken::new())?)
    }

    pub fn spectral_modes(
        &self,
        max_modes: usize,
    ) -> (Vec<crate::koopman::modes::SpectralMode>, u64) {
        self.koopman.spectral_modes(max_modes)
    }

    pub fn update_oscillator_couplings(&self) -> OneirosResult<usize> {
        self.check_accepting()?;
        Ok(self.koopman.update_oscillator_couplings())
    }

    // -- Configuration & health -------------------------------------------

    /// Apply a flat scalar update map; valid keys land on the services,
    /// errors come back per key. `w_clip` and `max_edges` only take effect
    /// on restart (the matrix is constructed with them).
    pub fn update_config(&self, updates: &BTreeMap<String, ConfigScalar>) -> Vec<OneirosError> {
        let mut config = self.config.lock().expect("config poisoned");
        let errors = config.apply_updates(updates);
        self.vault.set_config(config.vault.clone());
        self.scheduler.set_config(config.scheduler.clone());
        self.pruner.set_config(config.pruner.clone());
        self.koopman.set_config(config.koopman.clone());
        errors.into_iter().map(OneirosError::from).collect()
    }

    /// Aggregate health report.
    pub fn health(&self) -> HealthReport {
        let snapshot = self.weights.snapshot();
        HealthReport {
            accepting: self.accepting.load(Ordering::Acquire),
            vault_degraded: self.vault.is_degraded(),
            koopman_degraded: self.koopman.is_degraded(),
            checkpoint_healthy: self.scheduler.checkpoint_healthy(),
            scheduler_phase: self.scheduler.phase().to_string(),
            w_version: snapshot.version(),
            w_edges: snapshot.nnz(),
            concepts: self.concepts.len(),
            mode_count: self.koopman.mode_count(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Current weight version (snapshot consistency tag).
    pub fn w_version(&self) -> u64 {
        self.weights.version()
    }

    /// Remove concepts with no edges that no retained episode references.
    ///
    /// The episode check scans the retained window (bounded); concepts seen
    /// there survive even with zero degree.
    pub fn sweep_concepts(&self) -> OneirosResult<usize> {
        let mut referenced: std::collections::HashSet<u64> = std::collections::HashSet::new();
        let mut cursor: Option<String> = None;
        let mut scanned = 0usize;
        loop {
            let (episodes, next, _) = self.vault.list_recent(512, cursor.as_deref())?;
            for episode in &episodes {
                for id in &episode.concept_ids {
                    referenced.insert(id.get());
                }
            }
            scanned += episodes.len();
            match next {
                Some(n) if scanned < 100_000 => cursor = Some(n),
                _ => break,
            }
        }
        let removed = self
            .concepts
            .sweep_orphans(|id| referenced.contains(&id.get()));
        Ok(removed.len())
    }

    /// The shared bus (tests and embedding callers subscribe here).
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The shared metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    fn memory_pipeline() -> Arc<Pipeline> {
        Pipeline::new(PipelineConfig {
            scheduler: crate::config::SchedulerConfig {
                seed: Some(7),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn draft(t: u64) -> EpisodeDraft {
        EpisodeDraft {
            created_at: Some(t),
            concept_ids: vec![cid(1), cid(2), cid(3), cid(4)],
            activation_vector: vec![1.0, 1.0, -1.0, -1.0],
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn full_surface_smoke() {
        let pipeline = memory_pipeline();
        for t in 1..=10u64 {
            pipeline.put_episode(draft(t)).unwrap();
        }
        let stats = pipeline.vault_stats().unwrap();
        assert_eq!(stats.count, 10);

        let started = pipeline
            .start_consolidation(10, true, true, Deadline::NONE)
            .unwrap();
        let outcome = started.outcome.unwrap();
        assert_eq!(outcome.episodes_processed, 10);
        assert!(pipeline.w_version() >= 1);

        let health = pipeline.health();
        assert!(health.healthy());
        assert!(health.w_edges > 0);

        pipeline.shutdown();
        assert!(pipeline.put_episode(draft(99)).is_err());
    }

    #[test]
    fn async_consolidation_returns_job_id() {
        let pipeline = memory_pipeline();
        for t in 1..=6u64 {
            pipeline.put_episode(draft(t)).unwrap();
        }
        let started = pipeline
            .start_consolidation(6, true, false, Deadline::NONE)
            .unwrap();
        assert!(started.outcome.is_none());
        // The job becomes terminal shortly.
        let mut done = false;
        for _ in 0..200 {
            if let Some(job) = pipeline.consolidation_status(&started.job_id) {
                if job.state.is_terminal() {
                    done = true;
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(done);
        pipeline.shutdown();
    }

    #[test]
    fn update_config_routes_and_reports() {
        let pipeline = memory_pipeline();
        let mut updates = BTreeMap::new();
        updates.insert("anneal_T0".to_string(), ConfigScalar::Float(1.5));
        updates.insert("bogus".to_string(), ConfigScalar::Int(1));
        let errors = pipeline.update_config(&updates);
        assert_eq!(errors.len(), 1);
        pipeline.shutdown();
    }

    #[test]
    fn durable_pipeline_restores_weights() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PipelineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            scheduler: crate::config::SchedulerConfig {
                seed: Some(7),
                ..Default::default()
            },
            ..Default::default()
        };
        let edges_before;
        {
            let pipeline = Pipeline::new(config.clone()).unwrap();
            for t in 1..=8u64 {
                pipeline.put_episode(draft(t)).unwrap();
            }
            pipeline
                .start_consolidation(8, true, true, Deadline::NONE)
                .unwrap();
            edges_before = pipeline.health().w_edges;
            assert!(edges_before > 0);
            pipeline.shutdown();
        }
        let pipeline = Pipeline::new(config).unwrap();
        assert_eq!(pipeline.health().w_edges, edges_before);
        assert!(pipeline.w_version() >= 1);
        pipeline.shutdown();
    }
}
