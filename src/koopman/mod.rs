//! KoopmanLearner: rolling spectral decomposition of activation
//! trajectories, translated into oscillator-coupling updates.
//!
//! Ingestion appends deduplicated snapshot pairs to the rolling buffer;
//! every `refresh_stride` new samples the decomposition is recomputed and
//! merged into the mode set (serialized under one lock, published to
//! readers as an immutable snapshot tagged with the refresh version).
//! Numerical failures leave the mode set untouched and count toward the
//! degradation threshold; a degraded learner serves reads only.

pub mod dmd;
pub mod modes;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::bus::{Event, EventBus};
use crate::concept::ConceptId;
use crate::config::KoopmanConfig;
use crate::episode::EpisodeId;
use crate::error::KoopmanError;
use crate::metrics::{Counter, Metrics};
use crate::rpc::{CancelToken, Deadline};

use dmd::{ExtractionParams, FeatureMap, IdentityMap, SnapshotBuffer};
use modes::{MergeParams, ModeSet, ModeSnapshotStore, SpectralMode};

/// Result alias for learner operations.
pub type KoopmanResult<T> = std::result::Result<T, KoopmanError>;

/// One activation trajectory handed to the learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInput {
    pub episode_id: EpisodeId,
    pub concept_ids: Vec<ConceptId>,
    /// Sign-quantized states, one per consolidation step.
    pub steps: Vec<Vec<f32>>,
}

/// Convert an `activation.trace` bus event into learner input.
pub fn trace_from_event(event: &Event) -> Option<TraceInput> {
    match event {
        Event::ActivationTrace {
            episode_id,
            concept_ids,
            trajectory,
        } => Some(TraceInput {
            episode_id: *episode_id,
            concept_ids: concept_ids.clone(),
            steps: trajectory.clone(),
        }),
        _ => None,
    }
}

/// Outcome of a `process_activation_batch` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Modes newly created or merged by the refresh this batch triggered
    /// (0 when no refresh ran).
    pub modes_extracted: usize,
    /// Mode-set size after the call.
    pub total_modes: usize,
    /// Whether a decomposition refresh ran.
    pub refreshed: bool,
}

struct Inner {
    buffer: SnapshotBuffer,
    set: ModeSet,
    samples_since_refresh: usize,
}

/// The spectral learner service.
pub struct KoopmanLearner {
    inner: Mutex<Inner>,
    published: RwLock<Arc<ModeSet>>,
    config: RwLock<KoopmanConfig>,
    feature_map: Box<dyn FeatureMap>,
    snapshots: Option<ModeSnapshotStore>,
    bus: Arc<EventBus>,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    refreshes: Counter,
    refresh_failures: Counter,
    coupling_updates: Counter,
}

impl KoopmanLearner {
    /// Wire up the learner with the identity feature map. A durable learner
    /// resumes from the newest mode snapshot on disk.
    pub fn open(
        data_dir: Option<&std::path::Path>,
        config: KoopmanConfig,
        bus: Arc<EventBus>,
        metrics: &Metrics,
    ) -> KoopmanResult<Self> {
        Self::with_feature_map(data_dir, config, bus, metrics, Box::new(IdentityMap))
    }

    /// Wire up the learner with a custom observable dictionary.
    pub fn with_feature_map(
        data_dir: Option<&std::path::Path>,
        config: KoopmanConfig,
        bus: Arc<EventBus>,
        metrics: &Metrics,
        feature_map: Box<dyn FeatureMap>,
    ) -> KoopmanResult<Self> {
        let snapshots = match data_dir {
            Some(dir) => Some(ModeSnapshotStore::open(dir)?),
            None => None,
        };
        let set = match &snapshots {
            Some(store) => store.load_latest()?.unwrap_or_default(),
            None => ModeSet::new(),
        };
        tracing::info!(
            rank = config.kcl_rank,
            refresh_stride = config.refresh_stride,
            resumed_modes = set.len(),
            "koopman learner up"
        );
        let published = Arc::new(set.clone());
        Ok(Self {
            inner: Mutex::new(Inner {
                buffer: SnapshotBuffer::new(config.window),
                set,
                samples_since_refresh: 0,
            }),
            published: RwLock::new(published),
            config: RwLock::new(config),
            feature_map,
            snapshots,
            bus,
            degraded: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            refreshes: metrics.counter("koopman.refreshes"),
            refresh_failures: metrics.counter("koopman.refresh_failures"),
            coupling_updates: metrics.counter("koopman.coupling_updates"),
        })
    }

    /// Whether the learner is read-only after repeated refresh failures.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Ingest a batch of trajectories, refreshing the decomposition when
    /// the stride is reached.
    pub fn process_activation_batch(
        &self,
        batch_id: &str,
        traces: &[TraceInput],
        deadline: Deadline,
        cancel: CancelToken,
    ) -> KoopmanResult<BatchOutcome> {
        if self.is_degraded() {
            return Err(KoopmanError::Degraded {
                failures: self.consecutive_failures.load(Ordering::Acquire),
            });
        }
        let cfg = self.config.read().expect("koopman config poisoned").clone();
        if traces.len() > cfg.max_batch_traces {
            return Err(KoopmanError::BatchTooLarge {
                traces: traces.len(),
                limit: cfg.max_batch_traces,
            });
        }

        let mut inner = self.inner.lock().expect("koopman inner poisoned");
        let mut appended = 0usize;
        for trace in traces {
            let width = trace.concept_ids.len();
            for (step, pair) in trace.steps.windows(2).enumerate() {
                let (from, to) = (&pair[0], &pair[1]);
                if from.len() != width || to.len() != width {
                    return Err(KoopmanError::ShapeMismatch {
                        expected: width,
                        actual: from.len().min(to.len()),
                    });
                }
                let x = self.feature_map.apply(&to_sparse(&trace.concept_ids, from));
                let y = self.feature_map.apply(&to_sparse(&trace.concept_ids, to));
                if inner
                    .buffer
                    .push((trace.episode_id, step as u32), x, y)
                {
                    appended += 1;
                }
            }
        }
        inner.samples_since_refresh += appended;
        tracing::debug!(batch = batch_id, appended, buffered = inner.buffer.len(), "batch ingested");

        let mut outcome = BatchOutcome {
            modes_extracted: 0,
            total_modes: inner.set.len(),
            refreshed: false,
        };
        if inner.samples_since_refresh >= cfg.refresh_stride {
            // A cancelled refresh must not publish new modes; the samples
            // stay counted and the next batch retries.
            if cancel.is_cancelled() || deadline.expired() {
                return Ok(outcome);
            }
            let extracted = self.do_refresh(&mut inner, &cfg)?;
            outcome.modes_extracted = extracted;
            outcome.total_modes = inner.set.len();
            outcome.refreshed = true;
        }
        Ok(outcome)
    }

    /// Recompute the decomposition and merge it into the set. Caller holds
    /// the inner lock, which serializes refreshes.
    fn do_refresh(&self, inner: &mut Inner, cfg: &KoopmanConfig) -> KoopmanResult<usize> {
        let params = ExtractionParams {
            rank: cfg.kcl_rank,
            l1_strength: cfg.kcl_l1_strength,
            mag_floor: cfg.mode_mag_floor,
            sparsity_cap: cfg.sparsity_cap,
            support_window: cfg.refresh_stride,
        };
        let raw = match dmd::refresh(&inner.buffer, &params) {
            Ok(raw) => raw,
            Err(failure) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                self.refresh_failures.inc();
                if failures >= cfg.max_consecutive_refresh_failures {
                    self.degraded.store(true, Ordering::Release);
                    tracing::error!(failures, "koopman learner degraded");
                }
                return Err(KoopmanError::Numerical {
                    stage: failure.stage.to_string(),
                });
            }
        };
        self.consecutive_failures.store(0, Ordering::Release);

        let version = inner.set.refresh_version() + 1;
        let merge = MergeParams {
            eigen_merge_radius: cfg.eigen_merge_radius,
            merge_cos_threshold: cfg.merge_cos_threshold,
            stability_beta: cfg.stability_beta,
            stability_floor: cfg.stability_floor,
            eviction_window: cfg.eviction_window,
        };
        let (new_modes, merged, evicted) = inner.set.merge_refresh(raw, &merge, version);
        inner.samples_since_refresh = 0;
        self.refreshes.inc();

        let emitted = self.emit_couplings_locked(&mut inner.set, cfg.coupling_epsilon);
        self.publish_set(&inner.set);
        if let Some(store) = &self.snapshots {
            store.save(&inner.set, cfg.kcl_retention)?;
        }
        tracing::info!(
            version,
            new_modes,
            merged,
            evicted,
            emitted,
            total = inner.set.len(),
            "decomposition refreshed"
        );
        Ok(new_modes + merged)
    }

    fn publish_set(&self, set: &ModeSet) {
        let mut published = self.published.write().expect("published set poisoned");
        *published = Arc::new(set.clone());
    }

    /// Emit `coupling.update` for every mode whose coefficients drifted by
    /// more than `coupling_epsilon` since its last emission.
    fn emit_couplings_locked(&self, set: &mut ModeSet, epsilon: f64) -> usize {
        let mut emitted = 0usize;
        for mode in set.modes_mut() {
            if mode.drift_since_emission() <= epsilon {
                continue;
            }
            let diff = mode.take_emission_diff();
            let coefficients_diff: Vec<(ConceptId, f32)> = diff
                .into_iter()
                .filter_map(|(raw, v)| ConceptId::new(raw).map(|id| (id, v)))
                .collect();
            self.bus.publish(Event::CouplingUpdate {
                mode_id: mode.mode_id.clone(),
                coefficients_diff,
                eigenvalue: mode.eigenvalue,
                stability: mode.stability,
            });
            emitted += 1;
        }
        self.coupling_updates.add(emitted as u64);
        emitted
    }

    /// Force a coupling-update pass outside the refresh cadence. Returns
    /// the number of updates emitted.
    pub fn update_oscillator_couplings(&self) -> usize {
        let epsilon = self
            .config
            .read()
            .expect("koopman config poisoned")
            .coupling_epsilon;
        let mut inner = self.inner.lock().expect("koopman inner poisoned");
        let emitted = self.emit_couplings_locked(&mut inner.set, epsilon);
        if emitted > 0 {
            self.publish_set(&inner.set);
        }
        emitted
    }

    /// A consistent view of the top modes and the refresh version it
    /// corresponds to.
    pub fn spectral_modes(&self, max_modes: usize) -> (Vec<SpectralMode>, u64) {
        let set = Arc::clone(&self.published.read().expect("published set poisoned"));
        (set.top_modes(max_modes), set.refresh_version())
    }

    /// Total retained modes.
    pub fn mode_count(&self) -> usize {
        self.published.read().expect("published set poisoned").len()
    }

    /// Replace the learner configuration.
    pub fn set_config(&self, config: KoopmanConfig) {
        *self.config.write().expect("koopman config poisoned") = config;
    }
}

fn to_sparse(concepts: &[ConceptId], values: &[f32]) -> std::collections::HashMap<u64, f32> {
    concepts
        .iter()
        .zip(values.iter())
        .map(|(c, &v)| (c.get(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(n: u8) -> EpisodeId {
        EpisodeId([n; 16])
    }

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    fn rig(config: KoopmanConfig) -> (KoopmanLearner, Arc<EventBus>) {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let learner = KoopmanLearner::open(None, config, Arc::clone(&bus), &metrics).unwrap();
        (learner, bus)
    }

    /// A decaying-rotation trajectory over 5 concepts: x_t = Re(λ^t v) with
    /// a complex sparse v (per-concept phases), so the snapshots span a
    /// two-dimensional subspace and the pair λ, λ̄ is identifiable.
    fn synthetic_trace(id: u8, steps: usize, start: usize) -> TraceInput {
        let rho = 0.95f64;
        let theta = std::f64::consts::PI / 8.0;
        let support = [3u64, 5, 8, 13, 21];
        let weights = [1.0f64, 0.8, 0.6, -0.7, 0.5];
        let phases = [0.0f64, 0.7, 1.4, 2.1, 2.8];
        let mut states = Vec::with_capacity(steps);
        for t in start..start + steps {
            let amp = rho.powi(t as i32);
            let phase = theta * t as f64;
            let state: Vec<f32> = weights
                .iter()
                .zip(phases.iter())
                .map(|(w, p)| (amp * w * (phase + p).cos()) as f32)
                .map(|v| v.clamp(-1.0, 1.0))
                .collect();
            states.push(state);
        }
        TraceInput {
            episode_id: eid(id),
            concept_ids: support.iter().map(|&c| cid(c)).collect(),
            steps: states,
        }
    }

    fn small_cfg() -> KoopmanConfig {
        KoopmanConfig {
            refresh_stride: 16,
            window: 256,
            ..KoopmanConfig::default()
        }
    }

    #[test]
    fn batch_too_large_is_rejected() {
        let cfg = KoopmanConfig {
            max_batch_traces: 2,
            ..small_cfg()
        };
        let (learner, _) = rig(cfg);
        let traces: Vec<TraceInput> = (0..3u8).map(|i| synthetic_trace(i, 4, 0)).collect();
        let err = learner
            .process_activation_batch("b1", &traces, Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, KoopmanError::BatchTooLarge { traces: 3, limit: 2 }));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let (learner, _) = rig(small_cfg());
        let trace = TraceInput {
            episode_id: eid(1),
            concept_ids: vec![cid(1), cid(2)],
            steps: vec![vec![1.0, -1.0], vec![1.0]],
        };
        let err = learner
            .process_activation_batch("b1", &[trace], Deadline::NONE, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, KoopmanError::ShapeMismatch { .. }));
    }

    #[test]
    fn refresh_extracts_the_planted_mode() {
        let (learner, _) = rig(small_cfg());
        // 40 transition pairs across two trajectories crosses the stride.
        let outcome = learner
            .process_activation_batch(
                "b1",
                &[synthetic_trace(1, 21, 0), synthetic_trace(2, 21, 1)],
                Deadline::NONE,
                CancelToken::new(),
            )
            .unwrap();
        assert!(outcome.refreshed);
        assert!(outcome.total_modes >= 1);

        let (modes, version) = learner.spectral_modes(10);
        assert_eq!(version, 1);
        let lead = &modes[0];
        // The planted eigenvalue: 0.95·e^{iπ/8}.
        let target_re = 0.95 * (std::f64::consts::PI / 8.0).cos();
        let target_im = 0.95 * (std::f64::consts::PI / 8.0).sin();
        let dist = ((f64::from(lead.eigenvalue.re) - target_re).powi(2)
            + (f64::from(lead.eigenvalue.im).abs() - target_im).powi(2))
        .sqrt();
        assert!(dist < 0.05, "eigenvalue {} off target", lead.eigenvalue);
        // Support stays within the planted concepts.
        let planted: std::collections::HashSet<u64> = [3, 5, 8, 13, 21].into_iter().collect();
        for (concept, _) in &lead.coefficients {
            assert!(planted.contains(concept));
        }
    }

    #[test]
    fn cancelled_refresh_publishes_nothing() {
        let (learner, _) = rig(small_cfg());
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = learner
            .process_activation_batch(
                "b1",
                &[synthetic_trace(1, 40, 0)],
                Deadline::NONE,
                cancel,
            )
            .unwrap();
        assert!(!outcome.refreshed);
        let (modes, version) = learner.spectral_modes(10);
        assert!(modes.is_empty());
        assert_eq!(version, 0);
    }

    #[test]
    fn coupling_updates_flow_on_refresh() {
        let (learner, bus) = rig(small_cfg());
        let sub = bus.subscribe("test", &[crate::bus::Topic::CouplingUpdate]);
        learner
            .process_activation_batch(
                "b1",
                &[synthetic_trace(1, 21, 0), synthetic_trace(2, 21, 1)],
                Deadline::NONE,
                CancelToken::new(),
            )
            .unwrap();
        let events = sub.drain();
        assert!(!events.is_empty());
        // Immediately after, nothing has drifted.
        assert_eq!(learner.update_oscillator_couplings(), 0);
    }

    #[test]
    fn dedup_ignores_replayed_steps() {
        let (learner, _) = rig(small_cfg());
        let trace = synthetic_trace(1, 8, 0);
        learner
            .process_activation_batch("b1", &[trace.clone()], Deadline::NONE, CancelToken::new())
            .unwrap();
        let outcome = learner
            .process_activation_batch("b2", &[trace], Deadline::NONE, CancelToken::new())
            .unwrap();
        // Replay added no samples, so no refresh could have triggered.
        assert!(!outcome.refreshed);
    }
}
