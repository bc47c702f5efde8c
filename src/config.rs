//! Pipeline configuration: typed sections per service, TOML file loading,
//! and the scalar-keyed `UpdateConfig` surface.
//!
//! Every recognized key can arrive either from the config file (nested TOML
//! sections) or through `UpdateConfig` as a flat `key → scalar` map. Updates
//! validate each key independently; invalid entries are collected as errors
//! and valid entries are applied together.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A scalar configuration value as carried by `UpdateConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigScalar {
    /// Parse from a CLI `key=value` string: bool, then integer, then float,
    /// falling back to text.
    pub fn parse(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return ConfigScalar::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return ConfigScalar::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return ConfigScalar::Float(f);
        }
        ConfigScalar::Text(raw.to_string())
    }

    fn as_f64(&self, key: &str) -> ConfigResult<f64> {
        match self {
            ConfigScalar::Float(f) => Ok(*f),
            ConfigScalar::Int(i) => Ok(*i as f64),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "expected a number".to_string(),
            }),
        }
    }

    fn as_u64(&self, key: &str) -> ConfigResult<u64> {
        match self {
            ConfigScalar::Int(i) if *i >= 0 => Ok(*i as u64),
            ConfigScalar::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Ok(*f as u64),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "expected a non-negative integer".to_string(),
            }),
        }
    }
}

fn require_positive(key: &str, value: f64) -> ConfigResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be a positive finite number, got {value}"),
        })
    }
}

fn require_unit_interval(key: &str, value: f64) -> ConfigResult<f64> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must lie in [0, 1], got {value}"),
        })
    }
}

fn require_open_unit(key: &str, value: f64) -> ConfigResult<f64> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must lie in (0, 1), got {value}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Per-service sections
// ---------------------------------------------------------------------------

/// Episodic vault bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Maximum retained episodes before eviction.
    pub max_episodes: u64,
    /// Maximum total payload bytes before eviction.
    pub max_bytes: u64,
    /// Per-episode encoded size limit in bytes.
    pub episode_size_limit: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_episodes: 100_000,
            max_bytes: 1 << 30,
            episode_size_limit: 256 * 1024,
        }
    }
}

/// Annealed wake–sleep consolidation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Initial annealing temperature.
    #[serde(rename = "anneal_T0")]
    pub anneal_t0: f64,
    /// Per-iteration temperature decay, in (0, 1).
    pub anneal_alpha: f64,
    /// Annealing iterations per cycle.
    #[serde(rename = "K_anneal")]
    pub k_anneal: u32,
    /// Gibbs sweeps per negative phase.
    #[serde(rename = "M_gibbs")]
    pub m_gibbs: u32,
    /// Hebbian learning rate.
    pub learning_eta: f64,
    /// Energy-drift tolerance for the rollback guard.
    pub energy_drift_epsilon: f64,
    /// Sampling window: cycles draw uniformly from the last N episodes.
    pub window_size: u32,
    /// Default batch size when `StartConsolidation` does not specify one.
    pub batch_size: u32,
    /// Bounded retries against a transiently failing vault.
    pub max_fetch_retries: u32,
    /// Finished jobs are retained at least this long (seconds).
    pub job_retention_secs: u64,
    /// Fixed RNG seed for replayable runs. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            anneal_t0: 2.0,
            anneal_alpha: 0.9,
            k_anneal: 10,
            m_gibbs: 5,
            learning_eta: 0.01,
            energy_drift_epsilon: 1e-3,
            window_size: 1024,
            batch_size: 32,
            max_fetch_retries: 5,
            job_retention_secs: 24 * 3600,
            seed: None,
        }
    }
}

/// Sparsification parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrunerConfig {
    /// L1 pressure applied outside the protected set.
    pub prune_l1_strength: f64,
    /// Minimum surviving edge magnitude.
    pub prune_threshold: f64,
    /// Target fraction of edges to keep sparse toward.
    pub target_sparsity: f64,
    /// How long a committed prune stays revertible (seconds).
    pub rollback_window_secs: u64,
    /// Largest relative quality impact a committed prune may introduce.
    pub quality_budget: f64,
    /// Scheduled trigger period (seconds); 0 disables the schedule.
    pub prune_interval_secs: u64,
    /// Event-driven trigger fires when `edge_count > max_edges · soft_cap`.
    pub soft_cap: f64,
    /// Sliding window during which `concept.delta` protects touched edges (seconds).
    pub delta_retention_secs: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            prune_l1_strength: 1e-3,
            prune_threshold: 1e-3,
            target_sparsity: 0.9,
            rollback_window_secs: 24 * 3600,
            quality_budget: 0.05,
            prune_interval_secs: 3600,
            soft_cap: 0.9,
            delta_retention_secs: 3600,
        }
    }
}

/// Spectral (Koopman) learner parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KoopmanConfig {
    /// Truncation rank of the snapshot SVD.
    pub kcl_rank: usize,
    /// Coefficients below this magnitude are dropped from a mode.
    pub mode_mag_floor: f64,
    /// Soft-threshold strength applied to mode coefficients.
    pub kcl_l1_strength: f64,
    /// Modes below this stability for `eviction_window` refreshes are evicted.
    pub stability_floor: f64,
    /// Eigenvalue proximity for considering two modes the same.
    pub eigen_merge_radius: f64,
    /// Coefficient cosine similarity required to merge modes.
    pub merge_cos_threshold: f64,
    /// Decomposition refresh cadence, in new samples.
    pub refresh_stride: usize,
    /// Refreshes a mode may stay under the stability floor before eviction.
    pub eviction_window: u32,
    /// EMA factor for stability updates.
    pub stability_beta: f64,
    /// Hard cap on non-zero coefficients per mode.
    pub sparsity_cap: usize,
    /// Coefficient L2 change required before a coupling update is emitted.
    pub coupling_epsilon: f64,
    /// Rolling snapshot-pair buffer capacity.
    pub window: usize,
    /// Per-call ingestion bound.
    pub max_batch_traces: usize,
    /// Consecutive refresh failures before the learner degrades.
    pub max_consecutive_refresh_failures: u32,
    /// Mode-set snapshot files retained on disk.
    pub kcl_retention: usize,
}

impl Default for KoopmanConfig {
    fn default() -> Self {
        Self {
            kcl_rank: 50,
            mode_mag_floor: 1e-3,
            kcl_l1_strength: 1e-3,
            stability_floor: 0.1,
            eigen_merge_radius: 0.05,
            merge_cos_threshold: 0.9,
            refresh_stride: 256,
            eviction_window: 5,
            stability_beta: 0.2,
            sparsity_cap: 64,
            coupling_epsilon: 1e-3,
            window: 1024,
            max_batch_traces: 1024,
            max_consecutive_refresh_failures: 3,
            kcl_retention: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline-wide configuration
// ---------------------------------------------------------------------------

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Data directory for persistence. `None` for memory-only mode.
    pub data_dir: Option<PathBuf>,
    /// Per-entry magnitude clip on `W`.
    pub w_clip: f64,
    /// Bound on `‖W‖₀`.
    pub max_edges: usize,
    /// Bus subscriber queue capacity.
    pub bus_queue_capacity: usize,
    pub vault: VaultConfig,
    pub scheduler: SchedulerConfig,
    pub pruner: PrunerConfig,
    pub koopman: KoopmanConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            w_clip: 1.0,
            max_edges: 100_000,
            bus_queue_capacity: crate::bus::DEFAULT_QUEUE_CAPACITY,
            vault: VaultConfig::default(),
            scheduler: SchedulerConfig::default(),
            pruner: PrunerConfig::default(),
            koopman: KoopmanConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Apply a flat scalar update map.
    ///
    /// Each key validates independently; valid keys are applied together and
    /// the errors for the rest are returned. An empty vector means every key
    /// was applied.
    pub fn apply_updates(
        &mut self,
        updates: &BTreeMap<String, ConfigScalar>,
    ) -> Vec<ConfigError> {
        let mut staged = self.clone();
        let mut errors = Vec::new();
        for (key, value) in updates {
            if let Err(e) = staged.set_key(key, value) {
                errors.push(e);
            }
        }
        *self = staged;
        errors
    }

    /// Set one recognized key. Unknown keys and out-of-range values error.
    pub fn set_key(&mut self, key: &str, value: &ConfigScalar) -> ConfigResult<()> {
        match key {
            // Annealing / learning
            "anneal_T0" => {
                self.scheduler.anneal_t0 = require_positive(key, value.as_f64(key)?)?;
            }
            "anneal_alpha" => {
                self.scheduler.anneal_alpha = require_open_unit(key, value.as_f64(key)?)?;
            }
            "K_anneal" => {
                self.scheduler.k_anneal = value.as_u64(key)?.clamp(1, 10_000) as u32;
            }
            "M_gibbs" => {
                self.scheduler.m_gibbs = value.as_u64(key)?.clamp(1, 10_000) as u32;
            }
            "learning_eta" => {
                self.scheduler.learning_eta = require_positive(key, value.as_f64(key)?)?;
            }
            "energy_drift_epsilon" => {
                self.scheduler.energy_drift_epsilon =
                    require_positive(key, value.as_f64(key)?)?;
            }
            "window_size" => {
                self.scheduler.window_size = value.as_u64(key)?.max(1) as u32;
            }
            "w_clip" => {
                self.w_clip = require_positive(key, value.as_f64(key)?)?;
            }
            // Pruning
            "prune_l1_strength" => {
                self.pruner.prune_l1_strength = require_positive(key, value.as_f64(key)?)?;
            }
            "prune_threshold" => {
                self.pruner.prune_threshold = require_positive(key, value.as_f64(key)?)?;
            }
            "target_sparsity" => {
                self.pruner.target_sparsity = require_unit_interval(key, value.as_f64(key)?)?;
            }
            "rollback_window" => {
                self.pruner.rollback_window_secs = value.as_u64(key)?;
            }
            "quality_budget" => {
                self.pruner.quality_budget = require_unit_interval(key, value.as_f64(key)?)?;
            }
            // Spectral learner
            "kcl_rank" => {
                self.koopman.kcl_rank = value.as_u64(key)?.max(1) as usize;
            }
            "mode_mag_floor" => {
                self.koopman.mode_mag_floor = require_positive(key, value.as_f64(key)?)?;
            }
            "kcl_l1_strength" => {
                self.koopman.kcl_l1_strength = require_positive(key, value.as_f64(key)?)?;
            }
            "stability_floor" => {
                self.koopman.stability_floor = require_unit_interval(key, value.as_f64(key)?)?;
            }
            "eigen_merge_radius" => {
                self.koopman.eigen_merge_radius = require_positive(key, value.as_f64(key)?)?;
            }
            "merge_cos_threshold" => {
                self.koopman.merge_cos_threshold =
                    require_unit_interval(key, value.as_f64(key)?)?;
            }
            "refresh_stride" => {
                self.koopman.refresh_stride = value.as_u64(key)?.max(1) as usize;
            }
            "eviction_window" => {
                self.koopman.eviction_window = value.as_u64(key)?.max(1) as u32;
            }
            // Vault
            "max_episodes" => {
                self.vault.max_episodes = value.as_u64(key)?.max(1);
            }
            "max_bytes" => {
                self.vault.max_bytes = value.as_u64(key)?.max(1);
            }
            "episode_size_limit" => {
                self.vault.episode_size_limit = value.as_u64(key)?.max(1) as usize;
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.scheduler.anneal_t0, 2.0);
        assert_eq!(cfg.scheduler.anneal_alpha, 0.9);
        assert_eq!(cfg.scheduler.k_anneal, 10);
        assert_eq!(cfg.scheduler.m_gibbs, 5);
        assert_eq!(cfg.scheduler.learning_eta, 0.01);
        assert_eq!(cfg.w_clip, 1.0);
        assert_eq!(cfg.pruner.prune_threshold, 1e-3);
        assert_eq!(cfg.pruner.target_sparsity, 0.9);
        assert_eq!(cfg.pruner.rollback_window_secs, 24 * 3600);
        assert_eq!(cfg.koopman.kcl_rank, 50);
        assert_eq!(cfg.koopman.refresh_stride, 256);
        assert_eq!(cfg.koopman.eviction_window, 5);
        assert_eq!(cfg.vault.episode_size_limit, 256 * 1024);
    }

    #[test]
    fn scalar_parse_prefers_narrowest_type() {
        assert_eq!(ConfigScalar::parse("true"), ConfigScalar::Bool(true));
        assert_eq!(ConfigScalar::parse("42"), ConfigScalar::Int(42));
        assert_eq!(ConfigScalar::parse("0.5"), ConfigScalar::Float(0.5));
        assert_eq!(
            ConfigScalar::parse("hello"),
            ConfigScalar::Text("hello".to_string())
        );
    }

    #[test]
    fn updates_apply_valid_and_collect_invalid() {
        let mut cfg = PipelineConfig::default();
        let mut updates = BTreeMap::new();
        updates.insert("anneal_T0".to_string(), ConfigScalar::Float(3.5));
        updates.insert("anneal_alpha".to_string(), ConfigScalar::Float(1.5));
        updates.insert("no_such_key".to_string(), ConfigScalar::Int(1));

        let errors = cfg.apply_updates(&updates);
        assert_eq!(errors.len(), 2);
        assert_eq!(cfg.scheduler.anneal_t0, 3.5);
        // The invalid alpha did not land.
        assert_eq!(cfg.scheduler.anneal_alpha, 0.9);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = PipelineConfig::default();
        let rendered = toml::to_string(&cfg).unwrap();
        let parsed: PipelineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.scheduler.k_anneal, cfg.scheduler.k_anneal);
        assert_eq!(parsed.koopman.kcl_rank, cfg.koopman.kcl_rank);
    }

    #[test]
    fn integer_accepted_where_float_expected() {
        let mut cfg = PipelineConfig::default();
        cfg.set_key("anneal_T0", &ConfigScalar::Int(4)).unwrap();
        assert_eq!(cfg.scheduler.anneal_t0, 4.0);
        assert!(cfg.set_key("anneal_T0", &ConfigScalar::Text("x".into())).is_err());
    }
}
