//! Rich diagnostic error types for the oneiros pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so operators know exactly what went wrong
//! and how to fix it. [`ErrorKind`] classifies every error into the wire-level
//! taxonomy used by RPC responses and CLI exit codes.

use miette::Diagnostic;
use thiserror::Error;

/// Result alias for the top-level error type.
pub type OneirosResult<T> = std::result::Result<T, OneirosError>;

/// Top-level error type for the oneiros pipeline.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum OneirosError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pruner(#[from] PrunerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Koopman(#[from] KoopmanError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Weights(#[from] WeightsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

/// Wire-level classification of an error.
///
/// Every subsystem error maps onto exactly one kind; RPC envelopes carry the
/// kind as `status` and the CLI maps kinds onto exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Malformed input: size/shape/range violation.
    InvalidArgument,
    /// Unknown id.
    NotFound,
    /// Duplicate idempotent operation (non-fatal).
    AlreadyExists,
    /// Transient storage, solver, or peer failure; retryable.
    Unavailable,
    /// The state machine refuses (already running, degraded, unhealthy).
    FailedPrecondition,
    /// A quality-budget or energy-drift guard tripped.
    PolicyRefusal,
    /// Unexpected failure; triggers degraded mode.
    Internal,
}

impl ErrorKind {
    /// Whether a caller may retry the operation as-is.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }

    /// CLI exit code for this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => 2,
            ErrorKind::Unavailable => 3,
            ErrorKind::PolicyRefusal => 4,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::FailedPrecondition => "failed-precondition",
            ErrorKind::PolicyRefusal => "policy-refusal",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl OneirosError {
    /// Classify this error into the wire-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OneirosError::Vault(e) => e.kind(),
            OneirosError::Scheduler(e) => e.kind(),
            OneirosError::Pruner(e) => e.kind(),
            OneirosError::Koopman(e) => e.kind(),
            OneirosError::Weights(e) => e.kind(),
            OneirosError::Bus(e) => e.kind(),
            OneirosError::Config(e) => e.kind(),
            OneirosError::Engine(e) => e.kind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Vault errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum VaultError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(oneiros::vault::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("episode store error: {message}")]
    #[diagnostic(
        code(oneiros::vault::storage),
        help(
            "The embedded episode database encountered a transaction error. \
             The vault has entered read-only degraded mode; writes will fail \
             fast until the store recovers. Check disk space and permissions."
        )
    )]
    Storage { message: String },

    #[error("episode encoding error: {message}")]
    #[diagnostic(
        code(oneiros::vault::encoding),
        help(
            "Failed to serialize or deserialize an episode record. This usually \
             means the stored format changed between versions or the record is \
             corrupt."
        )
    )]
    Encoding { message: String },

    #[error("episode too large: {size} bytes (limit {limit})")]
    #[diagnostic(
        code(oneiros::vault::size_exceeded),
        help(
            "The encoded episode exceeds the per-episode size limit. Reduce the \
             activation vector length or trim the metadata, or raise \
             `episode_size_limit` in the vault configuration."
        )
    )]
    SizeExceeded { size: usize, limit: usize },

    #[error("vault quota exceeded: eviction could not restore bounds")]
    #[diagnostic(
        code(oneiros::vault::quota_exceeded),
        help(
            "Both the episode-count and byte bounds are saturated and eviction \
             made no progress. Raise `max_episodes`/`max_bytes` or investigate \
             why eviction is stalled."
        )
    )]
    QuotaExceeded,

    #[error("activation value out of range at index {index}: {value}")]
    #[diagnostic(
        code(oneiros::vault::activation_range),
        help("Activation values must be finite and lie in [-1, 1].")
    )]
    ActivationRange { index: usize, value: f32 },

    #[error("episode metadata too large: {entries} entries, {bytes} bytes")]
    #[diagnostic(
        code(oneiros::vault::meta_too_large),
        help("Episode metadata is bounded; keep it to short key/value pairs.")
    )]
    MetaTooLarge { entries: usize, bytes: usize },

    #[error("episode not found: {id}")]
    #[diagnostic(
        code(oneiros::vault::not_found),
        help("No episode with this id exists. It may have been evicted.")
    )]
    NotFound { id: String },

    #[error("malformed list cursor")]
    #[diagnostic(
        code(oneiros::vault::bad_cursor),
        help(
            "The pagination cursor could not be decoded. Cursors are opaque; \
             pass back exactly the `next_cursor` from the previous response."
        )
    )]
    BadCursor,

    #[error("vault is in read-only degraded mode")]
    #[diagnostic(
        code(oneiros::vault::degraded),
        help(
            "A previous storage failure flipped the vault read-only. Reads still \
             succeed; writes fail fast. Restart the service once the underlying \
             storage is healthy."
        )
    )]
    Degraded,
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Io { .. } | VaultError::Storage { .. } => ErrorKind::Unavailable,
            VaultError::Encoding { .. } => ErrorKind::Internal,
            VaultError::SizeExceeded { .. }
            | VaultError::ActivationRange { .. }
            | VaultError::MetaTooLarge { .. }
            | VaultError::BadCursor => ErrorKind::InvalidArgument,
            VaultError::QuotaExceeded => ErrorKind::Unavailable,
            VaultError::NotFound { .. } => ErrorKind::NotFound,
            VaultError::Degraded => ErrorKind::FailedPrecondition,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("a consolidation cycle is already running")]
    #[diagnostic(
        code(oneiros::scheduler::already_running),
        help(
            "Only one consolidation cycle may mutate the weight matrix at a \
             time. Poll `GetConsolidationStatus` and retry once the current \
             cycle finishes."
        )
    )]
    AlreadyRunning,

    #[error("energy drift: {energy_after} > {energy_before} + {epsilon}")]
    #[diagnostic(
        code(oneiros::scheduler::energy_drift),
        help(
            "Mean energy increased across the cycle beyond the drift tolerance. \
             The weight matrix was rolled back to its pre-cycle snapshot. \
             Inspect the failed job; a persistently drifting scheduler usually \
             means the learning rate is too high for the current batch."
        )
    )]
    EnergyDrift {
        energy_before: f64,
        energy_after: f64,
        epsilon: f64,
    },

    #[error("vault unavailable after {attempts} fetch attempts")]
    #[diagnostic(
        code(oneiros::scheduler::vault_unavailable),
        help(
            "Fetching the episode batch kept failing after bounded backoff. \
             Check the vault's health; the cycle can be retried."
        )
    )]
    VaultUnavailable { attempts: u32 },

    #[error("checkpoint subsystem unhealthy")]
    #[diagnostic(
        code(oneiros::scheduler::checkpoint_unhealthy),
        help(
            "A previous weight checkpoint write failed; cycles refuse to start \
             until a checkpoint probe succeeds. Check disk space and \
             permissions on the weights directory."
        )
    )]
    CheckpointUnhealthy,

    #[error("consolidation job not found: {id}")]
    #[diagnostic(
        code(oneiros::scheduler::job_not_found),
        help("No job with this id is retained. Jobs are kept for the retention window only.")
    )]
    JobNotFound { id: String },

    #[error("no episodes available for consolidation")]
    #[diagnostic(
        code(oneiros::scheduler::empty_batch),
        help("The vault returned no episodes in the sampling window. Ingest episodes first.")
    )]
    EmptyBatch,

    #[error("consolidation cycle cancelled")]
    #[diagnostic(
        code(oneiros::scheduler::cancelled),
        help("The cycle was cancelled at a phase boundary; the weight matrix is unchanged.")
    )]
    Cancelled,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::AlreadyRunning | SchedulerError::CheckpointUnhealthy => {
                ErrorKind::FailedPrecondition
            }
            SchedulerError::EnergyDrift { .. } => ErrorKind::PolicyRefusal,
            SchedulerError::VaultUnavailable { .. } => ErrorKind::Unavailable,
            SchedulerError::JobNotFound { .. } => ErrorKind::NotFound,
            SchedulerError::EmptyBatch => ErrorKind::FailedPrecondition,
            SchedulerError::Cancelled => ErrorKind::FailedPrecondition,
        }
    }
}

// ---------------------------------------------------------------------------
// Pruner errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PrunerError {
    #[error("a prune operation is already in flight")]
    #[diagnostic(
        code(oneiros::pruner::op_in_flight),
        help("Only one prune may be active at a time. Wait for it to finish and retry.")
    )]
    OpInFlight,

    #[error("estimated quality impact {estimated:.4} exceeds budget {budget:.4}")]
    #[diagnostic(
        code(oneiros::pruner::quality_budget),
        help(
            "Committing this prune would remove more edge mass than the quality \
             budget allows. Raise `quality_budget`, lower the threshold, or \
             prune in smaller steps."
        )
    )]
    QualityBudget { estimated: f64, budget: f64 },

    #[error("backup write failed: {message}")]
    #[diagnostic(
        code(oneiros::pruner::backup_write),
        help(
            "The compact diff backup could not be written, so the commit was \
             aborted and the weight matrix is untouched. Check the prunes \
             directory."
        )
    )]
    BackupWrite { message: String },

    #[error("prune backup expired or missing for {id}")]
    #[diagnostic(
        code(oneiros::pruner::backup_expired),
        help(
            "The rollback window for this prune has elapsed and its backup was \
             garbage-collected. The operation can no longer be reverted."
        )
    )]
    BackupExpired { id: String },

    #[error("prune operation not found: {id}")]
    #[diagnostic(
        code(oneiros::pruner::op_not_found),
        help("No prune operation with this id is known.")
    )]
    OpNotFound { id: String },

    #[error("prune solver failed to converge")]
    #[diagnostic(
        code(oneiros::pruner::solver_diverged),
        help(
            "The sparsification pass did not reach a feasible solution within \
             its iteration bound. The weight matrix is untouched."
        )
    )]
    SolverDiverged,

    #[error("prune threshold out of range: {value}")]
    #[diagnostic(
        code(oneiros::pruner::bad_threshold),
        help("The prune threshold must be a finite, non-negative magnitude.")
    )]
    BadThreshold { value: f64 },

    #[error("prune operation cancelled")]
    #[diagnostic(
        code(oneiros::pruner::cancelled),
        help("The prune was cancelled before its commit point; the weight matrix is unchanged.")
    )]
    Cancelled,
}

impl PrunerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrunerError::OpInFlight => ErrorKind::FailedPrecondition,
            PrunerError::QualityBudget { .. } => ErrorKind::PolicyRefusal,
            PrunerError::BackupWrite { .. } => ErrorKind::Unavailable,
            PrunerError::BackupExpired { .. } => ErrorKind::FailedPrecondition,
            PrunerError::OpNotFound { .. } => ErrorKind::NotFound,
            PrunerError::SolverDiverged => ErrorKind::Unavailable,
            PrunerError::BadThreshold { .. } => ErrorKind::InvalidArgument,
            PrunerError::Cancelled => ErrorKind::FailedPrecondition,
        }
    }
}

// ---------------------------------------------------------------------------
// Koopman errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum KoopmanError {
    #[error("activation batch too large: {traces} traces (limit {limit})")]
    #[diagnostic(
        code(oneiros::koopman::batch_too_large),
        help("Split the batch: the learner bounds per-call ingestion to keep refreshes timely.")
    )]
    BatchTooLarge { traces: usize, limit: usize },

    #[error("spectral learner is degraded after {failures} consecutive refresh failures")]
    #[diagnostic(
        code(oneiros::koopman::degraded),
        help(
            "Repeated numerical failures in the decomposition refresh put the \
             learner into read-only mode. Queries still work; ingestion is \
             refused until the service restarts."
        )
    )]
    Degraded { failures: u32 },

    #[error("numerical failure during {stage}")]
    #[diagnostic(
        code(oneiros::koopman::numerical),
        help(
            "The decomposition did not converge. The mode set is unchanged; \
             the failure is counted toward the degradation threshold."
        )
    )]
    Numerical { stage: String },

    #[error("snapshot length mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(oneiros::koopman::shape_mismatch),
        help(
            "All snapshots in the rolling buffer must share the same ambient \
             dimension. Trajectories with a different activation length are \
             rejected."
        )
    )]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("mode snapshot I/O error: {source}")]
    #[diagnostic(
        code(oneiros::koopman::snapshot_io),
        help("Writing or pruning a mode-set snapshot file failed. Check the modes directory.")
    )]
    SnapshotIo {
        #[source]
        source: std::io::Error,
    },
}

impl KoopmanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KoopmanError::BatchTooLarge { .. } | KoopmanError::ShapeMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            KoopmanError::Degraded { .. } => ErrorKind::FailedPrecondition,
            KoopmanError::Numerical { .. } => ErrorKind::Unavailable,
            KoopmanError::SnapshotIo { .. } => ErrorKind::Unavailable,
        }
    }
}

// ---------------------------------------------------------------------------
// Weight matrix errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WeightsError {
    #[error("checkpoint I/O error: {source}")]
    #[diagnostic(
        code(oneiros::weights::checkpoint_io),
        help(
            "Writing the weight checkpoint failed. The previous checkpoint is \
             intact (writes go to a temp file first); check disk space and \
             permissions on the weights directory."
        )
    )]
    CheckpointIo {
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint encoding error: {message}")]
    #[diagnostic(
        code(oneiros::weights::checkpoint_encoding),
        help("The checkpoint record could not be encoded or decoded; it may be corrupt.")
    )]
    CheckpointEncoding { message: String },

    #[error("corrupt checkpoint at {path}")]
    #[diagnostic(
        code(oneiros::weights::corrupt),
        help(
            "The checkpoint file failed validation (bad magic or truncated \
             record). Move it aside to start from an empty matrix, or restore \
             from a backup."
        )
    )]
    Corrupt { path: String },
}

impl WeightsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeightsError::CheckpointIo { .. } => ErrorKind::Unavailable,
            WeightsError::CheckpointEncoding { .. } | WeightsError::Corrupt { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("subscription \"{name}\" is closed")]
    #[diagnostic(
        code(oneiros::bus::closed),
        help("The subscription was closed (service shutting down); no further receives.")
    )]
    Closed { name: String },
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Closed { .. } => ErrorKind::FailedPrecondition,
        }
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("unknown configuration key: {key}")]
    #[diagnostic(
        code(oneiros::config::unknown_key),
        help("See the recognized configuration keys in the documentation for `UpdateConfig`.")
    )]
    UnknownKey { key: String },

    #[error("invalid value for {key}: {message}")]
    #[diagnostic(
        code(oneiros::config::invalid_value),
        help("The value is out of range or has the wrong type for this key.")
    )]
    InvalidValue { key: String, message: String },

    #[error("failed to parse config file: {message}")]
    #[diagnostic(
        code(oneiros::config::parse),
        help("The TOML configuration file is malformed; check the syntax near the reported location.")
    )]
    Parse { message: String },

    #[error("failed to read config file {path}: {source}")]
    #[diagnostic(
        code(oneiros::config::io),
        help("Check that the config file exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::UnknownKey { .. }
            | ConfigError::InvalidValue { .. }
            | ConfigError::Parse { .. } => ErrorKind::InvalidArgument,
            ConfigError::Io { .. } => ErrorKind::Unavailable,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("failed to create data directory: {path}")]
    #[diagnostic(
        code(oneiros::engine::data_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    DataDir { path: String },

    #[error("invalid engine configuration: {message}")]
    #[diagnostic(
        code(oneiros::engine::invalid_config),
        help("One of the pipeline configuration values is out of range; see the message.")
    )]
    InvalidConfig { message: String },

    #[error("pipeline is shutting down")]
    #[diagnostic(
        code(oneiros::engine::shutting_down),
        help("New work is refused during drain. Wait for shutdown to complete and restart.")
    )]
    ShuttingDown,

    #[error("deadline exceeded")]
    #[diagnostic(
        code(oneiros::engine::deadline),
        help("The request deadline elapsed before the operation reached a commit point.")
    )]
    DeadlineExceeded,

    #[error("pipeline degraded: {detail}")]
    #[diagnostic(
        code(oneiros::engine::degraded),
        help(
            "One or more services refuse their normal workload. See the \
             health-check output for which flag tripped, fix the underlying \
             storage or numerical issue, and restart the affected service."
        )
    )]
    Degraded { detail: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::DataDir { .. } => ErrorKind::Unavailable,
            EngineError::InvalidConfig { .. } => ErrorKind::InvalidArgument,
            EngineError::ShuttingDown => ErrorKind::FailedPrecondition,
            EngineError::DeadlineExceeded => ErrorKind::Unavailable,
            EngineError::Degraded { .. } => ErrorKind::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_exit_codes() {
        assert_eq!(ErrorKind::InvalidArgument.exit_code(), 2);
        assert_eq!(ErrorKind::Unavailable.exit_code(), 3);
        assert_eq!(ErrorKind::PolicyRefusal.exit_code(), 4);
        assert_eq!(ErrorKind::NotFound.exit_code(), 1);
        assert_eq!(ErrorKind::Internal.exit_code(), 1);
    }

    #[test]
    fn drift_is_policy_refusal() {
        let err: OneirosError = SchedulerError::EnergyDrift {
            energy_before: -1.0,
            energy_after: -0.5,
            epsilon: 1e-3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PolicyRefusal);
        assert!(!err.kind().retryable());
    }

    #[test]
    fn storage_errors_are_retryable() {
        let err: OneirosError = VaultError::Storage {
            message: "commit failed".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.kind().retryable());
    }
}
