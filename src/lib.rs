//! # oneiros
//!
//! A memory consolidation pipeline: episodic traces are replayed through an
//! energy-based consolidation engine, the resulting concept graph is kept
//! sparse under a quality budget, and spectral (Koopman) modes extracted
//! from the replay trajectories feed back as coupling updates.
//!
//! ## Architecture
//!
//! - **Episodic vault** (`vault`): durable, content-addressed episode store
//!   with bounded growth, backed by redb
//! - **Sleep scheduler** (`scheduler`): annealed wake–sleep consolidation
//!   with a monotone-energy guard and snapshot rollback
//! - **Sparse pruner** (`pruner`): L1-driven edge removal with reversible,
//!   backed-up prune operations
//! - **Koopman learner** (`koopman`): streaming sparse DMD over activation
//!   trajectories with a merged, stability-scored mode set
//! - **Event bus** (`bus`): bounded fan-out pub/sub connecting the services
//! - **Pipeline facade** (`engine`): ordered startup/drain and the RPC
//!   surface over all four services
//!
//! ## Library usage
//!
//! ```no_run
//! use oneiros::concept::ConceptId;
//! use oneiros::config::PipelineConfig;
//! use oneiros::engine::Pipeline;
//! use oneiros::rpc::Deadline;
//! use oneiros::vault::EpisodeDraft;
//!
//! let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
//! pipeline
//!     .put_episode(EpisodeDraft {
//!         created_at: None,
//!         concept_ids: vec![ConceptId::new(1).unwrap(), ConceptId::new(2).unwrap()],
//!         activation_vector: vec![0.8, -0.4],
//!         meta: Default::default(),
//!     })
//!     .unwrap();
//! pipeline.start_consolidation(32, true, true, Deadline::NONE).unwrap();
//! ```

pub mod bus;
pub mod concept;
pub mod config;
pub mod engine;
pub mod episode;
pub mod error;
pub mod koopman;
pub mod linalg;
pub mod metrics;
pub mod pruner;
pub mod rpc;
pub mod scheduler;
pub mod vault;
pub mod weights;
