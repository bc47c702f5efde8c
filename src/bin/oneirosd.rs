//! oneirosd — the oneiros daemon.
//!
//! Hosts one pipeline instance behind a JSON API mirroring the library
//! facade one-to-one:
//!
//! **Vault:**
//! - `POST /episodes` — put an episode
//! - `GET  /episodes/{id}` — fetch by content address
//! - `GET  /episodes` — list recent (`limit`, `cursor` query params)
//!
//! **Scheduler:**
//! - `POST /consolidation` — start a consolidation cycle
//! - `GET  /consolidation/{id}` — job status
//! - `POST /config` — apply scalar configuration updates
//!
//! **Pruner:**
//! - `POST /prune` — trigger (or dry-run) a prune
//! - `GET  /prune/preview` — pure preview
//! - `GET  /prune/{id}` — op status
//! - `POST /prune/{id}/revert` — revert within the rollback window
//!
//! **Learner:**
//! - `POST /kcl/batch` — ingest activation traces
//! - `GET  /kcl/modes` — spectral mode snapshot
//! - `POST /kcl/couplings` — force a coupling-update pass
//!
//! **Health:**
//! - `GET  /health` — aggregate service health
//!
//! Build and run: `cargo run --features server --bin oneirosd`

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use oneiros::concept::ConceptId;
use oneiros::config::{ConfigScalar, PipelineConfig};
use oneiros::engine::{HealthReport, Pipeline};
use oneiros::episode::{Episode, EpisodeId};
use oneiros::error::{ErrorKind, OneirosError};
use oneiros::koopman::TraceInput;
use oneiros::rpc::Deadline;
use oneiros::vault::EpisodeDraft;

#[derive(Parser)]
#[command(name = "oneirosd", version, about = "Memory consolidation pipeline daemon")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:7411")]
    listen: String,

    /// Data directory for persistent storage. Omit for memory-only mode.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

type AppState = Arc<Pipeline>;

fn http_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists | ErrorKind::FailedPrecondition => StatusCode::CONFLICT,
        ErrorKind::PolicyRefusal => StatusCode::FORBIDDEN,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: String,
    message: String,
    retryable: bool,
}

fn fail(e: OneirosError) -> (StatusCode, Json<ErrorBody>) {
    let kind = e.kind();
    (
        http_status(kind),
        Json(ErrorBody {
            status: kind.to_string(),
            message: e.to_string(),
            retryable: kind.retryable(),
        }),
    )
}

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

// ── Vault ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PutEpisodeRequest {
    #[serde(default)]
    created_at: Option<u64>,
    concept_ids: Vec<u64>,
    activation_vector: Vec<f32>,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct PutEpisodeResponse {
    id: String,
    accepted: bool,
    message: String,
}

async fn put_episode(
    State(pipeline): State<AppState>,
    Json(request): Json<PutEpisodeRequest>,
) -> Reply<PutEpisodeResponse> {
    let concept_ids: Option<Vec<ConceptId>> =
        request.concept_ids.iter().map(|&raw| ConceptId::new(raw)).collect();
    let Some(concept_ids) = concept_ids else {
        return Err(fail(
            oneiros::error::EngineError::InvalidConfig {
                message: "concept ids must be non-zero".to_string(),
            }
            .into(),
        ));
    };
    let outcome = pipeline
        .put_episode(EpisodeDraft {
            created_at: request.created_at,
            concept_ids,
            activation_vector: request.activation_vector,
            meta: request.meta,
        })
        .map_err(fail)?;
    Ok(Json(PutEpisodeResponse {
        id: outcome.id.to_string(),
        accepted: outcome.accepted,
        message: if outcome.accepted {
            format!("stored {} bytes", outcome.size)
        } else {
            "already present".to_string()
        },
    }))
}

#[derive(Serialize)]
struct GetEpisodeResponse {
    episode: Option<Episode>,
    found: bool,
}

async fn get_episode(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Reply<GetEpisodeResponse> {
    let Some(id) = EpisodeId::parse(&id) else {
        return Err(fail(
            oneiros::error::EngineError::InvalidConfig {
                message: "malformed episode id".to_string(),
            }
            .into(),
        ));
    };
    let episode = pipeline.get_episode(id).map_err(fail)?;
    let found = episode.is_some();
    Ok(Json(GetEpisodeResponse { episode, found }))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    cursor: Option<String>,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
struct ListRecentResponse {
    episodes: Vec<Episode>,
    next_cursor: Option<String>,
    total: u64,
}

async fn list_recent(
    State(pipeline): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Reply<ListRecentResponse> {
    let (episodes, next_cursor, total) = pipeline
        .list_recent(query.limit.min(1024), query.cursor.as_deref())
        .map_err(fail)?;
    Ok(Json(ListRecentResponse {
        episodes,
        next_cursor,
        total,
    }))
}

// ── Scheduler ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartConsolidationRequest {
    #[serde(default)]
    max_episodes: u32,
    #[serde(default = "default_true")]
    once: bool,
    #[serde(default = "default_true")]
    wait_for_completion: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct StartConsolidationResponse {
    consolidation_id: String,
    energy_delta: Option<f64>,
    episodes_processed: u32,
    status: String,
}

async fn start_consolidation(
    State(pipeline): State<AppState>,
    Json(request): Json<StartConsolidationRequest>,
) -> Reply<StartConsolidationResponse> {
    let deadline = request
        .timeout_ms
        .map(|ms| Deadline::after(std::time::Duration::from_millis(ms)))
        .unwrap_or(Deadline::NONE);
    let pipeline = Arc::clone(&pipeline);
    let started = tokio::task::spawn_blocking(move || {
        pipeline.start_consolidation(
            request.max_episodes,
            request.once,
            request.wait_for_completion,
            deadline,
        )
    })
    .await
    .map_err(|e| {
        fail(
            oneiros::error::EngineError::InvalidConfig {
                message: format!("worker panicked: {e}"),
            }
            .into(),
        )
    })?
    .map_err(fail)?;

    Ok(Json(match started.outcome {
        Some(outcome) => StartConsolidationResponse {
            consolidation_id: outcome.job_id,
            energy_delta: Some(outcome.energy_delta),
            episodes_processed: outcome.episodes_processed,
            status: "completed".to_string(),
        },
        None => StartConsolidationResponse {
            consolidation_id: started.job_id,
            energy_delta: None,
            episodes_processed: 0,
            status: "running".to_string(),
        },
    }))
}

#[derive(Serialize)]
struct ConsolidationStatusResponse {
    status: String,
    energy_delta: Option<f64>,
    progress: u32,
    message: String,
}

async fn consolidation_status(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Reply<ConsolidationStatusResponse> {
    let Some(job) = pipeline.consolidation_status(&id) else {
        return Err(fail(
            oneiros::error::SchedulerError::JobNotFound { id }.into(),
        ));
    };
    let energy_delta = match (job.energy_before, job.energy_after) {
        (Some(before), Some(after)) => Some(after - before),
        _ => None,
    };
    Ok(Json(ConsolidationStatusResponse {
        status: job.state.to_string(),
        energy_delta,
        progress: job.episodes_processed,
        message: job.failure.unwrap_or_default(),
    }))
}

#[derive(Serialize)]
struct UpdateConfigResponse {
    ok: bool,
    errors: Vec<String>,
}

async fn update_config(
    State(pipeline): State<AppState>,
    Json(updates): Json<BTreeMap<String, ConfigScalar>>,
) -> Json<UpdateConfigResponse> {
    let errors: Vec<String> = pipeline
        .update_config(&updates)
        .iter()
        .map(|e| e.to_string())
        .collect();
    Json(UpdateConfigResponse {
        ok: errors.is_empty(),
        errors,
    })
}

// ── Pruner ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TriggerPruningRequest {
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    target_sparsity: Option<f64>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_true")]
    create_backup: bool,
}

#[derive(Serialize)]
struct TriggerPruningResponse {
    pruning_id: String,
    edges_pruned: usize,
    quality_impact: f64,
    message: String,
}

async fn trigger_pruning(
    State(pipeline): State<AppState>,
    Json(request): Json<TriggerPruningRequest>,
) -> Reply<TriggerPruningResponse> {
    let pipeline = Arc::clone(&pipeline);
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.trigger_pruning(
            request.threshold,
            request.target_sparsity,
            request.dry_run,
            request.create_backup,
            Deadline::NONE,
        )
    })
    .await
    .map_err(|e| {
        fail(
            oneiros::error::EngineError::InvalidConfig {
                message: format!("worker panicked: {e}"),
            }
            .into(),
        )
    })?
    .map_err(fail)?;
    Ok(Json(TriggerPruningResponse {
        pruning_id: outcome.pruning_id,
        edges_pruned: outcome.edges_pruned,
        quality_impact: outcome.quality_impact,
        message: outcome.message,
    }))
}

#[derive(Deserialize)]
struct PreviewQuery {
    #[serde(default)]
    threshold: Option<f64>,
    #[serde(default)]
    target_sparsity: Option<f64>,
}

async fn preview_pruning(
    State(pipeline): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Reply<oneiros::pruner::PrunePreview> {
    let preview = pipeline
        .preview_pruning(query.threshold, query.target_sparsity)
        .map_err(fail)?;
    Ok(Json(preview))
}

#[derive(Serialize)]
struct PruningStatusResponse {
    status: String,
    progress: usize,
    message: String,
}

async fn pruning_status(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Reply<PruningStatusResponse> {
    let Some(op) = pipeline.pruning_status(&id) else {
        return Err(fail(oneiros::error::PrunerError::OpNotFound { id }.into()));
    };
    Ok(Json(PruningStatusResponse {
        status: op.state.to_string(),
        progress: op.edges_removed,
        message: op.message,
    }))
}

#[derive(Serialize)]
struct RevertResponse {
    ok: bool,
    message: String,
}

async fn revert_prune(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Reply<RevertResponse> {
    pipeline.revert_prune(&id).map_err(fail)?;
    Ok(Json(RevertResponse {
        ok: true,
        message: format!("{id} reverted"),
    }))
}

// ── Learner ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ProcessBatchRequest {
    batch_id: String,
    traces: Vec<TraceInput>,
}

#[derive(Serialize)]
struct ProcessBatchResponse {
    modes_extracted: usize,
    total_modes: usize,
    message: String,
}

async fn process_batch(
    State(pipeline): State<AppState>,
    Json(request): Json<ProcessBatchRequest>,
) -> Reply<ProcessBatchResponse> {
    let pipeline = Arc::clone(&pipeline);
    let outcome = tokio::task::spawn_blocking(move || {
        pipeline.process_activation_batch(&request.batch_id, &request.traces, Deadline::NONE)
    })
    .await
    .map_err(|e| {
        fail(
            oneiros::error::EngineError::InvalidConfig {
                message: format!("worker panicked: {e}"),
            }
            .into(),
        )
    })?
    .map_err(fail)?;
    Ok(Json(ProcessBatchResponse {
        modes_extracted: outcome.modes_extracted,
        total_modes: outcome.total_modes,
        message: if outcome.refreshed {
            "decomposition refreshed".to_string()
        } else {
            "buffered".to_string()
        },
    }))
}

#[derive(Deserialize)]
struct ModesQuery {
    #[serde(default = "default_max_modes")]
    max_modes: usize,
}

fn default_max_modes() -> usize {
    10
}

#[derive(Serialize)]
struct ModesResponse {
    modes: Vec<oneiros::koopman::modes::SpectralMode>,
    refresh_version: u64,
}

async fn spectral_modes(
    State(pipeline): State<AppState>,
    Query(query): Query<ModesQuery>,
) -> Json<ModesResponse> {
    let (modes, refresh_version) = pipeline.spectral_modes(query.max_modes);
    Json(ModesResponse {
        modes,
        refresh_version,
    })
}

#[derive(Serialize)]
struct CouplingsResponse {
    updates_emitted: usize,
}

async fn update_couplings(State(pipeline): State<AppState>) -> Reply<CouplingsResponse> {
    let updates_emitted = pipeline.update_oscillator_couplings().map_err(fail)?;
    Ok(Json(CouplingsResponse { updates_emitted }))
}

// ── Health ────────────────────────────────────────────────────────────────

async fn health(State(pipeline): State<AppState>) -> Json<HealthReport> {
    Json(pipeline.health())
}

// ── Main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).map_err(OneirosError::from)?,
        None => PipelineConfig::default(),
    };
    if args.data_dir.is_some() {
        config.data_dir = args.data_dir.clone();
    }

    let pipeline = Pipeline::new(config)?;

    let app = axum::Router::new()
        .route("/health", get(health))
        .route("/episodes", post(put_episode).get(list_recent))
        .route("/episodes/{id}", get(get_episode))
        .route("/consolidation", post(start_consolidation))
        .route("/consolidation/{id}", get(consolidation_status))
        .route("/config", post(update_config))
        .route("/prune", post(trigger_pruning))
        .route("/prune/preview", get(preview_pruning))
        .route("/prune/{id}", get(pruning_status))
        .route("/prune/{id}/revert", post(revert_prune))
        .route("/kcl/batch", post(process_batch))
        .route("/kcl/modes", get(spectral_modes))
        .route("/kcl/couplings", post(update_couplings))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&pipeline));

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .map_err(|e| miette::miette!("bind {}: {e}", args.listen))?;
    tracing::info!(listen = %args.listen, "oneirosd up");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| miette::miette!("server error: {e}"))?;

    pipeline.shutdown();
    Ok(())
}
