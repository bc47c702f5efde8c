//! oneiros CLI: admin surface for the memory consolidation pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};

use oneiros::config::{ConfigScalar, PipelineConfig};
use oneiros::engine::Pipeline;
use oneiros::error::{ConfigError, OneirosError};
use oneiros::rpc::Deadline;

#[derive(Parser)]
#[command(name = "oneiros", version, about = "Memory consolidation pipeline")]
struct Cli {
    /// Data directory for persistent storage. Omit for memory-only mode.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline in the foreground until SIGINT/SIGTERM.
    Start,

    /// Print vault statistics, retained jobs, and prune history.
    Status,

    /// Run a consolidation cycle.
    TriggerConsolidation {
        /// Batch bound for the cycle (0 = configured default).
        #[arg(long, default_value = "0")]
        max_episodes: u32,

        /// Keep cycling while energy improves on full batches.
        #[arg(long)]
        repeat: bool,

        /// Return immediately with the job id instead of waiting.
        #[arg(long)]
        no_wait: bool,
    },

    /// Preview or apply a prune of the concept graph.
    TriggerPrune {
        /// Only preview the outcome; do not mutate.
        #[arg(long, conflicts_with = "apply")]
        preview: bool,

        /// Commit the prune.
        #[arg(long)]
        apply: bool,

        /// Run the full solve but write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Magnitude threshold (defaults to the configured value).
        #[arg(long)]
        threshold: Option<f64>,

        /// Removal cap as a fraction of edges (defaults to configuration).
        #[arg(long)]
        target_sparsity: Option<f64>,

        /// Skip the rollback backup.
        #[arg(long)]
        no_backup: bool,
    },

    /// Show the spectral mode set.
    KclStatus {
        /// Maximum modes to list.
        #[arg(long, default_value = "10")]
        max_modes: usize,
    },

    /// Revert a committed prune within its rollback window.
    RevertPrune {
        /// The prune operation id.
        id: String,
    },

    /// Update runtime configuration keys (key=value pairs).
    UpdateConfig {
        /// Assignments such as `anneal_T0=1.5`.
        #[arg(required = true)]
        assignments: Vec<String>,
    },

    /// Aggregate service health; exits non-zero when degraded.
    HealthCheck {
        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => {}
        Err(e) => {
            let code = e.kind().exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(code);
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, OneirosError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), OneirosError> {
    let config = load_config(&cli)?;
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Commands::Start => {
            let stop = Arc::new(AtomicBool::new(false));
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                let _ = signal_hook::flag::register(signal, Arc::clone(&stop));
            }
            println!("pipeline running; ctrl-c to stop");
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            pipeline.shutdown();
        }

        Commands::Status => {
            let stats = pipeline.vault_stats()?;
            println!(
                "vault: {} episodes, {} bytes{}",
                stats.count,
                stats.bytes,
                if stats.degraded { " (DEGRADED)" } else { "" }
            );
            if let (Some(oldest), Some(newest)) = (stats.oldest_at, stats.newest_at) {
                println!("  span: {oldest} .. {newest} (ns)");
            }
            let health = pipeline.health();
            println!(
                "weights: version {}, {} edges, {} concepts",
                health.w_version, health.w_edges, health.concepts
            );
            println!("modes: {}", health.mode_count);

            let jobs = pipeline.consolidation_jobs();
            println!("consolidation jobs: {}", jobs.len());
            for job in jobs.iter().take(10) {
                println!(
                    "  {} {} episodes={} energy={:?}->{:?}{}",
                    job.id,
                    job.state,
                    job.episodes_processed,
                    job.energy_before,
                    job.energy_after,
                    job.failure
                        .as_deref()
                        .map(|r| format!(" reason={r}"))
                        .unwrap_or_default()
                );
            }
            let ops = pipeline.pruning_ops();
            println!("prune ops: {}", ops.len());
            for op in ops.iter().take(10) {
                println!(
                    "  {} {} removed={} quality_delta={:.5}",
                    op.id, op.state, op.edges_removed, op.quality_delta
                );
            }
        }

        Commands::TriggerConsolidation {
            max_episodes,
            repeat,
            no_wait,
        } => {
            let started = pipeline.start_consolidation(
                max_episodes,
                !repeat,
                !no_wait,
                Deadline::NONE,
            )?;
            match started.outcome {
                Some(outcome) => println!(
                    "{}: processed {} episodes, energy delta {:.6}, W version {}",
                    outcome.job_id,
                    outcome.episodes_processed,
                    outcome.energy_delta,
                    outcome.w_version
                ),
                None => println!("{}: running", started.job_id),
            }
        }

        Commands::TriggerPrune {
            preview,
            apply,
            dry_run,
            threshold,
            target_sparsity,
            no_backup,
        } => {
            if preview || !apply {
                let p = pipeline.preview_pruning(threshold, target_sparsity)?;
                println!(
                    "{} of {} edges prunable ({:.1}%), estimated quality impact {:.5}",
                    p.prunable_edges,
                    p.total_edges,
                    p.prunable_percentage,
                    p.estimated_quality_impact
                );
            } else {
                let outcome = pipeline.trigger_pruning(
                    threshold,
                    target_sparsity,
                    dry_run,
                    !no_backup,
                    Deadline::NONE,
                )?;
                println!(
                    "{}: pruned {} edges, quality impact {:.5} ({})",
                    outcome.pruning_id,
                    outcome.edges_pruned,
                    outcome.quality_impact,
                    outcome.message
                );
            }
        }

        Commands::KclStatus { max_modes } => {
            let (modes, version) = pipeline.spectral_modes(max_modes);
            println!("refresh version {version}, {} modes", modes.len());
            for mode in modes {
                println!(
                    "  {} λ={} stability={:.3} support={}",
                    mode.mode_id,
                    mode.eigenvalue,
                    mode.stability,
                    mode.coefficients.len()
                );
            }
        }

        Commands::RevertPrune { id } => {
            pipeline.revert_prune(&id)?;
            println!("{id}: reverted");
        }

        Commands::UpdateConfig { assignments } => {
            let mut updates = BTreeMap::new();
            for assignment in &assignments {
                let Some((key, value)) = assignment.split_once('=') else {
                    return Err(ConfigError::InvalidValue {
                        key: assignment.clone(),
                        message: "expected key=value".to_string(),
                    }
                    .into());
                };
                updates.insert(key.to_string(), ConfigScalar::parse(value));
            }
            let errors = pipeline.update_config(&updates);
            if errors.is_empty() {
                println!("applied {} keys", updates.len());
            } else {
                for e in &errors {
                    eprintln!("{e}");
                }
                return Err(ConfigError::InvalidValue {
                    key: "update".to_string(),
                    message: format!("{} of {} keys rejected", errors.len(), updates.len()),
                }
                .into());
            }
        }

        Commands::HealthCheck { json } => {
            let health = pipeline.health();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&health).unwrap_or_default()
                );
            } else {
                println!(
                    "accepting={} vault_degraded={} koopman_degraded={} checkpoint_healthy={} phase={}",
                    health.accepting,
                    health.vault_degraded,
                    health.koopman_degraded,
                    health.checkpoint_healthy,
                    health.scheduler_phase
                );
                for (name, value) in &health.counters {
                    println!("  {name} = {value}");
                }
            }
            if !health.healthy() {
                let mut flags = Vec::new();
                if health.vault_degraded {
                    flags.push("vault");
                }
                if health.koopman_degraded {
                    flags.push("koopman");
                }
                if !health.checkpoint_healthy {
                    flags.push("checkpoint");
                }
                if !health.accepting {
                    flags.push("draining");
                }
                return Err(oneiros::error::EngineError::Degraded {
                    detail: flags.join(", "),
                }
                .into());
            }
        }
    }

    pipeline.shutdown();
    Ok(())
}
