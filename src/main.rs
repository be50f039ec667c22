//! vehicle-uplink - durable telemetry uplink for vehicle trackers
//!
//! Reads location fixes, buffers them on disk and delivers them in batches
//! to the tracking backend.
//!
//! # Usage
//!
//! ```bash
//! # Track vehicle 7 from fixes piped on stdin
//! fix-provider | vehicle-uplink run --vehicle 7
//!
//! # Replay a recorded track and exit once everything is delivered
//! vehicle-uplink run --vehicle 7 --input track.jsonl --drain
//!
//! # Store the device token written by the login flow
//! vehicle-uplink token set eyJhbGciOi...
//!
//! # Inspect the on-disk queue
//! vehicle-uplink status
//! ```
//!
//! # Environment Variables
//!
//! - `UPLINK_CONFIG`: Path to uplink.toml (default: ./uplink.toml)
//! - `UPLINK_INGEST_URL`: Override `endpoint.url`
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vehicle_uplink::acquisition::{forward_fixes, FixSource, LineFixSource, StdinFixSource};
use vehicle_uplink::config::UplinkConfig;
use vehicle_uplink::uplink::{
    ControllerSettings, FileTokenStore, HttpIngestClient, SampleQueue, TokenProvider,
    UplinkController,
};

/// Env var overriding the configured ingestion URL
const INGEST_URL_ENV_VAR: &str = "UPLINK_INGEST_URL";

/// How often `run --drain` checks whether the queue has emptied after EOF
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vehicle-uplink")]
#[command(about = "Durable telemetry uplink for vehicle trackers")]
#[command(version)]
struct CliArgs {
    /// Path to uplink.toml (overrides UPLINK_CONFIG and ./uplink.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Track a vehicle: read fixes and deliver them until Ctrl+C
    Run {
        /// Vehicle identifier (must be positive)
        #[arg(long)]
        vehicle: i64,
        /// Read JSON-lines fixes from a file instead of stdin
        #[arg(long, value_name = "PATH")]
        input: Option<PathBuf>,
        /// Exit once input is exhausted and the queue is empty
        #[arg(long)]
        drain: bool,
    },

    /// Print queue statistics as JSON
    Status,

    /// Manage the stored endpoint token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Discard every queued sample (recovery from a corrupted queue)
    ResetQueue {
        /// Confirm that queued samples will be lost
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(clap::Subcommand, Debug)]
enum TokenAction {
    /// Store a bearer token
    Set { token: String },
    /// Remove the stored token
    Clear,
    /// Report whether a token is stored
    Show,
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(path: Option<&PathBuf>) -> Result<UplinkConfig> {
    let mut config = match path {
        Some(p) => UplinkConfig::load_from_file(p)
            .with_context(|| format!("Failed to load config from {}", p.display()))?,
        None => UplinkConfig::load(),
    };

    if let Ok(url) = std::env::var(INGEST_URL_ENV_VAR) {
        if !url.trim().is_empty() {
            info!(url = %url, "Endpoint URL overridden by {}", INGEST_URL_ENV_VAR);
            config.endpoint.url = url;
            config.validate()?;
        }
    }

    Ok(config)
}

// ============================================================================
// Task Supervision
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    FixReader,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::FixReader => write!(f, "FixReader"),
        }
    }
}

/// Spawn the task that pumps fixes from `source` into the controller.
///
/// With `drain`, once the source hits EOF the task waits for the queue to
/// empty and then cancels everything.
fn spawn_fix_reader<S: FixSource>(
    task_set: &mut JoinSet<Result<TaskName>>,
    mut source: S,
    controller: Arc<UplinkController>,
    cancel_token: CancellationToken,
    drain: bool,
) {
    task_set.spawn(async move {
        let stats = forward_fixes(&mut source, &controller, &cancel_token).await?;

        if drain && stats.exhausted && controller.drain(DRAIN_POLL_INTERVAL, &cancel_token).await? {
            cancel_token.cancel();
        }

        Ok(TaskName::FixReader)
    });
}

/// Monitor tasks until shutdown, cancelling everything if one fails.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "Task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Task panicked");
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        // Without --drain the uplink keeps delivering until Ctrl+C
                        cancel_token.cancelled().await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run_uplink(
    config: UplinkConfig,
    vehicle_id: i64,
    input: Option<PathBuf>,
    drain: bool,
) -> Result<()> {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  vehicle-uplink");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        endpoint = %config.endpoint.url,
        queue = %config.queue.path.display(),
        capacity = config.queue.capacity,
        batch_size = config.queue.batch_size,
        "Configuration"
    );

    let queue = Arc::new(
        SampleQueue::open(&config.queue.path, config.queue.capacity, config.queue.sync_writes)
            .context("Failed to open sample queue (use `reset-queue --yes` if it is corrupted)")?,
    );

    let tokens: Arc<dyn TokenProvider> = Arc::new(FileTokenStore::new(&config.auth.token_path));
    if tokens.token().is_none() {
        warn!(
            path = %config.auth.token_path.display(),
            "No auth token stored; samples will queue until one is set with `token set`"
        );
    }
    let client = HttpIngestClient::new(&config.endpoint.url, config.endpoint.timeout(), tokens)
        .context("Failed to build HTTP client")?;

    let controller = Arc::new(UplinkController::new(
        Arc::clone(&queue),
        Arc::new(client),
        ControllerSettings::from_config(&config),
    ));
    controller.start(vehicle_id).await?;

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    match input {
        Some(path) => {
            let source = LineFixSource::open(&path).await?;
            spawn_fix_reader(&mut task_set, source, Arc::clone(&controller), cancel_token.clone(), drain);
        }
        None => {
            spawn_fix_reader(
                &mut task_set,
                StdinFixSource::stdin(),
                Arc::clone(&controller),
                cancel_token.clone(),
                drain,
            );
        }
    }

    let supervised = run_supervisor(&mut task_set, cancel_token).await;
    task_set.shutdown().await;

    let stopped = controller.stop().await;
    queue.flush()?;
    let stats = queue.stats()?;
    info!(
        pending = stats.pending,
        delivered_total = stats.delivered_total,
        lost_total = stats.lost_total,
        "Uplink shutdown complete"
    );

    supervised?;
    stopped?;
    Ok(())
}

fn print_status(config: &UplinkConfig) -> Result<()> {
    let queue = SampleQueue::open(&config.queue.path, config.queue.capacity, false)
        .context("Failed to open sample queue")?;
    let stats = queue.stats()?;
    let oldest = queue.entries()?.first().map(|e| e.enqueued_at_ms);

    let report = serde_json::json!({
        "queue_path": config.queue.path,
        "capacity": queue.capacity(),
        "oldest_enqueued_at_ms": oldest,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_token(config: &UplinkConfig, action: TokenAction) -> Result<()> {
    let store = FileTokenStore::new(&config.auth.token_path);
    match action {
        TokenAction::Set { token } => {
            if token.trim().is_empty() {
                anyhow::bail!("Token must not be empty");
            }
            store
                .save(&token)
                .with_context(|| format!("Failed to write {}", store.path().display()))?;
        }
        TokenAction::Clear => {
            store
                .clear()
                .with_context(|| format!("Failed to remove {}", store.path().display()))?;
        }
        TokenAction::Show => {
            let state = if store.token().is_some() { "present" } else { "absent" };
            println!("token: {} ({})", state, store.path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize logging
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(args.config.as_ref())?;

    match args.command {
        SubCommand::Run { vehicle, input, drain } => run_uplink(config, vehicle, input, drain).await,
        SubCommand::Status => print_status(&config),
        SubCommand::Token { action } => handle_token(&config, action),
        SubCommand::ResetQueue { yes } => {
            if !yes {
                anyhow::bail!(
                    "Refusing to discard queued samples in {} without --yes",
                    config.queue.path.display()
                );
            }
            SampleQueue::reinitialize(&config.queue.path)?;
            info!(path = %config.queue.path.display(), "Sample queue reset");
            Ok(())
        }
        SubCommand::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
