//! fuzzmill - continuous fuzzing orchestrator.
//!
//! Parses configuration from flags and environment variables, wires up the
//! collaborators, and runs fuzzing cycles until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fuzzmill_core::{Config, CorpusStore, CrashReporter, CycleController, GoToolchain};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// fuzzmill - continuous fuzzing orchestrator
#[derive(Parser, Debug)]
#[command(name = "fuzzmill")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Git repo URL of the project to fuzz
    #[arg(long = "project_src_path", env = "PROJECT_SRC_PATH")]
    project_src_path: String,

    /// Name of the S3 bucket where the seed corpus is stored
    #[arg(long = "s3_bucket_name", env = "S3_BUCKET_NAME")]
    s3_bucket_name: String,

    /// Path to store fuzzing results
    #[arg(long = "fuzz_results_path", env = "FUZZ_RESULTS_PATH")]
    fuzz_results_path: String,

    /// Comma-separated list of package paths to fuzz, relative to the
    /// project root directory
    #[arg(
        long = "fuzz_pkgs_path",
        env = "FUZZ_PKGS_PATH",
        value_delimiter = ',',
        required = true
    )]
    fuzz_pkgs_path: Vec<String>,

    /// Duration between consecutive fuzzing cycles
    #[arg(
        long = "sync_frequency",
        env = "SYNC_FREQUENCY",
        default_value = "120s",
        value_parser = parse_duration
    )]
    sync_frequency: Duration,

    /// Number of concurrent fuzzing workers
    #[arg(long = "num_workers", env = "NUM_WORKERS", default_value_t = 1)]
    num_workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,
}

fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::new(
        cli.project_src_path,
        cli.s3_bucket_name,
        &cli.fuzz_results_path,
        cli.fuzz_pkgs_path,
        cli.sync_frequency,
        cli.num_workers,
    )
    .context("invalid configuration")?;

    let reporter =
        CrashReporter::from_config(&config).context("failed to set up crash reporting")?;
    let store = CorpusStore::connect(config.s3_bucket_name.clone()).await;

    let controller = CycleController::new(
        Arc::new(config),
        store,
        Arc::new(GoToolchain),
        Arc::new(reporter),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    if let Err(err) = controller.run(shutdown).await {
        error!(error = %err, "fuzzing process failed");
        std::process::exit(1);
    }

    Ok(())
}

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}
