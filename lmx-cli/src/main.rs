//! LMX CLI: operator commands for the local inference runtime.
//!
//! Also hosts the hidden `loader-worker` subcommand, which is the isolated
//! child process the engine spawns for every load attempt.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// LMX: load, serve and inspect local LLM runtimes
#[derive(Parser, Debug)]
#[command(name = "lmx", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for `.lmx/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (skips user/workspace discovery)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl-C, then drain and unload
    Serve {
        /// Model to load at startup (repeatable)
        #[arg(short, long)]
        model: Vec<String>,
    },
    /// Load one model, optionally run a prompt, then unload
    Load {
        model_id: String,
        /// Prompt to stream through the loaded model
        #[arg(short, long)]
        prompt: Option<String>,
        /// Backend to try first (vllm-mlx, mlx-lm, gguf)
        #[arg(short, long)]
        backend: Option<String>,
        /// Retry backends that previously failed for this model
        #[arg(long)]
        allow_failed: bool,
        /// Memory estimate in GB used for admission
        #[arg(long)]
        memory_gb: Option<f64>,
        /// Maximum tokens for the prompt
        #[arg(long, default_value = "256")]
        max_tokens: u32,
    },
    /// Probe every candidate backend for a model without loading it
    Probe { model_id: String },
    /// Show host memory usage against the admission threshold
    Memory,
    /// Show the backend compatibility ledger
    Compat {
        /// Only entries for this model
        #[arg(short, long)]
        model: Option<String>,
        /// Number of most recent entries
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Inspect tuned profiles and regression gates
    Autotune {
        #[command(subcommand)]
        action: AutotuneAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Isolated load worker: one LoadSpec on stdin, one result line out
    #[command(hide = true)]
    LoaderWorker,
}

#[derive(clap::Subcommand, Debug)]
enum AutotuneAction {
    /// Print stored best profiles
    Show {
        #[arg(short, long)]
        model: Option<String>,
        /// Restrict to one backend
        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Compare candidate throughput against a baseline
    Gate {
        baseline_tps: f64,
        candidate_tps: f64,
        /// Largest tolerated fractional drop
        #[arg(long, default_value = "0.15")]
        max_drop: f64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to `.lmx/config.toml`
    Init,
    /// Print the effective configuration
    Show,
}

fn log_dir(config: &lmx_core::LmxConfig) -> PathBuf {
    config.storage.resolved_data_dir().join("logs")
}

/// Daily JSON log file under `log_dir`, or `None` when it cannot be opened.
fn file_writer(log_dir: &Path) -> Option<(NonBlocking, WorkerGuard)> {
    let _ = std::fs::create_dir_all(log_dir);
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("lmx")
        .filename_suffix("log")
        .build(log_dir)
        .ok()?;
    Some(tracing_appender::non_blocking(appender))
}

/// JSON daily file layer, plus a human stderr layer unless `worker` is set.
///
/// The worker's stderr is its failure channel, so it must stay clean. An
/// unwritable log directory drops the file layer instead of failing startup.
fn init_tracing(log_dir: &Path, filter: &str, worker: bool) -> Option<WorkerGuard> {
    let (json_layer, guard) = match file_writer(log_dir) {
        Some((writer, guard)) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = (!worker).then(|| {
        let env_filter =
            EnvFilter::try_from_env("LMX_LOG").unwrap_or_else(|_| EnvFilter::new(filter));
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .init();

    if guard.is_none() {
        tracing::warn!(log_dir = %log_dir.display(), "file_logging_disabled");
    }
    guard
}

fn load_config(cli: &Cli, workspace: &Path) -> anyhow::Result<lmx_core::LmxConfig> {
    let config = match &cli.config {
        Some(path) => lmx_core::load_config_file(path),
        None => lmx_core::load_config(Some(workspace), None),
    };
    config.map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if matches!(cli.command, Commands::LoaderWorker) {
        // A broken config must not stop the worker from answering.
        let config = load_config(&cli, &workspace).unwrap_or_default();
        let guard = init_tracing(&log_dir(&config), "off", true);
        let code = commands::run_loader_worker().await;
        drop(guard);
        std::process::exit(code);
    }

    let config = load_config(&cli, &workspace)?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _guard = init_tracing(&log_dir(&config), filter, false);

    commands::handle_command(cli.command, config, &workspace).await
}
