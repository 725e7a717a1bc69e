//! CLI subcommand handlers.

use crate::AutotuneAction;
use crate::Commands;
use crate::ConfigAction;
use futures::StreamExt;
use lmx_core::LmxConfig;
use lmx_engine::loader::{default_probes, run_worker};
use lmx_engine::{
    AutotuneRegistry, BackendKind, ChatMessage, CompatOutcome, CompatibilityEntry,
    CompatibilityRegistry, GenerationParams, InferenceEngine, LoadOptions, MemoryMonitor,
    regression_gate,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Longest `serve` waits for in-flight requests on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: LmxConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve { model } => handle_serve(config, model).await,
        Commands::Load {
            model_id,
            prompt,
            backend,
            allow_failed,
            memory_gb,
            max_tokens,
        } => {
            let options = LoadOptions {
                backend: backend.as_deref().map(str::parse).transpose()?,
                allow_failed,
                memory_estimate_gb: memory_gb,
                ..LoadOptions::default()
            };
            handle_load(config, &model_id, options, prompt, max_tokens).await
        }
        Commands::Probe { model_id } => handle_probe(config, &model_id).await,
        Commands::Memory => handle_memory(&config),
        Commands::Compat { model, limit } => handle_compat(&config, model.as_deref(), limit),
        Commands::Autotune { action } => handle_autotune(&config, action),
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::LoaderWorker => {
            anyhow::bail!("loader-worker is dispatched before configuration is loaded")
        }
    }
}

/// Child-process entry point. Returns the exit code.
pub async fn run_loader_worker() -> i32 {
    let probes = default_probes();
    run_worker(
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
        &probes,
    )
    .await
}

async fn handle_serve(config: LmxConfig, models: Vec<String>) -> anyhow::Result<()> {
    let engine = Arc::new(InferenceEngine::from_config(&config)?);

    for model_id in &models {
        match engine.load_model(model_id, LoadOptions::default()).await {
            Ok(info) => println!("  loaded {} on {}", info.model_id, info.backend),
            Err(e) => {
                warn!(model_id = %model_id, error = %e, "startup_load_failed");
                eprintln!("  failed to load {model_id}: {e}");
            }
        }
    }

    let cancel = CancellationToken::new();
    let sweep = config.eviction.ttl_secs.map(|ttl| {
        engine.spawn_ttl_sweep(
            Duration::from_secs(ttl),
            Duration::from_secs(config.eviction.sweep_interval_secs.max(1)),
            cancel.clone(),
        )
    });

    info!(
        models = engine.loaded_models().len(),
        ttl_secs = config.eviction.ttl_secs,
        max_concurrent = config.concurrency.max_concurrent_requests,
        "lmx_serving"
    );
    println!("LMX engine running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("shutdown_requested");

    cancel.cancel();
    if let Some(handle) = sweep {
        let _ = handle.await;
    }

    let drained = engine.shutdown(SHUTDOWN_DRAIN).await;
    if !drained {
        eprintln!("  in-flight requests did not finish within {SHUTDOWN_DRAIN:?}");
    }
    Ok(())
}

async fn handle_load(
    config: LmxConfig,
    model_id: &str,
    options: LoadOptions,
    prompt: Option<String>,
    max_tokens: u32,
) -> anyhow::Result<()> {
    let engine = InferenceEngine::from_config(&config)?;

    let info = match engine.load_model(model_id, options).await {
        Ok(info) => info,
        Err(e) => {
            let readiness = engine.model_readiness(model_id);
            eprintln!(
                "Load failed ({}): {e}\n  readiness: {} (crash_count={})",
                e.code().map(|c| c.as_str()).unwrap_or("internal"),
                readiness.state,
                readiness.crash_count
            );
            return Err(e.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&info)?);

    if let Some(prompt) = prompt {
        let params = GenerationParams {
            max_tokens: Some(max_tokens),
            ..GenerationParams::default()
        };
        let messages = [ChatMessage::user(prompt)];
        let mut stream = Box::pin(
            engine
                .stream_generate(model_id, &messages, &params, None)
                .await?,
        );

        let mut stdout = std::io::stdout();
        while let Some(token) = stream.next().await {
            write!(stdout, "{}", token?)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;

        if let Some(metrics) = engine.performance_metrics(model_id) {
            println!(
                "  {:.1} tok/s, {:.0} ms total",
                metrics.avg_tokens_per_second, metrics.avg_total_ms
            );
        }
    }

    engine.unload_model(model_id).await;
    Ok(())
}

async fn handle_probe(config: LmxConfig, model_id: &str) -> anyhow::Result<()> {
    let engine = InferenceEngine::from_config(&config)?;
    let report = engine.probe_model_backends(model_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.recommended_backend.is_none() {
        anyhow::bail!("no backend passed the probe for {model_id}");
    }
    Ok(())
}

fn handle_memory(config: &LmxConfig) -> anyhow::Result<()> {
    let monitor = MemoryMonitor::from_config(&config.memory);
    let status = monitor.get_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if monitor.threshold_exceeded() {
        println!("  usage is at or above the {:.0}% threshold", status.threshold_percent);
    }
    Ok(())
}

fn format_entry(entry: &CompatibilityEntry) -> String {
    let outcome = match entry.outcome {
        CompatOutcome::Pass => "pass",
        CompatOutcome::Fail => "FAIL",
    };
    let mut line = format!(
        "{}  {:<4}  {}  {}@{}",
        entry.ts.format("%Y-%m-%d %H:%M:%S"),
        outcome,
        entry.model_id,
        entry.backend,
        entry.backend_version
    );
    if let Some(reason) = &entry.reason {
        line.push_str("  ");
        line.push_str(reason);
    }
    line
}

fn handle_compat(config: &LmxConfig, model: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let registry = CompatibilityRegistry::new(config.storage.compatibility_path());
    let entries = match model {
        Some(model_id) => registry.entries_for(model_id),
        None => registry.entries(),
    };
    if entries.is_empty() {
        println!("No compatibility records at {}", registry.path().display());
        return Ok(());
    }
    let skip = entries.len().saturating_sub(limit);
    for entry in &entries[skip..] {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn handle_autotune(config: &LmxConfig, action: AutotuneAction) -> anyhow::Result<()> {
    match action {
        AutotuneAction::Show { model, backend } => {
            let registry = AutotuneRegistry::new(config.storage.autotune_path());
            if let Some(backend) = &backend {
                backend.parse::<BackendKind>()?;
            }
            match model {
                Some(model_id) => match registry.best_for_model(&model_id, backend.as_deref()) {
                    Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                    None => println!("No tuned profile for {model_id}"),
                },
                None => {
                    let records: Vec<_> = registry
                        .records()
                        .into_values()
                        .filter(|r| backend.as_deref().is_none_or(|b| r.backend == b))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
            }
            Ok(())
        }
        AutotuneAction::Gate {
            baseline_tps,
            candidate_tps,
            max_drop,
        } => {
            let gate = regression_gate(baseline_tps, candidate_tps, max_drop);
            println!("{}", serde_json::to_string_pretty(&gate)?);
            if !gate.passed {
                anyhow::bail!(
                    "throughput dropped {:.1}% (limit {:.1}%)",
                    gate.drop_fraction * 100.0,
                    max_drop * 100.0
                );
            }
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, config: &LmxConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".lmx");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&LmxConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}
