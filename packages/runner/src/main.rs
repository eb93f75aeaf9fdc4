// packages/runner/src/main.rs
//! Worker Runner
//!
//! Resolves a worker's identity and credentials through the configured
//! provider, starts the worker and supervises it until it exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use worker_runner::observability::init_tracing;
use worker_runner::{BuildInfo, Orchestrator, ProviderRegistry, RunnerConfig, RunnerSettings};

#[derive(Debug, Parser)]
#[command(name = "worker-runner", author, version, about = "Bootstrap and supervise a fleet worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Configure and run the worker described by a runner configuration file
    Start {
        /// Runner configuration (YAML)
        #[arg(env = "WORKER_RUNNER_CONFIG")]
        config: PathBuf,
    },

    /// Describe the configuration a provider expects
    Usage {
        /// Provider type; lists all providers when omitted
        provider: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = ProviderRegistry::with_defaults();

    match cli.command {
        Command::Usage { provider } => print_usage(&registry, provider.as_deref()),
        Command::Start { config } => start(&registry, config).await,
    }
}

fn print_usage(registry: &ProviderRegistry, provider: Option<&str>) -> Result<()> {
    match provider {
        Some(name) => {
            let usage = registry
                .usage(name)
                .with_context(|| format!("unknown provider type '{}'", name))?;
            println!("{}", usage.trim());
        }
        None => {
            println!("Available provider types:");
            for name in registry.names() {
                println!("  {}", name);
            }
            println!("\nRun `worker-runner usage <provider>` for details.");
        }
    }
    Ok(())
}

async fn start(registry: &ProviderRegistry, config_path: PathBuf) -> Result<()> {
    let settings = RunnerSettings::load()?;
    init_tracing(&settings)?;

    let build = BuildInfo::current();
    info!(
        "Starting worker-runner v{} ({}, built {} with {})",
        build.version, build.git_hash, build.build_timestamp, build.rustc_version
    );

    let config = RunnerConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!("Using provider '{}'", config.provider.provider_type);

    let orchestrator = Orchestrator::from_config(&config, registry, settings)?;
    let outcome = match orchestrator.run(shutdown_signal()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Worker run failed: {}", e);
            return Err(e.into());
        }
    };

    if outcome.exit.success() {
        info!("Worker exited cleanly");
        return Ok(());
    }

    warn!("Worker exited with {}", outcome.exit);
    let code = match (outcome.exit.code, outcome.exit.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    };
    std::process::exit(code);
}

/// Resolves on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}
