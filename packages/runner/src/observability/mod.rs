// packages/runner/src/observability/mod.rs
//! Tracing setup
//!
//! Logs go to stderr: in stdio deployments the worker channel owns stdout.

use crate::utils::config::{LogFormat, RunnerSettings};
use crate::utils::errors::{Result, RunnerError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global tracing subscriber
pub fn init_tracing(settings: &RunnerSettings) -> Result<()> {
    let env_filter = EnvFilter::try_new(&settings.log_filter)
        .map_err(|e| RunnerError::Configuration(format!("invalid log filter: {}", e)))?;

    let registry = Registry::default().with(env_filter);

    let installed = match settings.log_format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| RunnerError::Configuration(format!("tracing already initialized: {}", e)))
}
