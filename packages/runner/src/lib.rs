// packages/runner/src/lib.rs
//! Worker Runner Library
//!
//! Bootstraps a worker process: an environment-specific provider fills in
//! the run state (identity, credentials, location), the worker is started
//! with it, and a capability-negotiated message channel stays open to the
//! worker for as long as it runs.
//!
//! # Architecture
//!
//! - **provider**: per-environment providers and the registry that selects one
//! - **run**: the run state record and its cache across restarts
//! - **protocol**: runner ↔ worker message channel
//! - **runtime**: worker process management and the bootstrap pipeline
//! - **observability**: tracing setup
//! - **utils**: errors and configuration

// Public module exports
pub mod observability;
pub mod protocol;
pub mod provider;
pub mod run;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use protocol::{Capabilities, Message, Protocol, ProtocolState, Role, Transport};
pub use provider::{Provider, ProviderRegistry, WorkerRegistrar};
pub use run::{CacheStore, RunState};
pub use runtime::{Orchestrator, RunOutcome, WorkerExit};
pub use utils::config::{RunnerConfig, RunnerSettings};
pub use utils::errors::{ProtocolError, Result, RunnerError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Runner build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
