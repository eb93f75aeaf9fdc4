// packages/runner/src/utils/mod.rs
//! Shared utilities: error types and configuration loading

pub mod config;
pub mod errors;

pub use config::{
    LogFormat, ProviderConfig, RunnerConfig, RunnerSettings, WorkerConfig, WorkerImplementation,
};
pub use errors::{Hook, ProtocolError, Result, RunnerError};
