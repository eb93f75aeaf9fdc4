// packages/runner/src/utils/config.rs
//! Runner configuration
//!
//! Two layers of configuration feed the runner:
//!
//! - **RunnerConfig**: the YAML document naming the provider, the worker
//!   command and the cache location
//! - **RunnerSettings**: ambient knobs (logging, grace periods) read from
//!   `WORKER_RUNNER_*` environment variables
//!
//! Provider settings stay untyped in [`ProviderConfig`] until the selected
//! provider unpacks them into its own settings struct.

use crate::utils::errors::{Result, RunnerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Untyped provider section of the runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Discriminator selecting the provider implementation
    #[serde(rename = "providerType")]
    pub provider_type: String,

    /// Every other key, kept verbatim for the provider to unpack
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl ProviderConfig {
    pub fn new(provider_type: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Unpack the provider data into typed settings
    ///
    /// Fails with a configuration error when a required key is missing,
    /// a value has the wrong type, or (for settings declared with
    /// `deny_unknown_fields`) an unexpected key is present.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.data.clone())).map_err(|e| {
            RunnerError::Configuration(format!(
                "invalid settings for provider '{}': {}",
                self.provider_type, e
            ))
        })
    }

    /// Reject empty values for settings that must carry content
    pub fn require<'a>(&self, key: &str, value: &'a str) -> Result<&'a str> {
        if value.trim().is_empty() {
            return Err(RunnerError::Configuration(format!(
                "provider '{}' requires a non-empty '{}'",
                self.provider_type, key
            )));
        }
        Ok(value)
    }
}

/// How the worker process is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerImplementation {
    /// Run an arbitrary executable speaking the line protocol on stdio
    Command,
}

/// Worker section of the runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    pub implementation: WorkerImplementation,

    /// Executable to run
    pub path: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Extra environment for the worker, applied before the run state
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The runner configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunnerConfig {
    pub provider: ProviderConfig,

    pub worker: WorkerConfig,

    /// Free-form configuration handed to the worker verbatim
    #[serde(default)]
    pub worker_config: serde_json::Map<String, serde_json::Value>,

    /// Where to persist the run state between restarts; caching is off when unset
    #[serde(default)]
    pub cache_over_restarts: Option<PathBuf>,
}

impl RunnerConfig {
    /// Load the configuration document from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| RunnerError::Configuration(format!("invalid runner configuration: {}", e)))
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Ambient runner settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunnerSettings {
    /// `tracing_subscriber::EnvFilter` directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Time a worker gets to finish after a graceful-termination request
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Time a worker may outlive its protocol channel before it is killed
    #[serde(default = "default_protocol_close_grace_secs")]
    pub protocol_close_grace_secs: u64,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_protocol_close_grace_secs() -> u64 {
    5
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            log_format: LogFormat::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            protocol_close_grace_secs: default_protocol_close_grace_secs(),
        }
    }
}

impl RunnerSettings {
    /// Load settings from `WORKER_RUNNER_*` environment variables
    pub fn load() -> Result<Self> {
        ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("WORKER_RUNNER").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RunnerError::Configuration(format!("invalid runner settings: {}", e)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn protocol_close_grace(&self) -> Duration {
        Duration::from_secs(self.protocol_close_grace_secs)
    }
}
