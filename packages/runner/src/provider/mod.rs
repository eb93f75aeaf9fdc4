// packages/runner/src/provider/mod.rs
//! Providers: one per kind of execution environment
//!
//! Every provider implements the same fixed set of hooks, so the
//! orchestrator drives a standalone host and a registered static host
//! through an identical pipeline:
//!
//! ```text
//! use_cached_run ──accepted──────────────┐
//!       │ rejected / no cache             │
//!       ▼                                 ▼
//! configure_run ──► set_protocol ──► worker_started ──► worker_finished
//! ```
//!
//! The provider is chosen once at startup from the configured
//! `providerType` and is never re-selected.
//!
//! - **standalone**: everything is pre-supplied by configuration
//! - **static**: a long-lived host that registers itself for credentials

pub mod registrar;
pub mod standalone;
pub mod static_host;

use crate::protocol::Protocol;
use crate::run::RunState;
use crate::utils::config::ProviderConfig;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use registrar::{RegistrationRequest, WorkerRegistrar};
pub use standalone::StandaloneProvider;
pub use static_host::StaticProvider;

/// Hooks every environment-specific provider implements
#[async_trait]
pub trait Provider: Send + Sync {
    /// The configured `providerType` this provider serves
    fn provider_type(&self) -> &str;

    /// Fill a fresh `state` from this provider's source of truth
    ///
    /// Must be idempotent: two calls against an unchanged environment
    /// yield equal states.
    async fn configure_run(&mut self, state: &mut RunState) -> Result<()>;

    /// Decide whether a cached `state` is still usable
    ///
    /// `Ok` accepts the cache (possibly after refreshing parts of it in
    /// place) and skips `configure_run`. An error rejects it; the caller
    /// discards the state entirely.
    async fn use_cached_run(&mut self, state: &mut RunState) -> Result<()>;

    /// Attach the live worker channel; must not block
    fn set_protocol(&mut self, protocol: Protocol);

    /// The worker is running with `state`; an error aborts the bootstrap
    async fn worker_started(&mut self, state: &RunState) -> Result<()>;

    /// The worker has exited; errors are reported but not fatal
    async fn worker_finished(&mut self) -> Result<()>;
}

/// Constructs a provider from its configuration section
pub type ProviderFactory = Box<dyn Fn(&ProviderConfig) -> Result<Box<dyn Provider>> + Send + Sync>;

struct Registration {
    usage: &'static str,
    factory: ProviderFactory,
}

/// Maps `providerType` names to provider constructors
pub struct ProviderRegistry {
    providers: BTreeMap<String, Registration>,
}

impl ProviderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Registry with the built-in providers
    ///
    /// The static provider needs a [`WorkerRegistrar`]; until one is
    /// supplied with [`ProviderRegistry::with_registrar`], selecting it
    /// fails with a configuration error.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            standalone::PROVIDER_TYPE,
            standalone::USAGE,
            Box::new(|config: &ProviderConfig| {
                Ok(Box::new(StandaloneProvider::new(config)) as Box<dyn Provider>)
            }),
        );
        registry.register(
            static_host::PROVIDER_TYPE,
            static_host::USAGE,
            Box::new(|_: &ProviderConfig| {
                Err(RunnerError::Configuration(format!(
                    "provider type '{}' needs a worker registrar, and none is configured",
                    static_host::PROVIDER_TYPE
                )))
            }),
        );
        registry
    }

    /// Back the static provider with `registrar`
    pub fn with_registrar(mut self, registrar: Arc<dyn WorkerRegistrar>) -> Self {
        self.register(
            static_host::PROVIDER_TYPE,
            static_host::USAGE,
            Box::new(move |config: &ProviderConfig| {
                Ok(Box::new(StaticProvider::new(config, Arc::clone(&registrar))) as Box<dyn Provider>)
            }),
        );
        self
    }

    /// Add or replace a provider type
    pub fn register(&mut self, name: impl Into<String>, usage: &'static str, factory: ProviderFactory) {
        self.providers
            .insert(name.into(), Registration { usage, factory });
    }

    /// Construct the provider named by `config.provider_type`
    pub fn build(&self, config: &ProviderConfig) -> Result<Box<dyn Provider>> {
        match self.providers.get(&config.provider_type) {
            Some(registration) => (registration.factory)(config),
            None => Err(RunnerError::Configuration(format!(
                "unrecognized provider type '{}' (known: {})",
                config.provider_type,
                self.names().collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    pub fn usage(&self, name: &str) -> Option<&'static str> {
        self.providers.get(name).map(|r| r.usage)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
