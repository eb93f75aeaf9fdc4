// packages/runner/src/utils/errors.rs
//! Error types shared across the runner
//!
//! Errors fall into four families:
//!
//! - **Configuration**: malformed or missing settings, never retried
//! - **Environment**: an external lookup failed, providers may retry
//! - **CacheRejected**: a cached run was refused, the caller falls back
//! - **Protocol**: the worker channel failed or was misused

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Provider hook that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    ConfigureRun,
    UseCachedRun,
    WorkerStarted,
    WorkerFinished,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::ConfigureRun => "configure-run",
            Hook::UseCachedRun => "use-cached-run",
            Hook::WorkerStarted => "worker-started",
            Hook::WorkerFinished => "worker-finished",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the worker message channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol channel closed")]
    ChannelClosed,

    #[error("cannot send '{name}' before capability negotiation has completed")]
    NotNegotiated { name: String },

    #[error("message type '{name}' is not a negotiated capability")]
    UnsupportedCapability { name: String },

    #[error("a handler for '{name}' is already registered")]
    DuplicateHandler { name: String },

    #[error("'{name}' is reserved for capability announcement")]
    ReservedMessage { name: String },

    #[error("capability negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("message encoding error: {0}")]
    Encoding(String),
}

/// Top-level runner error
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("cached run rejected: {0}")]
    CacheRejected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("provider '{provider}' failed in {hook}: {source}")]
    Hook {
        provider: String,
        hook: Hook,
        #[source]
        source: Box<RunnerError>,
    },

    #[error("worker error: {0}")]
    Worker(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunnerError {
    /// Wrap an error with the provider and hook that produced it
    pub fn in_hook(self, provider: impl Into<String>, hook: Hook) -> Self {
        RunnerError::Hook {
            provider: provider.into(),
            hook,
            source: Box::new(self),
        }
    }

    /// Only environment lookups are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnerError::Environment(_) => true,
            RunnerError::Hook { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Protocol error at the root of this error, if any
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            RunnerError::Protocol(e) => Some(e),
            RunnerError::Hook { source, .. } => source.protocol_error(),
            _ => None,
        }
    }
}
