// packages/runner/src/provider/registrar.rs
//! Worker registration seam
//!
//! How a registered host proves its identity and receives credentials is
//! owned by the fleet manager's identity service. The runner only depends
//! on this trait; the embedding application supplies the client.

use crate::run::Credentials;
use crate::utils::errors::Result;
use async_trait::async_trait;

/// Identity a worker presents when registering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub root_url: String,
    pub provider_id: String,
    pub worker_pool_id: String,
    pub worker_group: String,
    pub worker_id: String,
    /// Proof of identity, opaque to the runner
    pub identity_proof: serde_json::Value,
}

/// Exchanges a worker identity for credentials
#[async_trait]
pub trait WorkerRegistrar: Send + Sync {
    /// Register (or re-register) the worker
    ///
    /// Unreachable or inconsistent services should surface as
    /// `RunnerError::Environment` so callers may retry; rejected
    /// identities as `RunnerError::Configuration`.
    async fn register_worker(&self, request: &RegistrationRequest) -> Result<Credentials>;
}
