// packages/runner/src/provider/static_host.rs
//! Static-host provider
//!
//! For long-lived hosts that are known to the fleet manager ahead of time.
//! The host registers with a pre-shared secret and receives credentials,
//! which may expire; while the worker runs, they are renewed shortly
//! before expiry and pushed to the worker over the protocol.

use crate::protocol::capabilities::NEW_CREDENTIALS;
use crate::protocol::{Message, Protocol};
use crate::provider::registrar::{RegistrationRequest, WorkerRegistrar};
use crate::provider::Provider;
use crate::run::state::CREDENTIAL_EXPIRY_MARGIN_SECS;
use crate::run::{Credentials, RunState, WorkerLocation};
use crate::utils::config::ProviderConfig;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const PROVIDER_TYPE: &str = "static";

/// Worker-location environment class reported by this provider
pub const ENVIRONMENT_CLASS: &str = "static";

/// Provider-metadata key carrying the configured provider id
pub const PROVIDER_ID_KEY: &str = "provider-id";

/// Pause between renewals when fresh credentials are already near expiry
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub const USAGE: &str = r#"
The providerType "static" is intended for workers provisioned with
worker-manager providers of type "static". It registers the host using a
pre-shared secret and renews the resulting credentials while the worker runs.

```yaml
provider:
    providerType: static
    rootURL: ..
    providerID: ..
    workerPoolID: ..
    workerGroup: ..
    workerID: ..
    staticSecret: ..  # shared secret configured for this worker
    # extra entries for TASKCLUSTER_WORKER_LOCATION
    workerLocation: {prop: val, ..}
```

The worker location of this provider has the following fields:

* cloud: static

as well as any worker location values from the configuration.
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StaticSettings {
    #[serde(rename = "rootURL")]
    root_url: String,

    #[serde(rename = "providerID")]
    provider_id: String,

    #[serde(rename = "workerPoolID")]
    worker_pool_id: String,

    #[serde(rename = "workerGroup")]
    worker_group: String,

    #[serde(rename = "workerID")]
    worker_id: String,

    #[serde(rename = "staticSecret")]
    static_secret: String,

    #[serde(rename = "workerLocation", default)]
    worker_location: BTreeMap<String, String>,
}

impl StaticSettings {
    fn request(&self) -> RegistrationRequest {
        RegistrationRequest {
            root_url: self.root_url.clone(),
            provider_id: self.provider_id.clone(),
            worker_pool_id: self.worker_pool_id.clone(),
            worker_group: self.worker_group.clone(),
            worker_id: self.worker_id.clone(),
            identity_proof: json!({ "staticSecret": self.static_secret }),
        }
    }

    /// Reason a cached state belongs to a different identity, if it does
    fn identity_mismatch(&self, state: &RunState) -> Option<&'static str> {
        if state.root_url != self.root_url {
            Some("rootURL")
        } else if state.worker_pool_id != self.worker_pool_id {
            Some("workerPoolID")
        } else if state.worker_group != self.worker_group {
            Some("workerGroup")
        } else if state.worker_id != self.worker_id {
            Some("workerID")
        } else if state.provider_metadata.get(PROVIDER_ID_KEY) != Some(&self.provider_id) {
            Some("providerID")
        } else {
            None
        }
    }
}

/// Bounded retry for registrar calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

async fn register_with_retry(
    registrar: &dyn WorkerRegistrar,
    request: &RegistrationRequest,
    retry: RetryPolicy,
) -> Result<Credentials> {
    let mut delay = retry.base_delay;
    let mut attempt = 1;
    loop {
        match registrar.register_worker(request).await {
            Ok(credentials) => return Ok(credentials),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                warn!(
                    "Registration attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, retry.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Time left before `expires` enters the renewal margin
fn until_refresh(expires: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires - ChronoDuration::seconds(CREDENTIAL_EXPIRY_MARGIN_SECS) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn credentials_message(credentials: &Credentials) -> Message {
    let mut message = Message::new(NEW_CREDENTIALS)
        .with("client-id", credentials.client_id.clone())
        .with("access-token", credentials.access_token.clone());
    if let Some(certificate) = &credentials.certificate {
        message = message.with("certificate", certificate.clone());
    }
    message
}

/// Renew credentials before they expire, for as long as the worker runs
async fn refresh_loop(
    registrar: Arc<dyn WorkerRegistrar>,
    request: RegistrationRequest,
    retry: RetryPolicy,
    protocol: Option<Protocol>,
    mut expires: DateTime<Utc>,
) {
    let mut first = true;
    loop {
        let mut wait = until_refresh(expires, Utc::now());
        if !first {
            wait = wait.max(MIN_REFRESH_INTERVAL);
        }
        first = false;
        debug!("Next credential renewal in {:?}", wait);
        tokio::time::sleep(wait).await;

        let credentials = match register_with_retry(registrar.as_ref(), &request, retry).await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("Credential renewal failed: {}", e);
                continue;
            }
        };
        info!("Renewed worker credentials for {}", credentials.client_id);

        match &protocol {
            Some(protocol) if protocol.capable(NEW_CREDENTIALS) => {
                if let Err(e) = protocol.send(credentials_message(&credentials)).await {
                    warn!("Could not deliver new credentials to the worker: {}", e);
                }
            }
            _ => warn!("Worker cannot receive new credentials; it keeps the old ones"),
        }

        match credentials.expires {
            Some(next) => expires = next,
            None => return,
        }
    }
}

/// Provider for pre-registered long-lived hosts
pub struct StaticProvider {
    config: ProviderConfig,
    registrar: Arc<dyn WorkerRegistrar>,
    retry: RetryPolicy,
    protocol: Option<Protocol>,
    refresh: Option<JoinHandle<()>>,
}

impl StaticProvider {
    pub fn new(config: &ProviderConfig, registrar: Arc<dyn WorkerRegistrar>) -> Self {
        Self {
            config: config.clone(),
            registrar,
            retry: RetryPolicy::default(),
            protocol: None,
            refresh: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn settings(&self) -> Result<StaticSettings> {
        let settings: StaticSettings = self.config.unpack()?;
        self.config.require("rootURL", &settings.root_url)?;
        self.config.require("providerID", &settings.provider_id)?;
        self.config.require("workerPoolID", &settings.worker_pool_id)?;
        self.config.require("workerGroup", &settings.worker_group)?;
        self.config.require("workerID", &settings.worker_id)?;
        self.config.require("staticSecret", &settings.static_secret)?;
        Ok(settings)
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn configure_run(&mut self, state: &mut RunState) -> Result<()> {
        let settings = self.settings()?;
        let credentials =
            register_with_retry(self.registrar.as_ref(), &settings.request(), self.retry).await?;

        state.root_url = settings.root_url.clone();
        state.credentials = credentials;
        state.worker_pool_id = settings.worker_pool_id.clone();
        state.worker_group = settings.worker_group.clone();
        state.worker_id = settings.worker_id.clone();
        state.worker_location =
            WorkerLocation::merged(ENVIRONMENT_CLASS, settings.worker_location.clone());
        state.provider_metadata =
            BTreeMap::from([(PROVIDER_ID_KEY.to_string(), settings.provider_id.clone())]);

        info!(
            "Registered static worker {}/{} in pool {}",
            state.worker_group, state.worker_id, state.worker_pool_id
        );
        Ok(())
    }

    async fn use_cached_run(&mut self, state: &mut RunState) -> Result<()> {
        let settings = self.settings()?;

        if let Some(field) = settings.identity_mismatch(state) {
            return Err(RunnerError::CacheRejected(format!(
                "cached {} differs from configuration",
                field
            )));
        }
        if state.credentials.is_stale(Utc::now()) {
            return Err(RunnerError::CacheRejected(
                "cached credentials are expired or about to expire".to_string(),
            ));
        }

        debug!("Static provider accepts cached run state");
        Ok(())
    }

    fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = Some(protocol);
    }

    async fn worker_started(&mut self, state: &RunState) -> Result<()> {
        let Some(expires) = state.credentials.expires else {
            debug!("Credentials do not expire; no renewal scheduled");
            return Ok(());
        };

        let settings = self.settings()?;
        let task = tokio::spawn(refresh_loop(
            Arc::clone(&self.registrar),
            settings.request(),
            self.retry,
            self.protocol.clone(),
            expires,
        ));
        if let Some(previous) = self.refresh.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn worker_finished(&mut self) -> Result<()> {
        if let Some(task) = self.refresh.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for StaticProvider {
    fn drop(&mut self) {
        if let Some(task) = self.refresh.take() {
            task.abort();
        }
    }
}
