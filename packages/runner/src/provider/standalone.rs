// packages/runner/src/provider/standalone.rs
//! Standalone provider
//!
//! For hosts whose whole identity is written into the runner
//! configuration. Nothing about the environment can change underneath it,
//! so a cached run is always accepted and the lifecycle hooks do nothing.

use crate::protocol::Protocol;
use crate::provider::Provider;
use crate::run::{Credentials, RunState, WorkerLocation};
use crate::utils::config::ProviderConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const PROVIDER_TYPE: &str = "standalone";

/// Worker-location environment class reported by this provider
pub const ENVIRONMENT_CLASS: &str = "standalone";

pub const USAGE: &str = r#"
The providerType "standalone" is intended for workers that have all of their
configuration pre-loaded. Such workers do not interact with the worker
manager. Prefer the "static" provider where a registrar is available.

It requires the following properties in the runner configuration:

```yaml
provider:
    providerType: standalone
    rootURL: ..
    clientID: ..
    accessToken: ..
    certificate: ..   # optional
    workerPoolID: ..
    workerGroup: ..
    workerID: ..
    # extra entries for TASKCLUSTER_WORKER_LOCATION
    workerLocation: {prop: val, ..}
```

The worker location of this provider has the following fields:

* cloud: standalone

as well as any worker location values from the configuration.
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StandaloneSettings {
    #[serde(rename = "rootURL")]
    root_url: String,

    #[serde(rename = "clientID")]
    client_id: String,

    #[serde(rename = "accessToken")]
    access_token: String,

    #[serde(default)]
    certificate: Option<String>,

    #[serde(rename = "workerPoolID")]
    worker_pool_id: String,

    #[serde(rename = "workerGroup")]
    worker_group: String,

    #[serde(rename = "workerID")]
    worker_id: String,

    #[serde(rename = "workerLocation", default)]
    worker_location: BTreeMap<String, String>,
}

/// Provider for fully pre-configured hosts
pub struct StandaloneProvider {
    config: ProviderConfig,
}

impl StandaloneProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn settings(&self) -> Result<StandaloneSettings> {
        let settings: StandaloneSettings = self.config.unpack()?;
        self.config.require("rootURL", &settings.root_url)?;
        self.config.require("clientID", &settings.client_id)?;
        self.config.require("accessToken", &settings.access_token)?;
        self.config.require("workerPoolID", &settings.worker_pool_id)?;
        self.config.require("workerGroup", &settings.worker_group)?;
        self.config.require("workerID", &settings.worker_id)?;
        Ok(settings)
    }
}

#[async_trait]
impl Provider for StandaloneProvider {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    async fn configure_run(&mut self, state: &mut RunState) -> Result<()> {
        let settings = self.settings()?;

        state.root_url = settings.root_url;
        state.credentials = Credentials {
            client_id: settings.client_id,
            access_token: settings.access_token,
            certificate: settings.certificate.filter(|c| !c.is_empty()),
            expires: None,
        };
        state.worker_pool_id = settings.worker_pool_id;
        state.worker_group = settings.worker_group;
        state.worker_id = settings.worker_id;
        state.worker_location = WorkerLocation::merged(ENVIRONMENT_CLASS, settings.worker_location);
        state.provider_metadata = BTreeMap::new();

        info!(
            "Configured standalone worker {}/{}",
            state.worker_group, state.worker_id
        );
        Ok(())
    }

    async fn use_cached_run(&mut self, _state: &mut RunState) -> Result<()> {
        debug!("Standalone provider accepts cached run state");
        Ok(())
    }

    fn set_protocol(&mut self, _protocol: Protocol) {}

    async fn worker_started(&mut self, _state: &RunState) -> Result<()> {
        Ok(())
    }

    async fn worker_finished(&mut self) -> Result<()> {
        Ok(())
    }
}
