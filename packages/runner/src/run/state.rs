// packages/runner/src/run/state.rs
//! Run state handed to the worker process
//!
//! A [`RunState`] starts empty (or loaded from the cache), is filled in by
//! exactly one provider, validated, and then frozen behind an `Arc` for the
//! rest of the worker's lifetime.

use crate::utils::errors::{Result, RunnerError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Worker-location key naming the class of environment
pub const ENVIRONMENT_CLASS_KEY: &str = "cloud";

/// Credentials closer than this to expiry are treated as stale
pub const CREDENTIAL_EXPIRY_MARGIN_SECS: i64 = 300;

/// Credential bundle used by the worker to talk to the fleet manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_id: String,

    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// When the credentials stop working; `None` means they do not expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl Credentials {
    /// True when the credentials expire within the safety margin of `now`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(expires) => expires - ChronoDuration::seconds(CREDENTIAL_EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }
}

/// Description of where the worker runs
///
/// Built once through [`WorkerLocation::merged`]; there is no way to mutate
/// it afterwards, so the environment-class entry cannot be lost or
/// overwritten by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerLocation(BTreeMap<String, String>);

impl WorkerLocation {
    /// A location holding only the environment class
    pub fn new(environment_class: impl Into<String>) -> Self {
        Self::merged(environment_class, std::iter::empty::<(String, String)>())
    }

    /// Merge configured extras under a fixed environment class
    pub fn merged<I, K, V>(environment_class: impl Into<String>, extras: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries = BTreeMap::new();
        for (key, value) in extras {
            let key = key.into();
            if key == ENVIRONMENT_CLASS_KEY {
                debug!("Ignoring configured worker-location '{}' entry", ENVIRONMENT_CLASS_KEY);
                continue;
            }
            entries.insert(key, value.into());
        }
        entries.insert(ENVIRONMENT_CLASS_KEY.to_string(), environment_class.into());
        Self(entries)
    }

    pub fn environment_class(&self) -> Option<&str> {
        self.get(ENVIRONMENT_CLASS_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Everything the worker process needs to start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub root_url: String,

    pub credentials: Credentials,

    pub worker_pool_id: String,

    pub worker_group: String,

    pub worker_id: String,

    pub worker_location: WorkerLocation,

    /// Provider-specific data passed to the worker verbatim
    #[serde(default)]
    pub provider_metadata: BTreeMap<String, String>,

    /// Worker configuration from the runner config document
    #[serde(default)]
    pub worker_config: serde_json::Map<String, serde_json::Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify a provider left the state complete
    pub fn check_provider_results(&self) -> Result<()> {
        let required = [
            ("rootURL", self.root_url.as_str()),
            ("clientID", self.credentials.client_id.as_str()),
            ("accessToken", self.credentials.access_token.as_str()),
            ("workerPoolID", self.worker_pool_id.as_str()),
            ("workerGroup", self.worker_group.as_str()),
            ("workerID", self.worker_id.as_str()),
        ];

        for (name, value) in required {
            if value.is_empty() {
                return Err(RunnerError::Configuration(format!(
                    "provider did not set {}",
                    name
                )));
            }
        }

        match self.worker_location.environment_class() {
            Some(class) if !class.is_empty() => Ok(()),
            _ => Err(RunnerError::Configuration(format!(
                "provider did not set workerLocation.{}",
                ENVIRONMENT_CLASS_KEY
            ))),
        }
    }

    /// Environment variables exposing this state to the worker process
    pub fn worker_env(&self) -> Result<Vec<(String, String)>> {
        let mut env = vec![
            ("TASKCLUSTER_ROOT_URL".to_string(), self.root_url.clone()),
            ("TASKCLUSTER_CLIENT_ID".to_string(), self.credentials.client_id.clone()),
            (
                "TASKCLUSTER_ACCESS_TOKEN".to_string(),
                self.credentials.access_token.clone(),
            ),
            ("TASKCLUSTER_WORKER_POOL_ID".to_string(), self.worker_pool_id.clone()),
            ("TASKCLUSTER_WORKER_GROUP".to_string(), self.worker_group.clone()),
            ("TASKCLUSTER_WORKER_ID".to_string(), self.worker_id.clone()),
            (
                "TASKCLUSTER_WORKER_LOCATION".to_string(),
                serde_json::to_string(&self.worker_location)?,
            ),
            (
                "TASKCLUSTER_PROVIDER_METADATA".to_string(),
                serde_json::to_string(&self.provider_metadata)?,
            ),
            (
                "TASKCLUSTER_WORKER_CONFIG".to_string(),
                serde_json::to_string(&self.worker_config)?,
            ),
        ];

        if let Some(certificate) = &self.credentials.certificate {
            env.push(("TASKCLUSTER_CERTIFICATE".to_string(), certificate.clone()));
        }

        Ok(env)
    }
}
