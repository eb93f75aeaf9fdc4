// packages/runner/src/run/cache.rs
//! Run-state cache
//!
//! Persists a validated [`RunState`] so a restarted runner (for example
//! after a reboot) can hand the same identity back to the provider instead
//! of configuring from scratch.

use crate::run::state::RunState;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Read/write access to a persisted run state
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Previously stored state, or `None` when nothing usable is cached
    async fn load(&self) -> Result<Option<RunState>>;

    /// Replace the cached state
    async fn store(&self, state: &RunState) -> Result<()>;
}

/// Cache used when `cacheOverRestarts` is not configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl CacheStore for NoCache {
    async fn load(&self) -> Result<Option<RunState>> {
        Ok(None)
    }

    async fn store(&self, _state: &RunState) -> Result<()> {
        Ok(())
    }
}

/// JSON file cache, readable only by the runner's user
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CacheStore for FileCache {
    async fn load(&self) -> Result<Option<RunState>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cached run state at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => {
                warn!("Ignoring unreadable run-state cache {:?}: {}", self.path, e);
                return Ok(None);
            }
        };

        match serde_json::from_slice::<RunState>(&bytes) {
            Ok(state) => {
                info!("Loaded cached run state from {:?}", self.path);
                Ok(Some(state))
            }
            Err(e) => {
                warn!("Ignoring undecodable run-state cache {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    async fn store(&self, state: &RunState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp).await.map_err(|e| {
            RunnerError::Cache(format!("Failed to open {:?}: {}", temp, e))
        })?;
        file.write_all(&bytes).await.map_err(|e| {
            RunnerError::Cache(format!("Failed to write {:?}: {}", temp, e))
        })?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await.map_err(|e| {
            RunnerError::Cache(format!("Failed to replace {:?}: {}", self.path, e))
        })?;

        debug!("Stored run state at {:?}", self.path);
        Ok(())
    }
}

/// In-memory cache for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: Mutex<Option<RunState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    pub fn snapshot(&self) -> Option<RunState> {
        self.state.lock().clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn load(&self) -> Result<Option<RunState>> {
        Ok(self.state.lock().clone())
    }

    async fn store(&self, state: &RunState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::state::WorkerLocation;

    fn sample_state() -> RunState {
        let mut state = RunState::new();
        state.root_url = "https://fleet.example.com".into();
        state.worker_id = "host-7".into();
        state.worker_location = WorkerLocation::new("static");
        state
    }

    #[tokio::test]
    async fn test_missing_file_is_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("state.json"));
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("state.json"));
        let state = sample_state();

        cache.store(&state).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), Some(state));
        assert!(!cache.temp_path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("state.json"));
        cache.store(&sample_state()).await.unwrap();

        let mode = std::fs::metadata(cache.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let cache = FileCache::new(path);
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryCache::new();
        assert!(cache.load().await.unwrap().is_none());
        cache.store(&sample_state()).await.unwrap();
        assert_eq!(cache.snapshot(), Some(sample_state()));
    }

    #[tokio::test]
    async fn test_no_cache_never_loads() {
        NoCache.store(&sample_state()).await.unwrap();
        assert!(NoCache.load().await.unwrap().is_none());
    }
}
