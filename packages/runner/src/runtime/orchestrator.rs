// packages/runner/src/runtime/orchestrator.rs
//! Bootstrap pipeline
//!
//! Drives one provider through a single run:
//!
//! ```text
//!   cache ──► use_cached_run ──┬─ CachedValid ───────────────┐
//!                              └─ CachedInvalid ─► configure_run
//!                                                            │
//!                        validate + store in cache ◄─────────┘
//!                                    │
//!   Protocol::new ─► set_protocol ─► launch worker ─► start protocol
//!                                    │
//!                       wait for the worker's announcement
//!                                    │
//!                              worker_started
//!                                    │
//!            supervise: worker exit │ shutdown signal │ channel closed
//!                                    │
//!                              worker_finished
//! ```
//!
//! Nothing is launched until the run state has been validated, so a
//! half-configured worker never runs.

use crate::protocol::capabilities::{ERROR_REPORT, GRACEFUL_TERMINATION, LOG};
use crate::protocol::{Capabilities, Message, Protocol, Role};
use crate::provider::{Provider, ProviderRegistry};
use crate::run::{CacheStore, FileCache, NoCache, RunState};
use crate::runtime::worker::{CommandLauncher, RunningWorker, WorkerExit, WorkerLauncher};
use crate::utils::config::{RunnerConfig, RunnerSettings};
use crate::utils::errors::{Hook, ProtocolError, Result, RunnerError};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of checking the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// The provider accepted the cached state
    CachedValid(RunState),

    /// No cache, or the provider rejected it
    CachedInvalid,
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit: WorkerExit,

    /// The state the worker ran with
    pub state: Arc<RunState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Graceful termination was requested
    Shutdown,

    /// The protocol channel closed under a running worker
    ChannelClosed,
}

#[derive(Debug)]
enum Event {
    Exited(Result<WorkerExit>),
    ShutdownRequested,
    ChannelClosed,
    DeadlineElapsed(DeadlineKind),
}

/// Runs one bootstrap sequence
pub struct Orchestrator {
    provider: Box<dyn Provider>,
    cache: Arc<dyn CacheStore>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: RunnerSettings,
    worker_config: serde_json::Map<String, serde_json::Value>,
    capabilities: Capabilities,
}

impl Orchestrator {
    pub fn new(provider: Box<dyn Provider>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            provider,
            cache: Arc::new(NoCache),
            launcher,
            settings: RunnerSettings::default(),
            worker_config: serde_json::Map::new(),
            capabilities: Capabilities::runner_defaults(),
        }
    }

    /// Orchestrator for a loaded runner configuration
    pub fn from_config(
        config: &RunnerConfig,
        registry: &ProviderRegistry,
        settings: RunnerSettings,
    ) -> Result<Self> {
        let provider = registry.build(&config.provider)?;
        let cache: Arc<dyn CacheStore> = match &config.cache_over_restarts {
            Some(path) => Arc::new(FileCache::new(path)),
            None => Arc::new(NoCache),
        };

        Ok(Self::new(provider, Arc::new(CommandLauncher::new(config.worker.clone())))
            .with_cache(cache)
            .with_settings(settings)
            .with_worker_config(config.worker_config.clone()))
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_worker_config(
        mut self,
        worker_config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.worker_config = worker_config;
        self
    }

    /// Capabilities the runner announces to the worker
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Ask the provider whether the cached state, if any, is still usable
    pub async fn check_cache(&mut self) -> CacheDecision {
        let mut state = match self.cache.load().await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("No cached run state");
                return CacheDecision::CachedInvalid;
            }
            Err(e) => {
                warn!("Failed to load cached run state: {}", e);
                return CacheDecision::CachedInvalid;
            }
        };

        if let Err(e) = self.provider.use_cached_run(&mut state).await {
            info!("Cached run state not reused: {}", e);
            return CacheDecision::CachedInvalid;
        }
        if let Err(e) = state.check_provider_results() {
            info!("Cached run state is incomplete: {}", e);
            return CacheDecision::CachedInvalid;
        }

        info!("Reusing cached run state");
        CacheDecision::CachedValid(state)
    }

    /// Produce the validated run state for this run
    pub async fn prepare(&mut self) -> Result<RunState> {
        let provider_type = self.provider.provider_type().to_string();

        let mut state = match self.check_cache().await {
            CacheDecision::CachedValid(state) => state,
            CacheDecision::CachedInvalid => {
                let mut state = RunState::new();
                self.provider
                    .configure_run(&mut state)
                    .await
                    .map_err(|e| e.in_hook(provider_type.as_str(), Hook::ConfigureRun))?;
                state
                    .check_provider_results()
                    .map_err(|e| e.in_hook(provider_type.as_str(), Hook::ConfigureRun))?;
                state
            }
        };
        state.worker_config = self.worker_config.clone();

        if let Err(e) = self.cache.store(&state).await {
            warn!("Failed to cache run state: {}", e);
        }
        Ok(state)
    }

    fn build_protocol(&self) -> Result<Protocol> {
        let protocol = Protocol::with_capabilities(Role::Runner, self.capabilities.clone())?;

        if self.capabilities.contains(LOG) {
            protocol.register(LOG, |message: Message| match message.get("body") {
                Some(body) => info!(target: "worker", "{}", body),
                None => debug!("Worker sent a log message without a body"),
            })?;
        }
        if self.capabilities.contains(ERROR_REPORT) {
            protocol.register(ERROR_REPORT, |message: Message| {
                warn!(target: "worker", "Worker reported an error: {:?}", message.payload);
            })?;
        }
        Ok(protocol)
    }

    /// Run the worker to completion
    ///
    /// `shutdown` resolves when the runner itself has been asked to stop.
    pub async fn run<F>(mut self, shutdown: F) -> Result<RunOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let provider_type = self.provider.provider_type().to_string();
        let state = Arc::new(self.prepare().await?);

        let protocol = self.build_protocol()?;
        self.provider.set_protocol(protocol.clone());

        info!(
            "Starting worker {}/{} in pool {}",
            state.worker_group, state.worker_id, state.worker_pool_id
        );
        let mut worker = self.launcher.launch(&state).await?;

        let started = match worker.take_transport() {
            Some(transport) => match protocol.start(transport) {
                Ok(()) => self.await_announcement(worker.as_mut(), &protocol).await,
                Err(e) => Err(e.into()),
            },
            None => {
                warn!("Worker has no protocol transport");
                Ok(())
            }
        };
        let started = match started {
            Ok(()) => self
                .provider
                .worker_started(&state)
                .await
                .map_err(|e| e.in_hook(provider_type.as_str(), Hook::WorkerStarted)),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!("Worker startup failed: {}", e);
            if let Err(te) = worker.terminate().await {
                warn!("Failed to terminate worker: {}", te);
            }
            protocol.close();
            self.finish(&provider_type).await;
            return Err(e);
        }

        let supervised = self.supervise(worker.as_mut(), &protocol, shutdown).await;
        protocol.close();
        self.finish(&provider_type).await;

        let exit = supervised?;
        info!("Worker finished with {}", exit);
        Ok(RunOutcome { exit, state })
    }

    /// Hold WorkerStarted back until the worker has announced itself
    ///
    /// A transport that fails before the announcement is a startup failure.
    /// A worker that exits first, or stays silent for the protocol close
    /// grace period, is handed on to supervision.
    async fn await_announcement(
        &self,
        worker: &mut dyn RunningWorker,
        protocol: &Protocol,
    ) -> Result<()> {
        let grace = self.settings.protocol_close_grace();

        tokio::select! {
            biased;
            opened = protocol.wait_for_open() => {
                opened?;
                debug!("Worker announced its capabilities");
            }
            _ = worker.wait() => {
                debug!("Worker exited before announcing its capabilities");
            }
            _ = tokio::time::sleep(grace) => {
                warn!("Worker has not announced its capabilities after {:?}", grace);
            }
        }
        Ok(())
    }

    async fn supervise<F>(
        &self,
        worker: &mut dyn RunningWorker,
        protocol: &Protocol,
        shutdown: F,
    ) -> Result<WorkerExit>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut shutdown_requested = false;
        let mut channel_closed = false;
        let mut deadline: Option<(Instant, DeadlineKind)> = None;

        loop {
            let (deadline_at, deadline_kind) =
                deadline.unwrap_or((Instant::now(), DeadlineKind::Shutdown));

            let event = tokio::select! {
                result = worker.wait() => Event::Exited(result),
                _ = &mut shutdown, if !shutdown_requested => Event::ShutdownRequested,
                _ = protocol.wait_for_close(), if !channel_closed => Event::ChannelClosed,
                _ = tokio::time::sleep_until(deadline_at), if deadline.is_some() => {
                    Event::DeadlineElapsed(deadline_kind)
                }
            };

            match event {
                Event::Exited(result) => return result,

                Event::ShutdownRequested => {
                    shutdown_requested = true;
                    info!("Shutdown requested, stopping worker");

                    if protocol.capable(GRACEFUL_TERMINATION) {
                        let request =
                            Message::new(GRACEFUL_TERMINATION).with("finish-tasks", false);
                        match protocol.send(request).await {
                            Ok(()) => {
                                let grace = self.settings.shutdown_grace();
                                debug!("Waiting up to {:?} for the worker to stop", grace);
                                deadline = Some((Instant::now() + grace, DeadlineKind::Shutdown));
                                continue;
                            }
                            Err(e) => warn!("Could not request graceful termination: {}", e),
                        }
                    }
                    return worker.terminate().await;
                }

                Event::ChannelClosed => {
                    channel_closed = true;
                    if deadline.is_none() {
                        let grace = self.settings.protocol_close_grace();
                        warn!("Protocol channel closed while the worker is running");
                        deadline = Some((Instant::now() + grace, DeadlineKind::ChannelClosed));
                    }
                }

                Event::DeadlineElapsed(DeadlineKind::Shutdown) => {
                    warn!("Worker did not stop within the shutdown grace period");
                    return worker.terminate().await;
                }

                Event::DeadlineElapsed(DeadlineKind::ChannelClosed) => {
                    error!("Worker is running unsupervised, terminating it");
                    let exit = worker.terminate().await?;
                    debug!("Unsupervised worker stopped with {}", exit);
                    let reason = protocol.close_reason().unwrap_or(ProtocolError::ChannelClosed);
                    return Err(reason.into());
                }
            }
        }
    }

    async fn finish(&mut self, provider_type: &str) {
        if let Err(e) = self.provider.worker_finished().await {
            warn!("{}", e.in_hook(provider_type, Hook::WorkerFinished));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Transport;
    use crate::run::{Credentials, MemoryCache, WorkerLocation};
    use crate::utils::config::ProviderConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    const WAIT: Duration = Duration::from_secs(10);

    // ---- fake worker ----

    struct FakeWorker {
        transport: Option<Transport>,
        exit: watch::Receiver<Option<WorkerExit>>,
        exit_tx: Arc<watch::Sender<Option<WorkerExit>>>,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RunningWorker for FakeWorker {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn take_transport(&mut self) -> Option<Transport> {
            self.transport.take()
        }

        async fn wait(&mut self) -> Result<WorkerExit> {
            loop {
                if let Some(exit) = *self.exit.borrow_and_update() {
                    return Ok(exit);
                }
                if self.exit.changed().await.is_err() {
                    return Err(RunnerError::Worker("fake worker vanished".into()));
                }
            }
        }

        async fn terminate(&mut self) -> Result<WorkerExit> {
            self.terminated.store(true, Ordering::SeqCst);
            let exit = WorkerExit::signal(15);
            self.exit_tx.send_replace(Some(exit));
            Ok(exit)
        }
    }

    /// Test-side controls of a fake worker
    struct WorkerHandle {
        peer: Option<Transport>,
        exit: Arc<watch::Sender<Option<WorkerExit>>>,
        terminated: Arc<AtomicBool>,
        launched_with: Arc<Mutex<Option<RunState>>>,
    }

    impl WorkerHandle {
        fn exit_with(&self, code: i32) {
            self.exit.send_replace(Some(WorkerExit::code(code)));
        }
    }

    struct FakeLauncher {
        worker: Mutex<Option<FakeWorker>>,
        launches: Arc<AtomicUsize>,
        launched_with: Arc<Mutex<Option<RunState>>>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, state: &RunState) -> Result<Box<dyn RunningWorker>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.launched_with.lock() = Some(state.clone());
            let worker = self
                .worker
                .lock()
                .take()
                .ok_or_else(|| RunnerError::Worker("launched twice".into()))?;
            Ok(Box::new(worker))
        }
    }

    fn fake_worker() -> (Arc<FakeLauncher>, WorkerHandle, Arc<AtomicUsize>) {
        let (runner_side, worker_side) = Transport::pair();
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let terminated = Arc::new(AtomicBool::new(false));
        let launches = Arc::new(AtomicUsize::new(0));
        let launched_with = Arc::new(Mutex::new(None));

        let launcher = Arc::new(FakeLauncher {
            worker: Mutex::new(Some(FakeWorker {
                transport: Some(runner_side),
                exit: exit_rx,
                exit_tx: Arc::clone(&exit_tx),
                terminated: Arc::clone(&terminated),
            })),
            launches: Arc::clone(&launches),
            launched_with: Arc::clone(&launched_with),
        });
        let handle = WorkerHandle {
            peer: Some(worker_side),
            exit: exit_tx,
            terminated,
            launched_with,
        };
        (launcher, handle, launches)
    }

    // ---- fake provider ----

    #[derive(Default)]
    struct Calls {
        hooks: Vec<&'static str>,
        started_with: Option<RunState>,
        protocol: Option<Protocol>,
    }

    struct FakeProvider {
        calls: Arc<Mutex<Calls>>,
        configured: RunState,
        accept_cache: bool,
        fail_started: bool,
        fail_finished: bool,
    }

    impl FakeProvider {
        fn new(configured: RunState) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let provider = Self {
                calls: Arc::clone(&calls),
                configured,
                accept_cache: true,
                fail_started: false,
                fail_finished: false,
            };
            (provider, calls)
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn provider_type(&self) -> &str {
            "fake"
        }

        async fn configure_run(&mut self, state: &mut RunState) -> Result<()> {
            self.calls.lock().hooks.push("configure_run");
            *state = self.configured.clone();
            Ok(())
        }

        async fn use_cached_run(&mut self, _state: &mut RunState) -> Result<()> {
            self.calls.lock().hooks.push("use_cached_run");
            if self.accept_cache {
                Ok(())
            } else {
                Err(RunnerError::CacheRejected("identity changed".into()))
            }
        }

        fn set_protocol(&mut self, protocol: Protocol) {
            let mut calls = self.calls.lock();
            calls.hooks.push("set_protocol");
            calls.protocol = Some(protocol);
        }

        async fn worker_started(&mut self, state: &RunState) -> Result<()> {
            let mut calls = self.calls.lock();
            calls.hooks.push("worker_started");
            calls.started_with = Some(state.clone());
            if self.fail_started {
                return Err(RunnerError::Environment("health check failed".into()));
            }
            Ok(())
        }

        async fn worker_finished(&mut self) -> Result<()> {
            self.calls.lock().hooks.push("worker_finished");
            if self.fail_finished {
                return Err(RunnerError::Environment("deregistration failed".into()));
            }
            Ok(())
        }
    }

    fn complete_state(worker_id: &str) -> RunState {
        RunState {
            root_url: "https://fleet.example.com".into(),
            credentials: Credentials {
                client_id: "worker/abc".into(),
                access_token: "secret".into(),
                certificate: None,
                expires: None,
            },
            worker_pool_id: "proj/pool".into(),
            worker_group: "rack-1".into(),
            worker_id: worker_id.into(),
            worker_location: WorkerLocation::new("fake"),
            ..RunState::new()
        }
    }

    fn standalone_config() -> ProviderConfig {
        ProviderConfig::new("standalone")
            .with("rootURL", "https://fleet.example.com")
            .with("clientID", "worker/abc")
            .with("accessToken", "secret")
            .with("workerPoolID", "proj/pool")
            .with("workerGroup", "rack-1")
            .with("workerID", "host-7")
    }

    fn quick_settings() -> RunnerSettings {
        RunnerSettings {
            shutdown_grace_secs: 5,
            protocol_close_grace_secs: 0,
            ..RunnerSettings::default()
        }
    }

    /// Resolves once the runner's side of the channel has negotiated
    async fn runner_open(calls: Arc<Mutex<Calls>>) {
        let protocol = calls.lock().protocol.clone();
        if let Some(protocol) = protocol {
            let _ = protocol.wait_for_open().await;
        }
    }

    async fn run_to_end(orchestrator: Orchestrator) -> Result<RunOutcome> {
        tokio::time::timeout(WAIT, orchestrator.run(std::future::pending()))
            .await
            .map_err(|_| RunnerError::Worker("run did not finish".into()))?
    }

    // ---- end-to-end scenarios ----

    #[tokio::test]
    async fn test_explicit_settings_run_worker() {
        let registry = ProviderRegistry::with_defaults();
        let provider = registry.build(&standalone_config()).unwrap();
        let (launcher, handle, launches) = fake_worker();
        handle.exit_with(0);

        let outcome = run_to_end(Orchestrator::new(provider, launcher)).await.unwrap();

        assert!(outcome.exit.success());
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.state.worker_location, WorkerLocation::new("standalone"));
        assert_eq!(outcome.state.worker_id, "host-7");
    }

    #[tokio::test]
    async fn test_custom_location_reaches_worker() {
        let registry = ProviderRegistry::with_defaults();
        let config = standalone_config()
            .with("workerLocation", json!({"region": "eu-west", "rack": "r12"}));
        let provider = registry.build(&config).unwrap();
        let (launcher, handle, _) = fake_worker();
        handle.exit_with(0);

        run_to_end(Orchestrator::new(provider, launcher)).await.unwrap();

        let launched = handle.launched_with.lock().clone().unwrap();
        assert_eq!(launched.worker_location.get("cloud"), Some("standalone"));
        assert_eq!(launched.worker_location.get("region"), Some("eu-west"));
        assert_eq!(launched.worker_location.get("rack"), Some("r12"));
        assert_eq!(launched.worker_location.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_credential_never_launches() {
        let registry = ProviderRegistry::with_defaults();
        let mut config = standalone_config();
        config.data.remove("accessToken");
        let provider = registry.build(&config).unwrap();
        let (launcher, _handle, launches) = fake_worker();

        let err = run_to_end(Orchestrator::new(provider, launcher)).await.unwrap_err();

        match &err {
            RunnerError::Hook { provider, hook, source } => {
                assert_eq!(provider, "standalone");
                assert_eq!(*hook, Hook::ConfigureRun);
                assert!(matches!(**source, RunnerError::Configuration(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accepted_cache_skips_configure() {
        let cached = complete_state("cached-host");
        let (provider, calls) = FakeProvider::new(complete_state("fresh-host"));
        let (launcher, handle, _) = fake_worker();
        handle.exit_with(0);

        let orchestrator = Orchestrator::new(Box::new(provider), launcher)
            .with_cache(Arc::new(MemoryCache::with_state(cached.clone())));
        run_to_end(orchestrator).await.unwrap();

        let calls = calls.lock();
        assert!(!calls.hooks.contains(&"configure_run"));
        assert_eq!(calls.started_with.as_ref(), Some(&cached));
        assert_eq!(
            calls.hooks,
            vec!["use_cached_run", "set_protocol", "worker_started", "worker_finished"]
        );
    }

    #[tokio::test]
    async fn test_rejected_cache_falls_back_to_configure() {
        let mut cached = complete_state("cached-host");
        cached.provider_metadata.insert("stale".into(), "yes".into());
        let (mut provider, calls) = FakeProvider::new(complete_state("fresh-host"));
        provider.accept_cache = false;
        let (launcher, handle, _) = fake_worker();
        handle.exit_with(0);

        let cache = Arc::new(MemoryCache::with_state(cached));
        let orchestrator =
            Orchestrator::new(Box::new(provider), launcher).with_cache(cache.clone());
        let outcome = run_to_end(orchestrator).await.unwrap();

        assert_eq!(outcome.state.worker_id, "fresh-host");
        assert!(outcome.state.provider_metadata.is_empty());
        assert_eq!(&calls.lock().hooks[..2], &["use_cached_run", "configure_run"]);
        assert_eq!(cache.snapshot().unwrap().worker_id, "fresh-host");
    }

    #[tokio::test]
    async fn test_incomplete_provider_result_rejected() {
        let mut incomplete = complete_state("host");
        incomplete.worker_group.clear();
        let (provider, _) = FakeProvider::new(incomplete);
        let (launcher, _handle, launches) = fake_worker();

        let err = run_to_end(Orchestrator::new(Box::new(provider), launcher))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workerGroup"));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_config_attached_to_state() {
        let (provider, _) = FakeProvider::new(complete_state("host"));
        let (launcher, handle, _) = fake_worker();
        handle.exit_with(0);

        let mut worker_config = serde_json::Map::new();
        worker_config.insert("capacity".into(), json!(4));
        let orchestrator =
            Orchestrator::new(Box::new(provider), launcher).with_worker_config(worker_config);
        let outcome = run_to_end(orchestrator).await.unwrap();

        assert_eq!(outcome.state.worker_config.get("capacity"), Some(&json!(4)));
    }

    // ---- lifecycle ----

    #[tokio::test]
    async fn test_worker_started_failure_stops_worker() {
        let (mut provider, calls) = FakeProvider::new(complete_state("host"));
        provider.fail_started = true;
        let (launcher, handle, _) = fake_worker();

        let orchestrator = Orchestrator::new(Box::new(provider), launcher)
            .with_settings(quick_settings());
        let err = run_to_end(orchestrator).await.unwrap_err();

        assert!(matches!(err, RunnerError::Hook { hook: Hook::WorkerStarted, .. }));
        assert!(handle.terminated.load(Ordering::SeqCst));
        assert_eq!(calls.lock().hooks.last(), Some(&"worker_finished"));
    }

    #[tokio::test]
    async fn test_worker_finished_failure_keeps_exit() {
        let (mut provider, _) = FakeProvider::new(complete_state("host"));
        provider.fail_finished = true;
        let (launcher, handle, _) = fake_worker();
        handle.exit_with(3);

        let outcome = run_to_end(Orchestrator::new(Box::new(provider), launcher))
            .await
            .unwrap();
        assert_eq!(outcome.exit, WorkerExit::code(3));
    }

    #[tokio::test]
    async fn test_shutdown_requests_graceful_termination() {
        let (provider, calls) = FakeProvider::new(complete_state("host"));
        let (launcher, mut handle, _) = fake_worker();

        let worker = Protocol::with_capabilities(
            Role::Worker,
            [GRACEFUL_TERMINATION].into_iter().collect(),
        )
        .unwrap();
        let exit = handle.exit.clone();
        worker
            .register(GRACEFUL_TERMINATION, move |message: Message| {
                assert_eq!(message.get("finish-tasks"), Some(&json!(false)));
                exit.send_replace(Some(WorkerExit::code(0)));
            })
            .unwrap();
        worker.start(handle.peer.take().unwrap()).unwrap();

        let orchestrator = Orchestrator::new(Box::new(provider), launcher)
            .with_settings(quick_settings());
        let outcome = tokio::time::timeout(WAIT, orchestrator.run(runner_open(calls.clone())))
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.exit.success());
        assert!(!handle.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_without_capability_terminates() {
        let (provider, calls) = FakeProvider::new(complete_state("host"));
        let (launcher, mut handle, _) = fake_worker();

        let worker = Protocol::new(Role::Worker);
        worker.start(handle.peer.take().unwrap()).unwrap();

        let orchestrator = Orchestrator::new(Box::new(provider), launcher)
            .with_settings(quick_settings());
        let outcome = tokio::time::timeout(WAIT, orchestrator.run(runner_open(calls.clone())))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.exit, WorkerExit::signal(15));
        assert!(handle.terminated.load(Ordering::SeqCst));
        assert_eq!(calls.lock().hooks.last(), Some(&"worker_finished"));
    }

    #[tokio::test]
    async fn test_closed_channel_kills_unsupervised_worker() {
        let (provider, calls) = FakeProvider::new(complete_state("host"));
        let (launcher, mut handle, _) = fake_worker();
        drop(handle.peer.take());

        let orchestrator = Orchestrator::new(Box::new(provider), launcher)
            .with_settings(quick_settings());
        let err = run_to_end(orchestrator).await.unwrap_err();

        assert!(err.protocol_error().is_some());
        assert!(handle.terminated.load(Ordering::SeqCst));
        assert_eq!(calls.lock().hooks.last(), Some(&"worker_finished"));
    }

    #[tokio::test]
    async fn test_channel_lost_before_announcement_fails_startup() {
        let (provider, calls) = FakeProvider::new(complete_state("host"));
        let (launcher, mut handle, _) = fake_worker();
        drop(handle.peer.take());

        let exit = handle.exit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            exit.send_replace(Some(WorkerExit::code(0)));
        });

        let orchestrator = Orchestrator::new(Box::new(provider), launcher).with_settings(
            RunnerSettings {
                protocol_close_grace_secs: 5,
                ..quick_settings()
            },
        );
        let err = run_to_end(orchestrator).await.unwrap_err();

        assert!(matches!(
            err.protocol_error(),
            Some(ProtocolError::NegotiationFailed(_))
        ));
        assert!(handle.terminated.load(Ordering::SeqCst));
        assert_eq!(calls.lock().hooks, vec!["configure_run", "set_protocol", "worker_finished"]);
    }

    #[tokio::test]
    async fn test_worker_log_messages_accepted() {
        let (provider, _) = FakeProvider::new(complete_state("host"));
        let (launcher, mut handle, _) = fake_worker();

        let worker = Protocol::with_capabilities(Role::Worker, [LOG].into_iter().collect()).unwrap();
        worker.start(handle.peer.take().unwrap()).unwrap();

        let exit = handle.exit.clone();
        let sender = worker.clone();
        tokio::spawn(async move {
            sender.wait_for_open().await.unwrap();
            sender
                .send(Message::new(LOG).with("body", json!({"msg": "claimed task"})))
                .await
                .unwrap();
            exit.send_replace(Some(WorkerExit::code(0)));
        });

        let outcome = run_to_end(Orchestrator::new(Box::new(provider), launcher))
            .await
            .unwrap();
        assert!(outcome.exit.success());
    }
}
