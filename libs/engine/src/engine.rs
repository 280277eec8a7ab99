//! The engine facade: one object that owns the registry, buses, health
//! monitor and lifecycle manager, and exposes the public surface modules
//! and hosts interact with.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{BusPermission, BusSystem, ComputeResult};
use crate::context::{ConfigProvider, ModuleCtx, ModuleCtxBuilder};
use crate::contracts::ModuleHandle;
use crate::errors::EngineError;
use crate::health::{HealthMonitor, ModuleHealth};
use crate::lifecycle::{Hook, LifecycleManager, LifecycleTimeouts};
use crate::manifest::{ApiSurface, Manifest};
use crate::registry::Registry;

/// Coarse engine state, advanced only by `start`/`stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Created => "created",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tunables for one engine instance. All timeouts apply per module, not to
/// the whole pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Readiness poll cadence; `None` disables the background poller.
    #[serde(with = "humantime_serde")]
    pub readiness_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Fail start when a required API surface has no implementer.
    pub strict_apis: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            readiness_interval: Some(Duration::from_secs(15)),
            probe_timeout: Duration::from_secs(5),
            strict_apis: true,
        }
    }
}

impl EngineSettings {
    fn timeouts(&self) -> LifecycleTimeouts {
        LifecycleTimeouts {
            start: self.start_timeout,
            stop: self.stop_timeout,
            drain: self.drain_timeout,
        }
    }
}

/// One row of the API report: a module and the surfaces it offers.
#[derive(Debug, Clone, Serialize)]
pub struct ApiDescriptor {
    pub module: String,
    pub domain: String,
    pub version: String,
    pub surfaces: Vec<ApiSurface>,
}

/// Counters for dashboards and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub registered: usize,
    pub started: usize,
    pub surfaces: BTreeMap<ApiSurface, usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

type StateCallback = Arc<dyn Fn(EngineState, EngineState) + Send + Sync>;

pub struct ServiceEngine {
    registry: Arc<Registry>,
    bus: Arc<BusSystem>,
    monitor: HealthMonitor,
    lifecycle: LifecycleManager,
    settings: EngineSettings,
    config_provider: Option<Arc<dyn ConfigProvider>>,

    state: RwLock<EngineState>,
    state_callbacks: RwLock<Vec<StateCallback>>,
    /// Names started by the last successful start, in start order.
    started: RwLock<Vec<String>>,
    /// Cancels the current lifecycle pass and everything scoped to it.
    cancel: RwLock<CancellationToken>,
    poller: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,

    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl ServiceEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_config_provider_opt(settings, None)
    }

    pub fn with_config_provider(
        settings: EngineSettings,
        provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self::with_config_provider_opt(settings, Some(provider))
    }

    fn with_config_provider_opt(
        settings: EngineSettings,
        config_provider: Option<Arc<dyn ConfigProvider>>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(BusSystem::new(registry.clone()));
        let monitor = HealthMonitor::new(registry.clone());
        let lifecycle = LifecycleManager::new(registry.clone(), monitor.clone());
        Self {
            registry,
            bus,
            monitor,
            lifecycle,
            settings,
            config_provider,
            state: RwLock::new(EngineState::Created),
            state_callbacks: RwLock::new(Vec::new()),
            started: RwLock::new(Vec::new()),
            cancel: RwLock::new(CancellationToken::new()),
            poller: Mutex::new(None),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
        }
    }

    // ---- registration ----

    /// Register a module. Only allowed while the engine is not running.
    pub fn register(&self, manifest: Manifest, handle: ModuleHandle) -> Result<(), EngineError> {
        if !matches!(
            self.state(),
            EngineState::Created | EngineState::Stopped | EngineState::Failed
        ) {
            return Err(EngineError::AlreadyStarted);
        }
        debug!(module = %manifest.name, "registering module");
        self.registry.register(manifest, handle)
    }

    pub fn unregister(&self, name: &str) -> Result<(), EngineError> {
        self.registry.unregister(name)?;
        self.bus.revoke(name);
        Ok(())
    }

    pub fn replace_manifest(&self, name: &str, manifest: Manifest) -> Result<(), EngineError> {
        self.registry.replace_manifest(name, manifest)
    }

    // ---- lifecycle ----

    /// Compute the start order without starting anything.
    pub fn plan(&self) -> Result<Vec<String>, EngineError> {
        crate::resolver::resolve_order(&self.registry.manifests())
    }

    /// Start all enabled modules in dependency order.
    pub async fn start(&self) -> Result<(), EngineError> {
        if !matches!(
            self.state(),
            EngineState::Created | EngineState::Stopped | EngineState::Failed
        ) {
            return Err(EngineError::AlreadyStarted);
        }
        self.transition(EngineState::Starting);

        // Fresh token per pass; the previous pass may have cancelled its own.
        let cancel = CancellationToken::new();
        *self.cancel.write() = cancel.clone();

        let ctx = self.base_ctx(cancel.clone());
        match self
            .lifecycle
            .start(&ctx, self.settings.timeouts(), self.settings.strict_apis)
            .await
        {
            Ok(order) => {
                info!(modules = order.len(), "engine running");
                *self.started.write() = order;
                *self.started_at.write() = Some(Utc::now());
                self.spawn_poller(cancel);
                self.transition(EngineState::Running);
                Ok(())
            }
            Err(err) => {
                self.transition(EngineState::Failed);
                Err(err)
            }
        }
    }

    /// Stop started modules in reverse order. Keeps going past failures.
    pub async fn stop(&self) -> Result<(), EngineError> {
        if self.state() != EngineState::Running {
            // Stopping a non-running engine is a no-op, matching repeated
            // shutdown signals racing each other.
            return Ok(());
        }
        self.transition(EngineState::Stopping);
        self.stop_poller();

        let started = std::mem::take(&mut *self.started.write());
        let cancel = self.cancel.read().clone();
        let ctx = self.base_ctx(cancel.clone());
        let result = self.lifecycle.stop(&ctx, &started, self.settings.timeouts()).await;

        cancel.cancel();
        *self.started_at.write() = None;
        match result {
            Ok(()) => {
                info!("engine stopped");
                self.transition(EngineState::Stopped);
                Ok(())
            }
            Err(err) => {
                self.transition(EngineState::Failed);
                Err(err)
            }
        }
    }

    fn base_ctx(&self, cancel: CancellationToken) -> ModuleCtx {
        let mut builder = ModuleCtxBuilder::new(cancel).with_bus(self.bus.clone());
        if let Some(provider) = &self.config_provider {
            builder = builder.with_config_provider(provider.clone());
        }
        builder.build()
    }

    fn spawn_poller(&self, cancel: CancellationToken) {
        let Some(interval) = self.settings.readiness_interval else {
            return;
        };
        let token = cancel.child_token();
        let handle = self
            .monitor
            .spawn_poller(interval, self.settings.probe_timeout, token.clone());
        *self.poller.lock() = Some((token, handle));
    }

    fn stop_poller(&self) {
        if let Some((token, handle)) = self.poller.lock().take() {
            token.cancel();
            handle.abort();
        }
    }

    // ---- state ----

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Observe state transitions. Callbacks run synchronously on the
    /// transitioning task, in registration order.
    pub fn on_state_change(&self, callback: impl Fn(EngineState, EngineState) + Send + Sync + 'static) {
        self.state_callbacks.write().push(Arc::new(callback));
    }

    fn transition(&self, to: EngineState) {
        let from = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, to)
        };
        if from == to {
            return;
        }
        debug!(%from, %to, "engine state change");
        let callbacks: Vec<StateCallback> = self.state_callbacks.read().clone();
        for cb in callbacks {
            cb(from, to);
        }
    }

    // ---- hooks ----

    pub fn on_pre_start(&self, hook: Hook) {
        self.lifecycle.on_pre_start(hook);
    }

    pub fn on_post_start(&self, hook: Hook) {
        self.lifecycle.on_post_start(hook);
    }

    pub fn on_pre_stop(&self, hook: Hook) {
        self.lifecycle.on_pre_stop(hook);
    }

    pub fn on_post_stop(&self, hook: Hook) {
        self.lifecycle.on_post_stop(hook);
    }

    // ---- bus ----

    pub fn bus(&self) -> &Arc<BusSystem> {
        &self.bus
    }

    /// Narrow a module's bus access. Restrictions intersect, so access
    /// only ever shrinks.
    pub fn restrict_permissions(&self, module: &str, permission: BusPermission) {
        self.bus.restrict(module, permission);
    }

    /// Modules whose required API surfaces have no started provider.
    pub fn missing_required_apis(&self) -> BTreeMap<String, Vec<ApiSurface>> {
        self.monitor.missing_required_apis()
    }

    /// Engine-originated event broadcast (not attributed to any module).
    pub async fn publish_event(
        &self,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<usize, EngineError> {
        self.bus.publish_event(None, event, payload).await
    }

    pub async fn push_data(
        &self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> Result<usize, EngineError> {
        self.bus.push_data(None, topic, payload).await
    }

    pub async fn invoke_compute(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Vec<ComputeResult>, EngineError> {
        self.bus.invoke_compute(None, payload).await
    }

    // ---- introspection ----

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn health(&self, name: &str) -> Option<ModuleHealth> {
        self.monitor.health(name)
    }

    pub fn health_snapshot(&self) -> Vec<ModuleHealth> {
        self.monitor.snapshot()
    }

    /// All offered API surfaces, one row per module, registration order.
    /// A surface only counts as offered if the implementing module still
    /// holds the matching bus permission.
    pub fn api_report(&self) -> Vec<ApiDescriptor> {
        self.registry
            .records()
            .into_iter()
            .map(|r| {
                let grants = self.bus.grants(&r.manifest.name);
                ApiDescriptor {
                    module: r.manifest.name,
                    domain: r.manifest.domain,
                    version: r.manifest.version,
                    surfaces: r
                        .handle
                        .surfaces()
                        .into_iter()
                        .filter(|&s| grants.allows_receive(s))
                        .collect(),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let mut surfaces = BTreeMap::new();
        for surface in ApiSurface::ALL {
            let count = self.registry.modules_implementing(surface).len();
            if count > 0 {
                surfaces.insert(surface, count);
            }
        }
        EngineStats {
            state: self.state(),
            registered: self.registry.len(),
            started: self.started.read().len(),
            surfaces,
            created_at: self.created_at,
            started_at: *self.started_at.read(),
        }
    }
}

impl std::fmt::Debug for ServiceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEngine")
            .field("state", &self.state())
            .field("registered", &self.registry.len())
            .finish()
    }
}

impl Drop for ServiceEngine {
    fn drop(&mut self) {
        // Stops the poller task if the host never called stop().
        self.cancel.read().cancel();
        if let Some((token, handle)) = self.poller.lock().take() {
            token.cancel();
            handle.abort();
        }
    }
}
