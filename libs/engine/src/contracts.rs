use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::context::ModuleCtx;
use crate::drain::DrainGuard;
use crate::manifest::ApiSurface;

/// Lifecycle contract every hosted module implements.
///
/// `name()`/`domain()` must agree with the manifest supplied at
/// registration; the registry rejects a mismatch so the manifest stays the
/// single source of identity.
#[async_trait]
pub trait ServiceModule: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn domain(&self) -> &str;

    async fn start(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
    async fn stop(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Self-reported operational readiness, distinct from lifecycle status.
    /// Polled independently by the health monitor with a per-probe timeout.
    async fn ready(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives events published on the event bus.
#[async_trait]
pub trait EventCapable: Send + Sync {
    async fn on_event(&self, event: &str, payload: &Value) -> anyhow::Result<()>;
}

/// Receives payloads pushed on the data bus.
#[async_trait]
pub trait DataCapable: Send + Sync {
    async fn on_data(&self, topic: &str, payload: &Value) -> anyhow::Result<()>;
}

/// Serves compute invocations fanned out on the compute bus.
#[async_trait]
pub trait ComputeCapable: Send + Sync {
    async fn compute(&self, payload: &Value) -> anyhow::Result<Value>;
}

/// Account lookups offered to other modules.
#[async_trait]
pub trait AccountCapable: Send + Sync {
    async fn account_exists(&self, account_id: &str) -> anyhow::Result<()>;
}

/// Key-value style storage offered to other modules.
#[async_trait]
pub trait StoreCapable: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Registration-time bundle: the lifecycle handle plus an explicit
/// capability table. Each module declares which typed ports it implements
/// here rather than relying on runtime type checks.
#[derive(Clone)]
pub struct ModuleHandle {
    pub(crate) core: Arc<dyn ServiceModule>,
    pub(crate) event: Option<Arc<dyn EventCapable>>,
    pub(crate) data: Option<Arc<dyn DataCapable>>,
    pub(crate) compute: Option<Arc<dyn ComputeCapable>>,
    pub(crate) account: Option<Arc<dyn AccountCapable>>,
    pub(crate) store: Option<Arc<dyn StoreCapable>>,
    pub(crate) drain: Option<Arc<DrainGuard>>,
}

impl ModuleHandle {
    pub fn new(core: Arc<dyn ServiceModule>) -> Self {
        Self {
            core,
            event: None,
            data: None,
            compute: None,
            account: None,
            store: None,
            drain: None,
        }
    }

    pub fn with_event(mut self, port: Arc<dyn EventCapable>) -> Self {
        self.event = Some(port);
        self
    }

    pub fn with_data(mut self, port: Arc<dyn DataCapable>) -> Self {
        self.data = Some(port);
        self
    }

    pub fn with_compute(mut self, port: Arc<dyn ComputeCapable>) -> Self {
        self.compute = Some(port);
        self
    }

    pub fn with_account(mut self, port: Arc<dyn AccountCapable>) -> Self {
        self.account = Some(port);
        self
    }

    pub fn with_store(mut self, port: Arc<dyn StoreCapable>) -> Self {
        self.store = Some(port);
        self
    }

    /// Attach an operation-counting guard; the lifecycle manager drains it
    /// before stopping the module.
    pub fn with_drain(mut self, guard: Arc<DrainGuard>) -> Self {
        self.drain = Some(guard);
        self
    }

    pub fn core(&self) -> &Arc<dyn ServiceModule> {
        &self.core
    }

    pub fn drain_guard(&self) -> Option<&Arc<DrainGuard>> {
        self.drain.as_ref()
    }

    pub fn implements(&self, surface: ApiSurface) -> bool {
        match surface {
            ApiSurface::Event => self.event.is_some(),
            ApiSurface::Data => self.data.is_some(),
            ApiSurface::Compute => self.compute.is_some(),
            ApiSurface::Account => self.account.is_some(),
            ApiSurface::Store => self.store.is_some(),
        }
    }

    /// Surfaces this handle implements, in the canonical surface order.
    pub fn surfaces(&self) -> Vec<ApiSurface> {
        ApiSurface::ALL
            .into_iter()
            .filter(|s| self.implements(*s))
            .collect()
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.core.name())
            .field("surfaces", &self.surfaces())
            .field("has_drain", &self.drain.is_some())
            .finish()
    }
}
