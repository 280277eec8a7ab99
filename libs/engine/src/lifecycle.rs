//! Start/stop orchestration.
//!
//! Start walks the resolved dependency order forward and rolls back every
//! already-started module (in reverse) when one fails. Stop walks the
//! started set in reverse, drains in-flight operations first, and keeps
//! going past individual failures, aggregating them into one error.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::context::ModuleCtx;
use crate::errors::{AggregateError, EngineError};
use crate::health::{HealthMonitor, ModuleStatus};
use crate::manifest::ApiSurface;
use crate::registry::Registry;
use crate::resolver;

/// Engine-level lifecycle hook. Runs on the engine's task; failures in
/// pre-start hooks abort the start, all other hook failures are logged.
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Hooks {
    pre_start: Vec<Hook>,
    post_start: Vec<Hook>,
    pre_stop: Vec<Hook>,
    post_stop: Vec<Hook>,
}

/// Timeouts applied to each module individually.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    pub start: Duration,
    pub stop: Duration,
    pub drain: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(30),
            stop: Duration::from_secs(10),
            drain: Duration::from_secs(5),
        }
    }
}

pub struct LifecycleManager {
    registry: Arc<Registry>,
    monitor: HealthMonitor,
    hooks: RwLock<Hooks>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<Registry>, monitor: HealthMonitor) -> Self {
        Self {
            registry,
            monitor,
            hooks: RwLock::new(Hooks::default()),
        }
    }

    pub fn on_pre_start(&self, hook: Hook) {
        self.hooks.write().pre_start.push(hook);
    }

    pub fn on_post_start(&self, hook: Hook) {
        self.hooks.write().post_start.push(hook);
    }

    pub fn on_pre_stop(&self, hook: Hook) {
        self.hooks.write().pre_stop.push(hook);
    }

    pub fn on_post_stop(&self, hook: Hook) {
        self.hooks.write().post_stop.push(hook);
    }

    /// Every surface a module requires must have at least one registered
    /// implementer. Enabled modules only.
    fn check_required_apis(&self, strict: bool) -> Result<(), EngineError> {
        for manifest in self.registry.manifests() {
            if !manifest.enabled {
                continue;
            }
            let missing: Vec<ApiSurface> = manifest
                .requires_apis
                .iter()
                .copied()
                .filter(|&s| self.registry.modules_implementing(s).is_empty())
                .collect();
            if missing.is_empty() {
                continue;
            }
            if strict {
                return Err(EngineError::MissingRequiredApis {
                    module: manifest.name,
                    missing,
                });
            }
            warn!(
                module = %manifest.name,
                missing = ?missing,
                "required API surfaces have no implementer"
            );
        }
        Ok(())
    }

    /// Start every enabled module in dependency order. Returns the names
    /// actually started, in start order, for a later [`stop`](Self::stop).
    ///
    /// On any failure all already-started modules are stopped in reverse;
    /// rollback errors ride along inside the returned error.
    pub async fn start(
        &self,
        ctx: &ModuleCtx,
        timeouts: LifecycleTimeouts,
        strict_apis: bool,
    ) -> Result<Vec<String>, EngineError> {
        let order = resolver::resolve_order(&self.registry.manifests())?;
        self.check_required_apis(strict_apis)?;

        for hook in self.hooks_for(|h| &h.pre_start) {
            if let Err(source) = hook().await {
                return Err(EngineError::HookFailed {
                    phase: "pre-start",
                    source,
                });
            }
        }

        let cancel = ctx.cancellation_token();
        let mut started: Vec<String> = Vec::with_capacity(order.len());
        for name in &order {
            let Some(handle) = self.registry.handle(name) else {
                continue;
            };
            self.monitor.set_status(name, ModuleStatus::Starting);
            let module_ctx = ctx.clone().for_module(name);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(anyhow::Error::from(EngineError::Canceled)),
                res = tokio::time::timeout(timeouts.start, handle.core().start(&module_ctx)) => {
                    match res {
                        Ok(res) => res,
                        Err(_) => Err(anyhow::Error::from(EngineError::Timeout)),
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    info!(module = %name, "module started");
                    self.monitor.set_status(name, ModuleStatus::Started);
                    started.push(name.clone());
                }
                Err(source) => {
                    error!(module = %name, error = %source, "module start failed, rolling back");
                    self.monitor.set_status(name, ModuleStatus::Failed);
                    let rollback = self.rollback(ctx, &started, timeouts).await;
                    return Err(EngineError::ServiceStartFailed {
                        module: name.clone(),
                        source,
                        rollback,
                    });
                }
            }
        }

        for hook in self.hooks_for(|h| &h.post_start) {
            if let Err(err) = hook().await {
                warn!(error = %err, "post-start hook failed");
            }
        }

        Ok(started)
    }

    /// Stop `started` in reverse order. Always attempts every module;
    /// individual failures are aggregated into `ServiceStopFailed`.
    pub async fn stop(
        &self,
        ctx: &ModuleCtx,
        started: &[String],
        timeouts: LifecycleTimeouts,
    ) -> Result<(), EngineError> {
        // Pre/post-stop hooks run newest-first, mirroring start order.
        for hook in self.hooks_for(|h| &h.pre_stop).into_iter().rev() {
            if let Err(err) = hook().await {
                warn!(error = %err, "pre-stop hook failed");
            }
        }

        let mut errors = AggregateError::new();
        for name in started.iter().rev() {
            if let Err(err) = self.stop_one(ctx, name, timeouts).await {
                errors.push(name.clone(), err);
            }
        }
        // Cancellation never aborts a stop pass, but the caller learns that
        // the pass ran under a cancelled context.
        if ctx.cancellation_token().is_cancelled() {
            errors.push("lifecycle", EngineError::Canceled);
        }

        for hook in self.hooks_for(|h| &h.post_stop).into_iter().rev() {
            if let Err(err) = hook().await {
                warn!(error = %err, "post-stop hook failed");
            }
        }

        errors
            .into_result()
            .map_err(|errors| EngineError::ServiceStopFailed { errors })
    }

    async fn stop_one(
        &self,
        ctx: &ModuleCtx,
        name: &str,
        timeouts: LifecycleTimeouts,
    ) -> anyhow::Result<()> {
        let Some(handle) = self.registry.handle(name) else {
            return Ok(());
        };
        self.monitor.set_status(name, ModuleStatus::Stopping);

        // Refuse new operations, then give in-flight ones a bounded grace.
        if let Some(guard) = handle.drain_guard() {
            guard.close();
            if !guard.wait_idle(timeouts.drain).await {
                warn!(
                    module = %name,
                    active = guard.active(),
                    "drain timed out, stopping with operations in flight"
                );
            }
        }

        let module_ctx = ctx.clone().for_module(name);
        let result = tokio::time::timeout(timeouts.stop, handle.core().stop(&module_ctx)).await;
        match result {
            Ok(Ok(())) => {
                info!(module = %name, "module stopped");
                self.monitor.set_status(name, ModuleStatus::Stopped);
                Ok(())
            }
            Ok(Err(err)) => {
                error!(module = %name, error = %err, "module stop failed");
                self.monitor.set_status(name, ModuleStatus::Failed);
                Err(err)
            }
            Err(_) => {
                error!(module = %name, "module stop timed out");
                self.monitor.set_status(name, ModuleStatus::Failed);
                Err(anyhow::Error::from(EngineError::Timeout))
            }
        }
    }

    /// Best-effort reverse-order stop of `started` after a failed start.
    async fn rollback(
        &self,
        ctx: &ModuleCtx,
        started: &[String],
        timeouts: LifecycleTimeouts,
    ) -> AggregateError {
        let mut errors = AggregateError::new();
        for name in started.iter().rev() {
            if let Err(err) = self.stop_one(ctx, name, timeouts).await {
                errors.push(name.clone(), err);
            }
        }
        errors
    }

    fn hooks_for(&self, pick: impl Fn(&Hooks) -> &Vec<Hook>) -> Vec<Hook> {
        pick(&self.hooks.read()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ModuleHandle, ServiceModule};
    use crate::context::ModuleCtxBuilder;
    use crate::drain::DrainGuard;
    use crate::manifest::Manifest;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    struct Scripted {
        name: &'static str,
        fail_start: bool,
        fail_stop: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ServiceModule for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn domain(&self) -> &str {
            self.name
        }
        async fn start(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            self.log.lock().push(format!("start:{}", self.name));
            if self.fail_start {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }
        async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            self.log.lock().push(format!("stop:{}", self.name));
            if self.fail_stop {
                anyhow::bail!("refusing to stop");
            }
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        lifecycle: LifecycleManager,
        log: Arc<Mutex<Vec<String>>>,
        ctx: ModuleCtx,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let monitor = HealthMonitor::new(registry.clone());
        let lifecycle = LifecycleManager::new(registry.clone(), monitor);
        Fixture {
            registry,
            lifecycle,
            log: Arc::new(Mutex::new(Vec::new())),
            ctx: ModuleCtxBuilder::new(CancellationToken::new()).build(),
        }
    }

    impl Fixture {
        fn add(&self, name: &'static str, deps: &[&str], fail_start: bool, fail_stop: bool) {
            self.add_with(name, deps, fail_start, fail_stop, None);
        }

        fn add_with(
            &self,
            name: &'static str,
            deps: &[&str],
            fail_start: bool,
            fail_stop: bool,
            drain: Option<Arc<DrainGuard>>,
        ) {
            let module = Arc::new(Scripted {
                name,
                fail_start,
                fail_stop,
                log: self.log.clone(),
            });
            let mut handle = ModuleHandle::new(module);
            if let Some(guard) = drain {
                handle = handle.with_drain(guard);
            }
            self.registry
                .register(
                    Manifest::builder(name).depends_on(deps.iter().copied()).build(),
                    handle,
                )
                .unwrap();
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[tokio::test]
    async fn starts_in_dependency_order_and_stops_in_reverse() {
        let fx = fixture();
        fx.add("oracle", &["accounts"], false, false);
        fx.add("accounts", &["store"], false, false);
        fx.add("store", &[], false, false);

        let started = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap();
        assert_eq!(started, vec!["store", "accounts", "oracle"]);

        fx.lifecycle
            .stop(&fx.ctx, &started, LifecycleTimeouts::default())
            .await
            .unwrap();
        assert_eq!(
            fx.events(),
            vec![
                "start:store",
                "start:accounts",
                "start:oracle",
                "stop:oracle",
                "stop:accounts",
                "stop:store",
            ]
        );
    }

    #[tokio::test]
    async fn failed_start_rolls_back_in_reverse() {
        let fx = fixture();
        fx.add("store", &[], false, false);
        fx.add("accounts", &["store"], false, false);
        fx.add("oracle", &["accounts"], true, false);

        let err = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap_err();
        let EngineError::ServiceStartFailed {
            module, rollback, ..
        } = err
        else {
            panic!("expected start failure");
        };
        assert_eq!(module, "oracle");
        assert!(rollback.is_empty());
        assert_eq!(
            fx.events(),
            vec![
                "start:store",
                "start:accounts",
                "start:oracle",
                "stop:accounts",
                "stop:store",
            ]
        );
        // Rolled-back modules end up Stopped, the culprit Failed.
        assert_eq!(
            fx.registry.health("oracle").unwrap().status,
            ModuleStatus::Failed
        );
        assert_eq!(
            fx.registry.health("store").unwrap().status,
            ModuleStatus::Stopped
        );
    }

    #[tokio::test]
    async fn cancellation_mid_start_rolls_back_like_a_failure() {
        struct Gate {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl ServiceModule for Gate {
            fn name(&self) -> &str {
                "gate"
            }
            fn domain(&self) -> &str {
                "gate"
            }
            async fn start(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
                self.log.lock().push("start:gate".into());
                // Simulates an external shutdown arriving mid-pass.
                ctx.cancellation_token().cancel();
                Ok(())
            }
            async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
                self.log.lock().push("stop:gate".into());
                Ok(())
            }
        }

        let fx = fixture();
        fx.registry
            .register(
                Manifest::builder("gate").build(),
                ModuleHandle::new(Arc::new(Gate { log: fx.log.clone() })),
            )
            .unwrap();
        fx.add("late", &["gate"], false, false);

        let err = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap_err();
        let EngineError::ServiceStartFailed { module, source, .. } = err else {
            panic!("expected start failure");
        };
        // "late" never ran; "gate" was rolled back.
        assert_eq!(module, "late");
        assert_eq!(source.to_string(), "operation canceled");
        assert_eq!(fx.events(), vec!["start:gate", "stop:gate"]);
        assert_eq!(
            fx.registry.health("gate").unwrap().status,
            ModuleStatus::Stopped
        );
    }

    #[tokio::test]
    async fn stop_keeps_going_past_failures_and_aggregates() {
        let fx = fixture();
        fx.add("a", &[], false, true);
        fx.add("b", &["a"], false, false);
        fx.add("c", &["b"], false, true);

        let started = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap();
        let err = fx
            .lifecycle
            .stop(&fx.ctx, &started, LifecycleTimeouts::default())
            .await
            .unwrap_err();

        let EngineError::ServiceStopFailed { errors } = err else {
            panic!("expected stop failures");
        };
        let labels: Vec<_> = errors.iter().map(|(l, _)| l.to_string()).collect();
        // Reverse order, failures only, all modules attempted.
        assert_eq!(labels, vec!["c", "a"]);
        assert_eq!(
            fx.events()[3..],
            ["stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn missing_required_api_blocks_start_when_strict() {
        let fx = fixture();
        let module = Arc::new(Scripted {
            name: "oracle",
            fail_start: false,
            fail_stop: false,
            log: fx.log.clone(),
        });
        fx.registry
            .register(
                Manifest::builder("oracle")
                    .requires_api(ApiSurface::Store)
                    .build(),
                ModuleHandle::new(module),
            )
            .unwrap();

        let err = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingRequiredApis { module, missing }
                if module == "oracle" && missing == vec![ApiSurface::Store]
        ));
        // Nothing was started.
        assert!(fx.events().is_empty());

        // Non-strict mode only warns.
        let started = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), false)
            .await
            .unwrap();
        assert_eq!(started, vec!["oracle"]);
    }

    #[tokio::test]
    async fn failed_pre_start_hook_aborts_before_any_module() {
        let fx = fixture();
        fx.add("store", &[], false, false);
        fx.lifecycle.on_pre_start(Arc::new(|| {
            Box::pin(async { anyhow::bail!("hook says no") })
        }));

        let err = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::HookFailed {
                phase: "pre-start",
                ..
            }
        ));
        assert!(fx.events().is_empty());
    }

    #[tokio::test]
    async fn stop_drains_in_flight_operations_first() {
        let fx = fixture();
        let guard = Arc::new(DrainGuard::new());
        fx.add_with("store", &[], false, false, Some(guard.clone()));

        let started = fx
            .lifecycle
            .start(&fx.ctx, LifecycleTimeouts::default(), true)
            .await
            .unwrap();

        let permit = guard.enter().unwrap();
        let stopper = {
            let started = started.clone();
            let ctx = fx.ctx.clone();
            let lifecycle = LifecycleManager::new(
                fx.registry.clone(),
                HealthMonitor::new(fx.registry.clone()),
            );
            tokio::spawn(async move {
                lifecycle
                    .stop(&ctx, &started, LifecycleTimeouts::default())
                    .await
            })
        };

        // The guard is closed promptly even while an operation is live.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.is_closed());
        assert!(guard.enter().is_none());
        assert!(!fx.events().iter().any(|e| e == "stop:store"));

        drop(permit);
        stopper.await.unwrap().unwrap();
        assert!(fx.events().iter().any(|e| e == "stop:store"));
    }
}
