//! Capability buses: fan-out of events, data pushes and compute requests
//! to every module implementing the matching surface.
//!
//! Delivery is sequential in registration order. Handlers run one at a
//! time on the caller's task, so a module's handler observes all effects
//! of handlers registered before it. Handler failures never abort the
//! fan-out; they are collected and reported at the end.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::errors::{AggregateError, EngineError};
use crate::manifest::ApiSurface;
use crate::registry::Registry;

/// Per-module bus permissions. `allow_publish_event` gates what a module
/// may send; the remaining flags gate what it may receive, letting an
/// adapter stub a surface it does not fully support. A denied call is a
/// silent skip, never an error.
///
/// Permissions only ever narrow: granting is an intersection with the
/// previous grant, so no call sequence can widen a module's access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusPermission {
    pub allow_publish_event: bool,
    pub allow_subscribe_event: bool,
    pub allow_push_data: bool,
    pub allow_invoke_compute: bool,
}

impl BusPermission {
    pub const fn all() -> Self {
        Self {
            allow_publish_event: true,
            allow_subscribe_event: true,
            allow_push_data: true,
            allow_invoke_compute: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            allow_publish_event: false,
            allow_subscribe_event: false,
            allow_push_data: false,
            allow_invoke_compute: false,
        }
    }

    pub const fn intersect(self, other: Self) -> Self {
        Self {
            allow_publish_event: self.allow_publish_event && other.allow_publish_event,
            allow_subscribe_event: self.allow_subscribe_event && other.allow_subscribe_event,
            allow_push_data: self.allow_push_data && other.allow_push_data,
            allow_invoke_compute: self.allow_invoke_compute && other.allow_invoke_compute,
        }
    }

    /// Whether this permission lets the module receive traffic on `surface`.
    pub fn allows_receive(&self, surface: ApiSurface) -> bool {
        match surface {
            ApiSurface::Event => self.allow_subscribe_event,
            ApiSurface::Data => self.allow_push_data,
            ApiSurface::Compute => self.allow_invoke_compute,
            // Store/account ports are pulled through typed views, not a bus.
            ApiSurface::Store | ApiSurface::Account => true,
        }
    }
}

impl Default for BusPermission {
    fn default() -> Self {
        Self::all()
    }
}

/// Outcome of one module's compute handler.
#[derive(Debug)]
pub struct ComputeResult {
    pub module: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

type LocalSubscriber = Box<dyn Fn(&str, &Value) + Send + Sync>;

struct LocalEntry {
    owner: String,
    event: String,
    handler: LocalSubscriber,
}

/// The bus fabric shared by all modules of one engine instance.
pub struct BusSystem {
    registry: Arc<Registry>,
    permissions: RwLock<HashMap<String, BusPermission>>,
    /// Process-local per-event observers, notified after module fan-out.
    locals: RwLock<Vec<LocalEntry>>,
}

impl BusSystem {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            permissions: RwLock::new(HashMap::new()),
            locals: RwLock::new(Vec::new()),
        }
    }

    /// Narrow a module's bus permissions. The stored grant is the
    /// intersection of every restriction ever applied to this module.
    pub fn restrict(&self, module: &str, permission: BusPermission) {
        let mut perms = self.permissions.write();
        let entry = perms
            .entry(module.to_string())
            .or_insert_with(BusPermission::all);
        *entry = entry.intersect(permission);
    }

    /// Effective permission for a module (full access unless narrowed).
    pub fn grants(&self, module: &str) -> BusPermission {
        self.permissions
            .read()
            .get(module)
            .copied()
            .unwrap_or_else(BusPermission::all)
    }

    /// Drop all permission entries and local subscriptions for a module
    /// (used on unregister).
    pub(crate) fn revoke(&self, module: &str) {
        self.permissions.write().remove(module);
        self.locals.write().retain(|entry| entry.owner != module);
    }

    fn may_receive(&self, module: &str, surface: ApiSurface) -> bool {
        self.grants(module).allows_receive(surface)
    }

    /// Broadcast an event to every event-capable module, then to local
    /// subscribers. A source without publish permission is a silent no-op;
    /// a target without subscribe permission is silently skipped.
    pub async fn publish_event(
        &self,
        source: Option<&str>,
        event: &str,
        payload: &Value,
    ) -> Result<usize, EngineError> {
        if let Some(name) = source {
            if !self.grants(name).allow_publish_event {
                debug!(source = name, event, "event publish denied, skipping");
                return Ok(0);
            }
        }
        let targets = self.registry.modules_implementing(ApiSurface::Event);
        let mut errors = AggregateError::new();
        let mut delivered = 0usize;
        for (name, handle) in targets {
            if !self.may_receive(&name, ApiSurface::Event) {
                trace!(module = %name, event, "subscribe permission narrowed, skipping");
                continue;
            }
            let Some(port) = handle.event.as_ref() else {
                continue;
            };
            trace!(module = %name, event, "delivering event");
            match port.on_event(event, payload).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(module = %name, event, error = %err, "event handler failed");
                    errors.push(name, err);
                }
            }
        }
        self.notify_locals(event, payload);
        if errors.is_empty() {
            Ok(delivered)
        } else {
            Err(EngineError::HandlerFailures { errors })
        }
    }

    /// Push a data record to every data-capable module that still has the
    /// push-data permission. `source` is attribution metadata only.
    pub async fn push_data(
        &self,
        source: Option<&str>,
        topic: &str,
        payload: &Value,
    ) -> Result<usize, EngineError> {
        trace!(?source, topic, "pushing data record");
        let targets = self.registry.modules_implementing(ApiSurface::Data);
        let mut errors = AggregateError::new();
        let mut delivered = 0usize;
        for (name, handle) in targets {
            if !self.may_receive(&name, ApiSurface::Data) {
                trace!(module = %name, topic, "push-data permission narrowed, skipping");
                continue;
            }
            let Some(port) = handle.data.as_ref() else {
                continue;
            };
            match port.on_data(topic, payload).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(module = %name, topic, error = %err, "data handler failed");
                    errors.push(name, err);
                }
            }
        }
        if errors.is_empty() {
            Ok(delivered)
        } else {
            Err(EngineError::HandlerFailures { errors })
        }
    }

    /// Fan a compute request out to every compute-capable, compute-permitted
    /// module and collect per-module results. Individual failures are
    /// captured in the result rows; only an empty target set is an error.
    pub async fn invoke_compute(
        &self,
        source: Option<&str>,
        payload: &Value,
    ) -> Result<Vec<ComputeResult>, EngineError> {
        trace!(?source, "invoking compute");
        let targets = self.registry.modules_implementing(ApiSurface::Compute);
        let mut results = Vec::new();
        for (name, handle) in targets {
            if !self.may_receive(&name, ApiSurface::Compute) {
                trace!(module = %name, "compute permission narrowed, skipping");
                continue;
            }
            let Some(port) = handle.compute.as_ref() else {
                continue;
            };
            match port.compute(payload).await {
                Ok(value) => results.push(ComputeResult {
                    module: name,
                    result: Some(value),
                    error: None,
                }),
                Err(err) => {
                    warn!(module = %name, error = %err, "compute handler failed");
                    results.push(ComputeResult {
                        module: name,
                        result: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        if results.is_empty() {
            return Err(EngineError::NoCapableModules {
                surface: ApiSurface::Compute,
            });
        }
        Ok(results)
    }

    /// Register a process-local observer for one event name, owned by
    /// `module`. Observers run after module fan-out, in subscription
    /// order, and cannot fail delivery.
    pub fn subscribe_local(
        &self,
        module: &str,
        event: &str,
        subscriber: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) {
        self.locals.write().push(LocalEntry {
            owner: module.to_string(),
            event: event.to_string(),
            handler: Box::new(subscriber),
        });
    }

    fn notify_locals(&self, event: &str, payload: &Value) {
        let locals = self.locals.read();
        for entry in locals.iter() {
            if entry.event != event {
                continue;
            }
            (entry.handler)(event, payload);
        }
    }
}

impl std::fmt::Debug for BusSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSystem")
            .field("permissions", &*self.permissions.read())
            .field("local_subscribers", &self.locals.read().len())
            .finish()
    }
}
