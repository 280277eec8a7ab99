use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manifest::{ApiSurface, Layer, Manifest};
use crate::registry::Registry;

/// Lifecycle status of a module as tracked by the health monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    #[default]
    Registered,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl ModuleStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Registered => "registered",
            ModuleStatus::Starting => "starting",
            ModuleStatus::Started => "started",
            ModuleStatus::Stopping => "stopping",
            ModuleStatus::Stopped => "stopped",
            ModuleStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness is tracked separately from lifecycle status: a module can be
/// started but not yet ready (warming caches, waiting on a peer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    #[default]
    Unknown,
    Ready,
    NotReady,
}

/// Point-in-time health record for one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub name: String,
    pub domain: String,
    pub layer: Layer,
    pub status: ModuleStatus,
    pub ready: ReadyStatus,
    /// Last readiness failure reason, cleared when the probe succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ModuleHealth {
    pub(crate) fn new(manifest: &Manifest) -> Self {
        let now = Utc::now();
        Self {
            name: manifest.name.clone(),
            domain: manifest.domain.clone(),
            layer: manifest.layer,
            status: ModuleStatus::Registered,
            ready: ReadyStatus::Unknown,
            reason: None,
            registered_at: now,
            started_at: None,
            stopped_at: None,
            ready_at: None,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Time a started module has spent without reaching readiness.
    pub fn waiting_for_ready(&self) -> Option<chrono::Duration> {
        match (self.status, self.ready, self.started_at) {
            (ModuleStatus::Started, ReadyStatus::Ready, _) => None,
            (ModuleStatus::Started, _, Some(started)) => Some(Utc::now() - started),
            _ => None,
        }
    }

    /// Start-to-ready latency of the most recent start, once ready.
    pub fn start_to_ready(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ready_at) {
            (Some(started), Some(ready)) => Some(ready - started),
            _ => None,
        }
    }
}

/// Read-mostly facade over the registry's health records plus an optional
/// background readiness poller. Status transitions are written by the
/// lifecycle manager; the poller only updates readiness.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<Registry>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub(crate) fn set_status(&self, name: &str, status: ModuleStatus) {
        self.registry.update_health(name, |h| {
            h.status = status;
            match status {
                ModuleStatus::Started => {
                    h.started_at = Some(Utc::now());
                    h.stopped_at = None;
                }
                ModuleStatus::Stopped | ModuleStatus::Failed => {
                    h.stopped_at = Some(Utc::now());
                    h.ready = ReadyStatus::Unknown;
                    h.ready_at = None;
                }
                _ => {}
            }
        });
    }

    pub(crate) fn set_ready(&self, name: &str, ready: ReadyStatus, reason: Option<String>) {
        self.registry.update_health(name, |h| {
            let was_ready = h.ready == ReadyStatus::Ready;
            h.ready = ready;
            h.reason = reason;
            match ready {
                ReadyStatus::Ready if !was_ready => h.ready_at = Some(Utc::now()),
                ReadyStatus::Ready => {}
                _ => h.ready_at = None,
            }
        });
    }

    /// Run one module's readiness probe and record the outcome.
    pub async fn check_ready(&self, name: &str, probe_timeout: Duration) -> ReadyStatus {
        let Some(record) = self.registry.lookup(name) else {
            return ReadyStatus::Unknown;
        };
        if record.health.status != ModuleStatus::Started {
            return ReadyStatus::Unknown;
        }
        let outcome = tokio::time::timeout(probe_timeout, record.handle.core().ready()).await;
        match outcome {
            Ok(Ok(())) => {
                self.set_ready(name, ReadyStatus::Ready, None);
                ReadyStatus::Ready
            }
            Ok(Err(err)) => {
                debug!(module = name, error = %err, "readiness probe failed");
                self.set_ready(name, ReadyStatus::NotReady, Some(err.to_string()));
                ReadyStatus::NotReady
            }
            Err(_) => {
                warn!(module = name, timeout = ?probe_timeout, "readiness probe timed out");
                self.set_ready(
                    name,
                    ReadyStatus::NotReady,
                    Some(format!("probe timed out after {probe_timeout:?}")),
                );
                ReadyStatus::NotReady
            }
        }
    }

    pub fn health(&self, name: &str) -> Option<ModuleHealth> {
        self.registry.health(name)
    }

    pub fn snapshot(&self) -> Vec<ModuleHealth> {
        self.registry.health_snapshot()
    }

    /// Health records grouped by architectural layer.
    pub fn by_layer(&self) -> BTreeMap<Layer, Vec<ModuleHealth>> {
        let mut out: BTreeMap<Layer, Vec<ModuleHealth>> = BTreeMap::new();
        for h in self.registry.health_snapshot() {
            out.entry(h.layer).or_default().push(h);
        }
        out
    }

    /// Started modules that have gone longer than `grace` without
    /// reporting ready.
    pub fn waiting(&self, grace: Duration) -> Vec<ModuleHealth> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        self.registry
            .health_snapshot()
            .into_iter()
            .filter(|h| h.waiting_for_ready().is_some_and(|d| d > grace))
            .collect()
    }

    /// Modules whose last start-to-ready latency exceeded `threshold`,
    /// plus started modules still stuck past it.
    pub fn slow_starters(&self, threshold: Duration) -> Vec<ModuleHealth> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        self.registry
            .health_snapshot()
            .into_iter()
            .filter(|h| {
                h.start_to_ready()
                    .or_else(|| h.waiting_for_ready())
                    .is_some_and(|d| d > threshold)
            })
            .collect()
    }

    /// Required surfaces with no registered implementer, per module.
    pub fn missing_required_apis(&self) -> BTreeMap<String, Vec<ApiSurface>> {
        let mut out = BTreeMap::new();
        for record in self.registry.records() {
            let missing: Vec<ApiSurface> = record
                .manifest
                .requires_apis
                .iter()
                .copied()
                .filter(|&s| self.registry.modules_implementing(s).is_empty())
                .collect();
            if !missing.is_empty() {
                out.insert(record.manifest.name.clone(), missing);
            }
        }
        out
    }

    /// Spawn the background readiness poller. It probes every started
    /// module once per `interval` until the token is cancelled.
    pub(crate) fn spawn_poller(
        &self,
        interval: Duration,
        probe_timeout: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("readiness poller stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let names: Vec<String> = monitor
                    .registry
                    .health_snapshot()
                    .into_iter()
                    .filter(|h| h.status == ModuleStatus::Started)
                    .map(|h| h.name)
                    .collect();
                for name in names {
                    monitor.check_ready(&name, probe_timeout).await;
                }
            }
        })
    }
}
