use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::EngineError;

/// A named capability surface a module may offer.
///
/// Event, data and compute surfaces are backed by a bus; store and account
/// surfaces are plain capability ports consumed through typed views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiSurface {
    Store,
    Account,
    Compute,
    Data,
    Event,
}

impl ApiSurface {
    pub const ALL: [ApiSurface; 5] = [
        ApiSurface::Store,
        ApiSurface::Account,
        ApiSurface::Compute,
        ApiSurface::Data,
        ApiSurface::Event,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ApiSurface::Store => "store",
            ApiSurface::Account => "account",
            ApiSurface::Compute => "compute",
            ApiSurface::Data => "data",
            ApiSurface::Event => "event",
        }
    }
}

impl std::fmt::Display for ApiSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architectural layer a module belongs to, used for grouped health views.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    #[default]
    Service,
    Runner,
    Infra,
}

impl Layer {
    pub const fn as_str(self) -> &'static str {
        match self {
            Layer::Service => "service",
            Layer::Runner => "runner",
            Layer::Infra => "infra",
        }
    }
}

/// Static, declarative description of a module: identity, dependencies,
/// required capabilities and quotas.
///
/// Manifests are normalized on build (whitespace trimmed, set-valued fields
/// de-duplicated) and immutable once the module is running; the registry
/// rejects replacement while the module's status is anything other than
/// `Registered` or `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub domain: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub layer: Layer,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub requires_apis: BTreeSet<ApiSurface>,
    #[serde(default)]
    pub quotas: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Manifest {
    pub fn builder(name: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(name)
    }

    /// Validate required fields. Normalization has already happened at
    /// build/deserialization boundaries, so validation only has to check
    /// presence and self-consistency.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidManifest("name is required".into()));
        }
        if self.version.trim().is_empty() {
            return Err(EngineError::InvalidManifest(format!(
                "module '{}': version is required",
                self.name
            )));
        }
        if self.depends_on.contains(&self.name) {
            return Err(EngineError::InvalidManifest(format!(
                "module '{}' depends on itself",
                self.name
            )));
        }
        Ok(())
    }

    /// Trim scalar fields and rebuild set-valued fields without empties.
    /// BTree containers make the result de-duplicated and deterministically
    /// ordered for free.
    pub(crate) fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.domain = self.domain.trim().to_string();
        self.description = self.description.trim().to_string();
        self.version = self.version.trim().to_string();
        if self.domain.is_empty() {
            self.domain = self.name.clone();
        }

        self.capabilities = normalize_set(&self.capabilities);
        self.depends_on = normalize_set(&self.depends_on);
        self.quotas = normalize_map(&self.quotas);
        self.tags = normalize_map(&self.tags);
    }
}

fn normalize_set(set: &BTreeSet<String>) -> BTreeSet<String> {
    set.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Fluent builder for [`Manifest`]. `build()` normalizes the result.
pub struct ManifestBuilder {
    inner: Manifest,
}

impl ManifestBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Manifest {
                name: name.into(),
                domain: String::new(),
                description: String::new(),
                version: "0.1.0".into(),
                layer: Layer::default(),
                capabilities: BTreeSet::new(),
                depends_on: BTreeSet::new(),
                requires_apis: BTreeSet::new(),
                quotas: BTreeMap::new(),
                tags: BTreeMap::new(),
                enabled: true,
            },
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.inner.domain = domain.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.inner.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.inner.version = version.into();
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.inner.layer = layer;
        self
    }

    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.inner.capabilities.insert(cap.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn requires_api(mut self, surface: ApiSurface) -> Self {
        self.inner.requires_apis.insert(surface);
        self
    }

    pub fn quota(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.quotas.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.tags.insert(key.into(), value.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.inner.enabled = enabled;
        self
    }

    pub fn build(mut self) -> Manifest {
        self.inner.normalize();
        self.inner
    }
}
