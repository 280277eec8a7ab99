use thiserror::Error;

use crate::manifest::ApiSurface;

/// Ordered collection of component errors with a stable iteration order.
///
/// Used wherever the engine must keep going after individual failures
/// (bus fan-out, reverse-order shutdown, rollback after a failed start)
/// and report everything it collected at the end.
#[derive(Debug, Default)]
pub struct AggregateError {
    items: Vec<(String, String)>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a component failure under a label (usually a module name).
    pub fn push(&mut self, label: impl Into<String>, error: impl std::fmt::Display) {
        self.items.push((label.into(), error.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Component errors in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(l, e)| (l.as_str(), e.as_str()))
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.items.is_empty() {
            return f.write_str("no errors");
        }
        write!(f, "{} error(s): ", self.items.len())?;
        for (i, (label, err)) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{label}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Structured errors for the service engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("module '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("module '{module}' depends on unknown '{missing}'")]
    MissingDependency { module: String, missing: String },

    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("start failed for module '{module}' ({} rollback error(s))", rollback.len())]
    ServiceStartFailed {
        module: String,
        #[source]
        source: anyhow::Error,
        rollback: AggregateError,
    },

    #[error("stop completed with failures: {errors}")]
    ServiceStopFailed { errors: AggregateError },

    #[error("module '{module}' is not ready: {reason}")]
    ServiceNotReady { module: String, reason: String },

    #[error("module '{0}' is still running")]
    ServiceStillRunning(String),

    #[error("module '{module}' requires APIs not offered by any registered module: {}",
        missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "))]
    MissingRequiredApis {
        module: String,
        missing: Vec<ApiSurface>,
    },

    #[error("no registered module offers the '{surface}' surface")]
    NoCapableModules { surface: ApiSurface },

    #[error("bus handlers failed: {errors}")]
    HandlerFailures { errors: AggregateError },

    #[error("{phase} hook failed")]
    HookFailed {
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("engine already started")]
    AlreadyStarted,

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_keeps_insertion_order() {
        let mut agg = AggregateError::new();
        agg.push("b", "late");
        agg.push("a", "early");

        let labels: Vec<_> = agg.iter().map(|(l, _)| l.to_string()).collect();
        assert_eq!(labels, vec!["b", "a"]);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn aggregate_into_result() {
        assert!(AggregateError::new().into_result().is_ok());

        let mut agg = AggregateError::new();
        agg.push("m", "boom");
        let err = agg.into_result().unwrap_err();
        assert!(err.to_string().contains("m: boom"));
    }

    #[test]
    fn cycle_error_formats_path() {
        let err = EngineError::DependencyCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected: a -> b -> a"
        );
    }
}
