use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use service_engine::{ConfigProvider, EngineSettings};

/// Main application configuration with a strongly-typed engine section
/// and a flexible per-module configuration bag.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Engine tunables and the working directory.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Directory containing per-module YAML files (optional).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Per-module configuration bag: module_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Working directory; empty means the platform default
    /// (`$HOME/.service-engine`). Normalized to an absolute path on load.
    #[serde(default)]
    pub home_dir: String,
    /// Lifecycle and health tunables, passed straight to the engine.
    #[serde(flatten)]
    pub settings: EngineSettings,
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/engine.log"
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>, // How many rotated files to keep
    #[serde(default)]
    pub max_size_mb: Option<u64>, // Max size of the file in MB
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/engine.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file →
    /// environment variables. Also normalizes `engine.home_dir` into an
    /// absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path.as_ref()))
            // Example: ENGINE__ENGINE__START_TIMEOUT=45s maps to engine.start_timeout
            .merge(Env::prefixed("ENGINE__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        normalize_home_dir_inplace(&mut config.engine)
            .context("Failed to resolve engine.home_dir")?;

        // Merge module files if modules_dir is specified.
        if let Some(dir) = config.modules_dir.clone() {
            let dir = resolve_against_home(&dir, &config.engine.home_dir);
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.engine)
                    .context("Failed to resolve engine.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Absolute path of the engine working directory.
    pub fn home_dir(&self) -> &Path {
        Path::new(&self.engine.home_dir)
    }

    /// Build a module config provider over the `modules` bag.
    pub fn module_config_provider(&self) -> Arc<dyn ConfigProvider> {
        Arc::new(AppConfigProvider {
            modules: self.modules.clone(),
        })
    }
}

/// [`ConfigProvider`] backed by the loaded `modules` bag.
pub struct AppConfigProvider {
    modules: HashMap<String, serde_json::Value>,
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.modules.get(module_name)
    }
}

const fn default_subdir() -> &'static str {
    ".service-engine"
}

/// Normalize `engine.home_dir` into an absolute, existing directory.
/// Empty means the platform default; a leading `~` expands to `$HOME`.
fn normalize_home_dir_inplace(engine: &mut EngineConfig) -> Result<()> {
    let raw = engine.home_dir.trim();
    let mut path = if raw.is_empty() {
        user_home()?.join(default_subdir())
    } else if let Some(rest) = raw.strip_prefix("~/") {
        user_home()?.join(rest)
    } else if raw == "~" {
        user_home()?
    } else {
        PathBuf::from(raw)
    };

    if path.is_relative() {
        path = std::env::current_dir()
            .context("cannot resolve current directory")?
            .join(path);
    }
    std::fs::create_dir_all(&path)
        .with_context(|| format!("cannot create home_dir '{}'", path.display()))?;

    engine.home_dir = path.to_string_lossy().to_string();
    Ok(())
}

fn user_home() -> Result<PathBuf> {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";

    std::env::var_os(var)
        .map(PathBuf::from)
        .with_context(|| format!("environment variable {var} is not set"))
}

fn resolve_against_home(dir: &str, home: &str) -> PathBuf {
    let p = Path::new(dir);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(home).join(p)
    }
}

/// Each `<name>.yaml` in `dir` becomes a `modules.<name>` section unless
/// the main file already defines one (main config wins).
fn merge_module_files(
    bag: &mut HashMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    use std::fs;
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() || bag.contains_key(&name) {
            continue;
        }
        let raw = fs::read_to_string(&path)?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let json = serde_json::to_value(val)?;
        bag.insert(name, json);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    fn is_normalized_path(p: &str) -> bool {
        let pb = PathBuf::from(p);
        pb.is_absolute() && !p.starts_with('~')
    }

    #[test]
    fn default_config_structure() {
        let config = AppConfig::default();

        // raw (not yet normalized)
        assert_eq!(config.engine.home_dir, "");
        assert_eq!(config.engine.settings.start_timeout, Duration::from_secs(30));
        assert!(config.engine.settings.strict_apis);
        assert!(config.logging.is_none());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn load_layered_normalizes_home_dir_and_parses_durations() {
        let tmp = tempdir().unwrap();
        let home = tmp.path().join("engine_home");
        let cfg_path = tmp.path().join("cfg.yaml");

        let yaml = format!(
            r#"
engine:
  home_dir: "{}"
  start_timeout: 45s
  stop_timeout: 5s
  strict_apis: false

logging:
  default:
    console_level: debug
    file: "logs/default.log"

modules:
  oracle:
    feed_url: "https://feeds.example"
"#,
            home.display()
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert!(is_normalized_path(&config.engine.home_dir));
        assert!(home.is_dir());
        assert_eq!(config.engine.settings.start_timeout, Duration::from_secs(45));
        assert_eq!(config.engine.settings.stop_timeout, Duration::from_secs(5));
        assert!(!config.engine.settings.strict_apis);

        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging["default"].console_level, "debug");

        assert_eq!(
            config.modules["oracle"]["feed_url"],
            serde_json::json!("https://feeds.example")
        );
    }

    #[test]
    fn modules_dir_files_merge_without_clobbering_main_config() {
        let tmp = tempdir().unwrap();
        let home = tmp.path().join("home");
        let mod_dir = tmp.path().join("conf.d");
        fs::create_dir_all(&mod_dir).unwrap();
        fs::write(mod_dir.join("store.yaml"), "path: /var/data\n").unwrap();
        fs::write(mod_dir.join("oracle.yml"), "feed_url: from-file\n").unwrap();
        fs::write(mod_dir.join("ignored.txt"), "nope").unwrap();

        let cfg_path = tmp.path().join("cfg.yaml");
        let yaml = format!(
            r#"
engine:
  home_dir: "{}"
modules_dir: "{}"
modules:
  oracle:
    feed_url: from-main
"#,
            home.display(),
            mod_dir.display()
        );
        fs::write(&cfg_path, yaml).unwrap();

        let config = AppConfig::load_layered(&cfg_path).unwrap();
        assert_eq!(config.modules["store"]["path"], serde_json::json!("/var/data"));
        // Main file wins over the per-module file.
        assert_eq!(
            config.modules["oracle"]["feed_url"],
            serde_json::json!("from-main")
        );
        assert!(!config.modules.contains_key("ignored"));
    }

    #[test]
    fn provider_serves_module_sections() {
        let mut config = AppConfig::default();
        config.modules.insert(
            "store".into(),
            serde_json::json!({"path": "/tmp/store"}),
        );

        let provider = config.module_config_provider();
        assert!(provider.get_module_config("store").is_some());
        assert!(provider.get_module_config("missing").is_none());
    }

    #[test]
    fn to_yaml_round_trips() {
        let config = AppConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.engine.settings.stop_timeout, Duration::from_secs(10));
    }
}
