//! Host-side runtime: layered configuration loading, logging bootstrap
//! and engine construction.

use std::sync::Arc;

use service_engine::ServiceEngine;

pub mod config;
pub mod logging;

pub use config::{default_logging_config, AppConfig, AppConfigProvider, EngineConfig, LoggingConfig, Section};
pub use logging::init_logging_from_config;

/// Build an engine from a loaded configuration: settings from the
/// `engine` section, module config sections served from the `modules` bag.
pub fn build_engine(config: &AppConfig) -> Arc<ServiceEngine> {
    Arc::new(ServiceEngine::with_config_provider(
        config.engine.settings.clone(),
        config.module_config_provider(),
    ))
}

/// Load configuration, initialize logging and build the engine in one go.
pub fn bootstrap(config_path: Option<&std::path::Path>) -> anyhow::Result<(AppConfig, Arc<ServiceEngine>)> {
    let config = AppConfig::load_or_default(config_path)?;
    let logging = config.logging.clone().unwrap_or_else(default_logging_config);
    logging::init_logging_from_config(&logging, config.home_dir());
    let engine = build_engine(&config);
    Ok((config, engine))
}
