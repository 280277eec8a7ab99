//! End-to-end bootstrap: layered config file → engine with a module
//! config provider → full start/stop cycle.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use service_engine::{
    EngineState, Manifest, ModuleCtx, ModuleHandle, ServiceModule,
};

#[derive(Debug, Default, Deserialize, PartialEq)]
struct OracleConfig {
    feed_url: String,
    #[serde(default)]
    retries: u32,
}

struct Oracle {
    seen: Arc<Mutex<Option<OracleConfig>>>,
}

#[async_trait::async_trait]
impl ServiceModule for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }
    fn domain(&self) -> &str {
        "feeds"
    }
    async fn start(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: OracleConfig = ctx.module_config_required()?;
        *self.seen.lock() = Some(cfg);
        Ok(())
    }
    async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn engine_built_from_config_file_serves_module_sections() {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().join("home");
    let cfg_path = tmp.path().join("engine.yaml");
    std::fs::write(
        &cfg_path,
        format!(
            r#"
engine:
  home_dir: "{}"
  start_timeout: 5s
  readiness_interval: 100ms

modules:
  oracle:
    feed_url: "https://feeds.example"
    retries: 2
"#,
            home.display()
        ),
    )
    .unwrap();

    let config = runtime::AppConfig::load_layered(&cfg_path).unwrap();
    let engine = runtime::build_engine(&config);

    let seen = Arc::new(Mutex::new(None));
    engine
        .register(
            Manifest::builder("oracle").domain("feeds").build(),
            ModuleHandle::new(Arc::new(Oracle { seen: seen.clone() })),
        )
        .unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(
        *seen.lock(),
        Some(OracleConfig {
            feed_url: "https://feeds.example".into(),
            retries: 2,
        })
    );

    engine.stop().await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn missing_module_section_fails_strict_config_lookup() {
    let engine = runtime::build_engine(&runtime::AppConfig::default());
    let seen = Arc::new(Mutex::new(None));
    engine
        .register(
            Manifest::builder("oracle").domain("feeds").build(),
            ModuleHandle::new(Arc::new(Oracle { seen })),
        )
        .unwrap();

    let err = engine.start().await.unwrap_err();
    assert!(err.to_string().contains("oracle"));
    assert_eq!(engine.state(), EngineState::Failed);
}
