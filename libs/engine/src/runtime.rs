//! Run-until-shutdown driver.
//!
//! Starts an engine, waits for a shutdown trigger (OS signals, an external
//! token, or an arbitrary future), then stops it. The engine start/stop
//! semantics all live in [`ServiceEngine`]; this module only wires the
//! trigger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::engine::ServiceEngine;
use crate::errors::EngineError;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    pub shutdown: ShutdownOptions,
}

/// Full cycle: start → wait for the trigger → stop.
pub async fn run(engine: Arc<ServiceEngine>, opts: RunOptions) -> Result<(), EngineError> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match wait_for_shutdown().await {
                    Ok(()) => {
                        tracing::info!("shutdown: signal received");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        // Cross-platform fallback.
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            // External owner controls lifecycle; nothing to spawn.
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    engine.start().await?;
    cancel.cancelled().await;
    engine.stop().await
}

pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?; // Ctrl+C
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv()  => {},
            _ = tokio::signal::ctrl_c() => {}, // fallback
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close, ctrl_logoff, ctrl_shutdown};

        let mut c = ctrl_c()?;
        let mut br = ctrl_break()?;
        let mut cl = ctrl_close()?;
        let mut lo = ctrl_logoff()?;
        let mut sh = ctrl_shutdown()?;

        tokio::select! {
            _ = c.recv()  => {},
            _ = br.recv() => {},
            _ = cl.recv() => {},
            _ = lo.recv() => {},
            _ = sh.recv() => {},
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ModuleHandle, ServiceModule};
    use crate::context::ModuleCtx;
    use crate::engine::{EngineSettings, EngineState};
    use crate::manifest::Manifest;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ServiceModule for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn domain(&self) -> &str {
            "noop"
        }
        async fn start(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn token_controls_the_run_cycle() {
        let engine = Arc::new(ServiceEngine::new(EngineSettings::default()));
        engine
            .register(Manifest::builder("noop").build(), ModuleHandle::new(Arc::new(Noop)))
            .unwrap();

        let token = CancellationToken::new();
        let runner = tokio::spawn(run(
            engine.clone(),
            RunOptions {
                shutdown: ShutdownOptions::Token(token.clone()),
            },
        ));

        // Engine reaches Running before the trigger fires.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !engine.is_running() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn external_future_triggers_shutdown() {
        let engine = Arc::new(ServiceEngine::new(EngineSettings::default()));
        engine
            .register(Manifest::builder("noop").build(), ModuleHandle::new(Arc::new(Noop)))
            .unwrap();

        run(
            engine.clone(),
            RunOptions {
                shutdown: ShutdownOptions::Future(Box::pin(async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                })),
            },
        )
        .await
        .unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
