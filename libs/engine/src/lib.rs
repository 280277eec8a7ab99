//! # Service Engine - Module Orchestration Kernel
//!
//! An in-process kernel that hosts pluggable service modules and manages
//! their whole life: registration with a declarative manifest,
//! dependency-ordered startup with rollback, capability-scoped buses for
//! module-to-module traffic, health and readiness telemetry, and
//! reverse-order graceful shutdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use service_engine::{Manifest, ModuleHandle, ServiceEngine, EngineSettings};
//!
//! let engine = ServiceEngine::new(EngineSettings::default());
//! engine.register(
//!     Manifest::builder("store").version("1.0.0").build(),
//!     ModuleHandle::new(store.clone()).with_store(store),
//! )?;
//! engine.start().await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod bus;
pub mod context;
pub mod contracts;
pub mod drain;
pub mod engine;
pub mod errors;
pub mod health;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod runtime;

mod lifecycle;

pub use bus::{BusPermission, BusSystem, ComputeResult};
pub use context::{ConfigProvider, ModuleCtx, ModuleCtxBuilder};
pub use contracts::{
    AccountCapable, ComputeCapable, DataCapable, EventCapable, ModuleHandle, ServiceModule,
    StoreCapable,
};
pub use drain::{DrainGuard, OperationPermit};
pub use engine::{ApiDescriptor, EngineSettings, EngineState, EngineStats, ServiceEngine};
pub use errors::{AggregateError, EngineError};
pub use health::{HealthMonitor, ModuleHealth, ModuleStatus, ReadyStatus};
pub use lifecycle::{Hook, LifecycleTimeouts};
pub use manifest::{ApiSurface, Layer, Manifest, ManifestBuilder};
pub use registry::{ModuleRecord, Registry};
pub use runtime::{run, wait_for_shutdown, RunOptions, ShutdownOptions};
