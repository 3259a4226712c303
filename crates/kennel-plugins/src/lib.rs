//! Plugin host runtime for Kennel.
//!
//! Loads independently versioned plugins that run as separate processes,
//! isolates calls into them, supervises their lifecycle and tears them down
//! in a safe order:
//!
//! - [`DependencyGraph`]: version-checked dependency edges and load/unload ordering
//! - [`ServiceRegistry`]: named services and lazily built singletons shared with plugins
//! - [`Sandbox`]: per-plugin call executor with deadlines, panic containment and statistics
//! - [`LifecycleMachine`]: the per-instance state machine with hooks and listeners
//! - [`PluginManager`]: the orchestrator tying these together with health checks
//! - [`rpc`]: the subprocess channel, both host ([`RpcClient`]) and plugin ([`serve`]) sides
//!
//! # Writing a plugin
//!
//! A plugin is an executable that implements [`PluginModule`] and calls
//! [`serve`]. It must not write anything but protocol lines to stdout.
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use kennel_plugins::prelude::*;
//! use serde_json::Value;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl PluginModule for Hello {
//!     async fn init(&self, _config: Value) -> PluginResult<()> { Ok(()) }
//!     async fn execute(&self, _action: &str, params: Value) -> PluginResult<Value> { Ok(params) }
//!     async fn shutdown(&self) -> PluginResult<()> { Ok(()) }
//!     async fn get_info(&self) -> PluginResult<PluginInfo> {
//!         Ok(PluginInfo {
//!             name: "hello".into(),
//!             version: "0.1.0".into(),
//!             description: String::new(),
//!             supported_actions: vec!["echo".into()],
//!         })
//!     }
//!     async fn handle_message(&self, _message: PluginMessage) -> PluginResult<Value> {
//!         Ok(Value::Null)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> PluginResult<()> {
//!     kennel_plugins::rpc::serve(Hello).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod config;
pub mod dependency;
pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod module;
pub mod prelude;
pub mod rpc;
pub mod sandbox;

pub use config::{DependentPolicy, ManagerConfig};
pub use dependency::{DependencyGraph, Dependents, Injectable, ServiceRegistry, Slot};
pub use descriptor::{IsolationLevel, PluginDependency, PluginDescriptor, PluginId};
pub use error::{ErrorKind, PluginError, PluginResult};
pub use lifecycle::{
    LifecycleHooks, LifecycleListener, LifecycleMachine, LifecycleState, Phase, PluginDelegate,
    TransitionEvent,
};
pub use manager::{ManagedPlugin, PluginEvent, PluginHealth, PluginManager, PluginStatus};
pub use module::{PluginInfo, PluginMessage, PluginModule};
pub use rpc::{RemotePlugin, RpcClient, SpawnOptions, serve};
pub use sandbox::{
    Fault, ResourceLimits, Sandbox, SandboxConfig, SandboxState, SandboxStats, WorkerPool,
};
