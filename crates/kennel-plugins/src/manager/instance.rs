//! Runtime record of one loaded plugin.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::descriptor::{PluginDescriptor, PluginId};
use crate::error::PluginResult;
use crate::lifecycle::{LifecycleMachine, LifecycleState, PluginDelegate};
use crate::module::{PluginInfo, PluginModule};
use crate::rpc::client::{RemotePlugin, RpcClient, SpawnOptions};
use crate::sandbox::{Sandbox, SandboxState, SandboxStats};

/// Coarse health classification reported in [`PluginStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginHealth {
    /// Running and within failure thresholds.
    Healthy,
    /// Running but failing, or in the `Failed` state.
    Unhealthy,
    /// Parked by the idle check.
    Paused,
    /// Not running.
    Inactive,
}

/// Point-in-time snapshot of a managed plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    /// Plugin ID.
    pub id: PluginId,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Health classification.
    pub health: PluginHealth,
    /// Sandbox state.
    pub sandbox_state: SandboxState,
    /// Whether the idle check paused the plugin.
    pub paused: bool,
    /// Number of completed restarts.
    pub restart_count: u32,
    /// Most recent lifecycle or call failure.
    pub last_error: Option<String>,
    /// When the plugin last reached `Running`.
    pub start_time: Option<DateTime<Utc>>,
    /// When the plugin last stopped.
    pub stop_time: Option<DateTime<Utc>>,
    /// OS process ID of the plugin process, if connected.
    pub pid: Option<u32>,
    /// Plugin self-description from its last start.
    pub info: Option<PluginInfo>,
    /// Sandbox call statistics.
    pub stats: SandboxStats,
}

#[derive(Debug, Default)]
struct RuntimeRecord {
    client: Option<Arc<RpcClient>>,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    info: Option<PluginInfo>,
}

/// A loaded plugin: descriptor, process connection, sandbox and lifecycle
/// machine.
///
/// Lifecycle operations on one instance are serialized by the manager.
pub struct ManagedPlugin {
    descriptor: PluginDescriptor,
    executable: PathBuf,
    sandbox: Arc<Sandbox>,
    lifecycle: Arc<LifecycleMachine>,
    ops: tokio::sync::Mutex<()>,
    runtime: Mutex<RuntimeRecord>,
    paused: AtomicBool,
    restarting: AtomicBool,
    restart_count: AtomicU32,
}

impl fmt::Debug for ManagedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedPlugin")
            .field("id", &self.descriptor.id)
            .field("state", &self.lifecycle.state())
            .field("executable", &self.executable)
            .finish_non_exhaustive()
    }
}

impl ManagedPlugin {
    pub(crate) fn new(
        descriptor: PluginDescriptor,
        executable: PathBuf,
        sandbox: Arc<Sandbox>,
        lifecycle: Arc<LifecycleMachine>,
    ) -> Self {
        Self {
            descriptor,
            executable,
            sandbox,
            lifecycle,
            ops: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(RuntimeRecord::default()),
            paused: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
        }
    }

    /// Plugin ID.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.descriptor.id
    }

    /// The descriptor the plugin was loaded from.
    #[must_use]
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Resolved executable path.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// The plugin's sandbox.
    #[must_use]
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// The plugin's lifecycle machine.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleMachine> {
        &self.lifecycle
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Whether the idle check has paused the plugin.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Number of completed restarts.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    /// Most recent failure message.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.runtime().last_error.clone()
    }

    /// The call surface of the connected process, if any.
    #[must_use]
    pub fn module(&self) -> Option<Arc<dyn PluginModule>> {
        self.client()
            .map(|client| Arc::new(RemotePlugin::new(client)) as Arc<dyn PluginModule>)
    }

    /// Running, sandbox within thresholds and process connected.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() == LifecycleState::Running
            && self.sandbox.is_healthy()
            && self.client().is_some_and(|client| !client.is_exited())
    }

    /// Snapshot for status queries.
    #[must_use]
    pub fn status(&self) -> PluginStatus {
        let state = self.state();
        let paused = self.is_paused();
        let health = match state {
            LifecycleState::Running if paused => PluginHealth::Paused,
            LifecycleState::Running if self.is_healthy() => PluginHealth::Healthy,
            LifecycleState::Running | LifecycleState::Failed => PluginHealth::Unhealthy,
            _ => PluginHealth::Inactive,
        };
        let runtime = self.runtime();
        PluginStatus {
            id: self.descriptor.id.clone(),
            state,
            health,
            sandbox_state: self.sandbox.state(),
            paused,
            restart_count: self.restart_count(),
            last_error: runtime.last_error.clone(),
            start_time: runtime.start_time,
            stop_time: runtime.stop_time,
            pid: runtime.client.as_ref().and_then(|client| client.pid()),
            info: runtime.info.clone(),
            stats: self.sandbox.stats(),
        }
    }

    pub(crate) async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub(crate) fn client(&self) -> Option<Arc<RpcClient>> {
        self.runtime().client.clone()
    }

    /// Return the live client, spawning a fresh process if there is none
    /// or the previous one exited.
    pub(crate) async fn connect(&self, options: &SpawnOptions) -> PluginResult<Arc<RpcClient>> {
        if let Some(client) = self.client().filter(|client| !client.is_exited()) {
            return Ok(client);
        }
        if let Some(stale) = self.take_client() {
            stale.kill().await;
        }

        debug!(plugin_id = %self.id(), executable = %self.executable.display(), "Spawning plugin process");
        let client = Arc::new(
            RpcClient::spawn(self.descriptor.id.clone(), &self.executable, options).await?,
        );
        self.runtime().client = Some(Arc::clone(&client));
        Ok(client)
    }

    pub(crate) fn take_client(&self) -> Option<Arc<RpcClient>> {
        self.runtime().client.take()
    }

    /// Kill and forget the connected process.
    pub(crate) async fn disconnect(&self) {
        if let Some(client) = self.take_client() {
            client.kill().await;
        }
    }

    pub(crate) fn record_error(&self, error: impl fmt::Display) {
        self.runtime().last_error = Some(error.to_string());
    }

    pub(crate) fn mark_started(&self) {
        self.runtime().start_time = Some(Utc::now());
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.runtime().stop_time = Some(Utc::now());
        self.paused.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Claim the restart slot. Returns `false` if a restart is already
    /// underway.
    pub(crate) fn begin_restart(&self) -> bool {
        self.restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_restart(&self, succeeded: bool) {
        if succeeded {
            let _ = self
                .restart_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)));
        }
        self.restarting.store(false, Ordering::SeqCst);
    }

    fn set_info(&self, info: PluginInfo) {
        self.runtime().info = Some(info);
    }

    fn runtime(&self) -> MutexGuard<'_, RuntimeRecord> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives a [`ManagedPlugin`]'s process from its lifecycle machine.
pub(crate) struct InstanceDelegate<'a> {
    plugin: &'a ManagedPlugin,
    options: &'a SpawnOptions,
    reinit: bool,
}

impl<'a> InstanceDelegate<'a> {
    /// `reinit` re-sends `init` during start, for starts from `Stopped` or
    /// `Failed`.
    pub(crate) fn new(plugin: &'a ManagedPlugin, options: &'a SpawnOptions, reinit: bool) -> Self {
        Self {
            plugin,
            options,
            reinit,
        }
    }

    fn config(&self) -> Value {
        Value::Object(self.plugin.descriptor.config.clone())
    }
}

#[async_trait]
impl PluginDelegate for InstanceDelegate<'_> {
    async fn init(&self) -> PluginResult<()> {
        self.options
            .cancellable(async {
                let client = self.plugin.connect(self.options).await?;
                RemotePlugin::new(client).init(self.config()).await
            })
            .await
    }

    async fn start(&self) -> PluginResult<()> {
        let info = self
            .options
            .cancellable(async {
                let remote = RemotePlugin::new(self.plugin.connect(self.options).await?);
                if self.reinit {
                    remote.init(self.config()).await?;
                }
                remote.get_info().await
            })
            .await?;
        debug!(plugin_id = %self.plugin.id(), name = %info.name, version = %info.version, "Plugin started");
        self.plugin.set_info(info);
        Ok(())
    }

    // Not cancellable: manager shutdown stops plugins after cancelling its scope.
    async fn stop(&self) -> PluginResult<()> {
        match self.plugin.client().filter(|client| !client.is_exited()) {
            Some(client) => RemotePlugin::new(client).shutdown().await,
            None => {
                warn!(plugin_id = %self.plugin.id(), "Plugin process already gone at stop");
                Ok(())
            },
        }
    }
}
