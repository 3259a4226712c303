//! Plugin orchestration.
//!
//! [`PluginManager`] owns the instance table and the dependency graph and
//! drives each [`ManagedPlugin`] through its lifecycle:
//!
//! - loading resolves the executable, admits the descriptor to the graph
//!   and creates the sandbox and lifecycle machine;
//! - starting spawns the plugin process, handshakes and runs
//!   `init`/`start` through the lifecycle machine;
//! - calls are routed through the plugin's sandbox;
//! - a periodic health check restarts unhealthy plugins that opted into
//!   `auto_restart` and pauses idle ones.
//!
//! The table and the graph sit behind separate locks. Operations on one
//! instance are serialized by a per-instance lock, so loads, calls and
//! health checks on different plugins proceed concurrently.

mod events;
mod health;
mod instance;
mod resolve;

pub use events::PluginEvent;
pub use instance::{ManagedPlugin, PluginHealth, PluginStatus};
pub use resolve::{candidate_paths, resolve_executable};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock};

use kennel_telemetry::RequestContext;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use crate::config::{DependentPolicy, ManagerConfig};
use crate::dependency::DependencyGraph;
use crate::descriptor::{PluginDescriptor, PluginId};
use crate::error::{PluginError, PluginResult};
use crate::lifecycle::{LifecycleListener, LifecycleMachine, LifecycleState};
use crate::module::{PluginMessage, PluginModule};
use crate::rpc::client::SpawnOptions;
use crate::sandbox::{ResourceLimits, Sandbox, SandboxConfig, WorkerPool};
use events::{EVENT_CHANNEL_CAPACITY, EventForwarder};
use instance::InstanceDelegate;

const COMPONENT: &str = "plugin_manager";

/// Loads, supervises and tears down plugins.
///
/// Cheap to clone; clones share the same state. Construct one per
/// application and pass it to whatever needs it.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    instances: RwLock<HashMap<PluginId, Arc<ManagedPlugin>>>,
    graph: RwLock<DependencyGraph>,
    root: CancellationToken,
    pool: Option<WorkerPool>,
    events: broadcast::Sender<PluginEvent>,
    listeners: StdRwLock<Vec<Arc<dyn LifecycleListener>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.inner.config.plugins_dir)
            .field("stopped", &self.inner.root.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager. Nothing is loaded until asked.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if `config` fails
    /// [`ManagerConfig::validate`].
    pub fn new(config: ManagerConfig) -> PluginResult<Self> {
        config.validate()?;
        let root = CancellationToken::new();
        let pool = (config.worker_pool_size > 0)
            .then(|| WorkerPool::new(config.worker_pool_size, root.child_token()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                instances: RwLock::new(HashMap::new()),
                graph: RwLock::new(DependencyGraph::new()),
                root,
                pool,
                events,
                listeners: StdRwLock::new(Vec::new()),
                health_task: Mutex::new(None),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// The configuration the manager was built with.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Subscribe to plugin events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.inner.events.subscribe()
    }

    /// Attach a listener to every current and future lifecycle machine.
    pub async fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&listener));
        for instance in self.instances_snapshot().await {
            instance.lifecycle().add_listener(Arc::clone(&listener));
        }
    }

    // ── Dependency graph surface ────────────────────────────────────

    /// Register descriptor metadata without loading the plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyRegistered`] or
    /// [`PluginError::InvalidVersion`] from the graph.
    pub async fn register_descriptor(&self, descriptor: &PluginDescriptor) -> PluginResult<()> {
        self.inner.graph.write().await.register(
            descriptor.id.clone(),
            &descriptor.version,
            descriptor.dependencies.clone(),
        )
    }

    /// Unsatisfied required dependencies of a registered plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRegistered`] if `id` is unknown to the graph.
    pub async fn check_dependencies(&self, id: &PluginId) -> PluginResult<Vec<String>> {
        self.inner.graph.read().await.check_dependencies(id)
    }

    /// Load order of every registered plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CyclicDependency`] if the graph has a cycle.
    pub async fn dependency_order(&self) -> PluginResult<Vec<PluginId>> {
        self.inner.graph.read().await.dependency_order()
    }

    // ── Lifecycle operations ────────────────────────────────────────

    /// Load a plugin and, if the descriptor asks for it, start it in the
    /// background.
    ///
    /// A descriptor already registered through
    /// [`register_descriptor`](Self::register_descriptor) keeps its
    /// registration; otherwise it is registered here and unregistered again
    /// if loading fails.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Disabled`] for disabled descriptors.
    /// - [`PluginError::AlreadyLoaded`] if the ID is already loaded.
    /// - [`PluginError::ExecutableNotFound`] if no executable exists.
    /// - [`PluginError::DependencyUnsatisfied`] or
    ///   [`PluginError::CyclicDependency`] from the graph.
    pub async fn load_plugin(&self, descriptor: PluginDescriptor) -> PluginResult<Arc<ManagedPlugin>> {
        let auto_start = descriptor.auto_start;
        let instance = self.load_inner(descriptor).await?;
        if auto_start {
            self.spawn_start(instance.id().clone());
        }
        Ok(instance)
    }

    async fn load_inner(&self, descriptor: PluginDescriptor) -> PluginResult<Arc<ManagedPlugin>> {
        self.ensure_open()?;
        let id = descriptor.id.clone();
        if !descriptor.enabled {
            return Err(PluginError::Disabled(id));
        }
        if self.inner.instances.read().await.contains_key(&id) {
            return Err(PluginError::AlreadyLoaded(id));
        }

        let config = &self.inner.config;
        let executable = resolve_executable(&config.plugins_dir, &descriptor, config.search_path)?;
        let registered_here = self.admit_to_graph(&descriptor).await?;

        let instance = Arc::new(self.build_instance(descriptor, executable));
        let lifecycle = instance.lifecycle();
        let setup = async {
            lifecycle
                .transition_to(LifecycleState::Registered, BTreeMap::new())
                .await?;
            lifecycle
                .transition_to(LifecycleState::Loaded, BTreeMap::new())
                .await
        }
        .await;
        if let Err(e) = setup {
            if registered_here {
                self.forget(&id).await;
            }
            return Err(e);
        }

        {
            let mut instances = self.inner.instances.write().await;
            if instances.contains_key(&id) {
                drop(instances);
                if registered_here {
                    self.forget(&id).await;
                }
                return Err(PluginError::AlreadyLoaded(id));
            }
            instances.insert(id.clone(), Arc::clone(&instance));
        }

        info!(
            plugin_id = %id,
            executable = %instance.executable().display(),
            isolation = %instance.descriptor().isolation_level,
            "Plugin loaded"
        );
        self.emit(PluginEvent::Loaded { id });
        Ok(instance)
    }

    /// Start a loaded plugin.
    ///
    /// Required dependencies that are loaded but not running are started
    /// first, in dependency order. From `Stopped` or `Failed` the plugin
    /// process is re-initialised before it starts.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotLoaded`] / [`PluginError::AlreadyRunning`].
    /// - [`PluginError::DependencyUnsatisfied`] if a required dependency is
    ///   not loaded or fails to start.
    /// - Spawn, handshake or lifecycle errors. The plugin is then `Failed`
    ///   and its process terminated.
    pub async fn start_plugin(&self, id: &PluginId) -> PluginResult<()> {
        self.ensure_open()?;
        let instance = self.instance(id).await?;
        if instance.state() == LifecycleState::Running {
            return Err(PluginError::AlreadyRunning(id.clone()));
        }
        self.start_dependencies(id).await?;

        let _ops = instance.lock_ops().await;
        self.start_locked(&instance).await
    }

    /// Stop a running plugin. The plugin process stays connected so a
    /// later start reuses it.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotLoaded`] / [`PluginError::NotRunning`].
    /// - [`PluginError::HasDependents`] if running plugins require it, or
    ///   optionally use it under [`DependentPolicy::Block`].
    pub async fn stop_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let instance = self.instance(id).await?;
        if instance.state() != LifecycleState::Running {
            return Err(PluginError::NotRunning(id.clone()));
        }
        self.check_running_dependents(id).await?;

        let _ops = instance.lock_ops().await;
        if instance.state() != LifecycleState::Running {
            return Err(PluginError::NotRunning(id.clone()));
        }
        self.stop_locked(&instance).await
    }

    /// Stop then start a running plugin.
    ///
    /// Dependents are not consulted: they see the plugin again once the
    /// restart completes.
    ///
    /// # Errors
    ///
    /// Returns the failing half's error, [`PluginError::NotRunning`], or
    /// [`PluginError::InvalidState`] if a restart is already underway.
    pub async fn restart_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let instance = self.instance(id).await?;
        if !instance.begin_restart() {
            return Err(PluginError::InvalidState {
                id: id.clone(),
                message: "restart already in progress".into(),
            });
        }
        let result = self.restart_instance(&instance, false).await;
        instance.end_restart(result.is_ok());
        result
    }

    /// Stop if running, then tear the plugin down and forget it.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotLoaded`].
    /// - [`PluginError::HasDependents`] while registered plugins require
    ///   it, or optionally use it under [`DependentPolicy::Block`].
    pub async fn unload_plugin(&self, id: &PluginId) -> PluginResult<()> {
        let instance = self.instance(id).await?;
        let dependents = self.inner.graph.read().await.would_orphan(id);
        if !dependents.required.is_empty() {
            return Err(PluginError::HasDependents {
                id: id.clone(),
                dependents: dependents.required,
            });
        }
        self.apply_optional_policy(id, dependents.optional)?;

        let _ops = instance.lock_ops().await;
        if instance.state() == LifecycleState::Running
            && let Err(e) = self.stop_locked(&instance).await
        {
            warn!(plugin_id = %id, error = %e, "Stop failed during unload, continuing");
        }

        let lifecycle = instance.lifecycle();
        lifecycle
            .transition_to(LifecycleState::Unloading, BTreeMap::new())
            .await?;
        instance.disconnect().await;
        instance.sandbox().stop();
        lifecycle
            .transition_to(LifecycleState::Unloaded, BTreeMap::new())
            .await?;

        self.inner.instances.write().await.remove(id);
        self.forget(id).await;

        info!(plugin_id = %id, "Plugin unloaded");
        self.emit(PluginEvent::Unloaded { id: id.clone() });
        Ok(())
    }

    // ── Bulk operations ─────────────────────────────────────────────

    /// Load and start every enabled configured plugin in dependency order.
    ///
    /// All configured descriptors are validated against the graph before
    /// anything is loaded; a missing dependency or a cycle leaves the
    /// graph untouched.
    ///
    /// # Errors
    ///
    /// Returns the first validation, load or start failure.
    pub async fn start_all(&self) -> PluginResult<()> {
        self.ensure_open()?;
        let configured: BTreeMap<PluginId, PluginDescriptor> = self
            .inner
            .config
            .plugins
            .iter()
            .filter(|d| d.enabled)
            .map(|d| (d.id.clone(), d.clone()))
            .collect();

        let order = {
            let mut graph = self.inner.graph.write().await;
            let mut staged = graph.clone();
            for descriptor in configured.values() {
                if !staged.contains(&descriptor.id) {
                    staged.register(
                        descriptor.id.clone(),
                        &descriptor.version,
                        descriptor.dependencies.clone(),
                    )?;
                }
            }
            for id in configured.keys() {
                let missing = staged.check_dependencies(id)?;
                if !missing.is_empty() {
                    return Err(PluginError::DependencyUnsatisfied {
                        id: id.clone(),
                        missing,
                    });
                }
            }
            let order = staged.dependency_order()?;
            *graph = staged;
            order
        };

        info!(count = configured.len(), "Starting configured plugins");
        for id in order {
            let Some(descriptor) = configured.get(&id) else {
                continue;
            };
            let instance = match self.get_plugin(&id).await {
                Some(instance) => instance,
                None => self.load_inner(descriptor.clone()).await?,
            };
            let _ops = instance.lock_ops().await;
            if instance.state() != LifecycleState::Running {
                self.start_locked(&instance).await?;
            }
        }
        Ok(())
    }

    /// Stop every running plugin, dependents before their dependencies.
    ///
    /// Keeps going past failures.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure.
    pub async fn stop_all(&self) -> PluginResult<()> {
        let mut first_error = None;
        for instance in self.shutdown_order().await {
            let _ops = instance.lock_ops().await;
            if instance.state() != LifecycleState::Running {
                continue;
            }
            if let Err(e) = self.stop_locked(&instance).await {
                warn!(plugin_id = %instance.id(), error = %e, "Failed to stop plugin");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shut the manager down.
    ///
    /// Cancels the root scope (ending the health check, in-flight sandboxed
    /// calls and pending background starts), waits for background tasks,
    /// stops every running plugin in reverse dependency order and
    /// terminates all plugin processes. The manager cannot be reused
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns the first plugin stop failure; shutdown still completes.
    pub async fn stop(&self) -> PluginResult<()> {
        info!("Stopping plugin manager");
        self.inner.root.cancel();

        let health = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = health
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Health check task failed");
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let result = self.stop_all().await;
        let instances = self.instances_snapshot().await;
        futures::future::join_all(instances.iter().map(|instance| instance.disconnect())).await;
        if let Some(pool) = &self.inner.pool {
            pool.close();
        }

        info!("Plugin manager stopped");
        result
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// Run `work` against a plugin through its sandbox.
    ///
    /// # Errors
    ///
    /// See [`execute_plugin_func_with_context`](Self::execute_plugin_func_with_context).
    pub async fn execute_plugin_func<F, Fut, T>(&self, id: &PluginId, work: F) -> PluginResult<T>
    where
        F: FnOnce(Arc<dyn PluginModule>) -> Fut + Send,
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_plugin_func_with_context(id, &CancellationToken::new(), move |module, _| {
            work(module)
        })
        .await
    }

    /// Run `work` against a plugin through its sandbox, abandoning it when
    /// `cancel` fires.
    ///
    /// `work` receives the plugin's call surface and the call's own
    /// cancellation token. A plugin paused by the idle check is resumed
    /// first.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] if `id` is not loaded.
    /// - [`PluginError::NotRunning`] unless the plugin is running.
    /// - Sandbox failures ([`PluginError::Timeout`],
    ///   [`PluginError::Critical`], [`PluginError::Cancelled`], ...) or
    ///   the error returned by `work`.
    pub async fn execute_plugin_func_with_context<F, Fut, T>(
        &self,
        id: &PluginId,
        cancel: &CancellationToken,
        work: F,
    ) -> PluginResult<T>
    where
        F: FnOnce(Arc<dyn PluginModule>, CancellationToken) -> Fut + Send,
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let instance = self
            .get_plugin(id)
            .await
            .ok_or_else(|| PluginError::NotFound(id.clone()))?;
        if instance.state() != LifecycleState::Running {
            return Err(PluginError::NotRunning(id.clone()));
        }
        if instance.is_paused() {
            self.resume(&instance);
        }
        let module = instance
            .module()
            .ok_or_else(|| PluginError::NotRunning(id.clone()))?;

        let context = RequestContext::new(COMPONENT).with_operation("execute");
        let _guard = context.guard();
        let result = instance
            .sandbox()
            .execute_with_cancel(cancel, move |token| work(module, token))
            .instrument(context.span())
            .await;

        if let Err(e) = &result
            && matches!(
                e,
                PluginError::Critical { .. }
                    | PluginError::Timeout(_)
                    | PluginError::ConnectionFailure(_)
            )
        {
            instance.record_error(e);
        }
        result
    }

    /// Invoke `action` on a plugin.
    ///
    /// # Errors
    ///
    /// See [`execute_plugin_func`](Self::execute_plugin_func).
    pub async fn execute(&self, id: &PluginId, action: &str, params: Value) -> PluginResult<Value> {
        let action = action.to_string();
        self.execute_plugin_func(id, move |module| async move {
            module.execute(&action, params).await
        })
        .await
    }

    /// Deliver a message to a plugin.
    ///
    /// # Errors
    ///
    /// See [`execute_plugin_func`](Self::execute_plugin_func).
    pub async fn send_message(&self, id: &PluginId, message: PluginMessage) -> PluginResult<Value> {
        self.execute_plugin_func(id, move |module| async move {
            module.handle_message(message).await
        })
        .await
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// IDs of loaded plugins, ascending.
    pub async fn list_plugins(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.inner.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A loaded plugin.
    pub async fn get_plugin(&self, id: &PluginId) -> Option<Arc<ManagedPlugin>> {
        self.inner.instances.read().await.get(id).cloned()
    }

    /// Status snapshot of a loaded plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if `id` is not loaded.
    pub async fn get_plugin_status(&self, id: &PluginId) -> PluginResult<PluginStatus> {
        self.get_plugin(id)
            .await
            .map(|instance| instance.status())
            .ok_or_else(|| PluginError::NotFound(id.clone()))
    }

    /// Status snapshots of every loaded plugin, ascending by ID.
    pub async fn statuses(&self) -> Vec<PluginStatus> {
        let mut statuses: Vec<PluginStatus> = self
            .instances_snapshot()
            .await
            .iter()
            .map(|instance| instance.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    // ── Internals ───────────────────────────────────────────────────

    fn ensure_open(&self) -> PluginResult<()> {
        if self.inner.root.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, event: PluginEvent) {
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }

    async fn instance(&self, id: &PluginId) -> PluginResult<Arc<ManagedPlugin>> {
        self.get_plugin(id)
            .await
            .ok_or_else(|| PluginError::NotLoaded(id.clone()))
    }

    async fn instances_snapshot(&self) -> Vec<Arc<ManagedPlugin>> {
        self.inner.instances.read().await.values().cloned().collect()
    }

    /// Running dependents ordered before their dependencies, then anything
    /// the graph does not know about.
    async fn shutdown_order(&self) -> Vec<Arc<ManagedPlugin>> {
        let mut remaining: BTreeMap<PluginId, Arc<ManagedPlugin>> = self
            .instances_snapshot()
            .await
            .into_iter()
            .map(|instance| (instance.id().clone(), instance))
            .collect();
        let order = match self.inner.graph.read().await.unload_order() {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "No valid unload order, stopping in ID order");
                Vec::new()
            },
        };

        let mut ordered: Vec<Arc<ManagedPlugin>> = order
            .iter()
            .filter_map(|id| remaining.remove(id))
            .collect();
        ordered.extend(remaining.into_values());
        ordered
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn build_instance(&self, descriptor: PluginDescriptor, executable: std::path::PathBuf) -> ManagedPlugin {
        let config = &self.inner.config;
        let id = descriptor.id.clone();
        let sandbox_config = SandboxConfig::new(descriptor.isolation_level)
            .with_timeout(config.sandbox_timeout)
            .with_limits(ResourceLimits {
                max_concurrent_calls: config.max_concurrent_calls,
            });
        let sandbox = Arc::new(Sandbox::new(
            id.clone(),
            sandbox_config,
            self.inner.pool.clone(),
            &self.inner.root,
        ));

        let lifecycle = Arc::new(LifecycleMachine::new(id));
        lifecycle.add_listener(Arc::new(EventForwarder::new(self.inner.events.clone())));
        for listener in self.listeners_snapshot() {
            lifecycle.add_listener(listener);
        }

        ManagedPlugin::new(descriptor, executable, sandbox, lifecycle)
    }

    fn spawn_options(&self, instance: &ManagedPlugin) -> SpawnOptions {
        let config = &self.inner.config;
        let options = SpawnOptions::default()
            .with_connect_timeout(config.connect_timeout)
            .with_call_timeout(config.call_timeout)
            .with_cancel(self.inner.root.clone());
        match instance.executable().parent() {
            Some(dir) if !dir.as_os_str().is_empty() => options.with_working_dir(dir),
            _ => options,
        }
    }

    /// Register `descriptor` if needed and verify its dependencies. Returns
    /// whether this call did the registration.
    async fn admit_to_graph(&self, descriptor: &PluginDescriptor) -> PluginResult<bool> {
        let mut graph = self.inner.graph.write().await;
        let registered_here = !graph.contains(&descriptor.id);
        if registered_here {
            graph.register(
                descriptor.id.clone(),
                &descriptor.version,
                descriptor.dependencies.clone(),
            )?;
        }

        let verdict = graph.check_dependencies(&descriptor.id).and_then(|missing| {
            if missing.is_empty() {
                graph.dependency_order().map(drop)
            } else {
                Err(PluginError::DependencyUnsatisfied {
                    id: descriptor.id.clone(),
                    missing,
                })
            }
        });
        if let Err(e) = verdict {
            if registered_here {
                let _ = graph.unregister(&descriptor.id);
            }
            return Err(e);
        }
        Ok(registered_here)
    }

    async fn forget(&self, id: &PluginId) {
        if let Err(e) = self.inner.graph.write().await.unregister(id) {
            debug!(plugin_id = %id, error = %e, "Plugin metadata already gone");
        }
    }

    fn spawn_start(&self, id: PluginId) {
        let manager = self.clone();
        self.inner.tracker.spawn(async move {
            if manager.inner.root.is_cancelled() {
                return;
            }
            if let Err(e) = manager.start_plugin(&id).await {
                warn!(plugin_id = %id, error = %e, "Auto-start failed");
            }
        });
    }

    async fn start_dependencies(&self, id: &PluginId) -> PluginResult<()> {
        let chain = self.inner.graph.read().await.required_closure(id)?;
        for dep_id in chain {
            let Some(dependency) = self.get_plugin(&dep_id).await else {
                return Err(PluginError::DependencyUnsatisfied {
                    id: id.clone(),
                    missing: vec![format!("{dep_id} (not loaded)")],
                });
            };

            let _ops = dependency.lock_ops().await;
            if dependency.state() == LifecycleState::Running {
                continue;
            }
            info!(plugin_id = %id, dependency = %dep_id, "Starting required dependency");
            if let Err(e) = self.start_locked(&dependency).await {
                return Err(PluginError::DependencyUnsatisfied {
                    id: id.clone(),
                    missing: vec![format!("{dep_id} ({e})")],
                });
            }
        }
        Ok(())
    }

    /// Caller holds the instance's operation lock.
    async fn start_locked(&self, instance: &ManagedPlugin) -> PluginResult<()> {
        let id = instance.id();
        let options = self.spawn_options(instance);
        let lifecycle = instance.lifecycle();

        let result = match instance.state() {
            LifecycleState::Running => return Err(PluginError::AlreadyRunning(id.clone())),
            LifecycleState::Loaded => {
                let delegate = InstanceDelegate::new(instance, &options, false);
                async {
                    lifecycle.init(&delegate).await?;
                    lifecycle.start(&delegate).await
                }
                .await
            },
            LifecycleState::Initialized => {
                lifecycle
                    .start(&InstanceDelegate::new(instance, &options, false))
                    .await
            },
            LifecycleState::Stopped | LifecycleState::Failed => {
                lifecycle
                    .start(&InstanceDelegate::new(instance, &options, true))
                    .await
            },
            other => {
                return Err(PluginError::InvalidState {
                    id: id.clone(),
                    message: format!("cannot start from {other}"),
                });
            },
        };

        match result {
            Ok(()) => {
                instance.sandbox().activate();
                instance.mark_started();
                info!(plugin_id = %id, pid = ?instance.status().pid, "Plugin running");
                self.emit(PluginEvent::Started { id: id.clone() });
                Ok(())
            },
            Err(e) => {
                instance.disconnect().await;
                instance.record_error(&e);
                warn!(plugin_id = %id, error = %e, "Plugin failed to start");
                self.emit(PluginEvent::Failed {
                    id: id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            },
        }
    }

    /// Caller holds the instance's operation lock.
    async fn stop_locked(&self, instance: &ManagedPlugin) -> PluginResult<()> {
        let id = instance.id();
        let options = self.spawn_options(instance);
        instance.sandbox().stop();
        let result = instance
            .lifecycle()
            .stop(&InstanceDelegate::new(instance, &options, false))
            .await;
        instance.mark_stopped();

        match result {
            Ok(()) => {
                info!(plugin_id = %id, "Plugin stopped");
                self.emit(PluginEvent::Stopped { id: id.clone() });
                Ok(())
            },
            Err(e) => {
                instance.record_error(&e);
                warn!(plugin_id = %id, error = %e, "Plugin failed to stop cleanly");
                self.emit(PluginEvent::Failed {
                    id: id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            },
        }
    }

    async fn restart_instance(&self, instance: &ManagedPlugin, reset_stats: bool) -> PluginResult<()> {
        let id = instance.id();
        let _ops = instance.lock_ops().await;
        if instance.state() != LifecycleState::Running {
            return Err(PluginError::NotRunning(id.clone()));
        }
        self.stop_locked(instance).await?;
        if reset_stats {
            instance.sandbox().reset();
        }
        self.start_locked(instance).await?;

        info!(plugin_id = %id, "Plugin restarted");
        self.emit(PluginEvent::Restarted { id: id.clone() });
        Ok(())
    }

    async fn check_running_dependents(&self, id: &PluginId) -> PluginResult<()> {
        let dependents = self.inner.graph.read().await.would_orphan(id);
        let (required, optional) = {
            let instances = self.inner.instances.read().await;
            let running = |ids: Vec<PluginId>| -> Vec<PluginId> {
                ids.into_iter()
                    .filter(|dep| {
                        instances
                            .get(dep)
                            .is_some_and(|i| i.state() == LifecycleState::Running)
                    })
                    .collect()
            };
            (running(dependents.required), running(dependents.optional))
        };

        if !required.is_empty() {
            return Err(PluginError::HasDependents {
                id: id.clone(),
                dependents: required,
            });
        }
        self.apply_optional_policy(id, optional)
    }

    fn apply_optional_policy(&self, id: &PluginId, optional: Vec<PluginId>) -> PluginResult<()> {
        if optional.is_empty() {
            return Ok(());
        }
        match self.inner.config.optional_dependents {
            DependentPolicy::Block => Err(PluginError::HasDependents {
                id: id.clone(),
                dependents: optional,
            }),
            DependentPolicy::Warn => {
                warn!(plugin_id = %id, dependents = ?optional, "Optional dependents will lose this plugin");
                Ok(())
            },
        }
    }

    fn resume(&self, instance: &ManagedPlugin) {
        match instance.sandbox().resume() {
            Ok(()) => {
                instance.set_paused(false);
                info!(plugin_id = %instance.id(), "Plugin resumed");
                self.emit(PluginEvent::Resumed {
                    id: instance.id().clone(),
                });
            },
            Err(e) => debug!(plugin_id = %instance.id(), error = %e, "Resume skipped"),
        }
    }
}
