//! Per-instance lifecycle state machine.
//!
//! The machine enforces a fixed transition table and wraps the plugin's
//! own `init`/`start`/`stop` (reached through a [`PluginDelegate`]) with
//! before/after hooks. Transitions of one machine are strictly sequential.
//! Listeners are notified on spawned tasks and cannot affect the outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};

use crate::descriptor::PluginId;
use crate::error::{PluginError, PluginResult};

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing known yet.
    Unknown,
    /// Found by discovery.
    Discovered,
    /// Metadata registered.
    Registered,
    /// Instance created by the manager.
    Loaded,
    /// Plugin `init` in progress.
    Initializing,
    /// Plugin initialised.
    Initialized,
    /// Plugin start in progress.
    Starting,
    /// Serving calls.
    Running,
    /// Plugin stop in progress.
    Stopping,
    /// Stopped; may be started again.
    Stopped,
    /// A lifecycle step failed.
    Failed,
    /// Teardown in progress.
    Unloading,
    /// Torn down.
    Unloaded,
}

impl LifecycleState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Unknown,
        Self::Discovered,
        Self::Registered,
        Self::Loaded,
        Self::Initializing,
        Self::Initialized,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
        Self::Unloading,
        Self::Unloaded,
    ];

    /// States reachable from this one in a single step.
    #[must_use]
    pub fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Unknown => &[Self::Discovered, Self::Registered],
            Self::Discovered => &[Self::Registered, Self::Unloaded],
            Self::Registered => &[Self::Loaded, Self::Unloaded],
            Self::Loaded => &[Self::Initializing, Self::Unloading, Self::Failed],
            Self::Initializing => &[Self::Initialized, Self::Failed],
            Self::Initialized => &[Self::Starting, Self::Unloading, Self::Failed],
            Self::Starting => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Stopping, Self::Failed],
            Self::Stopping => &[Self::Stopped, Self::Failed],
            Self::Stopped => &[Self::Starting, Self::Unloading],
            Self::Failed => &[Self::Unloading, Self::Starting],
            Self::Unloading => &[Self::Unloaded],
            Self::Unloaded => &[Self::Registered],
        }
    }

    /// Whether `to` is reachable in one step.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Discovered => "discovered",
            Self::Registered => "registered",
            Self::Loaded => "loaded",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operation a hook runs around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Plugin initialisation.
    Init,
    /// Plugin start.
    Start,
    /// Plugin stop.
    Stop,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// A completed state change.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    /// Plugin whose machine changed.
    pub plugin_id: PluginId,
    /// Previous state.
    pub from: LifecycleState,
    /// New state.
    pub to: LifecycleState,
    /// Context such as `error` and `phase` for failures.
    pub metadata: BTreeMap<String, String>,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// Observer of state changes.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// Called after each transition, in transition order, on a task that
    /// is not the one changing state. Errors are logged.
    async fn on_transition(&self, event: &TransitionEvent) -> PluginResult<()>;
}

/// Hooks run around the delegate call of each lifecycle operation.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs before the delegate. An error fails the operation.
    async fn before(&self, _plugin_id: &PluginId, _phase: Phase) -> PluginResult<()> {
        Ok(())
    }

    /// Runs after the delegate. An error fails `init` and `start`; during
    /// `stop` it is logged only.
    async fn after(&self, _plugin_id: &PluginId, _phase: Phase) -> PluginResult<()> {
        Ok(())
    }
}

/// The plugin's own lifecycle methods.
#[async_trait]
pub trait PluginDelegate: Send + Sync {
    /// Initialise the plugin.
    async fn init(&self) -> PluginResult<()>;
    /// Start the plugin.
    async fn start(&self) -> PluginResult<()>;
    /// Stop the plugin.
    async fn stop(&self) -> PluginResult<()>;
}

/// A listener with the queue that feeds it.
struct ListenerSlot {
    listener: Arc<dyn LifecycleListener>,
    queue: StdMutex<Option<mpsc::UnboundedSender<Arc<TransitionEvent>>>>,
}

impl ListenerSlot {
    fn new(listener: Arc<dyn LifecycleListener>) -> Self {
        Self {
            listener,
            queue: StdMutex::new(None),
        }
    }

    /// Queue `event`, starting the delivery task on first use or after
    /// the previous one died.
    fn deliver(&self, event: &Arc<TransitionEvent>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = queue.as_ref()
            && tx.send(Arc::clone(event)).is_ok()
        {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(Arc::clone(&self.listener), rx));
        // The receiver was just created and is alive.
        let _ = tx.send(Arc::clone(event));
        *queue = Some(tx);
    }
}

async fn drain(
    listener: Arc<dyn LifecycleListener>,
    mut rx: mpsc::UnboundedReceiver<Arc<TransitionEvent>>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = listener.on_transition(&event).await {
            warn!(
                plugin_id = %event.plugin_id,
                from = %event.from,
                to = %event.to,
                error = %e,
                "Lifecycle listener failed"
            );
        }
    }
}

/// Finite-state controller for one plugin instance.
pub struct LifecycleMachine {
    plugin_id: PluginId,
    state: RwLock<LifecycleState>,
    serial: Mutex<()>,
    hooks: RwLock<Vec<Arc<dyn LifecycleHooks>>>,
    listeners: RwLock<Vec<Arc<ListenerSlot>>>,
}

impl fmt::Debug for LifecycleMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleMachine")
            .field("plugin_id", &self.plugin_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LifecycleMachine {
    /// Create a machine in the `Unknown` state.
    #[must_use]
    pub fn new(plugin_id: PluginId) -> Self {
        Self::with_initial_state(plugin_id, LifecycleState::Unknown)
    }

    /// Create a machine in an arbitrary state.
    #[must_use]
    pub fn with_initial_state(plugin_id: PluginId, state: LifecycleState) -> Self {
        Self {
            plugin_id,
            state: RwLock::new(state),
            serial: Mutex::new(()),
            hooks: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The plugin this machine belongs to.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register hooks, run in registration order.
    pub fn add_hooks(&self, hooks: Arc<dyn LifecycleHooks>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hooks);
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(ListenerSlot::new(listener)));
    }

    /// Move to `to` if the table allows it.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidTransition`] and leaves the state
    /// unchanged if the transition is not in the table.
    pub async fn transition_to(
        &self,
        to: LifecycleState,
        metadata: BTreeMap<String, String>,
    ) -> PluginResult<()> {
        let _serial = self.serial.lock().await;
        self.apply(to, metadata)
    }

    /// `Loaded -> Initializing -> Initialized`, calling the delegate's
    /// `init` between the hooks.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidTransition`] if not `Loaded`, or the
    /// hook/delegate error after moving to `Failed`.
    pub async fn init(&self, delegate: &dyn PluginDelegate) -> PluginResult<()> {
        let _serial = self.serial.lock().await;
        self.apply(LifecycleState::Initializing, BTreeMap::new())?;
        self.run_phase(Phase::Init, delegate).await?;
        self.apply(LifecycleState::Initialized, BTreeMap::new())?;
        self.after_hooks(Phase::Init).await
    }

    /// `Starting -> Running` from `Initialized`, `Stopped` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidTransition`] from other states, or the
    /// hook/delegate error after moving to `Failed`.
    pub async fn start(&self, delegate: &dyn PluginDelegate) -> PluginResult<()> {
        let _serial = self.serial.lock().await;
        self.apply(LifecycleState::Starting, BTreeMap::new())?;
        self.run_phase(Phase::Start, delegate).await?;
        self.apply(LifecycleState::Running, BTreeMap::new())?;
        self.after_hooks(Phase::Start).await
    }

    /// `Stopping -> Stopped` from `Running`.
    ///
    /// A failing after-hook is logged and the machine still reaches
    /// `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidTransition`] if not `Running`, or the
    /// before-hook/delegate error after moving to `Failed`.
    pub async fn stop(&self, delegate: &dyn PluginDelegate) -> PluginResult<()> {
        let _serial = self.serial.lock().await;
        self.apply(LifecycleState::Stopping, BTreeMap::new())?;
        self.run_phase(Phase::Stop, delegate).await?;
        self.apply(LifecycleState::Stopped, BTreeMap::new())?;

        for hooks in self.hooks_snapshot() {
            if let Err(e) = hooks.after(&self.plugin_id, Phase::Stop).await {
                warn!(plugin_id = %self.plugin_id, error = %e, "after_stop hook failed");
            }
        }
        Ok(())
    }

    /// Before hooks then the delegate call, failing the machine on error.
    async fn run_phase(&self, phase: Phase, delegate: &dyn PluginDelegate) -> PluginResult<()> {
        for hooks in self.hooks_snapshot() {
            if let Err(e) = hooks.before(&self.plugin_id, phase).await {
                self.fail(phase, &format!("before_{}", phase.as_str()), &e);
                return Err(e);
            }
        }

        let outcome = match phase {
            Phase::Init => delegate.init().await,
            Phase::Start => delegate.start().await,
            Phase::Stop => delegate.stop().await,
        };
        if let Err(e) = outcome {
            self.fail(phase, "call", &e);
            return Err(e);
        }
        Ok(())
    }

    async fn after_hooks(&self, phase: Phase) -> PluginResult<()> {
        for hooks in self.hooks_snapshot() {
            if let Err(e) = hooks.after(&self.plugin_id, phase).await {
                self.fail(phase, &format!("after_{}", phase.as_str()), &e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn fail(&self, operation: Phase, phase: &str, error: &PluginError) {
        let metadata = BTreeMap::from([
            ("error".to_string(), error.to_string()),
            ("phase".to_string(), phase.to_string()),
            ("operation".to_string(), operation.as_str().to_string()),
        ]);
        if let Err(e) = self.apply(LifecycleState::Failed, metadata) {
            error!(plugin_id = %self.plugin_id, error = %e, "Could not record lifecycle failure");
        }
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn LifecycleHooks>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, to: LifecycleState, metadata: BTreeMap<String, String>) -> PluginResult<()> {
        let from = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(PluginError::InvalidTransition { from, to });
            }
            *state = to;
            from
        };
        debug!(plugin_id = %self.plugin_id, %from, %to, "Lifecycle transition");
        self.notify(from, to, metadata);
        Ok(())
    }

    fn notify(&self, from: LifecycleState, to: LifecycleState, metadata: BTreeMap<String, String>) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if listeners.is_empty() {
            return;
        }

        let event = Arc::new(TransitionEvent {
            plugin_id: self.plugin_id.clone(),
            from,
            to,
            metadata,
            at: Utc::now(),
        });
        for slot in listeners {
            slot.deliver(&event);
        }
    }
}
