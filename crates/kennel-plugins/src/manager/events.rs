//! Manager event stream.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::descriptor::PluginId;
use crate::error::PluginResult;
use crate::lifecycle::{LifecycleListener, LifecycleState, TransitionEvent};

/// Capacity of the manager's broadcast channel. Slow subscribers lag and
/// lose the oldest events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened to a managed plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PluginEvent {
    /// Instance created and registered.
    Loaded {
        /// Plugin ID.
        id: PluginId,
    },
    /// Reached `Running`.
    Started {
        /// Plugin ID.
        id: PluginId,
    },
    /// Reached `Stopped`.
    Stopped {
        /// Plugin ID.
        id: PluginId,
    },
    /// Completed a stop/start cycle.
    Restarted {
        /// Plugin ID.
        id: PluginId,
    },
    /// Parked by the idle check.
    Paused {
        /// Plugin ID.
        id: PluginId,
    },
    /// Woken by a call after an idle pause.
    Resumed {
        /// Plugin ID.
        id: PluginId,
    },
    /// Instance removed.
    Unloaded {
        /// Plugin ID.
        id: PluginId,
    },
    /// A lifecycle operation failed.
    Failed {
        /// Plugin ID.
        id: PluginId,
        /// Failure message.
        error: String,
    },
    /// The lifecycle machine changed state.
    StateChanged {
        /// Plugin ID.
        id: PluginId,
        /// Previous state.
        from: LifecycleState,
        /// New state.
        to: LifecycleState,
    },
}

impl PluginEvent {
    /// The plugin the event concerns.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        match self {
            Self::Loaded { id }
            | Self::Started { id }
            | Self::Stopped { id }
            | Self::Restarted { id }
            | Self::Paused { id }
            | Self::Resumed { id }
            | Self::Unloaded { id }
            | Self::Failed { id, .. }
            | Self::StateChanged { id, .. } => id,
        }
    }
}

/// Republishes lifecycle transitions as [`PluginEvent::StateChanged`].
pub(crate) struct EventForwarder {
    events: broadcast::Sender<PluginEvent>,
}

impl EventForwarder {
    pub(crate) fn new(events: broadcast::Sender<PluginEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl LifecycleListener for EventForwarder {
    async fn on_transition(&self, event: &TransitionEvent) -> PluginResult<()> {
        // No subscribers is not an error.
        let _ = self.events.send(PluginEvent::StateChanged {
            id: event.plugin_id.clone(),
            from: event.from,
            to: event.to,
        });
        Ok(())
    }
}
