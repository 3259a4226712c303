//! Periodic health supervision.

use std::sync::{Arc, PoisonError};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{PluginEvent, PluginManager};
use crate::lifecycle::LifecycleState;

impl PluginManager {
    /// Launch the health check loop.
    ///
    /// Every `health_check_interval` the loop runs
    /// [`check_health`](Self::check_health). It ends when the manager is
    /// stopped. Calling this again while the loop runs does nothing.
    pub fn start_health_check(&self) {
        let mut slot = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Health check already running");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.root.clone();
        let period = self.inner.config.health_check_interval;
        info!(interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX), "Starting health check");

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PluginManager { inner }.check_health().await;
            }
            debug!("Health check loop exited");
        }));
    }

    /// Run one health check pass over every running plugin.
    ///
    /// An unhealthy plugin with `auto_restart` is restarted in the
    /// background with fresh sandbox statistics. A healthy plugin idle for
    /// longer than `idle_timeout` is paused; its next call resumes it.
    pub async fn check_health(&self) {
        let idle_timeout = self.inner.config.idle_timeout;

        for instance in self.instances_snapshot().await {
            if instance.state() != LifecycleState::Running || instance.is_paused() {
                continue;
            }
            let id = instance.id().clone();

            if !instance.is_healthy() {
                let stats = instance.sandbox().stats();
                warn!(
                    plugin_id = %id,
                    sandbox_state = %instance.sandbox().state(),
                    failed_calls = stats.failed_calls,
                    panics = stats.panics,
                    "Plugin unhealthy"
                );
                if instance.descriptor().auto_restart && instance.begin_restart() {
                    let manager = self.clone();
                    self.inner.tracker.spawn(async move {
                        if manager.inner.root.is_cancelled() {
                            instance.end_restart(false);
                            return;
                        }
                        let result = manager.restart_instance(&instance, true).await;
                        instance.end_restart(result.is_ok());
                        match result {
                            Ok(()) => info!(plugin_id = %id, "Unhealthy plugin restarted"),
                            Err(e) => warn!(plugin_id = %id, error = %e, "Automatic restart failed"),
                        }
                    });
                }
                continue;
            }

            if !idle_timeout.is_zero() && instance.sandbox().is_idle(idle_timeout) {
                match instance.sandbox().pause() {
                    Ok(()) => {
                        instance.set_paused(true);
                        info!(plugin_id = %id, "Idle plugin paused");
                        self.emit(PluginEvent::Paused { id });
                    },
                    Err(e) => debug!(plugin_id = %id, error = %e, "Idle pause skipped"),
                }
            }
        }
    }
}
