//! Per-sandbox call statistics.

use std::time::Duration;

use serde::Serialize;

use crate::error::{PluginError, PluginResult};

/// Snapshot of a sandbox's call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SandboxStats {
    /// Calls admitted, including those rejected by resource policy.
    pub total_calls: u64,
    /// Calls that returned `Ok`.
    pub successful_calls: u64,
    /// Calls that returned an error of any kind.
    pub failed_calls: u64,
    /// Calls abandoned at the deadline.
    pub timeouts: u64,
    /// Contained panics.
    pub panics: u64,
    /// Calls rejected by resource limits.
    pub resource_violations: u64,
    /// Calls abandoned because their scope was cancelled.
    pub cancelled: u64,
    /// Sum of execution times of completed calls.
    pub total_execution_time: Duration,
    /// Fastest completed call.
    pub min_execution_time: Option<Duration>,
    /// Slowest completed call.
    pub max_execution_time: Duration,
}

impl SandboxStats {
    /// Mean execution time of completed calls. Calls rejected by resource
    /// limits never ran and are left out.
    #[must_use]
    pub fn average_execution_time(&self) -> Duration {
        let completed = self
            .successful_calls
            .saturating_add(self.failed_calls)
            .saturating_sub(self.resource_violations);
        let completed = u32::try_from(completed).unwrap_or(u32::MAX);
        self.total_execution_time
            .checked_div(completed)
            .unwrap_or_default()
    }

    /// Share of admitted calls that failed, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // counters far below 2^52 in practice
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.failed_calls as f64 / self.total_calls as f64
    }

    pub(crate) fn begin_call(&mut self) {
        self.total_calls = self.total_calls.saturating_add(1);
    }

    pub(crate) fn record_violation(&mut self) {
        self.total_calls = self.total_calls.saturating_add(1);
        self.failed_calls = self.failed_calls.saturating_add(1);
        self.resource_violations = self.resource_violations.saturating_add(1);
    }

    pub(crate) fn record<T>(&mut self, elapsed: Duration, result: &PluginResult<T>) {
        match result {
            Ok(_) => self.successful_calls = self.successful_calls.saturating_add(1),
            Err(err) => {
                self.failed_calls = self.failed_calls.saturating_add(1);
                match err {
                    PluginError::Timeout(_) => self.timeouts = self.timeouts.saturating_add(1),
                    PluginError::Critical { .. } => self.panics = self.panics.saturating_add(1),
                    PluginError::Cancelled => self.cancelled = self.cancelled.saturating_add(1),
                    _ => {},
                }
            },
        }

        self.total_execution_time = self.total_execution_time.saturating_add(elapsed);
        self.max_execution_time = self.max_execution_time.max(elapsed);
        self.min_execution_time = Some(
            self.min_execution_time
                .map_or(elapsed, |current| current.min(elapsed)),
        );
    }
}
