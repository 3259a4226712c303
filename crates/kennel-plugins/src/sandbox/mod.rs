//! Isolation executor.
//!
//! A [`Sandbox`] runs units of plugin work under the plugin's
//! [`IsolationLevel`] and always hands back either the work's result or a
//! classified failure:
//!
//! - `None` awaits the work in place.
//! - `Basic` spawns the work as its own task with a deadline. A panic is
//!   caught at the task boundary and returned as
//!   [`PluginError::Critical`].
//! - `Strict` does the same through a bounded [`WorkerPool`], falling back
//!   to `Basic` when the sandbox has no pool.
//! - `Complete` is reserved for process-per-call isolation and runs as
//!   `Basic`.
//!
//! Cancellation is cooperative. Each call receives a
//! [`CancellationToken`] that is cancelled when the call is abandoned
//! (deadline, sandbox stop, caller cancellation). Work that ignores the
//! token keeps running detached until it finishes on its own.

pub(crate) mod fault;
mod pool;
mod stats;

pub use fault::Fault;
pub use pool::WorkerPool;
pub use stats::SandboxStats;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::descriptor::{IsolationLevel, PluginId};
use crate::error::{PluginError, PluginResult};
use fault::{CatchFault, payload_message};

/// Default deadline for an isolated call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_FAILURE_RATE: f64 = 0.5;
const MIN_CALLS_FOR_RATE: u64 = 10;
const MAX_PANICS: u64 = 5;

/// Operational state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Created, plugin not yet running. Calls are accepted.
    Initializing,
    /// Accepting calls.
    Running,
    /// Parked by the idle check. Calls are rejected until resumed.
    Paused,
    /// Stopped; in-flight calls have been cancelled.
    Stopped,
    /// A contained panic occurred. Calls are rejected until reset.
    Error,
}

impl SandboxState {
    /// Whether calls are admitted in this state.
    #[must_use]
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Running | Self::Initializing)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        })
    }
}

/// Resource policy for a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum calls in flight at once. `0` means unlimited.
    #[serde(default)]
    pub max_concurrent_calls: usize,
}

/// Sandbox settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Requested isolation level.
    pub level: IsolationLevel,
    /// Deadline for each contained call.
    pub timeout: Duration,
    /// Resource policy.
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(IsolationLevel::Basic)
    }
}

impl SandboxConfig {
    /// Settings for `level` with the default deadline and no limits.
    #[must_use]
    pub fn new(level: IsolationLevel) -> Self {
        Self {
            level,
            timeout: DEFAULT_TIMEOUT,
            limits: ResourceLimits::default(),
        }
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the resource policy.
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

struct SlotGuard<'a>(&'a AtomicUsize);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-plugin executor enforcing an isolation level and keeping call
/// statistics.
pub struct Sandbox {
    plugin_id: PluginId,
    config: SandboxConfig,
    pool: Option<WorkerPool>,
    parent: CancellationToken,
    scope: Mutex<CancellationToken>,
    state: Mutex<SandboxState>,
    stats: Mutex<SandboxStats>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin_id", &self.plugin_id)
            .field("level", &self.config.level)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox whose cancellation scope is a child of `parent`.
    #[must_use]
    pub fn new(
        plugin_id: PluginId,
        config: SandboxConfig,
        pool: Option<WorkerPool>,
        parent: &CancellationToken,
    ) -> Self {
        match config.level {
            IsolationLevel::Complete => warn!(
                plugin_id = %plugin_id,
                "Complete isolation is not implemented, running with basic isolation"
            ),
            IsolationLevel::Strict if pool.is_none() => debug!(
                plugin_id = %plugin_id,
                "No worker pool configured, strict isolation runs as basic"
            ),
            _ => {},
        }

        Self {
            plugin_id,
            config,
            pool,
            parent: parent.clone(),
            scope: Mutex::new(parent.child_token()),
            state: Mutex::new(SandboxState::Initializing),
            stats: Mutex::new(SandboxStats::default()),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// The plugin this sandbox serves.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// The sandbox settings.
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Isolation actually applied after fallbacks.
    #[must_use]
    pub fn effective_level(&self) -> IsolationLevel {
        match self.config.level {
            IsolationLevel::Strict if self.pool.is_none() => IsolationLevel::Basic,
            IsolationLevel::Complete => IsolationLevel::Basic,
            level => level,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        *lock(&self.state)
    }

    /// Consistent snapshot of the call statistics.
    #[must_use]
    pub fn stats(&self) -> SandboxStats {
        lock(&self.stats).clone()
    }

    /// Calls currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Time since the last call started or finished.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// Whether no call has started or finished within `threshold`.
    #[must_use]
    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.in_flight() == 0 && self.idle_for() > threshold
    }

    /// Whether the sandbox accepts calls and its failure profile is
    /// acceptable.
    ///
    /// Unhealthy when more than half of at least ten calls failed, or when
    /// five or more panics were contained.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if !self.state().accepts_calls() {
            return false;
        }
        let stats = self.stats();
        let failing = stats.total_calls >= MIN_CALLS_FOR_RATE
            && stats.failure_rate() > MAX_FAILURE_RATE;
        stats.panics < MAX_PANICS && !failing
    }

    /// Enter the running state, opening a fresh scope if the previous one
    /// was cancelled.
    pub fn activate(&self) {
        {
            let mut scope = lock(&self.scope);
            if scope.is_cancelled() {
                *scope = self.parent.child_token();
            }
        }
        *lock(&self.state) = SandboxState::Running;
        self.touch();
        debug!(plugin_id = %self.plugin_id, "Sandbox running");
    }

    /// Park a running sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SandboxUnavailable`] unless running.
    pub fn pause(&self) -> PluginResult<()> {
        let mut state = lock(&self.state);
        if *state != SandboxState::Running {
            return Err(PluginError::SandboxUnavailable(*state));
        }
        *state = SandboxState::Paused;
        debug!(plugin_id = %self.plugin_id, "Sandbox paused");
        Ok(())
    }

    /// Resume a paused sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SandboxUnavailable`] unless paused.
    pub fn resume(&self) -> PluginResult<()> {
        let mut state = lock(&self.state);
        if *state != SandboxState::Paused {
            return Err(PluginError::SandboxUnavailable(*state));
        }
        *state = SandboxState::Running;
        drop(state);
        self.touch();
        debug!(plugin_id = %self.plugin_id, "Sandbox resumed");
        Ok(())
    }

    /// Stop the sandbox and cancel every in-flight call.
    pub fn stop(&self) {
        *lock(&self.state) = SandboxState::Stopped;
        lock(&self.scope).cancel();
        debug!(plugin_id = %self.plugin_id, "Sandbox stopped");
    }

    /// Clear statistics and return to the running state.
    pub fn reset(&self) {
        *lock(&self.stats) = SandboxStats::default();
        self.activate();
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn admit(&self) -> PluginResult<SlotGuard<'_>> {
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = SlotGuard(&self.in_flight);
        let max = self.config.limits.max_concurrent_calls;
        if max > 0 && previous >= max {
            drop(guard);
            lock(&self.stats).record_violation();
            warn!(
                plugin_id = %self.plugin_id,
                in_flight = previous,
                limit = max,
                "Call rejected by concurrency limit"
            );
            return Err(PluginError::ResourceLimitExceeded(format!(
                "{previous} calls in flight, limit is {max}"
            )));
        }
        Ok(guard)
    }

    /// Run `work` under this sandbox's isolation level.
    ///
    /// # Errors
    ///
    /// - [`PluginError::SandboxUnavailable`] if the sandbox does not accept calls.
    /// - [`PluginError::ResourceLimitExceeded`] if the concurrency limit is hit.
    /// - [`PluginError::Timeout`], [`PluginError::Critical`] or
    ///   [`PluginError::Cancelled`] from containment.
    /// - Any error returned by `work` itself.
    pub async fn execute<F, Fut, T>(&self, work: F) -> PluginResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_with_cancel(&CancellationToken::new(), work)
            .await
    }

    /// Like [`Sandbox::execute`], also abandoning the call when `caller`
    /// is cancelled.
    ///
    /// # Errors
    ///
    /// See [`Sandbox::execute`].
    pub async fn execute_with_cancel<F, Fut, T>(
        &self,
        caller: &CancellationToken,
        work: F,
    ) -> PluginResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state();
        if !state.accepts_calls() {
            return Err(PluginError::SandboxUnavailable(state));
        }
        let _slot = self.admit()?;

        let scope = lock(&self.scope).clone();
        let call_token = scope.child_token();
        lock(&self.stats).begin_call();
        self.touch();
        let started = Instant::now();

        let fut = work(call_token.clone());
        let result = match self.effective_level() {
            IsolationLevel::None => fut.await,
            IsolationLevel::Strict => {
                self.contain(fut, self.pool.as_ref(), &scope, caller)
                    .await
            },
            IsolationLevel::Basic | IsolationLevel::Complete => {
                self.contain(fut, None, &scope, caller).await
            },
        };
        if result.is_err() {
            call_token.cancel();
        }

        lock(&self.stats).record(started.elapsed(), &result);
        self.touch();
        self.observe(&result);
        result
    }

    async fn contain<Fut, T>(
        &self,
        fut: Fut,
        pool: Option<&WorkerPool>,
        scope: &CancellationToken,
        caller: &CancellationToken,
    ) -> PluginResult<T>
    where
        Fut: Future<Output = PluginResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = self.config.timeout;
        let run = async move {
            let handle = match pool {
                Some(pool) => pool.submit(fut, caller).await?,
                None => tokio::spawn(CatchFault::new(fut)),
            };
            match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(fault)) => Err(fault.into()),
                Err(join) if join.is_panic() => Err(PluginError::Critical {
                    fault: payload_message(join.into_panic().as_ref()),
                    backtrace: "<backtrace unavailable>".to_string(),
                }),
                Err(_) => Err(PluginError::Cancelled),
            }
        };

        tokio::select! {
            biased;
            () = scope.cancelled() => Err(PluginError::Cancelled),
            () = caller.cancelled() => Err(PluginError::Cancelled),
            outcome = tokio::time::timeout(timeout, run) => {
                outcome.unwrap_or_else(|_| Err(PluginError::Timeout(timeout)))
            },
        }
    }

    fn observe<T>(&self, result: &PluginResult<T>) {
        match result {
            Err(PluginError::Critical { fault, backtrace }) => {
                {
                    let mut state = lock(&self.state);
                    if state.accepts_calls() {
                        *state = SandboxState::Error;
                    }
                }
                error!(
                    plugin_id = %self.plugin_id,
                    fault = %fault,
                    backtrace = %backtrace,
                    "Contained panic in isolated call"
                );
            },
            Err(PluginError::Timeout(after)) => {
                warn!(plugin_id = %self.plugin_id, timeout = ?after, "Isolated call timed out");
            },
            Err(PluginError::Cancelled) => {
                debug!(plugin_id = %self.plugin_id, "Isolated call cancelled");
            },
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sandbox(level: IsolationLevel, timeout_ms: u64) -> Sandbox {
        let config = SandboxConfig::new(level).with_timeout(Duration::from_millis(timeout_ms));
        let sandbox = Sandbox::new(
            PluginId::from_static("test"),
            config,
            None,
            &CancellationToken::new(),
        );
        sandbox.activate();
        sandbox
    }

    fn pooled(size: usize, timeout_ms: u64) -> Sandbox {
        let root = CancellationToken::new();
        let config = SandboxConfig::new(IsolationLevel::Strict)
            .with_timeout(Duration::from_millis(timeout_ms));
        let sandbox = Sandbox::new(
            PluginId::from_static("test"),
            config,
            Some(WorkerPool::new(size, root.child_token())),
            &root,
        );
        sandbox.activate();
        sandbox
    }

    fn explode() -> PluginResult<u32> {
        panic!("plugin blew up");
    }

    async fn sleep_ok(ms: u64) -> PluginResult<u32> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(1)
    }

    #[tokio::test]
    async fn test_basic_timeout() {
        let sandbox = sandbox(IsolationLevel::Basic, 50);
        let result = sandbox.execute(|_| sleep_ok(500)).await;
        assert!(matches!(result, Err(PluginError::Timeout(_))));
        assert_eq!(sandbox.stats().timeouts, 1);
        assert_eq!(sandbox.stats().failed_calls, 1);
    }

    #[tokio::test]
    async fn test_basic_completes_within_deadline() {
        let sandbox = sandbox(IsolationLevel::Basic, 200);
        let result = sandbox.execute(|_| sleep_ok(100)).await;
        assert_eq!(result.unwrap(), 1);
        let stats = sandbox.stats();
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.successful_calls, 1);
        assert!(stats.min_execution_time.unwrap() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_strict_timeout() {
        let sandbox = pooled(2, 50);
        let result = sandbox.execute(|_| sleep_ok(500)).await;
        assert!(matches!(result, Err(PluginError::Timeout(_))));
        assert_eq!(sandbox.stats().timeouts, 1);

        let ok = sandbox.execute(|_| sleep_ok(10)).await;
        assert!(ok.is_ok());
        assert_eq!(sandbox.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_basic_contains_panic() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        let result = sandbox.execute(|_| async { explode() }).await;

        match result {
            Err(PluginError::Critical { fault, backtrace }) => {
                assert_eq!(fault, "plugin blew up");
                assert!(!backtrace.is_empty());
            },
            other => panic!("expected critical, got {other:?}"),
        }
        assert_eq!(sandbox.stats().panics, 1);
        assert_eq!(sandbox.state(), SandboxState::Error);
        assert!(!sandbox.is_healthy());
    }

    #[tokio::test]
    async fn test_strict_contains_panic() {
        let sandbox = pooled(1, 1_000);
        let result = sandbox.execute(|_| async { explode() }).await;
        assert!(matches!(result, Err(PluginError::Critical { .. })));
        assert_eq!(sandbox.stats().panics, 1);
    }

    #[tokio::test]
    async fn test_error_state_rejects_until_reset() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        let _ = sandbox.execute(|_| async { explode() }).await;
        assert!(matches!(
            sandbox.execute(|_| sleep_ok(0)).await,
            Err(PluginError::SandboxUnavailable(SandboxState::Error))
        ));

        sandbox.reset();
        assert_eq!(sandbox.stats(), SandboxStats::default());
        assert!(sandbox.execute(|_| sleep_ok(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_effective_levels() {
        assert_eq!(
            sandbox(IsolationLevel::Strict, 10).effective_level(),
            IsolationLevel::Basic
        );
        assert_eq!(
            sandbox(IsolationLevel::Complete, 10).effective_level(),
            IsolationLevel::Basic
        );
        assert_eq!(pooled(1, 10).effective_level(), IsolationLevel::Strict);
        assert_eq!(
            sandbox(IsolationLevel::None, 10).effective_level(),
            IsolationLevel::None
        );
    }

    #[tokio::test]
    async fn test_none_level_runs_in_place() {
        let sandbox = sandbox(IsolationLevel::None, 10);
        // No deadline applies at this level.
        let result = sandbox.execute(|_| sleep_ok(40)).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(sandbox.stats().successful_calls, 1);
    }

    #[tokio::test]
    async fn test_work_errors_are_counted() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        let result: PluginResult<()> = sandbox
            .execute(|_| async { Err(PluginError::Remote("bad params".into())) })
            .await;
        assert!(matches!(result, Err(PluginError::Remote(_))));
        let stats = sandbox.stats();
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.panics, 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let config = SandboxConfig::new(IsolationLevel::Basic).with_limits(ResourceLimits {
            max_concurrent_calls: 1,
        });
        let sandbox = Arc::new(Sandbox::new(
            PluginId::from_static("test"),
            config,
            None,
            &CancellationToken::new(),
        ));
        sandbox.activate();

        let busy = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.execute(|_| sleep_ok(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let rejected = sandbox.execute(|_| sleep_ok(0)).await;
        assert!(matches!(rejected, Err(PluginError::ResourceLimitExceeded(_))));
        assert_eq!(sandbox.stats().resource_violations, 1);

        assert!(busy.await.unwrap().is_ok());
        assert_eq!(sandbox.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let sandbox = Arc::new(sandbox(IsolationLevel::Basic, 10_000));
        let call = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.execute(|_| sleep_ok(5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        sandbox.stop();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(PluginError::Cancelled)));
        assert_eq!(sandbox.stats().cancelled, 1);
        assert_eq!(sandbox.state(), SandboxState::Stopped);
    }

    #[tokio::test]
    async fn test_work_observes_its_token() {
        let sandbox = sandbox(IsolationLevel::Basic, 50);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result = sandbox
            .execute(move |token| async move {
                token.cancelled().await;
                let _ = tx.send(());
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PluginError::Timeout(_))));
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let sandbox = sandbox(IsolationLevel::Basic, 10_000);
        let caller = CancellationToken::new();
        let trigger = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = sandbox.execute_with_cancel(&caller, |_| sleep_ok(5_000)).await;
        assert!(matches!(result, Err(PluginError::Cancelled)));
        assert_eq!(sandbox.state(), SandboxState::Running);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        sandbox.pause().unwrap();
        assert!(matches!(
            sandbox.execute(|_| sleep_ok(0)).await,
            Err(PluginError::SandboxUnavailable(SandboxState::Paused))
        ));
        assert!(sandbox.pause().is_err());
        sandbox.resume().unwrap();
        assert!(sandbox.execute(|_| sleep_ok(0)).await.is_ok());
        assert!(sandbox.resume().is_err());
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        sandbox.execute(|_| sleep_ok(0)).await.unwrap();
        assert!(!sandbox.is_idle(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sandbox.is_idle(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_failure_rate_makes_unhealthy() {
        let sandbox = sandbox(IsolationLevel::Basic, 1_000);
        for _ in 0..10 {
            let _: PluginResult<()> = sandbox
                .execute(|_| async { Err(PluginError::Remote("down".into())) })
                .await;
        }
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert!(!sandbox.is_healthy());

        sandbox.reset();
        assert!(sandbox.is_healthy());
    }

    #[tokio::test]
    async fn test_initializing_accepts_calls() {
        let sandbox = Sandbox::new(
            PluginId::from_static("test"),
            SandboxConfig::default(),
            None,
            &CancellationToken::new(),
        );
        assert_eq!(sandbox.state(), SandboxState::Initializing);
        assert!(sandbox.is_healthy());
        assert!(sandbox.execute(|_| sleep_ok(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_activate_after_parent_cancel_stays_cancelled() {
        let root = CancellationToken::new();
        let sandbox = Sandbox::new(
            PluginId::from_static("test"),
            SandboxConfig::default(),
            None,
            &root,
        );
        root.cancel();
        sandbox.activate();
        assert!(matches!(
            sandbox.execute(|_| sleep_ok(1_000)).await,
            Err(PluginError::Cancelled)
        ));
    }
}
