//! Host side of the channel.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    ExecuteParams, Handshake, InitParams, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, Method,
    PLUGIN_ID_KEY, PROTOCOL_VERSION, PROTOCOL_VERSION_KEY, Request, Response, encode_line,
};
use crate::descriptor::PluginId;
use crate::error::{PluginError, PluginResult};
use crate::module::{PluginInfo, PluginMessage, PluginModule};

/// Default time a plugin has to print its handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time a single call may take.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How to launch a plugin process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Deadline for the handshake line.
    pub connect_timeout: Duration,
    /// Deadline for each call.
    pub call_timeout: Duration,
    /// Extra command-line arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory of the child.
    pub working_dir: Option<PathBuf>,
    /// Abandons the handshake when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            cancel: None,
        }
    }
}

impl SpawnOptions {
    /// Set the handshake deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Append a command-line argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Give up on connecting, and on calls made through
    /// [`SpawnOptions::cancellable`], once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Resolves when the cancel token fires; never without one.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Run `fut` unless the cancel token fires first.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Cancelled`] on cancellation, otherwise the
    /// output of `fut`.
    pub async fn cancellable<T>(
        &self,
        fut: impl Future<Output = PluginResult<T>>,
    ) -> PluginResult<T> {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(PluginError::Cancelled),
            result = fut => result,
        }
    }
}

type Pending = Arc<DashMap<u64, oneshot::Sender<Response>>>;

/// A connected plugin process.
///
/// Calls are multiplexed over the child's stdin/stdout and correlated by
/// request ID. When the child's stdout closes, the client is marked exited
/// and every outstanding call fails with
/// [`PluginError::ConnectionFailure`].
pub struct RpcClient {
    plugin_id: PluginId,
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    exited: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("plugin_id", &self.plugin_id)
            .field("pid", &self.pid)
            .field("exited", &self.is_exited())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Launch `executable` and complete the handshake.
    ///
    /// # Errors
    ///
    /// - [`PluginError::ConnectionFailure`] if the process cannot be started
    ///   or exits before the handshake.
    /// - [`PluginError::ConnectTimeout`] if no handshake arrives in time.
    /// - [`PluginError::HandshakeFailed`] if the handshake is rejected.
    /// - [`PluginError::Cancelled`] if the options' cancel token fires
    ///   first. The child is killed.
    pub async fn spawn(
        plugin_id: PluginId,
        executable: &Path,
        options: &SpawnOptions,
    ) -> PluginResult<Self> {
        let mut command = Command::new(executable);
        command
            .args(&options.args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string())
            .env(PLUGIN_ID_KEY, plugin_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            PluginError::ConnectionFailure(format!(
                "failed to start {}: {e}",
                executable.display()
            ))
        })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            terminate(&plugin_id, &mut child).await;
            return Err(PluginError::Internal("child stdio was not captured".into()));
        };

        tokio::spawn(forward_stderr(plugin_id.clone(), stderr));

        let mut lines = BufReader::new(stdout).lines();
        let handshake = tokio::select! {
            biased;
            () = options.cancelled() => None,
            outcome = tokio::time::timeout(options.connect_timeout, lines.next_line()) => Some(outcome),
        };
        let Some(handshake) = handshake else {
            debug!(plugin_id = %plugin_id, "Connect cancelled");
            terminate(&plugin_id, &mut child).await;
            return Err(PluginError::Cancelled);
        };
        let line = match handshake {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                terminate(&plugin_id, &mut child).await;
                return Err(PluginError::ConnectionFailure(
                    "plugin exited before completing the handshake".into(),
                ));
            },
            Ok(Err(e)) => {
                terminate(&plugin_id, &mut child).await;
                return Err(PluginError::Io(e));
            },
            Err(_) => {
                terminate(&plugin_id, &mut child).await;
                return Err(PluginError::ConnectTimeout(options.connect_timeout));
            },
        };
        if let Err(e) = Handshake::parse(&line).and_then(|handshake| handshake.validate()) {
            terminate(&plugin_id, &mut child).await;
            return Err(e);
        }

        let pending: Pending = Arc::new(DashMap::new());
        let exited = Arc::new(AtomicBool::new(false));
        tokio::spawn(route_responses(
            plugin_id.clone(),
            lines,
            Arc::clone(&pending),
            Arc::clone(&exited),
        ));

        info!(plugin_id = %plugin_id, pid, "Plugin process connected");

        Ok(Self {
            plugin_id,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            exited,
            call_timeout: options.call_timeout,
        })
    }

    /// The plugin this process serves.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// OS process ID, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child's stdout has closed.
    #[must_use]
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Invoke `method` with the default call deadline.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call_with_timeout`].
    pub async fn call(&self, method: Method, params: Value) -> PluginResult<Value> {
        self.call_with_timeout(method, params, self.call_timeout).await
    }

    /// Invoke `method` and wait for its response.
    ///
    /// Dropping the returned future abandons the call; a late response is
    /// discarded.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Remote`] if the plugin answered with an error.
    /// - [`PluginError::Timeout`] if no response arrived in time.
    /// - [`PluginError::ConnectionFailure`] if the process is gone.
    pub async fn call_with_timeout(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> PluginResult<Value> {
        if self.is_exited() {
            return Err(self.gone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_line(&Request { id, method, params })?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };
        // The router drains `pending` after setting `exited`.
        if self.is_exited() {
            return Err(self.gone());
        }

        let exchange = async {
            {
                let mut stdin = self.stdin.lock().await;
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;
            }
            rx.await.map_err(|_| self.gone())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(PluginError::Io(e))) => Err(PluginError::ConnectionFailure(format!(
                "failed to send request: {e}"
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(plugin_id = %self.plugin_id, ?method, ?timeout, "Plugin call timed out");
                Err(PluginError::Timeout(timeout))
            },
        }
    }

    /// Check whether the process has exited, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] if the status cannot be queried.
    pub async fn try_wait(&self) -> PluginResult<Option<ExitStatus>> {
        Ok(self.child.lock().await.try_wait()?)
    }

    /// Kill the process and wait for it to exit.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        terminate(&self.plugin_id, &mut child).await;
        self.exited.store(true, Ordering::SeqCst);
    }

    fn gone(&self) -> PluginError {
        PluginError::ConnectionFailure(format!("plugin process {} has exited", self.plugin_id))
    }
}

/// Removes an abandoned call's response slot.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn terminate(plugin_id: &PluginId, child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(plugin_id = %plugin_id, error = %e, "Kill failed, process likely already exited");
    }
}

async fn forward_stderr(plugin_id: PluginId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin_id = %plugin_id, stream = "stderr", "{line}");
    }
}

async fn route_responses(
    plugin_id: PluginId,
    mut lines: Lines<BufReader<ChildStdout>>,
    pending: Pending,
    exited: Arc<AtomicBool>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Response>(&line) {
                    Ok(response) => match pending.remove(&response.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(response);
                        },
                        None => debug!(
                            plugin_id = %plugin_id,
                            id = response.id,
                            "Discarding response for abandoned call"
                        ),
                    },
                    Err(e) => warn!(plugin_id = %plugin_id, error = %e, "Unparseable plugin output"),
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "Plugin stdout failed");
                break;
            },
        }
    }
    exited.store(true, Ordering::SeqCst);
    pending.clear();
    info!(plugin_id = %plugin_id, "Plugin process disconnected");
}

/// A [`PluginModule`] that forwards every call to a plugin process.
#[derive(Debug, Clone)]
pub struct RemotePlugin {
    client: Arc<RpcClient>,
}

impl RemotePlugin {
    /// Wrap a connected client.
    #[must_use]
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

#[async_trait]
impl PluginModule for RemotePlugin {
    async fn init(&self, config: Value) -> PluginResult<()> {
        let params = serde_json::to_value(InitParams { config })?;
        self.client.call(Method::Init, params).await?;
        Ok(())
    }

    async fn execute(&self, action: &str, params: Value) -> PluginResult<Value> {
        let params = serde_json::to_value(ExecuteParams {
            action: action.to_string(),
            params,
        })?;
        self.client.call(Method::Execute, params).await
    }

    async fn shutdown(&self) -> PluginResult<()> {
        self.client.call(Method::Shutdown, Value::Null).await?;
        Ok(())
    }

    async fn get_info(&self) -> PluginResult<PluginInfo> {
        let info = self.client.call(Method::GetInfo, Value::Null).await?;
        Ok(serde_json::from_value(info)?)
    }

    async fn handle_message(&self, message: PluginMessage) -> PluginResult<Value> {
        let params = serde_json::to_value(message)?;
        self.client.call(Method::HandleMessage, params).await
    }
}
