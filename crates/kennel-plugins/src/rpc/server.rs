//! Plugin side of the channel.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::protocol::{
    ExecuteParams, Handshake, InitParams, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, Method, Request,
    Response, encode_line,
};
use crate::error::{PluginError, PluginResult};
use crate::module::{PluginModule, PluginMessage};
use crate::sandbox::fault::CatchFault;

/// Fail unless the process was started by a plugin host.
///
/// # Errors
///
/// Returns [`PluginError::HandshakeFailed`] when the magic cookie is
/// missing or wrong.
pub fn check_cookie() -> PluginResult<()> {
    match std::env::var(MAGIC_COOKIE_KEY) {
        Ok(value) if value == MAGIC_COOKIE_VALUE => Ok(()),
        _ => Err(PluginError::HandshakeFailed(
            "this binary is a plugin and is not meant to be run directly; \
             start the host application instead and it will launch the plugin"
                .into(),
        )),
    }
}

/// Serve `module` over stdin/stdout until the host closes stdin.
///
/// # Errors
///
/// Returns an error if the cookie check fails or stdout cannot be written.
pub async fn serve<M>(module: M) -> PluginResult<()>
where
    M: PluginModule + 'static,
{
    check_cookie()?;
    serve_io(Arc::new(module), tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `module` over an arbitrary reader/writer pair.
///
/// Writes the handshake line, then answers every request line. Requests are
/// handled concurrently and responses may arrive out of order. A panic in a
/// handler becomes an error response. Returns once the reader reaches EOF
/// and every in-flight request has been answered.
///
/// # Errors
///
/// Returns an error if the handshake cannot be written.
pub async fn serve_io<R, W>(module: Arc<dyn PluginModule>, reader: R, mut writer: W) -> PluginResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    writer
        .write_all(format!("{}\n", Handshake::current()).as_bytes())
        .await?;
    writer.flush().await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut handlers = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read request");
                break;
            },
        };
        while handlers.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64))
                    .unwrap_or_default();
                send(&tx, &Response::err(id, format!("malformed request: {e}")));
                continue;
            },
        };

        let module = Arc::clone(&module);
        let tx = tx.clone();
        handlers.spawn(async move {
            let id = request.id;
            let method = request.method;
            let response = match CatchFault::new(dispatch(module, request)).await {
                Ok(Ok(value)) => Response::ok(id, value),
                Ok(Err(e)) => Response::err(id, remote_message(e)),
                Err(fault) => {
                    error!(?method, fault = %fault.message, "Request handler panicked");
                    Response::err(id, format!("plugin panicked: {}", fault.message))
                },
            };
            send(&tx, &response);
        });
    }

    while handlers.join_next().await.is_some() {}
    drop(tx);
    match writer_task.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => debug!(error = %e, "Response writer closed"),
        Err(e) => warn!(error = %e, "Response writer task failed"),
    }
    Ok(())
}

async fn dispatch(module: Arc<dyn PluginModule>, request: Request) -> PluginResult<Value> {
    let params = request.params;
    match request.method {
        Method::Init => {
            let params: InitParams = if params.is_null() {
                InitParams::default()
            } else {
                serde_json::from_value(params)?
            };
            module.init(params.config).await?;
            Ok(Value::Null)
        },
        Method::Execute => {
            let params: ExecuteParams = serde_json::from_value(params)?;
            module.execute(&params.action, params.params).await
        },
        Method::Shutdown => {
            module.shutdown().await?;
            Ok(Value::Null)
        },
        Method::GetInfo => Ok(serde_json::to_value(module.get_info().await?)?),
        Method::HandleMessage => {
            let message: PluginMessage = serde_json::from_value(params)?;
            module.handle_message(message).await
        },
    }
}

fn remote_message(error: PluginError) -> String {
    match error {
        PluginError::Remote(message) => message,
        other => other.to_string(),
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &Response) {
    match encode_line(response) {
        Ok(line) => {
            if tx.send(line).is_err() {
                debug!(id = response.id, "Response dropped, writer closed");
            }
        },
        Err(e) => error!(id = response.id, error = %e, "Failed to encode response"),
    }
}
