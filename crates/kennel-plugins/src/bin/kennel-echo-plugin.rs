//! Reference plugin that echoes its input.
//!
//! Launched by a Kennel host; refuses to run when started directly. Besides
//! `echo` it offers actions that misbehave on request, which makes it useful
//! for exercising the host's timeout, crash and restart handling:
//!
//! | action    | effect                                              |
//! |-----------|-----------------------------------------------------|
//! | `echo`    | returns `params`                                    |
//! | `whoami`  | returns the plugin ID assigned by the host          |
//! | `config`  | returns the configuration passed to `init`          |
//! | `sleep`   | sleeps `params.ms` milliseconds                     |
//! | `fail`    | returns an error                                    |
//! | `panic`   | panics inside the handler                           |
//! | `exit`    | terminates the process with `params.code` (default 3) |
//!
//! Setting `fail_init = true` in the plugin's configuration makes `init`
//! fail.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kennel_plugins::rpc::protocol::PLUGIN_ID_KEY;
use kennel_plugins::rpc::server::{check_cookie, serve};
use kennel_plugins::{PluginError, PluginInfo, PluginMessage, PluginModule, PluginResult};
use kennel_telemetry::{LogConfig, LogFormat, LogTarget, setup_logging};
use serde_json::{Value, json};
use tracing::{debug, info};

const ACTIONS: [&str; 7] = ["echo", "whoami", "config", "sleep", "fail", "panic", "exit"];

struct EchoPlugin {
    plugin_id: String,
    config: Mutex<Value>,
    inits: AtomicU32,
}

impl EchoPlugin {
    fn new(plugin_id: String) -> Self {
        Self {
            plugin_id,
            config: Mutex::new(Value::Null),
            inits: AtomicU32::new(0),
        }
    }

    fn config(&self) -> Value {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PluginModule for EchoPlugin {
    async fn init(&self, config: Value) -> PluginResult<()> {
        if config.get("fail_init").and_then(Value::as_bool) == Some(true) {
            return Err(PluginError::Remote("init refused by configuration".into()));
        }
        let count = self
            .inits
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        info!(plugin_id = %self.plugin_id, inits = count, "Initialised");
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    async fn execute(&self, action: &str, params: Value) -> PluginResult<Value> {
        debug!(action, "Executing");
        match action {
            "echo" => Ok(params),
            "whoami" => Ok(json!({
                "plugin_id": self.plugin_id,
                "pid": std::process::id(),
                "inits": self.inits.load(Ordering::SeqCst),
            })),
            "config" => Ok(self.config()),
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            },
            "fail" => Err(PluginError::Remote("requested failure".into())),
            "panic" => panic!("requested panic"),
            "exit" => {
                let code = params
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok())
                    .unwrap_or(3);
                info!(code, "Exiting on request");
                std::process::exit(code)
            },
            other => Err(PluginError::Remote(format!("unsupported action: {other}"))),
        }
    }

    async fn shutdown(&self) -> PluginResult<()> {
        info!(plugin_id = %self.plugin_id, "Shutdown requested");
        Ok(())
    }

    async fn get_info(&self) -> PluginResult<PluginInfo> {
        Ok(PluginInfo {
            name: "kennel-echo-plugin".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Echoes its input and misbehaves on request".into(),
            supported_actions: ACTIONS.iter().map(ToString::to_string).collect(),
        })
    }

    async fn handle_message(&self, message: PluginMessage) -> PluginResult<Value> {
        Ok(json!({
            "received": message.kind,
            "id": message.id,
            "payload": message.payload,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = check_cookie() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let log = LogConfig::new("info")
        .with_format(LogFormat::Compact)
        .with_target(LogTarget::Stderr)
        .with_ansi(false);
    setup_logging(&log)?;

    let plugin_id = std::env::var(PLUGIN_ID_KEY).unwrap_or_else(|_| "echo".to_string());
    serve(EchoPlugin::new(plugin_id)).await?;
    Ok(())
}
