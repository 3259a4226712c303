//! The plugin-facing call surface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginResult;

/// Self-description returned by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Actions accepted by [`PluginModule::execute`].
    #[serde(default)]
    pub supported_actions: Vec<String>,
}

/// An asynchronous message delivered to a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender-assigned message ID.
    pub id: String,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Message body.
    #[serde(default)]
    pub payload: Value,
}

impl PluginMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// What a plugin implements, and what the host calls.
///
/// Plugin authors implement this trait and hand it to
/// [`serve`](crate::rpc::server::serve). On the host side,
/// [`RemotePlugin`](crate::rpc::client::RemotePlugin) implements it by
/// forwarding each call over the RPC channel.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Initialise with the descriptor's configuration.
    async fn init(&self, config: Value) -> PluginResult<()>;

    /// Run `action` with `params`.
    async fn execute(&self, action: &str, params: Value) -> PluginResult<Value>;

    /// Release resources. The process may keep serving afterwards and can
    /// be initialised again.
    async fn shutdown(&self) -> PluginResult<()>;

    /// Describe the plugin.
    async fn get_info(&self) -> PluginResult<PluginInfo>;

    /// Handle an asynchronous message.
    async fn handle_message(&self, message: PluginMessage) -> PluginResult<Value>;
}
