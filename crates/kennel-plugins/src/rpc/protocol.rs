//! Wire format of the plugin channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PluginError, PluginResult};

/// Version of the line protocol spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;
/// Environment variable carrying the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "KENNEL_PLUGIN_MAGIC_COOKIE";
/// Expected magic cookie value.
pub const MAGIC_COOKIE_VALUE: &str = "kennel";
/// Environment variable announcing the host's protocol version.
pub const PROTOCOL_VERSION_KEY: &str = "KENNEL_PLUGIN_PROTOCOL_VERSION";
/// Environment variable carrying the plugin's ID.
pub const PLUGIN_ID_KEY: &str = "KENNEL_PLUGIN_ID";

const TRANSPORT: &str = "stdio";

/// The first line a plugin writes: `version|cookie|transport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version.
    pub version: u32,
    /// Magic cookie.
    pub cookie: String,
    /// Transport name.
    pub transport: String,
}

impl Handshake {
    /// The handshake this crate sends.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            cookie: MAGIC_COOKIE_VALUE.to_string(),
            transport: TRANSPORT.to_string(),
        }
    }

    /// Parse a handshake line.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::HandshakeFailed`] for malformed lines.
    pub fn parse(line: &str) -> PluginResult<Self> {
        let mut parts = line.trim().split('|');
        let (Some(version), Some(cookie), Some(transport), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(PluginError::HandshakeFailed(format!(
                "malformed handshake line: {line:?}"
            )));
        };
        let version = version.parse().map_err(|_| {
            PluginError::HandshakeFailed(format!("invalid protocol version: {version:?}"))
        })?;
        Ok(Self {
            version,
            cookie: cookie.to_string(),
            transport: transport.to_string(),
        })
    }

    /// Check the handshake against what this host speaks.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::HandshakeFailed`] on any mismatch.
    pub fn validate(&self) -> PluginResult<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(PluginError::HandshakeFailed(format!(
                "plugin speaks protocol {}, host speaks {PROTOCOL_VERSION}",
                self.version
            )));
        }
        if self.cookie != MAGIC_COOKIE_VALUE {
            return Err(PluginError::HandshakeFailed("magic cookie mismatch".into()));
        }
        if self.transport != TRANSPORT {
            return Err(PluginError::HandshakeFailed(format!(
                "unsupported transport: {}",
                self.transport
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.version, self.cookie, self.transport)
    }
}

/// Remote method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// `init(config)`
    Init,
    /// `execute(action, params)`
    Execute,
    /// `shutdown()`
    Shutdown,
    /// `get_info()`
    GetInfo,
    /// `handle_message(message)`
    HandleMessage,
}

/// A call from host to plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation ID echoed in the response.
    pub id: u64,
    /// Method to invoke.
    pub method: Method,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// A reply from plugin to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request being answered.
    pub id: u64,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Convert into a result. A missing `result` is `null`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Remote`] carrying the plugin's message.
    pub fn into_result(self) -> PluginResult<Value> {
        match self.error {
            Some(error) => Err(PluginError::Remote(error)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Parameters of [`Method::Init`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitParams {
    /// Plugin configuration.
    #[serde(default)]
    pub config: Value,
}

/// Parameters of [`Method::Execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteParams {
    /// Action name.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
}

/// Serialize a message as one protocol line, newline included.
///
/// # Errors
///
/// Returns [`PluginError::Serialization`] if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> PluginResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
