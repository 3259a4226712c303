//! Manager configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. Durations are written in seconds and may be fractional.
//!
//! ```toml
//! plugins_dir = "/opt/kennel/plugins"
//! health_check_interval_secs = 30
//! idle_timeout_secs = 600
//! optional_dependents = "warn"
//!
//! [[plugin]]
//! id = "core"
//! version = "1.0.0"
//! auto_start = true
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::PluginDescriptor;
use crate::error::{PluginError, PluginResult};
use crate::rpc::client::{DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::sandbox::DEFAULT_TIMEOUT;

/// Maximum accepted config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// What to do when stopping or unloading a plugin that optional
/// dependents still use. Required dependents always block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentPolicy {
    /// Refuse with [`PluginError::HasDependents`].
    Block,
    /// Log a warning and proceed.
    #[default]
    Warn,
}

/// Settings for a [`PluginManager`](crate::manager::PluginManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root directory searched for plugin executables.
    pub plugins_dir: PathBuf,
    /// Period of the health check loop.
    #[serde(rename = "health_check_interval_secs", with = "secs")]
    pub health_check_interval: Duration,
    /// A running plugin with no calls for this long is paused. Zero
    /// disables idle pausing.
    #[serde(rename = "idle_timeout_secs", with = "secs")]
    pub idle_timeout: Duration,
    /// Deadline for a plugin process to complete its handshake.
    #[serde(rename = "connect_timeout_secs", with = "secs")]
    pub connect_timeout: Duration,
    /// Deadline for a single RPC call.
    #[serde(rename = "call_timeout_secs", with = "secs")]
    pub call_timeout: Duration,
    /// Deadline applied by the sandbox around each isolated call.
    #[serde(rename = "sandbox_timeout_secs", with = "secs")]
    pub sandbox_timeout: Duration,
    /// Slots in the worker pool shared by strict sandboxes. Zero disables
    /// the pool.
    pub worker_pool_size: usize,
    /// Per-plugin cap on concurrent calls. Zero means unlimited.
    pub max_concurrent_calls: usize,
    /// Handling of optional dependents on stop and unload.
    pub optional_dependents: DependentPolicy,
    /// Fall back to a `PATH` lookup when no executable is found under
    /// [`plugins_dir`](Self::plugins_dir).
    pub search_path: bool,
    /// Statically configured plugins.
    #[serde(rename = "plugin")]
    pub plugins: Vec<PluginDescriptor>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            health_check_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            sandbox_timeout: DEFAULT_TIMEOUT,
            worker_pool_size: 0,
            max_concurrent_calls: 0,
            optional_dependents: DependentPolicy::default(),
            search_path: false,
            plugins: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Defaults with the given plugins directory.
    #[must_use]
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            ..Self::default()
        }
    }

    /// Read and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the file cannot be read, is too
    /// large, does not parse or fails validation.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(PluginError::Config(format!(
                "{}: file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                path.display(),
                metadata.len()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| PluginError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] on parse or validation failure.
    pub fn from_toml_str(content: &str) -> PluginResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| PluginError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] naming the offending field.
    pub fn validate(&self) -> PluginResult<()> {
        for (field, value) in [
            ("health_check_interval_secs", self.health_check_interval),
            ("connect_timeout_secs", self.connect_timeout),
            ("call_timeout_secs", self.call_timeout),
            ("sandbox_timeout_secs", self.sandbox_timeout),
        ] {
            if value.is_zero() {
                return Err(PluginError::Config(format!("{field} must be greater than zero")));
            }
        }

        let mut seen = BTreeSet::new();
        for descriptor in &self.plugins {
            if !seen.insert(&descriptor.id) {
                return Err(PluginError::Config(format!(
                    "plugin {} is configured more than once",
                    descriptor.id
                )));
            }
            semver::Version::parse(&descriptor.version).map_err(|e| {
                PluginError::Config(format!(
                    "plugin {}: invalid version {:?}: {e}",
                    descriptor.id, descriptor.version
                ))
            })?;
        }
        Ok(())
    }

    /// Set the health check period.
    #[must_use]
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the idle threshold. Zero disables idle pausing.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the handshake deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the RPC call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the sandbox call deadline.
    #[must_use]
    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    /// Size the shared worker pool.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Cap concurrent calls per plugin.
    #[must_use]
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Set the optional-dependent policy.
    #[must_use]
    pub fn with_optional_dependents(mut self, policy: DependentPolicy) -> Self {
        self.optional_dependents = policy;
        self
    }

    /// Enable the `PATH` fallback for executable lookup.
    #[must_use]
    pub fn with_search_path(mut self, enabled: bool) -> Self {
        self.search_path = enabled;
        self
    }

    /// Add a statically configured plugin.
    #[must_use]
    pub fn with_plugin(mut self, descriptor: PluginDescriptor) -> Self {
        self.plugins.push(descriptor);
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
