//! Plugin identity and descriptor types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Unique, stable, human-readable plugin identifier.
///
/// Plugin IDs are strings like `"dlp"` or `"device-control"`. They must be
/// non-empty, contain only lowercase ASCII alphanumerics and the separators
/// `-`, `_` and `.`, and must not start or end with a separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation so configuration files cannot smuggle in
/// path fragments through the ID.
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the ID is empty or malformed.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        if !id.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
        }) {
            return Err(PluginError::InvalidId(format!(
                "plugin id may only contain lowercase alphanumerics, '-', '_' and '.', got: {id}"
            )));
        }
        let is_sep = |c: char| matches!(c, '-' | '_' | '.');
        if id.starts_with(is_sep) || id.ends_with(is_sep) {
            return Err(PluginError::InvalidId(format!(
                "plugin id must not start or end with a separator, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for PluginId {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Fault-containment policy applied to calls into a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Direct call, no containment. Only for fully trusted code.
    None,
    /// Independent task with a deadline and panic containment.
    #[default]
    Basic,
    /// Like [`IsolationLevel::Basic`], but submitted to a bounded worker pool.
    Strict,
    /// Reserved for process-per-call isolation. Currently runs as `Basic`.
    Complete,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Strict => "strict",
            Self::Complete => "complete",
        })
    }
}

/// A declared dependency on another plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependency {
    /// The plugin depended upon.
    pub id: PluginId,
    /// Semantic version requirement (`^1.2`, `~1.4.0`, `>=1, <2`). Empty
    /// accepts any version.
    #[serde(default, alias = "version")]
    pub version_constraint: String,
    /// Optional dependencies never block loading or ordering.
    #[serde(default)]
    pub optional: bool,
}

impl PluginDependency {
    /// A required dependency with the given constraint.
    #[must_use]
    pub fn required(id: PluginId, version_constraint: impl Into<String>) -> Self {
        Self {
            id,
            version_constraint: version_constraint.into(),
            optional: false,
        }
    }

    /// An optional dependency with the given constraint.
    #[must_use]
    pub fn optional(id: PluginId, version_constraint: impl Into<String>) -> Self {
        Self {
            id,
            version_constraint: version_constraint.into(),
            optional: true,
        }
    }
}

/// Immutable record describing a plugin.
///
/// Produced by discovery or static configuration and consumed by the
/// dependency graph and the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin identifier.
    pub id: PluginId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Semantic version of the plugin.
    pub version: String,
    /// Declared dependencies, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Capability flags.
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    /// Isolation policy for calls into the plugin.
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Start the plugin as soon as it is loaded.
    #[serde(default)]
    pub auto_start: bool,
    /// Let the health check restart the plugin when it turns unhealthy.
    #[serde(default)]
    pub auto_restart: bool,
    /// Disabled descriptors are never loaded.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit executable location, absolute or relative to the plugins directory.
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    /// Configuration passed to the plugin's `init` call.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl PluginDescriptor {
    /// Create an enabled descriptor with basic isolation and no dependencies.
    #[must_use]
    pub fn new(id: PluginId, version: impl Into<String>) -> Self {
        Self {
            name: id.as_str().to_string(),
            id,
            version: version.into(),
            dependencies: Vec::new(),
            tags: Vec::new(),
            capabilities: BTreeMap::new(),
            isolation_level: IsolationLevel::default(),
            auto_start: false,
            auto_restart: false,
            enabled: true,
            executable_path: None,
            config: serde_json::Map::new(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set a capability flag.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>, enabled: bool) -> Self {
        self.capabilities.insert(capability.into(), enabled);
        self
    }

    /// Set the isolation level.
    #[must_use]
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Start automatically after loading.
    #[must_use]
    pub fn auto_start(mut self) -> Self {
        self.auto_start = true;
        self
    }

    /// Restart automatically when unhealthy.
    #[must_use]
    pub fn auto_restart(mut self) -> Self {
        self.auto_restart = true;
        self
    }

    /// Mark the descriptor disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Set the executable path.
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    /// Add a configuration entry for the plugin's `init` call.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Required dependencies only.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &PluginDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Whether the capability is declared and enabled.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.get(capability).copied().unwrap_or(false)
    }
}
