//! Plugin error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::PluginId;
use crate::lifecycle::LifecycleState;
use crate::sandbox::SandboxState;

/// Coarse classification of a [`PluginError`].
///
/// Callers that only need to decide how to react (retry, report, abort)
/// match on the kind instead of the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown plugin or service.
    NotFound,
    /// Duplicate registration or load.
    AlreadyExists,
    /// Operation not valid for the current state.
    InvalidState,
    /// Missing or version-incompatible required dependency.
    DependencyUnsatisfied,
    /// Cycle among required dependencies.
    CyclicDependency,
    /// Subprocess spawn, handshake or channel failure.
    ConnectionFailure,
    /// Deadline exceeded or call abandoned.
    Timeout,
    /// Contained abnormal termination inside an isolated call.
    Critical,
    /// Anything else.
    Internal,
}

/// Errors from plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The requested plugin is unknown.
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    /// The plugin has no loaded instance.
    #[error("plugin not loaded: {0}")]
    NotLoaded(PluginId),

    /// The plugin is not present in the dependency graph.
    #[error("plugin not registered: {0}")]
    NotRegistered(PluginId),

    /// A plugin with this ID is already loaded.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(PluginId),

    /// A plugin with this ID is already registered.
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(PluginId),

    /// A service or factory with this name is already registered.
    #[error("service already registered: {0}")]
    DuplicateService(String),

    /// No service or factory is registered under this name.
    #[error("service not registered: {0}")]
    ServiceNotRegistered(String),

    /// The registered service does not have the requested type.
    #[error("service {name} is not a {expected}")]
    TypeMismatch {
        /// Service name.
        name: String,
        /// Type the caller asked for.
        expected: &'static str,
    },

    /// The plugin ID is malformed.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// The lifecycle table forbids this transition.
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// The operation is not valid for the plugin's current state.
    #[error("invalid state for plugin {id}: {message}")]
    InvalidState {
        /// The plugin concerned.
        id: PluginId,
        /// What was wrong.
        message: String,
    },

    /// The descriptor is disabled and may not be loaded.
    #[error("plugin is disabled: {0}")]
    Disabled(PluginId),

    /// The plugin is already running.
    #[error("plugin already running: {0}")]
    AlreadyRunning(PluginId),

    /// The plugin is not running.
    #[error("plugin not running: {0}")]
    NotRunning(PluginId),

    /// Other plugins still depend on this one.
    #[error("plugin {id} is still required by: {}", join(.dependents))]
    HasDependents {
        /// The plugin that was to be stopped or unloaded.
        id: PluginId,
        /// Plugins that depend on it.
        dependents: Vec<PluginId>,
    },

    /// Required dependencies are missing or have incompatible versions.
    #[error("unsatisfied dependencies for {id}: {}", .missing.join(", "))]
    DependencyUnsatisfied {
        /// The plugin whose dependencies were checked.
        id: PluginId,
        /// Missing entries, as `dep` or `dep@constraint`.
        missing: Vec<String>,
    },

    /// Required dependencies form a cycle.
    #[error("cyclic dependency among: {}", join(.0))]
    CyclicDependency(Vec<PluginId>),

    /// A version or version constraint could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// No candidate executable location exists.
    #[error("executable for plugin {id} not found (searched {} locations)", .searched.len())]
    ExecutableNotFound {
        /// The plugin being resolved.
        id: PluginId,
        /// Every location probed, in order.
        searched: Vec<PathBuf>,
    },

    /// The subprocess could not be spawned or the channel broke.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The handshake did not complete within the connect timeout.
    #[error("plugin handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The handshake line was malformed or announced another protocol.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An isolated or remote call exceeded its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// An isolated call was abandoned because its scope was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// An isolated call terminated abnormally and was contained.
    #[error("critical fault contained: {fault}")]
    Critical {
        /// Captured fault value.
        fault: String,
        /// Stack snapshot taken where the fault was raised.
        backtrace: String,
    },

    /// A resource policy of the sandbox was violated.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// The sandbox does not accept calls in its current state.
    #[error("sandbox unavailable ({0})")]
    SandboxUnavailable(SandboxState),

    /// The plugin reported an error.
    #[error("plugin error: {0}")]
    Remote(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PluginError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_)
            | Self::NotLoaded(_)
            | Self::NotRegistered(_)
            | Self::ServiceNotRegistered(_) => ErrorKind::NotFound,
            Self::AlreadyLoaded(_) | Self::AlreadyRegistered(_) | Self::DuplicateService(_) => {
                ErrorKind::AlreadyExists
            },
            Self::InvalidTransition { .. }
            | Self::InvalidState { .. }
            | Self::Disabled(_)
            | Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::HasDependents { .. }
            | Self::SandboxUnavailable(_) => ErrorKind::InvalidState,
            Self::DependencyUnsatisfied { .. } | Self::InvalidVersion(_) => {
                ErrorKind::DependencyUnsatisfied
            },
            Self::CyclicDependency(_) => ErrorKind::CyclicDependency,
            Self::ExecutableNotFound { .. }
            | Self::ConnectionFailure(_)
            | Self::ConnectTimeout(_)
            | Self::HandshakeFailed(_) => ErrorKind::ConnectionFailure,
            Self::Timeout(_) | Self::Cancelled => ErrorKind::Timeout,
            Self::Critical { .. } => ErrorKind::Critical,
            Self::TypeMismatch { .. }
            | Self::InvalidId(_)
            | Self::ResourceLimitExceeded(_)
            | Self::Remote(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

fn join(ids: &[PluginId]) -> String {
    ids.iter()
        .map(PluginId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let id = PluginId::from_static("core");
        assert_eq!(PluginError::NotLoaded(id.clone()).kind(), ErrorKind::NotFound);
        assert_eq!(
            PluginError::AlreadyLoaded(id.clone()).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            PluginError::InvalidTransition {
                from: LifecycleState::Running,
                to: LifecycleState::Loaded,
            }
            .kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            PluginError::ConnectTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::ConnectionFailure
        );
        assert_eq!(PluginError::Cancelled.kind(), ErrorKind::Timeout);
        assert_eq!(
            PluginError::Critical {
                fault: "boom".into(),
                backtrace: String::new(),
            }
            .kind(),
            ErrorKind::Critical
        );
    }

    #[test]
    fn test_display_lists_dependents() {
        let err = PluginError::HasDependents {
            id: PluginId::from_static("core"),
            dependents: vec![PluginId::from_static("audit"), PluginId::from_static("ext")],
        };
        assert_eq!(err.to_string(), "plugin core is still required by: audit, ext");
    }
}
