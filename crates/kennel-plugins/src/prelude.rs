//! Common imports for hosts and plugin authors.
//!
//! ```rust
//! use kennel_plugins::prelude::*;
//! ```

pub use crate::config::{DependentPolicy, ManagerConfig};
pub use crate::descriptor::{IsolationLevel, PluginDependency, PluginDescriptor, PluginId};
pub use crate::error::{PluginError, PluginResult};
pub use crate::lifecycle::{LifecycleListener, LifecycleState, TransitionEvent};
pub use crate::manager::{PluginEvent, PluginHealth, PluginManager, PluginStatus};
pub use crate::module::{PluginInfo, PluginMessage, PluginModule};
