//! Kennel Telemetry - Logging and tracing for the Kennel plugin host.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - Request context for correlating a plugin call across components
//! - Integration with the tracing ecosystem
//!
//! Plugin processes must log to stderr: their stdout carries the RPC channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use kennel_telemetry::{LogConfig, LogFormat, LogTarget, setup_logging, RequestContext};
//!
//! # fn main() -> Result<(), kennel_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_target(LogTarget::Stderr)
//!     .with_directive("kennel_plugins=debug");
//!
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("plugin_manager")
//!     .with_operation("execute");
//!
//! let span = ctx.span();
//! let _guard = span.enter();
//! tracing::info!("Dispatching plugin call");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::{RequestContext, RequestGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
