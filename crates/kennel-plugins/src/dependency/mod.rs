//! Dependency metadata: ordering over declared plugin dependencies and a
//! small service locator for sharing services between plugins.

pub mod graph;
pub mod injector;

pub use graph::{DependencyGraph, Dependents};
pub use injector::{Injectable, ServiceRegistry, Slot};
