//! Directed graph over plugin IDs.
//!
//! Nodes are registered descriptors; edges are their declared dependencies.
//! Only required edges take part in ordering and cycle detection. Optional
//! edges are kept so [`DependencyGraph::dependents`] can report them.
//!
//! Ordering is Kahn's algorithm with an ascending-ID tie-break, so the same
//! set of registrations always yields the same order.

use std::collections::{BTreeMap, BTreeSet};

use semver::{Version, VersionReq};
use tracing::debug;

use crate::descriptor::{PluginDependency, PluginId};
use crate::error::{PluginError, PluginResult};

#[derive(Debug, Clone)]
struct Node {
    version: Version,
    dependencies: Vec<PluginDependency>,
}

/// Plugins that would be affected by removing a given plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependents {
    /// Plugins declaring a required dependency.
    pub required: Vec<PluginId>,
    /// Plugins declaring an optional dependency.
    pub optional: Vec<PluginId>,
}

impl Dependents {
    /// No plugin depends on the target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// Dependency metadata for registered plugins.
///
/// The graph holds only descriptors' identity, version and dependencies,
/// never runtime instances, so discovery can register metadata before a
/// plugin is loaded.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<PluginId, Node>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin and its dependency edges.
    ///
    /// # Errors
    ///
    /// - [`PluginError::AlreadyRegistered`] if `id` is present.
    /// - [`PluginError::InvalidVersion`] if `version` or any constraint
    ///   does not parse.
    pub fn register(
        &mut self,
        id: PluginId,
        version: &str,
        dependencies: Vec<PluginDependency>,
    ) -> PluginResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(PluginError::AlreadyRegistered(id));
        }
        let version = parse_version(version)?;
        for dep in &dependencies {
            parse_constraint(&dep.version_constraint)?;
        }

        debug!(plugin_id = %id, %version, deps = dependencies.len(), "Registered plugin metadata");
        self.nodes.insert(
            id,
            Node {
                version,
                dependencies,
            },
        );
        Ok(())
    }

    /// Remove a plugin and every edge that starts at it.
    ///
    /// Edges from other plugins to `id` are declarations owned by those
    /// plugins; they remain and show up as missing dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRegistered`] if `id` is absent.
    pub fn unregister(&mut self, id: &PluginId) -> PluginResult<()> {
        if self.nodes.remove(id).is_none() {
            return Err(PluginError::NotRegistered(id.clone()));
        }
        debug!(plugin_id = %id, "Unregistered plugin metadata");
        Ok(())
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &PluginId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Registered version of `id`.
    #[must_use]
    pub fn version_of(&self, id: &PluginId) -> Option<&Version> {
        self.nodes.get(id).map(|n| &n.version)
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registered IDs in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &PluginId> {
        self.nodes.keys()
    }

    /// Declared dependencies of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRegistered`] if `id` is absent.
    pub fn dependencies_of(&self, id: &PluginId) -> PluginResult<&[PluginDependency]> {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .ok_or_else(|| PluginError::NotRegistered(id.clone()))
    }

    /// Required dependencies of `id` that are absent or whose registered
    /// version does not satisfy the constraint.
    ///
    /// Entries read `dep` when the dependency is absent and
    /// `dep@constraint` when the version is incompatible. Optional
    /// dependencies are never reported.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRegistered`] if `id` is absent.
    pub fn check_dependencies(&self, id: &PluginId) -> PluginResult<Vec<String>> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| PluginError::NotRegistered(id.clone()))?;

        let mut missing = Vec::new();
        for dep in node.dependencies.iter().filter(|d| !d.optional) {
            let Some(target) = self.nodes.get(&dep.id) else {
                missing.push(dep.id.to_string());
                continue;
            };
            if !satisfies(&target.version, &dep.version_constraint)? {
                missing.push(format!("{}@{}", dep.id, dep.version_constraint));
            }
        }
        Ok(missing)
    }

    /// Missing dependencies for every registered plugin that has any.
    ///
    /// # Errors
    ///
    /// Propagates constraint parse failures.
    pub fn check_all(&self) -> PluginResult<BTreeMap<PluginId, Vec<String>>> {
        let mut report = BTreeMap::new();
        for id in self.nodes.keys() {
            let missing = self.check_dependencies(id)?;
            if !missing.is_empty() {
                report.insert(id.clone(), missing);
            }
        }
        Ok(report)
    }

    /// Topological order, dependencies before dependents.
    ///
    /// Required edges to unregistered plugins are ignored here; use
    /// [`DependencyGraph::check_dependencies`] to detect them.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CyclicDependency`] naming the plugins that
    /// could not be ordered.
    pub fn dependency_order(&self) -> PluginResult<Vec<PluginId>> {
        let mut in_degree: BTreeMap<&PluginId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&PluginId, Vec<&PluginId>> = BTreeMap::new();

        for (id, node) in &self.nodes {
            let mut degree = 0usize;
            for dep in node.dependencies.iter().filter(|d| !d.optional) {
                if let Some((dep_id, _)) = self.nodes.get_key_value(&dep.id) {
                    degree = degree.saturating_add(1);
                    dependents.entry(dep_id).or_default().push(id);
                }
            }
            in_degree.insert(id, degree);
        }

        let mut ready: BTreeSet<&PluginId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let ordered: BTreeSet<&PluginId> = order.iter().collect();
            let cycle = self
                .nodes
                .keys()
                .filter(|id| !ordered.contains(id))
                .cloned()
                .collect();
            return Err(PluginError::CyclicDependency(cycle));
        }

        Ok(order)
    }

    /// Order for bulk shutdown: dependents before their dependencies.
    ///
    /// This is exactly the reverse of [`DependencyGraph::dependency_order`].
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CyclicDependency`] like `dependency_order`.
    pub fn unload_order(&self) -> PluginResult<Vec<PluginId>> {
        let mut order = self.dependency_order()?;
        order.reverse();
        Ok(order)
    }

    /// Registered plugins that `id` transitively requires, in dependency
    /// order. `id` itself is not included.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotRegistered`] if `id` is absent, or
    /// [`PluginError::CyclicDependency`] if the graph cannot be ordered.
    pub fn required_closure(&self, id: &PluginId) -> PluginResult<Vec<PluginId>> {
        if !self.nodes.contains_key(id) {
            return Err(PluginError::NotRegistered(id.clone()));
        }

        let mut reached = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for dep in node.dependencies.iter().filter(|d| !d.optional) {
                if self.nodes.contains_key(&dep.id) && reached.insert(&dep.id) {
                    stack.push(&dep.id);
                }
            }
        }

        Ok(self
            .dependency_order()?
            .into_iter()
            .filter(|candidate| candidate != id && reached.contains(candidate))
            .collect())
    }

    /// Every plugin declaring a dependency on `id`, required or optional,
    /// in ascending order.
    #[must_use]
    pub fn dependents(&self, id: &PluginId) -> Vec<PluginId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.dependencies.iter().any(|d| &d.id == id))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Dependents of `id` split by edge kind.
    ///
    /// A plugin declaring both kinds of edge to `id` counts as required.
    #[must_use]
    pub fn would_orphan(&self, id: &PluginId) -> Dependents {
        let mut result = Dependents::default();
        for (dependent, node) in &self.nodes {
            let edges = node.dependencies.iter().filter(|d| &d.id == id);
            let mut any = false;
            let mut required = false;
            for edge in edges {
                any = true;
                required |= !edge.optional;
            }
            if required {
                result.required.push(dependent.clone());
            } else if any {
                result.optional.push(dependent.clone());
            }
        }
        result
    }
}

fn parse_version(version: &str) -> PluginResult<Version> {
    Version::parse(version.trim())
        .map_err(|e| PluginError::InvalidVersion(format!("'{version}': {e}")))
}

fn parse_constraint(constraint: &str) -> PluginResult<Option<VersionReq>> {
    let constraint = constraint.trim();
    if constraint.is_empty() {
        return Ok(None);
    }
    VersionReq::parse(constraint)
        .map(Some)
        .map_err(|e| PluginError::InvalidVersion(format!("constraint '{constraint}': {e}")))
}

fn satisfies(version: &Version, constraint: &str) -> PluginResult<bool> {
    Ok(parse_constraint(constraint)?.is_none_or(|req| req.matches(version)))
}
