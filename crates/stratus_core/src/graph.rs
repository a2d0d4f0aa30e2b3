//! Dependency graph between resource nodes.
//!
//! Edges point from a dependency to its dependent. The graph is a derived
//! index: it never owns nodes and can be rebuilt from the node set with
//! [`DependencyGraph::from_nodes`].

use std::collections::BTreeSet;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use petgraph::Direction;

use crate::error::{CoreError, CoreResult};
use crate::resource::{ResourceId, ResourceNode};

/// Why one resource waits for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// An input references the dependency's outputs
    Data,
    /// Declared ordering with no data flow
    Ordering,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    inner: DiGraphMap<ResourceId, EdgeKind>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from a node set.
    pub fn from_nodes(nodes: &[ResourceNode]) -> CoreResult<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node.id);
        }
        for node in nodes {
            for dep in node.inputs.provenance() {
                graph.try_add_edge(dep, node.id, EdgeKind::Data)?;
            }
            for dep in &node.ordering {
                graph.try_add_edge(*dep, node.id, EdgeKind::Ordering)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, id: ResourceId) {
        self.inner.add_node(id);
    }

    /// Whether an edge `dependency -> dependent` would close a cycle.
    pub fn creates_cycle(&self, dependency: ResourceId, dependent: ResourceId) -> bool {
        dependency == dependent
            || (self.inner.contains_node(dependent)
                && self.inner.contains_node(dependency)
                && has_path_connecting(&self.inner, dependent, dependency, None))
    }

    /// Add an edge, refusing any that would close a cycle.
    ///
    /// A data edge is never downgraded to an ordering edge.
    pub fn try_add_edge(
        &mut self,
        dependency: ResourceId,
        dependent: ResourceId,
        kind: EdgeKind,
    ) -> CoreResult<()> {
        if self.creates_cycle(dependency, dependent) {
            return Err(CoreError::Declaration(format!(
                "dependency cycle: {} -> {} -> {}",
                dependent, dependency, dependent
            )));
        }
        let kind = match self.inner.edge_weight(dependency, dependent) {
            Some(EdgeKind::Data) => EdgeKind::Data,
            _ => kind,
        };
        self.inner.add_edge(dependency, dependent, kind);
        Ok(())
    }

    pub fn edge(&self, dependency: ResourceId, dependent: ResourceId) -> Option<EdgeKind> {
        self.inner.edge_weight(dependency, dependent).copied()
    }

    /// Direct dependencies (incoming edges).
    pub fn dependencies(&self, id: ResourceId) -> BTreeSet<ResourceId> {
        self.inner
            .neighbors_directed(id, Direction::Incoming)
            .collect()
    }

    /// Direct dependents (outgoing edges).
    pub fn dependents(&self, id: ResourceId) -> BTreeSet<ResourceId> {
        self.inner
            .neighbors_directed(id, Direction::Outgoing)
            .collect()
    }

    /// Every resource reachable from `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: ResourceId) -> BTreeSet<ResourceId> {
        let mut reached = BTreeSet::new();
        if !self.inner.contains_node(id) {
            return reached;
        }
        let mut dfs = Dfs::new(&self.inner, id);
        while let Some(next) = dfs.next(&self.inner) {
            if next != id {
                reached.insert(next);
            }
        }
        reached
    }

    /// A dependency-respecting order of every node.
    pub fn topological_order(&self) -> CoreResult<Vec<ResourceId>> {
        toposort(&self.inner, None).map_err(|cycle| {
            CoreError::Declaration(format!(
                "dependency cycle through {}",
                cycle.node_id()
            ))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }
}
