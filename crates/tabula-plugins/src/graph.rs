//! Arena-backed dependency graph over registered plugins.
//!
//! Nodes live in a `Vec` and edges refer to them by index, so the graph is
//! a plain value that can be rebuilt and swapped without any shared
//! ownership between nodes. It is derived state: rebuilt from the registry
//! after every mutation and never persisted.

use std::collections::HashMap;

use serde::Serialize;

use crate::registration::{PluginRegistration, PluginStatus};

/// Kind of dependency an edge represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Required dependency.
    Dependency,
    /// Optional peer dependency.
    Peer,
}

/// A registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    /// Plugin name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Lifecycle status when the graph was built.
    pub status: PluginStatus,
}

/// `from` depends on `to`. Both are node indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    /// Dependent node.
    pub from: usize,
    /// Dependency node.
    pub to: usize,
    /// Edge kind.
    pub kind: EdgeKind,
}

/// Snapshot of plugin dependencies.
///
/// Edges to plugins that are not registered are omitted; the resolver
/// reports those as missing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    edges: Vec<GraphEdge>,
    cycles: Vec<Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl DependencyGraph {
    /// Build a graph from registrations. Nodes are ordered by name.
    pub fn build<'a>(registrations: impl IntoIterator<Item = &'a PluginRegistration>) -> Self {
        let mut regs: Vec<&PluginRegistration> = registrations.into_iter().collect();
        regs.sort_by(|a, b| a.name().cmp(b.name()));

        let nodes: Vec<GraphNode> = regs
            .iter()
            .map(|r| GraphNode {
                name: r.name().to_owned(),
                version: r.version().to_owned(),
                status: r.status,
            })
            .collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        let mut edges = Vec::new();
        for (from, reg) in regs.iter().enumerate() {
            for dep in &reg.dependencies {
                if let Some(&to) = index.get(&dep.name) {
                    let kind = if dep.optional {
                        EdgeKind::Peer
                    } else {
                        EdgeKind::Dependency
                    };
                    edges.push(GraphEdge { from, to, kind });
                }
            }
        }

        let mut graph = Self {
            nodes,
            index,
            edges,
            cycles: Vec::new(),
        };
        graph.cycles = graph.find_cycles();
        graph
    }

    /// Cycles over required edges, via three-colour DFS.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut marks = vec![Mark::White; self.nodes.len()];
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::White {
                self.dfs(start, &mut marks, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn dfs(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks[node] = Mark::Grey;
        stack.push(node);
        for edge in self
            .edges
            .iter()
            .filter(|e| e.from == node && e.kind == EdgeKind::Dependency)
        {
            match marks[edge.to] {
                Mark::White => self.dfs(edge.to, marks, stack, cycles),
                Mark::Grey => {
                    if let Some(pos) = stack.iter().position(|&n| n == edge.to) {
                        let mut cycle: Vec<String> = stack[pos..]
                            .iter()
                            .map(|&n| self.nodes[n].name.clone())
                            .collect();
                        if let Some(min) = (0..cycle.len()).min_by(|&a, &b| cycle[a].cmp(&cycle[b])) {
                            cycle.rotate_left(min);
                        }
                        if !cycles.contains(&cycle) {
                            cycles.push(cycle);
                        }
                    }
                },
                Mark::Black => {},
            }
        }
        stack.pop();
        marks[node] = Mark::Black;
    }

    /// Node for `name`.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Plugins `name` depends on, with edge kinds.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<(&GraphNode, EdgeKind)> {
        let Some(&i) = self.index.get(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.from == i)
            .map(|e| (&self.nodes[e.to], e.kind))
            .collect()
    }

    /// Plugins depending on `name`, with edge kinds.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<(&GraphNode, EdgeKind)> {
        let Some(&i) = self.index.get(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|e| e.to == i)
            .map(|e| (&self.nodes[e.from], e.kind))
            .collect()
    }

    /// All nodes, ordered by name.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// All edges.
    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Cycles over required edges.
    #[must_use]
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
