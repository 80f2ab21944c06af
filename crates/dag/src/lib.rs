// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::hash::Hash;

use petgraph::{
    graph::{DiGraph, NodeIndex},
    Direction,
};

pub use self::topo::Cycle;

mod topo;

/// A directed graph over copy-cheap node weights with a
/// weight -> index lookup, used for dependency ordering.
///
/// Edges point from a node to the nodes it depends on. A
/// depth first post-order emits dependencies before dependents.
pub struct Dag<N>
where
    N: Clone + Eq + Hash,
{
    graph: DiGraph<N, ()>,
    indices: HashMap<N, NodeIndex>,
}

impl<N> Default for Dag<N>
where
    N: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self {
            graph: DiGraph::default(),
            indices: HashMap::default(),
        }
    }
}

impl<N> Dag<N>
where
    N: Clone + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `node` if not yet present, returning its index
    pub fn add_node(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.indices.get(&node) {
            *index
        } else {
            let index = self.graph.add_node(node.clone());
            self.indices.insert(node, index);
            index
        }
    }

    /// Record that `node` depends on `dependency`. Both are added
    /// if not yet present. Parallel edges are collapsed.
    pub fn add_dependency(&mut self, node: N, dependency: N) {
        let a = self.add_node(node);
        let b = self.add_node(dependency);

        if !self.graph.contains_edge(a, b) {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains(&self, node: &N) -> bool {
        self.indices.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &N> + '_ {
        self.graph.node_weights()
    }

    /// Direct dependencies of `node` (outgoing edges), name sorted
    pub fn dependencies(&self, node: &N) -> Vec<N> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Direct dependents of `node` (incoming edges), name sorted
    pub fn dependents(&self, node: &N) -> Vec<N> {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: &N, direction: Direction) -> Vec<N> {
        let Some(index) = self.indices.get(node) else {
            return vec![];
        };

        let mut nodes = self
            .graph
            .neighbors_directed(*index, direction)
            .map(|index| self.graph[index].clone())
            .collect::<Vec<_>>();
        nodes.sort();
        nodes
    }

    /// Topological order over the subgraph reachable from `starts`,
    /// dependencies before dependents.
    ///
    /// Iterative DFS with gray / black coloring. Revisiting a gray
    /// node is a cycle and yields [`Cycle`] naming its path. Sibling
    /// order is the node weight ordering, stable across runs.
    pub fn topo_sort(&self, starts: impl IntoIterator<Item = N>) -> Result<Vec<N>, Cycle<N>> {
        let mut start_indices = starts
            .into_iter()
            .filter_map(|node| self.indices.get(&node).copied())
            .collect::<Vec<_>>();
        start_indices.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        topo::sort(&self.graph, &start_indices)
    }

    /// Topological order over the entire graph
    pub fn topo_sort_all(&self) -> Result<Vec<N>, Cycle<N>> {
        let mut start_indices = self.graph.node_indices().collect::<Vec<_>>();
        start_indices.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        topo::sort(&self.graph, &start_indices)
    }

    /// Transitive closure of nodes reachable from `start`, excluding it
    pub fn transitive_dependencies(&self, start: &N) -> Vec<N> {
        let Some(index) = self.indices.get(start) else {
            return vec![];
        };

        let mut visited = vec![false; self.graph.node_count()];
        visited[index.index()] = true;

        let mut stack = vec![*index];
        let mut out = vec![];

        while let Some(node) = stack.pop() {
            let mut neighbors = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect::<Vec<_>>();
            neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

            for adj in neighbors {
                if !visited[adj.index()] {
                    visited[adj.index()] = true;
                    out.push(self.graph[adj].clone());
                    stack.push(adj);
                }
            }
        }

        out.sort();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for (a, b) in edges {
            dag.add_dependency((*a).to_owned(), (*b).to_owned());
        }
        dag
    }

    #[test]
    fn deps_before_dependents() {
        let dag = graph(&[("app", "libfoo"), ("app", "libbar"), ("libfoo", "libbar")]);

        let order = dag.topo_sort(["app".to_owned()]).unwrap();
        assert_eq!(order, vec!["libbar", "libfoo", "app"]);
    }

    #[test]
    fn sibling_tie_break_is_sorted() {
        let dag = graph(&[("top", "zeta"), ("top", "alpha"), ("top", "mid")]);

        let order = dag.topo_sort(["top".to_owned()]).unwrap();
        assert_eq!(order, vec!["alpha", "mid", "zeta", "top"]);
    }

    #[test]
    fn cycle_reports_path() {
        let dag = graph(&[("a", "b"), ("b", "c"), ("c", "a")]);

        let cycle = dag.topo_sort(["a".to_owned()]).unwrap_err();
        for node in ["a", "b", "c"] {
            assert!(cycle.path.iter().any(|n| n == node), "{node} missing from cycle path");
        }
    }

    #[test]
    fn dependents_are_direct_only() {
        let dag = graph(&[("app", "libfoo"), ("tool", "libfoo"), ("libfoo", "libc")]);

        assert_eq!(dag.dependents(&"libfoo".to_owned()), vec!["app", "tool"]);
        assert_eq!(dag.dependents(&"libc".to_owned()), vec!["libfoo"]);
        assert!(dag.dependents(&"app".to_owned()).is_empty());
    }

    #[test]
    fn transitive_dependencies_exclude_start() {
        let dag = graph(&[("app", "libfoo"), ("libfoo", "libc")]);

        assert_eq!(dag.transitive_dependencies(&"app".to_owned()), vec!["libc", "libfoo"]);
    }
}
