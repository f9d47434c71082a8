// src/flow/graph.rs

//! Name-keyed adjacency for a flow's DAG.
//!
//! Acyclicity is proven once at build time with a petgraph toposort; after
//! that the graph only answers adjacency and ordering queries. Node
//! insertion happens in sorted name order so the topological order is
//! deterministic for a given flow.

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};
use crate::flow::{Edge, TaskName};

#[derive(Debug, Clone, Default)]
struct Node {
    /// Direct upstream tasks.
    deps: Vec<TaskName>,
    /// Direct downstream tasks.
    dependents: Vec<TaskName>,
}

/// Immutable adjacency + topological order for a validated flow.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: BTreeMap<TaskName, Node>,
    topo: Vec<TaskName>,
}

impl FlowGraph {
    /// Build the graph, failing with [`EngineError::DagCycle`] on a cycle.
    ///
    /// Assumes edge endpoints were already checked against the task set.
    pub fn build<'a, I>(task_names: I, edges: &[Edge]) -> Result<Self>
    where
        I: IntoIterator<Item = &'a TaskName>,
    {
        let mut nodes: BTreeMap<TaskName, Node> = task_names
            .into_iter()
            .map(|name| (name.clone(), Node::default()))
            .collect();

        for edge in edges {
            if let Some(node) = nodes.get_mut(&edge.upstream) {
                node.dependents.push(edge.downstream.clone());
            }
            if let Some(node) = nodes.get_mut(&edge.downstream) {
                node.deps.push(edge.upstream.clone());
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in nodes.keys() {
            graph.add_node(name.as_str());
        }
        for edge in edges {
            graph.add_edge(edge.upstream.as_str(), edge.downstream.as_str(), ());
        }

        let topo = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(str::to_string).collect(),
            Err(cycle) => {
                return Err(EngineError::DagCycle(format!(
                    "cycle involving task '{}'",
                    cycle.node_id()
                )));
            }
        };

        Ok(Self { nodes, topo })
    }

    /// All task names, in sorted order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Direct upstream tasks of `name`.
    pub fn dependencies_of(&self, name: &str) -> &[TaskName] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Direct downstream tasks of `name`.
    pub fn dependents_of(&self, name: &str) -> &[TaskName] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Full topological order over the whole flow.
    pub fn topo_order(&self) -> &[TaskName] {
        &self.topo
    }

    /// Topological order restricted to `roots` and everything reachable
    /// downstream of them. An empty `roots` slice means the whole flow.
    pub fn sorted_from(&self, roots: &[TaskName]) -> Vec<TaskName> {
        if roots.is_empty() {
            return self.topo.clone();
        }

        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if !reachable.insert(name) {
                continue;
            }
            for dep in self.dependents_of(name) {
                stack.push(dep.as_str());
            }
        }

        self.topo
            .iter()
            .filter(|name| reachable.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(up: &str, down: &str) -> Edge {
        Edge::new(up, down)
    }

    fn names(items: &[&str]) -> Vec<TaskName> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn topo_order_respects_edges() {
        let tasks = names(&["a", "b", "c", "d"]);
        let edges = vec![edge("a", "b"), edge("b", "d"), edge("a", "c"), edge("c", "d")];
        let graph = FlowGraph::build(tasks.iter(), &edges).expect("acyclic");

        let order = graph.topo_order();
        let pos = |n: &str| order.iter().position(|x| x == n).expect("present");
        for e in &edges {
            assert!(pos(&e.upstream) < pos(&e.downstream), "{e:?} out of order");
        }
    }

    #[test]
    fn cycle_is_rejected() {
        let tasks = names(&["a", "b"]);
        let edges = vec![edge("a", "b"), edge("b", "a")];
        let err = FlowGraph::build(tasks.iter(), &edges).expect_err("cycle");
        assert!(matches!(err, EngineError::DagCycle(_)));
    }

    #[test]
    fn sorted_from_restricts_to_reachable() {
        let tasks = names(&["a", "b", "c", "x"]);
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("x", "c")];
        let graph = FlowGraph::build(tasks.iter(), &edges).expect("acyclic");

        let from_b = graph.sorted_from(&names(&["b"]));
        assert_eq!(from_b, names(&["b", "c"]));

        let all = graph.sorted_from(&[]);
        assert_eq!(all.len(), 4);
    }
}
