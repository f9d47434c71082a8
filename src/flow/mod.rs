// src/flow/mod.rs

//! The immutable flow model: tasks, edges, and the DAG over them.
//!
//! A [`Flow`] is frozen at build time; [`FlowBuilder::build`] validates the
//! whole structure (edge endpoints, duplicate input keys, the reference
//! set, acyclicity) so the runners can assume a well-formed graph.

pub mod graph;
pub mod task;
pub mod triggers;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::errors::{EngineError, Result};
use crate::state::State;

pub use graph::FlowGraph;
pub use task::{
    CacheValidator, Edge, Task, TaskBuilder, TaskFn, TaskFuture, TaskStateHandler, Trigger,
};

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

/// Interceptor invoked on every flow-level state transition.
pub type FlowStateHandler = Arc<dyn Fn(&Flow, &State, State) -> State + Send + Sync>;

/// An immutable DAG of tasks plus run-relevant metadata.
pub struct Flow {
    name: String,
    version: Option<String>,
    tasks: BTreeMap<TaskName, Arc<Task>>,
    edges: Vec<Edge>,
    graph: FlowGraph,
    reference_tasks: Option<BTreeSet<TaskName>>,
    state_handlers: Vec<FlowStateHandler>,
    throttle: BTreeMap<String, usize>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("reference_tasks", &self.reference_tasks)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Incoming edges of `name`.
    pub fn edges_to(&self, name: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.downstream == name).collect()
    }

    /// Outgoing edges of `name`.
    pub fn edges_from(&self, name: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.upstream == name).collect()
    }

    /// Tasks with no incoming edges.
    pub fn root_tasks(&self) -> Vec<TaskName> {
        self.tasks
            .keys()
            .filter(|name| self.graph.dependencies_of(name).is_empty())
            .cloned()
            .collect()
    }

    /// Tasks with no outgoing edges.
    pub fn terminal_tasks(&self) -> Vec<TaskName> {
        self.tasks
            .keys()
            .filter(|name| self.graph.dependents_of(name).is_empty())
            .cloned()
            .collect()
    }

    /// The tasks whose combined state classifies the flow run. Defaults to
    /// the terminal tasks.
    pub fn reference_tasks(&self) -> BTreeSet<TaskName> {
        match &self.reference_tasks {
            Some(set) => set.clone(),
            None => self.terminal_tasks().into_iter().collect(),
        }
    }

    /// Topological order restricted to the subgraph reachable from `roots`
    /// (the whole flow when `roots` is empty).
    pub fn sorted_tasks(&self, roots: &[TaskName]) -> Vec<TaskName> {
        self.graph.sorted_from(roots)
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn state_handlers(&self) -> &[FlowStateHandler] {
        &self.state_handlers
    }

    /// Default per-tag concurrency budgets for this flow.
    pub fn throttle(&self) -> &BTreeMap<String, usize> {
        &self.throttle
    }

    pub(crate) fn is_mapped(&self, name: &str) -> bool {
        self.tasks.get(name).map(|t| t.mapped).unwrap_or(false)
    }
}

/// Builder for [`Flow`]; all validation happens in [`FlowBuilder::build`].
pub struct FlowBuilder {
    name: String,
    version: Option<String>,
    tasks: Vec<Task>,
    edges: Vec<Edge>,
    reference_tasks: Option<BTreeSet<TaskName>>,
    state_handlers: Vec<FlowStateHandler>,
    throttle: BTreeMap<String, usize>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            tasks: Vec::new(),
            edges: Vec::new(),
            reference_tasks: None,
            state_handlers: Vec::new(),
            throttle: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Pure ordering dependency: `upstream` before `downstream`, no data.
    pub fn dependency(self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edge(Edge::new(upstream, downstream))
    }

    /// Override the reference set used for flow-state classification.
    pub fn reference_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_tasks = Some(tasks.into_iter().map(Into::into).collect());
        self
    }

    /// Append a flow-level state handler; handlers run in registration order.
    pub fn state_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Flow, &State, State) -> State + Send + Sync + 'static,
    {
        self.state_handlers.push(Arc::new(f));
        self
    }

    /// Cap the number of concurrently running tasks carrying `tag`.
    pub fn throttle(mut self, tag: impl Into<String>, size: usize) -> Self {
        self.throttle.insert(tag.into(), size);
        self
    }

    pub fn build(self) -> Result<Flow> {
        let mut tasks: BTreeMap<TaskName, Arc<Task>> = BTreeMap::new();
        for task in self.tasks {
            if tasks.contains_key(&task.name) {
                return Err(EngineError::Config(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            tasks.insert(task.name.clone(), Arc::new(task));
        }

        let mut seen_keys: BTreeSet<(TaskName, String)> = BTreeSet::new();
        for edge in &self.edges {
            for endpoint in [&edge.upstream, &edge.downstream] {
                if !tasks.contains_key(endpoint) {
                    return Err(EngineError::UnknownTask(format!(
                        "edge {} -> {} references unknown task '{}'",
                        edge.upstream, edge.downstream, endpoint
                    )));
                }
            }
            if edge.upstream == edge.downstream {
                return Err(EngineError::Config(format!(
                    "task '{}' cannot depend on itself",
                    edge.upstream
                )));
            }
            if let Some(key) = &edge.key {
                if !seen_keys.insert((edge.downstream.clone(), key.clone())) {
                    return Err(EngineError::Config(format!(
                        "multiple edges feed input '{}' of task '{}'",
                        key, edge.downstream
                    )));
                }
            }
        }

        if let Some(reference) = &self.reference_tasks {
            for name in reference {
                if !tasks.contains_key(name) {
                    return Err(EngineError::UnknownTask(format!(
                        "reference task '{}' is not in the flow",
                        name
                    )));
                }
            }
        }

        let graph = FlowGraph::build(tasks.keys(), &self.edges)?;

        Ok(Flow {
            name: self.name,
            version: self.version,
            tasks,
            edges: self.edges,
            graph,
            reference_tasks: self.reference_tasks,
            state_handlers: self.state_handlers,
            throttle: self.throttle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Task {
        Task::builder(name).build()
    }

    #[test]
    fn roots_terminals_and_reference_default() {
        let flow = Flow::builder("diamond")
            .task(noop("a"))
            .task(noop("b"))
            .task(noop("c"))
            .task(noop("d"))
            .dependency("a", "b")
            .dependency("a", "c")
            .dependency("b", "d")
            .dependency("c", "d")
            .build()
            .expect("valid flow");

        assert_eq!(flow.root_tasks(), vec!["a".to_string()]);
        assert_eq!(flow.terminal_tasks(), vec!["d".to_string()]);
        assert_eq!(
            flow.reference_tasks(),
            BTreeSet::from(["d".to_string()])
        );
    }

    #[test]
    fn duplicate_input_key_is_rejected() {
        let err = Flow::builder("dup")
            .task(noop("a"))
            .task(noop("b"))
            .task(noop("c"))
            .edge(Edge::new("a", "c").with_key("x"))
            .edge(Edge::new("b", "c").with_key("x"))
            .build()
            .expect_err("duplicate key");
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let err = Flow::builder("bad")
            .task(noop("a"))
            .dependency("a", "ghost")
            .build()
            .expect_err("unknown endpoint");
        assert!(matches!(err, EngineError::UnknownTask(_)));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = Flow::builder("cyclic")
            .task(noop("a"))
            .task(noop("b"))
            .dependency("a", "b")
            .dependency("b", "a")
            .build()
            .expect_err("cycle");
        assert!(matches!(err, EngineError::DagCycle(_)));
    }

    #[test]
    fn sorted_tasks_from_mid_graph_root() {
        let flow = Flow::builder("chain")
            .task(noop("a"))
            .task(noop("b"))
            .task(noop("c"))
            .dependency("a", "b")
            .dependency("b", "c")
            .build()
            .expect("valid flow");

        assert_eq!(
            flow.sorted_tasks(&["b".to_string()]),
            vec!["b".to_string(), "c".to_string()]
        );
    }
}
