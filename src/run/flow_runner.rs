// src/run/flow_runner.rs

//! The flow scheduling core.
//!
//! Walks the DAG in topological order, dispatching every task to a
//! [`TaskRunner`] through the executor, then waits on the tasks that matter
//! and classifies the run. The runner itself is single-threaded: it only
//! blocks when a non-mapped task needs a mapped upstream's fan-out shape,
//! and at the final aggregation barrier.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::{self, RunContext};
use crate::errors::{EngineError, Result};
use crate::exec::{
    ready_state, validate_throttle, Executor, LocalExecutor, StateFuture, TagQueue,
    TimeoutHandler, UnitFuture,
};
use crate::flow::{Edge, Flow, Task, TaskName};
use crate::run::{call_flow_handlers, EndRun, TaskRunOpts, TaskRunner};
use crate::state::{Inputs, Payload, State};

/// Options for one flow run. `..Default::default()` fills the usual case:
/// start from the roots with a fresh `Pending` state on a local executor.
pub struct FlowRunOpts {
    /// Starting flow state (defaults to `Pending`).
    pub state: Option<State>,
    /// Initial task states, keyed by task name.
    pub task_states: HashMap<TaskName, State>,
    /// Tasks to begin computation from (empty means the flow's roots).
    pub start_tasks: Vec<TaskName>,
    /// Tasks whose final states the returned flow state carries.
    pub return_tasks: BTreeSet<TaskName>,
    /// Also return every failed or retrying task.
    pub return_failed: bool,
    /// Caller parameters, surfaced to tasks as `_parameters`.
    pub parameters: BTreeMap<String, Value>,
    /// Base run context; well-known keys are layered on top.
    pub context: RunContext,
    /// Per-task context overrides, merged over the run context at dispatch.
    pub task_contexts: HashMap<TaskName, BTreeMap<String, Value>>,
    /// Per-tag concurrency budgets (defaults to the flow's own map).
    pub throttle: Option<BTreeMap<String, usize>>,
    pub executor: Arc<dyn Executor>,
}

impl Default for FlowRunOpts {
    fn default() -> Self {
        Self {
            state: None,
            task_states: HashMap::new(),
            start_tasks: Vec::new(),
            return_tasks: BTreeSet::new(),
            return_failed: false,
            parameters: BTreeMap::new(),
            context: RunContext::new(),
            task_contexts: HashMap::new(),
            throttle: None,
            executor: Arc::new(LocalExecutor::new()),
        }
    }
}

/// Validated per-run inputs, carried through the dispatch code.
struct RunPlan {
    task_states: HashMap<TaskName, State>,
    start_tasks: Vec<TaskName>,
    return_tasks: BTreeSet<TaskName>,
    return_failed: bool,
    task_contexts: HashMap<TaskName, BTreeMap<String, Value>>,
    throttle: BTreeMap<String, usize>,
    executor: Arc<dyn Executor>,
    context: RunContext,
}

/// Internal control flow of the scheduling body.
enum FlowError {
    End(EndRun),
    Unexpected(anyhow::Error),
}

impl From<EndRun> for FlowError {
    fn from(end: EndRun) -> Self {
        FlowError::End(end)
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        FlowError::Unexpected(err)
    }
}

type FlowStep<T> = std::result::Result<T, FlowError>;

/// Drives a [`Flow`] run to a final state.
pub struct FlowRunner {
    flow: Arc<Flow>,
}

impl FlowRunner {
    pub fn new(flow: Arc<Flow>) -> Self {
        Self { flow }
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Run the flow. `Err` is reserved for configuration problems detected
    /// before any dispatch; everything that happens during scheduling folds
    /// into the returned state (unless `_raise_on_exception` is set in the
    /// context).
    pub async fn run(&self, opts: FlowRunOpts) -> Result<State> {
        let FlowRunOpts {
            state,
            task_states,
            start_tasks,
            return_tasks,
            return_failed,
            parameters,
            context,
            task_contexts,
            throttle,
            executor,
        } = opts;

        let throttle = throttle.unwrap_or_else(|| self.flow.throttle().clone());
        validate_throttle(&throttle)?;

        let missing: Vec<&str> = return_tasks
            .iter()
            .filter(|t| !self.flow.contains(t))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Config(format!(
                "some tasks in return_tasks were not found in the flow: {}",
                missing.join(", ")
            )));
        }

        for name in &start_tasks {
            if !self.flow.contains(name) {
                return Err(EngineError::UnknownTask(format!(
                    "start task '{name}' is not in the flow"
                )));
            }
        }

        let context = context.extended([
            (context::FLOW_NAME, json!(self.flow.name())),
            (
                context::FLOW_VERSION,
                self.flow.version().map(|v| json!(v)).unwrap_or(Value::Null),
            ),
            (
                context::PARAMETERS,
                Value::Object(parameters.into_iter().collect()),
            ),
            (context::EXECUTOR_ID, json!(executor.executor_id())),
        ]);
        let raise_on_exception = context.flag(context::RAISE_ON_EXCEPTION);

        let plan = RunPlan {
            task_states,
            start_tasks,
            return_tasks,
            return_failed,
            task_contexts,
            throttle,
            executor,
            context,
        };

        let state = state.unwrap_or_default();
        info!(
            flow = %self.flow.name(),
            executor = plan.executor.executor_id(),
            "starting flow run"
        );

        match self.run_inner(state, plan).await {
            Ok(state) => Ok(state),
            Err(FlowError::End(EndRun(state))) => Ok(state),
            Err(FlowError::Unexpected(err)) => {
                if raise_on_exception {
                    Err(EngineError::Other(err))
                } else {
                    warn!(
                        flow = %self.flow.name(),
                        error = %err,
                        "unexpected error while running flow"
                    );
                    Ok(State::failed(format!(
                        "Unexpected error while running flow: {err:#}"
                    )))
                }
            }
        }
    }

    async fn run_inner(&self, state: State, plan: RunPlan) -> FlowStep<State> {
        let state = self.check_flow_is_pending_or_running(state)?;
        let state = self.set_flow_to_running(state)?;
        self.get_flow_run_state(state, plan).await
    }

    /// Fail fast unless the flow can (still) run. A finished flow, or one in
    /// a state that is neither pending nor running, ends the run as-is.
    fn check_flow_is_pending_or_running(&self, state: State) -> FlowStep<State> {
        if state.is_finished() {
            debug!(flow = %self.flow.name(), "flow run has already finished");
            return Err(EndRun(state).into());
        }
        if !(state.is_pending() || state.is_running()) {
            debug!(flow = %self.flow.name(), state = %state, "flow is not ready to run");
            return Err(EndRun(state).into());
        }
        Ok(state)
    }

    /// `Pending` flows start running; already-running flows pass through
    /// (simultaneous runs of one flow are allowed).
    fn set_flow_to_running(&self, state: State) -> FlowStep<State> {
        if state.is_pending() {
            debug!(flow = %self.flow.name(), "beginning flow run");
            let new = State::running().with_message("Running flow.");
            Ok(call_flow_handlers(&self.flow, &state, new))
        } else if state.is_running() {
            Ok(state)
        } else {
            Err(EndRun(state).into())
        }
    }

    /// Dispatch every task, then gather and classify.
    async fn get_flow_run_state(&self, state: State, plan: RunPlan) -> FlowStep<State> {
        if !state.is_running() {
            debug!(flow = %self.flow.name(), "flow is not in a running state");
            return Err(EndRun(state).into());
        }

        let RunPlan {
            task_states,
            start_tasks,
            mut return_tasks,
            return_failed,
            task_contexts,
            throttle,
            executor,
            context,
        } = plan;

        let _session = executor.start();

        let queues: BTreeMap<String, TagQueue> = throttle
            .iter()
            .map(|(tag, &size)| (tag.clone(), executor.ticket_queue(tag, size)))
            .collect();

        let start_set: HashSet<&str> = start_tasks.iter().map(String::as_str).collect();
        let timeout_handler = executor.timeout_handler();

        // Task handles, keyed by name. Provided initial states double as the
        // upstream states of tasks this run never dispatches.
        let mut futures_map: HashMap<TaskName, StateFuture> = task_states
            .iter()
            .map(|(name, state)| (name.clone(), ready_state(state.clone())))
            .collect();

        for name in self.flow.sorted_tasks(&start_tasks) {
            let Some(task) = self.flow.task(&name) else {
                return Err(anyhow::anyhow!("task '{name}' missing from flow").into());
            };
            let is_start = start_set.contains(name.as_str());

            let mut upstream: Vec<(Edge, StateFuture)> = Vec::new();
            for edge in self.flow.edges_to(&name) {
                let fut = futures_map
                    .get(&edge.upstream)
                    .cloned()
                    .unwrap_or_else(|| ready_state(State::failed("Task state not available.")));
                upstream.push((edge.clone(), fut));
            }

            // A start task handed in with a Pending state brings its own
            // cached inputs along.
            let mut extra_inputs = Inputs::new();
            if is_start {
                if let Some(cached) = task_states.get(&name).and_then(State::cached_inputs) {
                    extra_inputs = cached.clone();
                }
            }

            let initial_state = task_states.get(&name).cloned().unwrap_or_default();

            // Tags are a BTreeSet, so the queue list arrives sorted and
            // unique — the acquisition-order invariant starts here.
            let task_queues: Vec<TagQueue> = task
                .tags
                .iter()
                .filter_map(|tag| queues.get(tag).cloned())
                .collect();

            let task_context = match task_contexts.get(&name) {
                Some(extra) => context.extended(extra.clone()),
                None => context.clone(),
            };

            let fut = if task.mapped {
                let prep = Self::prepare_mapped(
                    Arc::clone(task),
                    upstream,
                    initial_state,
                    extra_inputs,
                    is_start,
                    task_context,
                    task_queues,
                    timeout_handler,
                )
                .boxed();
                executor.map(&name, prep)
            } else {
                // Materialise mapped upstreams now so this task sees the
                // full child sequence when deciding its inputs. Mapped
                // downstreams instead receive their mapped upstream lazily
                // inside prepare_mapped — the fan-out itself needs it.
                let mut resolved = Vec::with_capacity(upstream.len());
                for (edge, fut) in upstream {
                    if self.flow.is_mapped(&edge.upstream) {
                        let state = fut.clone().await;
                        resolved.push((edge, ready_state(state)));
                    } else {
                        resolved.push((edge, fut));
                    }
                }
                let unit = Self::task_unit(
                    Arc::clone(task),
                    resolved,
                    initial_state,
                    extra_inputs,
                    is_start,
                    task_context,
                    task_queues,
                    timeout_handler,
                )
                .boxed();
                executor.submit(&name, unit)
            };

            debug!(task = %name, mapped = task.mapped, "dispatched task");
            futures_map.insert(name, fut);
        }

        // ------------------------------------------------------------------
        // Collect results.
        // ------------------------------------------------------------------

        let terminal_tasks = self.flow.terminal_tasks();
        let reference_tasks = self.flow.reference_tasks();

        let mut final_states: BTreeMap<TaskName, State> = BTreeMap::new();
        if return_failed {
            for (name, fut) in &futures_map {
                final_states.insert(name.clone(), fut.clone().await);
            }
            for (name, state) in &final_states {
                if state.is_failed() || state.is_retrying() {
                    return_tasks.insert(name.clone());
                }
            }
        } else {
            let wanted: BTreeSet<&TaskName> = terminal_tasks
                .iter()
                .chain(reference_tasks.iter())
                .chain(return_tasks.iter())
                .collect();
            for name in wanted {
                let state = match futures_map.get(name) {
                    Some(fut) => fut.clone().await,
                    None => State::failed("Task state not available."),
                };
                final_states.insert(name.clone(), state);
            }
        }

        let missing_state = State::failed("Task state not available.");
        let state_of = |name: &TaskName| final_states.get(name).unwrap_or(&missing_state);

        let terminal_leaves: Vec<&State> = terminal_tasks
            .iter()
            .flat_map(|t| state_of(t).flatten())
            .collect();
        let key_leaves: Vec<&State> = reference_tasks
            .iter()
            .flat_map(|t| state_of(t).flatten())
            .collect();
        let return_states: BTreeMap<TaskName, State> = return_tasks
            .iter()
            .map(|t| (t.clone(), state_of(t).clone()))
            .collect();

        let final_state = if !terminal_leaves.iter().all(|s| s.is_finished()) {
            info!(flow = %self.flow.name(), "flow run PENDING: terminal tasks are incomplete");
            State::pending()
                .with_message("Some terminal tasks are still pending.")
                .with_result(Payload::States(return_states))
        } else if key_leaves.iter().any(|s| s.is_failed()) {
            info!(flow = %self.flow.name(), "flow run FAILED: some reference tasks failed");
            State::failed("Some reference tasks failed.")
                .with_result(Payload::States(return_states))
        } else if key_leaves.iter().all(|s| s.is_successful()) {
            info!(flow = %self.flow.name(), "flow run SUCCESS: all reference tasks succeeded");
            State::success(None)
                .with_message("All reference tasks succeeded.")
                .with_result(Payload::States(return_states))
        } else {
            info!(flow = %self.flow.name(), "flow run SUCCESS: no reference tasks failed");
            State::success(None)
                .with_message("No reference tasks failed.")
                .with_result(Payload::States(return_states))
        };

        Ok(call_flow_handlers(&self.flow, &state, final_state))
    }

    /// One non-mapped dispatch unit: resolve upstream handles, then run the
    /// task pipeline.
    #[allow(clippy::too_many_arguments)]
    async fn task_unit(
        task: Arc<Task>,
        upstream: Vec<(Edge, StateFuture)>,
        state: State,
        inputs: Inputs,
        ignore_trigger: bool,
        context: RunContext,
        queues: Vec<TagQueue>,
        timeout_handler: TimeoutHandler,
    ) -> State {
        let mut upstream_states = HashMap::with_capacity(upstream.len());
        for (edge, fut) in upstream {
            upstream_states.insert(edge, fut.await);
        }

        TaskRunner::new(task)
            .run(TaskRunOpts {
                state,
                upstream_states,
                inputs,
                ignore_trigger,
                context,
                queues,
                timeout_handler,
            })
            .await
    }

    /// Fan-out preparation for a mapped task: resolve upstream states,
    /// derive the width (elementwise zip over mapped edges), and build one
    /// pipeline unit per element with the element's substituted upstream
    /// states.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_mapped(
        task: Arc<Task>,
        upstream: Vec<(Edge, StateFuture)>,
        state: State,
        inputs: Inputs,
        ignore_trigger: bool,
        context: RunContext,
        queues: Vec<TagQueue>,
        timeout_handler: TimeoutHandler,
    ) -> std::result::Result<Vec<UnitFuture>, State> {
        let mut resolved: Vec<(Edge, State)> = Vec::with_capacity(upstream.len());
        for (edge, fut) in upstream {
            resolved.push((edge, fut.await));
        }

        let mut width: Option<usize> = None;
        for (edge, upstream_state) in resolved.iter().filter(|(e, _)| e.mapped) {
            let count = match upstream_state.children() {
                Some(children) => Some(children.len()),
                None => upstream_state
                    .result_value()
                    .and_then(Value::as_array)
                    .map(Vec::len),
            };
            let Some(count) = count else {
                return Err(State::failed(format!(
                    "Mapped input '{}' of task '{}' is not a sequence.",
                    edge.key.as_deref().unwrap_or(&edge.upstream),
                    task.name
                )));
            };
            width = Some(width.map_or(count, |w| w.min(count)));
        }

        let Some(width) = width else {
            return Err(State::failed(format!(
                "Mapped task '{}' has no mapped upstream edges.",
                task.name
            )));
        };

        debug!(task = %task.name, width, "prepared mapped fan-out");

        let mut units: Vec<UnitFuture> = Vec::with_capacity(width);
        for index in 0..width {
            let mut child_upstream = HashMap::with_capacity(resolved.len());
            for (edge, upstream_state) in &resolved {
                let child_state = if edge.mapped {
                    mapped_element(upstream_state, index)
                } else {
                    upstream_state.clone()
                };
                child_upstream.insert(edge.clone(), child_state);
            }

            // A provided Mapped state distributes its children by index.
            let child_initial = match state.children() {
                Some(children) => children.get(index).cloned().unwrap_or_default(),
                None => state.clone(),
            };

            let runner = TaskRunner::new(Arc::clone(&task));
            let opts = TaskRunOpts {
                state: child_initial,
                upstream_states: child_upstream,
                inputs: inputs.clone(),
                ignore_trigger,
                context: context.clone(),
                queues: queues.clone(),
                timeout_handler,
            };
            units.push(async move { runner.run(opts).await }.boxed());
        }

        Ok(units)
    }
}

/// The state a fan-out child sees for a mapped edge: the matching child of a
/// `Mapped` upstream, or the upstream state with its result narrowed to the
/// index-th element of its sequence.
fn mapped_element(upstream: &State, index: usize) -> State {
    if let Some(children) = upstream.children() {
        return children
            .get(index)
            .cloned()
            .unwrap_or_else(|| State::failed("Missing mapped child state."));
    }

    let element = upstream
        .result_value()
        .and_then(Value::as_array)
        .and_then(|items| items.get(index))
        .cloned()
        .unwrap_or(Value::Null);

    let mut child = upstream.clone();
    child.result = Some(Payload::Value(element));
    child
}
