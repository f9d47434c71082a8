// src/run/task_runner.rs

//! The per-task state machine.
//!
//! One invocation drives a task from whatever state the caller supplies to
//! either a finished state or a deferred one (`Pending` when upstreams are
//! incomplete, `Retrying`/`Scheduled` when the task must wait). Re-entering
//! on a finished state returns it unchanged, so the runner is safe to call
//! again on completed work.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::exec::{TagQueue, TagTicket, TimeoutHandler};
use crate::flow::{Edge, Task};
use crate::run::{call_task_handlers, EndRun, Step};
use crate::state::{CacheEntry, Inputs, Payload, Signal, State, StateKind};

/// Everything one task invocation needs, bundled by the flow runner.
pub struct TaskRunOpts {
    /// Starting state (defaults to `Pending`).
    pub state: State,
    /// Resolved state of each incoming edge's upstream task.
    pub upstream_states: HashMap<Edge, State>,
    /// Caller-supplied inputs; these override upstream-derived ones.
    pub inputs: Inputs,
    /// Skip the upstream-finished and trigger checks (start tasks).
    pub ignore_trigger: bool,
    /// The merged run + per-task context snapshot.
    pub context: RunContext,
    /// Ticket pools for this task's throttled tags.
    pub queues: Vec<TagQueue>,
    /// Wall-clock enforcement from the executor.
    pub timeout_handler: TimeoutHandler,
}

impl Default for TaskRunOpts {
    fn default() -> Self {
        Self {
            state: State::pending(),
            upstream_states: HashMap::new(),
            inputs: Inputs::new(),
            ignore_trigger: false,
            context: RunContext::new(),
            queues: Vec::new(),
            timeout_handler: TimeoutHandler,
        }
    }
}

/// Drives a single task through its lifecycle.
pub struct TaskRunner {
    task: Arc<Task>,
}

impl TaskRunner {
    pub fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run the pipeline once and return the task's state for this
    /// invocation. Never panics on user errors; everything folds into a
    /// state.
    pub async fn run(&self, opts: TaskRunOpts) -> State {
        let TaskRunOpts {
            state,
            upstream_states,
            inputs,
            ignore_trigger,
            context,
            queues,
            timeout_handler,
        } = opts;

        // This invocation's attempt number: one past the attempts already
        // recorded on a Retrying state.
        let attempt = state.run_count().unwrap_or(0) + 1;

        debug!(task = %self.task.name, state = %state, attempt, "task runner starting");

        let outcome = self
            .pipeline(
                state,
                &upstream_states,
                inputs,
                ignore_trigger,
                &context,
                &queues,
                timeout_handler,
                attempt,
            )
            .await;

        let final_state = match outcome {
            Ok(state) => state,
            Err(EndRun(state)) => state,
        };

        debug!(task = %self.task.name, state = %final_state, "task runner finished");
        final_state
    }

    #[allow(clippy::too_many_arguments)]
    async fn pipeline(
        &self,
        state: State,
        upstream_states: &HashMap<Edge, State>,
        extra_inputs: Inputs,
        ignore_trigger: bool,
        context: &RunContext,
        queues: &[TagQueue],
        timeout_handler: TimeoutHandler,
        attempt: u32,
    ) -> Step {
        let upstream_flat: Vec<&State> = upstream_states
            .values()
            .flat_map(State::flatten)
            .collect();

        let state = self.check_task_is_ready(state)?;
        let state = self.check_upstream_finished(state, &upstream_flat, ignore_trigger)?;
        let state = self.check_upstream_skipped(state, &upstream_flat)?;
        let state = self.check_trigger(state, &upstream_flat, ignore_trigger)?;

        let inputs = self.resolve_inputs(&state, upstream_states, extra_inputs);

        let state = self.check_task_is_cached(state, &inputs)?;

        // Tickets are held before the task shows as Running and released
        // once the outcome is known, so the per-tag budget bounds the
        // number of Running tasks at any instant.
        let tickets = self.acquire_tickets(&state, queues).await?;

        let state = self.set_task_to_running(state)?;
        let state = self
            .run_task(state, inputs.clone(), context, timeout_handler, attempt)
            .await;
        drop(tickets);

        self.cache_result(state, &inputs)
    }

    /// Take one ticket from each of the task's tag queues, in sorted-tag
    /// order (deadlock freedom between tasks sharing overlapping tag sets).
    async fn acquire_tickets(
        &self,
        state: &State,
        queues: &[TagQueue],
    ) -> std::result::Result<Vec<TagTicket>, EndRun> {
        let mut queues: Vec<&TagQueue> = queues.iter().collect();
        queues.sort_by(|a, b| a.tag().cmp(b.tag()));
        queues.dedup_by(|a, b| a.tag() == b.tag());

        let mut tickets = Vec::with_capacity(queues.len());
        for queue in queues {
            match queue.acquire().await {
                Ok(ticket) => tickets.push(ticket),
                Err(err) => {
                    warn!(
                        task = %self.task.name,
                        tag = queue.tag(),
                        error = %err,
                        "failed to acquire throttle ticket"
                    );
                    let new = State::failed(format!(
                        "Failed to acquire ticket for tag '{}': {err:#}",
                        queue.tag()
                    ));
                    return Err(EndRun(call_task_handlers(&self.task, state, new)));
                }
            }
        }
        Ok(tickets)
    }

    /// Step 1: bail out on anything that must not run right now. Finished
    /// states end the run unchanged (idempotence); `Scheduled`/`Retrying`
    /// states end it until their start time has passed. A `Cached` state is
    /// finished but passes through so the cache validator can rule on it.
    fn check_task_is_ready(&self, state: State) -> Step {
        match &state.kind {
            StateKind::Cached { .. } => Ok(state),
            _ if state.is_finished() => {
                debug!(task = %self.task.name, "task is already finished");
                Err(EndRun(state))
            }
            StateKind::Scheduled { start_time }
            | StateKind::Retrying { start_time, .. } => {
                if let Some(start) = start_time {
                    if *start > Utc::now() {
                        debug!(
                            task = %self.task.name,
                            start_time = %start,
                            "task is not due yet"
                        );
                        return Err(EndRun(state));
                    }
                }
                Ok(state)
            }
            StateKind::Pending { .. } => Ok(state),
            _ => {
                debug!(task = %self.task.name, state = %state, "task is not ready to run");
                Err(EndRun(state))
            }
        }
    }

    /// Step 2: every upstream must have finished, unless this is a start
    /// task dispatched with `ignore_trigger`.
    fn check_upstream_finished(
        &self,
        state: State,
        upstream: &[&State],
        ignore_trigger: bool,
    ) -> Step {
        if ignore_trigger || upstream.iter().all(|s| s.is_finished()) {
            return Ok(state);
        }
        debug!(task = %self.task.name, "upstream tasks are not finished");
        let new = State::pending().with_message("Upstream tasks are not finished.");
        Err(EndRun(call_task_handlers(&self.task, &state, new)))
    }

    /// Step 3: propagate skips when the task asks for it.
    fn check_upstream_skipped(&self, state: State, upstream: &[&State]) -> Step {
        if self.task.skip_on_upstream_skip && upstream.iter().any(|s| s.is_skipped()) {
            debug!(task = %self.task.name, "skipping because an upstream task was skipped");
            let new = State::skipped("Upstream task was skipped; skipping.");
            return Err(EndRun(call_task_handlers(&self.task, &state, new)));
        }
        Ok(state)
    }

    /// Step 4: consult the trigger predicate over the flattened upstream
    /// states. A rejection or a predicate error both end as `TriggerFailed`.
    fn check_trigger(&self, state: State, upstream: &[&State], ignore_trigger: bool) -> Step {
        if ignore_trigger {
            return Ok(state);
        }
        match self.task.check_trigger(upstream) {
            Ok(true) => Ok(state),
            Ok(false) => {
                debug!(task = %self.task.name, "trigger rejected upstream states");
                let new = State::trigger_failed("Trigger failed.");
                Err(EndRun(call_task_handlers(&self.task, &state, new)))
            }
            Err(err) => {
                warn!(task = %self.task.name, error = %err, "trigger raised an error");
                let new = State::trigger_failed(format!(
                    "Unexpected error while checking task trigger: {err:#}"
                ));
                Err(EndRun(call_task_handlers(&self.task, &state, new)))
            }
        }
    }

    /// Merge upstream-derived inputs with inputs carried on the incoming
    /// state and inputs passed by the caller (highest precedence last).
    fn resolve_inputs(
        &self,
        state: &State,
        upstream_states: &HashMap<Edge, State>,
        extra_inputs: Inputs,
    ) -> Inputs {
        let mut inputs = Inputs::new();
        for (edge, upstream) in upstream_states {
            if let Some(key) = &edge.key {
                // A Mapped upstream contributes the sequence of its
                // children's results.
                let value = match upstream.children() {
                    Some(children) => Value::Array(
                        children
                            .iter()
                            .map(|c| c.result_value().cloned().unwrap_or(Value::Null))
                            .collect(),
                    ),
                    None => upstream.result_value().cloned().unwrap_or(Value::Null),
                };
                inputs.insert(key.clone(), value);
            }
        }
        if let Some(cached) = state.cached_inputs() {
            inputs.extend(cached.clone());
        }
        inputs.extend(extra_inputs);
        inputs
    }

    /// Step 5: a valid cache entry stands in for a run; an invalid one
    /// downgrades to `Pending` so the task executes.
    fn check_task_is_cached(&self, state: State, inputs: &Inputs) -> Step {
        let StateKind::Cached { entry } = &state.kind else {
            return Ok(state);
        };

        if self.task.validate_cache(entry, inputs) {
            debug!(task = %self.task.name, "using cached result");
            let new = State {
                kind: StateKind::Success {
                    cached: Some(entry.clone()),
                },
                message: Some("Task is cached.".to_string()),
                result: entry.result.clone().map(Payload::Value),
            };
            Err(EndRun(call_task_handlers(&self.task, &state, new)))
        } else {
            debug!(task = %self.task.name, "cache was invalid; running task");
            let new = State::pending().with_message("Cache was invalid; running task.");
            Ok(call_task_handlers(&self.task, &state, new))
        }
    }

    /// Step 6: `Pending` (or a due `Scheduled`/`Retrying`) becomes `Running`.
    fn set_task_to_running(&self, state: State) -> Step {
        if state.is_pending() {
            debug!(task = %self.task.name, "starting task run");
            Ok(call_task_handlers(&self.task, &state, State::running()))
        } else {
            debug!(task = %self.task.name, state = %state, "task cannot be set to running");
            Err(EndRun(state))
        }
    }

    /// Step 8: execute the callable under the timeout handler and classify
    /// the outcome.
    async fn run_task(
        &self,
        state: State,
        inputs: Inputs,
        context: &RunContext,
        timeout_handler: TimeoutHandler,
        attempt: u32,
    ) -> State {
        debug!(task = %self.task.name, attempt, "running task");
        let call = self.task.call(inputs, context.clone());
        let outcome = timeout_handler.call(self.task.timeout, call).await;

        let new = match outcome {
            Err(elapsed) => {
                warn!(task = %self.task.name, "task timed out");
                State::timed_out(elapsed.to_string())
            }
            Ok(Ok(value)) => State::success(Some(value)),
            Ok(Err(err)) => self.state_for_error(err, attempt),
        };

        call_task_handlers(&self.task, &state, new)
    }

    /// Classify a callable error: recognised signals map to their states;
    /// anything else is an unexpected error, retried while attempts remain.
    fn state_for_error(&self, err: anyhow::Error, attempt: u32) -> State {
        match err.downcast::<Signal>() {
            Ok(Signal::Success { message, result }) => State {
                kind: StateKind::Success { cached: None },
                message: message.or_else(|| Some("SUCCESS signal raised.".to_string())),
                result: result.map(Payload::Value),
            },
            Ok(Signal::Fail { message }) => {
                State::failed(message.unwrap_or_else(|| "FAIL signal raised.".to_string()))
            }
            Ok(Signal::Skip { message }) => {
                State::skipped(message.unwrap_or_else(|| "SKIP signal raised.".to_string()))
            }
            Ok(Signal::Retry { message }) => {
                let message =
                    message.unwrap_or_else(|| "RETRY signal raised.".to_string());
                if attempt <= self.task.max_retries {
                    self.retry_state(attempt, message)
                } else {
                    State::failed(message)
                }
            }
            Err(err) => {
                if attempt <= self.task.max_retries {
                    debug!(
                        task = %self.task.name,
                        attempt,
                        max_retries = self.task.max_retries,
                        error = %err,
                        "task failed; retrying"
                    );
                    self.retry_state(attempt, format!("Retrying after error: {err:#}"))
                } else {
                    warn!(task = %self.task.name, error = %err, "task failed");
                    State::failed(format!("Unexpected error while running task: {err:#}"))
                }
            }
        }
    }

    fn retry_state(&self, attempt: u32, message: String) -> State {
        let start_time = Utc::now() + self.task.retry_delay;
        State::retrying(Some(start_time), attempt).with_message(message)
    }

    /// Step 9: attach a cache entry to a fresh `Success` when caching is on.
    fn cache_result(&self, state: State, inputs: &Inputs) -> Step {
        let Some(cache_for) = self.task.cache_for else {
            return Ok(state);
        };

        if let StateKind::Success { cached: None } = &state.kind {
            let entry = CacheEntry {
                result: state.result_value().cloned(),
                inputs: inputs.clone(),
                expires_at: Some(Utc::now() + cache_for),
            };
            let old = state.clone();
            let mut new = state;
            new.kind = StateKind::Success {
                cached: Some(entry),
            };
            Ok(call_task_handlers(&self.task, &old, new))
        } else {
            Ok(state)
        }
    }
}
