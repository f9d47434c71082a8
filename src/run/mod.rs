// src/run/mod.rs

//! Runners: the per-task state machine and the flow scheduling core.
//!
//! Both runners are pipelines of guarded transitions threaded as
//! `Result<State, EndRun>`: `Ok` continues with the (possibly new) state,
//! `Err(EndRun)` short-circuits the pipeline with a resolved state. Every
//! produced state passes exactly once through the relevant state-handler
//! chain, which may substitute it.

pub mod flow_runner;
pub mod task_runner;

use tracing::debug;

use crate::flow::{Flow, Task};
use crate::state::State;

pub use flow_runner::{FlowRunOpts, FlowRunner};
pub use task_runner::{TaskRunOpts, TaskRunner};

/// Short-circuit of a runner pipeline, carrying the resolved state.
#[derive(Debug)]
pub struct EndRun(pub State);

/// Outcome of one pipeline step.
pub(crate) type Step = std::result::Result<State, EndRun>;

/// Run `new` through the task's handler chain, in registration order.
pub(crate) fn call_task_handlers(task: &Task, old: &State, new: State) -> State {
    let mut new = new;
    for handler in &task.state_handlers {
        new = handler(task, old, new);
    }
    debug!(task = %task.name, from = %old, to = %new, "task state change");
    new
}

/// Run `new` through the flow's handler chain, in registration order.
pub(crate) fn call_flow_handlers(flow: &Flow, old: &State, new: State) -> State {
    let mut new = new;
    for handler in flow.state_handlers() {
        new = handler(flow, old, new);
    }
    debug!(flow = %flow.name(), from = %old, to = %new, "flow state change");
    new
}
