// src/exec/parallel.rs

//! Parallel executor backed by the ambient tokio runtime.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::exec::{Executor, MapPrep, StateFuture, UnitFuture};
use crate::state::State;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Spawns every unit onto the tokio runtime as soon as it is submitted.
///
/// Sibling tasks run concurrently; fan-out children of a mapped task each
/// get their own spawned task. A unit that panics or is aborted resolves
/// to `Failed` instead of tearing down the run.
pub struct ParallelExecutor {
    id: String,
}

impl ParallelExecutor {
    pub fn new() -> Self {
        Self {
            id: format!("parallel-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn join_state(task: &str, handle: JoinHandle<State>) -> State {
    match handle.await {
        Ok(state) => state,
        Err(err) => {
            error!(task = %task, error = %err, "executor task aborted");
            State::failed(format!("Executor task for '{task}' aborted: {err}"))
        }
    }
}

impl Executor for ParallelExecutor {
    fn executor_id(&self) -> &str {
        &self.id
    }

    fn submit(&self, task: &str, unit: UnitFuture) -> StateFuture {
        debug!(task = %task, executor = %self.id, "spawning unit");
        let task = task.to_string();
        let handle = tokio::spawn(unit);
        async move { join_state(&task, handle).await }.boxed().shared()
    }

    fn map(&self, task: &str, prep: MapPrep) -> StateFuture {
        debug!(task = %task, executor = %self.id, "spawning fan-out coordinator");
        let task = task.to_string();
        let coordinator_task = task.clone();
        let coordinator = tokio::spawn(async move {
            match prep.await {
                Err(state) => state,
                Ok(units) => {
                    let handles: Vec<(usize, JoinHandle<State>)> = units
                        .into_iter()
                        .enumerate()
                        .map(|(i, unit)| (i, tokio::spawn(unit)))
                        .collect();

                    let mut children = Vec::with_capacity(handles.len());
                    for (i, handle) in handles {
                        let label = format!("{coordinator_task}[{i}]");
                        children.push(join_state(&label, handle).await);
                    }
                    State::mapped(children)
                }
            }
        });

        async move { join_state(&task, coordinator).await }
            .boxed()
            .shared()
    }
}
