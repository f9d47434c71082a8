// src/exec/local.rs

//! Synchronous in-process executor.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::FutureExt;
use tracing::trace;

use crate::exec::{Executor, MapPrep, StateFuture, UnitFuture};
use crate::state::State;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Runs every unit on the caller's task, lazily.
///
/// `submit` does not start anything: the returned handle executes when it
/// is first awaited, and a unit awaiting its upstream handles drives them
/// inline first. The net effect is sequential execution in dependency
/// order once the flow runner awaits the aggregation barrier — the
/// "futures resolve eagerly, wait is identity" contract without a second
/// thread.
pub struct LocalExecutor {
    id: String,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            id: format!("local-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalExecutor {
    fn executor_id(&self) -> &str {
        &self.id
    }

    fn submit(&self, task: &str, unit: UnitFuture) -> StateFuture {
        trace!(task = %task, executor = %self.id, "accepted unit");
        unit.shared()
    }

    fn map(&self, task: &str, prep: MapPrep) -> StateFuture {
        let task = task.to_string();
        async move {
            match prep.await {
                Err(state) => state,
                Ok(units) => {
                    trace!(task = %task, width = units.len(), "running fan-out inline");
                    let mut children = Vec::with_capacity(units.len());
                    for unit in units {
                        children.push(unit.await);
                    }
                    State::mapped(children)
                }
            }
        }
        .boxed()
        .shared()
    }
}
