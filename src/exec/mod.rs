// src/exec/mod.rs

//! Execution layer: the [`Executor`] abstraction and its built-in variants.
//!
//! The flow runner talks to an `Executor` instead of spawning work itself.
//! This keeps the scheduling code identical across execution strategies and
//! lets tests swap in instrumented executors.
//!
//! - [`local`] runs units lazily on the caller's task, in dependency order.
//! - [`parallel`] spawns units onto the ambient tokio runtime immediately.
//! - [`throttle`] provides the tag-queue ticket pools both variants share.
//!
//! A dispatched unit resolves to a [`State`]; its handle is a shared future
//! so several downstream tasks can await the same upstream result.

pub mod local;
pub mod parallel;
pub mod throttle;

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

use crate::state::State;

pub use local::LocalExecutor;
pub use parallel::ParallelExecutor;
pub use throttle::{validate_throttle, TagQueue, TagTicket};

/// A unit of work as handed to an executor.
pub type UnitFuture = BoxFuture<'static, State>;

/// Shareable handle to a dispatched unit's final state.
pub type StateFuture = Shared<BoxFuture<'static, State>>;

/// Fan-out preparation for a mapped task: resolves upstream states, then
/// yields one unit per element — or short-circuits with a failure state
/// when the fan-out shape cannot be determined.
pub type MapPrep = BoxFuture<'static, std::result::Result<Vec<UnitFuture>, State>>;

/// Wrap an already-known state as a resolved handle.
pub fn ready_state(state: State) -> StateFuture {
    futures::future::ready(state).boxed().shared()
}

/// Raised (as an error value) when user code outruns its wall-clock budget.
#[derive(Debug, Clone, Copy, Error)]
#[error("task exceeded its timeout of {limit:?}")]
pub struct Elapsed {
    pub limit: Duration,
}

/// Wall-clock enforcement around user code, supplied by the executor.
///
/// Enforcement is cooperative: the timer can only fire at await points, so
/// CPU-bound callables should yield or run under `spawn_blocking`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutHandler;

impl TimeoutHandler {
    pub async fn call<F>(
        &self,
        limit: Option<Duration>,
        fut: F,
    ) -> std::result::Result<F::Output, Elapsed>
    where
        F: Future,
    {
        match limit {
            None => Ok(fut.await),
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Elapsed { limit }),
        }
    }
}

/// RAII guard for an executor session.
///
/// Both built-in executors have nothing to acquire (the tokio runtime is
/// ambient), but an executor owning real resources — a process pool, a
/// cluster client — can hand back a guard that tears them down on drop,
/// which covers every exit path of the dispatch scope.
pub struct ExecutorSession {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ExecutorSession {
    pub fn noop() -> Self {
        Self { on_release: None }
    }

    pub fn with_release<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            on_release: Some(Box::new(f)),
        }
    }
}

impl Drop for ExecutorSession {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

/// Capability set the flow runner requires from an execution backend.
///
/// All ordering guarantees are flow-runner obligations; an executor only
/// promises that submitted units eventually resolve and that `map` yields a
/// sequence state with one child per prepared unit.
pub trait Executor: Send + Sync {
    /// Stable identifier, surfaced to tasks in the run context.
    fn executor_id(&self) -> &str;

    /// Begin a session scope for one flow run.
    fn start(&self) -> ExecutorSession {
        ExecutorSession::noop()
    }

    /// Schedule a single unit; `task` is the owning task's name, for
    /// instrumentation only.
    fn submit(&self, task: &str, unit: UnitFuture) -> StateFuture;

    /// Schedule a fan-out: once `prep` resolves the per-element units, run
    /// them elementwise and gather their states into a `Mapped` state.
    fn map(&self, task: &str, prep: MapPrep) -> StateFuture;

    /// Wall-clock enforcement the task runner wraps around user code.
    fn timeout_handler(&self) -> TimeoutHandler {
        TimeoutHandler
    }

    /// Build one ticket pool for a throttled tag.
    fn ticket_queue(&self, tag: &str, size: usize) -> TagQueue {
        TagQueue::bounded(tag, size)
    }
}
