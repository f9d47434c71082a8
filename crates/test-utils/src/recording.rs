//! Instrumented executors and probes for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flowdag::exec::{MapPrep, StateFuture, UnitFuture};
use flowdag::{Executor, LocalExecutor, State, TagQueue, Task};

/// Wraps any executor and records the dispatch order of task names.
///
/// Submission order is exactly the flow runner's iteration order, so tests
/// can assert topological dispatch without timing games.
pub struct RecordingExecutor {
    inner: Arc<dyn Executor>,
    dispatched: Arc<Mutex<Vec<String>>>,
}

impl RecordingExecutor {
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self {
            inner,
            dispatched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalExecutor::new()))
    }

    /// Names in dispatch order.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

impl Executor for RecordingExecutor {
    fn executor_id(&self) -> &str {
        self.inner.executor_id()
    }

    fn submit(&self, task: &str, unit: UnitFuture) -> StateFuture {
        self.dispatched.lock().unwrap().push(task.to_string());
        self.inner.submit(task, unit)
    }

    fn map(&self, task: &str, prep: MapPrep) -> StateFuture {
        self.dispatched.lock().unwrap().push(task.to_string());
        self.inner.map(task, prep)
    }

    fn ticket_queue(&self, tag: &str, size: usize) -> TagQueue {
        self.inner.ticket_queue(tag, size)
    }
}

/// Tracks how many probed tasks are `Running` at once.
///
/// Attach [`ConcurrencyProbe::handler`] to each task of interest; the probe
/// counts Running transitions up and Running-to-finished transitions down,
/// remembering the high-water mark.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// High-water mark of simultaneously running probed tasks.
    pub fn max_running(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn currently_running(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// A state handler wired to this probe.
    pub fn handler(
        &self,
    ) -> impl Fn(&Task, &State, State) -> State + Send + Sync + 'static {
        let current = Arc::clone(&self.current);
        let max = Arc::clone(&self.max);
        move |_, old, new| {
            if new.is_running() {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
            } else if old.is_running() && !new.is_running() {
                current.fetch_sub(1, Ordering::SeqCst);
            }
            new
        }
    }
}
