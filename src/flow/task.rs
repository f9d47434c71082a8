// src/flow/task.rs

//! Task nodes and the edges connecting them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::flow::{triggers, TaskName};
use crate::state::{CacheEntry, Inputs, State};

/// Boxed future produced by a task callable.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// The user computation at a task node.
pub type TaskFn = Arc<dyn Fn(Inputs, RunContext) -> TaskFuture + Send + Sync>;

/// Predicate over (flattened) upstream states gating execution.
pub type Trigger = Arc<dyn Fn(&[&State]) -> anyhow::Result<bool> + Send + Sync>;

/// Decides whether a cache entry from a previous run may stand in for a run.
pub type CacheValidator = Arc<dyn Fn(&CacheEntry, &Inputs) -> bool + Send + Sync>;

/// Interceptor invoked on every state transition of a task; may substitute
/// the new state.
pub type TaskStateHandler = Arc<dyn Fn(&Task, &State, State) -> State + Send + Sync>;

/// A directed dependency between two tasks.
///
/// `key` names the downstream input fed by the upstream result; a key-less
/// edge is a pure ordering dependency. `mapped` asks for elementwise
/// iteration over the upstream sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: TaskName,
    pub downstream: TaskName,
    pub key: Option<String>,
    pub mapped: bool,
}

impl Edge {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            key: None,
            mapped: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }
}

/// An immutable unit of user computation in a flow.
pub struct Task {
    pub name: TaskName,
    pub tags: BTreeSet<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub cache_for: Option<Duration>,
    /// Skip this task when any upstream was skipped (before the trigger is
    /// consulted).
    pub skip_on_upstream_skip: bool,
    /// Run elementwise over mapped upstream sequences, producing a sequence
    /// state.
    pub mapped: bool,
    pub(crate) run: TaskFn,
    pub(crate) trigger: Trigger,
    pub(crate) cache_validator: CacheValidator,
    pub(crate) state_handlers: Vec<TaskStateHandler>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("cache_for", &self.cache_for)
            .field("skip_on_upstream_skip", &self.skip_on_upstream_skip)
            .field("mapped", &self.mapped)
            .field("state_handlers", &self.state_handlers.len())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub(crate) fn call(&self, inputs: Inputs, context: RunContext) -> TaskFuture {
        (self.run)(inputs, context)
    }

    pub(crate) fn check_trigger(&self, upstream: &[&State]) -> anyhow::Result<bool> {
        (self.trigger)(upstream)
    }

    pub(crate) fn validate_cache(&self, entry: &CacheEntry, inputs: &Inputs) -> bool {
        (self.cache_validator)(entry, inputs)
    }
}

/// Builder for [`Task`].
///
/// Defaults: no-op callable returning `null`, `all_successful` trigger,
/// expiration-only cache validator, no retries, skip propagation on.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task: Task {
                name: name.into(),
                tags: BTreeSet::new(),
                max_retries: 0,
                retry_delay: Duration::ZERO,
                timeout: None,
                cache_for: None,
                skip_on_upstream_skip: true,
                mapped: false,
                run: Arc::new(|_, _| Box::pin(async { Ok(Value::Null) })),
                trigger: triggers::all_successful(),
                cache_validator: Arc::new(|entry, _| entry.is_fresh(Utc::now())),
                state_handlers: Vec::new(),
            },
        }
    }

    /// Set a synchronous callable. It is invoked lazily when the task's
    /// future is polled, so timeouts apply to it as a whole.
    pub fn run<F>(mut self, f: F) -> Self
    where
        F: Fn(&Inputs, &RunContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.task.run = Arc::new(move |inputs, context| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(&inputs, &context) })
        });
        self
    }

    /// Set an async callable.
    pub fn run_future<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Inputs, RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.task.run = Arc::new(move |inputs, context| Box::pin(f(inputs, context)));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.task.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.task.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.task.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.task.cache_for = Some(ttl);
        self
    }

    pub fn cache_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheEntry, &Inputs) -> bool + Send + Sync + 'static,
    {
        self.task.cache_validator = Arc::new(f);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.task.trigger = trigger;
        self
    }

    pub fn trigger_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&[&State]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.task.trigger = Arc::new(f);
        self
    }

    pub fn skip_on_upstream_skip(mut self, skip: bool) -> Self {
        self.task.skip_on_upstream_skip = skip;
        self
    }

    pub fn mapped(mut self, mapped: bool) -> Self {
        self.task.mapped = mapped;
        self
    }

    /// Append a state handler; handlers run in registration order.
    pub fn state_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task, &State, State) -> State + Send + Sync + 'static,
    {
        self.task.state_handlers.push(Arc::new(f));
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
