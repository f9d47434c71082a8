// src/context.rs

//! Per-run key/value context visible to tasks.
//!
//! A [`RunContext`] is an immutable snapshot: extending it produces a new
//! snapshot and never mutates the parent, so concurrently running tasks can
//! each hold their own frozen view without locks. The flow runner seeds the
//! well-known keys below before dispatching; per-task overrides are merged on
//! top at dispatch time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Name of the flow being run.
pub const FLOW_NAME: &str = "_flow_name";
/// Version of the flow being run.
pub const FLOW_VERSION: &str = "_flow_version";
/// Caller-supplied parameters, as a JSON object.
pub const PARAMETERS: &str = "_parameters";
/// Identifier of the executor driving the run.
pub const EXECUTOR_ID: &str = "_executor_id";
/// Debug flag: when truthy, scheduling errors propagate instead of being
/// folded into a `Failed` flow state.
pub const RAISE_ON_EXCEPTION: &str = "_raise_on_exception";

/// Immutable key/value bag handed to every task invocation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    values: Arc<BTreeMap<String, Value>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from an iterator of entries.
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        Self {
            values: Arc::new(values),
        }
    }

    /// Produce a new snapshot with `updates` merged over this one.
    ///
    /// Keys in `updates` shadow existing keys; the receiver is unchanged.
    pub fn extended<I, K>(&self, updates: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut values = (*self.values).clone();
        for (k, v) in updates {
            values.insert(k.into(), v);
        }
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Read a boolean flag; absent or non-boolean keys read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
