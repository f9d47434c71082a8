#![allow(dead_code)]

//! Task helpers shared across integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowdag::{Signal, State, Task};

/// A task returning a fixed value.
pub fn const_task(name: &str, value: Value) -> Task {
    Task::builder(name)
        .run(move |_, _| Ok(value.clone()))
        .build()
}

/// A task echoing its resolved inputs back as a JSON object.
pub fn echo_task(name: &str) -> Task {
    Task::builder(name)
        .run(|inputs, _| {
            Ok(Value::Object(
                inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        })
        .build()
}

/// A task that always fails with an unexpected error.
pub fn failing_task(name: &str, message: &str) -> Task {
    let message = message.to_string();
    Task::builder(name)
        .run(move |_, _| Err(anyhow::anyhow!("{message}")))
        .build()
}

/// A task that raises the given signal.
pub fn signal_task(name: &str, signal: Signal) -> Task {
    Task::builder(name)
        .run(move |_, _| Err(signal.clone().into()))
        .build()
}

/// A task that fails its first `failures` attempts, then succeeds with the
/// total attempt count. `counter` exposes how many times it actually ran.
pub fn flaky_task(name: &str, failures: u32, counter: Arc<AtomicU32>) -> Task {
    Task::builder(name)
        .max_retries(failures)
        .run(move |_, _| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= failures {
                Err(anyhow::anyhow!("attempt {attempt} fails"))
            } else {
                Ok(json!(attempt))
            }
        })
        .build()
}

/// A task that sleeps, then succeeds. Useful for concurrency assertions.
pub fn sleep_task(name: &str, duration: Duration, value: Value) -> Task {
    Task::builder(name)
        .run_future(move |_, _| {
            let value = value.clone();
            async move {
                tokio::time::sleep(duration).await;
                Ok(value)
            }
        })
        .build()
}

/// Pull the return-task state map out of a final flow state.
pub fn return_states(state: &State) -> std::collections::BTreeMap<String, State> {
    state
        .result
        .as_ref()
        .and_then(|p| p.as_states())
        .cloned()
        .unwrap_or_default()
}
