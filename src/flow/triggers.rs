// src/flow/triggers.rs

//! Built-in trigger predicates.
//!
//! A trigger sees the flattened upstream states (children of mapped
//! upstreams count individually) and decides whether the task may run.
//! Returning `Ok(false)` or `Err` both end the task as `TriggerFailed`.
//!
//! Skipped upstreams are finished but neither successful nor failed, so
//! `all_successful` rejects them and `any_failed` does not fire on them.

use std::sync::Arc;

use crate::flow::task::Trigger;
use crate::state::State;

fn predicate<F>(f: F) -> Trigger
where
    F: Fn(&[&State]) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Every upstream finished successfully. The default trigger; trivially
/// true for root tasks.
pub fn all_successful() -> Trigger {
    predicate(|upstream| Ok(upstream.iter().all(|s| s.is_successful())))
}

/// Every upstream failed.
pub fn all_failed() -> Trigger {
    predicate(|upstream| Ok(upstream.iter().all(|s| s.is_failed())))
}

/// Every upstream reached a finished state, whatever it was.
pub fn all_finished() -> Trigger {
    predicate(|upstream| Ok(upstream.iter().all(|s| s.is_finished())))
}

/// At least one upstream succeeded (vacuously true with no upstreams).
pub fn any_successful() -> Trigger {
    predicate(|upstream| Ok(upstream.is_empty() || upstream.iter().any(|s| s.is_successful())))
}

/// At least one upstream failed (vacuously true with no upstreams).
pub fn any_failed() -> Trigger {
    predicate(|upstream| Ok(upstream.is_empty() || upstream.iter().any(|s| s.is_failed())))
}

/// Run regardless of upstream states.
pub fn always_run() -> Trigger {
    predicate(|_| Ok(true))
}

/// Never run from the scheduler; only a start-task dispatch (which skips
/// the trigger) can execute the task.
pub fn manual_only() -> Trigger {
    predicate(|_| Ok(false))
}
