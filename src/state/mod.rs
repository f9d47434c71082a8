// src/state/mod.rs

//! The closed set of task/flow states and their category predicates.
//!
//! A [`State`] is immutable: transitions build a new value. The scalar
//! variants mirror the task lifecycle (`Pending` through the finished
//! family); `Mapped` holds one child state per fan-out element and is
//! treated as a sequence-shaped state until [`State::flatten`] unpacks it
//! for aggregation.

pub mod signal;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use signal::Signal;

use crate::flow::TaskName;

/// Resolved keyword inputs for a task invocation.
pub type Inputs = BTreeMap<String, Value>;

/// A cached task result, carried on `Success` and `Cached` states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: Option<Value>,
    pub inputs: Inputs,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether the entry is still usable at `now` (no expiration means yes).
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// What a state's `result` slot holds.
///
/// Task states carry plain values; the final flow state carries the map of
/// return-task states instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Value(Value),
    States(BTreeMap<TaskName, State>),
}

impl Payload {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::States(_) => None,
        }
    }

    pub fn as_states(&self) -> Option<&BTreeMap<TaskName, State>> {
        match self {
            Payload::States(m) => Some(m),
            Payload::Value(_) => None,
        }
    }
}

/// Variant-specific data of a [`State`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateKind {
    /// Not started; may carry inputs harvested from a previous run.
    Pending { cached_inputs: Inputs },
    /// Not started; must not run before `start_time`.
    Scheduled { start_time: Option<DateTime<Utc>> },
    /// Failed but eligible for another attempt at `start_time`.
    Retrying {
        start_time: Option<DateTime<Utc>>,
        run_count: u32,
    },
    Running,
    /// Finished with a result; `cached` is populated when caching is on.
    Success { cached: Option<CacheEntry> },
    /// A previous run's cache entry, pending validation on the next run.
    Cached { entry: CacheEntry },
    Failed,
    /// The trigger predicate rejected the upstream states.
    TriggerFailed,
    Skipped,
    TimedOut,
    /// One child state per fan-out element of a mapped task.
    Mapped { children: Vec<State> },
}

/// A task's (or the flow's) lifecycle position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub kind: StateKind,
    pub message: Option<String>,
    pub result: Option<Payload>,
}

impl Default for State {
    fn default() -> Self {
        State::pending()
    }
}

impl State {
    fn new(kind: StateKind) -> Self {
        Self {
            kind,
            message: None,
            result: None,
        }
    }

    pub fn pending() -> Self {
        State::new(StateKind::Pending {
            cached_inputs: Inputs::new(),
        })
    }

    pub fn pending_with_inputs(cached_inputs: Inputs) -> Self {
        State::new(StateKind::Pending { cached_inputs })
    }

    pub fn scheduled(start_time: Option<DateTime<Utc>>) -> Self {
        State::new(StateKind::Scheduled { start_time })
    }

    pub fn retrying(start_time: Option<DateTime<Utc>>, run_count: u32) -> Self {
        State::new(StateKind::Retrying {
            start_time,
            run_count,
        })
    }

    pub fn running() -> Self {
        State::new(StateKind::Running)
    }

    pub fn success(result: Option<Value>) -> Self {
        Self {
            kind: StateKind::Success { cached: None },
            message: None,
            result: result.map(Payload::Value),
        }
    }

    pub fn cached(entry: CacheEntry) -> Self {
        State::new(StateKind::Cached { entry })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        State::new(StateKind::Failed).with_message(message)
    }

    pub fn trigger_failed(message: impl Into<String>) -> Self {
        State::new(StateKind::TriggerFailed).with_message(message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        State::new(StateKind::Skipped).with_message(message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        State::new(StateKind::TimedOut).with_message(message)
    }

    pub fn mapped(children: Vec<State>) -> Self {
        State::new(StateKind::Mapped { children })
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    /// Short variant name, for logs.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            StateKind::Pending { .. } => "Pending",
            StateKind::Scheduled { .. } => "Scheduled",
            StateKind::Retrying { .. } => "Retrying",
            StateKind::Running => "Running",
            StateKind::Success { .. } => "Success",
            StateKind::Cached { .. } => "Cached",
            StateKind::Failed => "Failed",
            StateKind::TriggerFailed => "TriggerFailed",
            StateKind::Skipped => "Skipped",
            StateKind::TimedOut => "TimedOut",
            StateKind::Mapped { .. } => "Mapped",
        }
    }

    /// The state's result as a plain value, when it holds one.
    pub fn result_value(&self) -> Option<&Value> {
        self.result.as_ref().and_then(Payload::as_value)
    }

    /// Inputs carried by a `Pending` state.
    pub fn cached_inputs(&self) -> Option<&Inputs> {
        match &self.kind {
            StateKind::Pending { cached_inputs } => Some(cached_inputs),
            _ => None,
        }
    }

    /// Cache entry carried by a `Cached` state.
    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        match &self.kind {
            StateKind::Cached { entry } => Some(entry),
            _ => None,
        }
    }

    /// Earliest allowed run time of a `Scheduled`/`Retrying` state.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            StateKind::Scheduled { start_time } => *start_time,
            StateKind::Retrying { start_time, .. } => *start_time,
            _ => None,
        }
    }

    /// Attempt counter of a `Retrying` state.
    pub fn run_count(&self) -> Option<u32> {
        match &self.kind {
            StateKind::Retrying { run_count, .. } => Some(*run_count),
            _ => None,
        }
    }

    /// Children of a `Mapped` state.
    pub fn children(&self) -> Option<&[State]> {
        match &self.kind {
            StateKind::Mapped { children } => Some(children),
            _ => None,
        }
    }

    // --- category predicates -------------------------------------------------

    pub fn is_pending(&self) -> bool {
        match &self.kind {
            StateKind::Pending { .. }
            | StateKind::Scheduled { .. }
            | StateKind::Retrying { .. } => true,
            StateKind::Mapped { children } => children.iter().any(State::is_pending),
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.kind {
            StateKind::Running => true,
            StateKind::Mapped { children } => children.iter().any(State::is_running),
            _ => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.kind {
            StateKind::Success { .. }
            | StateKind::Cached { .. }
            | StateKind::Failed
            | StateKind::TriggerFailed
            | StateKind::Skipped
            | StateKind::TimedOut => true,
            StateKind::Mapped { children } => children.iter().all(State::is_finished),
            _ => false,
        }
    }

    /// Success-family states. `Skipped` is finished and benign but does not
    /// count as successful; an all-skipped reference set classifies the flow
    /// through the "no reference tasks failed" branch instead.
    pub fn is_successful(&self) -> bool {
        match &self.kind {
            StateKind::Success { .. } | StateKind::Cached { .. } => true,
            StateKind::Mapped { children } => children.iter().all(State::is_successful),
            _ => false,
        }
    }

    pub fn is_failed(&self) -> bool {
        match &self.kind {
            StateKind::Failed | StateKind::TriggerFailed | StateKind::TimedOut => true,
            StateKind::Mapped { children } => children.iter().any(State::is_failed),
            _ => false,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.kind, StateKind::Skipped)
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self.kind, StateKind::Retrying { .. })
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.kind, StateKind::Mapped { .. })
    }

    /// Scalar leaves of this state: a `Mapped` state yields its children
    /// (recursively), anything else yields itself. Used at classification
    /// time so each fan-out element counts individually.
    pub fn flatten(&self) -> Vec<&State> {
        match &self.kind {
            StateKind::Mapped { children } => {
                children.iter().flat_map(State::flatten).collect()
            }
            _ => vec![self],
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}({})", self.name(), msg),
            None => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_predicates() {
        assert!(State::pending().is_pending());
        assert!(State::retrying(None, 1).is_pending());
        assert!(State::scheduled(None).is_pending());
        assert!(State::running().is_running());

        for s in [
            State::success(None),
            State::cached(CacheEntry::default()),
            State::failed("boom"),
            State::trigger_failed("no"),
            State::skipped("skip"),
            State::timed_out("slow"),
        ] {
            assert!(s.is_finished(), "{s} should be finished");
            assert!(!s.is_pending());
            assert!(!s.is_running());
        }

        assert!(State::success(None).is_successful());
        assert!(State::cached(CacheEntry::default()).is_successful());
        assert!(!State::skipped("s").is_successful());
        assert!(State::skipped("s").is_skipped());

        assert!(State::failed("f").is_failed());
        assert!(State::trigger_failed("t").is_failed());
        assert!(State::timed_out("t").is_failed());
        assert!(!State::skipped("s").is_failed());
    }

    #[test]
    fn mapped_predicates_follow_children() {
        let mixed = State::mapped(vec![State::success(None), State::failed("x")]);
        assert!(mixed.is_finished());
        assert!(mixed.is_failed());
        assert!(!mixed.is_successful());

        let busy = State::mapped(vec![State::success(None), State::running()]);
        assert!(!busy.is_finished());
        assert!(busy.is_running());

        let all_ok = State::mapped(vec![State::success(None), State::success(None)]);
        assert!(all_ok.is_successful());
    }

    #[test]
    fn flatten_unpacks_nested_children() {
        let state = State::mapped(vec![
            State::success(Some(json!(1))),
            State::mapped(vec![State::failed("inner"), State::skipped("s")]),
        ]);
        let leaves = state.flatten();
        assert_eq!(leaves.len(), 3);
        assert_eq!(
            leaves.iter().map(|s| s.name()).collect::<Vec<_>>(),
            vec!["Success", "Failed", "Skipped"]
        );
    }

    #[test]
    fn cache_entry_freshness() {
        let now = Utc::now();
        let fresh = CacheEntry {
            expires_at: Some(now + std::time::Duration::from_secs(60)),
            ..CacheEntry::default()
        };
        let stale = CacheEntry {
            expires_at: Some(now - std::time::Duration::from_secs(60)),
            ..CacheEntry::default()
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
        assert!(CacheEntry::default().is_fresh(now));
    }
}
