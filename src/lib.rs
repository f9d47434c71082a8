// src/lib.rs

//! flowdag: a DAG flow-running engine.
//!
//! A [`Flow`] is an immutable DAG of [`Task`]s connected by typed edges.
//! The [`FlowRunner`] walks it in topological order, drives every task
//! through the [`TaskRunner`] state machine via a pluggable
//! [`Executor`], honours per-tag concurrency budgets, and classifies the
//! run from the reference tasks' final states.
//!
//! ```no_run
//! use flowdag::{Flow, FlowRunner, FlowRunOpts, Task};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> flowdag::Result<()> {
//! let flow = Flow::builder("hello")
//!     .task(Task::builder("greet").run(|_, _| Ok(json!("hello"))).build())
//!     .build()?;
//!
//! let state = FlowRunner::new(Arc::new(flow))
//!     .run(FlowRunOpts::default())
//!     .await?;
//! assert!(state.is_successful());
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod errors;
pub mod exec;
pub mod flow;
pub mod logging;
pub mod run;
pub mod state;

pub use context::RunContext;
pub use errors::{EngineError, Result};
pub use exec::{Executor, LocalExecutor, ParallelExecutor, TagQueue};
pub use flow::{Edge, Flow, FlowBuilder, Task, TaskBuilder, TaskName, Trigger};
pub use run::{FlowRunOpts, FlowRunner, TaskRunOpts, TaskRunner};
pub use state::{CacheEntry, Inputs, Payload, Signal, State, StateKind};
