// src/errors.rs

//! Crate-wide error types.
//!
//! Only configuration problems are surfaced to callers as `Err`; everything
//! that happens while a flow is running is folded into a
//! [`State`](crate::state::State).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("cycle detected in flow DAG: {0}")]
    DagCycle(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
