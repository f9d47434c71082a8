// src/state/signal.rs

//! Control-flow signals raised by user task code.
//!
//! A task callable returns `anyhow::Result<Value>`; returning `Err` with a
//! [`Signal`] inside requests a specific final state instead of the default
//! failure handling. The task runner recovers signals by downcast, so they
//! compose with `?` and `anyhow::Context` in user code.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Signal {
    /// End the task as `Success`, optionally carrying a result.
    #[error("SUCCESS signal raised")]
    Success {
        message: Option<String>,
        result: Option<Value>,
    },

    /// End the task as `Failed` without counting as an unexpected error.
    #[error("FAIL signal raised")]
    Fail { message: Option<String> },

    /// End the task as `Skipped`.
    #[error("SKIP signal raised")]
    Skip { message: Option<String> },

    /// Request a retry regardless of what the callable was doing.
    #[error("RETRY signal raised")]
    Retry { message: Option<String> },
}

impl Signal {
    pub fn success() -> Self {
        Signal::Success {
            message: None,
            result: None,
        }
    }

    pub fn fail() -> Self {
        Signal::Fail { message: None }
    }

    pub fn skip() -> Self {
        Signal::Skip { message: None }
    }

    pub fn retry() -> Self {
        Signal::Retry { message: None }
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        let message = Some(message.into());
        match self {
            Signal::Success { result, .. } => Signal::Success { message, result },
            Signal::Fail { .. } => Signal::Fail { message },
            Signal::Skip { .. } => Signal::Skip { message },
            Signal::Retry { .. } => Signal::Retry { message },
        }
    }

    pub fn with_result(self, result: Value) -> Self {
        match self {
            Signal::Success { message, .. } => Signal::Success {
                message,
                result: Some(result),
            },
            other => other,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Signal::Success { message, .. }
            | Signal::Fail { message }
            | Signal::Skip { message }
            | Signal::Retry { message } => message.as_deref(),
        }
    }
}
