// src/exec/throttle.rs

//! Tag queues: bounded ticket pools gating per-tag concurrency.
//!
//! Each throttled tag gets a pool pre-populated with `size` tickets. A task
//! must hold one ticket from every queue matching its tags while its user
//! code runs; the [`TagTicket`] guard returns the ticket when dropped, so
//! release happens on every exit path (success, failure, timeout, panic
//! unwinding through the executor). Acquisition order over multiple tags is
//! the caller's responsibility (the task runner acquires in sorted-tag
//! order, which rules out deadlock between overlapping tag sets).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::errors::{EngineError, Result};

/// A bounded pool of opaque tickets for one tag.
#[derive(Debug, Clone)]
pub struct TagQueue {
    tag: String,
    size: usize,
    tickets: Arc<Semaphore>,
}

/// One held ticket; returning it is dropping it.
#[derive(Debug)]
pub struct TagTicket {
    tag: String,
    _permit: OwnedSemaphorePermit,
}

impl TagTicket {
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl TagQueue {
    /// Build a pool holding `size` tickets. Callers validate `size > 0`
    /// (see [`validate_throttle`]).
    pub fn bounded(tag: impl Into<String>, size: usize) -> Self {
        Self {
            tag: tag.into(),
            size,
            tickets: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tickets currently available (for diagnostics and tests).
    pub fn available(&self) -> usize {
        self.tickets.available_permits()
    }

    /// Take one ticket, blocking until one is free.
    pub async fn acquire(&self) -> anyhow::Result<TagTicket> {
        let permit = Arc::clone(&self.tickets).acquire_owned().await?;
        trace!(tag = %self.tag, "acquired throttle ticket");
        Ok(TagTicket {
            tag: self.tag.clone(),
            _permit: permit,
        })
    }
}

/// Reject non-positive throttle budgets before any dispatch.
pub fn validate_throttle(throttle: &BTreeMap<String, usize>) -> Result<()> {
    let bad: Vec<&str> = throttle
        .iter()
        .filter(|&(_, &size)| size == 0)
        .map(|(tag, _)| tag.as_str())
        .collect();

    if bad.is_empty() {
        Ok(())
    } else {
        let tags = bad
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", ");
        Err(EngineError::Config(format!(
            "cannot throttle tags {tags} - an invalid value less than 1 was provided"
        )))
    }
}
