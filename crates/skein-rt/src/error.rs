// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.
//!
//! Channel operation errors live in `channel` next to the ops that raise
//! them; this module holds the task- and run-level kinds.

use crate::channel::{RecvError, SendError};
use crate::timer::TimedOut;

/// Why a task stopped before producing `Ok(())`.
///
/// `Cancelled` is the task's own recognition of a cancellation request;
/// it ends the task in the `Cancelled` state and is never treated as a
/// failure. `Failed` is a domain error and is routed through the owning
/// scope's supervision chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Shorthand for a domain failure with the given message.
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

impl<T> From<SendError<T>> for TaskError {
    fn from(_: SendError<T>) -> Self {
        TaskError::Failed("send on closed channel".to_string())
    }
}

impl From<RecvError> for TaskError {
    fn from(_: RecvError) -> Self {
        TaskError::Failed("receive on closed channel".to_string())
    }
}

impl From<TimedOut> for TaskError {
    fn from(_: TimedOut) -> Self {
        TaskError::Failed("operation timed out".to_string())
    }
}

impl From<SpawnError> for TaskError {
    fn from(e: SpawnError) -> Self {
        TaskError::Failed(e.to_string())
    }
}

/// Terminal outcome of `Runtime::run` when the root value is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// A failure reached the root scope with no containing handler, or
    /// the root task itself failed.
    #[error("uncaught task failure: {0}")]
    Uncaught(TaskError),

    /// The root task was cancelled before producing a value.
    #[error("root task was cancelled")]
    Cancelled,

    /// The scheduler went idle while tasks were still suspended on
    /// channel operations nothing can complete.
    #[error("scheduler idle with tasks still suspended")]
    Stalled,

    /// `run` was called on a runtime that already ran.
    #[error("runtime has already run")]
    Finished,
}

/// Spawn or child-scope creation rejected by a scope that is no longer
/// accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("scope has been cancelled")]
    ScopeCancelled,

    #[error("scope has finished")]
    ScopeFinished,
}
