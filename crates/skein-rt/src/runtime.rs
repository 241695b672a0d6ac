// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime entry point.
//!
//! `Runtime::run` spawns the root computation into the root scope,
//! drives the scheduler until nothing remains runnable, and classifies
//! the outcome: the root's value, the single uncaught fatal error, a
//! cancelled root, or a stall.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{RunError, TaskError};
use crate::scheduler::RtState;
use crate::scope::{FailureHandler, Scope, ScopeId};
use crate::task::TaskState;

/// A single-threaded cooperative runtime over virtual time.
///
/// One-shot: `run` consumes the root scope; a second call reports
/// `RunError::Finished`.
pub struct Runtime {
    state: Arc<RtState>,
    root: ScopeId,
    ran: AtomicBool,
}

impl Runtime {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A runtime whose root scope contains failures: instead of
    /// becoming fatal, an otherwise-unhandled failure is reported to
    /// `handler` exactly once.
    pub fn with_handler(handler: FailureHandler) -> Self {
        Self::build(Some(handler))
    }

    fn build(handler: Option<FailureHandler>) -> Self {
        let state = Arc::new(RtState::new());
        let root = state
            .new_scope(None, handler)
            .expect("root scope creation cannot be rejected");
        Self {
            state,
            root,
            ran: AtomicBool::new(false),
        }
    }

    /// Current virtual time in ticks. Starts at 0; only advances while
    /// `run` is driving delayed tasks.
    pub fn now(&self) -> u64 {
        self.state.now()
    }

    /// Run `f`'s future as the root task, blocking the caller until the
    /// root scope and every descendant finish.
    pub fn run<T, F, Fut>(&self, f: F) -> Result<T, RunError>
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        if self.ran.swap(true, Ordering::AcqRel) {
            return Err(RunError::Finished);
        }

        let root = Scope {
            id: self.root,
            rt: self.state.clone(),
        };
        let slot = Arc::new(ResultSlot::new());
        let slot2 = slot.clone();
        let body = f(root.clone());
        let root_task = root
            .spawn(async move {
                match body.await {
                    Ok(v) => {
                        slot2.set(Ok(v));
                        Ok(())
                    }
                    Err(e) => {
                        slot2.set(Err(e.clone()));
                        Err(e)
                    }
                }
            })
            .map_err(|_| RunError::Finished)?;

        self.state.run_until_idle();
        let report = self.state.shutdown();

        if let Some(err) = report.fatal {
            return Err(RunError::Uncaught(err));
        }
        match slot.take() {
            Some(Ok(v)) => {
                if report.suspended > 0 {
                    return Err(RunError::Stalled);
                }
                Ok(v)
            }
            Some(Err(TaskError::Cancelled)) => Err(RunError::Cancelled),
            Some(Err(e)) => Err(RunError::Uncaught(e)),
            None => match root_task.state() {
                TaskState::Cancelled => Err(RunError::Cancelled),
                _ => Err(RunError::Stalled),
            },
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot the root task's typed result travels through, shared between
/// the wrapper future and `run`.
struct ResultSlot<T> {
    inner: Mutex<Option<Result<T, TaskError>>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn set(&self, result: Result<T, TaskError>) {
        *self.inner.lock().unwrap() = Some(result);
    }

    fn take(&self) -> Option<Result<T, TaskError>> {
        self.inner.lock().unwrap().take()
    }
}
