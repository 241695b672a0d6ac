// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scope tree: the ownership and cancellation boundary for tasks.
//!
//! Every task is owned by exactly one scope; scopes nest, forming a
//! strict tree rooted at the runtime's root scope. Cancelling a scope
//! fans out to every descendant; joining a scope suspends the caller
//! until every descendant task has reached a terminal state.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::{SpawnError, TaskError};
use crate::scheduler::{scope_quiescent, RtState};
use crate::task::{TaskHandle, TaskId};

/// Opaque scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Scope lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Accepting spawns.
    Active,
    /// Cancellation requested; children are winding down and new
    /// spawns are rejected.
    CancellationRequested,
    /// All children reached a terminal state without an uncontained
    /// failure passing through.
    Completed,
    /// An uncontained failure passed through this scope.
    Failed,
}

/// Observation hook invoked when a failure is contained at a scope:
/// receives the failing task's id and the error. Purely a reporting
/// hook; it cannot resume the task or undo cancellations.
pub type FailureHandler = Arc<dyn Fn(TaskId, &TaskError) + Send + Sync>;

/// Scheduler-side record for one scope.
pub(crate) struct ScopeRecord {
    pub state: ScopeState,
    /// Back-reference for the upward walks; the parent owns us, not the
    /// other way around.
    pub parent: Option<ScopeId>,
    pub tasks: Vec<TaskId>,
    pub scopes: Vec<ScopeId>,
    pub handler: Option<FailureHandler>,
    pub join_waiters: Vec<Waker>,
}

/// Handle to a scope. Cloneable; all clones refer to the same node in
/// the tree.
#[derive(Clone)]
pub struct Scope {
    pub(crate) id: ScopeId,
    pub(crate) rt: Arc<RtState>,
}

impl Scope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn state(&self) -> ScopeState {
        self.rt
            .lock()
            .scopes
            .get(&self.id)
            .map(|rec| rec.state)
            .unwrap_or(ScopeState::Completed)
    }

    /// Spawn a task owned by this scope. Rejected unless the scope is
    /// Active.
    pub fn spawn<F>(&self, fut: F) -> Result<TaskHandle, SpawnError>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let id = self.rt.spawn_task(self.id, Box::pin(fut))?;
        Ok(TaskHandle {
            id,
            rt: self.rt.clone(),
        })
    }

    /// Create a nested scope. Failures inside it report to the nearest
    /// ancestor handler.
    pub fn child(&self) -> Result<Scope, SpawnError> {
        self.child_inner(None)
    }

    /// Create a nested scope with its own failure handler, containing
    /// failures that would otherwise cascade past it.
    pub fn child_with_handler(&self, handler: FailureHandler) -> Result<Scope, SpawnError> {
        self.child_inner(Some(handler))
    }

    fn child_inner(&self, handler: Option<FailureHandler>) -> Result<Scope, SpawnError> {
        let id = self.rt.new_scope(Some(self.id), handler)?;
        Ok(Scope {
            id,
            rt: self.rt.clone(),
        })
    }

    /// Request cancellation of this scope and every descendant.
    /// Cooperative and idempotent: tasks observe it at their next
    /// suspension point.
    pub fn cancel(&self) {
        self.rt.cancel_scope(self.id);
    }

    /// Future that resolves once every descendant task has reached a
    /// terminal state.
    pub fn join(&self) -> JoinScope {
        JoinScope {
            id: self.id,
            rt: self.rt.clone(),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// See [`Scope::join`].
pub struct JoinScope {
    id: ScopeId,
    rt: Arc<RtState>,
}

impl Future for JoinScope {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.rt.lock();
        if scope_quiescent(&inner, self.id) {
            return Poll::Ready(());
        }
        if let Some(rec) = inner.scopes.get_mut(&self.id) {
            rec.join_waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::task::TaskState;
    use crate::timer::delay;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn cancel_fans_out_to_all_children() {
        let rt = Runtime::new();
        let handles = Arc::new(StdMutex::new(Vec::new()));
        let h2 = handles.clone();
        rt.run(move |scope| async move {
            let child = scope.child()?;
            for _ in 0..5 {
                let h = child.spawn(async {
                    delay(1_000).await;
                    Ok(())
                })?;
                h2.lock().unwrap().push(h);
            }
            delay(1).await;
            child.cancel();
            child.join().await;
            assert_eq!(child.state(), ScopeState::Completed);
            Ok(())
        })
        .unwrap();
        for h in handles.lock().unwrap().iter() {
            assert_eq!(h.state(), TaskState::Cancelled);
        }
        // Cancellation destroys pending timers, so the clock never
        // advances to the abandoned 1000-tick wakeups.
        assert_eq!(rt.now(), 1);
    }

    #[test]
    fn cancelled_scope_rejects_spawns() {
        let rt = Runtime::new();
        rt.run(|scope| async move {
            let child = scope.child()?;
            child.cancel();
            assert_eq!(child.state(), ScopeState::Completed);
            assert!(child.spawn(async { Ok(()) }).is_err());
            assert!(child.child().is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn cancel_mid_wind_down_reports_cancellation_requested() {
        let rt = Runtime::new();
        rt.run(|scope| async move {
            let child = scope.child()?;
            child.spawn(async {
                delay(100).await;
                Ok(())
            })?;
            child.cancel();
            // The child task has not been finalized yet.
            assert_eq!(child.state(), ScopeState::CancellationRequested);
            assert!(matches!(
                child.spawn(async { Ok(()) }),
                Err(SpawnError::ScopeCancelled)
            ));
            child.join().await;
            assert_eq!(child.state(), ScopeState::Completed);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn nested_scope_cancellation_is_recursive() {
        let rt = Runtime::new();
        let handles = Arc::new(StdMutex::new(Vec::new()));
        let h2 = handles.clone();
        rt.run(move |scope| async move {
            let outer = scope.child()?;
            let inner = outer.child()?;
            let deep = inner.child()?;
            h2.lock().unwrap().push(deep.spawn(async {
                delay(50).await;
                Ok(())
            })?);
            h2.lock().unwrap().push(inner.spawn(async {
                delay(50).await;
                Ok(())
            })?);
            outer.cancel();
            outer.join().await;
            assert_eq!(inner.state(), ScopeState::Completed);
            assert_eq!(deep.state(), ScopeState::Completed);
            Ok(())
        })
        .unwrap();
        for h in handles.lock().unwrap().iter() {
            assert_eq!(h.state(), TaskState::Cancelled);
        }
    }

    #[test]
    fn join_on_empty_scope_returns_immediately() {
        let rt = Runtime::new();
        rt.run(|scope| async move {
            let child = scope.child()?;
            child.join().await;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn join_waits_for_grandchildren() {
        let rt = Runtime::new();
        rt.run(|scope| async move {
            let child = scope.child()?;
            let grand = child.child()?;
            let h = grand.spawn(async {
                delay(10).await;
                Ok(())
            })?;
            child.join().await;
            assert_eq!(h.state(), TaskState::Completed);
            Ok(())
        })
        .unwrap();
    }
}
