// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Failure propagation over the scope tree.
//!
//! When a task fails, its siblings are cancelled and the failure walks
//! the ancestor chain looking for a handler. The first scope with one
//! wins: its handler observes the failure exactly once and the walk
//! stops there. With no handler anywhere, the failure becomes the run's
//! single fatal outcome and the root's remaining work is cancelled.
//!
//! Containment only stops the upward walk; it never undoes a
//! cancellation that was already issued, and a handler on the failing
//! task's own scope still sees that task's siblings cancelled.
//!
//! Cancellation never re-enters this module: a task that ends in
//! `Cancelled` is not a failure.

use log::{debug, error};

use crate::error::TaskError;
use crate::scheduler::{cancel_scope_locked, cancel_task_locked, RtInner};
use crate::scope::{FailureHandler, ScopeId, ScopeState};
use crate::task::TaskId;

/// The child a failure arrived through, spared from the fan-out at its
/// own level.
enum Via {
    Task(TaskId),
    Scope(ScopeId),
}

/// Apply the failure policy for `failing`. Must run under the scheduler
/// lock; returns the handler to invoke (after unlock) when the failure
/// is contained.
pub(crate) fn propagate_locked(
    inner: &mut RtInner,
    failing: TaskId,
    err: &TaskError,
) -> Option<(FailureHandler, TaskId)> {
    let Some(owner) = inner.tasks.get(&failing).map(|rec| rec.owner) else {
        return None;
    };
    debug!("{failing} failed in {owner}: {err}");

    let mut scope = owner;
    let mut via = Via::Task(failing);
    let mut at_owner = true;

    loop {
        let Some(rec) = inner.scopes.get(&scope) else {
            return None;
        };
        let handler = rec.handler.clone();
        let parent = rec.parent;

        // Siblings are always cancelled at the failing task's own scope,
        // handler or not. Above it, a scope with a handler absorbs the
        // failure before any further fan-out.
        if at_owner || handler.is_none() {
            cancel_children_except(inner, scope, &via);
        }

        if let Some(handler) = handler {
            return Some((handler, failing));
        }

        if let Some(rec) = inner.scopes.get_mut(&scope) {
            rec.state = ScopeState::Failed;
        }

        match parent {
            Some(p) => {
                via = Via::Scope(scope);
                scope = p;
                at_owner = false;
            }
            None => {
                if inner.fatal.is_none() {
                    error!("uncaught failure of {failing}: {err}");
                    inner.fatal = Some(err.clone());
                }
                return None;
            }
        }
    }
}

fn cancel_children_except(inner: &mut RtInner, scope: ScopeId, via: &Via) {
    let Some(rec) = inner.scopes.get(&scope) else {
        return;
    };
    let tasks = rec.tasks.clone();
    let scopes = rec.scopes.clone();
    for t in tasks {
        if !matches!(via, Via::Task(keep) if *keep == t) {
            cancel_task_locked(inner, t);
        }
    }
    for s in scopes {
        if !matches!(via, Via::Scope(keep) if *keep == s) {
            cancel_scope_locked(inner, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::task::TaskState;
    use crate::timer::delay;
    use std::sync::{Arc, Mutex as StdMutex};

    fn recording_handler(log: &Arc<StdMutex<Vec<(TaskId, TaskError)>>>) -> FailureHandler {
        let log = log.clone();
        Arc::new(move |task, err| {
            log.lock().unwrap().push((task, err.clone()));
        })
    }

    #[test]
    fn failure_cancels_all_siblings() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&seen));
        let handles = Arc::new(StdMutex::new(Vec::new()));
        let h2 = handles.clone();
        rt.run(move |scope| async move {
            let child = scope.child()?;
            for _ in 0..3 {
                h2.lock().unwrap().push(child.spawn(async {
                    delay(1_000).await;
                    Ok(())
                })?);
            }
            child.spawn(async {
                delay(1).await;
                Err(TaskError::failed("boom"))
            })?;
            child.join().await;
            Ok(())
        })
        .unwrap();
        for h in handles.lock().unwrap().iter() {
            assert_eq!(h.state(), TaskState::Cancelled);
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn handler_on_own_scope_still_sees_siblings_cancelled() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::new();
        let s2 = seen.clone();
        let sibling_state = Arc::new(StdMutex::new(None));
        let sib2 = sibling_state.clone();
        rt.run(move |scope| async move {
            let child = scope.child_with_handler(recording_handler(&s2))?;
            let sibling = child.spawn(async {
                delay(1_000).await;
                Ok(())
            })?;
            child.spawn(async { Err(TaskError::failed("boom")) })?;
            child.join().await;
            *sib2.lock().unwrap() = Some(sibling.state());
            Ok(())
        })
        .unwrap();
        assert_eq!(*sibling_state.lock().unwrap(), Some(TaskState::Cancelled));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn nearest_handler_wins() {
        let outer_seen = Arc::new(StdMutex::new(Vec::new()));
        let inner_seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&outer_seen));
        let ih = recording_handler(&inner_seen);
        rt.run(move |scope| async move {
            let mid = scope.child_with_handler(ih)?;
            let leaf = mid.child()?;
            leaf.spawn(async { Err(TaskError::failed("deep")) })?;
            mid.join().await;
            Ok(())
        })
        .unwrap();
        assert_eq!(inner_seen.lock().unwrap().len(), 1);
        assert!(outer_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_invoked_once_per_failure() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&seen));
        rt.run(|scope| async move {
            let child = scope.child()?;
            child.spawn(async { Err(TaskError::failed("first")) })?;
            child.join().await;
            Ok(())
        })
        .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, TaskError::failed("first"));
    }

    #[test]
    fn two_failures_report_twice() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&seen));
        rt.run(|scope| async move {
            let a = scope.child()?;
            let b = scope.child()?;
            a.spawn(async { Err(TaskError::failed("one")) })?;
            b.spawn(async { Err(TaskError::failed("two")) })?;
            a.join().await;
            b.join().await;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancellation_is_not_reported_as_failure() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&seen));
        rt.run(|scope| async move {
            let child = scope.child()?;
            child.spawn(async {
                delay(1_000).await;
                Ok(())
            })?;
            child.cancel();
            child.join().await;
            Ok(())
        })
        .unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn uncontained_scopes_fail_along_the_walk() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let rt = Runtime::with_handler(recording_handler(&seen));
        let states = Arc::new(StdMutex::new(Vec::new()));
        let st2 = states.clone();
        rt.run(move |scope| async move {
            let mid = scope.child()?;
            let leaf = mid.child()?;
            leaf.spawn(async { Err(TaskError::failed("deep")) })?;
            mid.join().await;
            st2.lock().unwrap().push(leaf.state());
            st2.lock().unwrap().push(mid.state());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            *states.lock().unwrap(),
            vec![crate::scope::ScopeState::Failed, crate::scope::ScopeState::Failed]
        );
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
