// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative single-threaded scheduler over virtual time.
//!
//! One run loop drives everything: pop the next ready task, poll it once,
//! classify the result. When the ready queue drains, the clock jumps to
//! the earliest pending timer and the due tasks re-enter the queue in
//! registration order. The loop ends when both the ready queue and the
//! timer set are empty.
//!
//! There is no preemption: a task that never suspends starves every
//! other task. That is the documented contract, not a defect to paper
//! over.
//!
//! Lock discipline: wakers and failure handlers are never invoked while
//! the scheduler state is locked, and task futures are never dropped
//! under it either (their destructors may take channel locks and wake
//! peers). Collect under the lock, act after releasing it.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Wake, Waker};

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::error::{SpawnError, TaskError};
use crate::scope::{FailureHandler, ScopeId, ScopeRecord, ScopeState};
use crate::supervise;
use crate::task::{self, BoxFuture, CancelFlag, CurrentTask, TaskId, TaskRecord, TaskState};
use crate::timer::TimerQueue;

/// Shared runtime state. One per [`crate::runtime::Runtime`].
pub(crate) struct RtState {
    inner: Mutex<RtInner>,
}

pub(crate) struct RtInner {
    /// Virtual now, in ticks.
    pub clock: u64,
    /// FIFO of tasks due for a poll.
    pub ready: VecDeque<TaskId>,
    pub timers: TimerQueue,
    pub tasks: IndexMap<TaskId, TaskRecord>,
    pub scopes: IndexMap<ScopeId, ScopeRecord>,
    /// First failure that reached the root uncontained.
    pub fatal: Option<TaskError>,
    next_task: u64,
    next_scope: u64,
}

/// What `shutdown` found after the loop went idle.
pub(crate) struct ShutdownReport {
    pub suspended: usize,
    pub fatal: Option<TaskError>,
}

impl RtState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RtInner {
                clock: 0,
                ready: VecDeque::new(),
                timers: TimerQueue::new(),
                tasks: IndexMap::new(),
                scopes: IndexMap::new(),
                fatal: None,
                next_task: 0,
                next_scope: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RtInner> {
        self.inner.lock().unwrap()
    }

    pub fn now(&self) -> u64 {
        self.lock().clock
    }

    /// Create a scope. `parent == None` only for the root.
    pub fn new_scope(
        &self,
        parent: Option<ScopeId>,
        handler: Option<FailureHandler>,
    ) -> Result<ScopeId, SpawnError> {
        let mut inner = self.lock();
        if let Some(p) = parent {
            check_accepts_children(&inner, p)?;
        }
        let id = ScopeId(inner.next_scope);
        inner.next_scope += 1;
        if let Some(p) = parent {
            if let Some(rec) = inner.scopes.get_mut(&p) {
                rec.scopes.push(id);
            }
        }
        inner.scopes.insert(
            id,
            ScopeRecord {
                state: ScopeState::Active,
                parent,
                tasks: Vec::new(),
                scopes: Vec::new(),
                handler,
                join_waiters: Vec::new(),
            },
        );
        trace!("created {id}");
        Ok(id)
    }

    /// Spawn a task into `owner`. The task enters the ready queue as
    /// Created and is first polled when the loop reaches it.
    pub fn spawn_task(
        self: &Arc<Self>,
        owner: ScopeId,
        fut: BoxFuture,
    ) -> Result<TaskId, SpawnError> {
        let mut inner = self.lock();
        check_accepts_children(&inner, owner)?;
        let id = TaskId(inner.next_task);
        inner.next_task += 1;
        if let Some(rec) = inner.scopes.get_mut(&owner) {
            rec.tasks.push(id);
        }
        inner.tasks.insert(
            id,
            TaskRecord {
                state: TaskState::Created,
                owner,
                future: Some(fut),
                cancel: Arc::new(CancelFlag::new()),
                error: None,
                in_ready: true,
                notified: false,
                join_waiters: Vec::new(),
            },
        );
        inner.ready.push_back(id);
        debug!("spawned {id} in {owner}");
        Ok(id)
    }

    /// Request cancellation of a single task.
    pub fn cancel_task(&self, id: TaskId) {
        let mut inner = self.lock();
        cancel_task_locked(&mut inner, id);
    }

    /// Request cancellation of a scope and all descendants.
    pub fn cancel_scope(&self, id: ScopeId) {
        let mut wakers = Vec::new();
        {
            let mut inner = self.lock();
            cancel_scope_locked(&mut inner, id);
            settle_scopes_from(&mut inner, id, &mut wakers);
        }
        for w in wakers {
            w.wake();
        }
    }

    /// Drive everything to completion: drain the ready queue, advance
    /// the clock to the next timer, repeat until both are empty.
    pub fn run_until_idle(self: &Arc<Self>) {
        loop {
            loop {
                let next = {
                    let mut inner = self.lock();
                    let next = inner.ready.pop_front();
                    if let Some(id) = next {
                        if let Some(rec) = inner.tasks.get_mut(&id) {
                            rec.in_ready = false;
                        }
                    }
                    next
                };
                match next {
                    Some(id) => self.run_task(id),
                    None => break,
                }
            }
            if !self.advance_clock() {
                break;
            }
        }
    }

    /// Jump the clock to the earliest pending timer and make the due
    /// tasks ready. Returns false when no timers remain.
    fn advance_clock(&self) -> bool {
        let mut inner = self.lock();
        let Some(next) = inner.timers.next_wake() else {
            return false;
        };
        if next > inner.clock {
            trace!("clock {} -> {}", inner.clock, next);
            inner.clock = next;
        }
        let now = inner.clock;
        let due = inner.timers.fire_due(now);
        let RtInner { tasks, ready, .. } = &mut *inner;
        for id in due {
            if let Some(rec) = tasks.get_mut(&id) {
                if !rec.state.is_terminal() && !rec.in_ready {
                    rec.in_ready = true;
                    ready.push_back(id);
                }
            }
        }
        true
    }

    /// One scheduling step for one task.
    fn run_task(self: &Arc<Self>, id: TaskId) {
        enum Claim {
            CancelDrop(Option<BoxFuture>),
            Poll(BoxFuture, Arc<CancelFlag>),
        }

        let claim = {
            let mut inner = self.lock();
            let Some(rec) = inner.tasks.get_mut(&id) else {
                return;
            };
            if rec.state.is_terminal() {
                return;
            }
            if rec.cancel.is_cancelled() {
                // Never started or parked at a suspension point: finalize
                // without resuming the continuation.
                Claim::CancelDrop(rec.future.take())
            } else {
                match rec.future.take() {
                    Some(fut) => {
                        rec.state = TaskState::Running;
                        Claim::Poll(fut, rec.cancel.clone())
                    }
                    None => return,
                }
            }
        };

        match claim {
            Claim::CancelDrop(fut) => {
                drop(fut);
                self.finalize(id, TaskState::Cancelled, Some(TaskError::Cancelled));
            }
            Claim::Poll(mut fut, cancel) => {
                let waker = Waker::from(Arc::new(TaskWaker {
                    rt: Arc::downgrade(self),
                    id,
                }));
                let mut cx = Context::from_waker(&waker);
                let guard = task::enter(CurrentTask {
                    rt: self.clone(),
                    id,
                    cancel,
                });
                let polled = panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));
                drop(guard);

                match polled {
                    Err(payload) => {
                        drop(fut);
                        self.finalize_failure(id, TaskError::Failed(panic_message(payload)));
                    }
                    Ok(Poll::Ready(Ok(()))) => {
                        drop(fut);
                        self.finalize(id, TaskState::Completed, None);
                    }
                    Ok(Poll::Ready(Err(TaskError::Cancelled))) => {
                        drop(fut);
                        self.finalize(id, TaskState::Cancelled, Some(TaskError::Cancelled));
                    }
                    Ok(Poll::Ready(Err(err))) => {
                        drop(fut);
                        self.finalize_failure(id, err);
                    }
                    Ok(Poll::Pending) => {
                        let cancelled_fut = {
                            let mut inner = self.lock();
                            let RtInner { tasks, ready, .. } = &mut *inner;
                            let Some(rec) = tasks.get_mut(&id) else {
                                return;
                            };
                            if rec.cancel.is_cancelled() {
                                // The suspension point is where a running
                                // task observes its cancellation.
                                Some(fut)
                            } else {
                                rec.state = TaskState::Suspended;
                                rec.future = Some(fut);
                                if rec.notified && !rec.in_ready {
                                    // A wakeup raced the poll; don't lose it.
                                    rec.notified = false;
                                    rec.in_ready = true;
                                    ready.push_back(id);
                                }
                                None
                            }
                        };
                        if let Some(f) = cancelled_fut {
                            drop(f);
                            self.finalize(id, TaskState::Cancelled, Some(TaskError::Cancelled));
                        }
                    }
                }
            }
        }
    }

    fn finalize(&self, id: TaskId, state: TaskState, error: Option<TaskError>) {
        let mut wakers = Vec::new();
        {
            let mut inner = self.lock();
            finalize_task_locked(&mut inner, id, state, error, &mut wakers);
        }
        for w in wakers {
            w.wake();
        }
    }

    /// Terminal path for a failed task: sibling fan-out and handler
    /// routing first, then the usual finalization.
    fn finalize_failure(&self, id: TaskId, err: TaskError) {
        let mut wakers = Vec::new();
        let handler_call = {
            let mut inner = self.lock();
            let call = supervise::propagate_locked(&mut inner, id, &err);
            finalize_task_locked(
                &mut inner,
                id,
                TaskState::Failed,
                Some(err.clone()),
                &mut wakers,
            );
            call
        };
        for w in wakers {
            w.wake();
        }
        if let Some((handler, origin)) = handler_call {
            debug!("failure of {origin} contained by scope handler");
            handler(origin, &err);
        }
    }

    /// Post-idle cleanup: report tasks that never resumed, drop their
    /// continuations, and settle still-open scopes.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut leftovers = Vec::new();
        let report = {
            let mut inner = self.lock();
            let mut suspended = 0;
            for (id, rec) in inner.tasks.iter_mut() {
                if !rec.state.is_terminal() {
                    suspended += 1;
                    warn!("{id} still suspended at shutdown");
                    if let Some(fut) = rec.future.take() {
                        leftovers.push(fut);
                    }
                }
            }
            let ids: Vec<ScopeId> = inner.scopes.keys().copied().collect();
            for sid in ids {
                let quiesced = scope_quiescent(&inner, sid);
                if let Some(rec) = inner.scopes.get_mut(&sid) {
                    if quiesced
                        && matches!(
                            rec.state,
                            ScopeState::Active | ScopeState::CancellationRequested
                        )
                    {
                        rec.state = ScopeState::Completed;
                    }
                }
            }
            ShutdownReport {
                suspended,
                fatal: inner.fatal.take(),
            }
        };
        drop(leftovers);
        report
    }
}

/// Spawn-side admission check.
fn check_accepts_children(inner: &RtInner, scope: ScopeId) -> Result<(), SpawnError> {
    match inner.scopes.get(&scope).map(|rec| rec.state) {
        Some(ScopeState::Active) => Ok(()),
        Some(ScopeState::CancellationRequested) => Err(SpawnError::ScopeCancelled),
        _ => Err(SpawnError::ScopeFinished),
    }
}

/// Flag a task for cancellation and make sure the loop reaches it.
pub(crate) fn cancel_task_locked(inner: &mut RtInner, id: TaskId) {
    let RtInner {
        tasks,
        ready,
        timers,
        ..
    } = inner;
    let Some(rec) = tasks.get_mut(&id) else {
        return;
    };
    if rec.state.is_terminal() {
        return;
    }
    rec.cancel.cancel();
    timers.remove_task(id);
    if rec.state == TaskState::Suspended && !rec.in_ready {
        rec.in_ready = true;
        ready.push_back(id);
    }
}

/// Mark a scope CancellationRequested and fan out to every descendant.
pub(crate) fn cancel_scope_locked(inner: &mut RtInner, id: ScopeId) {
    let (tasks, scopes) = {
        let Some(rec) = inner.scopes.get_mut(&id) else {
            return;
        };
        match rec.state {
            ScopeState::Active => rec.state = ScopeState::CancellationRequested,
            // Already cancelled, finished, or failed: fan-out has
            // happened (or is moot); don't walk the subtree twice.
            _ => return,
        }
        (rec.tasks.clone(), rec.scopes.clone())
    };
    debug!("cancelling {id}");
    for t in tasks {
        cancel_task_locked(inner, t);
    }
    for s in scopes {
        cancel_scope_locked(inner, s);
    }
}

/// True when every descendant task of `id` is terminal.
pub(crate) fn scope_quiescent(inner: &RtInner, id: ScopeId) -> bool {
    let Some(rec) = inner.scopes.get(&id) else {
        return true;
    };
    rec.tasks.iter().all(|t| {
        inner
            .tasks
            .get(t)
            .map(|r| r.state.is_terminal())
            .unwrap_or(true)
    }) && rec.scopes.iter().all(|s| scope_quiescent(inner, *s))
}

/// Record a terminal state and run completion aggregation up the owner
/// chain, collecting join wakers to fire after unlock.
pub(crate) fn finalize_task_locked(
    inner: &mut RtInner,
    id: TaskId,
    state: TaskState,
    error: Option<TaskError>,
    wakers: &mut Vec<Waker>,
) {
    let owner = {
        let Some(rec) = inner.tasks.get_mut(&id) else {
            return;
        };
        rec.state = state;
        rec.error = error;
        rec.in_ready = false;
        rec.notified = false;
        wakers.extend(rec.join_waiters.drain(..));
        rec.owner
    };
    inner.timers.remove_task(id);
    trace!("{id} -> {state:?}");
    settle_scopes_from(inner, owner, wakers);
}

/// Walk from `from` to the root: wake joiners (they re-check their own
/// subtree) and complete cancelled scopes that have fully wound down.
pub(crate) fn settle_scopes_from(inner: &mut RtInner, from: ScopeId, wakers: &mut Vec<Waker>) {
    let mut cur = Some(from);
    while let Some(sid) = cur {
        let quiesced = scope_quiescent(inner, sid);
        let Some(rec) = inner.scopes.get_mut(&sid) else {
            break;
        };
        wakers.extend(rec.join_waiters.drain(..));
        if quiesced && rec.state == ScopeState::CancellationRequested {
            trace!("{sid} completed after cancellation");
            rec.state = ScopeState::Completed;
        }
        cur = rec.parent;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Waker that re-enqueues its task. A wake for a Running task sets the
/// notified flag instead, consumed when the poll returns Pending.
struct TaskWaker {
    rt: Weak<RtState>,
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(rt) = self.rt.upgrade() else {
            return;
        };
        let mut inner = rt.lock();
        let RtInner { tasks, ready, .. } = &mut *inner;
        let Some(rec) = tasks.get_mut(&self.id) else {
            return;
        };
        match rec.state {
            TaskState::Suspended if !rec.in_ready => {
                rec.in_ready = true;
                ready.push_back(self.id);
            }
            TaskState::Running => rec.notified = true,
            _ => {}
        }
    }
}
