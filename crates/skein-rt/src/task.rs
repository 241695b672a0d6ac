// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation: identity, lifecycle state, cancellation flag,
//! and the handle returned by `Scope::spawn`.
//!
//! A task is a boxed future plus bookkeeping. The scheduler owns the
//! polling loop; everything here is the data it drives.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::TaskError;
use crate::scheduler::RtState;
use crate::scope::ScopeId;

/// Opaque task identity, unique for the runtime's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, queued, never polled yet.
    Created,
    /// Currently being polled.
    Running,
    /// Parked on a timer, channel, or join, waiting for a wakeup.
    Suspended,
    /// Finished with `Ok(())`.
    Completed,
    /// Finished by cancellation.
    Cancelled,
    /// Finished with a domain error or a panic.
    Failed,
}

impl TaskState {
    /// Completed, Cancelled, and Failed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Cancellation flag shared between a task and its owning scope.
///
/// Monotonic: set once, observed at suspension points.
#[derive(Debug, Default)]
pub struct CancelFlag {
    flag: AtomicBool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Type-erased continuation. All tasks report through `Result` so the
/// scheduler can classify the terminal state without knowing the body.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

/// Scheduler-side record for one task.
pub(crate) struct TaskRecord {
    pub state: TaskState,
    pub owner: ScopeId,
    /// Taken out for polling, put back on `Pending`, dropped on exit.
    pub future: Option<BoxFuture>,
    pub cancel: Arc<CancelFlag>,
    /// Set for Cancelled and Failed terminal states.
    pub error: Option<TaskError>,
    /// Membership in the ready queue (guards against double-enqueue).
    pub in_ready: bool,
    /// A waker fired while the task was Running; re-enqueue after poll.
    pub notified: bool,
    pub join_waiters: Vec<Waker>,
}

/// Handle to a spawned task: state queries, cancellation, join.
///
/// Cloneable and non-owning: the scope keeps the task's bookkeeping
/// alive regardless of how many handles exist.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
    pub(crate) rt: Arc<RtState>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.rt
            .lock()
            .tasks
            .get(&self.id)
            .map(|rec| rec.state)
            .unwrap_or(TaskState::Completed)
    }

    /// Request cooperative cancellation of this task only.
    pub fn cancel(&self) {
        self.rt.cancel_task(self.id);
    }

    /// Future that resolves when the task reaches a terminal state:
    /// `Ok(())` for Completed, `Err` carrying the cancellation or
    /// failure otherwise.
    pub fn join(&self) -> JoinTask {
        JoinTask {
            id: self.id,
            rt: self.rt.clone(),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// See [`TaskHandle::join`].
pub struct JoinTask {
    id: TaskId,
    rt: Arc<RtState>,
}

impl Future for JoinTask {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.rt.lock();
        let Some(rec) = inner.tasks.get_mut(&self.id) else {
            return Poll::Ready(Ok(()));
        };
        match rec.state {
            TaskState::Completed => Poll::Ready(Ok(())),
            TaskState::Cancelled => Poll::Ready(Err(TaskError::Cancelled)),
            TaskState::Failed => Poll::Ready(Err(rec
                .error
                .clone()
                .unwrap_or_else(|| TaskError::failed("task failed")))),
            _ => {
                rec.join_waiters.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// The task the scheduler is currently polling on this thread.
///
/// Set around every poll so the suspension primitives (`delay`,
/// `cancelled`) can find their runtime without threading a handle
/// through user code.
#[derive(Clone)]
pub(crate) struct CurrentTask {
    pub rt: Arc<RtState>,
    pub id: TaskId,
    pub cancel: Arc<CancelFlag>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentTask>> = RefCell::new(None);
}

/// Install `ctx` as the current task; restored on guard drop.
pub(crate) fn enter(ctx: CurrentTask) -> EnterGuard {
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<CurrentTask>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

pub(crate) fn current() -> Option<CurrentTask> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Check if the current task has been asked to cancel.
///
/// Long computations without natural suspension points call this and
/// return `Err(TaskError::Cancelled)` to unwind promptly. Outside a
/// task this is always `false`.
pub fn cancelled() -> bool {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|c| c.cancel.is_cancelled())
            .unwrap_or(false)
    })
}
