// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Virtual clock and timed suspension.
//!
//! Time is simulated: the scheduler advances the clock straight to the
//! next pending wake time whenever the ready queue drains, so `delay(999)`
//! elapses 999 ticks of virtual time in zero wall-clock time. Entries due
//! at the same instant fire in registration order, which keeps runs
//! deterministic.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use crate::scheduler::RtState;
use crate::task::{self, TaskId};

/// Key of one pending wakeup: (wake time, registration sequence).
pub(crate) type TimerKey = (u64, u64);

/// Time-ordered wait set. Owned by the scheduler state.
pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, TaskId>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Register a wakeup for `task` at `wake_at`.
    pub fn register(&mut self, wake_at: u64, task: TaskId) -> TimerKey {
        let key = (wake_at, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, task);
        key
    }

    pub fn remove(&mut self, key: TimerKey) {
        self.entries.remove(&key);
    }

    /// Drop every entry belonging to `task` (task cancelled or finished).
    pub fn remove_task(&mut self, task: TaskId) {
        self.entries.retain(|_, t| *t != task);
    }

    /// Earliest pending wake time, if any.
    pub fn next_wake(&self) -> Option<u64> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return all tasks due at or before `now`, in
    /// (time, registration) order.
    pub fn fire_due(&mut self, now: u64) -> Vec<TaskId> {
        let Some(pivot) = now.checked_add(1) else {
            // Saturated clock: everything is due.
            let due = self.entries.values().copied().collect();
            self.entries.clear();
            return due;
        };
        let later = self.entries.split_off(&(pivot, 0));
        let due = self.entries.values().copied().collect();
        self.entries = later;
        due
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suspend the current task for `ticks` of virtual time.
///
/// `delay(0)` completes immediately without suspending. Must be awaited
/// from inside a runtime task.
pub fn delay(ticks: u64) -> Delay {
    Delay {
        ticks,
        registered: None,
    }
}

/// Future returned by [`delay`].
pub struct Delay {
    ticks: u64,
    registered: Option<DelayReg>,
}

struct DelayReg {
    rt: Weak<RtState>,
    key: TimerKey,
    wake_at: u64,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if let Some(reg) = &this.registered {
            let Some(rt) = reg.rt.upgrade() else {
                return Poll::Ready(());
            };
            let fired = rt.lock().clock >= reg.wake_at;
            if fired {
                this.registered = None;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        if this.ticks == 0 {
            return Poll::Ready(());
        }

        let ctx = task::current()
            .expect("delay() must be awaited from inside a runtime task");
        let mut inner = ctx.rt.lock();
        let wake_at = inner.clock.saturating_add(this.ticks);
        let key = inner.timers.register(wake_at, ctx.id);
        drop(inner);
        this.registered = Some(DelayReg {
            rt: std::sync::Arc::downgrade(&ctx.rt),
            key,
            wake_at,
        });
        Poll::Pending
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        // Deregister an unfired timer so it cannot wake a task that no
        // longer awaits it (e.g. the inner branch of a timeout).
        if let Some(reg) = self.registered.take() {
            if let Some(rt) = reg.rt.upgrade() {
                rt.lock().timers.remove(reg.key);
            }
        }
    }
}

/// Timeout marker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimedOut {}

/// Race `fut` against the clock. If the clock wins, the inner future is
/// dropped, a cooperative cancellation of the abandoned work.
pub fn timeout<F: Future>(ticks: u64, fut: F) -> Timeout<F> {
    Timeout {
        inner: Box::pin(fut),
        delay: delay(ticks),
    }
}

/// Future returned by [`timeout`].
pub struct Timeout<F: Future> {
    inner: Pin<Box<F>>,
    delay: Delay,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, TimedOut>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(out) = this.inner.as_mut().poll(cx) {
            return Poll::Ready(Ok(out));
        }
        match Pin::new(&mut this.delay).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(TimedOut)),
            Poll::Pending => Poll::Pending,
        }
    }
}
