// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Closable channels between tasks.
//!
//! `unbuffered()` is a rendezvous channel: a send completes only once a
//! receiver is parked and ready to take the value. `buffered(n)` holds up
//! to `n` values before senders suspend. Values are delivered FIFO, each
//! to exactly one receiver. Closing is monotonic: buffered values stay
//! receivable until drained, after which receives resolve immediately
//! with `RecvError::Closed` instead of suspending.
//!
//! Parked senders and receivers are tracked as id-tagged waker entries;
//! a send/receive future that is dropped mid-wait removes its own entry,
//! so an abandoned peer can never swallow a wakeup.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Errors from channel operations.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// Channel closed (explicitly, or all receivers dropped).
    Closed(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// Channel closed and buffer drained.
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No capacity (or, rendezvous, no receiver waiting) right now.
    Full(T),
    /// Channel closed.
    Closed(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value available right now.
    Empty,
    /// Channel closed and buffer drained.
    Closed,
}

/// Create an unbuffered (rendezvous) channel.
pub fn unbuffered<T>() -> (Sender<T>, Receiver<T>) {
    with_capacity(0)
}

/// Create a buffered channel with capacity `n`.
pub fn buffered<T>(n: usize) -> (Sender<T>, Receiver<T>) {
    with_capacity(n)
}

fn with_capacity<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(ChanShared {
        inner: Mutex::new(ChanInner {
            capacity,
            buffer: VecDeque::new(),
            closed: false,
            senders: 1,
            receivers: 1,
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            next_waiter: 0,
        }),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

struct ChanShared<T> {
    inner: Mutex<ChanInner<T>>,
}

struct ChanInner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    closed: bool,
    senders: usize,
    receivers: usize,
    send_waiters: VecDeque<(u64, Waker)>,
    recv_waiters: VecDeque<(u64, Waker)>,
    next_waiter: u64,
}

impl<T> ChanInner<T> {
    /// A deposit may go through when buffer space exists, or (for the
    /// rendezvous case) when a receiver is already parked for it.
    fn can_accept(&self) -> bool {
        if self.capacity == 0 {
            !self.recv_waiters.is_empty()
        } else {
            self.buffer.len() < self.capacity
        }
    }

    fn pop_sender(&mut self) -> Option<Waker> {
        self.send_waiters.pop_front().map(|(_, w)| w)
    }

    fn pop_receiver(&mut self) -> Option<Waker> {
        self.recv_waiters.pop_front().map(|(_, w)| w)
    }
}

/// Park the caller in `queue`, reusing its existing entry when one is
/// still there (replacing the stored waker), otherwise appending a fresh
/// id-tagged entry.
fn park_waiter(
    queue: &mut VecDeque<(u64, Waker)>,
    slot: &mut Option<u64>,
    waker: &Waker,
    next: &mut u64,
) {
    if let Some(id) = *slot {
        if let Some(entry) = queue.iter_mut().find(|(eid, _)| *eid == id) {
            entry.1 = waker.clone();
            return;
        }
    }
    let id = *next;
    *next += 1;
    queue.push_back((id, waker.clone()));
    *slot = Some(id);
}

fn unpark_waiter(queue: &mut VecDeque<(u64, Waker)>, slot: &mut Option<u64>) {
    if let Some(id) = slot.take() {
        queue.retain(|(eid, _)| *eid != id);
    }
}

fn close_channel<T>(shared: &ChanShared<T>) {
    let wakers: Vec<Waker> = {
        let mut inner = shared.inner.lock().unwrap();
        if inner.closed {
            Vec::new()
        } else {
            inner.closed = true;
            let mut wakers: Vec<Waker> =
                inner.send_waiters.drain(..).map(|(_, w)| w).collect();
            wakers.extend(inner.recv_waiters.drain(..).map(|(_, w)| w));
            wakers
        }
    };
    for w in wakers {
        w.wake();
    }
}

/// Sending half. Cloneable; dropping the last sender closes the channel.
pub struct Sender<T> {
    shared: Arc<ChanShared<T>>,
}

impl<T> Sender<T> {
    /// Send a value, suspending until the channel can take it.
    ///
    /// Fails immediately with `SendError::Closed` on a closed channel;
    /// never suspends in that case.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            shared: &self.shared,
            value: Some(value),
            waiter: None,
        }
    }

    /// Non-suspending send attempt.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let wake;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.closed {
                return Err(TrySendError::Closed(value));
            }
            if !inner.can_accept() {
                return Err(TrySendError::Full(value));
            }
            inner.buffer.push_back(value);
            wake = inner.pop_receiver();
        }
        if let Some(w) = wake {
            w.wake();
        }
        Ok(())
    }

    /// Close the channel. Idempotent; buffered values remain receivable.
    pub fn close(&self) {
        close_channel(&self.shared);
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().unwrap().senders += 1;
        Sender {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.senders -= 1;
            inner.senders == 0
        };
        if last {
            close_channel(&self.shared);
        }
    }
}

/// Receiving half. Cloneable; dropping the last receiver closes the
/// channel so parked senders fail rather than wait forever.
pub struct Receiver<T> {
    shared: Arc<ChanShared<T>>,
}

impl<T> Receiver<T> {
    /// Receive the next value, suspending until one arrives or the
    /// channel closes. A closed, drained channel resolves immediately
    /// with `RecvError::Closed`.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            shared: &self.shared,
            waiter: None,
        }
    }

    /// Non-suspending receive attempt.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let wake;
        let value;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.buffer.pop_front() {
                Some(v) => {
                    value = v;
                    wake = inner.pop_sender();
                }
                None => {
                    return Err(if inner.closed {
                        TryRecvError::Closed
                    } else {
                        TryRecvError::Empty
                    });
                }
            }
        }
        if let Some(w) = wake {
            w.wake();
        }
        Ok(value)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().unwrap().receivers += 1;
        Receiver {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.receivers -= 1;
            inner.receivers == 0
        };
        if last {
            close_channel(&self.shared);
        }
    }
}

/// Future returned by [`Sender::send`].
pub struct SendFuture<'a, T> {
    shared: &'a ChanShared<T>,
    value: Option<T>,
    waiter: Option<u64>,
}

// The value is only ever moved out whole; nothing borrows into it.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let wake;
        let out = {
            let mut inner = this.shared.inner.lock().unwrap();
            if inner.closed {
                unpark_waiter(&mut inner.send_waiters, &mut this.waiter);
                let v = this.value.take().expect("send future polled after completion");
                return Poll::Ready(Err(SendError::Closed(v)));
            }
            if inner.can_accept() {
                let v = this.value.take().expect("send future polled after completion");
                inner.buffer.push_back(v);
                unpark_waiter(&mut inner.send_waiters, &mut this.waiter);
                wake = inner.pop_receiver();
                Poll::Ready(Ok(()))
            } else {
                let ChanInner {
                    send_waiters,
                    next_waiter,
                    ..
                } = &mut *inner;
                park_waiter(send_waiters, &mut this.waiter, cx.waker(), next_waiter);
                wake = None;
                Poll::Pending
            }
        };
        if let Some(w) = wake {
            w.wake();
        }
        out
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            let mut inner = self.shared.inner.lock().unwrap();
            unpark_waiter(&mut inner.send_waiters, &mut self.waiter);
        }
    }
}

/// Future returned by [`Receiver::recv`].
pub struct RecvFuture<'a, T> {
    shared: &'a ChanShared<T>,
    waiter: Option<u64>,
}

impl<T> Unpin for RecvFuture<'_, T> {}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let wake;
        let out = {
            let mut inner = this.shared.inner.lock().unwrap();
            if let Some(v) = inner.buffer.pop_front() {
                unpark_waiter(&mut inner.recv_waiters, &mut this.waiter);
                wake = inner.pop_sender();
                Poll::Ready(Ok(v))
            } else if inner.closed {
                unpark_waiter(&mut inner.recv_waiters, &mut this.waiter);
                wake = None;
                Poll::Ready(Err(RecvError::Closed))
            } else {
                // Rendezvous: invite the eldest parked sender to hand
                // off to the receiver we are about to park.
                wake = if inner.capacity == 0 {
                    inner.pop_sender()
                } else {
                    None
                };
                let ChanInner {
                    recv_waiters,
                    next_waiter,
                    ..
                } = &mut *inner;
                park_waiter(recv_waiters, &mut this.waiter, cx.waker(), next_waiter);
                Poll::Pending
            }
        };
        if let Some(w) = wake {
            w.wake();
        }
        out
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            let mut inner = self.shared.inner.lock().unwrap();
            unpark_waiter(&mut inner.recv_waiters, &mut self.waiter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::runtime::Runtime;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn try_send_try_recv_buffered() {
        let (tx, rx) = buffered(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert_eq!(tx.try_send(3), Err(TrySendError::Full(3)));
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn try_send_rendezvous_needs_waiting_receiver() {
        let (tx, _rx) = unbuffered();
        assert_eq!(tx.try_send(7), Err(TrySendError::Full(7)));
    }

    #[test]
    fn send_on_closed_fails_immediately() {
        let (tx, rx) = buffered::<i32>(4);
        tx.close();
        assert_eq!(tx.try_send(1), Err(TrySendError::Closed(1)));
        drop(rx);
        // Closing twice is fine.
        tx.close();
    }

    #[test]
    fn drop_last_receiver_closes() {
        let (tx, rx) = buffered::<i32>(4);
        drop(rx);
        assert_eq!(tx.try_send(1), Err(TrySendError::Closed(1)));
    }

    #[test]
    fn closed_channel_stays_receivable_until_drained() {
        let (tx, rx) = buffered(4);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        tx.close();
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn rendezvous_handoff() {
        let rt = Runtime::new();
        let got = Arc::new(StdMutex::new(Vec::new()));
        let got2 = got.clone();
        rt.run(move |scope| async move {
            let (tx, rx) = unbuffered();
            scope.spawn(async move {
                for i in 0..3 {
                    tx.send(i).await?;
                }
                Ok(())
            })?;
            while let Ok(v) = rx.recv().await {
                got2.lock().unwrap().push(v);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(*got.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn buffered_send_does_not_wait_for_receiver() {
        let rt = Runtime::new();
        rt.run(|scope| async move {
            let (tx, rx) = buffered(3);
            // No receiver running yet: all three sends complete at once.
            for i in 0..3 {
                tx.send(i).await?;
            }
            tx.close();
            let h = scope.spawn(async move {
                let mut expect = 0;
                while let Ok(v) = rx.recv().await {
                    if v != expect {
                        return Err(TaskError::failed("out of order"));
                    }
                    expect += 1;
                }
                Ok(())
            })?;
            h.join().await
        })
        .unwrap();
    }

    // A producer computes one value, sends it, and closes; the consumer
    // loop observes exactly that value and then the closed marker.
    #[test]
    fn single_value_then_close() {
        let rt = Runtime::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        rt.run(move |scope| async move {
            let (tx, rx) = unbuffered();
            scope.spawn(async move {
                let result = 6 * 7;
                tx.send(result).await?;
                tx.close();
                Ok(())
            })?;
            loop {
                match rx.recv().await {
                    Ok(v) => seen2.lock().unwrap().push(v),
                    Err(RecvError::Closed) => break,
                }
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn values_go_to_exactly_one_receiver() {
        let rt = Runtime::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        rt.run(move |scope| async move {
            let (tx, rx) = buffered(8);
            let rx2 = rx.clone();
            scope.spawn(async move {
                while let Ok(v) = rx.recv().await {
                    a.lock().unwrap().push(v);
                }
                Ok(())
            })?;
            scope.spawn(async move {
                while let Ok(v) = rx2.recv().await {
                    b.lock().unwrap().push(v);
                }
                Ok(())
            })?;
            for i in 0..10 {
                tx.send(i).await?;
            }
            tx.close();
            Ok(())
        })
        .unwrap();
        let mut all = seen.lock().unwrap().clone();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn recv_on_closed_never_suspends() {
        let rt = Runtime::new();
        rt.run(|_scope| async move {
            let (tx, rx) = unbuffered::<i32>();
            tx.close();
            // Sends fail on the spot and both receives resolve on the
            // spot; nothing here suspends.
            assert_eq!(tx.send(5).await, Err(SendError::Closed(5)));
            assert_eq!(rx.recv().await, Err(RecvError::Closed));
            assert_eq!(rx.recv().await, Err(RecvError::Closed));
            Ok(())
        })
        .unwrap();
    }
}
