// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Poll-based channel operations for fibers.
//!
//! The first poll tries the non-blocking path; if the operation would
//! block, a fiber wait node carrying the task waker is published and the
//! future returns `Pending` until a peer completes the handoff. Every Nth
//! fast-path completion yields the fiber back to the scheduler so a tight
//! send/recv loop cannot monopolize its worker.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::core::{Channel, RecvPoll, RecvResolve, SendPoll, SendResolve};
use super::error::{RecvError, SendError};
use super::waiters::{Side, WaitNode};
use super::{Receiver, Sender};
use crate::stats::{self, STATS};

/// Fast-path operations between forced yields.
const YIELD_EVERY: u32 = 64;

thread_local! {
    static FAST_OPS: Cell<u32> = const { Cell::new(0) };
}

/// True every `YIELD_EVERY`th call on this worker thread.
fn fairness_tick() -> bool {
    FAST_OPS.with(|c| {
        let n = c.get().wrapping_add(1);
        c.set(n);
        n % YIELD_EVERY == 0
    })
}

enum FutState<T> {
    Init(Option<T>),
    Parked(Arc<WaitNode<T>>),
    /// Operation complete; one forced yield before reporting ready.
    YieldPending(Option<Result<(), SendError<T>>>),
    Done,
}

/// Future returned by [`Sender::send_async`].
pub struct SendFuture<'a, T> {
    chan: &'a Arc<Channel<T>>,
    state: FutState<T>,
}

impl<'a, T> SendFuture<'a, T> {
    pub(crate) fn new(chan: &'a Arc<Channel<T>>, value: T) -> Self {
        Self {
            chan,
            state: FutState::Init(Some(value)),
        }
    }
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                FutState::Init(slot) => {
                    let value = slot.take().expect("send future polled with no value");
                    match this.chan.send_poll(value, cx.waker()) {
                        SendPoll::Sent => {
                            if fairness_tick() {
                                this.state = FutState::YieldPending(Some(Ok(())));
                                stats::bump(&STATS.yields);
                                cx.waker().wake_by_ref();
                                return Poll::Pending;
                            }
                            this.state = FutState::Done;
                            return Poll::Ready(Ok(()));
                        }
                        SendPoll::Closed { value, code } => {
                            this.state = FutState::Done;
                            return Poll::Ready(Err(SendError::Closed { value, code }));
                        }
                        SendPoll::Full(value) => {
                            this.state = FutState::Done;
                            return Poll::Ready(Err(SendError::Full(value)));
                        }
                        SendPoll::Parked(node) => {
                            this.state = FutState::Parked(node);
                            return Poll::Pending;
                        }
                    }
                }
                FutState::Parked(node) => match this.chan.send_resolve(node, cx.waker()) {
                    SendResolve::Done => {
                        this.state = FutState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    SendResolve::Pending => return Poll::Pending,
                    SendResolve::Retry(value) => {
                        this.state = FutState::Init(Some(value));
                    }
                },
                FutState::YieldPending(result) => {
                    let result = result.take().expect("yield state holds the result");
                    this.state = FutState::Done;
                    return Poll::Ready(result);
                }
                FutState::Done => panic!("send future polled after completion"),
            }
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if let FutState::Parked(node) = &self.state {
            self.chan.abandon_waiter(node, Side::Send);
        }
    }
}

enum RecvState<T> {
    Init,
    Parked(Arc<WaitNode<T>>),
    YieldPending(Option<T>),
    Done,
}

/// Future returned by [`Receiver::recv_async`].
pub struct RecvFuture<'a, T> {
    chan: &'a Arc<Channel<T>>,
    state: RecvState<T>,
}

impl<'a, T> RecvFuture<'a, T> {
    pub(crate) fn new(chan: &'a Arc<Channel<T>>) -> Self {
        Self {
            chan,
            state: RecvState::Init,
        }
    }
}

impl<T> Unpin for RecvFuture<'_, T> {}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                RecvState::Init => match this.chan.recv_poll(cx.waker()) {
                    RecvPoll::Got(v) => {
                        if fairness_tick() {
                            this.state = RecvState::YieldPending(Some(v));
                            stats::bump(&STATS.yields);
                            cx.waker().wake_by_ref();
                            return Poll::Pending;
                        }
                        this.state = RecvState::Done;
                        return Poll::Ready(Ok(v));
                    }
                    RecvPoll::Closed { code } => {
                        this.state = RecvState::Done;
                        return Poll::Ready(Err(RecvError::Closed { code }));
                    }
                    RecvPoll::Draining => {
                        // Producers already committed; spin via the
                        // scheduler rather than blocking the worker.
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                    RecvPoll::Parked(node) => {
                        this.state = RecvState::Parked(node);
                        return Poll::Pending;
                    }
                },
                RecvState::Parked(node) => match this.chan.recv_resolve(node, cx.waker()) {
                    RecvResolve::Got(v) => {
                        this.state = RecvState::Done;
                        return Poll::Ready(Ok(v));
                    }
                    RecvResolve::Pending => return Poll::Pending,
                    RecvResolve::Retry => {
                        this.state = RecvState::Init;
                    }
                },
                RecvState::YieldPending(slot) => {
                    let v = slot.take().expect("yield state holds the value");
                    this.state = RecvState::Done;
                    return Poll::Ready(Ok(v));
                }
                RecvState::Done => panic!("recv future polled after completion"),
            }
        }
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        match &mut self.state {
            RecvState::Parked(node) => self.chan.abandon_waiter(node, Side::Recv),
            RecvState::YieldPending(slot) => {
                // Drop between yield and final poll: requeue the value.
                if let Some(v) = slot.take() {
                    self.chan.requeue_front(v);
                }
            }
            _ => {}
        }
    }
}

/// Submit a send to the scheduler; the returned handle is a capacity-1
/// completion channel carrying the operation's result.
pub fn submit_send<T>(tx: &Sender<T>, value: T) -> Receiver<Result<(), SendError<T>>>
where
    T: Send + 'static,
{
    let (done_tx, done_rx) = super::bounded(1);
    let tx = tx.clone();
    crate::sched::spawn(async move {
        let result = tx.send_async(value).await;
        let _ = done_tx.try_send(result);
    })
    .detach();
    done_rx
}

/// Submit a receive to the scheduler; the returned handle completes with
/// the received value or the closure error.
pub fn submit_recv<T>(rx: &Receiver<T>) -> Receiver<Result<T, RecvError>>
where
    T: Send + 'static,
{
    let (done_tx, done_rx) = super::bounded(1);
    let rx = rx.clone();
    crate::sched::spawn(async move {
        let result = rx.recv_async().await;
        let _ = done_tx.try_send(result);
    })
    .detach();
    done_rx
}
