// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-channel select.
//!
//! A `Select` holds N recv/send cases over channels of one element type.
//! `try_select` sweeps the cases once from a rotating start index;
//! blocking and async forms publish one wait node per case, all sharing a
//! `SelectGroup`, and park until some waker claims the group. The group's
//! single-winner CAS guarantees exactly one case completes per wait
//! cycle; losers observe `Cancel` and re-arm with no effect on the
//! buffers they were watching.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;

use crate::chan::core::WaitLimit;
use crate::chan::error::{TryRecvError, TrySendError};
use crate::chan::waiters::{Notify, SelectGroup, Side, WaitNode};
use crate::chan::{raw, raw_rx, Receiver, Sender};
use crate::deadline::Deadline;

/// Round-robin start index shared by all select calls, so repeated
/// selects do not favor case 0.
static ROTOR: AtomicUsize = AtomicUsize::new(0);

/// Shared ticket source for select wait cycles.
static TICKETS: AtomicU64 = AtomicU64::new(1);

/// The completed case of a select.
#[derive(Debug)]
pub enum SelectOutcome<T> {
    /// A recv case produced a value.
    Recv { index: usize, value: T },
    /// A recv case observed closure (channel drained).
    RecvClosed { index: usize, code: Option<u32> },
    /// A send case delivered its value.
    Sent { index: usize },
    /// A send case observed closure; the value is handed back.
    SendClosed {
        index: usize,
        value: T,
        code: Option<u32>,
    },
}

impl<T> SelectOutcome<T> {
    pub fn index(&self) -> usize {
        match self {
            SelectOutcome::Recv { index, .. }
            | SelectOutcome::RecvClosed { index, .. }
            | SelectOutcome::Sent { index }
            | SelectOutcome::SendClosed { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrySelectError {
    #[error("no select case ready")]
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("select timed out")]
    TimedOut,
    #[error("select cancelled")]
    Cancelled,
}

enum Case<'a, T> {
    Recv(&'a Receiver<T>),
    /// The slot empties while the value is parked in a wait node or once
    /// the case has completed.
    Send(&'a Sender<T>, Option<T>),
}

/// Builder and executor for one multi-channel wait.
pub struct Select<'a, T> {
    cases: Vec<Case<'a, T>>,
}

impl<'a, T> Default for Select<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Select<'a, T> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Add a receive case; returns its index.
    pub fn recv(&mut self, rx: &'a Receiver<T>) -> usize {
        self.cases.push(Case::Recv(rx));
        self.cases.len() - 1
    }

    /// Add a send case carrying `value`; returns its index.
    pub fn send(&mut self, tx: &'a Sender<T>, value: T) -> usize {
        self.cases.push(Case::Send(tx, Some(value)));
        self.cases.len() - 1
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Non-blocking: complete one ready case or report none ready.
    pub fn try_select(&mut self) -> Result<SelectOutcome<T>, TrySelectError> {
        assert!(!self.cases.is_empty(), "select with no cases");
        let start = ROTOR.fetch_add(1, Ordering::Relaxed) % self.cases.len();
        self.sweep(start).ok_or(TrySelectError::NotReady)
    }

    /// Block until one case completes.
    pub fn select(&mut self) -> Result<SelectOutcome<T>, SelectError> {
        self.select_limit(&WaitLimit::new(None))
    }

    pub fn select_timeout(&mut self, timeout: Duration) -> Result<SelectOutcome<T>, SelectError> {
        self.select_limit(&WaitLimit::timeout(timeout))
    }

    pub fn select_deadline(&mut self, deadline: &Deadline) -> Result<SelectOutcome<T>, SelectError> {
        self.select_limit(&WaitLimit::new(Some(deadline)))
    }

    /// Fiber select: parks the calling task.
    pub fn select_async<'s>(&'s mut self) -> SelectFuture<'s, 'a, T> {
        assert!(!self.cases.is_empty(), "select with no cases");
        SelectFuture {
            sel: self,
            state: AsyncState::Init,
        }
    }

    /// One rotation through the cases, non-blocking.
    fn sweep(&mut self, start: usize) -> Option<SelectOutcome<T>> {
        let n = self.cases.len();
        for k in 0..n {
            let index = (start + k) % n;
            match &mut self.cases[index] {
                Case::Recv(rx) => match rx.try_recv() {
                    Ok(value) => return Some(SelectOutcome::Recv { index, value }),
                    Err(TryRecvError::Closed { code }) => {
                        return Some(SelectOutcome::RecvClosed { index, code })
                    }
                    Err(TryRecvError::Empty) => {}
                },
                Case::Send(tx, slot) => {
                    if let Some(v) = slot.take() {
                        match tx.try_send(v) {
                            Ok(()) => return Some(SelectOutcome::Sent { index }),
                            Err(TrySendError::Closed { value, code }) => {
                                return Some(SelectOutcome::SendClosed { index, value, code })
                            }
                            Err(TrySendError::Full(v)) => *slot = Some(v),
                        }
                    }
                }
            }
        }
        None
    }

    /// Arm wait nodes for every armable case. Returns the armed set and
    /// whether all of them linked (false means some case became ready
    /// mid-linking and the caller should resolve immediately).
    fn arm(&mut self, group: &Arc<SelectGroup>) -> (Vec<ArmedCase<T>>, bool) {
        let ticket = TICKETS.fetch_add(1, Ordering::Relaxed);
        let mut armed = Vec::with_capacity(self.cases.len());
        for (index, case) in self.cases.iter_mut().enumerate() {
            let (node, side, linked) = match case {
                Case::Recv(rx) => {
                    let node = WaitNode::new_select(None, group.clone(), index);
                    node.arm(ticket);
                    let linked = raw_rx(rx).link_select_waiter(&node, Side::Recv);
                    (node, Side::Recv, linked)
                }
                Case::Send(tx, slot) => {
                    let Some(v) = slot.take() else { continue };
                    let node = WaitNode::new_select(Some(v), group.clone(), index);
                    node.arm(ticket);
                    let linked = raw(tx).link_select_waiter(&node, Side::Send);
                    (node, Side::Send, linked)
                }
            };
            armed.push(ArmedCase { index, node, side });
            if !linked {
                return (armed, false);
            }
        }
        (armed, true)
    }

    /// Unlink every armed node, return unsent values to their slots, and
    /// extract the winning outcome if the cycle produced one.
    fn resolve(
        &mut self,
        group: &SelectGroup,
        armed: Vec<ArmedCase<T>>,
    ) -> Option<SelectOutcome<T>> {
        for ac in &armed {
            match &self.cases[ac.index] {
                Case::Recv(rx) => raw_rx(rx).unlink_waiter(&ac.node, ac.side),
                Case::Send(tx, _) => raw(tx).unlink_waiter(&ac.node, ac.side),
            }
        }
        let winner = group.selected();
        let mut outcome = None;
        for ac in &armed {
            if winner != Some(ac.index) {
                continue;
            }
            match ac.node.state() {
                Notify::Data => {
                    outcome = Some(match ac.side {
                        Side::Recv => SelectOutcome::Recv {
                            index: ac.index,
                            value: ac
                                .node
                                .take_data()
                                .expect("handoff filled the select node"),
                        },
                        Side::Send => SelectOutcome::Sent { index: ac.index },
                    });
                    break;
                }
                Notify::Close => {
                    outcome = Some(match ac.side {
                        Side::Recv => SelectOutcome::RecvClosed {
                            index: ac.index,
                            code: ac.node.close_code(),
                        },
                        Side::Send => SelectOutcome::SendClosed {
                            index: ac.index,
                            value: ac
                                .node
                                .take_data()
                                .expect("closed send node retains its value"),
                            code: ac.node.close_code(),
                        },
                    });
                    break;
                }
                _ => {}
            }
        }
        // Hand unsent values back for the next cycle (or the caller).
        for ac in armed {
            if ac.side == Side::Send {
                if let Some(v) = ac.node.take_data() {
                    if let Case::Send(_, slot) = &mut self.cases[ac.index] {
                        *slot = Some(v);
                    }
                }
            }
        }
        outcome
    }

    fn kick_senders(&self, armed: &[ArmedCase<T>]) {
        for ac in armed {
            if ac.side == Side::Recv {
                if let Case::Recv(rx) = &self.cases[ac.index] {
                    raw_rx(rx).kick_one_sender();
                }
            }
        }
    }

    fn select_limit(&mut self, limit: &WaitLimit) -> Result<SelectOutcome<T>, SelectError> {
        assert!(!self.cases.is_empty(), "select with no cases");
        let start = ROTOR.fetch_add(1, Ordering::Relaxed) % self.cases.len();
        let group = SelectGroup::new();
        loop {
            if limit.cancelled() {
                return Err(SelectError::Cancelled);
            }
            if let Some(out) = self.sweep(start) {
                return Ok(out);
            }
            if limit.expired() {
                return Err(SelectError::TimedOut);
            }

            group.rearm();
            let seen = group.signaled();
            let (armed, all_linked) = self.arm(&group);
            assert!(!armed.is_empty(), "select has no armable cases left");
            if all_linked {
                self.kick_senders(&armed);
                while group.signaled() == seen && !limit.cancelled() && !limit.expired() {
                    group.park_thread(seen, limit.wait_target());
                }
            }
            if let Some(out) = self.resolve(&group, armed) {
                return Ok(out);
            }
            // Lost cycle (Cancel/Signal only): re-arm and retry.
        }
    }
}

struct ArmedCase<T> {
    index: usize,
    node: Arc<WaitNode<T>>,
    side: Side,
}

enum AsyncState<T> {
    Init,
    Parked {
        group: Arc<SelectGroup>,
        armed: Vec<ArmedCase<T>>,
        seen: u64,
    },
    Done,
}

/// Future returned by [`Select::select_async`].
pub struct SelectFuture<'s, 'a, T> {
    sel: &'s mut Select<'a, T>,
    state: AsyncState<T>,
}

impl<T> Unpin for SelectFuture<'_, '_, T> {}

impl<T> Future for SelectFuture<'_, '_, T> {
    type Output = SelectOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            match std::mem::replace(&mut this.state, AsyncState::Done) {
                AsyncState::Init => {
                    let start =
                        ROTOR.fetch_add(1, Ordering::Relaxed) % this.sel.cases.len();
                    if let Some(out) = this.sel.sweep(start) {
                        return Poll::Ready(out);
                    }
                    let group = SelectGroup::new();
                    group.set_waker(cx.waker());
                    let seen = group.signaled();
                    let (armed, all_linked) = this.sel.arm(&group);
                    assert!(!armed.is_empty(), "select has no armable cases left");
                    if !all_linked {
                        if let Some(out) = this.sel.resolve(&group, armed) {
                            return Poll::Ready(out);
                        }
                        this.state = AsyncState::Init;
                        continue;
                    }
                    this.sel.kick_senders(&armed);
                    if group.signaled() != seen {
                        // A waker fired during linking; resolve now.
                        if let Some(out) = this.sel.resolve(&group, armed) {
                            return Poll::Ready(out);
                        }
                        this.state = AsyncState::Init;
                        continue;
                    }
                    this.state = AsyncState::Parked { group, armed, seen };
                    return Poll::Pending;
                }
                AsyncState::Parked { group, armed, seen } => {
                    if group.signaled() == seen {
                        group.set_waker(cx.waker());
                        // Re-check: the bump may have raced the re-arm.
                        if group.signaled() == seen {
                            this.state = AsyncState::Parked { group, armed, seen };
                            return Poll::Pending;
                        }
                    }
                    if let Some(out) = this.sel.resolve(&group, armed) {
                        return Poll::Ready(out);
                    }
                    this.state = AsyncState::Init;
                }
                AsyncState::Done => panic!("select future polled after completion"),
            }
        }
    }
}

impl<T> Drop for SelectFuture<'_, '_, T> {
    fn drop(&mut self) {
        if let AsyncState::Parked { armed, .. } =
            std::mem::replace(&mut self.state, AsyncState::Done)
        {
            // Unlink and restore unsent values; a completed-but-undelivered
            // recv value has nowhere to go except back to its channel.
            for ac in &armed {
                match &self.sel.cases[ac.index] {
                    Case::Recv(rx) => {
                        raw_rx(rx).unlink_waiter(&ac.node, ac.side);
                        if ac.node.state() == Notify::Data {
                            if let Some(v) = ac.node.take_data() {
                                raw_rx(rx).requeue_front(v);
                            }
                        }
                    }
                    Case::Send(tx, _) => raw(tx).unlink_waiter(&ac.node, ac.side),
                }
            }
            for ac in armed {
                if ac.side == Side::Send {
                    if let Some(v) = ac.node.take_data() {
                        if let Case::Send(_, slot) = &mut self.sel.cases[ac.index] {
                            *slot = Some(v);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::bounded;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_select_prefers_ready_case() {
        let (tx_a, rx_a) = bounded(4);
        let (_tx_b, rx_b) = bounded::<i32>(4);
        tx_a.send(7).unwrap();
        let mut sel = Select::new();
        let a = sel.recv(&rx_a);
        sel.recv(&rx_b);
        match sel.try_select().unwrap() {
            SelectOutcome::Recv { index, value } => {
                assert_eq!(index, a);
                assert_eq!(value, 7);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn try_select_not_ready() {
        let (_tx, rx) = bounded::<i32>(4);
        let mut sel = Select::new();
        sel.recv(&rx);
        assert_eq!(sel.try_select().unwrap_err(), TrySelectError::NotReady);
    }

    #[test]
    fn blocking_select_wakes_on_send() {
        let (tx_a, rx_a) = bounded::<i32>(4);
        let (_tx_b, rx_b) = bounded::<i32>(4);
        let t = thread::spawn(move || {
            let mut sel = Select::new();
            sel.recv(&rx_a);
            sel.recv(&rx_b);
            sel.select().unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        tx_a.send(42).unwrap();
        match t.join().unwrap() {
            SelectOutcome::Recv { index: 0, value } => assert_eq!(value, 42),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn select_send_case_completes_when_space_frees() {
        let (tx, rx) = bounded::<i32>(1);
        tx.send(0).unwrap();
        let t = thread::spawn(move || {
            let mut sel = Select::new();
            sel.send(&tx, 1);
            sel.select().unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.recv().unwrap(), 0);
        match t.join().unwrap() {
            SelectOutcome::Sent { index: 0 } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(rx.recv().unwrap(), 1);
    }

    #[test]
    fn select_timeout_expires() {
        let (_tx, rx) = bounded::<i32>(4);
        let mut sel = Select::new();
        sel.recv(&rx);
        assert_eq!(
            sel.select_timeout(Duration::from_millis(30)).unwrap_err(),
            SelectError::TimedOut
        );
    }

    #[test]
    fn select_sees_closure() {
        let (tx, rx) = bounded::<i32>(4);
        tx.close_with(9);
        let mut sel = Select::new();
        sel.recv(&rx);
        match sel.select().unwrap() {
            SelectOutcome::RecvClosed { index: 0, code } => assert_eq!(code, Some(9)),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn losers_rearm_without_losing_values() {
        // Two selectors over one channel: one value, exactly one winner.
        let (tx, rx) = bounded::<i32>(4);
        let rx2 = rx.clone();
        let w1 = thread::spawn(move || {
            let mut sel = Select::new();
            sel.recv(&rx);
            sel.select_timeout(Duration::from_millis(200))
        });
        let w2 = thread::spawn(move || {
            let mut sel = Select::new();
            sel.recv(&rx2);
            sel.select_timeout(Duration::from_millis(200))
        });
        thread::sleep(Duration::from_millis(30));
        tx.send(5).unwrap();
        let r1 = w1.join().unwrap();
        let r2 = w2.join().unwrap();
        let winners = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Ok(SelectOutcome::Recv { value: 5, .. })))
            .count();
        let losers = [&r1, &r2]
            .iter()
            .filter(|r| matches!(r, Err(SelectError::TimedOut)))
            .count();
        assert_eq!((winners, losers), (1, 1));
    }

    #[test]
    fn send_and_recv_cases_mix() {
        let (tx_a, rx_a) = bounded::<i32>(1);
        let (tx_b, _rx_b) = bounded::<i32>(1);
        tx_a.send(3).unwrap();
        let mut sel = Select::new();
        sel.recv(&rx_a);
        sel.send(&tx_b, 4);
        // Both ready; rotation picks one, but some case must complete.
        let out = sel.select().unwrap();
        match out {
            SelectOutcome::Recv { index: 0, value } => assert_eq!(value, 3),
            SelectOutcome::Sent { index: 1 } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
