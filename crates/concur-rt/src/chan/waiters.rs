// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait nodes and the notification protocol.
//!
//! A blocked operation publishes a `WaitNode` into the channel's waiter
//! list while holding the channel mutex, then parks: an OS thread waits on
//! the channel condvar, a fiber stores its waker and returns `Pending`, a
//! select arm shares a `SelectGroup` across all its nodes. Wakers run
//! under the same mutex, so node state only ever changes with the owning
//! channel's lock held; the `notified` machine plus the arm ticket make a
//! stale waker a no-op instead of a double delivery.
//!
//! Fiber wakers and select-group notifications are collected into a
//! `WakeBatch` and fired after the channel mutex is released, so freshly
//! woken tasks never immediately contend on the lock we still hold.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::Waker;

use parking_lot::{Condvar, Mutex};

use crate::config::config;

/// Notification states of a wait node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    /// Armed, nothing happened yet.
    Waiting = 0,
    /// Generic wake: re-check channel state and retry.
    Woken = 1,
    /// Direct handoff completed; the node's data slot was filled (recv)
    /// or drained (send).
    Data = 2,
    /// Buffer state changed in the waiter's favor; retry the operation.
    Signal = 3,
    /// A sibling select case won this wait cycle.
    Cancel = 4,
    /// The channel closed under the waiter.
    Close = 5,
}

impl Notify {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Notify::Waiting,
            1 => Notify::Woken,
            2 => Notify::Data,
            3 => Notify::Signal,
            4 => Notify::Cancel,
            _ => Notify::Close,
        }
    }
}

/// Shared state of one select call: the single-winner slot and the park
/// guard counter.
pub(crate) struct SelectGroup {
    /// Winning case index; −1 until a waker claims the cycle.
    selected: AtomicIsize,
    /// Monotonic wake counter. The selecting waiter parks against a
    /// snapshot of this.
    signaled: AtomicU64,
    /// Fiber selector's waker.
    waker: Mutex<Option<Waker>>,
    /// Thread selector's park point.
    lock: Mutex<()>,
    cv: Condvar,
}

impl SelectGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            selected: AtomicIsize::new(-1),
            signaled: AtomicU64::new(0),
            waker: Mutex::new(None),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    /// Claim the current wait cycle for case `index`. Exactly one caller
    /// per cycle succeeds.
    pub fn try_win(&self, index: usize) -> bool {
        self.selected
            .compare_exchange(-1, index as isize, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn selected(&self) -> Option<usize> {
        match self.selected.load(Ordering::Acquire) {
            -1 => None,
            i => Some(i as usize),
        }
    }

    pub fn signaled(&self) -> u64 {
        self.signaled.load(Ordering::Acquire)
    }

    /// Reset for the next wait cycle (after losers re-arm).
    pub fn rearm(&self) {
        self.selected.store(-1, Ordering::Release);
    }

    pub fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match &*slot {
            Some(w) if w.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    pub fn take_waker(&self) -> Option<Waker> {
        self.waker.lock().take()
    }

    /// Park the selecting thread until `signaled` moves past `seen`.
    /// Returns false on timeout.
    pub fn park_thread(&self, seen: u64, until: Option<std::time::Instant>) -> bool {
        let mut guard = self.lock.lock();
        while self.signaled() == seen {
            match until {
                Some(t) => {
                    if self.cv.wait_until(&mut guard, t).timed_out() {
                        return self.signaled() != seen;
                    }
                }
                None => self.cv.wait(&mut guard),
            }
        }
        true
    }

    fn signal(&self, batch: &mut WakeBatch) {
        self.signaled.fetch_add(1, Ordering::AcqRel);
        if let Some(w) = self.take_waker() {
            batch.push_waker(w);
        }
        // Notify under the park lock: a selector between its re-check and
        // its wait cannot miss the wake.
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }
}

/// Who is parked behind a node.
pub(crate) enum WaiterKind {
    /// OS thread waiting on the channel condvar.
    Thread,
    /// Fiber; the waker re-enqueues its task.
    Fiber(Mutex<Option<Waker>>),
    /// One case of a select call.
    Select { group: Arc<SelectGroup>, index: usize },
}

/// Per-wait bookkeeping published into a channel's waiter list.
pub(crate) struct WaitNode<T> {
    state: AtomicU8,
    /// Arm generation. A node popped by one waker while the owner re-arms
    /// it for the next cycle carries a new ticket; stale tickets are
    /// skipped.
    ticket: AtomicU64,
    in_list: AtomicBool,
    /// Close code observed by a `Close` notification, offset by one so
    /// zero means "none".
    close_code: AtomicU32,
    /// Handoff scratch: senders park with their value here, receivers
    /// park empty and get filled.
    data: Mutex<Option<T>>,
    pub(crate) kind: WaiterKind,
}

impl<T> WaitNode<T> {
    pub fn new_thread(data: Option<T>) -> Arc<Self> {
        Self::with_kind(data, WaiterKind::Thread)
    }

    pub fn new_fiber(data: Option<T>, waker: Waker) -> Arc<Self> {
        Self::with_kind(data, WaiterKind::Fiber(Mutex::new(Some(waker))))
    }

    pub fn new_select(data: Option<T>, group: Arc<SelectGroup>, index: usize) -> Arc<Self> {
        Self::with_kind(data, WaiterKind::Select { group, index })
    }

    fn with_kind(data: Option<T>, kind: WaiterKind) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(Notify::Waiting as u8),
            ticket: AtomicU64::new(0),
            in_list: AtomicBool::new(false),
            close_code: AtomicU32::new(0),
            data: Mutex::new(data),
            kind,
        })
    }

    pub fn state(&self) -> Notify {
        Notify::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Re-arm for a fresh wait cycle under the channel mutex.
    pub fn arm(&self, ticket: u64) {
        self.ticket.store(ticket, Ordering::Release);
        self.close_code.store(0, Ordering::Relaxed);
        self.state.store(Notify::Waiting as u8, Ordering::Release);
    }

    pub fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::Acquire)
    }

    pub fn set_in_list(&self, v: bool) {
        self.in_list.store(v, Ordering::Release);
    }

    pub fn in_list(&self) -> bool {
        self.in_list.load(Ordering::Acquire)
    }

    pub fn put_data(&self, value: T) {
        *self.data.lock() = Some(value);
    }

    pub fn take_data(&self) -> Option<T> {
        self.data.lock().take()
    }

    pub fn close_code(&self) -> Option<u32> {
        match self.close_code.load(Ordering::Acquire) {
            0 => None,
            c => Some(c - 1),
        }
    }

    /// Transition `Waiting → to`. Caller holds the owning channel's mutex;
    /// the CAS still guards against a waiter that resolved its own node
    /// (timeout) an instant earlier on another channel path.
    pub fn claim(&self, expected_ticket: u64, to: Notify) -> bool {
        if self.ticket() != expected_ticket {
            return false;
        }
        self.state
            .compare_exchange(
                Notify::Waiting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn record_close_code(&self, code: Option<u32>) {
        if let Some(c) = code {
            self.close_code.store(c + 1, Ordering::Release);
        }
    }

    /// Mark a select loser. No-op if the node already resolved.
    pub fn cancel_if_waiting(&self) {
        let _ = self.state.compare_exchange(
            Notify::Waiting as u8,
            Notify::Cancel as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Queue this node's wakeup into `batch`. Called after a successful
    /// `claim` with the channel mutex held.
    pub fn wake(&self, side: Side, batch: &mut WakeBatch) {
        match &self.kind {
            WaiterKind::Thread => batch.notify_cv(side),
            WaiterKind::Fiber(waker) => {
                if let Some(w) = waker.lock().take() {
                    batch.push_waker(w);
                }
            }
            WaiterKind::Select { group, .. } => group.signal(batch),
        }
    }

    pub fn store_waker(&self, waker: &Waker) {
        if let WaiterKind::Fiber(slot) = &self.kind {
            let mut slot = slot.lock();
            match &*slot {
                Some(w) if w.will_wake(waker) => {}
                _ => *slot = Some(waker.clone()),
            }
        }
    }
}

/// Which waiter list a node lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Send,
    Recv,
}

thread_local! {
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static DEFERRED: RefCell<Vec<Waker>> = const { RefCell::new(Vec::new()) };
}

/// Tracks how many channel mutexes this thread currently holds, so a
/// deferred wake batch can flush once the last one is released.
pub(crate) struct LockDepthGuard;

impl LockDepthGuard {
    pub fn enter() -> Self {
        LOCK_DEPTH.with(|d| d.set(d.get() + 1));
        LockDepthGuard
    }
}

impl Drop for LockDepthGuard {
    fn drop(&mut self) {
        let depth = LOCK_DEPTH.with(|d| {
            let v = d.get() - 1;
            d.set(v);
            v
        });
        if depth == 0 {
            let pending = DEFERRED.with(|p| std::mem::take(&mut *p.borrow_mut()));
            for w in pending {
                w.wake();
            }
        }
    }
}

/// Wakeups collected under a channel mutex, fired after release.
pub(crate) struct WakeBatch {
    wakers: Vec<Waker>,
    notify_send_cv: bool,
    notify_recv_cv: bool,
}

impl WakeBatch {
    pub fn new() -> Self {
        Self {
            wakers: Vec::new(),
            notify_send_cv: false,
            notify_recv_cv: false,
        }
    }

    pub fn push_waker(&mut self, w: Waker) {
        self.wakers.push(w);
    }

    pub fn notify_cv(&mut self, side: Side) {
        match side {
            Side::Send => self.notify_send_cv = true,
            Side::Recv => self.notify_recv_cv = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wakers.is_empty() && !self.notify_send_cv && !self.notify_recv_cv
    }

    pub fn wants_send_cv(&self) -> bool {
        self.notify_send_cv
    }

    pub fn wants_recv_cv(&self) -> bool {
        self.notify_recv_cv
    }

    /// Fire the collected fiber wakers. Must be called after the channel
    /// mutex is released; condvar notification is the channel's job since
    /// it owns the condvars.
    pub fn flush(&mut self) {
        if self.wakers.is_empty() {
            return;
        }
        let held = LOCK_DEPTH.with(|d| d.get());
        if held > 0 {
            if config().wake_guard {
                log::warn!("wake batch flushed with {held} channel lock(s) held");
            }
            if config().wake_defer {
                DEFERRED.with(|p| p.borrow_mut().append(&mut self.wakers));
                return;
            }
        }
        for w in self.wakers.drain(..) {
            w.wake();
        }
    }
}

impl Drop for WakeBatch {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_single_shot() {
        let node = WaitNode::<u32>::new_thread(None);
        node.arm(1);
        assert!(node.claim(1, Notify::Data));
        assert!(!node.claim(1, Notify::Woken));
        assert_eq!(node.state(), Notify::Data);
    }

    #[test]
    fn stale_ticket_is_skipped() {
        let node = WaitNode::<u32>::new_thread(None);
        node.arm(1);
        node.arm(2);
        assert!(!node.claim(1, Notify::Data));
        assert!(node.claim(2, Notify::Data));
    }

    #[test]
    fn select_group_single_winner() {
        let group = SelectGroup::new();
        assert!(group.try_win(2));
        assert!(!group.try_win(0));
        assert_eq!(group.selected(), Some(2));
        group.rearm();
        assert!(group.try_win(0));
    }

    #[test]
    fn data_roundtrip() {
        let node = WaitNode::new_thread(Some(41u32));
        assert_eq!(node.take_data(), Some(41));
        assert_eq!(node.take_data(), None);
        node.put_data(42);
        assert_eq!(node.take_data(), Some(42));
    }

    #[test]
    fn close_code_offset() {
        let node = WaitNode::<u32>::new_thread(None);
        assert_eq!(node.close_code(), None);
        node.record_close_code(Some(0));
        assert_eq!(node.close_code(), Some(0));
        node.record_close_code(Some(17));
        assert_eq!(node.close_code(), Some(17));
    }
}
