// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel internals: buffer, slow paths, close.
//!
//! Two backing stores: branded channels (buffered, Block mode, lock-free
//! enabled) carry an [`MpmcRing`] that producers and consumers hit without
//! the channel mutex; everything else — rendezvous, drop modes, forced
//! mutex — goes through the `VecDeque` ring inside `Inner`. The slow path
//! always runs under the mutex: re-check closure, try a direct handoff to
//! a parked peer, retry the buffer, then publish a wait node and park.
//!
//! The publish/park race against lock-free peers is closed Dekker-style:
//! the parker links its node and sets the published waiter flag, fences,
//! and retries the buffer once before sleeping; the fast path
//! enqueues/dequeues, fences, and then loads the flag. At least one side
//! observes the other.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::chan::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::chan::waiters::{
    LockDepthGuard, Notify, Side, WaitNode, WaiterKind, WakeBatch,
};
use crate::chan::{OverflowMode, PoolHooks};
use crate::config::config;
use crate::deadline::{self, Deadline};
use crate::nursery;
use crate::ring::MpmcRing;
use crate::stats::{self, STATS};

/// How long a blocking wait may go between cancellation re-checks. A
/// cancelled ambient deadline has no one to signal our condvar.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Non-blocking try_recv tolerates this many spins waiting out in-flight
/// producers on a closed channel before reporting closure.
const TRY_DRAIN_SPINS: u32 = 64;

/// Blocking-wait bounds: an absolute expiry plus cancellation sources.
pub(crate) struct WaitLimit {
    until: Option<Instant>,
    explicit: Option<Deadline>,
    ambient: Option<Deadline>,
}

impl WaitLimit {
    /// Combine an explicit deadline with the thread's ambient one; the
    /// earlier expiry wins, either cancellation fires.
    pub fn new(explicit: Option<&Deadline>) -> Self {
        let ambient = deadline::current();
        let mut until = explicit.and_then(|d| d.instant());
        if let Some(t) = ambient.as_ref().and_then(|d| d.instant()) {
            until = Some(until.map_or(t, |u| u.min(t)));
        }
        Self {
            until,
            explicit: explicit.cloned(),
            ambient,
        }
    }

    pub fn timeout(dur: Duration) -> Self {
        let mut limit = Self::new(None);
        let t = Instant::now() + dur;
        limit.until = Some(limit.until.map_or(t, |u| u.min(t)));
        limit
    }

    pub fn cancelled(&self) -> bool {
        self.explicit.as_ref().is_some_and(Deadline::is_cancelled)
            || self.ambient.as_ref().is_some_and(Deadline::is_cancelled)
    }

    fn cancellable(&self) -> bool {
        self.explicit.is_some() || self.ambient.is_some()
    }

    pub fn expired(&self) -> bool {
        matches!(self.until, Some(t) if Instant::now() >= t)
    }

    /// Next condvar wakeup target for one wait iteration.
    pub(crate) fn wait_target(&self) -> Option<Instant> {
        let poll = self.cancellable().then(|| Instant::now() + CANCEL_POLL);
        match (self.until, poll) {
            (Some(u), Some(p)) => Some(u.min(p)),
            (Some(u), None) => Some(u),
            (None, p) => p,
        }
    }
}

/// Outcome of one under-lock send attempt.
enum SendReady<T> {
    Done,
    Full(T),
}

struct Inner<T> {
    buf: VecDeque<T>,
    send_waiters: VecDeque<Arc<WaitNode<T>>>,
    recv_waiters: VecDeque<Arc<WaitNode<T>>>,
}

struct PoolState<T> {
    hooks: PoolHooks<T>,
    created: AtomicUsize,
    max: usize,
}

/// Shared channel object behind `Sender`/`Receiver` handles.
pub(crate) struct Channel<T> {
    cap: usize,
    mode: OverflowMode,
    ordered: bool,
    ring: Option<MpmcRing<T>>,
    fast_path_ok: AtomicBool,
    /// Mutation counter: every enqueue/dequeue/wake under the mutex bumps
    /// it. Also the wait-ticket source.
    gen: AtomicU64,
    has_send_waiters: AtomicBool,
    has_recv_waiters: AtomicBool,
    closed: AtomicBool,
    rx_closed: AtomicBool,
    tx_code: AtomicU32,
    rx_code: AtomicU32,
    pub(crate) senders: AtomicUsize,
    pub(crate) receivers: AtomicUsize,
    inner: Mutex<Inner<T>>,
    send_cv: Condvar,
    recv_cv: Condvar,
    pool: Option<PoolState<T>>,
    autoclose_owner: Option<nursery::NurseryId>,
}

impl<T> Channel<T> {
    pub(crate) fn new(
        cap: usize,
        mode: OverflowMode,
        ordered: bool,
        lockfree: bool,
        pool: Option<(PoolHooks<T>, usize)>,
        autoclose_owner: Option<nursery::NurseryId>,
    ) -> Arc<Self> {
        let cfg = config();
        let use_ring =
            cap > 1 && mode == OverflowMode::Block && lockfree && !cfg.no_lockfree;
        let ring = use_ring.then(|| MpmcRing::with_capacity(cap));
        let branded = ring.is_some() && cfg.fast_path && !ordered && pool.is_none();
        Arc::new(Self {
            cap,
            mode,
            ordered,
            ring,
            fast_path_ok: AtomicBool::new(branded),
            gen: AtomicU64::new(0),
            has_send_waiters: AtomicBool::new(false),
            has_recv_waiters: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rx_closed: AtomicBool::new(false),
            tx_code: AtomicU32::new(0),
            rx_code: AtomicU32::new(0),
            senders: AtomicUsize::new(1),
            receivers: AtomicUsize::new(1),
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
            }),
            send_cv: Condvar::new(),
            recv_cv: Condvar::new(),
            pool: pool.map(|(hooks, max)| PoolState {
                hooks,
                created: AtomicUsize::new(0),
                max,
            }),
            autoclose_owner,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        let buffered = self.inner.lock().buf.len();
        buffered + self.ring.as_ref().map_or(0, MpmcRing::len)
    }

    fn branded(&self) -> bool {
        self.fast_path_ok.load(Ordering::Acquire)
    }

    fn rx_is_closed(&self) -> bool {
        self.rx_closed.load(Ordering::SeqCst)
    }

    fn tx_code(&self) -> Option<u32> {
        match self.tx_code.load(Ordering::SeqCst) {
            0 => None,
            c => Some(c - 1),
        }
    }

    fn rx_code(&self) -> Option<u32> {
        match self.rx_code.load(Ordering::SeqCst) {
            0 => None,
            c => Some(c - 1),
        }
    }

    /// The code a failing send should report: the receive side's error
    /// wins when both sides closed.
    fn send_closed_code(&self) -> Option<Option<u32>> {
        if self.rx_is_closed() {
            Some(self.rx_code())
        } else if self.is_closed() {
            Some(self.tx_code())
        } else {
            None
        }
    }

    fn bump_gen(&self) {
        self.gen.fetch_add(1, Ordering::Release);
    }

    fn next_ticket(&self) -> u64 {
        self.gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn apply_reset(&self, value: &mut T) {
        if let Some(pool) = &self.pool {
            if let Some(reset) = &pool.hooks.reset {
                reset(value);
            }
        }
    }

    /// Notify condvars requested by the batch and fire fiber wakers.
    /// Call with the channel mutex released.
    fn finish(&self, mut batch: WakeBatch) {
        if batch.is_empty() {
            return;
        }
        if batch.wants_send_cv() {
            self.send_cv.notify_all();
        }
        if batch.wants_recv_cv() {
            self.recv_cv.notify_all();
        }
        batch.flush();
        stats::bump(&STATS.wakes);
    }

    // ---- waiter list plumbing (all under `inner`) ----

    fn pop_waiter(
        list: &mut VecDeque<Arc<WaitNode<T>>>,
        flag: &AtomicBool,
    ) -> Option<Arc<WaitNode<T>>> {
        let node = list.pop_front();
        if list.is_empty() {
            flag.store(false, Ordering::SeqCst);
        }
        if let Some(n) = &node {
            n.set_in_list(false);
        }
        node
    }

    fn push_waiter(&self, inner: &mut Inner<T>, side: Side, node: Arc<WaitNode<T>>) {
        node.set_in_list(true);
        if config().chan_debug_verbose {
            log::trace!("chan: {side:?} waiter parked (ticket {})", node.ticket());
        }
        match side {
            Side::Send => {
                inner.send_waiters.push_back(node);
                self.has_send_waiters.store(true, Ordering::SeqCst);
            }
            Side::Recv => {
                inner.recv_waiters.push_back(node);
                self.has_recv_waiters.store(true, Ordering::SeqCst);
            }
        }
        stats::bump(&STATS.parks);
    }

    fn unlink_locked(&self, inner: &mut Inner<T>, node: &Arc<WaitNode<T>>, side: Side) {
        if !node.in_list() {
            return;
        }
        let (list, flag) = match side {
            Side::Send => (&mut inner.send_waiters, &self.has_send_waiters),
            Side::Recv => (&mut inner.recv_waiters, &self.has_recv_waiters),
        };
        list.retain(|n| !Arc::ptr_eq(n, node));
        if list.is_empty() {
            flag.store(false, Ordering::SeqCst);
        }
        node.set_in_list(false);
    }

    /// Hand `value` straight to a parked receiver, skipping claimed and
    /// select-lost nodes.
    fn deliver_to_receiver(
        &self,
        inner: &mut Inner<T>,
        mut value: T,
        batch: &mut WakeBatch,
    ) -> Result<(), T> {
        loop {
            let Some(node) = Self::pop_waiter(&mut inner.recv_waiters, &self.has_recv_waiters)
            else {
                return Err(value);
            };
            let ticket = node.ticket();
            if node.state() != Notify::Waiting {
                continue;
            }
            if let WaiterKind::Select { group, index } = &node.kind {
                if !group.try_win(*index) {
                    node.cancel_if_waiting();
                    continue;
                }
            }
            node.put_data(value);
            if node.claim(ticket, Notify::Data) {
                node.wake(Side::Recv, batch);
                self.bump_gen();
                stats::bump(&STATS.handoffs);
                return Ok(());
            }
            match node.take_data() {
                Some(v) => value = v,
                None => return Ok(()),
            }
        }
    }

    /// Take a parked sender's value (the rendezvous handoff).
    fn take_from_sender(&self, inner: &mut Inner<T>, batch: &mut WakeBatch) -> Option<T> {
        loop {
            let node = Self::pop_waiter(&mut inner.send_waiters, &self.has_send_waiters)?;
            let ticket = node.ticket();
            if node.state() != Notify::Waiting {
                continue;
            }
            if let WaiterKind::Select { group, index } = &node.kind {
                if !group.try_win(*index) {
                    node.cancel_if_waiting();
                    continue;
                }
            }
            let Some(value) = node.take_data() else {
                node.cancel_if_waiting();
                continue;
            };
            if node.claim(ticket, Notify::Data) {
                node.wake(Side::Send, batch);
                self.bump_gen();
                stats::bump(&STATS.handoffs);
                return Some(value);
            }
            node.put_data(value);
        }
    }

    /// Move one parked sender's value into buffer space freed by a
    /// dequeue. Falls back to `Signal` (sender retries) if a lock-free
    /// producer stole the slot first.
    fn pull_sender_into_buffer(&self, inner: &mut Inner<T>, batch: &mut WakeBatch) {
        loop {
            let Some(node) = Self::pop_waiter(&mut inner.send_waiters, &self.has_send_waiters)
            else {
                return;
            };
            let ticket = node.ticket();
            if node.state() != Notify::Waiting {
                continue;
            }
            if let WaiterKind::Select { group, index } = &node.kind {
                if !group.try_win(*index) {
                    node.cancel_if_waiting();
                    continue;
                }
            }
            let Some(value) = node.take_data() else {
                node.cancel_if_waiting();
                continue;
            };
            match self.enqueue_locked(inner, value) {
                Ok(()) => {
                    node.claim(ticket, Notify::Data);
                    node.wake(Side::Send, batch);
                }
                Err(value) => {
                    node.put_data(value);
                    node.claim(ticket, Notify::Signal);
                    node.wake(Side::Send, batch);
                }
            }
            return;
        }
    }

    /// Pop one waiter and tell it to retry.
    fn signal_one(&self, inner: &mut Inner<T>, side: Side, batch: &mut WakeBatch) {
        loop {
            let (list, flag) = match side {
                Side::Send => (&mut inner.send_waiters, &self.has_send_waiters),
                Side::Recv => (&mut inner.recv_waiters, &self.has_recv_waiters),
            };
            let Some(node) = Self::pop_waiter(list, flag) else {
                return;
            };
            let ticket = node.ticket();
            if node.state() != Notify::Waiting {
                continue;
            }
            if let WaiterKind::Select { group, index } = &node.kind {
                if !group.try_win(*index) {
                    node.cancel_if_waiting();
                    continue;
                }
            }
            if node.claim(ticket, Notify::Signal) {
                node.wake(side, batch);
                self.bump_gen();
                return;
            }
        }
    }

    // ---- buffer plumbing (under `inner`) ----

    fn enqueue_locked(&self, inner: &mut Inner<T>, value: T) -> Result<(), T> {
        if self.cap == 0 {
            return Err(value);
        }
        let res = if let Some(ring) = &self.ring {
            ring.push(value)
        } else if inner.buf.len() < self.cap {
            inner.buf.push_back(value);
            Ok(())
        } else {
            Err(value)
        };
        if res.is_ok() {
            self.bump_gen();
        }
        res
    }

    /// Cancel-requeued items in `buf` drain before ring items.
    fn dequeue_locked(&self, inner: &mut Inner<T>) -> Option<T> {
        let v = inner
            .buf
            .pop_front()
            .or_else(|| self.ring.as_ref().and_then(MpmcRing::pop));
        if v.is_some() {
            self.bump_gen();
        }
        v
    }

    /// One full under-lock send attempt: handoff, then buffer, then the
    /// overflow mode.
    fn send_ready_locked(
        &self,
        inner: &mut Inner<T>,
        value: T,
        batch: &mut WakeBatch,
    ) -> SendReady<T> {
        let value = match self.deliver_to_receiver(inner, value, batch) {
            Ok(()) => return SendReady::Done,
            Err(v) => v,
        };
        match self.enqueue_locked(inner, value) {
            Ok(()) => {
                self.signal_one(inner, Side::Recv, batch);
                SendReady::Done
            }
            Err(value) => match self.mode {
                OverflowMode::DropOld => {
                    if let Some(old) = inner.buf.pop_front() {
                        self.destroy_item(old);
                    }
                    inner.buf.push_back(value);
                    self.bump_gen();
                    self.signal_one(inner, Side::Recv, batch);
                    SendReady::Done
                }
                OverflowMode::Block | OverflowMode::DropNew => SendReady::Full(value),
            },
        }
    }

    /// One full under-lock recv attempt: buffer, handoff, pool mint.
    fn recv_ready_locked(&self, inner: &mut Inner<T>, batch: &mut WakeBatch) -> Option<T> {
        if let Some(v) = self.dequeue_locked(inner) {
            if self.has_send_waiters.load(Ordering::SeqCst) {
                self.pull_sender_into_buffer(inner, batch);
            }
            return Some(v);
        }
        if let Some(v) = self.take_from_sender(inner, batch) {
            return Some(v);
        }
        if let Some(pool) = &self.pool {
            let minted = pool
                .created
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                    (c < pool.max).then_some(c + 1)
                })
                .is_ok();
            if minted {
                return Some((pool.hooks.create)());
            }
        }
        None
    }

    fn destroy_item(&self, value: T) {
        match self.pool.as_ref().and_then(|p| p.hooks.destroy.as_ref()) {
            Some(destroy) => destroy(value),
            None => drop(value),
        }
    }

    fn recv_would_succeed_locked(&self, inner: &Inner<T>) -> bool {
        if !inner.buf.is_empty() {
            return true;
        }
        if self.ring.as_ref().is_some_and(|r| !r.is_empty()) {
            return true;
        }
        if inner
            .send_waiters
            .iter()
            .any(|n| n.state() == Notify::Waiting)
        {
            return true;
        }
        self.pool
            .as_ref()
            .is_some_and(|p| p.created.load(Ordering::SeqCst) < p.max)
    }

    fn send_would_succeed_locked(&self, inner: &Inner<T>) -> bool {
        if inner
            .recv_waiters
            .iter()
            .any(|n| n.state() == Notify::Waiting)
        {
            return true;
        }
        if self.cap == 0 {
            return false;
        }
        if self.mode == OverflowMode::DropOld {
            return true;
        }
        let buffered = inner.buf.len() + self.ring.as_ref().map_or(0, MpmcRing::len);
        buffered < self.cap
    }

    // ---- fast paths ----

    fn fast_send(&self, value: T) -> Result<(), T> {
        if !self.branded() {
            return Err(value);
        }
        let Some(ring) = &self.ring else {
            return Err(value);
        };
        ring.begin_produce();
        if self.is_closed() {
            ring.end_produce();
            return Err(value);
        }
        let was_empty = ring.is_empty();
        let res = ring.push(value);
        ring.end_produce();
        if res.is_ok() {
            fence(Ordering::SeqCst);
            self.after_fast_send(was_empty);
            stats::bump(&STATS.sends_fast);
        }
        res
    }

    fn after_fast_send(&self, was_empty: bool) {
        if config().edge_wake && !was_empty {
            return;
        }
        if self.has_recv_waiters.load(Ordering::SeqCst) {
            let mut batch = WakeBatch::new();
            {
                let _depth = LockDepthGuard::enter();
                let mut inner = self.inner.lock();
                self.signal_one(&mut inner, Side::Recv, &mut batch);
            }
            self.finish(batch);
        }
    }

    fn fast_recv(&self) -> Option<T> {
        if !self.branded() {
            return None;
        }
        let v = self.ring.as_ref().and_then(MpmcRing::pop)?;
        fence(Ordering::SeqCst);
        if self.has_send_waiters.load(Ordering::SeqCst) {
            let mut batch = WakeBatch::new();
            {
                let _depth = LockDepthGuard::enter();
                let mut inner = self.inner.lock();
                self.signal_one(&mut inner, Side::Send, &mut batch);
            }
            self.finish(batch);
        }
        stats::bump(&STATS.recvs_fast);
        Some(v)
    }

    // ---- non-blocking operations ----

    pub(crate) fn try_send_impl(&self, mut value: T) -> Result<(), TrySendError<T>> {
        self.apply_reset(&mut value);
        match self.fast_send(value) {
            Ok(()) => return Ok(()),
            Err(v) => value = v,
        }
        let mut batch = WakeBatch::new();
        let outcome;
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if let Some(code) = self.send_closed_code() {
                return Err(TrySendError::Closed { value, code });
            }
            outcome = self.send_ready_locked(&mut inner, value, &mut batch);
        }
        self.finish(batch);
        match outcome {
            SendReady::Done => {
                stats::bump(&STATS.sends_slow);
                Ok(())
            }
            SendReady::Full(v) => Err(TrySendError::Full(v)),
        }
    }

    pub(crate) fn try_recv_impl(&self) -> Result<T, TryRecvError> {
        if let Some(v) = self.fast_recv() {
            return Ok(v);
        }
        let mut spins = 0;
        loop {
            let mut batch = WakeBatch::new();
            let got = {
                let _depth = LockDepthGuard::enter();
                let mut inner = self.inner.lock();
                self.recv_ready_locked(&mut inner, &mut batch)
            };
            self.finish(batch);
            if let Some(v) = got {
                stats::bump(&STATS.recvs_slow);
                return Ok(v);
            }
            if !self.is_closed() {
                return Err(TryRecvError::Empty);
            }
            // Closed: wait out producers that already committed.
            let inflight = self
                .ring
                .as_ref()
                .is_some_and(|r| r.producers_inflight() > 0);
            if !inflight || spins >= TRY_DRAIN_SPINS {
                return Err(TryRecvError::Closed {
                    code: self.tx_code(),
                });
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }

    // ---- blocking operations ----

    pub(crate) fn send_blocking(
        &self,
        mut value: T,
        limit: &WaitLimit,
    ) -> Result<(), SendError<T>> {
        let started = config().channel_timing.then(Instant::now);
        self.apply_reset(&mut value);
        match self.fast_send(value) {
            Ok(()) => {
                self.record_timing(started, &STATS.send_nanos);
                return Ok(());
            }
            Err(v) => value = v,
        }

        let mut node: Option<Arc<WaitNode<T>>> = None;
        loop {
            if limit.cancelled() {
                return Err(SendError::Cancelled(value));
            }
            let mut batch = WakeBatch::new();
            let resolved = {
                let _depth = LockDepthGuard::enter();
                let mut inner = self.inner.lock();
                if let Some(code) = self.send_closed_code() {
                    return Err(SendError::Closed { value, code });
                }
                match self.send_ready_locked(&mut inner, value, &mut batch) {
                    SendReady::Done => Ok(()),
                    SendReady::Full(v) if self.mode == OverflowMode::DropNew => {
                        return Err(SendError::Full(v));
                    }
                    SendReady::Full(v) => {
                        if limit.expired() {
                            return Err(SendError::TimedOut(v));
                        }
                        self.park_send(&mut inner, &mut node, v, limit)
                    }
                }
            };
            self.finish(batch);
            match resolved {
                Ok(()) => {
                    stats::bump(&STATS.sends_slow);
                    self.record_timing(started, &STATS.send_nanos);
                    return Ok(());
                }
                Err(ParkOutcome::Retry(v)) => value = v,
                Err(ParkOutcome::TimedOut(v)) => {
                    return Err(if limit.cancelled() {
                        SendError::Cancelled(v)
                    } else {
                        SendError::TimedOut(v)
                    });
                }
            }
        }
    }

    /// Publish a send wait node and sleep on the condvar. Runs with the
    /// channel mutex held; returns with it held.
    fn park_send(
        &self,
        inner: &mut MutexGuard<'_, Inner<T>>,
        slot: &mut Option<Arc<WaitNode<T>>>,
        value: T,
        limit: &WaitLimit,
    ) -> Result<(), ParkOutcome<T>> {
        let node = slot.take().unwrap_or_else(|| WaitNode::new_thread(None));
        node.put_data(value);
        node.arm(self.next_ticket());
        self.push_waiter(inner, Side::Send, node.clone());
        fence(Ordering::SeqCst);

        // Publish/park race: a lock-free consumer may have freed a slot
        // before it saw our flag. Retry the buffer once after publishing.
        if self.ring.is_some() {
            if let Some(v) = node.take_data() {
                match self.enqueue_locked(inner, v) {
                    Ok(()) => {
                        self.unlink_locked(inner, &node, Side::Send);
                        node.cancel_if_waiting();
                        *slot = Some(node);
                        return Ok(());
                    }
                    Err(v) => node.put_data(v),
                }
            }
        }

        crate::sched::blocked_enter();
        let mut expired = false;
        while node.state() == Notify::Waiting {
            match limit.wait_target() {
                Some(t) => {
                    self.send_cv.wait_until(inner, t);
                }
                None => self.send_cv.wait(inner),
            }
            if limit.cancelled() || limit.expired() {
                expired = true;
                break;
            }
        }
        crate::sched::blocked_exit();

        match node.state() {
            Notify::Data => {
                *slot = Some(node);
                Ok(())
            }
            Notify::Waiting => {
                debug_assert!(expired);
                self.unlink_locked(inner, &node, Side::Send);
                node.cancel_if_waiting();
                let v = node
                    .take_data()
                    .expect("parked send node retains its value");
                Err(ParkOutcome::TimedOut(v))
            }
            Notify::Signal | Notify::Woken | Notify::Close | Notify::Cancel => {
                self.unlink_locked(inner, &node, Side::Send);
                let v = node
                    .take_data()
                    .expect("unresolved send node retains its value");
                *slot = Some(node);
                Err(ParkOutcome::Retry(v))
            }
        }
    }

    pub(crate) fn recv_blocking(&self, limit: &WaitLimit) -> Result<T, RecvError> {
        let started = config().channel_timing.then(Instant::now);
        if let Some(v) = self.fast_recv() {
            self.record_timing(started, &STATS.recv_nanos);
            return Ok(v);
        }
        if config().nursery_guard {
            if let (Some(owner), Some(current)) = (self.autoclose_owner, nursery::current()) {
                if owner == current {
                    return Err(RecvError::Deadlock);
                }
            }
        }

        let mut node: Option<Arc<WaitNode<T>>> = None;
        loop {
            if limit.cancelled() {
                return Err(RecvError::Cancelled);
            }
            let mut batch = WakeBatch::new();
            let resolved = {
                let _depth = LockDepthGuard::enter();
                let mut inner = self.inner.lock();
                if let Some(v) = self.recv_ready_locked(&mut inner, &mut batch) {
                    Ok(v)
                } else if self.is_closed() {
                    let draining = self
                        .ring
                        .as_ref()
                        .is_some_and(|r| r.producers_inflight() > 0);
                    if draining {
                        Err(ParkOutcome::Retry(()))
                    } else {
                        return Err(RecvError::Closed {
                            code: self.tx_code(),
                        });
                    }
                } else if limit.expired() {
                    return Err(RecvError::TimedOut);
                } else {
                    self.park_recv(&mut inner, &mut node, limit)
                }
            };
            self.finish(batch);
            match resolved {
                Ok(v) => {
                    stats::bump(&STATS.recvs_slow);
                    self.record_timing(started, &STATS.recv_nanos);
                    return Ok(v);
                }
                Err(ParkOutcome::Retry(())) => std::thread::yield_now(),
                Err(ParkOutcome::TimedOut(())) => {
                    return Err(if limit.cancelled() {
                        RecvError::Cancelled
                    } else {
                        RecvError::TimedOut
                    });
                }
            }
        }
    }

    fn park_recv(
        &self,
        inner: &mut MutexGuard<'_, Inner<T>>,
        slot: &mut Option<Arc<WaitNode<T>>>,
        limit: &WaitLimit,
    ) -> Result<T, ParkOutcome<()>> {
        let node = slot.take().unwrap_or_else(|| WaitNode::new_thread(None));
        node.arm(self.next_ticket());
        self.push_waiter(inner, Side::Recv, node.clone());
        fence(Ordering::SeqCst);

        // Publish/park race against lock-free producers.
        if let Some(v) = self.dequeue_locked(inner) {
            self.unlink_locked(inner, &node, Side::Recv);
            node.cancel_if_waiting();
            *slot = Some(node);
            return Ok(v);
        }

        crate::sched::blocked_enter();
        while node.state() == Notify::Waiting {
            match limit.wait_target() {
                Some(t) => {
                    self.recv_cv.wait_until(inner, t);
                }
                None => self.recv_cv.wait(inner),
            }
            if limit.cancelled() || limit.expired() {
                break;
            }
        }
        crate::sched::blocked_exit();

        match node.state() {
            Notify::Data => {
                let v = node
                    .take_data()
                    .expect("handoff filled the recv node");
                *slot = Some(node);
                Ok(v)
            }
            Notify::Waiting => {
                self.unlink_locked(inner, &node, Side::Recv);
                node.cancel_if_waiting();
                Err(ParkOutcome::TimedOut(()))
            }
            Notify::Signal | Notify::Woken | Notify::Close | Notify::Cancel => {
                self.unlink_locked(inner, &node, Side::Recv);
                *slot = Some(node);
                Err(ParkOutcome::Retry(()))
            }
        }
    }

    fn record_timing(&self, started: Option<Instant>, counter: &AtomicU64) {
        if let Some(t) = started {
            stats::add_nanos(counter, t.elapsed().as_nanos() as u64);
        }
    }

    // ---- fiber (poll-based) operations ----

    /// First poll of an async send: fast path, then one slow attempt,
    /// then publish a fiber wait node.
    pub(crate) fn send_poll(&self, mut value: T, waker: &Waker) -> SendPoll<T> {
        self.apply_reset(&mut value);
        match self.fast_send(value) {
            Ok(()) => return SendPoll::Sent,
            Err(v) => value = v,
        }
        let mut batch = WakeBatch::new();
        let result;
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if let Some(code) = self.send_closed_code() {
                return SendPoll::Closed { value, code };
            }
            result = match self.send_ready_locked(&mut inner, value, &mut batch) {
                SendReady::Done => SendPoll::Sent,
                SendReady::Full(v) if self.mode == OverflowMode::DropNew => SendPoll::Full(v),
                SendReady::Full(v) => {
                    let node = WaitNode::new_fiber(Some(v), waker.clone());
                    node.arm(self.next_ticket());
                    self.push_waiter(&mut inner, Side::Send, node.clone());
                    fence(Ordering::SeqCst);
                    if self.ring.is_some() {
                        if let Some(v2) = node.take_data() {
                            match self.enqueue_locked(&mut inner, v2) {
                                Ok(()) => {
                                    self.unlink_locked(&mut inner, &node, Side::Send);
                                    node.cancel_if_waiting();
                                    SendPoll::Sent
                                }
                                Err(v2) => {
                                    node.put_data(v2);
                                    SendPoll::Parked(node)
                                }
                            }
                        } else {
                            SendPoll::Parked(node)
                        }
                    } else {
                        SendPoll::Parked(node)
                    }
                }
            };
        }
        self.finish(batch);
        if matches!(result, SendPoll::Sent) {
            stats::bump(&STATS.sends_slow);
        }
        result
    }

    /// Re-poll of a parked async send.
    pub(crate) fn send_resolve(&self, node: &Arc<WaitNode<T>>, waker: &Waker) -> SendResolve<T> {
        match node.state() {
            Notify::Data => SendResolve::Done,
            Notify::Waiting => {
                node.store_waker(waker);
                // The wake may have landed between the state check and the
                // waker store.
                if node.state() == Notify::Data {
                    SendResolve::Done
                } else {
                    SendResolve::Pending
                }
            }
            _ => {
                let mut inner = self.inner.lock();
                self.unlink_locked(&mut inner, node, Side::Send);
                drop(inner);
                match node.take_data() {
                    Some(v) => SendResolve::Retry(v),
                    None => SendResolve::Done,
                }
            }
        }
    }

    pub(crate) fn recv_poll(&self, waker: &Waker) -> RecvPoll<T> {
        if let Some(v) = self.fast_recv() {
            return RecvPoll::Got(v);
        }
        let mut batch = WakeBatch::new();
        let result;
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if let Some(v) = self.recv_ready_locked(&mut inner, &mut batch) {
                result = RecvPoll::Got(v);
            } else if self.is_closed() {
                let draining = self
                    .ring
                    .as_ref()
                    .is_some_and(|r| r.producers_inflight() > 0);
                result = if draining {
                    RecvPoll::Draining
                } else {
                    RecvPoll::Closed {
                        code: self.tx_code(),
                    }
                };
            } else {
                let node = WaitNode::new_fiber(None, waker.clone());
                node.arm(self.next_ticket());
                self.push_waiter(&mut inner, Side::Recv, node.clone());
                fence(Ordering::SeqCst);
                result = match self.dequeue_locked(&mut inner) {
                    Some(v) => {
                        self.unlink_locked(&mut inner, &node, Side::Recv);
                        node.cancel_if_waiting();
                        RecvPoll::Got(v)
                    }
                    None => RecvPoll::Parked(node),
                };
            }
        }
        self.finish(batch);
        if matches!(result, RecvPoll::Got(_)) {
            stats::bump(&STATS.recvs_slow);
        }
        result
    }

    pub(crate) fn recv_resolve(&self, node: &Arc<WaitNode<T>>, waker: &Waker) -> RecvResolve<T> {
        match node.state() {
            Notify::Data => match node.take_data() {
                Some(v) => RecvResolve::Got(v),
                None => RecvResolve::Retry,
            },
            Notify::Waiting => {
                node.store_waker(waker);
                if node.state() == Notify::Data {
                    match node.take_data() {
                        Some(v) => RecvResolve::Got(v),
                        None => RecvResolve::Retry,
                    }
                } else {
                    RecvResolve::Pending
                }
            }
            _ => {
                let mut inner = self.inner.lock();
                self.unlink_locked(&mut inner, node, Side::Recv);
                drop(inner);
                RecvResolve::Retry
            }
        }
    }

    /// Cancel a parked async operation. A send whose value was already
    /// taken counts as delivered; a recv that was already filled requeues
    /// the value at the front so nothing is lost.
    pub(crate) fn abandon_waiter(&self, node: &Arc<WaitNode<T>>, side: Side) {
        let mut batch = WakeBatch::new();
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            self.unlink_locked(&mut inner, node, side);
            node.cancel_if_waiting();
            if side == Side::Recv && node.state() == Notify::Data {
                if let Some(v) = node.take_data() {
                    inner.buf.push_front(v);
                    self.bump_gen();
                    self.signal_one(&mut inner, Side::Recv, &mut batch);
                }
            }
        }
        self.finish(batch);
    }

    /// Put a value back at the head of the buffer (cancelled recv that
    /// had already been handed data).
    pub(crate) fn requeue_front(&self, value: T) {
        let mut batch = WakeBatch::new();
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            inner.buf.push_front(value);
            self.bump_gen();
            self.signal_one(&mut inner, Side::Recv, &mut batch);
            batch.notify_cv(Side::Recv);
        }
        self.finish(batch);
    }

    // ---- select support ----

    /// Link a select node unless the case is already completable. Returns
    /// true when the node was linked and the caller may park on it.
    /// When the case is ready, the group is claimed (if still open) and
    /// the owner resolves without parking.
    pub(crate) fn link_select_waiter(&self, node: &Arc<WaitNode<T>>, side: Side) -> bool {
        let mut batch = WakeBatch::new();
        let linked;
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if self.select_case_ready_locked(&inner, side) {
                self.self_claim(node);
                linked = false;
            } else {
                self.push_waiter(&mut inner, side, node.clone());
                fence(Ordering::SeqCst);
                if self.select_case_ready_locked(&inner, side) {
                    self.unlink_locked(&mut inner, node, side);
                    self.self_claim(node);
                    linked = false;
                } else {
                    linked = true;
                }
            }
        }
        self.finish(batch);
        linked
    }

    fn select_case_ready_locked(&self, inner: &Inner<T>, side: Side) -> bool {
        if self.is_closed() {
            return true;
        }
        match side {
            Side::Recv => self.recv_would_succeed_locked(inner),
            Side::Send => self.rx_is_closed() || self.send_would_succeed_locked(inner),
        }
    }

    /// Owner-side claim: mark our own node `Signal` so the resolve step
    /// retries the case, if no sibling already won the cycle.
    fn self_claim(&self, node: &Arc<WaitNode<T>>) {
        if let WaiterKind::Select { group, index } = &node.kind {
            if group.try_win(*index) {
                node.claim(node.ticket(), Notify::Signal);
            }
        }
    }

    pub(crate) fn unlink_waiter(&self, node: &Arc<WaitNode<T>>, side: Side) {
        let _depth = LockDepthGuard::enter();
        let mut inner = self.inner.lock();
        self.unlink_locked(&mut inner, node, side);
    }

    /// Wake one parked sender so it can hand off to a freshly linked
    /// select receiver.
    pub(crate) fn kick_one_sender(&self) {
        if !self.has_send_waiters.load(Ordering::SeqCst) {
            return;
        }
        let mut batch = WakeBatch::new();
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            self.signal_one(&mut inner, Side::Send, &mut batch);
        }
        self.finish(batch);
    }

    // ---- close ----

    pub(crate) fn close_tx(&self, code: Option<u32>) {
        let mut batch = WakeBatch::new();
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if self.is_closed() {
                return;
            }
            if let Some(c) = code {
                self.tx_code.store(c + 1, Ordering::SeqCst);
            }
            self.closed.store(true, Ordering::SeqCst);
            self.fast_path_ok.store(false, Ordering::SeqCst);
            self.bump_gen();
            stats::bump(&STATS.closes);
            if config().chan_debug_verbose {
                log::trace!(
                    "chan: closed (code {code:?}), waking {} senders / {} receivers",
                    inner.send_waiters.len(),
                    inner.recv_waiters.len()
                );
            }
            self.wake_all_locked(&mut inner.send_waiters, &self.has_send_waiters, Side::Send, code, &mut batch);
            self.wake_all_locked(&mut inner.recv_waiters, &self.has_recv_waiters, Side::Recv, code, &mut batch);
            batch.notify_cv(Side::Send);
            batch.notify_cv(Side::Recv);
        }
        self.finish(batch);
    }

    pub(crate) fn close_rx(&self, code: Option<u32>) {
        let mut batch = WakeBatch::new();
        {
            let _depth = LockDepthGuard::enter();
            let mut inner = self.inner.lock();
            if self.rx_is_closed() {
                return;
            }
            if let Some(c) = code {
                self.rx_code.store(c + 1, Ordering::SeqCst);
            }
            self.rx_closed.store(true, Ordering::SeqCst);
            self.fast_path_ok.store(false, Ordering::SeqCst);
            self.bump_gen();
            stats::bump(&STATS.closes);
            // Only senders care: receivers may still drain the buffer.
            self.wake_all_locked(&mut inner.send_waiters, &self.has_send_waiters, Side::Send, code, &mut batch);
            batch.notify_cv(Side::Send);
        }
        self.finish(batch);
    }

    fn wake_all_locked(
        &self,
        list: &mut VecDeque<Arc<WaitNode<T>>>,
        flag: &AtomicBool,
        side: Side,
        code: Option<u32>,
        batch: &mut WakeBatch,
    ) {
        while let Some(node) = Self::pop_waiter(list, flag) {
            let ticket = node.ticket();
            match &node.kind {
                WaiterKind::Select { group, index } => {
                    if node.state() != Notify::Waiting {
                        continue;
                    }
                    if group.try_win(*index) {
                        node.record_close_code(code);
                        if node.claim(ticket, Notify::Close) {
                            node.wake(side, batch);
                        }
                    } else {
                        node.cancel_if_waiting();
                    }
                }
                _ => {
                    if node.claim(ticket, Notify::Woken) {
                        node.wake(side, batch);
                    }
                }
            }
        }
        flag.store(false, Ordering::SeqCst);
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        let has_destroy = self
            .pool
            .as_ref()
            .is_some_and(|p| p.hooks.destroy.is_some());
        if !has_destroy {
            return;
        }
        let inner = self.inner.get_mut();
        let drained: Vec<T> = inner.buf.drain(..).collect();
        for v in drained {
            self.destroy_item(v);
        }
        while let Some(v) = self.ring.as_ref().and_then(MpmcRing::pop) {
            self.destroy_item(v);
        }
    }
}

/// First-poll outcome of an async send.
pub(crate) enum SendPoll<T> {
    Sent,
    Closed { value: T, code: Option<u32> },
    Full(T),
    Parked(Arc<WaitNode<T>>),
}

/// Re-poll outcome of a parked async send.
pub(crate) enum SendResolve<T> {
    Done,
    Pending,
    Retry(T),
}

/// First-poll outcome of an async recv.
pub(crate) enum RecvPoll<T> {
    Got(T),
    Closed { code: Option<u32> },
    /// Closed but producers are still committing; re-poll shortly.
    Draining,
    Parked(Arc<WaitNode<T>>),
}

/// Re-poll outcome of a parked async recv.
pub(crate) enum RecvResolve<T> {
    Got(T),
    Pending,
    Retry,
}

/// How a park round ended when it did not complete the operation.
enum ParkOutcome<T> {
    /// Woken to retry (signal, generic wake, closure observed by the loop).
    Retry(T),
    TimedOut(T),
}
