// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber representation and lifecycle.
//!
//! A fiber is a type-erased future plus an atomic state machine driven by
//! worker threads. The waker/poll CAS protocol absorbs wakes that race
//! against park commit: a wake landing while the fiber is still `Running`
//! flips it to `Ready`, which makes the worker's `Running → Waiting` CAS
//! fail, and the worker re-enqueues instead of losing the wakeup.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::worker::SchedShared;

/// Fiber lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Queued, waiting to be polled.
    Ready = 0,
    /// Being polled by a worker right now.
    Running = 1,
    /// Parked behind a wait node, timer, or join.
    Waiting = 2,
    /// Finished; result (or panic) recorded.
    Complete = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Complete,
        }
    }
}

/// Error returned by `join`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("fiber panicked: {0}")]
    Panicked(String),
    #[error("fiber was cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a handle and its fiber.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
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

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct TaskHeader {
    pub state: AtomicU8,
    pub cancel: Arc<CancelToken>,
    /// Completion signal for OS-thread joiners.
    pub complete: (Mutex<bool>, Condvar),
    /// Wakers of fibers parked in `join_async`.
    pub join_wakers: Mutex<Vec<Waker>>,
    /// Panic payload text, when the fiber unwound.
    pub panic_msg: Mutex<Option<String>>,
    pub sched: Arc<SchedShared>,
}

/// The scheduler-owned fiber object.
pub(crate) struct RawTask {
    pub header: TaskHeader,
    future: Mutex<Option<BoxFuture>>,
}

impl std::fmt::Debug for RawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask").field("state", &self.state()).finish()
    }
}

impl RawTask {
    pub fn new(future: BoxFuture, cancel: Arc<CancelToken>, sched: Arc<SchedShared>) -> Arc<Self> {
        Arc::new(Self {
            header: TaskHeader {
                state: AtomicU8::new(TaskState::Ready as u8),
                cancel,
                complete: (Mutex::new(false), Condvar::new()),
                join_wakers: Mutex::new(Vec::new()),
                panic_msg: Mutex::new(None),
                sched,
            },
            future: Mutex::new(Some(future)),
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.header.state.load(Ordering::Acquire))
    }

    pub fn set_running(&self) {
        self.header
            .state
            .store(TaskState::Running as u8, Ordering::Release);
    }

    /// `Running → Waiting`; fails when a wake already landed.
    pub fn commit_park(&self) -> bool {
        self.header
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Waiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark complete and release every joiner.
    pub fn mark_complete(&self) {
        self.header
            .state
            .store(TaskState::Complete as u8, Ordering::Release);

        {
            let (lock, cvar) = &self.header.complete;
            let mut done = lock.lock();
            *done = true;
            cvar.notify_all();
        }

        let wakers: Vec<Waker> = self.header.join_wakers.lock().drain(..).collect();
        for w in wakers {
            w.wake();
        }
    }

    /// Register a join waker; wakes immediately if already complete.
    pub fn register_join_waker(&self, waker: Waker) {
        if self.state() == TaskState::Complete {
            waker.wake();
            return;
        }
        self.header.join_wakers.lock().push(waker);
        if self.state() == TaskState::Complete {
            let wakers: Vec<Waker> = self.header.join_wakers.lock().drain(..).collect();
            for w in wakers {
                w.wake();
            }
        }
    }

    /// Poll the future once; true when the fiber finished (or unwound).
    pub fn poll(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(fut) = slot.as_mut() else {
            return true;
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                *slot = None;
                true
            }
            Ok(Poll::Pending) => false,
            Err(payload) => {
                *slot = None;
                *self.header.panic_msg.lock() = Some(panic_text(payload));
                true
            }
        }
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Waker that re-enqueues the fiber through the scheduler.
struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            let state = TaskState::from_u8(self.task.header.state.load(Ordering::Acquire));
            match state {
                TaskState::Waiting => {
                    if self
                        .task
                        .header
                        .state
                        .compare_exchange(
                            TaskState::Waiting as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    let sched = self.task.header.sched.clone();
                    sched.note_unparked();
                    sched.schedule(self.task.clone());
                    return;
                }
                TaskState::Running => {
                    // Wake during poll: flip to Ready so the worker's park
                    // commit fails and it re-enqueues. Nothing else to do.
                    if self
                        .task
                        .header
                        .state
                        .compare_exchange(
                            TaskState::Running as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return;
                }
                TaskState::Ready | TaskState::Complete => return,
            }
        }
    }
}

/// Typed result slot shared between the fiber body and its handle.
pub(crate) struct ResultSlot<T> {
    inner: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.lock() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

/// Handle to a spawned fiber.
///
/// Dropping the handle detaches the fiber; the runtime still tracks and
/// completes it.
pub struct JoinHandle<T> {
    pub(crate) raw: Arc<RawTask>,
    pub(crate) result: Arc<ResultSlot<T>>,
    pub(crate) cancel: Arc<CancelToken>,
}

impl<T> JoinHandle<T> {
    /// Block the calling OS thread until the fiber completes.
    ///
    /// Inside a fiber, use [`JoinHandle::join_async`] instead so the
    /// worker thread stays available.
    pub fn join(self) -> Result<T, JoinError> {
        crate::sched::blocked_enter();
        {
            let (lock, cvar) = &self.raw.header.complete;
            let mut done = lock.lock();
            while !*done {
                cvar.wait_for(&mut done, Duration::from_millis(50));
            }
        }
        crate::sched::blocked_exit();
        self.take_result()
    }

    /// Non-blocking completion probe.
    pub fn is_complete(&self) -> bool {
        self.raw.state() == TaskState::Complete
    }

    /// Take the result if the fiber already completed.
    pub fn try_result(&self) -> Option<Result<T, JoinError>> {
        self.is_complete().then(|| self.take_result_ref())
    }

    /// Request cooperative cancellation; the fiber observes it at its
    /// next check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fire-and-forget.
    pub fn detach(self) {}

    /// Join from inside a fiber without blocking the worker.
    pub fn join_async(self) -> JoinFuture<T> {
        JoinFuture { handle: self }
    }

    fn take_result(&self) -> Result<T, JoinError> {
        self.take_result_ref()
    }

    fn take_result_ref(&self) -> Result<T, JoinError> {
        if let Some(v) = self.result.take() {
            return Ok(v);
        }
        if let Some(msg) = self.raw.header.panic_msg.lock().take() {
            return Err(JoinError::Panicked(msg));
        }
        if self.cancel.is_cancelled() {
            return Err(JoinError::Cancelled);
        }
        Err(JoinError::Panicked(
            "fiber completed without producing a result".to_string(),
        ))
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("state", &self.raw.state())
            .finish()
    }
}

/// Future resolving when the joined fiber completes.
pub struct JoinFuture<T> {
    handle: JoinHandle<T>,
}

impl<T> Unpin for JoinFuture<T> {}

impl<T> Future for JoinFuture<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &*self;
        if this.handle.is_complete() {
            return Poll::Ready(this.handle.take_result_ref());
        }
        this.handle.raw.register_join_waker(cx.waker().clone());
        Poll::Pending
    }
}
