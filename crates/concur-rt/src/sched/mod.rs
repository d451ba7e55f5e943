// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! M:N fiber scheduler.
//!
//! Worker threads host cooperatively scheduled fibers; fibers suspend
//! only at channel operations, joins, sleeps, and explicit yields.
//! A `Runtime` owns its workers and watchdog; most programs use the
//! process-wide singleton via [`runtime`]/[`spawn`] and shut it down at
//! exit with [`shutdown`].
//!
//! Components:
//! - `task`     — fiber state machine, waker, join handles
//! - `queue`    — per-worker inboxes (local deques/injector come from
//!   crossbeam-deque)
//! - `worker`   — worker loop, stealing, idle policy, spawn placement
//! - `parker`   — sleep/wake primitive
//! - `watchdog` — stall scaling and deadlock detection
//! - `timer`    — sleep and deadline wakeups

pub(crate) mod parker;
pub(crate) mod queue;
pub(crate) mod task;
pub(crate) mod watchdog;
pub(crate) mod worker;

pub mod timer;

pub use task::{CancelToken, JoinError, JoinFuture, JoinHandle};
pub use timer::{sleep, SleepFuture};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use task::{RawTask, ResultSlot};
use worker::SchedShared;

use crate::config::config;
use crate::stats::{self, STATS};

/// Threads currently blocked inside a channel wait (workers or not).
/// Feeds the deadlock detector alongside the scheduler's own counters.
static BLOCKED_THREADS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn blocked_enter() {
    BLOCKED_THREADS.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn blocked_exit() {
    BLOCKED_THREADS.fetch_sub(1, Ordering::AcqRel);
}

pub(crate) fn blocked_threads() -> usize {
    BLOCKED_THREADS.load(Ordering::Acquire)
}

/// A fiber scheduler instance: worker threads plus watchdog.
pub struct Runtime {
    shared: Arc<SchedShared>,
    threads: parking_lot::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Start `n` workers (0 = `CC_WORKERS`, else available parallelism).
    pub fn new(n: usize) -> Self {
        let worker_count = resolve_worker_count(n);
        let (shared, locals) = SchedShared::new(worker_count);

        let mut threads = Vec::with_capacity(worker_count + 1);
        for (id, local) in locals.into_iter().enumerate() {
            threads.push(worker::start_worker(shared.clone(), id, Some(local)));
        }
        threads.push(watchdog::start_watchdog(shared.clone()));

        log::debug!("scheduler started with {worker_count} workers");
        Self {
            shared,
            threads: parking_lot::Mutex::new(threads),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.base_workers
    }

    /// Spawn a fiber on this scheduler.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let started = config().spawn_timing.then(Instant::now);
        let cancel = Arc::new(CancelToken::new());
        let result = Arc::new(ResultSlot::new());

        let result_ref = result.clone();
        let cancel_ref = cancel.clone();
        let wrapped = async move {
            if cancel_ref.is_cancelled() {
                return;
            }
            result_ref.set(fut.await);
        };

        let raw = RawTask::new(Box::pin(wrapped), cancel.clone(), self.shared.clone());
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        stats::bump(&STATS.spawns);
        self.shared.schedule(raw.clone());
        if let Some(t) = started {
            stats::add_nanos(&STATS.spawn_nanos, t.elapsed().as_nanos() as u64);
        }

        JoinHandle {
            raw,
            result,
            cancel,
        }
    }

    /// Wait for every live fiber, then stop workers and watchdog.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &self.shared.all_done;
            let mut done = lock.lock();
            while self.shared.pending.load(Ordering::Acquire) > 0 {
                cvar.wait_for(&mut done, Duration::from_millis(50));
            }
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.parker.wake_all();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        stats::dump();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

fn resolve_worker_count(n: usize) -> usize {
    if n > 0 {
        return n;
    }
    let cfg = config();
    if cfg.workers > 0 {
        return cfg.workers;
    }
    thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();
static WORKER_OVERRIDE: AtomicUsize = AtomicUsize::new(0);

/// Configure the worker count of the not-yet-started global runtime.
pub fn set_num_workers(n: usize) {
    if GLOBAL.get().is_some() {
        log::warn!("set_num_workers({n}) after the runtime started has no effect");
    }
    WORKER_OVERRIDE.store(n, Ordering::Release);
}

pub fn get_num_workers() -> usize {
    match GLOBAL.get() {
        Some(rt) => rt.worker_count(),
        None => resolve_worker_count(WORKER_OVERRIDE.load(Ordering::Acquire)),
    }
}

/// The process-wide scheduler, started on first use.
pub fn runtime() -> &'static Runtime {
    GLOBAL.get_or_init(|| Runtime::new(WORKER_OVERRIDE.load(Ordering::Acquire)))
}

/// Start the global runtime's workers eagerly.
pub fn prewarm() {
    let _ = runtime();
}

/// Wait out and stop the global runtime. Call once, at process exit;
/// fibers spawned afterwards will never run.
pub fn shutdown() {
    if let Some(rt) = GLOBAL.get() {
        rt.shutdown();
    }
}

/// Spawn a fiber on the global runtime.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().spawn(fut)
}

/// Yield the calling fiber to the back of the global queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        stats::bump(&STATS.yields);
        // Waking mid-poll routes the fiber through the worker's
        // absorbed-wake path, which re-enqueues on the global queue.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn spawn_and_join() {
        let rt = Runtime::new(2);
        let h = rt.spawn(async { 41 + 1 });
        assert_eq!(h.join().unwrap(), 42);
        rt.shutdown();
    }

    #[test]
    fn spawn_many() {
        let rt = Runtime::new(4);
        let counter = Arc::new(AtomicI32::new(0));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let c = counter.clone();
                rt.spawn(async move {
                    c.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        rt.shutdown();
    }

    #[test]
    fn panic_is_reported() {
        let rt = Runtime::new(2);
        let h = rt.spawn(async { panic!("boom") });
        match h.join() {
            Err(JoinError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {other:?}"),
        }
        rt.shutdown();
    }

    #[test]
    fn detach_still_runs() {
        let rt = Runtime::new(2);
        let flag = Arc::new(AtomicI32::new(0));
        let f = flag.clone();
        rt.spawn(async move {
            f.store(1, Ordering::Release);
        })
        .detach();
        rt.shutdown();
        assert_eq!(flag.load(Ordering::Acquire), 1);
    }

    #[test]
    fn cancel_before_start() {
        let rt = Runtime::new(1);
        // Occupy the only worker so the victim cannot start first.
        let gate = Arc::new(AtomicI32::new(0));
        let g = gate.clone();
        let blocker = rt.spawn(async move {
            while g.load(Ordering::Acquire) == 0 {
                crate::sched::yield_now().await;
            }
        });
        let victim = rt.spawn(async { 5 });
        victim.cancel();
        gate.store(1, Ordering::Release);
        blocker.join().unwrap();
        match victim.join() {
            Ok(5) | Err(JoinError::Cancelled) => {}
            other => panic!("unexpected join result {other:?}"),
        }
        rt.shutdown();
    }

    #[test]
    fn yield_rotates() {
        let rt = Runtime::new(1);
        let h = rt.spawn(async {
            for _ in 0..10 {
                yield_now().await;
            }
            7
        });
        assert_eq!(h.join().unwrap(), 7);
        rt.shutdown();
    }

    #[test]
    fn sleep_suspends_fiber() {
        let rt = Runtime::new(1);
        let started = Instant::now();
        let h = rt.spawn(async {
            sleep(Duration::from_millis(30)).await;
        });
        h.join().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));
        rt.shutdown();
    }

    #[test]
    fn join_async_from_fiber() {
        let rt = Runtime::new(2);
        let inner = rt.spawn(async { 10 });
        let outer = rt.spawn(async move { inner.join_async().await.unwrap() + 1 });
        assert_eq!(outer.join().unwrap(), 11);
        rt.shutdown();
    }
}
