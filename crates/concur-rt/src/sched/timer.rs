// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer driver: fiber sleep and deadline wakeups.
//!
//! One lazily-started thread owns a min-heap of pending wakeups and
//! sleeps until the earliest one is due. Entries are cancel-flagged
//! rather than removed; a fired-but-cancelled entry is a no-op wake.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Entry {
    at: Instant,
    seq: u64,
    waker: Waker,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct TimerShared {
    heap: Mutex<(BinaryHeap<Reverse<Entry>>, u64)>,
    cv: Condvar,
}

static DRIVER: OnceLock<Arc<TimerShared>> = OnceLock::new();

/// Wakeups not yet fired. Lets the deadlock detector distinguish "parked
/// until a timer" from "parked forever".
pub(crate) fn pending_timers() -> usize {
    DRIVER.get().map_or(0, |d| d.heap.lock().0.len())
}

fn driver() -> &'static Arc<TimerShared> {
    DRIVER.get_or_init(|| {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new((BinaryHeap::new(), 0)),
            cv: Condvar::new(),
        });
        let for_thread = shared.clone();
        std::thread::Builder::new()
            .name("concur-timer".to_string())
            .spawn(move || timer_loop(&for_thread))
            .expect("failed to spawn timer thread");
        shared
    })
}

fn timer_loop(shared: &TimerShared) {
    let mut due: Vec<Entry> = Vec::new();
    loop {
        {
            let mut guard = shared.heap.lock();
            loop {
                let now = Instant::now();
                let next_at = guard.0.peek().map(|Reverse(e)| e.at);
                match next_at {
                    Some(at) if at <= now => {
                        let Reverse(e) = guard.0.pop().expect("peeked entry");
                        due.push(e);
                    }
                    Some(at) => {
                        if due.is_empty() {
                            shared.cv.wait_until(&mut guard, at);
                        }
                        break;
                    }
                    None => {
                        if due.is_empty() {
                            shared.cv.wait(&mut guard);
                        }
                        break;
                    }
                }
            }
        }
        for e in due.drain(..) {
            if !e.cancelled.load(Ordering::Acquire) {
                e.waker.wake();
            }
        }
    }
}

/// Register a wakeup; the returned flag cancels it.
pub(crate) fn register(at: Instant, waker: Waker) -> Arc<AtomicBool> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let shared = driver();
    {
        let mut guard = shared.heap.lock();
        let seq = guard.1;
        guard.1 += 1;
        guard.0.push(Reverse(Entry {
            at,
            seq,
            waker,
            cancelled: cancelled.clone(),
        }));
    }
    shared.cv.notify_one();
    cancelled
}

/// Suspend the calling fiber for `dur`.
pub fn sleep(dur: Duration) -> SleepFuture {
    SleepFuture {
        until: Instant::now() + dur,
        registered: None,
    }
}

/// Future returned by [`sleep`].
pub struct SleepFuture {
    until: Instant,
    registered: Option<Arc<AtomicBool>>,
}

impl Unpin for SleepFuture {}

impl Future for SleepFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.until {
            if let Some(flag) = self.registered.take() {
                flag.store(true, Ordering::Release);
            }
            return Poll::Ready(());
        }
        // Re-register each poll: the task may have migrated and carry a
        // fresh waker. The old entry is cancelled, not removed.
        if let Some(flag) = self.registered.take() {
            flag.store(true, Ordering::Release);
        }
        self.registered = Some(register(self.until, cx.waker().clone()));
        Poll::Pending
    }
}

impl Drop for SleepFuture {
    fn drop(&mut self) {
        if let Some(flag) = self.registered.take() {
            flag.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_wakeup_fires() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let waker = waker_fn(move || {
            let _ = tx.send(());
        });
        register(Instant::now() + Duration::from_millis(20), waker);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn cancelled_wakeup_is_silent() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let waker = waker_fn(move || {
            let _ = tx.send(());
        });
        let flag = register(Instant::now() + Duration::from_millis(20), waker);
        flag.store(true, Ordering::Release);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    fn waker_fn(f: impl Fn() + Send + Sync + 'static) -> Waker {
        struct F<G>(G);
        impl<G: Fn() + Send + Sync + 'static> std::task::Wake for F<G> {
            fn wake(self: Arc<Self>) {
                (self.0)();
            }
        }
        Waker::from(Arc::new(F(f)))
    }
}
