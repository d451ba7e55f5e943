// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads and scheduling policy.
//!
//! Each worker drains, in priority order: its local deque (LIFO for
//! cache locality), its inbox, the global injector, then steals — a
//! random victim's inbox first, then up to half of its deque. Spawn
//! placement is round-robin across inboxes, except that a worker
//! targeting itself pushes straight onto its local deque. Idle workers
//! spin a fast loop, yield the OS thread a few times, then publish
//! `sleeping` and park on the wake primitive.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};

use super::parker::Parker;
use super::queue::Inbox;
use super::task::{RawTask, TaskState};
use crate::config::config;
use crate::stats::{self, STATS};

type Task = Arc<RawTask>;

/// State shared between workers, the watchdog, and spawners.
pub(crate) struct SchedShared {
    pub injector: Injector<Task>,
    /// Stealers for the base workers, index = worker id.
    pub stealers: Vec<Stealer<Task>>,
    /// Stealers for watchdog-spawned replacement workers.
    pub extra_stealers: Mutex<Vec<Stealer<Task>>>,
    /// Per-base-worker spawn mailboxes.
    pub inboxes: Vec<Inbox<Task>>,
    pub parker: Parker,
    /// Live (spawned, not yet complete) fibers.
    pub pending: AtomicUsize,
    pub sleeping: AtomicUsize,
    pub spinning: AtomicUsize,
    /// Fibers parked behind wait nodes, timers, or joins.
    pub waiting_fibers: AtomicUsize,
    pub next_inbox: AtomicUsize,
    pub next_worker_id: AtomicUsize,
    pub shutdown: AtomicBool,
    pub base_workers: usize,
    pub replacements: AtomicUsize,
    /// Milliseconds since `started_at`, per base worker.
    pub heartbeats: Vec<AtomicU64>,
    pub started_at: Instant,
    pub all_done: (Mutex<bool>, Condvar),
}

enum Placed {
    Local,
    Inbox,
    No(Task),
}

impl SchedShared {
    pub fn new(base_workers: usize) -> (Arc<Self>, Vec<Worker<Task>>) {
        let locals: Vec<Worker<Task>> = (0..base_workers).map(|_| Worker::new_lifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let shared = Arc::new(Self {
            injector: Injector::new(),
            stealers,
            extra_stealers: Mutex::new(Vec::new()),
            inboxes: (0..base_workers).map(|_| Inbox::new()).collect(),
            parker: Parker::new(),
            pending: AtomicUsize::new(0),
            sleeping: AtomicUsize::new(0),
            spinning: AtomicUsize::new(0),
            waiting_fibers: AtomicUsize::new(0),
            next_inbox: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(base_workers),
            shutdown: AtomicBool::new(false),
            base_workers,
            replacements: AtomicUsize::new(0),
            heartbeats: (0..base_workers).map(|_| AtomicU64::new(0)).collect(),
            started_at: Instant::now(),
            all_done: (Mutex::new(false), Condvar::new()),
        });
        (shared, locals)
    }

    pub fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Runnable work visible outside local deques.
    pub fn has_queued_work(&self) -> bool {
        !self.injector.is_empty() || self.inboxes.iter().any(|i| !i.is_empty())
    }

    pub fn note_parked(&self) {
        self.waiting_fibers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_unparked(&self) {
        self.waiting_fibers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Enqueue a runnable fiber: round-robin inbox, own deque when the
    /// rotor lands on the current worker, global queue from non-workers.
    pub fn schedule(self: &Arc<Self>, task: Task) {
        let task = match self.place_from_worker(task) {
            Placed::Local => {
                // Local pushes only wake a sleeper when nobody is spinning.
                if self.spinning.load(Ordering::Acquire) == 0 {
                    self.parker.wake_one();
                }
                return;
            }
            Placed::Inbox => {
                self.parker.wake_one();
                return;
            }
            Placed::No(task) => task,
        };
        self.injector.push(task);
        self.parker.wake_one();
    }

    fn place_from_worker(self: &Arc<Self>, task: Task) -> Placed {
        CTX.with(|c| {
            let ctx_ref = c.borrow();
            match ctx_ref.as_ref() {
                Some(ctx) if Arc::ptr_eq(&ctx.shared, self) => {
                    let target =
                        self.next_inbox.fetch_add(1, Ordering::Relaxed) % self.inboxes.len();
                    if target == ctx.id {
                        ctx.local.push(task);
                        Placed::Local
                    } else {
                        match self.inboxes[target].push(task) {
                            Ok(()) => Placed::Inbox,
                            Err(task) => Placed::No(task),
                        }
                    }
                }
                _ => Placed::No(task),
            }
        })
    }
}

struct WorkerCtx {
    id: usize,
    shared: Arc<SchedShared>,
    local: Worker<Task>,
}

thread_local! {
    static CTX: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
}

/// Start one worker thread. Base workers receive their pre-registered
/// deque; replacements build their own and publish a stealer.
pub(crate) fn start_worker(
    shared: Arc<SchedShared>,
    id: usize,
    local: Option<Worker<Task>>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("concur-worker-{id}"))
        .spawn(move || {
            let local = local.unwrap_or_else(|| {
                let w = Worker::new_lifo();
                shared.extra_stealers.lock().push(w.stealer());
                w
            });
            CTX.with(|c| {
                *c.borrow_mut() = Some(WorkerCtx {
                    id,
                    shared: shared.clone(),
                    local,
                })
            });
            worker_loop(&shared, id);
            CTX.with(|c| *c.borrow_mut() = None);
        })
        .expect("failed to spawn worker thread")
}

fn worker_loop(shared: &Arc<SchedShared>, id: usize) {
    let cfg = config();
    let publish_heartbeat = id < shared.base_workers;
    let mut rng = (id as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut spins: u32 = 0;
    let mut spinning = false;

    macro_rules! stop_spinning {
        () => {
            if spinning {
                spinning = false;
                shared.spinning.fetch_sub(1, Ordering::AcqRel);
            }
        };
    }

    loop {
        if publish_heartbeat {
            shared.heartbeats[id].store(shared.now_ms(), Ordering::Release);
        }

        let task = CTX.with(|c| {
            let ctx_ref = c.borrow();
            let ctx = ctx_ref.as_ref().expect("worker context installed");
            find_task(ctx).or_else(|| {
                // Steal every few idle rounds, and always right before
                // giving up the spin phase.
                if spins == 0 || spins % 8 == 0 {
                    steal_task(ctx, &mut rng)
                } else {
                    None
                }
            })
        });

        if let Some(task) = task {
            stop_spinning!();
            spins = 0;
            run_task(task, shared);
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            stop_spinning!();
            // Drain whatever is left before exiting.
            while let Some(task) = CTX.with(|c| {
                let ctx_ref = c.borrow();
                ctx_ref.as_ref().and_then(|ctx| find_task(ctx))
            }) {
                run_task(task, shared);
            }
            break;
        }

        spins += 1;
        if spins <= cfg.spin_fast_iters {
            if !spinning {
                spinning = true;
                shared.spinning.fetch_add(1, Ordering::AcqRel);
            }
            std::hint::spin_loop();
        } else if spins <= cfg.spin_fast_iters + cfg.spin_yield_iters {
            thread::yield_now();
        } else {
            stop_spinning!();
            let seen = shared.parker.epoch();
            // Final re-check after snapshotting the epoch.
            if shared.has_queued_work() {
                spins = 0;
                continue;
            }
            shared.sleeping.fetch_add(1, Ordering::AcqRel);
            shared.parker.park(seen, Duration::from_millis(10));
            shared.sleeping.fetch_sub(1, Ordering::AcqRel);
            spins = 0;
        }
    }
}

fn find_task(ctx: &WorkerCtx) -> Option<Task> {
    if let Some(t) = ctx.local.pop() {
        return Some(t);
    }
    if let Some(inbox) = ctx.shared.inboxes.get(ctx.id) {
        if let Some(t) = inbox.pop() {
            return Some(t);
        }
    }
    loop {
        match ctx.shared.injector.steal_batch_and_pop(&ctx.local) {
            Steal::Success(t) => return Some(t),
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}

fn steal_task(ctx: &WorkerCtx, rng: &mut u64) -> Option<Task> {
    let shared = &ctx.shared;
    if shared.base_workers > 1 {
        for _ in 0..4 {
            let victim = (xorshift64(rng) as usize) % shared.base_workers;
            if victim == ctx.id {
                continue;
            }
            if let Some(t) = shared.inboxes[victim].pop() {
                stats::bump(&STATS.steals);
                return Some(t);
            }
            if let Steal::Success(t) = shared.stealers[victim].steal_batch_and_pop(&ctx.local) {
                stats::bump(&STATS.steals);
                return Some(t);
            }
        }
    }
    let extras = shared.extra_stealers.lock();
    for s in extras.iter() {
        if let Steal::Success(t) = s.steal_batch_and_pop(&ctx.local) {
            stats::bump(&STATS.steals);
            return Some(t);
        }
    }
    None
}

/// Simple xorshift64 for victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Poll one fiber; handles completion and the park-commit race.
pub(crate) fn run_task(task: Task, shared: &Arc<SchedShared>) {
    if task.state() == TaskState::Complete {
        return;
    }
    task.set_running();

    let completed = task.poll();

    if completed {
        task.mark_complete();
        if shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (lock, cvar) = &shared.all_done;
            let mut done = lock.lock();
            *done = true;
            cvar.notify_all();
        }
    } else {
        // Count the park before committing so the waker's decrement can
        // never land first.
        shared.note_parked();
        if !task.commit_park() {
            // A waker fired mid-poll (yield, or a fast peer). Re-enqueue
            // on the global queue: this is also what makes the fairness
            // yield rotate the fiber to the back.
            shared.note_unparked();
            shared.injector.push(task);
            shared.parker.wake_one();
        }
    }
}
