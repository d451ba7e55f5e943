// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Watchdog and deadlock detector.
//!
//! A low-frequency monitor thread. If a base worker's heartbeat goes
//! stale while runnable work is queued — a CPU-bound fiber has the worker
//! pinned — replacement workers are added, geometrically up to a cap.
//! Separately, when every worker is asleep (or blocked in a channel wait)
//! while fibers remain parked and no work is queued for one full second,
//! the process is in a cooperative deadlock: dump a diagnostic and abort
//! with exit code 124 unless `CC_DEADLOCK_ABORT=0`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::worker::{start_worker, SchedShared};
use crate::config::config;

/// Monitor poll cadence.
const POLL: Duration = Duration::from_millis(100);
/// A heartbeat older than this marks its worker as stalled.
const STALE_MS: u64 = 200;
/// Replacement workers may grow the pool to this multiple of the base.
const GROWTH_CAP_FACTOR: usize = 4;
/// How long the deadlock condition must persist before acting.
const DEADLOCK_GRACE: Duration = Duration::from_secs(1);

pub(crate) fn start_watchdog(shared: Arc<SchedShared>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("concur-watchdog".to_string())
        .spawn(move || watch_loop(&shared))
        .expect("failed to spawn watchdog thread")
}

fn watch_loop(shared: &Arc<SchedShared>) {
    let mut growth = 1usize;
    let mut deadlock_since: Option<Instant> = None;

    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(POLL);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        check_stalls(shared, &mut growth);
        check_deadlock(shared, &mut deadlock_since);
    }
}

fn check_stalls(shared: &Arc<SchedShared>, growth: &mut usize) {
    if !shared.has_queued_work() {
        *growth = 1;
        return;
    }
    let now = shared.now_ms();
    let stalled = shared
        .heartbeats
        .iter()
        .any(|hb| now.saturating_sub(hb.load(Ordering::Acquire)) > STALE_MS);
    if !stalled {
        *growth = 1;
        return;
    }

    let cap = shared.base_workers * GROWTH_CAP_FACTOR;
    let current = shared.base_workers + shared.replacements.load(Ordering::Acquire);
    let add = (*growth).min(cap.saturating_sub(current));
    for _ in 0..add {
        let id = shared.next_worker_id.fetch_add(1, Ordering::AcqRel);
        start_worker(shared.clone(), id, None);
        shared.replacements.fetch_add(1, Ordering::AcqRel);
    }
    if add > 0 {
        log::warn!(
            "watchdog: worker heartbeat stalled with work queued, added {add} replacement worker(s)"
        );
        *growth = (*growth * 2).min(8);
    }
}

fn check_deadlock(shared: &Arc<SchedShared>, since: &mut Option<Instant>) {
    let parked = shared.waiting_fibers.load(Ordering::Acquire);
    let sleeping = shared.sleeping.load(Ordering::Acquire);
    let blocked = crate::sched::blocked_threads();
    let total = shared.base_workers + shared.replacements.load(Ordering::Acquire);

    let stuck = parked > 0
        && sleeping + blocked >= total
        && !shared.has_queued_work()
        && super::timer::pending_timers() == 0;
    if !stuck {
        *since = None;
        return;
    }

    match *since {
        None => *since = Some(Instant::now()),
        Some(t0) if t0.elapsed() >= DEADLOCK_GRACE => {
            log::error!(
                "deadlock: {parked} fiber(s) parked, {sleeping}/{total} workers sleeping, \
                 {blocked} thread(s) blocked in channel waits, no runnable work"
            );
            if config().deadlock_abort {
                std::process::exit(124);
            }
            // Diagnose-only mode: report once per episode.
            *since = None;
        }
        Some(_) => {}
    }
}
