// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Process-wide operation counters.
//!
//! Always updated (relaxed, uncontended cache lines), only reported when
//! `CC_CHAN_DEBUG` / `CC_FIBER_STATS` are set. Timing sums are gated on
//! `CC_CHANNEL_TIMING` / `CC_SPAWN_TIMING` since they cost a clock read.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use crossbeam_utils::CachePadded;

use crate::config::config;

pub(crate) struct Stats {
    pub sends_fast: CachePadded<AtomicU64>,
    pub sends_slow: CachePadded<AtomicU64>,
    pub recvs_fast: CachePadded<AtomicU64>,
    pub recvs_slow: CachePadded<AtomicU64>,
    pub handoffs: AtomicU64,
    pub parks: AtomicU64,
    pub wakes: AtomicU64,
    pub closes: AtomicU64,
    pub spawns: AtomicU64,
    pub steals: AtomicU64,
    pub yields: AtomicU64,
    pub send_nanos: AtomicU64,
    pub recv_nanos: AtomicU64,
    pub spawn_nanos: AtomicU64,
}

pub(crate) static STATS: Stats = Stats {
    sends_fast: CachePadded::new(AtomicU64::new(0)),
    sends_slow: CachePadded::new(AtomicU64::new(0)),
    recvs_fast: CachePadded::new(AtomicU64::new(0)),
    recvs_slow: CachePadded::new(AtomicU64::new(0)),
    handoffs: AtomicU64::new(0),
    parks: AtomicU64::new(0),
    wakes: AtomicU64::new(0),
    closes: AtomicU64::new(0),
    spawns: AtomicU64::new(0),
    steals: AtomicU64::new(0),
    yields: AtomicU64::new(0),
    send_nanos: AtomicU64::new(0),
    recv_nanos: AtomicU64::new(0),
    spawn_nanos: AtomicU64::new(0),
};

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Relaxed);
}

#[inline]
pub(crate) fn add_nanos(counter: &AtomicU64, nanos: u64) {
    counter.fetch_add(nanos, Relaxed);
}

/// Log the counter snapshot. Called from runtime shutdown.
pub(crate) fn dump() {
    let cfg = config();
    if cfg.chan_debug {
        log::info!(
            "chan: sends fast={} slow={} recvs fast={} slow={} handoffs={} \
             parks={} wakes={} closes={}",
            STATS.sends_fast.load(Relaxed),
            STATS.sends_slow.load(Relaxed),
            STATS.recvs_fast.load(Relaxed),
            STATS.recvs_slow.load(Relaxed),
            STATS.handoffs.load(Relaxed),
            STATS.parks.load(Relaxed),
            STATS.wakes.load(Relaxed),
            STATS.closes.load(Relaxed),
        );
    }
    if cfg.channel_timing {
        log::info!(
            "chan timing: send={}ns recv={}ns",
            STATS.send_nanos.load(Relaxed),
            STATS.recv_nanos.load(Relaxed),
        );
    }
    if cfg.fiber_stats {
        log::info!(
            "fibers: spawns={} steals={} yields={}",
            STATS.spawns.load(Relaxed),
            STATS.steals.load(Relaxed),
            STATS.yields.load(Relaxed),
        );
    }
    if cfg.spawn_timing {
        log::info!("spawn timing: {}ns", STATS.spawn_nanos.load(Relaxed));
    }
}
