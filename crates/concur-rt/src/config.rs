// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `CC_*` environment tunables.
//!
//! Read once on first use. Flags accept `1`/`true`/`on` and `0`/`false`/`off`;
//! anything else logs a warning and keeps the default.

use std::sync::OnceLock;

/// Runtime configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    /// `CC_CHAN_DEBUG`: dump channel counters on runtime shutdown.
    pub chan_debug: bool,
    /// `CC_CHAN_DEBUG_VERBOSE`: per-operation trace logging.
    pub chan_debug_verbose: bool,
    /// `CC_CHANNEL_TIMING`: accumulate send/recv wall-clock sums.
    pub channel_timing: bool,
    /// `CC_CHAN_NO_LOCKFREE`: force the mutex-guarded ring everywhere.
    pub no_lockfree: bool,
    /// `CC_CHAN_MINIMAL_FAST_PATH`: branded lock-free fast path (default on).
    pub fast_path: bool,
    /// `CC_CHAN_STEADY_EDGE_WAKE`: signal receivers only on the
    /// empty-to-nonempty transition instead of on every enqueue.
    pub edge_wake: bool,
    /// `CC_CHAN_WAKE_DEFER`: defer wake-batch flushes while any channel
    /// lock is held on this thread.
    pub wake_defer: bool,
    /// `CC_CHAN_WAKE_GUARD`: warn when a wake batch flushes with a
    /// channel lock still held.
    pub wake_guard: bool,
    /// `CC_NURSERY_CLOSING_RUNTIME_GUARD`: fail a blocking recv on an
    /// autoclose channel issued from inside the owning nursery.
    pub nursery_guard: bool,
    /// `CC_WORKERS`: worker-count override (0 = auto).
    pub workers: usize,
    /// `CC_SPIN_FAST_ITERS`: idle-policy fast-spin iterations.
    pub spin_fast_iters: u32,
    /// `CC_SPIN_YIELD_ITERS`: idle-policy OS-yield iterations.
    pub spin_yield_iters: u32,
    /// `CC_FIBER_STATS`: dump scheduler counters on shutdown.
    pub fiber_stats: bool,
    /// `CC_SPAWN_TIMING`: accumulate spawn latency sums.
    pub spawn_timing: bool,
    /// `CC_DEADLOCK_ABORT`: abort with exit code 124 on detected
    /// deadlock (default); `0` diagnoses without exiting.
    pub deadlock_abort: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chan_debug: false,
            chan_debug_verbose: false,
            channel_timing: false,
            no_lockfree: false,
            fast_path: true,
            edge_wake: false,
            wake_defer: false,
            wake_guard: false,
            nursery_guard: false,
            workers: 0,
            spin_fast_iters: 512,
            spin_yield_iters: 8,
            fiber_stats: false,
            spawn_timing: false,
            deadlock_abort: true,
        }
    }
}

/// The process-wide configuration, read from the environment on first use.
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(Config::from_env)
}

impl Config {
    fn from_env() -> Self {
        let d = Config::default();
        Self {
            chan_debug: flag("CC_CHAN_DEBUG", d.chan_debug),
            chan_debug_verbose: flag("CC_CHAN_DEBUG_VERBOSE", d.chan_debug_verbose),
            channel_timing: flag("CC_CHANNEL_TIMING", d.channel_timing),
            no_lockfree: flag("CC_CHAN_NO_LOCKFREE", d.no_lockfree),
            fast_path: flag("CC_CHAN_MINIMAL_FAST_PATH", d.fast_path),
            edge_wake: flag("CC_CHAN_STEADY_EDGE_WAKE", d.edge_wake),
            wake_defer: flag("CC_CHAN_WAKE_DEFER", d.wake_defer),
            wake_guard: flag("CC_CHAN_WAKE_GUARD", d.wake_guard),
            nursery_guard: flag("CC_NURSERY_CLOSING_RUNTIME_GUARD", d.nursery_guard),
            workers: number("CC_WORKERS", d.workers),
            spin_fast_iters: number("CC_SPIN_FAST_ITERS", d.spin_fast_iters),
            spin_yield_iters: number("CC_SPIN_YIELD_ITERS", d.spin_yield_iters),
            fiber_stats: flag("CC_FIBER_STATS", d.fiber_stats),
            spawn_timing: flag("CC_SPAWN_TIMING", d.spawn_timing),
            deadlock_abort: flag("CC_DEADLOCK_ABORT", d.deadlock_abort),
        }
    }
}

fn flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            other => {
                log::warn!("{name}={other:?} is not a boolean, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn number<N: std::str::FromStr + std::fmt::Display + Copy>(name: &str, default: N) -> N {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            log::warn!("{name}={v:?} is not a number, using {default}");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.fast_path);
        assert!(c.deadlock_abort);
        assert!(c.spin_fast_iters > 0);
    }

    #[test]
    fn flag_parsing() {
        std::env::set_var("CC_TEST_FLAG_A", "1");
        std::env::set_var("CC_TEST_FLAG_B", "off");
        assert!(flag("CC_TEST_FLAG_A", false));
        assert!(!flag("CC_TEST_FLAG_B", true));
        assert!(flag("CC_TEST_FLAG_MISSING", true));
    }
}
