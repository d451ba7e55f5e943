// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker wake primitive.
//!
//! An epoch counter behind a mutex+condvar: sleepers snapshot the epoch,
//! re-check their queues, then park until the epoch moves. Wakers bump
//! the epoch and notify one or all sleepers. The mutex round-trip in
//! `epoch()` is what makes the snapshot/park pair race-free against a
//! concurrent wake.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub(crate) struct Parker {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Snapshot the epoch before the final queue re-check.
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Sleep until the epoch moves past `seen` or `timeout` elapses.
    pub fn park(&self, seen: u64, timeout: Duration) {
        let mut epoch = self.epoch.lock();
        if *epoch != seen {
            return;
        }
        self.cv.wait_for(&mut epoch, timeout);
    }

    pub fn wake_one(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cv.notify_one();
    }

    pub fn wake_all(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wake_releases_parker() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let seen = p.epoch();
        let t = std::thread::spawn(move || {
            p2.park(seen, Duration::from_secs(5));
        });
        std::thread::sleep(Duration::from_millis(10));
        p.wake_one();
        let started = Instant::now();
        t.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stale_epoch_returns_immediately() {
        let p = Parker::new();
        let seen = p.epoch();
        p.wake_all();
        let started = Instant::now();
        p.park(seen, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
