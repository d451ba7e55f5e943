// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadlines and the ambient cancellation scope.
//!
//! A `Deadline` pairs an absolute expiry instant with a shared cancelled
//! flag. Blocking channel operations check the deadline before committing
//! to a wait; a wait already committed runs to completion (cancelling it
//! mid-handoff would strand the partner), and cancellation surfaces at the
//! next re-entry point.
//!
//! The thread-local *current* deadline is the interface the nursery layer
//! uses to scope cancellation over plain blocking calls that don't take an
//! explicit `Deadline` argument.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An absolute deadline with a cancellation flag.
///
/// Cloning shares the flag: cancelling one clone cancels them all.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// A deadline that never expires (cancellation only).
    pub fn never() -> Self {
        Self {
            at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A deadline expiring `dur` from now.
    pub fn after(dur: Duration) -> Self {
        Self::at(Instant::now() + dur)
    }

    /// A deadline expiring at the given instant.
    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The absolute expiry instant, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the expiry instant has passed (cancellation not included).
    pub fn is_expired(&self) -> bool {
        matches!(self.at, Some(at) if Instant::now() >= at)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Deadline>> = const { RefCell::new(None) };
}

/// Run `f` with `deadline` installed as this thread's current deadline.
///
/// Blocking channel operations without an explicit deadline argument honor
/// the installed deadline. Scopes nest; the previous deadline is restored
/// on exit.
pub fn with_current<R>(deadline: Deadline, f: impl FnOnce() -> R) -> R {
    let prev = CURRENT.with(|c| c.borrow_mut().replace(deadline));
    let _restore = Restore(prev);
    f()
}

/// The current thread's ambient deadline, if one is installed.
pub fn current() -> Option<Deadline> {
    CURRENT.with(|c| c.borrow().clone())
}

struct Restore(Option<Deadline>);

impl Drop for Restore {
    fn drop(&mut self) {
        let prev = self.0.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_does_not_expire() {
        let d = Deadline::never();
        assert!(!d.is_expired());
        assert!(!d.is_cancelled());
    }

    #[test]
    fn after_expires() {
        let d = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.is_expired());
    }

    #[test]
    fn cancel_is_shared_across_clones() {
        let d = Deadline::never();
        let d2 = d.clone();
        d2.cancel();
        assert!(d.is_cancelled());
    }

    #[test]
    fn current_scope_nests_and_restores() {
        assert!(current().is_none());
        with_current(Deadline::never(), || {
            assert!(current().is_some());
            let inner = Deadline::after(Duration::from_secs(60));
            with_current(inner, || {
                assert!(current().is_some_and(|d| d.instant().is_some()));
            });
            assert!(current().is_some_and(|d| d.instant().is_none()));
        });
        assert!(current().is_none());
    }
}
