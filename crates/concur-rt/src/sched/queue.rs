// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler queues.
//!
//! Local deques and the global injector come from `crossbeam-deque`
//! (Chase-Lev: owner LIFO pop, thieves batch-steal FIFO from the other
//! end). The per-worker inbox is a bounded MPMC ring so cross-worker
//! spawns land near their target without touching the global queue.

use crate::ring::MpmcRing;

/// Tasks a single inbox may hold before spawns overflow to the global
/// queue.
const INBOX_CAP: usize = 256;

/// Bounded MPMC mailbox owned by one worker, pushed by anyone.
pub(crate) struct Inbox<T> {
    ring: MpmcRing<T>,
}

#[allow(dead_code)]
impl<T> Inbox<T> {
    pub fn new() -> Self {
        Self {
            ring: MpmcRing::with_capacity(INBOX_CAP),
        }
    }

    /// Deliver to this inbox; hands the item back when full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.ring.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.ring.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_fifo() {
        let inbox = Inbox::new();
        inbox.push(1).unwrap();
        inbox.push(2).unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.pop(), Some(1));
        assert_eq!(inbox.pop(), Some(2));
        assert_eq!(inbox.pop(), None);
    }

    #[test]
    fn inbox_overflow_hands_back() {
        let inbox = Inbox::new();
        for i in 0..INBOX_CAP {
            inbox.push(i).unwrap();
        }
        assert_eq!(inbox.push(usize::MAX), Err(usize::MAX));
    }
}
