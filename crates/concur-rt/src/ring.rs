// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded lock-free MPMC ring.
//!
//! Per-slot sequence stamps serialize producer/consumer handoff slot by
//! slot: a producer at sequence `s` owns `slots[s & mask]` when the stamp
//! equals `s`, publishes data by storing `s + 1`, and a consumer at `s`
//! reads when the stamp equals `s + 1`, releasing the slot for the next
//! lap with `s + N`. Head/tail are claimed by CAS, so enqueue/dequeue are
//! linearizable and FIFO.
//!
//! The slot array is rounded up to a power of two; the requested logical
//! capacity is enforced separately so a capacity-3 channel does not hold
//! four items. `len` is an approximate occupancy counter, `inflight`
//! counts producers that passed their closed-channel check and are
//! committed to enqueue — the channel layer drains while either is
//! nonzero.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(crate) struct MpmcRing<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    len: CachePadded<AtomicUsize>,
    inflight: CachePadded<AtomicUsize>,
    mask: usize,
    cap: usize,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Create a ring holding at most `cap` items. `cap` must be at least 1.
    pub fn with_capacity(cap: usize) -> Self {
        assert!(cap >= 1, "ring capacity must be at least 1");
        let n = cap.next_power_of_two().max(2);
        let slots = (0..n)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            len: CachePadded::new(AtomicUsize::new(0)),
            inflight: CachePadded::new(AtomicUsize::new(0)),
            mask: n - 1,
            cap,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Approximate number of buffered items.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `value`, or hand it back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            // Logical capacity check (the slot array may be larger).
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.cap {
                return Err(value);
            }

            let slot = &self.slots[tail & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp.wrapping_sub(tail) as isize;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.stamp.store(tail.wrapping_add(1), Ordering::Release);
                        self.len.fetch_add(1, Ordering::Release);
                        return Ok(());
                    }
                    Err(t) => tail = t,
                }
            } else if diff < 0 {
                // Slot still holds last lap's value.
                return Err(value);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp.wrapping_sub(head.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.stamp
                            .store(head.wrapping_add(self.mask + 1), Ordering::Release);
                        self.len.fetch_sub(1, Ordering::Release);
                        return Some(value);
                    }
                    Err(h) => head = h,
                }
            } else if diff < 0 {
                // Next slot not yet published.
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Mark one producer as committed past its closed-channel check.
    pub fn begin_produce(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_produce(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Producers currently between `begin_produce` and `end_produce`.
    pub fn producers_inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let ring = MpmcRing::with_capacity(8);
        for i in 0..8 {
            ring.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn logical_capacity_is_enforced() {
        // Slot array rounds up to 4, but only 3 items may be buffered.
        let ring = MpmcRing::with_capacity(3);
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.push(3).unwrap();
        assert_eq!(ring.push(4), Err(4));
        assert_eq!(ring.pop(), Some(1));
        ring.push(4).unwrap();
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn wraparound_many_laps() {
        let ring = MpmcRing::with_capacity(2);
        for lap in 0..100 {
            ring.push(lap * 2).unwrap();
            ring.push(lap * 2 + 1).unwrap();
            assert_eq!(ring.pop(), Some(lap * 2));
            assert_eq!(ring.pop(), Some(lap * 2 + 1));
        }
    }

    #[test]
    fn concurrent_producers_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;
        let ring = Arc::new(MpmcRing::with_capacity(64));
        let sum = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut v = p * PER_PRODUCER + i;
                    loop {
                        match ring.push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        for _ in 0..2 {
            let ring = ring.clone();
            let sum = sum.clone();
            let received = received.clone();
            handles.push(std::thread::spawn(move || loop {
                if received.load(Ordering::Relaxed) >= PRODUCERS * PER_PRODUCER {
                    break;
                }
                match ring.pop() {
                    Some(v) => {
                        sum.fetch_add(v, Ordering::Relaxed);
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                    None => std::thread::yield_now(),
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(received.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }

    #[test]
    fn drop_releases_unread_items() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring = MpmcRing::with_capacity(4);
            for _ in 0..3 {
                let _ = ring.push(Counted(drops.clone()));
            }
            drop(ring.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn inflight_gate() {
        let ring = MpmcRing::<u32>::with_capacity(2);
        assert_eq!(ring.producers_inflight(), 0);
        ring.begin_produce();
        ring.begin_produce();
        assert_eq!(ring.producers_inflight(), 2);
        ring.end_produce();
        ring.end_produce();
        assert_eq!(ring.producers_inflight(), 0);
    }
}
