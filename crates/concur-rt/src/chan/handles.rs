// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sender/Receiver handle pair.
//!
//! Both handles are `Clone`; the channel itself is multi-producer
//! multi-consumer. Closing is explicit (`close`, `close_with`) or
//! implicit when the last handle of a side drops.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::core::{Channel, WaitLimit};
use super::error::{RecvError, SendError, TryRecvError, TrySendError};
use super::futures::{RecvFuture, SendFuture};
use crate::deadline::Deadline;

/// Sending half of a channel.
pub struct Sender<T> {
    chan: Arc<Channel<T>>,
}

/// Receiving half of a channel.
pub struct Receiver<T> {
    chan: Arc<Channel<T>>,
}

pub(crate) fn pair<T>(chan: Arc<Channel<T>>) -> (Sender<T>, Receiver<T>) {
    (
        Sender { chan: chan.clone() },
        Receiver { chan },
    )
}

pub(crate) fn sender_chan<T>(s: &Sender<T>) -> &Arc<Channel<T>> {
    &s.chan
}

pub(crate) fn receiver_chan<T>(r: &Receiver<T>) -> &Arc<Channel<T>> {
    &r.chan
}

impl<T> Sender<T> {
    /// Blocking send. Honors the thread's ambient deadline.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.chan.send_blocking(value, &WaitLimit::new(None))
    }

    /// Non-blocking send attempt.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send_impl(value)
    }

    /// Send with a relative timeout.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.chan.send_blocking(value, &WaitLimit::timeout(timeout))
    }

    /// Send bounded by an explicit deadline (expiry and cancellation).
    pub fn send_deadline(&self, value: T, deadline: &Deadline) -> Result<(), SendError<T>> {
        self.chan.send_blocking(value, &WaitLimit::new(Some(deadline)))
    }

    /// Fiber send: parks the calling task instead of the OS thread.
    pub fn send_async(&self, value: T) -> SendFuture<'_, T> {
        SendFuture::new(&self.chan, value)
    }

    /// Close the transmit side. Parked peers wake and observe closure.
    pub fn close(&self) {
        self.chan.close_tx(None);
    }

    /// Close the transmit side carrying an error code for receivers.
    pub fn close_with(&self, code: u32) {
        self.chan.close_tx(Some(code));
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.chan.capacity()
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.len() == 0
    }

    pub fn is_ordered(&self) -> bool {
        self.chan.is_ordered()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.senders.fetch_add(1, Ordering::AcqRel);
        Sender {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.chan.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close_tx(None);
        }
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("cap", &self.chan.capacity())
            .field("closed", &self.chan.is_closed())
            .finish()
    }
}

impl<T> Receiver<T> {
    /// Blocking receive. Drains buffered and in-flight items after close
    /// before reporting closure. Honors the thread's ambient deadline.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.chan.recv_blocking(&WaitLimit::new(None))
    }

    /// Non-blocking receive attempt.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv_impl()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.chan.recv_blocking(&WaitLimit::timeout(timeout))
    }

    pub fn recv_deadline(&self, deadline: &Deadline) -> Result<T, RecvError> {
        self.chan.recv_blocking(&WaitLimit::new(Some(deadline)))
    }

    /// Fiber receive: parks the calling task instead of the OS thread.
    pub fn recv_async(&self) -> RecvFuture<'_, T> {
        RecvFuture::new(&self.chan)
    }

    /// Close the receive side: senders fail fast with the given code.
    pub fn close_with(&self, code: u32) {
        self.chan.close_rx(Some(code));
    }

    pub fn close(&self) {
        self.chan.close_rx(None);
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.chan.capacity()
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.len() == 0
    }

    pub fn is_ordered(&self) -> bool {
        self.chan.is_ordered()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.receivers.fetch_add(1, Ordering::AcqRel);
        Receiver {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.chan.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.chan.close_rx(None);
        }
    }
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("cap", &self.chan.capacity())
            .field("closed", &self.chan.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{bounded, rendezvous, Builder, OverflowMode, PoolHooks};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn buffered_send_recv() {
        let (tx, rx) = bounded(10);
        tx.send(42).unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn fifo_order_buffered() {
        let (tx, rx) = bounded(8);
        for i in 0..8 {
            tx.send(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(rx.recv().unwrap(), i);
        }
    }

    #[test]
    fn rendezvous_pairs_sender_and_receiver() {
        let (tx, rx) = rendezvous();
        let t = thread::spawn(move || tx.send(99).unwrap());
        assert_eq!(rx.recv().unwrap(), 99);
        t.join().unwrap();
    }

    #[test]
    fn rendezvous_try_send_without_receiver_is_full() {
        let (tx, _rx) = rendezvous();
        assert!(tx.try_send(1).unwrap_err().is_full());
    }

    #[test]
    fn cap_one_alternating_never_blocks() {
        let (tx, rx) = bounded(1);
        for i in 0..100 {
            tx.send(i).unwrap();
            assert_eq!(rx.recv().unwrap(), i);
        }
    }

    #[test]
    fn dropping_last_sender_closes() {
        let (tx, rx) = bounded::<i32>(4);
        let tx2 = tx.clone();
        drop(tx);
        drop(tx2);
        assert!(matches!(rx.recv(), Err(RecvError::Closed { code: None })));
    }

    #[test]
    fn close_with_code_reaches_receiver() {
        let (tx, rx) = bounded::<i32>(4);
        tx.send(1).unwrap();
        tx.close_with(17);
        // Buffered item drains first.
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap_err().code(), Some(17));
    }

    #[test]
    fn rx_close_with_code_reaches_sender() {
        let (tx, rx) = bounded::<i32>(1);
        rx.close_with(5);
        match tx.send(1) {
            Err(SendError::Closed { code, .. }) => assert_eq!(code, Some(5)),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn send_after_close_is_broken_pipe() {
        let (tx, rx) = bounded::<i32>(4);
        tx.close();
        assert!(tx.send(1).unwrap_err().is_closed());
        assert!(matches!(rx.recv(), Err(RecvError::Closed { .. })));
    }

    #[test]
    fn close_unblocks_parked_receiver() {
        let (tx, rx) = bounded::<i32>(4);
        let t = thread::spawn(move || rx.recv());
        thread::sleep(Duration::from_millis(20));
        tx.close();
        assert!(matches!(t.join().unwrap(), Err(RecvError::Closed { .. })));
    }

    #[test]
    fn close_unblocks_parked_sender() {
        let (tx, rx) = bounded::<i32>(1);
        tx.send(0).unwrap();
        let t = thread::spawn(move || tx.send(1));
        thread::sleep(Duration::from_millis(20));
        rx.close();
        assert!(t.join().unwrap().unwrap_err().is_closed());
    }

    #[test]
    fn timed_send_on_full_buffer_expires() {
        let (tx, rx) = bounded(1);
        tx.send(1).unwrap();
        let started = std::time::Instant::now();
        match tx.send_timeout(2, Duration::from_millis(50)) {
            Err(SendError::TimedOut(v)) => assert_eq!(v, 2),
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(45));
        // Buffer unchanged: the original item is still there.
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn timed_recv_on_empty_expires() {
        let (_tx, rx) = bounded::<i32>(1);
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(20)),
            Err(RecvError::TimedOut)
        ));
    }

    #[test]
    fn cancelled_deadline_fails_fast() {
        let (tx, rx) = bounded::<i32>(1);
        tx.send(1).unwrap();
        let d = Deadline::never();
        d.cancel();
        assert!(matches!(
            tx.send_deadline(2, &d),
            Err(SendError::Cancelled(2))
        ));
        drop(rx);
    }

    #[test]
    fn ambient_deadline_cancels_blocking_recv() {
        let (_tx, rx) = bounded::<i32>(1);
        let d = Deadline::never();
        let d2 = d.clone();
        let t = thread::spawn(move || {
            crate::deadline::with_current(d2, || rx.recv())
        });
        thread::sleep(Duration::from_millis(30));
        d.cancel();
        assert!(matches!(t.join().unwrap(), Err(RecvError::Cancelled)));
    }

    #[test]
    fn drop_new_reports_full_and_keeps_buffer() {
        let (tx, rx) = Builder::new()
            .capacity(2)
            .overflow(OverflowMode::DropNew)
            .build()
            .unwrap();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert!(matches!(tx.send(3), Err(SendError::Full(3))));
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn drop_old_evicts_eldest() {
        let (tx, rx) = Builder::new()
            .capacity(2)
            .overflow(OverflowMode::DropOld)
            .build()
            .unwrap();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(rx.recv().unwrap(), 3);
    }

    #[test]
    fn multiple_producers_multiple_consumers() {
        const PRODUCERS: usize = 4;
        const PER: usize = 1000;
        let (tx, rx) = bounded(16);
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER {
                    tx.send(p * PER + i).unwrap();
                }
            }));
        }
        drop(tx);
        let sum = AtomicUsize::new(0);
        let count = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    while let Ok(v) = rx.recv() {
                        sum.fetch_add(v, Ordering::Relaxed);
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        for h in handles {
            h.join().unwrap();
        }
        let total = PRODUCERS * PER;
        assert_eq!(count.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }

    #[test]
    fn pooled_channel_mints_up_to_cap() {
        let made = Arc::new(AtomicUsize::new(0));
        let made2 = made.clone();
        let hooks = PoolHooks {
            create: Box::new(move || made2.fetch_add(1, Ordering::SeqCst)),
            reset: None,
            destroy: None,
        };
        let (tx, rx) = Builder::new()
            .capacity(4)
            .pooled(hooks, 2)
            .build()
            .unwrap();
        // Pool empty: recv mints.
        let a = rx.recv().unwrap();
        let b = rx.recv().unwrap();
        assert_eq!(made.load(Ordering::SeqCst), 2);
        // At cap: recv now waits for returns.
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
        tx.send(a).unwrap();
        let _ = rx.recv().unwrap();
        tx.send(b).unwrap();
        assert_eq!(made.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pooled_reset_runs_on_return() {
        let resets = Arc::new(AtomicUsize::new(0));
        let resets2 = resets.clone();
        let hooks = PoolHooks {
            create: Box::new(|| 0usize),
            reset: Some(Box::new(move |v| {
                *v = 7;
                resets2.fetch_add(1, Ordering::SeqCst);
            })),
            destroy: None,
        };
        let (tx, rx) = Builder::new()
            .capacity(2)
            .pooled(hooks, 1)
            .build()
            .unwrap();
        let item = rx.recv().unwrap();
        assert_eq!(item, 0);
        tx.send(item).unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[test]
    fn waiter_flag_tracks_list() {
        // Parked receiver implies the published flag; a woken one clears it.
        let (tx, rx) = bounded::<i32>(2);
        let t = thread::spawn(move || rx.recv().unwrap());
        thread::sleep(Duration::from_millis(20));
        tx.send(5).unwrap();
        assert_eq!(t.join().unwrap(), 5);
    }
}
