// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end scenarios: channels driven by fibers and threads together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concur_rt::chan::futures::{submit_recv, submit_send};
use concur_rt::{
    bounded, rendezvous, Builder, Deadline, OverflowMode, Runtime, Select, SelectOutcome,
    SendError,
};

#[test]
fn buffered_ping_pong() {
    let rt = Runtime::new(2);
    let (tx, rx) = bounded::<u64>(16);

    let producer = rt.spawn(async move {
        for i in 0..1000u64 {
            tx.send_async(i).await.unwrap();
        }
    });
    let consumer = rt.spawn(async move {
        let mut out = Vec::with_capacity(1000);
        for _ in 0..1000 {
            out.push(rx.recv_async().await.unwrap());
        }
        out
    });

    producer.join().unwrap();
    let out = consumer.join().unwrap();
    let expected: Vec<u64> = (0..1000).collect();
    assert_eq!(out, expected);
    rt.shutdown();
}

#[test]
fn rendezvous_closure_race() {
    let rt = Runtime::new(3);
    let (tx, rx) = rendezvous::<usize>();

    let mut senders = Vec::new();
    for id in 0..4 {
        let tx = tx.clone();
        senders.push(rt.spawn(async move { tx.send_async(id).await }));
    }
    let closer_tx = tx.clone();
    let closer = rt.spawn(async move {
        closer_tx.close();
    });

    // Drain from a plain OS thread until closure.
    let drainer = std::thread::spawn(move || {
        let mut got = Vec::new();
        while let Ok(v) = rx.recv() {
            got.push(v);
        }
        got
    });

    let mut oks = 0;
    let mut pipes = 0;
    for h in senders {
        match h.join().unwrap() {
            Ok(()) => oks += 1,
            Err(SendError::Closed { .. }) => pipes += 1,
            other => panic!("unexpected send result {other:?}"),
        }
    }
    closer.join().unwrap();
    let got = drainer.join().unwrap();

    // Every OK send rendezvoused with exactly one recv; the rest broke.
    assert_eq!(got.len(), oks);
    assert_eq!(oks + pipes, 4);
    rt.shutdown();
}

#[test]
fn select_single_winner_per_send() {
    let rt = Runtime::new(2);
    let (tx_a, rx_a) = bounded::<u32>(4);
    let (tx_b, rx_b) = bounded::<u32>(4);

    let mut selectors = Vec::new();
    for _ in 0..2 {
        let rx_a = rx_a.clone();
        let rx_b = rx_b.clone();
        selectors.push(rt.spawn(async move {
            let mut sel = Select::new();
            sel.recv(&rx_a);
            sel.recv(&rx_b);
            sel.select_async().await
        }));
    }

    std::thread::sleep(Duration::from_millis(50));
    tx_a.send(10).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    tx_b.send(20).unwrap();

    let mut indices = Vec::new();
    for h in selectors {
        match h.join().unwrap() {
            SelectOutcome::Recv { index, value } => {
                indices.push(index);
                assert!(matches!((index, value), (0, 10) | (1, 20)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
    rt.shutdown();
}

#[test]
fn deadline_send_expires_and_buffer_is_untouched() {
    let (tx, rx) = bounded::<u8>(1);
    tx.send(1).unwrap();

    let started = Instant::now();
    match tx.send_deadline(2, &Deadline::after(Duration::from_millis(50))) {
        Err(SendError::TimedOut(2)) => {}
        other => panic!("expected TimedOut, got {other:?}"),
    }
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(45), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(2), "returned after {waited:?}");

    assert_eq!(rx.try_recv().unwrap(), 1);
    assert!(rx.try_recv().is_err());
}

#[test]
fn drop_old_keeps_newest() {
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
fn single_worker_no_starvation() {
    const PRODUCERS: usize = 100;
    const PER: usize = 1000;

    let rt = Runtime::new(1);
    let (tx, rx) = bounded::<usize>(64);

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let tx = tx.clone();
        handles.push(rt.spawn(async move {
            for i in 0..PER {
                tx.send_async(p * PER + i).await.unwrap();
            }
        }));
    }
    drop(tx);

    let consumer = rt.spawn(async move {
        let mut count = 0usize;
        let mut sum = 0usize;
        while let Ok(v) = rx.recv_async().await {
            count += 1;
            sum += v;
        }
        (count, sum)
    });

    for h in handles {
        h.join().unwrap();
    }
    let (count, sum) = consumer.join().unwrap();
    let total = PRODUCERS * PER;
    assert_eq!(count, total);
    assert_eq!(sum, total * (total - 1) / 2);
    rt.shutdown();
}

#[test]
fn close_with_inflight_producers_loses_nothing() {
    const THREADS: usize = 8;
    let (tx, rx) = bounded::<usize>(16);
    let sent = Arc::new(AtomicUsize::new(0));

    let mut producers = Vec::new();
    for p in 0..THREADS {
        let tx = tx.clone();
        let sent = sent.clone();
        producers.push(std::thread::spawn(move || {
            for i in 0..500 {
                match tx.send(p * 1000 + i) {
                    Ok(()) => {
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(SendError::Closed { .. }) => break,
                    Err(e) => panic!("unexpected send error {e:?}"),
                }
            }
        }));
    }

    let consumer = {
        let rx = rx.clone();
        std::thread::spawn(move || {
            let mut received = 0usize;
            while rx.recv().is_ok() {
                received += 1;
            }
            received
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    tx.close();

    for p in producers {
        p.join().unwrap();
    }
    let received = consumer.join().unwrap();
    // Every send that reported OK before (or racing) the close was
    // delivered; none delivered twice.
    assert_eq!(received, sent.load(Ordering::SeqCst));
}

#[test]
fn submit_wrappers_complete_through_the_scheduler() {
    let (tx, rx) = bounded::<u32>(1);
    let done = submit_send(&tx, 9);
    assert!(done.recv().unwrap().is_ok());

    let got = submit_recv(&rx);
    assert_eq!(got.recv().unwrap().unwrap(), 9);
}

#[test]
fn fiber_sleep_and_select_deadline() {
    let rt = Runtime::new(2);
    let (tx, rx) = bounded::<u32>(2);

    let ticker = rt.spawn(async move {
        concur_rt::sleep(Duration::from_millis(30)).await;
        tx.send_async(1).await.unwrap();
    });

    let mut sel = Select::new();
    sel.recv(&rx);
    match sel.select_timeout(Duration::from_secs(2)).unwrap() {
        SelectOutcome::Recv { index: 0, value: 1 } => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    ticker.join().unwrap();
    rt.shutdown();
}
