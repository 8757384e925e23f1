//! Cross-thread tests for the deferred-update queue: the loss-free
//! add/drain contract and the drain-order guarantee.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use stratum_engine::defer::{Deferred, DeferredQueue};

#[derive(Debug)]
struct Update {
    due: u64,
    id: u64,
}

impl Deferred for Update {
    fn due_tick(&self) -> u64 {
        self.due
    }
}

// ---------------------------------------------------------------------------
// No-lost-update property
// ---------------------------------------------------------------------------

#[test]
fn no_updates_lost_under_concurrent_add_and_drain() {
    const ADDERS: u64 = 8;
    const ITEMS_PER_ADDER: u64 = 2_000;
    const MAX_PRIORITY: u64 = 999;

    let queue = Arc::new(DeferredQueue::new(16));
    let adders_done = Arc::new(AtomicBool::new(false));

    // One drainer races the adders, repeatedly covering the full
    // priority range, and keeps going until the queue is provably dry.
    let drainer = {
        let queue = Arc::clone(&queue);
        let adders_done = Arc::clone(&adders_done);
        thread::spawn(move || {
            let mut seen: Vec<u64> = Vec::new();
            loop {
                let drained = queue.drain_due(MAX_PRIORITY, |u: Update| seen.push(u.id));
                if adders_done.load(Ordering::SeqCst) && drained == 0 && queue.is_empty() {
                    break;
                }
                thread::yield_now();
            }
            seen
        })
    };

    let handles: Vec<_> = (0..ADDERS)
        .map(|a| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..ITEMS_PER_ADDER {
                    let id = a * ITEMS_PER_ADDER + i;
                    // Scatter priorities over the whole range so buckets
                    // are created, drained, and retired many times over.
                    let due = (id * 37) % (MAX_PRIORITY + 1);
                    queue.add(Update { due, id });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    adders_done.store(true, Ordering::SeqCst);

    let mut seen = drainer.join().unwrap();
    let total = (ADDERS * ITEMS_PER_ADDER) as usize;
    assert_eq!(seen.len(), total, "drainer lost or duplicated updates");

    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), total, "drainer observed duplicate ids");
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&(total as u64 - 1)));
}

#[test]
fn adds_racing_many_retire_cycles_are_never_dropped() {
    // All items share one bucket key, so every drain cycle retires the
    // bucket the adders are still appending to -- the redirect path gets
    // exercised constantly instead of occasionally.
    const ADDERS: u64 = 4;
    const ITEMS_PER_ADDER: u64 = 5_000;

    let queue = Arc::new(DeferredQueue::new(1));
    let adders_done = Arc::new(AtomicBool::new(false));

    let drainer = {
        let queue = Arc::clone(&queue);
        let adders_done = Arc::clone(&adders_done);
        thread::spawn(move || {
            let mut count = 0u64;
            loop {
                let drained = queue.drain_due(0, |_u: Update| {});
                count += drained as u64;
                if adders_done.load(Ordering::SeqCst) && drained == 0 && queue.is_empty() {
                    break;
                }
            }
            count
        })
    };

    let handles: Vec<_> = (0..ADDERS)
        .map(|a| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..ITEMS_PER_ADDER {
                    queue.add(Update {
                        due: 0,
                        id: a * ITEMS_PER_ADDER + i,
                    });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    adders_done.store(true, Ordering::SeqCst);

    assert_eq!(drainer.join().unwrap(), ADDERS * ITEMS_PER_ADDER);
}

// ---------------------------------------------------------------------------
// Drain order
// ---------------------------------------------------------------------------

#[test]
fn buckets_drain_in_ascending_key_order() {
    let queue = DeferredQueue::new(8);
    for due in [70u64, 3, 45, 12, 99, 8, 23] {
        queue.add(Update { due, id: due });
    }

    let mut keys = Vec::new();
    while let Some(bucket) = queue.poll(u64::MAX) {
        keys.push(bucket.key());
        while bucket.pop().is_some() {}
        if queue.complete(&bucket, u64::MAX) {
            break;
        }
    }

    let mut sorted = keys.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(keys, sorted, "buckets must come lowest-key first");
    assert_eq!(keys, vec![0, 8, 16, 40, 64, 96]);
}
