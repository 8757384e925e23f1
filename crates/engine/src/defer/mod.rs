//! Time-bucketed deferred updates.
//!
//! Work scheduled for a future tick goes into a [`DeferredQueue`]; each
//! item lands in the bucket for its priority truncated to the queue's
//! resolution. A consumer retrieves everything due by a threshold with
//! the `poll` / drain / `complete` loop (packaged as
//! [`DeferredQueue::drain_due`]), in truncated-priority order.
//!
//! # Loss-free retirement
//!
//! The hard part is retiring a drained bucket while producers may still
//! hold a reference to it. The protocol:
//!
//! - `add` pushes into the mapped bucket, **then** checks the retired
//!   flag; if set, it drains the bucket and re-forwards every item
//!   through the live map.
//! - `complete` removes the empty bucket from the map, **then** sets the
//!   retired flag, then drains-and-forwards whatever raced in.
//!
//! All flag accesses are `SeqCst`, so for any racing push either the
//! pusher's flag read happens after the retirer's flag write (the pusher
//! rescues) or before it (the retirer's own drain, which follows the
//! write, sees the pushed item). Both sides may rescue concurrently;
//! pops are atomic, so every item is forwarded exactly once. The same
//! benign-race shape as a dirty-set drain: work can only be re-homed,
//! never dropped.

mod bucket;

pub use bucket::Bucket;

use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

/// An update scheduled for a future point in tick time.
pub trait Deferred: Send + 'static {
    /// The absolute tick at which this update becomes due.
    fn due_tick(&self) -> u64;
}

/// A bare tick value is its own schedule; handy for tests and for callers
/// that keep their payload elsewhere.
impl Deferred for u64 {
    fn due_tick(&self) -> u64 {
        *self
    }
}

/// Lock-free priority queue of deferred updates, bucketed by priority
/// truncated to a power-of-two resolution.
///
/// `add` may be called from any thread and never blocks. `poll` /
/// `complete` assume a single draining call owns the returned bucket at a
/// time; completing a bucket another drain already retired is a protocol
/// violation and panics.
pub struct DeferredQueue<T> {
    resolution: u64,
    buckets: SkipMap<u64, Arc<Bucket<T>>>,
}

impl<T: Deferred> DeferredQueue<T> {
    /// `resolution` is rounded up to the next power of two, minimum 1.
    pub fn new(resolution: u64) -> Self {
        Self {
            resolution: resolution.next_power_of_two(),
            buckets: SkipMap::new(),
        }
    }

    /// The effective (rounded) resolution.
    pub fn resolution(&self) -> u64 {
        self.resolution
    }

    /// The bucket key for a priority: truncation to the resolution
    /// boundary. Idempotent, and never exceeds the priority.
    #[inline]
    pub fn bucket_key(&self, priority: u64) -> u64 {
        priority & !(self.resolution - 1)
    }

    /// Schedule an update. Never blocks.
    pub fn add(&self, item: T) {
        let key = self.bucket_key(item.due_tick());
        self.insert(key, item);
    }

    fn insert(&self, key: u64, item: T) {
        let bucket = self
            .buckets
            .get_or_insert_with(key, || Arc::new(Bucket::new(key)))
            .value()
            .clone();
        bucket.push(item);
        if bucket.is_retired() {
            // Lost the race with a concurrent `complete`: the bucket is
            // out of the map. Forward everything still in it (ours or
            // other losers') back through the live map.
            self.rescue(&bucket);
        }
    }

    fn rescue(&self, bucket: &Bucket<T>) {
        while let Some(stray) = bucket.pop() {
            self.insert(bucket.key(), stray);
        }
    }

    /// The lowest-keyed bucket, if it is due by `threshold`. The bucket is
    /// **not** removed; the caller drains it with [`Bucket::pop`] and then
    /// hands it back through [`complete`](Self::complete).
    pub fn poll(&self, threshold: u64) -> Option<Arc<Bucket<T>>> {
        let entry = self.buckets.front()?;
        if *entry.key() > threshold {
            return None;
        }
        Some(entry.value().clone())
    }

    /// Finish with a bucket received from `poll`. If the caller drained it
    /// dry, the bucket is removed from the map and retired (racing adds
    /// are rescued, see the module docs); if items raced in since, it
    /// simply stays polled-able.
    ///
    /// Returns `bucket.key() + resolution > threshold`: `true` means this
    /// bucket's span crosses the threshold, so everything due by
    /// `threshold` has now been offered and the drain loop may stop.
    /// `false` means further polling is required. This exact boundary is
    /// what makes the drain loop cover every due item; see
    /// [`is_fully_below`](Self::is_fully_below) for the complement.
    pub fn complete(&self, bucket: &Arc<Bucket<T>>, threshold: u64) -> bool {
        if bucket.is_empty() {
            // Remove-then-retire, and only remove the exact bucket we
            // drained: the key may already be occupied by a successor.
            if let Some(entry) = self.buckets.get(&bucket.key()) {
                if Arc::ptr_eq(entry.value(), bucket) {
                    entry.remove();
                }
            }
            bucket.retire();
            self.rescue(bucket);
        }
        bucket.key() + self.resolution > threshold
    }

    /// True iff every priority this bucket can hold is at or below
    /// `threshold`, i.e. the drain loop has not yet covered the threshold
    /// and must keep polling.
    pub fn is_fully_below(&self, bucket: &Bucket<T>, threshold: u64) -> bool {
        bucket.key() + self.resolution <= threshold
    }

    /// The canonical drain loop: poll, drain, complete, until everything
    /// due by `threshold` has been handed to `f`. Returns how many items
    /// were drained.
    pub fn drain_due(&self, threshold: u64, mut f: impl FnMut(T)) -> usize {
        let mut drained = 0;
        while let Some(bucket) = self.poll(threshold) {
            while let Some(item) = bucket.pop() {
                f(item);
                drained += 1;
            }
            if self.complete(&bucket, threshold) {
                break;
            }
        }
        drained
    }

    /// Number of currently scheduled items. Approximate under concurrent
    /// activity; exact when quiescent.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
