use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;

/// An unbounded queue of deferred updates sharing one resolution-truncated
/// priority key. No ordering is guaranteed among items within a bucket.
///
/// A bucket is live while it is reachable through the queue's key map.
/// Once a drain finds it empty it is retired: removed from the map and
/// flagged, after which any racing push is rescued back into the map by
/// the queue (see the protocol notes in [`super::DeferredQueue`]).
pub struct Bucket<T> {
    key: u64,
    items: SegQueue<T>,
    retired: AtomicBool,
}

impl<T> Bucket<T> {
    pub(crate) fn new(key: u64) -> Self {
        Self {
            key,
            items: SegQueue::new(),
            retired: AtomicBool::new(false),
        }
    }

    /// The resolution-truncated priority shared by every item in this
    /// bucket.
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Take one item. The consumer that received this bucket from `poll`
    /// drains it by calling this until `None`.
    pub fn pop(&self) -> Option<T> {
        self.items.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn push(&self, item: T) {
        self.items.push(item);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// One-shot: a second retire means two drains both claimed this
    /// bucket, which the draining protocol forbids.
    pub(crate) fn retire(&self) {
        let was = self.retired.swap(true, Ordering::SeqCst);
        assert!(
            !was,
            "bucket {} redirected twice -- a drained bucket was completed again",
            self.key
        );
    }
}

impl<T> fmt::Debug for Bucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("key", &self.key)
            .field("len", &self.items.len())
            .field("retired", &self.is_retired())
            .finish()
    }
}
