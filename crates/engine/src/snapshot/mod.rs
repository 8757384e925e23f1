//! Live/snapshot double buffering.
//!
//! Every registered value is a (live, snapshot) pair. Exactly one owner
//! mutates `live` -- encoded structurally: the [`Live`] handle is the only
//! type with mutating methods and it is not `Clone`. Any thread may read
//! `snapshot` through a [`Snapshot`] handle. The registry's
//! [`publish_all`] sweep copies live over snapshot for every member; it is
//! invoked by the tick coordinator at the copy stage, under the stage
//! barrier, so it never overlaps a live writer.
//!
//! Per-value copies are atomic; the sweep across all values is not a
//! single global commit point -- readers of two different snapshots during
//! the sweep may see one pre-copy and one post-copy value. That relaxed,
//! per-value consistency is the contract.
//!
//! [`publish_all`]: SnapshotRegistry::publish_all

mod map;
mod value;

pub use map::{LiveMap, SnapshotMap};
pub use value::{Live, Snapshot};

use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Membership handle for a registered value.
    pub struct SnapshotKey;
}

/// Internal face of a registered (live, snapshot) pair: copy live over
/// snapshot.
pub(crate) trait Publish: Send + Sync {
    fn publish(&self);
}

/// Explicit-membership registry of double-buffered values. One per world
/// (or per whatever unit shares a copy stage); values never discover it
/// implicitly.
#[derive(Default)]
pub struct SnapshotRegistry {
    members: Mutex<SlotMap<SnapshotKey, Arc<dyn Publish>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain value. Returns the owning write handle and one
    /// read handle (more can be minted from either).
    pub fn register<T>(&self, initial: T) -> (Live<T>, Snapshot<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let shared = value::shared(initial);
        let key = self.members.lock().insert(shared.clone());
        value::handles(shared, key)
    }

    /// Register a snapshotable map. The snapshot side is published as an
    /// `Arc`, so readers share one allocation per tick instead of cloning
    /// the map per read.
    pub fn register_map<K, V>(
        &self,
        initial: std::collections::HashMap<K, V>,
    ) -> (LiveMap<K, V>, SnapshotMap<K, V>)
    where
        K: Clone + Eq + std::hash::Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let shared = map::shared(initial);
        let key = self.members.lock().insert(shared.clone());
        map::handles(shared, key)
    }

    /// Remove a value from the sweep. Its handles keep working; the
    /// snapshot just stops being refreshed. Returns whether the key was
    /// still a member.
    pub fn unregister(&self, key: SnapshotKey) -> bool {
        self.members.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    /// The copy-stage sweep: live -> snapshot for every member. Returns
    /// how many values were published.
    ///
    /// The member list is snapshotted under the lock and published
    /// outside it, so a concurrently running task can register or
    /// unregister without deadlocking against the sweep.
    pub fn publish_all(&self) -> usize {
        let members: Vec<Arc<dyn Publish>> = self.members.lock().values().cloned().collect();
        for member in &members {
            member.publish();
        }
        members.len()
    }
}
