use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Publish, SnapshotKey};

/// Snapshotable map. Unlike the scalar pair, the snapshot side is an
/// `Arc<HashMap>` swapped wholesale at each copy: readers that hold a
/// loaded snapshot keep a stable view for as long as they want, and a
/// tick's worth of readers share one allocation.
pub(crate) struct MapShared<K, V> {
    live: Mutex<HashMap<K, V>>,
    snapshot: RwLock<Arc<HashMap<K, V>>>,
}

impl<K, V> Publish for MapShared<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn publish(&self) {
        let live = self.live.lock();
        *self.snapshot.write() = Arc::new(live.clone());
    }
}

pub(crate) fn shared<K, V>(initial: HashMap<K, V>) -> Arc<MapShared<K, V>>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    Arc::new(MapShared {
        snapshot: RwLock::new(Arc::new(initial.clone())),
        live: Mutex::new(initial),
    })
}

pub(crate) fn handles<K, V>(
    shared: Arc<MapShared<K, V>>,
    key: SnapshotKey,
) -> (LiveMap<K, V>, SnapshotMap<K, V>) {
    let snapshot = SnapshotMap {
        shared: shared.clone(),
    };
    (LiveMap { shared, key }, snapshot)
}

/// Owning write handle for a snapshotable map. Not `Clone`; the single
/// writer.
pub struct LiveMap<K, V> {
    shared: Arc<MapShared<K, V>>,
    key: SnapshotKey,
}

impl<K, V> LiveMap<K, V>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> SnapshotKey {
        self.key
    }

    pub fn insert(&self, k: K, v: V) -> Option<V> {
        self.shared.live.lock().insert(k, v)
    }

    pub fn remove(&self, k: &K) -> Option<V> {
        self.shared.live.lock().remove(k)
    }

    /// Read from the live (in-progress) side.
    pub fn get(&self, k: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shared.live.lock().get(k).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.live.lock().is_empty()
    }

    /// Arbitrary in-place access to the live map.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        f(&mut self.shared.live.lock())
    }

    pub fn reader(&self) -> SnapshotMap<K, V> {
        SnapshotMap {
            shared: self.shared.clone(),
        }
    }
}

/// Read handle over the last published state of a snapshotable map.
pub struct SnapshotMap<K, V> {
    shared: Arc<MapShared<K, V>>,
}

impl<K, V> Clone for SnapshotMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash,
{
    /// The whole published map, shared. Holding the `Arc` pins this view
    /// even across later copy stages.
    pub fn load(&self) -> Arc<HashMap<K, V>> {
        self.shared.snapshot.read().clone()
    }

    pub fn get(&self, k: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shared.snapshot.read().get(k).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.snapshot.read().is_empty()
    }
}
