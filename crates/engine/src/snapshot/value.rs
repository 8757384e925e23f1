use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Publish, SnapshotKey};

/// The (live, snapshot) pair behind one registered value.
///
/// The live lock has only two takers: the single owning writer and the
/// barrier-serialized copy sweep, which never overlap. It exists so the
/// sweep can read `live` from another thread without any unsafe
/// single-writer claims.
pub(crate) struct Shared<T> {
    live: Mutex<T>,
    snapshot: RwLock<T>,
}

impl<T: Clone + Send + Sync> Publish for Shared<T> {
    fn publish(&self) {
        let live = self.live.lock();
        *self.snapshot.write() = live.clone();
    }
}

pub(crate) fn shared<T: Clone + Send + Sync>(initial: T) -> Arc<Shared<T>> {
    Arc::new(Shared {
        live: Mutex::new(initial.clone()),
        snapshot: RwLock::new(initial),
    })
}

pub(crate) fn handles<T>(shared: Arc<Shared<T>>, key: SnapshotKey) -> (Live<T>, Snapshot<T>) {
    let snapshot = Snapshot {
        shared: shared.clone(),
    };
    (Live { shared, key }, snapshot)
}

/// The owning write handle for a snapshotable value.
///
/// Not `Clone`: whichever manager holds this handle is the single writer.
/// Everything else in the system gets a [`Snapshot`] and reads the last
/// published state.
pub struct Live<T> {
    shared: Arc<Shared<T>>,
    key: SnapshotKey,
}

impl<T> Live<T> {
    /// The registry membership key, for `SnapshotRegistry::unregister`.
    pub fn key(&self) -> SnapshotKey {
        self.key
    }

    /// Replace the live value. Invisible to readers until the next copy
    /// stage.
    pub fn set(&self, value: T) {
        *self.shared.live.lock() = value;
    }

    /// Mutate the live value in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.shared.live.lock())
    }

    /// Read back the current live value (the owner's own in-progress
    /// state, not the published snapshot).
    pub fn live(&self) -> T
    where
        T: Clone,
    {
        self.shared.live.lock().clone()
    }

    /// Mint another read handle for this value.
    pub fn reader(&self) -> Snapshot<T> {
        Snapshot {
            shared: self.shared.clone(),
        }
    }
}

/// A read handle: sees only the snapshot published at the last copy
/// stage. Cheap to clone and to hand to any thread.
pub struct Snapshot<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Snapshot<T> {
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.shared.snapshot.read().clone()
    }

    /// Borrow the snapshot without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.snapshot.read())
    }
}
