//! SyncMap - A concurrently readable map for read-mostly workloads
//!
//! A [`SyncMap`] can be used in place of a `RwLock<HashMap>` or
//! `Mutex<HashMap>` when the set of keys is mostly stable: keys are written
//! once and read many times, or many threads work on disjoint sets of keys.
//! In that steady state loads, stores and deletes of known keys never take
//! a lock.
//!
//! Internally there are two maps. The read snapshot is immutable and is
//! swapped atomically, with superseded generations reclaimed by
//! crossbeam-epoch once no reader can see them. The dirty map sits behind a
//! mutex and absorbs new keys. Both maps point at the same per-key
//! entries, so updating the value of a known key is a compare and swap on
//! the entry without touching either map.
//!
//! A lookup that misses the snapshot while the dirty map has extra keys
//! counts as a miss. Once the misses reach the size of the dirty map, the
//! dirty map is promoted to be the new snapshot. The cost of a promotion is
//! therefore paid for by the misses that led to it.
//!
//! This is not a transactional structure. There is no stable view across
//! operations, and [`SyncMap::range`] may or may not see changes made while
//! it runs. If you need consistent reads across many keys, use a
//! transactional map instead.

mod stats;

pub use self::stats::SyncMapStats;

use crossbeam_epoch::{self as epoch, Guard, Owned};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, SerializeMap, Serializer},
};

use crate::internals::entry::{Entry, Slot};
use crate::internals::snapshot::{EntryMap, ReadOnly, SnapshotCell};
#[cfg(feature = "serde")]
use crate::utils::SnapshotVisitor;
use crate::utils::DefaultHashBuilder;

/// Everything guarded by the map's mutex.
struct DirtyState<K, V, S> {
    /// Superset of the live snapshot keys plus newly inserted ones. `None`
    /// right after a promotion, until the next new key arrives.
    dirty: Option<EntryMap<K, V, S>>,
    misses: usize,
    locked_ops: u64,
    promotions: u64,
    dirty_rebuilds: u64,
}

impl<K, V, S> DirtyState<K, V, S> {
    fn new() -> Self {
        DirtyState {
            dirty: None,
            misses: 0,
            locked_ops: 0,
            promotions: 0,
            dirty_rebuilds: 0,
        }
    }
}

/// A concurrent map optimised for stable key sets and read heavy access.
///
/// All operations take `&self`, so a `SyncMap` is normally shared behind
/// an `Arc` or a static. Values are returned by clone; store `Arc<T>` if
/// your values are expensive to clone.
///
/// # Examples
/// ```
/// use syncmap::SyncMap;
///
/// let map: SyncMap<&str, u32> = SyncMap::new();
/// map.store("apples", 3);
/// assert_eq!(map.load("apples"), Some(3));
///
/// // Only one caller gets to insert an absent key.
/// assert_eq!(map.load_or_store("pears", 5), (5, false));
/// assert_eq!(map.load_or_store("pears", 7), (5, true));
///
/// assert_eq!(map.load_and_delete("apples"), Some(3));
/// assert_eq!(map.load("apples"), None);
///
/// let mut total = 0;
/// map.range(|_k, v| {
///     total += *v;
///     true
/// });
/// assert_eq!(total, 5);
/// ```
pub struct SyncMap<K, V, S = DefaultHashBuilder> {
    read: SnapshotCell<ReadOnly<K, V, S>>,
    dirty: Mutex<DirtyState<K, V, S>>,
    build_hasher: S,
}

impl<K, V> SyncMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new, empty map using the default hasher.
    pub fn new() -> Self {
        SyncMap::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        SyncMap::with_hasher(S::default())
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Construct a new, empty map that hashes keys with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        SyncMap::from_snapshot(ReadOnly::empty(build_hasher.clone()), build_hasher)
    }

    pub(crate) fn from_snapshot(read: ReadOnly<K, V, S>, build_hasher: S) -> Self {
        SyncMap {
            read: SnapshotCell::new(read),
            dirty: Mutex::new(DirtyState::new()),
            build_hasher,
        }
    }

    /// Return a copy of the value for `key`, or `None` if it is absent.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        self.locate(key, false, guard, |e| e.and_then(|e| e.load(guard)).cloned())
    }

    /// Set the value for `key`.
    pub fn store(&self, key: K, value: V) {
        self.swap_with(key, value, |_| ())
    }

    /// Set the value for `key`, returning the previous value if there was
    /// one.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.swap_with(key, value, |prev| prev.cloned())
    }

    /// Return the existing value for `key` if present. Otherwise store
    /// `value` and return it.
    ///
    /// The boolean is `true` if the value was loaded and `false` if it was
    /// stored. Of many threads racing on an absent key, exactly one sees
    /// `false` and all of them get the same value back.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        let guard = &epoch::pin();
        let read = self.read.load(guard);
        let value = match read.get(&key) {
            Some(e) => match e.try_load_or_store(value, guard) {
                Ok(result) => return result,
                Err(value) => value,
            },
            None => value,
        };

        let mut locked = self.lock();
        let read = self.read.load(guard);
        if let Some(e) = read.get(&key) {
            if e.unexpunge_locked(guard) {
                // Expunged entries only exist while a dirty map does.
                if let Some(dirty) = locked.dirty.as_mut() {
                    dirty.insert(key, Arc::clone(e));
                }
            }
            match e.try_load_or_store(value, guard) {
                Ok(result) => result,
                // Only the lock holder expunges, and we just unexpunged.
                Err(value) => (value, false),
            }
        } else if let Some(e) = locked.dirty.as_ref().and_then(|d| d.get(&key)).cloned() {
            let result = match e.try_load_or_store(value, guard) {
                Ok(result) => result,
                Err(value) => (value, false),
            };
            self.miss_locked(&mut locked, guard);
            result
        } else {
            self.insert_locked(&mut locked, read, key, Entry::new(value.clone()), guard);
            (value, false)
        }
    }

    /// Remove `key`, returning the value it had if it was present.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        self.locate(key, true, guard, |e| e.and_then(|e| e.delete(guard)).cloned())
    }

    /// Remove `key`.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        self.locate(key, true, guard, |e| {
            if let Some(e) = e {
                e.delete(guard);
            }
        })
    }

    /// Replace the value for `key` with `new` only if it currently equals
    /// `old`. Returns `false` if the key is absent.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &epoch::pin();
        self.locate(key, false, guard, |e| {
            e.is_some_and(|e| e.try_compare_and_swap(old, new, guard))
        })
    }

    /// Remove `key` only if its value currently equals `old`.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &epoch::pin();
        // The key stays in the dirty map, it is dropped at the next rebuild.
        self.locate(key, false, guard, |e| {
            e.is_some_and(|e| e.compare_and_delete(old, guard))
        })
    }

    /// Call `f` for every key and value in the map, stopping early when `f`
    /// returns `false`.
    ///
    /// Keys present for the whole call are visited exactly once. Keys
    /// stored or deleted concurrently may or may not be seen. Order is
    /// unspecified. If the snapshot is incomplete it is promoted first, so
    /// this is O(n) even when `f` stops early.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = &epoch::pin();
        let mut read = self.read.load(guard);
        if read.amended {
            let mut locked = self.lock();
            if self.read.load(guard).amended {
                self.promote_locked(&mut locked, guard);
            }
            read = self.read.load(guard);
        }

        for (k, e) in read.m.iter() {
            if let Some(v) = e.load(guard) {
                if !f(k, v) {
                    break;
                }
            }
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let read = self.read.load(guard);
        if read.is_empty() && !read.amended {
            return;
        }

        let mut locked = self.lock();
        let read = self.read.load(guard);
        if !read.is_empty() || read.amended {
            self.read
                .publish(ReadOnly::empty(self.build_hasher.clone()), guard);
        }
        let dropped = locked.dirty.take().map_or(0, |d| d.len());
        locked.misses = 0;
        trace!(dropped, "cleared map");
    }

    /// Report how much work has gone through the locked path.
    pub fn stats(&self) -> SyncMapStats {
        // Not via self.lock(), looking should not count.
        let locked = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        SyncMapStats {
            locked_ops: locked.locked_ops,
            misses: locked.misses,
            promotions: locked.promotions,
            dirty_rebuilds: locked.dirty_rebuilds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirtyState<K, V, S>> {
        // A panic in a user Hash or Eq impl can poison us, but never in the
        // middle of a change to the maps themselves.
        let mut locked = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
        locked.locked_ops += 1;
        locked
    }

    /// Find the entry for `key` and hand it to `f`.
    ///
    /// Falls back to the dirty map under the lock when the snapshot is
    /// amended, counting a miss. With `remove` the key is also taken out of
    /// the dirty map.
    fn locate<Q, R, F>(&self, key: &Q, remove: bool, guard: &Guard, f: F) -> R
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(Option<&Entry<V>>) -> R,
    {
        let read = self.read.load(guard);
        match read.get(key) {
            Some(e) => return f(Some(&**e)),
            None if !read.amended => return f(None),
            None => {}
        }

        let mut locked = self.lock();
        // A promotion may have happened while we waited.
        let read = self.read.load(guard);
        match read.get(key) {
            Some(e) => return f(Some(&**e)),
            None if !read.amended => return f(None),
            None => {}
        }

        let result = if remove {
            let e = locked.dirty.as_mut().and_then(|d| d.remove(key));
            f(e.as_deref())
        } else {
            f(locked.dirty.as_ref().and_then(|d| d.get(key)).map(|e| &**e))
        };
        self.miss_locked(&mut locked, guard);
        result
    }

    fn swap_with<R, F>(&self, key: K, value: V, f: F) -> R
    where
        F: FnOnce(Option<&V>) -> R,
    {
        let guard = &epoch::pin();
        let mut new = Owned::new(Slot::Valid(value));
        let read = self.read.load(guard);
        if let Some(e) = read.get(&key) {
            match e.try_swap(new, guard) {
                Ok(prev) => return f(prev),
                Err(back) => new = back,
            }
        }

        let mut locked = self.lock();
        let read = self.read.load(guard);
        if let Some(e) = read.get(&key) {
            if e.unexpunge_locked(guard) {
                // Expunged entries only exist while a dirty map does.
                if let Some(dirty) = locked.dirty.as_mut() {
                    dirty.insert(key, Arc::clone(e));
                }
            }
            f(e.swap_locked(new, guard))
        } else if let Some(e) = locked.dirty.as_ref().and_then(|d| d.get(&key)) {
            f(e.swap_locked(new, guard))
        } else {
            self.insert_locked(&mut locked, read, key, Entry::from(new), guard);
            f(None)
        }
    }

    /// Add a key the snapshot does not have to the dirty map, building the
    /// dirty map and flagging the snapshot as amended if needed.
    fn insert_locked(
        &self,
        locked: &mut DirtyState<K, V, S>,
        read: &ReadOnly<K, V, S>,
        key: K,
        entry: Entry<V>,
        guard: &Guard,
    ) {
        self.dirty_locked(locked, read, guard)
            .insert(key, Arc::new(entry));
        if !read.amended {
            self.read.publish(read.amend(), guard);
        }
    }

    fn dirty_locked<'a>(
        &self,
        locked: &'a mut DirtyState<K, V, S>,
        read: &ReadOnly<K, V, S>,
        guard: &Guard,
    ) -> &'a mut EntryMap<K, V, S> {
        if locked.dirty.is_none() {
            locked.dirty_rebuilds += 1;
        }
        locked
            .dirty
            .get_or_insert_with(|| self.rebuild_dirty(read, guard))
    }

    /// Copy the live part of the snapshot into a new dirty map. Deleted
    /// entries are expunged on the way and left behind.
    fn rebuild_dirty(&self, read: &ReadOnly<K, V, S>, guard: &Guard) -> EntryMap<K, V, S> {
        let mut dirty = HashMap::with_capacity_and_hasher(read.m.len(), self.build_hasher.clone());
        for (k, e) in read.m.iter() {
            if !e.try_expunge_locked(guard) {
                dirty.insert(k.clone(), Arc::clone(e));
            }
        }
        trace!(
            snapshot = read.m.len(),
            live = dirty.len(),
            "rebuilt dirty map from read snapshot"
        );
        dirty
    }

    fn miss_locked(&self, locked: &mut DirtyState<K, V, S>, guard: &Guard) {
        locked.misses += 1;
        let dirty_len = locked.dirty.as_ref().map_or(0, |d| d.len());
        if locked.misses < dirty_len {
            return;
        }
        self.promote_locked(locked, guard);
    }

    /// Make the dirty map the new read snapshot. The map is moved, not
    /// copied.
    fn promote_locked(&self, locked: &mut DirtyState<K, V, S>, guard: &Guard) {
        let Some(dirty) = locked.dirty.take() else {
            return;
        };
        trace!(
            len = dirty.len(),
            misses = locked.misses,
            "promoting dirty map"
        );
        self.read.publish(ReadOnly::complete(dirty), guard);
        locked.misses = 0;
        locked.promotions += 1;
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    /// The collected entries go straight into the read snapshot, so they
    /// are served lock free from the start.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let build_hasher = S::default();
        let mut m = HashMap::with_hasher(build_hasher.clone());
        for (k, v) in iter {
            m.insert(k, Arc::new(Entry::new(v)));
        }
        SyncMap::from_snapshot(ReadOnly::complete(m), build_hasher)
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.store(k, v);
        }
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: fmt::Debug + Hash + Eq + Clone + Send + Sync + 'static,
    V: fmt::Debug + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.range(|k, v| {
            map.entry(k, v);
            true
        });
        map.finish()
    }
}

#[cfg(feature = "serde")]
impl<K, V, S> Serialize for SyncMap<K, V, S>
where
    K: Serialize + Hash + Eq + Clone + Send + Sync + 'static,
    V: Serialize + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn serialize<T>(&self, serializer: T) -> Result<T::Ok, T::Error>
    where
        T: Serializer,
    {
        let mut state = serializer.serialize_map(None)?;
        let mut result = Ok(());
        self.range(|k, v| {
            result = state.serialize_entry(k, v);
            result.is_ok()
        });
        result?;
        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V, S> Deserialize<'de> for SyncMap<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(SnapshotVisitor::new())
    }
}
