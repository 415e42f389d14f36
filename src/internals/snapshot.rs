//! The read side of a [`SyncMap`](crate::SyncMap).
//!
//! [`SnapshotCell`] is an epoch protected pointer to an immutable value. It
//! behaves like the active pointer of an `EbrCell`: readers pin and load
//! without any lock, and the (single, serialised) writer publishes a whole
//! new value, retiring the previous one to crossbeam-epoch. A reader that
//! loaded a superseded value keeps a valid view of it until it unpins.
//!
//! [`ReadOnly`] is the value stored in that cell: the key to entry map plus
//! the `amended` flag, set when the dirty map holds keys the snapshot lacks.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

use super::entry::Entry;

/// The map shape shared by the read snapshot and the dirty map. Entries are
/// reference counted so both can point at the same cell.
pub(crate) type EntryMap<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

pub(crate) struct SnapshotCell<T> {
    // Hammered by every reader, keep it off the writer lock's cache line.
    active: CachePadded<Atomic<T>>,
}

impl<T> SnapshotCell<T> {
    pub(crate) fn new(data: T) -> Self {
        SnapshotCell {
            active: CachePadded::new(Atomic::new(data)),
        }
    }

    /// Load the current snapshot. The reference is valid for as long as the
    /// guard stays pinned, even if a newer snapshot is published meanwhile.
    #[inline]
    pub(crate) fn load<'a>(&'a self, guard: &'a Guard) -> &'a T {
        // The pointer is never null, we init with data and every publish
        // swaps in another owned value.
        unsafe { self.active.load(Acquire, guard).deref() }
    }
}

impl<T> SnapshotCell<T>
where
    T: Send + 'static,
{
    /// Replace the snapshot. Callers must hold the writer lock, so there is
    /// never more than one publisher.
    pub(crate) fn publish(&self, data: T, guard: &Guard) {
        let prev = self.active.swap(Owned::new(data), AcqRel, guard);
        // Readers that loaded prev are pinned, destruction waits for them.
        unsafe { guard.defer_destroy(prev) };
    }
}

impl<T> Drop for SnapshotCell<T> {
    fn drop(&mut self) {
        // Loaded references are bounded by a borrow of the cell, so nothing
        // can observe the active value once we hold &mut self.
        unsafe {
            let cur = self.active.load(Relaxed, epoch::unprotected());
            drop(cur.into_owned());
        }
    }
}

/// An immutable view of part of the map. Never mutated after publication.
pub(crate) struct ReadOnly<K, V, S> {
    pub(crate) m: Arc<EntryMap<K, V, S>>,
    pub(crate) amended: bool,
}

impl<K, V, S> ReadOnly<K, V, S> {
    pub(crate) fn empty(build_hasher: S) -> Self {
        ReadOnly {
            m: Arc::new(HashMap::with_hasher(build_hasher)),
            amended: false,
        }
    }

    /// A snapshot built directly from a complete map, nothing is dirty.
    pub(crate) fn complete(m: EntryMap<K, V, S>) -> Self {
        ReadOnly {
            m: Arc::new(m),
            amended: false,
        }
    }

    /// The same entries, flagged as incomplete. The inner map is shared,
    /// not copied.
    pub(crate) fn amend(&self) -> Self {
        ReadOnly {
            m: Arc::clone(&self.m),
            amended: true,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.m.is_empty()
    }
}

impl<K, V, S> ReadOnly<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.m.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadOnly, SnapshotCell};
    use crate::internals::entry::Entry;
    use crossbeam_epoch as epoch;
    use std::collections::hash_map::RandomState;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::scope;

    #[test]
    fn test_snapshot_publish() {
        let cell = SnapshotCell::new(0u64);
        let guard = &epoch::pin();

        let old = cell.load(guard);
        assert_eq!(*old, 0);
        cell.publish(1, guard);
        // The previous generation still reads 0 while pinned.
        assert_eq!(*old, 0);
        assert_eq!(*cell.load(guard), 1);
    }

    #[test]
    fn test_readonly_amend_shares_map() {
        let mut m: HashMap<u32, Arc<Entry<u32>>, RandomState> = HashMap::default();
        m.insert(1, Arc::new(Entry::new(10)));
        let ro = ReadOnly::complete(m);
        assert!(!ro.amended);

        let amended = ro.amend();
        assert!(amended.amended);
        assert!(Arc::ptr_eq(&ro.m, &amended.m));

        let guard = &epoch::pin();
        assert_eq!(amended.get(&1).and_then(|e| e.load(guard)), Some(&10));
        assert!(amended.get(&2).is_none());
        assert!(ReadOnly::<u32, u32, _>::empty(RandomState::new()).is_empty());
    }

    static GC_COUNT: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct TestGcWrapper<T> {
        data: T,
    }

    impl<T> Drop for TestGcWrapper<T> {
        fn drop(&mut self) {
            GC_COUNT.fetch_add(1, Ordering::Release);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_snapshot_gc_operation() {
        GC_COUNT.store(0, Ordering::Release);
        let cell = SnapshotCell::new(TestGcWrapper { data: 0i64 });
        let write = Mutex::new(());

        scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    while GC_COUNT.load(Ordering::Acquire) < 50 {
                        let _lock = write.lock().unwrap();
                        let guard = &epoch::pin();
                        let next = cell.load(guard).data + 1;
                        cell.publish(TestGcWrapper { data: next }, guard);
                        guard.flush();
                    }
                });
            }
        });

        assert!(GC_COUNT.load(Ordering::Acquire) >= 50);
    }
}
