//! The per-key cell shared between the read snapshot and the dirty map.
//!
//! An [`Entry`] owns an atomic pointer to a [`Slot`]. Every state change
//! installs a freshly allocated slot with a compare and swap, and the slot
//! it replaced is retired through the epoch guard. A reader that is pinned
//! can therefore hold a reference to a value even after a writer has
//! replaced or deleted it.
//!
//! The slot lifecycle is:
//!
//! ```text
//!   Valid(v) --delete--> Deleted --rebuild dirty--> Expunged
//!      ^                    |                          |
//!      +------store---------+                          |
//!                           ^                          |
//!                           +-------unexpunge----------+
//! ```
//!
//! `Expunged` means the key is absent from the dirty map as well as
//! logically deleted. Only the lock holder may move an entry into or out of
//! `Expunged`; everything else is lock free.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

/// The state of an [`Entry`].
#[derive(Debug)]
pub(crate) enum Slot<V> {
    /// The key is live and maps to this value.
    Valid(V),
    /// The key was removed, but the entry is still referenced from the
    /// dirty map (if one exists) and may be revived by a store.
    Deleted,
    /// The key was removed and the entry was left out of the dirty map.
    Expunged,
}

impl<V> Slot<V> {
    #[inline]
    fn value(&self) -> Option<&V> {
        match self {
            Slot::Valid(v) => Some(v),
            Slot::Deleted | Slot::Expunged => None,
        }
    }

    #[inline]
    fn is_expunged(&self) -> bool {
        matches!(self, Slot::Expunged)
    }
}

pub(crate) struct Entry<V> {
    p: Atomic<Slot<V>>,
}

impl<V> Entry<V> {
    pub(crate) fn new(value: V) -> Self {
        Entry {
            p: Atomic::new(Slot::Valid(value)),
        }
    }

    #[inline]
    fn current<'a>(&'a self, guard: &'a Guard) -> Shared<'a, Slot<V>> {
        self.p.load(Acquire, guard)
    }

    /// Read the live value, if any.
    pub(crate) fn load<'a>(&'a self, guard: &'a Guard) -> Option<&'a V> {
        // The pointer is never null: every entry is built with a slot and
        // transitions only ever swap one slot for another.
        unsafe { self.current(guard).deref() }.value()
    }
}

impl<V> From<Owned<Slot<V>>> for Entry<V> {
    fn from(slot: Owned<Slot<V>>) -> Self {
        Entry {
            p: Atomic::from(slot),
        }
    }
}

impl<V> Entry<V>
where
    V: Send + Sync + 'static,
{
    /// Hand a replaced slot to the collector, returning the value it held.
    ///
    /// # Safety
    /// `prev` must have just been unlinked from this entry: the result of a
    /// `swap`, or the `current` argument of a successful `compare_exchange`
    /// (whose `Ok` is the pointer written, not the one replaced).
    #[inline]
    unsafe fn retire<'a>(prev: Shared<'a, Slot<V>>, guard: &'a Guard) -> Option<&'a V> {
        let value = prev.deref().value();
        guard.defer_destroy(prev);
        value
    }

    /// Unconditionally install `new` unless the entry is expunged, in which
    /// case the slot is handed back so the caller can retry under the lock.
    pub(crate) fn try_swap<'a>(
        &'a self,
        mut new: Owned<Slot<V>>,
        guard: &'a Guard,
    ) -> Result<Option<&'a V>, Owned<Slot<V>>> {
        let mut cur = self.current(guard);
        loop {
            if unsafe { cur.deref() }.is_expunged() {
                return Err(new);
            }
            match self.p.compare_exchange(cur, new, AcqRel, Acquire, guard) {
                // Ok carries the slot we wrote, cur is the one unlinked.
                Ok(_) => return Ok(unsafe { Self::retire(cur, guard) }),
                Err(e) => {
                    cur = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Return the live value, or install `value` if the entry is deleted.
    ///
    /// `Ok((v, true))` is an existing value, `Ok((v, false))` means `value`
    /// was stored. The value is handed back in `Err` when the entry is
    /// expunged.
    pub(crate) fn try_load_or_store(&self, value: V, guard: &Guard) -> Result<(V, bool), V>
    where
        V: Clone,
    {
        let mut cur = self.current(guard);
        let mut pending: Option<Owned<Slot<V>>> = None;
        loop {
            match unsafe { cur.deref() } {
                Slot::Valid(v) => return Ok((v.clone(), true)),
                Slot::Expunged => return Err(value),
                Slot::Deleted => {}
            }
            let new = pending.take().unwrap_or_else(|| Owned::new(Slot::Valid(value.clone())));
            match self.p.compare_exchange(cur, new, AcqRel, Acquire, guard) {
                Ok(_) => {
                    // Deleted carries no value, nothing to hand back.
                    unsafe { Self::retire(cur, guard) };
                    return Ok((value, false));
                }
                Err(e) => {
                    cur = e.current;
                    pending = Some(e.new);
                }
            }
        }
    }

    /// Mark a live entry as deleted, returning the removed value.
    pub(crate) fn delete<'a>(&'a self, guard: &'a Guard) -> Option<&'a V> {
        let mut cur = self.current(guard);
        let mut tombstone: Option<Owned<Slot<V>>> = None;
        loop {
            if unsafe { cur.deref() }.value().is_none() {
                return None;
            }
            let new = tombstone.take().unwrap_or_else(|| Owned::new(Slot::Deleted));
            match self.p.compare_exchange(cur, new, AcqRel, Acquire, guard) {
                Ok(_) => return unsafe { Self::retire(cur, guard) },
                Err(e) => {
                    cur = e.current;
                    tombstone = Some(e.new);
                }
            }
        }
    }

    #[inline]
    fn holds(cur: Shared<'_, Slot<V>>, old: &V) -> bool
    where
        V: PartialEq,
    {
        unsafe { cur.deref() }.value() == Some(old)
    }

    /// Replace the value only if it currently equals `old`.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.compare_and_install(old, Slot::Valid(new), guard)
    }

    /// Delete the entry only if its value currently equals `old`.
    pub(crate) fn compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.compare_and_install(old, Slot::Deleted, guard)
    }

    fn compare_and_install(&self, old: &V, slot: Slot<V>, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut cur = self.current(guard);
        if !Self::holds(cur, old) {
            return false;
        }
        let mut new = Owned::new(slot);
        loop {
            match self.p.compare_exchange(cur, new, AcqRel, Acquire, guard) {
                Ok(_) => {
                    unsafe { Self::retire(cur, guard) };
                    return true;
                }
                Err(e) => {
                    if !Self::holds(e.current, old) {
                        return false;
                    }
                    cur = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Store `new` into an entry the caller knows is not expunged.
    ///
    /// Must be called with the dirty map lock held.
    pub(crate) fn swap_locked<'a>(&'a self, new: Owned<Slot<V>>, guard: &'a Guard) -> Option<&'a V> {
        let prev = self.p.swap(new, AcqRel, guard);
        unsafe { Self::retire(prev, guard) }
    }

    /// Move an expunged entry back to deleted. Returns true if the entry was
    /// expunged, in which case the caller must put it back in the dirty map
    /// before releasing the lock.
    ///
    /// Must be called with the dirty map lock held.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        let cur = self.current(guard);
        if !unsafe { cur.deref() }.is_expunged() {
            return false;
        }
        match self
            .p
            .compare_exchange(cur, Owned::new(Slot::Deleted), AcqRel, Acquire, guard)
        {
            Ok(_) => {
                unsafe { Self::retire(cur, guard) };
                true
            }
            Err(_) => false,
        }
    }

    /// Move a deleted entry to expunged. Returns true if the entry is
    /// expunged afterwards and so must be left out of a new dirty map.
    ///
    /// Must be called with the dirty map lock held.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut cur = self.current(guard);
        let mut marker: Option<Owned<Slot<V>>> = None;
        loop {
            match unsafe { cur.deref() } {
                Slot::Valid(_) => return false,
                Slot::Expunged => return true,
                Slot::Deleted => {}
            }
            let new = marker.take().unwrap_or_else(|| Owned::new(Slot::Expunged));
            match self.p.compare_exchange(cur, new, AcqRel, Acquire, guard) {
                Ok(_) => {
                    unsafe { Self::retire(cur, guard) };
                    return true;
                }
                Err(e) => {
                    cur = e.current;
                    marker = Some(e.new);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_expunged(&self) -> bool {
        let guard = &epoch::pin();
        unsafe { self.current(guard).deref() }.is_expunged()
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // Every reference into a slot is bounded by a borrow of the entry,
        // so with &mut self nothing can still be reading the current one.
        unsafe {
            let cur = self.p.load(Relaxed, epoch::unprotected());
            drop(cur.into_owned());
        }
    }
}
