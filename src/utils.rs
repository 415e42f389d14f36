#[cfg(feature = "serde")]
use std::collections::HashMap;
#[cfg(feature = "serde")]
use std::fmt;
#[cfg(feature = "serde")]
use std::hash::{BuildHasher, Hash};
#[cfg(feature = "serde")]
use std::marker::PhantomData;
#[cfg(feature = "serde")]
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::de::{Deserialize, MapAccess, Visitor};

#[cfg(feature = "serde")]
use crate::internals::entry::Entry;
#[cfg(feature = "serde")]
use crate::internals::snapshot::ReadOnly;
#[cfg(feature = "serde")]
use crate::SyncMap;

#[cfg(feature = "serde")]
const MAX_PREALLOC: usize = 4096;

/// The hasher used by a [`SyncMap`](crate::SyncMap) when none is given.
///
/// Selected by crate feature: `ahash` wins over `foldhash`, and without
/// either the std `RandomState` is used.
#[cfg(feature = "ahash")]
pub type DefaultHashBuilder = ahash::RandomState;

/// The hasher used by a [`SyncMap`](crate::SyncMap) when none is given.
///
/// Selected by crate feature: `ahash` wins over `foldhash`, and without
/// either the std `RandomState` is used.
#[cfg(all(feature = "foldhash", not(feature = "ahash")))]
pub type DefaultHashBuilder = foldhash::fast::RandomState;

/// The hasher used by a [`SyncMap`](crate::SyncMap) when none is given.
///
/// Selected by crate feature: `ahash` wins over `foldhash`, and without
/// either the std `RandomState` is used.
#[cfg(all(not(feature = "ahash"), not(feature = "foldhash")))]
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;

/// Deserializes a map straight into the read snapshot of a new
/// [`SyncMap`], so the result serves every key without locking.
#[cfg(feature = "serde")]
pub(crate) struct SnapshotVisitor<K, V, S>(PhantomData<(K, V, S)>);

#[cfg(feature = "serde")]
impl<K, V, S> SnapshotVisitor<K, V, S> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

#[cfg(feature = "serde")]
impl<'de, K, V, S> Visitor<'de> for SnapshotVisitor<K, V, S>
where
    K: Deserialize<'de> + Hash + Eq + Clone + Send + Sync + 'static,
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    type Value = SyncMap<K, V, S>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of keys to values")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let build_hasher = S::default();
        // The hint comes from the input, cap it.
        let capacity = access.size_hint().unwrap_or(0).min(MAX_PREALLOC);
        let mut m = HashMap::with_capacity_and_hasher(capacity, build_hasher.clone());
        while let Some((k, v)) = access.next_entry()? {
            m.insert(k, Arc::new(Entry::new(v)));
        }
        Ok(SyncMap::from_snapshot(ReadOnly::complete(m), build_hasher))
    }
}
