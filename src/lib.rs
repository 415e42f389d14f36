//! SyncMap - A concurrently readable map for read-mostly workloads
//!
//! Many programs share a map between threads where nearly every access is a
//! read, or where keys are written once and then read forever after. A
//! `Mutex<HashMap>` serialises all of those reads, and even a `RwLock`
//! makes every reader write to the same lock word, which stops scaling
//! quickly as cores are added.
//!
//! [`SyncMap`] splits the map in two. An immutable read snapshot is loaded
//! through an epoch protected pointer and serves known keys without any
//! lock. A mutex protected dirty map absorbs new keys, and is promoted to
//! become the next snapshot once enough lookups have had to fall back to
//! it. Values of known keys are updated in place with compare and swap.
//!
//! This works best when:
//!
//! * the key set is stable, or only grows rarely
//! * threads read, write and overwrite disjoint sets of keys
//!
//! If you insert new keys constantly, a sharded or lock free hash table
//! will serve you better.
//!
//! # Features
//!
//! * `foldhash` - use the foldhash crate for the default hasher (default)
//! * `ahash` - use the cpu accelerated ahash crate for the default hasher
//! * `serde` - serialise and deserialise a `SyncMap` as a map

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

// This is where the scary rust lives.
mod internals;
// This is where the gud rust lives.
mod utils;

pub mod syncmap;

pub use syncmap::{SyncMap, SyncMapStats};
pub use utils::DefaultHashBuilder;
