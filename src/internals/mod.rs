//! This module contains the internals of the read/dirty map. Nothing here is
//! public. The entry cell and the snapshot cell are where the unsafe code
//! lives: every pointer they hand out is bounded by an epoch guard, and
//! getting that wrong is a use after free.

pub(crate) mod entry;
pub(crate) mod snapshot;
