/// Counters describing how often a [`SyncMap`](crate::SyncMap) has had to
/// fall back to its lock.
///
/// Only the locked path updates these. Loads and stores of keys already in
/// the read snapshot never touch them, so a counter that stops moving under
/// a steady workload shows the map has settled into its lock free state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMapStats {
    /// Operations that acquired the dirty map lock.
    pub locked_ops: u64,
    /// Snapshot misses recorded since the last promotion.
    pub misses: usize,
    /// Times the dirty map was promoted to be the read snapshot.
    pub promotions: u64,
    /// Times a dirty map was rebuilt by copying the read snapshot.
    pub dirty_rebuilds: u64,
}
