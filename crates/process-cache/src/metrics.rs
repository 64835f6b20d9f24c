//! Counter names published by the cache.
//!
//! Counters go through the [`metrics`] facade; the embedding agent decides
//! on a recorder. Without one installed every publish is a no-op.

/// Map-drop counter bumped when the LRU evicts an entry on overflow.
pub const MAP_DROP_PROCESS_LRU: &str = "processLru";

/// `get` on an absent exec id.
pub const ERROR_MISS_ON_GET: &str = "ProcessCacheMissOnGet";
/// `remove` on an absent exec id. Expected under the color/sweep races.
pub const ERROR_MISS_ON_REMOVE: &str = "ProcessCacheMissOnRemove";
/// An insert pushed the cache over capacity.
pub const ERROR_EVICTED: &str = "ProcessCacheEvicted";

/// Records reclaimed by the stale sweep instead of the color machine.
pub const REMOVED_STALE: &str = "ProcessCacheRemovedStale";

pub(crate) fn counter_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}
