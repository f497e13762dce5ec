//! Capability shared by every purgeable cache layer.

/// A cache that the invalidation router can purge.
///
/// Implemented by [`QueryCache`](crate::QueryCache). Legacy caches that
/// still coexist with the layered cache are plugged in through this trait
/// as an optional layer, so their absence is a `None` rather than a
/// runtime type check.
pub trait CacheLayer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Drop one key. Absent keys are ignored.
    fn invalidate(&self, key: &str);

    /// Drop every key starting with `prefix`, returning how many were
    /// removed.
    fn invalidate_prefix(&self, prefix: &str) -> usize;

    /// Drop everything.
    fn clear(&self);
}
