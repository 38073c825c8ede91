//! Generic Cleanup Interface
//!
//! Components that hold reclaimable memory (buffers, caches, idle backlog)
//! implement this so the memory manager can ask them to shrink without knowing
//! their internals.

/// Generic trait for cleanup operations
pub trait Cleanup: Send + Sync {
    /// Release whatever can be released right now
    fn cleanup(&self);

    /// Name used in diagnostics
    fn cleanup_name(&self) -> &str {
        "anonymous"
    }
}
