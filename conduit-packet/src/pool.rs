//! Packet allocation accounting.
//!
//! The real capture stage owns buffer memory; conduit only needs to know when the
//! last holder of a packet lets go. `PacketPool` counts both ends so a pipeline (or a
//! test) can check that nothing leaked and nothing was freed twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::packet::PacketBuilder;

#[derive(Debug, Default)]
struct PoolStats {
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Shared allocation counters for packets built from this pool.
///
/// Cloning creates a new handle to the same counters.
#[derive(Debug, Clone, Default)]
pub struct PacketPool {
    stats: Arc<PoolStats>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a packet whose final release is reported to this pool.
    pub fn builder(&self, data: Vec<u8>) -> PacketBuilder {
        PacketBuilder::new(data).with_pool(self.clone())
    }

    /// Number of packets built from this pool.
    pub fn allocated(&self) -> u64 {
        self.stats.allocated.load(Ordering::SeqCst)
    }

    /// Number of packets whose last holder has released them.
    pub fn released(&self) -> u64 {
        self.stats.released.load(Ordering::SeqCst)
    }

    /// Packets still held somewhere in the pipeline.
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.released())
    }

    pub(crate) fn on_allocate(&self) {
        self.stats.allocated.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn on_release(&self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_starts_empty() {
        let pool = PacketPool::new();
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.released(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pool_counts_build_and_release() {
        let pool = PacketPool::new();
        let packet = pool.builder(vec![0u8; 60]).build().expect("build");
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.outstanding(), 1);

        assert!(packet.release());
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pool_clone_shares_counters() {
        let pool = PacketPool::new();
        let handle = pool.clone();
        let packet = handle.builder(vec![1, 2, 3]).build().expect("build");
        assert_eq!(pool.outstanding(), 1);
        packet.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_failed_build_does_not_allocate() {
        let pool = PacketPool::new();
        let result = pool.builder(vec![0u8; 10]).with_network_offset(64).build();
        assert!(result.is_err());
        assert_eq!(pool.allocated(), 0);
    }
}
