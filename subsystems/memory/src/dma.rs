//! # DMA Memory Manager
//!
//! Front door of the memory subsystem. Keeps one [`DmaPool`] per DMA
//! constraint set, created on first use, all fed from a single platform
//! [`ClusterSource`]. Adapters sharing the same constraints share a pool.

use crate::pool::DmaPool;
use crate::{AllocatorStats, DmaBlock, MemError, MemResult};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use sym_hal::{BusAddr, ClusterSource, DmaConstraints, VirtAddr};

struct Inner {
    source: Box<dyn ClusterSource>,
    pools: Vec<DmaPool>,
}

impl Inner {
    fn pool_mut(&mut self, constraints: DmaConstraints) -> Option<&mut DmaPool> {
        self.pools.iter_mut().find(|p| p.constraints() == constraints)
    }
}

/// DMA memory manager
pub struct DmaMemory {
    inner: Mutex<Inner>,
    release_unused: bool,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
    failures: AtomicU64,
}

impl DmaMemory {
    /// Create a manager drawing clusters from `source`
    pub fn new(source: impl ClusterSource + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner { source: Box::new(source), pools: Vec::new() }),
            release_unused: false,
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Return clusters to the platform as soon as they become entirely free
    pub fn with_release_unused(mut self, release: bool) -> Self {
        self.release_unused = release;
        self
    }

    /// Allocate `size` bytes reachable under `constraints`
    ///
    /// `name` only shows up in trace logs.
    pub fn alloc(&self, constraints: DmaConstraints, size: usize, name: &str) -> MemResult<DmaBlock> {
        let mut inner = self.inner.lock();
        let Inner { source, pools } = &mut *inner;

        let index = match pools.iter().position(|p| p.constraints() == constraints) {
            Some(index) => index,
            None => {
                log::debug!("[dma] new pool for mask {:#x}", constraints.dma_mask);
                pools.push(DmaPool::new(constraints, self.release_unused));
                pools.len() - 1
            }
        };

        match pools[index].alloc(source.as_mut(), size) {
            Ok(block) => {
                self.alloc_count.fetch_add(1, Ordering::Relaxed);
                log::trace!("[dma] alloc {} {}@{:#x}", name, size, block.virt.as_u64());
                Ok(block)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("[dma] failed to allocate {} ({} bytes): {:?}", name, size, err);
                Err(err)
            }
        }
    }

    /// Free a block allocated under `constraints`
    pub fn free(&self, constraints: DmaConstraints, block: DmaBlock, name: &str) -> MemResult<()> {
        let mut inner = self.inner.lock();
        let Inner { source, pools } = &mut *inner;
        let pool = pools
            .iter_mut()
            .find(|p| p.constraints() == constraints)
            .ok_or(MemError::NotMapped)?;
        pool.free(source.as_mut(), block)?;
        self.free_count.fetch_add(1, Ordering::Relaxed);
        log::trace!("[dma] free {} {}@{:#x}", name, block.size, block.virt.as_u64());
        Ok(())
    }

    /// Translate a CPU address to the adapter's view
    ///
    /// # Panics
    ///
    /// Panics when no pool for `constraints` maps the address.
    pub fn virtual_to_bus(&self, constraints: DmaConstraints, virt: VirtAddr) -> BusAddr {
        let mut inner = self.inner.lock();
        match inner.pool_mut(constraints) {
            Some(pool) => pool.virtual_to_bus(virt),
            None => panic!("[dma] virtual_to_bus: no pool for mask {:#x}", constraints.dma_mask),
        }
    }

    /// Drop the pool for `constraints`, returning all its clusters
    pub fn destroy_pool(&self, constraints: DmaConstraints) {
        let mut inner = self.inner.lock();
        let Inner { source, pools } = &mut *inner;
        if let Some(index) = pools.iter().position(|p| p.constraints() == constraints) {
            let mut pool = pools.swap_remove(index);
            pool.release_all(source.as_mut());
            log::debug!("[dma] destroyed pool for mask {:#x}", constraints.dma_mask);
        }
    }

    /// Aggregate statistics over every pool
    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock();
        let mut stats = inner.pools.iter().map(DmaPool::stats).fold(AllocatorStats::default(), |acc, s| {
            AllocatorStats {
                allocations: acc.allocations + s.allocations,
                deallocations: acc.deallocations + s.deallocations,
                current_allocations: acc.current_allocations + s.current_allocations,
                clusters: acc.clusters + s.clusters,
                bytes_in_use: acc.bytes_in_use + s.bytes_in_use,
            }
        });
        stats.allocations = self.alloc_count.load(Ordering::Relaxed);
        stats.deallocations = self.free_count.load(Ordering::Relaxed);
        stats
    }

    /// Number of failed allocations since creation
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("release_unused", &self.release_unused)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::stubs::SimulatedClusters;

    #[test]
    fn test_pool_per_constraints() {
        let mem = DmaMemory::new(SimulatedClusters::default());
        let a = mem.alloc(DmaConstraints::BITS_32, 64, "a").unwrap();
        let b = mem.alloc(DmaConstraints::BITS_24, 64, "b").unwrap();
        // Different pools never share a cluster
        assert_ne!(a.virt.align_down(4096), b.virt.align_down(4096));
        assert_eq!(mem.stats().clusters, 2);
        assert_eq!(mem.virtual_to_bus(DmaConstraints::BITS_24, b.virt), b.bus);
    }

    #[test]
    fn test_free_unknown_pool() {
        let mem = DmaMemory::new(SimulatedClusters::default());
        let block = mem.alloc(DmaConstraints::BITS_32, 16, "x").unwrap();
        assert_eq!(mem.free(DmaConstraints::BITS_24, block, "x"), Err(MemError::NotMapped));
        assert!(mem.free(DmaConstraints::BITS_32, block, "x").is_ok());
        let stats = mem.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.current_allocations, 0);
    }

    #[test]
    fn test_destroy_pool_releases_clusters() {
        let mem = DmaMemory::new(SimulatedClusters::default());
        mem.alloc(DmaConstraints::BITS_32, 4096, "big").unwrap();
        mem.alloc(DmaConstraints::BITS_32, 4096, "big").unwrap();
        assert_eq!(mem.stats().clusters, 2);
        mem.destroy_pool(DmaConstraints::BITS_32);
        assert_eq!(mem.stats().clusters, 0);
    }

    #[test]
    fn test_failure_counted() {
        let mem = DmaMemory::new(SimulatedClusters::default().with_limit(0));
        assert_eq!(mem.alloc(DmaConstraints::BITS_32, 16, "x"), Err(MemError::OutOfMemory));
        assert_eq!(mem.failures(), 1);
    }
}
