//! # DMA Pools
//!
//! One pool per set of DMA addressing constraints. A pool owns a buddy
//! arena and the table translating every cluster it holds from its virtual
//! base to its bus base.

use crate::buddy::{BuddyArena, Freed};
use crate::{AllocatorStats, DmaBlock, MemError, MemResult};
use hashbrown::HashMap;
use sym_hal::{BusAddr, ClusterSource, DmaConstraints, VirtAddr, CLUSTER_SIZE};

/// DMA memory pool for one constraint set
#[derive(Debug)]
pub struct DmaPool {
    constraints: DmaConstraints,
    arena: BuddyArena,
    /// Virtual cluster base to bus cluster base
    vtob: HashMap<u64, BusAddr>,
    /// Live blocks and the size they were allocated with
    live: HashMap<u64, usize>,
    allocations: u64,
    deallocations: u64,
    bytes_in_use: u64,
}

impl DmaPool {
    /// Create an empty pool
    pub fn new(constraints: DmaConstraints, release_unused: bool) -> Self {
        Self {
            constraints,
            arena: BuddyArena::new(release_unused),
            vtob: HashMap::new(),
            live: HashMap::new(),
            allocations: 0,
            deallocations: 0,
            bytes_in_use: 0,
        }
    }

    /// Constraints this pool serves
    pub fn constraints(&self) -> DmaConstraints {
        self.constraints
    }

    /// Allocate a block of at least `size` bytes
    pub fn alloc(&mut self, source: &mut dyn ClusterSource, size: usize) -> MemResult<DmaBlock> {
        let constraints = self.constraints;
        let vtob = &mut self.vtob;
        let virt = self.arena.alloc(size, || {
            let (virt, bus) = source
                .get_cluster(constraints)
                .map_err(|_| MemError::OutOfMemory)?;
            if !virt.is_aligned(CLUSTER_SIZE) {
                log::error!("[dma] platform returned unaligned cluster {:#x}", virt.as_u64());
                source.put_cluster(virt);
                return Err(MemError::OutOfMemory);
            }
            vtob.insert(virt.as_u64(), bus);
            log::trace!("[dma] new cluster {:#x} -> {}", virt.as_u64(), bus);
            Ok(virt.as_u64())
        })?;

        self.live.insert(virt, size);
        self.allocations += 1;
        self.bytes_in_use += BuddyArena::class_size(BuddyArena::class_of(size).unwrap_or(0));

        let virt = VirtAddr::new(virt);
        Ok(DmaBlock { virt, bus: self.virtual_to_bus(virt), size })
    }

    /// Free a block previously returned by [`DmaPool::alloc`]
    pub fn free(&mut self, source: &mut dyn ClusterSource, block: DmaBlock) -> MemResult<()> {
        let addr = block.virt.as_u64();
        match self.live.get(&addr) {
            Some(&size) if size == block.size => {}
            _ => return Err(MemError::InvalidAddress),
        }

        let freed = self.arena.free(addr, block.size)?;
        self.live.remove(&addr);
        self.deallocations += 1;
        self.bytes_in_use -= BuddyArena::class_size(BuddyArena::class_of(block.size).unwrap_or(0));

        if let Freed::Cluster(cluster) = freed {
            self.vtob.remove(&cluster);
            source.put_cluster(VirtAddr::new(cluster));
            log::trace!("[dma] released cluster {:#x}", cluster);
        }
        Ok(())
    }

    /// Translate a CPU address inside this pool to the adapter's view
    ///
    /// # Panics
    ///
    /// Panics when the address does not belong to a cluster of this pool.
    /// Handing the adapter an untranslatable address is a driver bug.
    pub fn virtual_to_bus(&self, virt: VirtAddr) -> BusAddr {
        match self.try_virtual_to_bus(virt) {
            Some(bus) => bus,
            None => panic!("[dma] virtual_to_bus: no mapping for {:#x}", virt.as_u64()),
        }
    }

    /// Translate without panicking
    pub fn try_virtual_to_bus(&self, virt: VirtAddr) -> Option<BusAddr> {
        let base = virt.align_down(CLUSTER_SIZE);
        self.vtob
            .get(&base.as_u64())
            .map(|bus| bus.add(virt.offset_in(CLUSTER_SIZE) as u32))
    }

    /// Whether the pool holds no live block
    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    /// Give every whole free cluster back to the platform
    pub fn trim(&mut self, source: &mut dyn ClusterSource) -> usize {
        let clusters = self.arena.drain_free_clusters();
        for &cluster in &clusters {
            self.vtob.remove(&cluster);
            source.put_cluster(VirtAddr::new(cluster));
        }
        clusters.len()
    }

    /// Release every cluster, live or not
    pub fn release_all(&mut self, source: &mut dyn ClusterSource) {
        if !self.live.is_empty() {
            log::warn!("[dma] releasing pool with {} live blocks", self.live.len());
        }
        for (&virt, _) in self.vtob.iter() {
            source.put_cluster(VirtAddr::new(virt));
        }
        self.vtob.clear();
        self.live.clear();
        self.arena.clear();
        self.bytes_in_use = 0;
    }

    /// Pool statistics
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations,
            deallocations: self.deallocations,
            current_allocations: self.live.len() as u64,
            clusters: self.vtob.len() as u64,
            bytes_in_use: self.bytes_in_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use sym_hal::stubs::SimulatedClusters;

    #[test]
    fn test_translation_follows_cluster() {
        let mut src = SimulatedClusters::new(0x4000_0000, 0x0080_0000);
        let mut pool = DmaPool::new(DmaConstraints::BITS_32, false);
        let a = pool.alloc(&mut src, 48).unwrap();
        assert_eq!(a.virt.as_u64(), 0x4000_0000);
        assert_eq!(a.bus, BusAddr::new(0x0080_0000));
        let b = pool.alloc(&mut src, 48).unwrap();
        assert_eq!(b.bus.as_u32() - a.bus.as_u32(), (b.virt.as_u64() - a.virt.as_u64()) as u32);
        assert_eq!(pool.virtual_to_bus(b.virt.add(5)), b.bus.add(5));
    }

    #[test]
    #[should_panic(expected = "no mapping")]
    fn test_unmapped_translation_panics() {
        let pool = DmaPool::new(DmaConstraints::BITS_32, false);
        pool.virtual_to_bus(VirtAddr::new(0xdead_0000));
    }

    #[test]
    fn test_no_overlap_and_stable_translation() {
        let mut src = SimulatedClusters::default();
        let mut pool = DmaPool::new(DmaConstraints::BITS_32, false);
        let sizes = [16usize, 200, 33, 4096, 64, 1000, 17, 512, 8, 2048, 100, 300];
        let mut live: Vec<DmaBlock> = Vec::new();

        for (round, &size) in sizes.iter().cycle().take(60).enumerate() {
            let block = pool.alloc(&mut src, size).unwrap();
            for other in &live {
                assert!(!block.overlaps(other), "{:?} overlaps {:?}", block, other);
            }
            live.push(block);
            if round % 3 == 2 {
                let victim = live.remove(round % live.len());
                assert_eq!(pool.virtual_to_bus(victim.virt), victim.bus);
                pool.free(&mut src, victim).unwrap();
            }
            for block in &live {
                assert_eq!(pool.virtual_to_bus(block.virt), block.bus);
            }
        }

        for block in live.drain(..) {
            pool.free(&mut src, block).unwrap();
        }
        assert!(pool.is_idle());
        let held = pool.stats().clusters;
        assert_eq!(pool.trim(&mut src) as u64, held);
        assert_eq!(src.outstanding(), 0);
    }

    #[test]
    fn test_free_wrong_size_rejected() {
        let mut src = SimulatedClusters::default();
        let mut pool = DmaPool::new(DmaConstraints::BITS_32, false);
        let block = pool.alloc(&mut src, 64).unwrap();
        let wrong = DmaBlock { size: 32, ..block };
        assert_eq!(pool.free(&mut src, wrong), Err(MemError::InvalidAddress));
        pool.free(&mut src, block).unwrap();
        assert_eq!(pool.free(&mut src, block), Err(MemError::InvalidAddress));
    }

    #[test]
    fn test_eager_release() {
        let mut src = SimulatedClusters::default();
        let mut pool = DmaPool::new(DmaConstraints::BITS_32, true);
        let block = pool.alloc(&mut src, 128).unwrap();
        assert_eq!(src.outstanding(), 1);
        pool.free(&mut src, block).unwrap();
        assert_eq!(src.outstanding(), 0);
        assert!(pool.try_virtual_to_bus(block.virt).is_none());
    }

    #[test]
    fn test_out_of_clusters() {
        let mut src = SimulatedClusters::default().with_limit(1);
        let mut pool = DmaPool::new(DmaConstraints::BITS_32, false);
        pool.alloc(&mut src, 4096).unwrap();
        assert_eq!(pool.alloc(&mut src, 16), Err(MemError::OutOfMemory));
    }
}
