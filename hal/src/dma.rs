//! # DMA Cluster Boundary
//!
//! The memory subsystem carves small DMA blocks out of fixed size
//! "clusters" obtained from the platform. A cluster is one page of memory
//! the adapter can reach, returned as a pair of addresses: the one the CPU
//! uses and the one the adapter uses.

use crate::{BusAddr, HalResult, VirtAddr};
use static_assertions::const_assert;

/// log2 of the cluster size
pub const CLUSTER_SHIFT: u32 = 12;

/// Size of one DMA cluster in bytes (one platform page)
pub const CLUSTER_SIZE: u64 = 1 << CLUSTER_SHIFT;

const_assert!(CLUSTER_SIZE.is_power_of_two());
const_assert!(CLUSTER_SIZE <= u32::MAX as u64);

/// DMA addressing constraints of a device
///
/// Memory handed to a device must be reachable within its DMA mask. Pools
/// are kept per constraint set, so two adapters with the same mask share
/// one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaConstraints {
    /// Highest bus address bit pattern the device can generate
    pub dma_mask: u64,
}

impl DmaConstraints {
    /// 32-bit addressing, what SCRIPTS and the queues require
    pub const BITS_32: Self = Self::new(0xffff_ffff);

    /// 24-bit ISA style addressing
    pub const BITS_24: Self = Self::new(0x00ff_ffff);

    /// Create constraints from a DMA mask
    pub const fn new(dma_mask: u64) -> Self {
        Self { dma_mask }
    }

    /// Check whether a bus address range is reachable under this mask
    pub const fn reaches(&self, bus: BusAddr, len: u64) -> bool {
        let end = bus.as_u32() as u64 + len.saturating_sub(1);
        end & !self.dma_mask == 0
    }
}

impl Default for DmaConstraints {
    fn default() -> Self {
        Self::BITS_32
    }
}

/// Platform page allocator for DMA-capable memory
///
/// Implementations must return cluster aligned virtual addresses. The bus
/// address of byte `n` of a cluster is `bus + n`.
pub trait ClusterSource: Send {
    /// Obtain one cluster satisfying the given constraints
    fn get_cluster(&mut self, constraints: DmaConstraints) -> HalResult<(VirtAddr, BusAddr)>;

    /// Give a cluster back to the platform
    fn put_cluster(&mut self, virt: VirtAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_mask_reach() {
        let isa = DmaConstraints::BITS_24;
        assert!(isa.reaches(BusAddr::new(0x00ff_f000), CLUSTER_SIZE));
        assert!(!isa.reaches(BusAddr::new(0x0100_0000), CLUSTER_SIZE));
        assert!(DmaConstraints::BITS_32.reaches(BusAddr::new(0xffff_f000), CLUSTER_SIZE));
    }
}
