//! # SYM Memory Subsystem
//!
//! DMA-capable memory for the host adapter core:
//! - A power-of-two buddy suballocator carving 16 byte to one cluster
//!   blocks out of platform clusters
//! - Per DMA-constraint pools with virtual to bus address translation
//!
//! Everything the adapter's co-processor reads or writes (CCB chip areas,
//! start and done queues, LUN tables) lives in memory handed out here.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod buddy;
pub mod dma;
pub mod pool;

pub use buddy::{BuddyArena, MEMO_SHIFT, MEMO_CLASSES};
pub use dma::DmaMemory;
pub use pool::DmaPool;

use sym_hal::{BusAddr, VirtAddr};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No cluster could be obtained from the platform
    OutOfMemory,
    /// Zero sized request, or larger than one cluster
    InvalidSize,
    /// Block being freed was never handed out, or is already free
    InvalidAddress,
    /// No pool exists for the given constraints
    NotMapped,
}

/// A block of DMA memory
///
/// Carries both views of the same bytes. The size is the requested size;
/// the block occupies the power-of-two class that size rounds up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaBlock {
    /// Address used by the CPU
    pub virt: VirtAddr,
    /// Address used by the adapter
    pub bus: BusAddr,
    /// Requested size in bytes
    pub size: usize,
}

impl DmaBlock {
    /// Bus address of a byte inside the block
    pub fn bus_at(&self, offset: usize) -> BusAddr {
        debug_assert!(offset < self.size);
        self.bus.add(offset as u32)
    }

    /// Whether two blocks share any byte
    pub fn overlaps(&self, other: &DmaBlock) -> bool {
        let a = self.virt.as_u64();
        let b = other.virt.as_u64();
        a < b + other.size as u64 && b < a + self.size as u64
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    /// Total successful allocations
    pub allocations: u64,
    /// Total frees
    pub deallocations: u64,
    /// Blocks currently live
    pub current_allocations: u64,
    /// Clusters currently held from the platform
    pub clusters: u64,
    /// Bytes currently handed out, by class size
    pub bytes_in_use: u64,
}
