//! # SYM HAL - Platform Boundary
//!
//! This crate defines the traits and address types through which the
//! SYM53C8XX core talks to its platform. The core never touches hardware
//! directly; everything it needs from the outside world goes through here.
//!
//! ## Boundaries
//!
//! - [`dma::ClusterSource`]: hands out DMA-capable clusters together with
//!   the bus address the adapter must use to reach them
//! - [`gpio::NvramLines`]: the raw serial EEPROM lines wired to the
//!   adapter's general purpose I/O pins
//!
//! Software models of both boundaries live in [`stubs`]; they back the
//! test suites and board bring-up without real hardware.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod dma;
pub mod gpio;
pub mod stubs;

pub use dma::{ClusterSource, DmaConstraints, CLUSTER_SHIFT, CLUSTER_SIZE};
pub use gpio::{Level, Line, NvramLines};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported by this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// Hardware reported an error
    HardwareError,
    /// Operation timed out
    Timeout,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// No more DMA-capable memory
    OutOfMemory,
}

/// Virtual address type, as seen by the host CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// Offset of this address inside its enclosing `align` sized block
    #[inline]
    pub const fn offset_in(self, align: u64) -> u64 {
        self.0 & (align - 1)
    }
}

/// Bus address type, as seen by the adapter's DMA engine
///
/// May differ from the physical address when an IOMMU or a bridge window
/// sits between the adapter and system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddr(u32);

impl BusAddr {
    /// The null bus address, used as the "empty slot" marker in queues
    pub const NULL: Self = Self(0);

    /// Create a new bus address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check for the null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add an offset to the address
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }
}

impl core::fmt::Display for BusAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
