//! # Adapter Configuration
//!
//! Chip profiles and the runtime tunables of the core. Everything that is
//! a compile-time limit lives in [`crate::defs`]; everything an integrator
//! may want to change per adapter lives here.

use crate::defs::{MAX_TAG, MAX_TASK};
use bitflags::bitflags;
use sym_hal::DmaConstraints;

bitflags! {
    /// Chip capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChipFeatures: u32 {
        /// 16-bit SCSI bus
        const WIDE   = 1 << 0;
        /// Fast-20 capable
        const ULTRA  = 1 << 1;
        /// Fast-40 capable
        const ULTRA2 = 1 << 2;
        /// Fast-80 (double transition) capable
        const ULTRA3 = 1 << 3;
        /// SCSI clock doubler
        const DBLR   = 1 << 4;
        /// SCSI clock quadrupler
        const QUAD   = 1 << 5;
        /// 80 MHz base clock
        const CLK80  = 1 << 6;
        /// 53C1010 family
        const C10    = 1 << 7;
        /// Working Ultra3 enable bit
        const U3EN   = 1 << 8;
        /// On-chip SCRIPTS RAM
        const RAM    = 1 << 9;
    }
}

/// Static description of one chip family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    /// Marketing name
    pub name: &'static str,
    /// Capability flags
    pub features: ChipFeatures,
    /// Largest synchronous offset in single transition mode
    pub max_offset: u8,
    /// Largest synchronous offset in double transition mode
    pub max_offset_dt: u8,
    /// Number of clock divisors
    pub clock_divn: u8,
    /// Whether the NVRAM sits on the 24C16 two-wire pins
    pub nvram_two_wire: bool,
}

impl ChipProfile {
    /// 53C810A: narrow Fast-10
    pub const SYM53C810A: Self = Self {
        name: "810a",
        features: ChipFeatures::RAM,
        max_offset: 8,
        max_offset_dt: 0,
        clock_divn: 4,
        nvram_two_wire: false,
    };

    /// 53C875: wide Ultra, clock doubler
    pub const SYM53C875: Self = Self {
        name: "875",
        features: ChipFeatures::WIDE
            .union(ChipFeatures::ULTRA)
            .union(ChipFeatures::DBLR)
            .union(ChipFeatures::RAM),
        max_offset: 16,
        max_offset_dt: 0,
        clock_divn: 5,
        nvram_two_wire: true,
    };

    /// 53C895: wide Ultra2, clock quadrupler
    pub const SYM53C895: Self = Self {
        name: "895",
        features: ChipFeatures::WIDE
            .union(ChipFeatures::ULTRA2)
            .union(ChipFeatures::QUAD)
            .union(ChipFeatures::RAM),
        max_offset: 31,
        max_offset_dt: 0,
        clock_divn: 7,
        nvram_two_wire: true,
    };

    /// 53C1010: wide Ultra3 with DT clocking
    pub const SYM53C1010: Self = Self {
        name: "1010",
        features: ChipFeatures::WIDE
            .union(ChipFeatures::ULTRA3)
            .union(ChipFeatures::QUAD)
            .union(ChipFeatures::C10)
            .union(ChipFeatures::U3EN)
            .union(ChipFeatures::RAM),
        max_offset: 31,
        max_offset_dt: 62,
        clock_divn: 7,
        nvram_two_wire: true,
    };
}

/// Where per-LUN concurrency is throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceQueueing {
    /// The core keeps waiting/started lists and feeds the start queue up to
    /// each LUN's depth
    Emulated,
    /// Commands beyond a LUN's depth bounce back to the caller as busy
    Chip,
}

/// Configuration for one adapter instance
#[derive(Debug, Clone)]
pub struct SymConfig {
    /// Chip family
    pub chip: ChipProfile,
    /// SCSI ID of the adapter, overridden by NVRAM
    pub host_id: u8,
    /// DMA addressing constraints of the adapter
    pub dma: DmaConstraints,
    /// Default tagged queue depth per LUN
    pub max_tag: u16,
    /// CCBs created at attach
    pub initial_ccbs: usize,
    /// Ceiling on CCBs grown on demand
    pub max_ccbs: usize,
    /// Per-LUN queue throttling mode
    pub device_queueing: DeviceQueueing,
    /// Tagged commands allowed ahead of the oldest outstanding one before
    /// an ordered tag is forced; zero disables the limiter
    pub reorder_window: u16,
    /// Good completions before a LUN shrunk by QUEUE FULL grows again
    pub queue_full_recover: u16,
    /// QUEUE FULL bounces tolerated per command before it is failed
    pub queue_full_retries: u8,
    /// Command timeout when the request gives none, in ticks
    pub default_timeout_ticks: u32,
    /// Time an escalation level gets before the next one, in ticks
    pub recovery_timeout_ticks: u32,
    /// Consecutive unexpected disconnects before a target reset
    pub busfree_threshold: u16,
    /// Accumulated parity errors before a bus reset
    pub parity_threshold: u16,
    /// Check parity on the SCSI bus, overridden by NVRAM
    pub parity: bool,
    /// Skip the SCSI bus reset at attach, overridden by NVRAM
    pub avoid_bus_reset: bool,
    /// Release DMA clusters as soon as they become free
    pub release_unused_memory: bool,
}

impl SymConfig {
    /// Default tagged queue depth
    pub const DEFAULT_MAX_TAG: u16 = 16;
    /// Default command timeout: 30 s at 10 ticks per second
    pub const DEFAULT_TIMEOUT_TICKS: u32 = 300;
    /// Default escalation step: 10 s at 10 ticks per second
    pub const RECOVERY_TIMEOUT_TICKS: u32 = 100;
    /// Default window of the reordering limiter
    pub const DEFAULT_REORDER_WINDOW: u16 = 2;

    /// Create the default configuration for a chip
    pub fn new(chip: ChipProfile) -> Self {
        Self {
            chip,
            host_id: 7,
            dma: DmaConstraints::BITS_32,
            max_tag: Self::DEFAULT_MAX_TAG,
            initial_ccbs: 8,
            max_ccbs: crate::defs::MAX_START,
            device_queueing: DeviceQueueing::Emulated,
            reorder_window: Self::DEFAULT_REORDER_WINDOW,
            queue_full_recover: 128,
            queue_full_retries: 8,
            default_timeout_ticks: Self::DEFAULT_TIMEOUT_TICKS,
            recovery_timeout_ticks: Self::RECOVERY_TIMEOUT_TICKS,
            busfree_threshold: 3,
            parity_threshold: 8,
            parity: true,
            avoid_bus_reset: false,
            release_unused_memory: false,
        }
    }

    /// Defaults for a 53C810A
    pub fn sym53c810() -> Self {
        Self::new(ChipProfile::SYM53C810A)
    }

    /// Defaults for a 53C875
    pub fn sym53c875() -> Self {
        Self::new(ChipProfile::SYM53C875)
    }

    /// Defaults for a 53C895
    pub fn sym53c895() -> Self {
        Self::new(ChipProfile::SYM53C895)
    }

    /// Defaults for a 53C1010, the only family that runs double transition
    pub fn sym53c1010() -> Self {
        Self::new(ChipProfile::SYM53C1010)
    }

    /// Conservative settings for flaky buses: shallow queues, no reordering
    pub fn conservative(chip: ChipProfile) -> Self {
        Self {
            max_tag: 4,
            reorder_window: 1,
            busfree_threshold: 1,
            parity_threshold: 2,
            ..Self::new(chip)
        }
    }

    /// Throughput oriented settings: deep queues, limiter off
    pub fn throughput(chip: ChipProfile) -> Self {
        Self {
            max_tag: MAX_TAG as u16,
            reorder_window: 0,
            initial_ccbs: 64,
            ..Self::new(chip)
        }
    }

    /// Clamp every tunable into what the core supports
    pub fn sanitized(mut self) -> Self {
        self.max_tag = self.max_tag.clamp(1, MAX_TAG as u16);
        self.max_ccbs = self.max_ccbs.clamp(1, crate::defs::MAX_START);
        self.initial_ccbs = self.initial_ccbs.min(self.max_ccbs);
        self.reorder_window = self.reorder_window.min(MAX_TASK as u16);
        self.host_id &= 0x0f;
        if !self.chip.features.contains(ChipFeatures::WIDE) {
            self.host_id &= 0x07;
        }
        self.default_timeout_ticks = self.default_timeout_ticks.max(1);
        self.recovery_timeout_ticks = self.recovery_timeout_ticks.max(1);
        self
    }
}

impl Default for SymConfig {
    fn default() -> Self {
        Self::new(ChipProfile::SYM53C895)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps() {
        let mut cfg = SymConfig::new(ChipProfile::SYM53C810A);
        cfg.max_tag = 1000;
        cfg.host_id = 12;
        cfg.initial_ccbs = 10_000;
        let cfg = cfg.sanitized();
        assert_eq!(cfg.max_tag as usize, MAX_TAG);
        assert_eq!(cfg.host_id, 4);
        assert_eq!(cfg.initial_ccbs, cfg.max_ccbs);
    }

    #[test]
    fn test_presets() {
        assert_eq!(SymConfig::throughput(ChipProfile::SYM53C1010).reorder_window, 0);
        assert_eq!(SymConfig::conservative(ChipProfile::SYM53C875).max_tag, 4);
        assert!(ChipProfile::SYM53C1010.features.contains(ChipFeatures::ULTRA3 | ChipFeatures::U3EN));
        assert_eq!(SymConfig::sym53c810().chip, ChipProfile::SYM53C810A);
        assert_eq!(SymConfig::default().chip, SymConfig::sym53c895().chip);
    }
}
