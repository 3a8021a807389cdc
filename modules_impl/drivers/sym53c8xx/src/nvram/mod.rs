//! # NVRAM
//!
//! Boot-time defaults stored by the adapter BIOS in a serial EEPROM. Two
//! layouts exist in the field: the Symbios one on 24C16 parts and the
//! Tekram one on 93C46 parts (or on a 24C16 for the newer Tekram boards).
//! The bit-level protocols are in [`two_wire`] and [`three_wire`]; this
//! module picks a layout and turns it into [`NvramSettings`].

pub mod symbios;
pub mod tekram;
pub mod three_wire;
pub mod two_wire;

use crate::config::{ChipProfile, SymConfig};
use crate::defs::{MAX_TAG, MAX_TARGET};
use crate::lcb::UnitFlags;
use crate::tcb::Transfer;
use core::fmt;
use sym_hal::NvramLines;

pub use two_wire::read_block;

/// Result type for NVRAM reads
pub type NvramResult<T> = Result<T, NvramError>;

/// NVRAM read or decode error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvramError {
    /// Two-wire part did not acknowledge a byte
    NoAcknowledge,
    /// Three-wire part did not answer with the dummy zero
    NoDevice,
    /// Transfer stopped before all data was read
    Incomplete,
    /// Header, length or trailer do not match the layout
    BadLayout,
    /// Checksum mismatch
    BadChecksum,
}

impl fmt::Display for NvramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvramError::NoAcknowledge => write!(f, "no acknowledge"),
            NvramError::NoDevice => write!(f, "no device"),
            NvramError::Incomplete => write!(f, "incomplete transfer"),
            NvramError::BadLayout => write!(f, "bad layout"),
            NvramError::BadChecksum => write!(f, "bad checksum"),
        }
    }
}

/// NVRAM layout that was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvramKind {
    /// Symbios block on a 24C16
    Symbios,
    /// Tekram block
    Tekram,
}

/// Adapter-wide defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSettings {
    /// SCSI ID of the adapter
    pub host_id: u8,
    /// Check SCSI bus parity
    pub parity: bool,
    /// Chatty boot messages
    pub verbose: bool,
    /// Scan targets from the highest ID down
    pub scan_hi_lo: bool,
    /// Do not reset the SCSI bus at attach
    pub avoid_bus_reset: bool,
}

/// Per-target defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSettings {
    /// Unit flags applied to every LUN of the target
    pub flags: UnitFlags,
    /// Transfer ceiling; an offset of `u8::MAX` means the adapter maximum
    pub transfer: Transfer,
    /// Tagged queue depth, 0 when tags are off
    pub tags: u16,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            flags: UnitFlags::DISC | UnitFlags::TAGS,
            transfer: Transfer::new(0, 0, 0, 0),
            tags: MAX_TAG as u16,
        }
    }
}

/// Everything a layout yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvramSettings {
    /// Layout the settings came from
    pub kind: NvramKind,
    /// Adapter-wide settings
    pub host: HostSettings,
    /// Per-target settings
    pub targets: [TargetSettings; MAX_TARGET],
}

impl NvramSettings {
    /// Fold the adapter-wide settings into a configuration
    pub fn apply_host(&self, cfg: &mut SymConfig) {
        cfg.host_id = self.host.host_id;
        cfg.parity = self.host.parity;
        cfg.avoid_bus_reset = self.host.avoid_bus_reset;
    }
}

/// Little-endian 16-bit field
#[inline]
pub(crate) fn le16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

/// Look for NVRAM on the adapter's serial EEPROM lines
///
/// The Symbios layout is tried first. A Tekram block comes next, from the
/// 24C16 on chips wired for it and otherwise (or when that fails) from a
/// 93C46. Any failure falls through to the next candidate.
pub fn read_nvram(lines: &mut dyn NvramLines, chip: &ChipProfile) -> Option<NvramSettings> {
    match symbios::read(lines) {
        Ok(settings) => {
            log::info!("[sym] {}: Symbios NVRAM, host ID {}", chip.name, settings.host.host_id);
            return Some(settings);
        }
        Err(err) => log::debug!("[sym] {}: no Symbios NVRAM: {}", chip.name, err),
    }
    if chip.nvram_two_wire {
        match tekram::read_two_wire(lines) {
            Ok(settings) => {
                log::info!("[sym] {}: Tekram NVRAM (24C16), host ID {}", chip.name, settings.host.host_id);
                return Some(settings);
            }
            Err(err) => log::debug!("[sym] {}: no Tekram 24C16 NVRAM: {}", chip.name, err),
        }
    }
    match tekram::read_three_wire(lines) {
        Ok(settings) => {
            log::info!("[sym] {}: Tekram NVRAM (93C46), host ID {}", chip.name, settings.host.host_id);
            Some(settings)
        }
        Err(err) => {
            log::debug!("[sym] {}: no Tekram 93C46 NVRAM: {}", chip.name, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::stubs::{ThreeWireEeprom, TwoWireEeprom};

    #[test]
    fn test_symbios_preferred() {
        let mut rom = TwoWireEeprom::new();
        rom.program(symbios::OFFSET as usize, &symbios::tests::image(5));
        rom.program(tekram::TWO_WIRE_OFFSET as usize, &tekram::tests::image(3));
        let s = read_nvram(&mut rom, &ChipProfile::SYM53C895).unwrap();
        assert_eq!(s.kind, NvramKind::Symbios);
        assert_eq!(s.host.host_id, 5);
    }

    #[test]
    fn test_corrupt_symbios_falls_back_to_tekram() {
        let mut rom = TwoWireEeprom::new();
        let mut sym = symbios::tests::image(5);
        sym[40] ^= 0x01;
        rom.program(symbios::OFFSET as usize, &sym);
        rom.program(tekram::TWO_WIRE_OFFSET as usize, &tekram::tests::image(3));
        let s = read_nvram(&mut rom, &ChipProfile::SYM53C895).unwrap();
        assert_eq!(s.kind, NvramKind::Tekram);
        assert_eq!(s.host.host_id, 3);
    }

    #[test]
    fn test_three_wire_tekram() {
        let mut rom = ThreeWireEeprom::new();
        rom.program_bytes(&tekram::tests::image(6));
        let s = read_nvram(&mut rom, &ChipProfile::SYM53C810A).unwrap();
        assert_eq!(s.kind, NvramKind::Tekram);
        assert_eq!(s.host.host_id, 6);
    }

    #[test]
    fn test_nothing_found() {
        let mut rom = TwoWireEeprom::new();
        assert_eq!(read_nvram(&mut rom, &ChipProfile::SYM53C875), None);
        let mut rom = ThreeWireEeprom::new();
        rom.absent = true;
        assert_eq!(read_nvram(&mut rom, &ChipProfile::SYM53C810A), None);
    }

    #[test]
    fn test_apply_host() {
        let mut rom = TwoWireEeprom::new();
        rom.program(symbios::OFFSET as usize, &symbios::tests::image(2));
        let s = read_nvram(&mut rom, &ChipProfile::SYM53C895).unwrap();
        let mut cfg = SymConfig::new(ChipProfile::SYM53C895);
        s.apply_host(&mut cfg);
        assert_eq!(cfg.host_id, 2);
        assert!(cfg.parity);
        assert!(cfg.avoid_bus_reset);
    }
}
