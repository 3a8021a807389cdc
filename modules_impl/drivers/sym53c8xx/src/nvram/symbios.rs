//! Symbios NVRAM layout
//!
//! 464 bytes at offset 0x100 of a 24C16: a six byte header, the
//! controller area, four host entries, sixteen target entries, and a
//! fixed trailer.

use super::{le16, HostSettings, NvramError, NvramKind, NvramResult, NvramSettings, TargetSettings};
use crate::defs::{MAX_TAG, MAX_TARGET};
use crate::lcb::UnitFlags;
use crate::tcb::Transfer;
use bitflags::bitflags;
use sym_hal::NvramLines;

/// Offset of the block in the 24C16
pub const OFFSET: u16 = 0x100;
/// Size of the block
pub const LEN: usize = 464;

const HEADER_LEN: usize = 6;
const TRAILER: [u8; 6] = [0xfe, 0xfe, 0x00, 0x00, 0x00, 0x00];
const TRAILER_AT: usize = LEN - TRAILER.len();

const FLAGS_AT: usize = 12;
const FLAGS1_AT: usize = 14;
const HOST_ID_AT: usize = 20;
const FLAGS2_AT: usize = 25;
const TARGETS_AT: usize = 82;
const TARGET_LEN: usize = 8;

bitflags! {
    /// Controller flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u16 {
        const PARITY = 0x0002;
        const VERBOSE = 0x0004;
    }
}

bitflags! {
    /// Per-target flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TargetFlags: u8 {
        const DISCONNECT = 0x01;
        const SCAN_AT_BOOT = 0x02;
        const SCAN_LUNS = 0x04;
        const QUEUE_TAGS = 0x08;
    }
}

const FLAGS1_SCAN_HI_LO: u8 = 0x01;
const FLAGS2_AVOID_BUS_RESET: u8 = 0x04;

/// Sum of the bytes covered by the checksum
fn checksum(data: &[u8]) -> u16 {
    data[HEADER_LEN..TRAILER_AT].iter().fold(0u16, |sum, &b| sum.wrapping_add(u16::from(b)))
}

/// Validate and decode a raw block
pub fn decode(data: &[u8]) -> NvramResult<NvramSettings> {
    if data.len() != LEN
        || le16(data, 0) != 0
        || usize::from(le16(data, 2)) != LEN - 12
        || data[TRAILER_AT..] != TRAILER
    {
        return Err(NvramError::BadLayout);
    }
    if le16(data, 4) != checksum(data) {
        return Err(NvramError::BadChecksum);
    }

    let flags = Flags::from_bits_truncate(le16(data, FLAGS_AT));
    let host = HostSettings {
        host_id: data[HOST_ID_AT] & 0x0f,
        parity: flags.contains(Flags::PARITY),
        verbose: flags.contains(Flags::VERBOSE),
        scan_hi_lo: data[FLAGS1_AT] & FLAGS1_SCAN_HI_LO != 0,
        avoid_bus_reset: data[FLAGS2_AT] & FLAGS2_AVOID_BUS_RESET != 0,
    };

    let mut targets = [TargetSettings::default(); MAX_TARGET];
    for (i, t) in targets.iter_mut().enumerate() {
        let raw = &data[TARGETS_AT + i * TARGET_LEN..][..TARGET_LEN];
        *t = target(raw);
    }
    Ok(NvramSettings { kind: NvramKind::Symbios, host, targets })
}

fn target(raw: &[u8]) -> TargetSettings {
    let tf = TargetFlags::from_bits_truncate(raw[0]);
    let mut flags = UnitFlags::empty();
    if tf.contains(TargetFlags::DISCONNECT) {
        flags |= UnitFlags::DISC;
    }
    if !tf.contains(TargetFlags::SCAN_AT_BOOT) {
        flags |= UnitFlags::SCAN_BOOT_DISABLED;
    }
    if !tf.contains(TargetFlags::SCAN_LUNS) {
        flags |= UnitFlags::SCAN_LUNS_DISABLED;
    }
    let tags = if tf.contains(TargetFlags::QUEUE_TAGS) {
        flags |= UnitFlags::TAGS;
        MAX_TAG as u16
    } else {
        0
    };
    let width = u8::from(raw[2] == 0x10);
    let offset = raw[3];
    let period = le16(raw, 4).saturating_add(3) / 4;
    let transfer = if offset == 0 || period == 0 {
        Transfer::new(0, 0, width, 0)
    } else {
        Transfer::new(period.min(u16::from(u8::MAX)) as u8, offset, width, 0)
    };
    TargetSettings { flags, transfer, tags }
}

/// Read and decode the block from a 24C16
pub fn read(lines: &mut dyn NvramLines) -> NvramResult<NvramSettings> {
    decode(&super::read_block(lines, OFFSET, LEN)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// A valid block: parity on, avoid bus reset, target 0 wide Fast-20
    /// with tags, target 1 narrow async without disconnect
    pub(crate) fn image(host_id: u8) -> Vec<u8> {
        let mut d = vec![0u8; LEN];
        d[2..4].copy_from_slice(&((LEN - 12) as u16).to_le_bytes());
        d[FLAGS_AT] = 0x02;
        d[HOST_ID_AT] = host_id;
        d[FLAGS2_AT] = FLAGS2_AVOID_BUS_RESET;
        for i in 0..MAX_TARGET {
            let t = &mut d[TARGETS_AT + i * TARGET_LEN..][..TARGET_LEN];
            t[0] = 0x0f;
            t[2] = 0x08;
            t[3] = 8;
            t[4..6].copy_from_slice(&100u16.to_le_bytes());
        }
        {
            let t0 = &mut d[TARGETS_AT..][..TARGET_LEN];
            t0[2] = 0x10;
            t0[3] = 16;
            t0[4..6].copy_from_slice(&48u16.to_le_bytes());
        }
        {
            let t1 = &mut d[TARGETS_AT + TARGET_LEN..][..TARGET_LEN];
            t1[0] = 0x02;
            t1[3] = 0;
        }
        d[TRAILER_AT..].copy_from_slice(&TRAILER);
        let sum = checksum(&d);
        d[4..6].copy_from_slice(&sum.to_le_bytes());
        d
    }

    #[test]
    fn test_decode_targets() {
        let s = decode(&image(7)).unwrap();
        assert_eq!(s.host.host_id, 7);
        assert!(s.host.parity);
        assert!(!s.host.verbose);

        let t0 = s.targets[0];
        assert_eq!(t0.transfer, Transfer::new(12, 16, 1, 0));
        assert_eq!(t0.tags, MAX_TAG as u16);
        assert_eq!(t0.flags, UnitFlags::DISC | UnitFlags::TAGS);

        let t1 = s.targets[1];
        assert_eq!(t1.transfer.offset, 0);
        assert_eq!(t1.tags, 0);
        assert!(!t1.flags.contains(UnitFlags::DISC));
        assert!(t1.flags.contains(UnitFlags::SCAN_LUNS_DISABLED));
        assert!(!t1.flags.contains(UnitFlags::SCAN_BOOT_DISABLED));

        assert_eq!(s.targets[5].transfer, Transfer::new(25, 8, 0, 0));
    }

    #[test]
    fn test_rejects_bad_blocks() {
        let mut d = image(7);
        d[100] ^= 0x40;
        assert_eq!(decode(&d), Err(NvramError::BadChecksum));

        let mut d = image(7);
        d[LEN - 6] = 0;
        assert_eq!(decode(&d), Err(NvramError::BadLayout));

        let mut d = image(7);
        d[2] = 0;
        assert_eq!(decode(&d), Err(NvramError::BadLayout));
    }

    #[test]
    fn test_read_from_eeprom() {
        let mut rom = sym_hal::stubs::TwoWireEeprom::new();
        rom.program(OFFSET as usize, &image(4));
        assert_eq!(read(&mut rom).unwrap().host.host_id, 4);
    }
}
