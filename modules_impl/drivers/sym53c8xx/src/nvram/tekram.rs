//! Tekram NVRAM layout
//!
//! Sixty-four little-endian words: four bytes per target, a few host
//! bytes, and a checksum word making the sum of all words 0x1234.

use super::{HostSettings, NvramError, NvramKind, NvramResult, NvramSettings, TargetSettings};
use crate::defs::MAX_TARGET;
use crate::lcb::UnitFlags;
use crate::tcb::Transfer;
use bitflags::bitflags;
use sym_hal::NvramLines;

/// Offset of the block on 24C16-wired boards
pub const TWO_WIRE_OFFSET: u16 = 0x40;
/// Size of the block
pub const LEN: usize = 128;
/// Value all words add up to
pub const CHECKSUM: u16 = 0x1234;

/// Period factors indexed by the stored sync index
pub const SYNC_FACTORS: [u8; 16] = [25, 31, 37, 43, 50, 62, 75, 125, 12, 15, 18, 21, 6, 7, 9, 10];

const TARGET_LEN: usize = 4;
const HOST_ID_AT: usize = 64;
const FLAGS_AT: usize = 65;
const MAX_TAGS_INDEX_AT: usize = 67;

const FLAGS_SCAN_LUNS: u8 = 0x20;

bitflags! {
    /// Per-target flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TargetFlags: u8 {
        const PARITY_CHECK = 0x01;
        const SYNC_NEGO = 0x02;
        const DISCONNECT = 0x04;
        const TAGGED = 0x10;
        const WIDE_NEGO = 0x20;
    }
}

fn checksum(data: &[u8]) -> u16 {
    data.chunks_exact(2).fold(0u16, |sum, w| sum.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
}

/// Validate and decode a raw block
pub fn decode(data: &[u8]) -> NvramResult<NvramSettings> {
    if data.len() != LEN {
        return Err(NvramError::BadLayout);
    }
    if checksum(data) != CHECKSUM {
        return Err(NvramError::BadChecksum);
    }

    let host_flags = data[FLAGS_AT];
    let tags = 2u16 << (data[MAX_TAGS_INDEX_AT] & 0x07).min(5);
    let mut parity = true;
    let mut targets = [TargetSettings::default(); MAX_TARGET];
    for (i, t) in targets.iter_mut().enumerate() {
        let raw = &data[i * TARGET_LEN..][..TARGET_LEN];
        let tf = TargetFlags::from_bits_truncate(raw[0]);
        if !tf.contains(TargetFlags::PARITY_CHECK) {
            parity = false;
        }
        let mut flags = UnitFlags::empty();
        if tf.contains(TargetFlags::DISCONNECT) {
            flags |= UnitFlags::DISC;
        }
        if host_flags & FLAGS_SCAN_LUNS == 0 {
            flags |= UnitFlags::SCAN_LUNS_DISABLED;
        }
        let width = u8::from(tf.contains(TargetFlags::WIDE_NEGO));
        // No offset is stored; the adapter maximum applies
        let transfer = if tf.contains(TargetFlags::SYNC_NEGO) {
            Transfer::new(SYNC_FACTORS[usize::from(raw[1] & 0x0f)], u8::MAX, width, 0)
        } else {
            Transfer::new(0, 0, width, 0)
        };
        let t_tags = if tf.contains(TargetFlags::TAGGED) {
            flags |= UnitFlags::TAGS;
            tags
        } else {
            0
        };
        *t = TargetSettings { flags, transfer, tags: t_tags };
    }

    let host = HostSettings {
        host_id: data[HOST_ID_AT] & 0x0f,
        parity,
        verbose: false,
        scan_hi_lo: false,
        avoid_bus_reset: false,
    };
    Ok(NvramSettings { kind: NvramKind::Tekram, host, targets })
}

/// Read the block from a 24C16
pub fn read_two_wire(lines: &mut dyn NvramLines) -> NvramResult<NvramSettings> {
    decode(&super::read_block(lines, TWO_WIRE_OFFSET, LEN)?)
}

/// Read the block from a 93C46
pub fn read_three_wire(lines: &mut dyn NvramLines) -> NvramResult<NvramSettings> {
    decode(&super::three_wire::read_bytes(lines, LEN / 2)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ChipProfile;
    use crate::nego::{period_tenths, AdapterLimits};
    use alloc::vec;
    use alloc::vec::Vec;

    fn seal(d: &mut [u8]) {
        d[LEN - 2] = 0;
        d[LEN - 1] = 0;
        let fix = CHECKSUM.wrapping_sub(checksum(d));
        d[LEN - 2..].copy_from_slice(&fix.to_le_bytes());
    }

    /// A valid block: target 0 narrow at sync index 8, target 1 wide at
    /// index 0 with tags, every target checking parity
    pub(crate) fn image(host_id: u8) -> Vec<u8> {
        let mut d = vec![0u8; LEN];
        for i in 0..MAX_TARGET {
            d[i * TARGET_LEN] = 0x01 | 0x04;
        }
        d[0] |= 0x02;
        d[1] = 8;
        d[TARGET_LEN] |= 0x02 | 0x10 | 0x20;
        d[TARGET_LEN + 1] = 0;
        d[HOST_ID_AT] = host_id;
        d[FLAGS_AT] = FLAGS_SCAN_LUNS;
        d[MAX_TAGS_INDEX_AT] = 3;
        seal(&mut d);
        d
    }

    #[test]
    fn test_sync_index_eight_is_fast20() {
        let s = decode(&image(7)).unwrap();
        let t0 = s.targets[0];
        assert_eq!(t0.transfer.period, 12);
        assert_eq!(t0.transfer.width, 0);
        assert_eq!(period_tenths(t0.transfer.period, false), 500);
        // The adapter maximum replaces the missing offset
        let limits = AdapterLimits::from_chip(&ChipProfile::SYM53C875);
        let user = limits.clamp(t0.transfer);
        assert_eq!(user.period, 12);
        assert_eq!(user.offset, limits.maxoffs);
    }

    #[test]
    fn test_decode_flags() {
        let s = decode(&image(7)).unwrap();
        assert!(s.host.parity);
        let t1 = s.targets[1];
        assert_eq!(t1.transfer, Transfer::new(25, u8::MAX, 1, 0));
        assert_eq!(t1.tags, 16);
        assert_eq!(t1.flags, UnitFlags::DISC | UnitFlags::TAGS);
        let t2 = s.targets[2];
        assert_eq!(t2.transfer.offset, 0);
        assert_eq!(t2.tags, 0);
    }

    #[test]
    fn test_one_target_without_parity_disables_it() {
        let mut d = image(7);
        d[9 * TARGET_LEN] &= !0x01;
        d[HOST_ID_AT + 1] = 0;
        seal(&mut d);
        let s = decode(&d).unwrap();
        assert!(!s.host.parity);
        assert!(s.targets[3].flags.contains(UnitFlags::SCAN_LUNS_DISABLED));
    }

    #[test]
    fn test_bad_checksum() {
        let mut d = image(7);
        d[10] ^= 0x20;
        assert_eq!(decode(&d), Err(NvramError::BadChecksum));
    }

    #[test]
    fn test_read_both_wirings() {
        let mut rom = sym_hal::stubs::TwoWireEeprom::new();
        rom.program(TWO_WIRE_OFFSET as usize, &image(1));
        assert_eq!(read_two_wire(&mut rom).unwrap().host.host_id, 1);

        let mut rom = sym_hal::stubs::ThreeWireEeprom::new();
        rom.program_bytes(&image(2));
        assert_eq!(read_three_wire(&mut rom).unwrap().host.host_id, 2);
    }
}
