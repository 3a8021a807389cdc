//! # Target Control Blocks
//!
//! One per SCSI ID. Carries the transfer parameters in their four
//! flavours, LUN bookkeeping, and the per-target error counters the
//! recovery code consults.

use crate::ccb::CcbHandle;
use crate::defs::{MAX_LUN, MAX_TAG};
use crate::lcb::{Lcb, UnitFlags};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Synchronous/wide/PPR parameters of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    /// Period factor, 0 when asynchronous
    pub period: u8,
    /// REQ/ACK offset, 0 when asynchronous
    pub offset: u8,
    /// Width exponent: 0 narrow, 1 wide
    pub width: u8,
    /// PPR protocol options
    pub options: u8,
}

impl Transfer {
    /// Asynchronous narrow transfers
    pub const ASYNC: Self = Self { period: 0, offset: 0, width: 0, options: 0 };

    /// Create a transfer description
    pub const fn new(period: u8, offset: u8, width: u8, options: u8) -> Self {
        Self { period, offset, width, options }
    }

    /// Whether data moves synchronously
    #[inline]
    pub const fn is_sync(&self) -> bool {
        self.offset != 0
    }

    /// Whether double transition clocking is on
    #[inline]
    pub const fn is_dt(&self) -> bool {
        self.options & crate::defs::msg::PPR_OPT_DT != 0
    }
}

/// The four views of a target's transfer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransInfo {
    /// In effect on the bus
    pub curr: Transfer,
    /// What the next negotiation asks for
    pub goal: Transfer,
    /// Ceiling set by NVRAM or the operator
    pub user: Transfer,
    /// Last value reported, for change logging
    pub prev: Transfer,
}

bitflags! {
    /// Negotiation kinds already rejected once by the target
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Rejected: u8 {
        /// PPR was rejected
        const PPR  = 0x01;
        /// WDTR was rejected
        const WIDE = 0x02;
        /// SDTR was rejected
        const SYNC = 0x04;
    }
}

/// What the device said about itself in its INQUIRY data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Synchronous transfers
    pub sync: bool,
    /// 16-bit bus
    pub wide: bool,
    /// Double transition clocking
    pub dt: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self { sync: true, wide: true, dt: true }
    }
}

/// Error counters the recovery thresholds apply to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetErrors {
    /// Unexpected disconnects in a row
    pub busfree: u16,
    /// Parity errors since the last bus reset
    pub parity: u16,
    /// Selection timeouts seen
    pub sel_timeouts: u32,
}

/// Target control block
#[derive(Debug)]
pub struct Tcb {
    /// SCSI ID
    pub id: u8,
    /// Transfer parameters
    pub tinfo: TransInfo,
    /// Permissions from NVRAM
    pub user_flags: UnitFlags,
    /// Tag depth from NVRAM or the operator
    pub user_tags: u16,
    /// LUNs seen to answer
    pub lun_map: u64,
    /// Undiscovered LUNs with an untagged probe outstanding
    pub busy0_map: u64,
    /// LUNs whose INQUIRY denied tagged queueing
    pub no_cmdque_map: u64,
    /// Capabilities from the last INQUIRY
    pub caps: DeviceCaps,
    /// INQUIRY data was seen
    pub sniffed: bool,
    /// Arm a negotiation on the next command
    pub check_nego: bool,
    /// CCB carrying the negotiation in flight
    pub nego_cp: Option<CcbHandle>,
    /// Negotiations rejected since the last reset
    pub rejected: Rejected,
    /// Error counters
    pub errors: TargetErrors,
    lun0: Option<Lcb>,
    luns: Option<Box<[Option<Lcb>]>>,
}

impl Tcb {
    /// Create a target with no LUN known
    pub fn new(id: u8) -> Self {
        Self {
            id,
            tinfo: TransInfo::default(),
            user_flags: UnitFlags::DISC | UnitFlags::TAGS,
            user_tags: MAX_TAG as u16,
            lun_map: 0,
            busy0_map: 0,
            no_cmdque_map: 0,
            caps: DeviceCaps::default(),
            sniffed: false,
            check_nego: false,
            nego_cp: None,
            rejected: Rejected::empty(),
            errors: TargetErrors::default(),
            lun0: None,
            luns: None,
        }
    }

    /// Whether `lun` answered before
    #[inline]
    pub fn lun_known(&self, lun: u8) -> bool {
        lun_bit(lun) & self.lun_map != 0
    }

    /// Record that `lun` exists
    #[inline]
    pub fn mark_lun(&mut self, lun: u8) {
        self.lun_map |= lun_bit(lun);
    }

    /// LCB of `lun`, if allocated
    pub fn lcb(&self, lun: u8) -> Option<&Lcb> {
        if lun == 0 {
            return self.lun0.as_ref();
        }
        self.luns.as_ref()?.get(usize::from(lun))?.as_ref()
    }

    /// Mutable LCB of `lun`, if allocated
    pub fn lcb_mut(&mut self, lun: u8) -> Option<&mut Lcb> {
        if lun == 0 {
            return self.lun0.as_mut();
        }
        self.luns.as_mut()?.get_mut(usize::from(lun))?.as_mut()
    }

    /// Install an LCB, creating the LUN table on first use
    pub fn install_lcb(&mut self, lcb: Lcb) -> &mut Lcb {
        let lun = usize::from(lcb.lun);
        let slot = if lun == 0 {
            &mut self.lun0
        } else {
            let table = self.luns.get_or_insert_with(|| (0..MAX_LUN).map(|_| None).collect::<Vec<_>>().into_boxed_slice());
            &mut table[lun]
        };
        slot.insert(lcb)
    }

    /// Every allocated LCB
    pub fn lcbs(&self) -> impl Iterator<Item = &Lcb> {
        self.lun0.iter().chain(self.luns.iter().flat_map(|t| t.iter().flatten()))
    }

    /// Every allocated LCB, mutably
    pub fn lcbs_mut(&mut self) -> impl Iterator<Item = &mut Lcb> {
        self.lun0.iter_mut().chain(self.luns.iter_mut().flat_map(|t| t.iter_mut().flatten()))
    }

    /// Take every LCB out, for release at detach
    pub fn take_lcbs(&mut self) -> Vec<Lcb> {
        let mut out: Vec<Lcb> = self.lun0.take().into_iter().collect();
        if let Some(table) = self.luns.take() {
            out.extend(table.into_vec().into_iter().flatten());
        }
        out
    }

    /// Whether `lun` may receive tagged commands as far as the device said
    #[inline]
    pub fn lun_cmdque(&self, lun: u8) -> bool {
        self.no_cmdque_map & lun_bit(lun) == 0
    }

    /// Record what the INQUIRY data of `lun` said about tagged queueing
    pub fn set_lun_cmdque(&mut self, lun: u8, cmdque: bool) {
        if cmdque {
            self.no_cmdque_map &= !lun_bit(lun);
        } else {
            self.no_cmdque_map |= lun_bit(lun);
        }
    }

    /// Whether an untagged probe to the undiscovered `lun` is outstanding
    #[inline]
    pub fn probing(&self, lun: u8) -> bool {
        self.busy0_map & lun_bit(lun) != 0
    }

    /// Mark or clear the probe of an undiscovered LUN
    pub fn set_probing(&mut self, lun: u8, on: bool) {
        if on {
            self.busy0_map |= lun_bit(lun);
        } else {
            self.busy0_map &= !lun_bit(lun);
        }
    }

    /// Drop back to asynchronous narrow and re-arm negotiation
    pub fn reset_transfer(&mut self) {
        self.tinfo.curr = Transfer::ASYNC;
        self.tinfo.goal = self.tinfo.user;
        self.rejected = Rejected::empty();
        self.nego_cp = None;
        self.check_nego = self.tinfo.goal != self.tinfo.curr;
    }
}

#[inline]
fn lun_bit(lun: u8) -> u64 {
    1u64 << (lun & 63)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::{BusAddr, VirtAddr};
    use sym_memory::DmaBlock;

    fn lcb(lun: u8) -> Lcb {
        let dma = DmaBlock { virt: VirtAddr::new(0x4000), bus: BusAddr::new(0x4000), size: 16 };
        Lcb::new(lun, dma, UnitFlags::TAGS, 8, 64, 2)
    }

    #[test]
    fn test_lun_table_is_lazy() {
        let mut tcb = Tcb::new(3);
        assert!(tcb.lcb(0).is_none());
        tcb.install_lcb(lcb(0));
        assert!(tcb.luns.is_none());
        tcb.install_lcb(lcb(5));
        assert!(tcb.lcb(5).is_some());
        assert!(tcb.lcb(4).is_none());
        assert_eq!(tcb.lcbs().count(), 2);
        assert_eq!(tcb.take_lcbs().len(), 2);
        assert!(tcb.lcb(0).is_none());
    }

    #[test]
    fn test_lun_map() {
        let mut tcb = Tcb::new(0);
        assert!(!tcb.lun_known(63));
        tcb.mark_lun(63);
        assert!(tcb.lun_known(63));
        assert!(!tcb.lun_known(0));
    }

    #[test]
    fn test_reset_transfer_rearms() {
        let mut tcb = Tcb::new(1);
        tcb.tinfo.user = Transfer::new(10, 31, 1, 0);
        tcb.tinfo.curr = Transfer::new(12, 16, 1, 0);
        tcb.rejected = Rejected::PPR;
        tcb.reset_transfer();
        assert_eq!(tcb.tinfo.curr, Transfer::ASYNC);
        assert_eq!(tcb.tinfo.goal, tcb.tinfo.user);
        assert!(tcb.check_nego);
        assert!(tcb.rejected.is_empty());
    }
}
