//! # Transfer Negotiation
//!
//! Computes the adapter's synchronous limits from its clock, decides
//! which message (SDTR, WDTR or PPR) the next command carries, and
//! handles what targets send back.
//!
//! Every outcome of a negotiation writes the same values into `curr` and
//! `goal`, so a target is never renegotiated unless something changed
//! the goal afterwards (an INQUIRY, the operator, a reset, or the
//! fallback after a rejection).

use crate::ccb::CcbHandle;
use crate::config::{ChipFeatures, ChipProfile};
use crate::defs::{inquiry, msg, MSG_IN_LEN, MSG_OUT_LEN};
use crate::tcb::{DeviceCaps, Rejected, Tcb, Transfer};
use arrayvec::ArrayVec;

/// Negotiation message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegoKind {
    /// SYNCHRONOUS DATA TRANSFER REQUEST
    Sync,
    /// WIDE DATA TRANSFER REQUEST
    Wide,
    /// PARALLEL PROTOCOL REQUEST
    Ppr,
}

impl NegoKind {
    fn rejected_flag(self) -> Rejected {
        match self {
            NegoKind::Sync => Rejected::SYNC,
            NegoKind::Wide => Rejected::WIDE,
            NegoKind::Ppr => Rejected::PPR,
        }
    }

    fn name(self) -> &'static str {
        match self {
            NegoKind::Sync => "SDTR",
            NegoKind::Wide => "WDTR",
            NegoKind::Ppr => "PPR",
        }
    }
}

// =============================================================================
// Clock and limits
// =============================================================================

const FIVE_MHZ: u32 = 5_000_000;

/// Clock divisors times 10 MHz: 1, 1.5, 2, 3, 4, 6, 8
const DIV_10M: [u32; 7] = [
    2 * FIVE_MHZ,
    3 * FIVE_MHZ,
    4 * FIVE_MHZ,
    6 * FIVE_MHZ,
    8 * FIVE_MHZ,
    12 * FIVE_MHZ,
    16 * FIVE_MHZ,
];

/// Transfer limits of one adapter, derived from its chip profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterLimits {
    /// SCSI core clock in kHz
    pub clock_khz: u32,
    /// Number of usable clock divisors
    pub clock_divn: u8,
    /// Smallest single transition period factor
    pub minsync: u8,
    /// Largest period factor
    pub maxsync: u8,
    /// Smallest double transition period factor, 0 without DT
    pub minsync_dt: u8,
    /// Largest double transition period factor
    pub maxsync_dt: u8,
    /// Largest single transition offset
    pub maxoffs: u8,
    /// Largest double transition offset
    pub maxoffs_dt: u8,
    /// Largest width exponent
    pub maxwide: u8,
    /// Chip capabilities
    pub features: ChipFeatures,
}

impl AdapterLimits {
    /// Derive the limits of a chip
    pub fn from_chip(chip: &ChipProfile) -> Self {
        let features = chip.features;
        let multiplier = if features.contains(ChipFeatures::QUAD) {
            4
        } else if features.contains(ChipFeatures::DBLR) {
            2
        } else {
            1
        };
        let base = if features.contains(ChipFeatures::CLK80) { 80_000 } else { 40_000 };
        let clock_khz = base * multiplier;
        let clock_divn = chip.clock_divn.clamp(1, DIV_10M.len() as u8);

        let period = (4 * DIV_10M[0] + clock_khz - 1) / clock_khz;
        let mut minsync = match period {
            0..=250 => 10,
            251..=303 => 11,
            304..=500 => 12,
            _ => ((period + 40 - 1) / 40).min(255) as u8,
        };
        let ultra_any = ChipFeatures::ULTRA | ChipFeatures::ULTRA2 | ChipFeatures::ULTRA3;
        if minsync < 25 && !features.intersects(ultra_any) {
            minsync = 25;
        } else if minsync < 12 && !features.intersects(ChipFeatures::ULTRA2 | ChipFeatures::ULTRA3) {
            minsync = 12;
        }

        let period = (11 * u64::from(DIV_10M[usize::from(clock_divn) - 1])) / (4 * u64::from(clock_khz));
        let maxsync = if period > 2540 { 254 } else { (period / 10) as u8 };

        let (minsync_dt, maxsync_dt, maxoffs_dt) =
            if features.contains(ChipFeatures::C10 | ChipFeatures::ULTRA3) && clock_khz == 160_000 {
                (9, 50, chip.max_offset_dt)
            } else {
                (0, 0, 0)
            };

        Self {
            clock_khz,
            clock_divn,
            minsync,
            maxsync,
            minsync_dt,
            maxsync_dt,
            maxoffs: chip.max_offset,
            maxoffs_dt,
            maxwide: u8::from(features.contains(ChipFeatures::WIDE)),
            features,
        }
    }

    /// Whether the adapter can run double transition transfers
    pub fn dt_capable(&self) -> bool {
        self.minsync_dt != 0
            && self.maxwide != 0
            && self.features.contains(ChipFeatures::ULTRA3 | ChipFeatures::U3EN)
    }

    /// The fastest transfer the adapter supports in single transition mode
    pub fn best_transfer(&self) -> Transfer {
        Transfer::new(self.minsync, self.maxoffs, self.maxwide, 0)
    }

    /// Scale a transfer into what the adapter can do
    ///
    /// Period factor 9 selects double transition clocking, which also
    /// forces a wide bus. An offset of zero means asynchronous and
    /// normalizes the period away. Applying it twice changes nothing.
    pub fn clamp(&self, t: Transfer) -> Transfer {
        let mut out = Transfer { width: t.width.min(self.maxwide), ..Transfer::ASYNC };
        if t.offset == 0 {
            return out;
        }
        let dt = ((t.period != 0 && t.period <= 9) || t.is_dt()) && self.dt_capable();
        if dt {
            out.width = 1;
            out.options = msg::PPR_OPT_DT;
            out.offset = t.offset.min(self.maxoffs_dt);
            out.period = t.period.clamp(self.minsync_dt, self.maxsync_dt);
        } else {
            out.offset = t.offset.min(self.maxoffs);
            out.period = t.period.clamp(self.minsync, self.maxsync);
        }
        if out.offset == 0 {
            out.period = 0;
            out.options = 0;
        }
        out
    }
}

/// Clock programming for one synchronous period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSetting {
    /// Clock divisor index
    pub div: u8,
    /// Extra clocks per transfer
    pub fak: u8,
    /// Period in tenths of nanoseconds
    pub period: u32,
}

/// Period of a factor, in tenths of nanoseconds
pub fn period_tenths(factor: u8, dt: bool) -> u32 {
    match factor {
        f if dt && f <= 9 => 125,
        0..=10 => 250,
        11 => 303,
        12 => 500,
        f => 40 * u32::from(f),
    }
}

/// Find divisor and extra clocks for a period factor
///
/// Returns `None` when the chip cannot produce the period.
pub fn sync_clock(limits: &AdapterLimits, dt: bool, factor: u8) -> Option<ClockSetting> {
    let period = period_tenths(factor, dt);
    let mut kpc = u64::from(period) * u64::from(limits.clock_khz);
    if dt {
        kpc <<= 1;
    }
    let divn = usize::from(limits.clock_divn);

    if limits.features & (ChipFeatures::C10 | ChipFeatures::U3EN) == ChipFeatures::C10 {
        // No extra clocks: lowest divisor whose output is not too fast
        let div = (0..divn).find(|&d| kpc <= u64::from(DIV_10M[d]) << 2)?;
        return Some(ClockSetting { div: div as u8, fak: 0, period });
    }

    let div = (0..divn).rev().find(|&d| kpc >= u64::from(DIV_10M[d]) << 2).unwrap_or(0);
    let div_10m = u64::from(DIV_10M[div]);
    let fak = if dt {
        (kpc as i64 - 1) / (div_10m << 1) as i64 + 1 - 2
    } else {
        (kpc as i64 - 1) / div_10m as i64 + 1 - 4
    };
    if !(0..=2).contains(&fak) {
        return None;
    }
    Some(ClockSetting { div: div as u8, fak: fak as u8, period })
}

// =============================================================================
// Applying results
// =============================================================================

fn set_sync(tcb: &mut Tcb, offset: u8, period: u8) {
    let period = if offset == 0 { 0 } else { period };
    let t = &mut tcb.tinfo;
    t.curr.period = period;
    t.curr.offset = offset;
    t.curr.options = 0;
    t.goal.period = period;
    t.goal.offset = offset;
    t.goal.options = 0;
}

fn set_wide(tcb: &mut Tcb, width: u8) {
    let t = &mut tcb.tinfo;
    t.curr = Transfer { width, ..Transfer::ASYNC };
    t.goal.width = width;
}

fn set_ppr(tcb: &mut Tcb, options: u8, offset: u8, period: u8, width: u8) {
    let period = if offset == 0 { 0 } else { period };
    let options = if offset == 0 { 0 } else { options };
    let t = Transfer::new(period, offset, width, options);
    tcb.tinfo.curr = t;
    tcb.tinfo.goal = t;
}

/// Log the transfer mode of a target if it changed since last time
pub fn report_transfer(tcb: &mut Tcb) {
    let curr = tcb.tinfo.curr;
    if curr == tcb.tinfo.prev {
        return;
    }
    tcb.tinfo.prev = curr;
    let width = if curr.width != 0 { "wide" } else { "narrow" };
    if curr.offset == 0 {
        log::info!("[sym] target {}: asynchronous, {}", tcb.id, width);
        return;
    }
    let per = period_tenths(curr.period, curr.is_dt());
    // MB/s in tenths
    let rate = (10_000 * 10 + per / 2) / per * (1 << curr.width);
    log::info!(
        "[sym] target {}: {} {}.{} MB/s, offset {}, {}",
        tcb.id,
        if curr.is_dt() { "dt" } else { "sync" },
        rate / 10,
        rate % 10,
        curr.offset,
        width
    );
}

// =============================================================================
// Goals
// =============================================================================

/// Reduce a goal to what the device said it supports
pub fn apply_caps(t: Transfer, caps: DeviceCaps, limits: &AdapterLimits) -> Transfer {
    let mut t = t;
    if !caps.wide {
        t.width = 0;
        t.options = 0;
    }
    if !caps.dt {
        t.options = 0;
        if t.period != 0 && t.period < limits.minsync {
            t.period = limits.minsync;
        }
    }
    if !caps.sync {
        return Transfer { width: t.width, ..Transfer::ASYNC };
    }
    limits.clamp(t)
}

/// Recompute a target's goal from its user limits and device capabilities
///
/// Arms a negotiation when the goal moved away from what is in effect.
pub fn refresh_goal(tcb: &mut Tcb, limits: &AdapterLimits) {
    let mut goal = apply_caps(tcb.tinfo.user, tcb.caps, limits);
    if tcb.rejected.contains(Rejected::PPR) {
        goal = without_ppr(goal, limits);
    }
    tcb.tinfo.goal = goal;
    tcb.check_nego = goal != tcb.tinfo.curr;
}

fn without_ppr(t: Transfer, limits: &AdapterLimits) -> Transfer {
    let mut t = t;
    t.options = 0;
    if t.period != 0 && t.period < limits.minsync {
        t.period = limits.minsync;
    }
    limits.clamp(t)
}

/// Operator-set limits for a target
pub fn set_goal(tcb: &mut Tcb, limits: &AdapterLimits, requested: Transfer) {
    tcb.tinfo.user = limits.clamp(requested);
    refresh_goal(tcb, limits);
}

/// Outcome of looking at INQUIRY data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    /// Device supports tagged queueing
    pub cmdque: bool,
    /// A negotiation was armed
    pub renegotiate: bool,
}

/// Learn the device's capabilities from a standard INQUIRY response
///
/// Returns `None` when the data is too short to say anything.
pub fn sniff_inquiry(tcb: &mut Tcb, limits: &AdapterLimits, data: &[u8]) -> Option<Sniffed> {
    if data.len() < inquiry::MIN_LEN {
        return None;
    }
    let byte7 = data[7];
    let dt = data.get(56).map_or(false, |b| b & inquiry::BYTE56_CLOCKING_DT != 0);
    tcb.caps = DeviceCaps {
        sync: byte7 & inquiry::BYTE7_SYNC != 0,
        wide: byte7 & inquiry::BYTE7_WBUS16 != 0,
        dt,
    };
    tcb.sniffed = true;
    let before = tcb.tinfo.goal;
    refresh_goal(tcb, limits);
    if tcb.tinfo.goal != before {
        log::debug!("[sym] target {}: goal now {:?}", tcb.id, tcb.tinfo.goal);
    }
    Some(Sniffed { cmdque: byte7 & inquiry::BYTE7_CMDQUE != 0, renegotiate: tcb.check_nego })
}

// =============================================================================
// Outgoing negotiation
// =============================================================================

/// Decide whether the command `cp` carries a negotiation and build it
///
/// Appends the message to `out`. At most one negotiation is in flight
/// per target; the target remembers which command carries it.
pub fn prepare_nego(
    tcb: &mut Tcb,
    limits: &AdapterLimits,
    cp: CcbHandle,
    out: &mut ArrayVec<u8, MSG_OUT_LEN>,
) -> Option<NegoKind> {
    if !tcb.check_nego || tcb.nego_cp.is_some() {
        return None;
    }
    let goal = &mut tcb.tinfo.goal;
    if goal.period == 9 && goal.offset != 0 {
        goal.width = 1;
        goal.options |= msg::PPR_OPT_DT;
    } else {
        goal.options &= !msg::PPR_OPT_DT;
    }
    if !limits.features.contains(ChipFeatures::U3EN) || tcb.rejected.contains(Rejected::PPR) {
        *goal = without_ppr(*goal, limits);
    }
    let goal = *goal;
    let curr = tcb.tinfo.curr;

    let kind = if goal.options & msg::PPR_OPT_MASK != 0 {
        NegoKind::Ppr
    } else if curr.width != goal.width {
        NegoKind::Wide
    } else if curr.period != goal.period || curr.offset != goal.offset {
        NegoKind::Sync
    } else {
        tcb.check_nego = false;
        return None;
    };

    let bytes = match kind {
        NegoKind::Sync => sdtr(goal.period, goal.offset),
        NegoKind::Wide => wdtr(goal.width),
        NegoKind::Ppr => ppr(goal.period, goal.offset, goal.width, goal.options & msg::PPR_OPT_DT),
    };
    if out.try_extend_from_slice(&bytes).is_err() {
        return None;
    }
    tcb.nego_cp = Some(cp);
    log::debug!("[sym] target {}: {} out {:02x?}", tcb.id, kind.name(), bytes.as_slice());
    Some(kind)
}

/// SDTR message bytes
pub fn sdtr(period: u8, offset: u8) -> ArrayVec<u8, MSG_IN_LEN> {
    msg_from(&[msg::EXTENDED, 3, msg::X_SYNC_REQ, period, offset])
}

/// WDTR message bytes
pub fn wdtr(width: u8) -> ArrayVec<u8, MSG_IN_LEN> {
    msg_from(&[msg::EXTENDED, 2, msg::X_WIDE_REQ, width])
}

/// PPR message bytes
pub fn ppr(period: u8, offset: u8, width: u8, options: u8) -> ArrayVec<u8, MSG_IN_LEN> {
    msg_from(&[msg::EXTENDED, 6, msg::X_PPR_REQ, period, 0, offset, width, options])
}

fn msg_from(bytes: &[u8]) -> ArrayVec<u8, MSG_IN_LEN> {
    bytes.iter().copied().collect()
}

// =============================================================================
// Incoming messages
// =============================================================================

/// What to tell the target after one of its negotiation messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegoReply {
    /// Our negotiation completed; acknowledge and continue
    Accepted,
    /// Send a message back. With `answer_expected` the target must
    /// answer it; otherwise it is the reply to the target's request.
    Send {
        /// Message bytes
        bytes: ArrayVec<u8, MSG_IN_LEN>,
        /// What is now being negotiated
        kind: NegoKind,
        /// Our message opens a new exchange
        answer_expected: bool,
    },
    /// Answer with MESSAGE REJECT
    Reject,
}

/// Handle an extended negotiation message from a target
///
/// `awaiting` is the kind of our outstanding negotiation when the message
/// is its answer, `None` when the target started the exchange.
pub fn handle_message(tcb: &mut Tcb, limits: &AdapterLimits, awaiting: Option<NegoKind>, bytes: &[u8]) -> NegoReply {
    let kind = match bytes {
        [msg::EXTENDED, 3, msg::X_SYNC_REQ, _, _] => NegoKind::Sync,
        [msg::EXTENDED, 2, msg::X_WIDE_REQ, _] => NegoKind::Wide,
        [msg::EXTENDED, 6, msg::X_PPR_REQ, _, _, _, _, _] => NegoKind::Ppr,
        _ => {
            log::warn!("[sym] target {}: unsupported message {:02x?}", tcb.id, bytes);
            return NegoReply::Reject;
        }
    };
    log::debug!("[sym] target {}: {} in {:02x?}", tcb.id, kind.name(), bytes);
    if let Some(ours) = awaiting {
        if ours != kind {
            log::warn!("[sym] target {}: answered {} with {}", tcb.id, ours.name(), kind.name());
            return NegoReply::Reject;
        }
    }
    let req = awaiting.is_none();
    let reply = match kind {
        NegoKind::Sync => sync_nego(tcb, limits, req, bytes[3], bytes[4]),
        NegoKind::Wide => wide_nego(tcb, limits, req, bytes[3]),
        NegoKind::Ppr => ppr_nego(tcb, limits, req, bytes[3], bytes[5], bytes[6], bytes[7]),
    };
    if !matches!(reply, NegoReply::Send { answer_expected: true, .. }) {
        tcb.check_nego = tcb.tinfo.goal != tcb.tinfo.curr;
    }
    report_transfer(tcb);
    reply
}

fn sync_nego(tcb: &mut Tcb, limits: &AdapterLimits, req: bool, per: u8, ofs: u8) -> NegoReply {
    let user = tcb.tinfo.user;
    let (mut per, mut ofs, mut chg) = (per, ofs, false);
    if ofs != 0 {
        if ofs > limits.maxoffs {
            chg = true;
            ofs = limits.maxoffs;
        }
        if req && ofs > user.offset {
            chg = true;
            ofs = user.offset;
        }
    }
    if ofs != 0 {
        if per < limits.minsync {
            chg = true;
            per = limits.minsync;
        }
        if req && per < user.period {
            chg = true;
            per = user.period;
        }
    }
    if ofs != 0 && sync_clock(limits, false, per).is_none() {
        set_sync(tcb, 0, 0);
        return NegoReply::Reject;
    }
    if !req && chg {
        set_sync(tcb, 0, 0);
        return NegoReply::Reject;
    }
    set_sync(tcb, ofs, per);
    if !req {
        return NegoReply::Accepted;
    }
    NegoReply::Send { bytes: sdtr(per, ofs), kind: NegoKind::Sync, answer_expected: false }
}

fn wide_nego(tcb: &mut Tcb, limits: &AdapterLimits, req: bool, wide: u8) -> NegoReply {
    let (mut wide, mut chg) = (wide, false);
    if wide > limits.maxwide {
        chg = true;
        wide = limits.maxwide;
    }
    if req && wide > tcb.tinfo.user.width {
        chg = true;
        wide = tcb.tinfo.user.width;
    }
    if !req {
        if chg {
            return NegoReply::Reject;
        }
        set_wide(tcb, wide);
        // Go on with SDTR on the same connection
        let goal = tcb.tinfo.goal;
        if goal.offset != 0 {
            return NegoReply::Send {
                bytes: sdtr(goal.period, goal.offset),
                kind: NegoKind::Sync,
                answer_expected: true,
            };
        }
        return NegoReply::Accepted;
    }
    set_wide(tcb, wide);
    NegoReply::Send { bytes: wdtr(wide), kind: NegoKind::Wide, answer_expected: false }
}

fn ppr_nego(tcb: &mut Tcb, limits: &AdapterLimits, req: bool, per: u8, ofs: u8, wide: u8, opts: u8) -> NegoReply {
    let user = tcb.tinfo.user;
    let (mut per, mut ofs, mut wide, mut chg) = (per, ofs, wide, false);
    let mut dt = opts & msg::PPR_OPT_DT;

    if wide > limits.maxwide {
        chg = true;
        wide = limits.maxwide;
    }
    if wide == 0 || !limits.features.contains(ChipFeatures::ULTRA3) {
        dt = 0;
    }
    if req && wide > user.width {
        chg = true;
        wide = user.width;
    }
    if !limits.features.contains(ChipFeatures::U3EN) {
        dt = 0;
    }
    if dt != opts & msg::PPR_OPT_MASK {
        chg = true;
    }
    let maxoffs = if dt != 0 { limits.maxoffs_dt } else { limits.maxoffs };
    if ofs != 0 {
        if ofs > maxoffs {
            chg = true;
            ofs = maxoffs;
        }
        if req && ofs > user.offset {
            chg = true;
            ofs = user.offset;
        }
    }
    if ofs != 0 {
        let minsync = if dt != 0 { limits.minsync_dt } else { limits.minsync };
        if per < minsync {
            chg = true;
            per = minsync;
        }
        if req && per < user.period {
            chg = true;
            per = user.period;
        }
    }

    let unreachable = ofs != 0 && sync_clock(limits, dt != 0, per).is_none();
    if unreachable || (!req && chg) {
        set_ppr(tcb, 0, 0, 0, 0);
        if !req && dt == 0 {
            // Worth trying legacy negotiation with these values later
            tcb.tinfo.goal = limits.clamp(Transfer::new(per, ofs, wide, 0));
        }
        return NegoReply::Reject;
    }
    set_ppr(tcb, dt, ofs, per, wide);
    if !req {
        return NegoReply::Accepted;
    }
    NegoReply::Send { bytes: ppr(per, ofs, wide, dt), kind: NegoKind::Ppr, answer_expected: false }
}

// =============================================================================
// Rejection and failure
// =============================================================================

/// Fall back after a target refused or broke our negotiation
///
/// Sets the transfer to the safe default for the kind, then lowers the
/// goal one notch so the next command retries with less: PPR retries as
/// WDTR/SDTR without options, WDTR retries narrow, SDTR stays async. A
/// second rejection of the same kind gives up.
pub fn nego_rejected(tcb: &mut Tcb, limits: &AdapterLimits, kind: NegoKind) {
    let goal_before = tcb.tinfo.goal;
    match kind {
        NegoKind::Ppr => set_ppr(tcb, 0, 0, 0, 0),
        NegoKind::Sync => set_sync(tcb, 0, 0),
        NegoKind::Wide => set_wide(tcb, 0),
    }
    let flag = kind.rejected_flag();
    if tcb.rejected.contains(flag) {
        log::warn!(
            "[sym] target {}: {} rejected again, staying at {:?}",
            tcb.id,
            kind.name(),
            tcb.tinfo.curr
        );
        tcb.tinfo.goal = tcb.tinfo.curr;
        tcb.check_nego = false;
        report_transfer(tcb);
        return;
    }
    tcb.rejected |= flag;
    let retry = match kind {
        NegoKind::Ppr => without_ppr(goal_before, limits),
        NegoKind::Wide => Transfer { width: 0, ..goal_before },
        NegoKind::Sync => Transfer { width: tcb.tinfo.curr.width, ..Transfer::ASYNC },
    };
    tcb.tinfo.goal = limits.clamp(retry);
    tcb.check_nego = tcb.tinfo.goal != tcb.tinfo.curr;
    log::info!("[sym] target {}: {} rejected, retrying with {:?}", tcb.id, kind.name(), tcb.tinfo.goal);
    report_transfer(tcb);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_895() -> AdapterLimits {
        AdapterLimits::from_chip(&ChipProfile::SYM53C895)
    }

    fn limits_1010() -> AdapterLimits {
        AdapterLimits::from_chip(&ChipProfile::SYM53C1010)
    }

    fn target(limits: &AdapterLimits) -> Tcb {
        let mut tcb = Tcb::new(2);
        tcb.tinfo.user = limits.best_transfer();
        refresh_goal(&mut tcb, limits);
        tcb
    }

    #[test]
    fn test_chip_limits() {
        let l = AdapterLimits::from_chip(&ChipProfile::SYM53C810A);
        assert_eq!(l.clock_khz, 40_000);
        assert_eq!(l.minsync, 25);
        assert_eq!(l.maxsync, 206);
        assert_eq!(l.maxwide, 0);

        let l = AdapterLimits::from_chip(&ChipProfile::SYM53C875);
        assert_eq!(l.clock_khz, 80_000);
        assert_eq!(l.minsync, 12);

        let l = limits_895();
        assert_eq!(l.clock_khz, 160_000);
        assert_eq!(l.minsync, 10);
        assert_eq!(l.minsync_dt, 0);

        let l = limits_1010();
        assert_eq!(l.minsync_dt, 9);
        assert_eq!(l.maxoffs_dt, 62);
        assert!(l.dt_capable());
    }

    #[test]
    fn test_period_table() {
        assert_eq!(period_tenths(9, true), 125);
        assert_eq!(period_tenths(9, false), 250);
        assert_eq!(period_tenths(10, false), 250);
        assert_eq!(period_tenths(11, false), 303);
        assert_eq!(period_tenths(12, false), 500);
        assert_eq!(period_tenths(25, false), 1000);
    }

    #[test]
    fn test_sync_clock_reachability() {
        let l = limits_895();
        let s = sync_clock(&l, false, 10).unwrap();
        assert_eq!((s.div, s.fak), (0, 0));
        assert!(sync_clock(&l, false, 25).is_some());
        // Slower than the largest divisor with two extra clocks
        assert!(sync_clock(&l, false, 255).is_none());
        // Faster than a single-transition chip can go
        let slow = AdapterLimits::from_chip(&ChipProfile::SYM53C810A);
        assert!(sync_clock(&slow, false, 10).is_none());
        assert!(sync_clock(&limits_1010(), true, 9).is_some());
    }

    #[test]
    fn test_clamp_idempotent() {
        let l = limits_1010();
        let samples = [
            Transfer::new(9, 100, 0, 0),
            Transfer::new(5, 16, 1, 0),
            Transfer::new(40, 8, 3, 7),
            Transfer::new(10, 0, 1, 2),
            Transfer::new(255, 255, 255, 255),
        ];
        for t in samples {
            let once = l.clamp(t);
            assert_eq!(l.clamp(once), once, "{:?}", t);
        }
        assert_eq!(l.clamp(Transfer::new(9, 100, 0, 0)), Transfer::new(9, 62, 1, msg::PPR_OPT_DT));
        assert_eq!(l.clamp(Transfer::new(10, 0, 1, 2)), Transfer::new(0, 0, 1, 0));
    }

    #[test]
    fn test_prepare_wide_then_sync_in_one_exchange() {
        let l = limits_895();
        let mut tcb = target(&l);
        let mut out = ArrayVec::new();
        let kind = prepare_nego(&mut tcb, &l, CcbHandle(4), &mut out);
        assert_eq!(kind, Some(NegoKind::Wide));
        assert_eq!(out.as_slice(), &[1, 2, 3, 1]);
        assert_eq!(tcb.nego_cp, Some(CcbHandle(4)));

        // Only one negotiation at a time
        let mut other = ArrayVec::new();
        assert_eq!(prepare_nego(&mut tcb, &l, CcbHandle(5), &mut other), None);

        let reply = handle_message(&mut tcb, &l, Some(NegoKind::Wide), &[1, 2, 3, 1]);
        assert_eq!(
            reply,
            NegoReply::Send { bytes: sdtr(10, 31), kind: NegoKind::Sync, answer_expected: true }
        );
        let reply = handle_message(&mut tcb, &l, Some(NegoKind::Sync), &[1, 3, 1, 10, 31]);
        assert_eq!(reply, NegoReply::Accepted);
        assert_eq!(tcb.tinfo.curr, Transfer::new(10, 31, 1, 0));
        assert!(!tcb.check_nego);
    }

    #[test]
    fn test_factor_9_uses_ppr_with_dt() {
        let l = limits_1010();
        let mut tcb = Tcb::new(0);
        set_goal(&mut tcb, &l, Transfer::new(9, 62, 0, 0));
        let mut out = ArrayVec::new();
        assert_eq!(prepare_nego(&mut tcb, &l, CcbHandle(0), &mut out), Some(NegoKind::Ppr));
        assert_eq!(out.as_slice(), &[1, 6, 4, 9, 0, 62, 1, 2]);
    }

    #[test]
    fn test_clamped_answer_is_rejected() {
        let l = limits_895();
        let mut tcb = target(&l);
        tcb.tinfo.curr.width = 1;
        // Answer with an offset above what the chip does
        let reply = handle_message(&mut tcb, &l, Some(NegoKind::Sync), &[1, 3, 1, 10, 40]);
        assert_eq!(reply, NegoReply::Reject);
        assert_eq!(tcb.tinfo.curr.offset, 0);
        assert!(!tcb.check_nego);
    }

    #[test]
    fn test_request_clamped_to_user_limits() {
        let l = limits_895();
        let mut tcb = target(&l);
        tcb.tinfo.user = Transfer::new(12, 8, 1, 0);
        let reply = handle_message(&mut tcb, &l, None, &[1, 3, 1, 10, 31]);
        assert_eq!(reply, NegoReply::Send { bytes: sdtr(12, 8), kind: NegoKind::Sync, answer_expected: false });
        assert_eq!(tcb.tinfo.curr.offset, 8);
    }

    #[test]
    fn test_mismatched_answer_rejected() {
        let l = limits_895();
        let mut tcb = target(&l);
        let reply = handle_message(&mut tcb, &l, Some(NegoKind::Wide), &[1, 3, 1, 10, 31]);
        assert_eq!(reply, NegoReply::Reject);
    }

    #[test]
    fn test_ppr_dt_needs_wide() {
        let l = limits_1010();
        let mut tcb = Tcb::new(1);
        tcb.tinfo.user = l.clamp(Transfer::new(9, 62, 1, 2));
        let reply = handle_message(&mut tcb, &l, None, &[1, 6, 4, 9, 0, 62, 0, 2]);
        // Narrow request: no DT, offset and period back to ST limits
        assert_eq!(reply, NegoReply::Send { bytes: ppr(10, 31, 0, 0), kind: NegoKind::Ppr, answer_expected: false });
    }

    #[test]
    fn test_ppr_answer_out_of_range_goes_async() {
        let l = limits_1010();
        let mut tcb = Tcb::new(2);
        set_goal(&mut tcb, &l, Transfer::new(9, 62, 1, 2));
        tcb.tinfo.curr = Transfer::new(10, 31, 1, 0);
        // Offset above the DT limit
        let reply = handle_message(&mut tcb, &l, Some(NegoKind::Ppr), &[1, 6, 4, 9, 0, 100, 1, 2]);
        assert_eq!(reply, NegoReply::Reject);
        assert_eq!(tcb.tinfo.curr, Transfer::ASYNC);
    }

    #[test]
    fn test_reject_falls_back_once() {
        let l = limits_1010();
        let mut tcb = Tcb::new(6);
        set_goal(&mut tcb, &l, Transfer::new(9, 62, 1, 2));
        nego_rejected(&mut tcb, &l, NegoKind::Ppr);
        assert_eq!(tcb.tinfo.curr, Transfer::ASYNC);
        assert_eq!(tcb.tinfo.goal, Transfer::new(10, 31, 1, 0));
        assert!(tcb.check_nego);

        nego_rejected(&mut tcb, &l, NegoKind::Wide);
        assert_eq!(tcb.tinfo.goal, Transfer::new(10, 31, 0, 0));
        assert!(tcb.check_nego);

        nego_rejected(&mut tcb, &l, NegoKind::Sync);
        assert_eq!(tcb.tinfo.goal, Transfer::ASYNC);
        assert!(!tcb.check_nego);

        // PPR is never tried again
        set_goal(&mut tcb, &l, Transfer::new(9, 62, 1, 2));
        assert_eq!(tcb.tinfo.goal.options, 0);
    }

    #[test]
    fn test_sniff_without_sync_goes_async() {
        let l = limits_895();
        let mut tcb = Tcb::new(3);
        set_goal(&mut tcb, &l, Transfer::new(10, 16, 0, 0));
        let mut inq = [0u8; 36];
        inq[7] = inquiry::BYTE7_CMDQUE;
        let s = sniff_inquiry(&mut tcb, &l, &inq).unwrap();
        assert!(s.cmdque);
        assert!(!s.renegotiate);
        assert_eq!(tcb.tinfo.goal, Transfer::ASYNC);
        // Again with the same data: nothing changes
        assert_eq!(sniff_inquiry(&mut tcb, &l, &inq), Some(s));
        assert!(sniff_inquiry(&mut tcb, &l, &inq[..20]).is_none());
    }

    #[test]
    fn test_sniff_clamps_dt_offset() {
        let l = limits_1010();
        let mut tcb = Tcb::new(4);
        tcb.tinfo.user = Transfer::new(9, 62, 1, 2);
        let mut inq = [0u8; 64];
        inq[7] = inquiry::BYTE7_SYNC | inquiry::BYTE7_WBUS16;
        let s = sniff_inquiry(&mut tcb, &l, &inq).unwrap();
        assert!(s.renegotiate);
        assert_eq!(tcb.tinfo.goal, Transfer::new(10, 31, 1, 0));
        inq[56] = inquiry::BYTE56_CLOCKING_DT;
        sniff_inquiry(&mut tcb, &l, &inq).unwrap();
        assert_eq!(tcb.tinfo.goal, Transfer::new(9, 62, 1, 2));
    }
}
