//! # Host Control Block
//!
//! All state of one adapter: the targets, the CCB pool, the two queue
//! rings, the timeout wheel and the recovery actions in flight. Every
//! entry point (submission, interrupt, tick, administration) is a method
//! taking `&mut self`; [`crate::Adapter`] serializes them behind one lock.
//!
//! Completions are not delivered from here. They pile up in an internal
//! list that the caller drains once it released the lock, so a completion
//! handler is free to submit again.
//!
//! ## Command life
//!
//! ```text
//! queue ─► get_ccb ─► waiting ─► start_next_ccbs ─► started ─► start queue
//!                                                                  │
//!   free_ccb ◄── finish ◄── complete_ok / complete_error ◄── done queue
//! ```
//!
//! A LUN that never answered gets no LCB: one untagged probe at a time
//! goes straight to the start queue, tracked in the target's probe map.

use crate::ccb::{Ccb, CcbHandle, CcbPool, ChipStatus, HostStatus};
use crate::config::{DeviceQueueing, SymConfig};
use crate::defs::{msg, CCB_DMA_BYTES, LCB_DMA_BYTES, MAX_CDB, MAX_LUN, MAX_QUEUE, MAX_SG, MAX_START, MAX_TARGET, MAX_TASK};
use crate::lcb::{Admission, Lcb, TagPool, UnitFlags};
use crate::nego::{self, AdapterLimits, NegoReply, Sniffed};
use crate::nvram::{self, NvramKind, NvramSettings};
use crate::queue::{DoneQueue, StartQueue, QUEUE_BYTES};
use crate::recovery::{self, AbortReason, Escalation, RecoveryOutcome, RecoveryState, RecoveryWaiter};
use crate::scripts::{Resume, Scripts, ScriptsEvent, ScriptsPort};
use crate::scsi::{CommandId, CommandResult, CommandStatus, DataDirection, RequestId, ScsiRequest, SenseData, TagHint};
use crate::tcb::{TargetErrors, Tcb, TransInfo, Transfer};
use crate::timer::{TimerEntry, TimerWheel};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use static_assertions::const_assert;
use sym_hal::{BusAddr, DmaConstraints, HalError, NvramLines};
use sym_memory::{AllocatorStats, DmaBlock, DmaMemory, MemError, MemResult};

/// Bytes of the idle task that terminates the start queue
const IDLE_BYTES: usize = 16;

/// Bytes of a LUN's tag reselection table
const TAG_TABLE_BYTES: usize = MAX_TASK * 4;

// Every CCB can sit on the start queue with a free slot left for the marker
const_assert!(MAX_START < MAX_QUEUE);
const_assert!(1 + 2 + 8 <= crate::defs::MSG_OUT_LEN);

/// HCB result type
pub type HbaResult<T> = Result<T, HbaError>;

/// Errors of adapter operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbaError {
    /// DMA memory ran out
    OutOfMemory,
    /// Every CCB is in use and the pool is at its ceiling
    ResourceShortage,
    /// The LUN cannot take this command right now; retry later
    Busy,
    /// Target ID out of range or the adapter's own
    InvalidTarget,
    /// LUN out of range or not scanned
    InvalidLun,
    /// Malformed request
    InvalidRequest,
    /// The co-processor or the bus failed
    Hardware,
}

impl fmt::Display for HbaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HbaError::OutOfMemory => "out of DMA memory",
            HbaError::ResourceShortage => "no CCB available",
            HbaError::Busy => "unit busy",
            HbaError::InvalidTarget => "invalid target",
            HbaError::InvalidLun => "invalid LUN",
            HbaError::InvalidRequest => "invalid request",
            HbaError::Hardware => "hardware failure",
        };
        f.write_str(text)
    }
}

impl From<MemError> for HbaError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory => HbaError::OutOfMemory,
            MemError::InvalidSize | MemError::InvalidAddress | MemError::NotMapped => HbaError::ResourceShortage,
        }
    }
}

impl From<HalError> for HbaError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => HbaError::OutOfMemory,
            _ => HbaError::Hardware,
        }
    }
}

/// A finished command waiting to be handed to the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Cookie of the request
    pub request: RequestId,
    /// Outcome
    pub result: CommandResult,
}

// =============================================================================
// Statistics
// =============================================================================

/// Event counters, readable without taking the adapter lock
#[derive(Debug, Default)]
pub struct HbaCounters {
    queued: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    aborts: AtomicU64,
    queue_full: AtomicU64,
    negotiations: AtomicU64,
    target_resets: AtomicU64,
    bus_resets: AtomicU64,
    host_resets: AtomicU64,
}

impl HbaCounters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> HbaStats {
        HbaStats {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            negotiations: self.negotiations.load(Ordering::Relaxed),
            target_resets: self.target_resets.load(Ordering::Relaxed),
            bus_resets: self.bus_resets.load(Ordering::Relaxed),
            host_resets: self.host_resets.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the adapter counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HbaStats {
    /// Commands accepted
    pub queued: u64,
    /// Commands handed back
    pub completed: u64,
    /// Completions with a status other than good
    pub errors: u64,
    /// Completions with a timeout status
    pub timeouts: u64,
    /// Commands terminated by an abort
    pub aborts: u64,
    /// QUEUE FULL bounces absorbed by requeueing
    pub queue_full: u64,
    /// Negotiation messages sent
    pub negotiations: u64,
    /// Target resets seen
    pub target_resets: u64,
    /// Bus resets seen
    pub bus_resets: u64,
    /// Adapter reinitializations
    pub host_resets: u64,
}

/// Queueing state of one LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    /// Configured depth after device and user limits
    pub depth: u16,
    /// Current started limit
    pub started_max: u16,
    /// Commands not started yet
    pub waiting: usize,
    /// Commands on the start queue or at the device
    pub started: usize,
    /// Tags in use
    pub busy_tagged: u16,
    /// Untagged commands outstanding
    pub busy_untagged: u16,
}

// =============================================================================
// Recovery bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Target(u8),
    Bus,
}

#[derive(Debug)]
struct PendingRecovery {
    scope: Scope,
    state: Arc<RecoveryState>,
    deadline: u64,
    escalated: bool,
}

// =============================================================================
// HCB
// =============================================================================

/// Host control block
pub struct Hcb {
    config: SymConfig,
    limits: AdapterLimits,
    memory: DmaMemory,
    scripts: Box<dyn Scripts>,
    tcbs: [Tcb; MAX_TARGET],
    ccbs: CcbPool,
    squeue: StartQueue,
    dqueue: DoneQueue,
    idle: DmaBlock,
    wheel: TimerWheel,
    nvram: Option<NvramSettings>,
    pending: Vec<PendingRecovery>,
    completions: Vec<Completion>,
    bus_reset_seen: bool,
    counters: Arc<HbaCounters>,
}

impl fmt::Debug for Hcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hcb")
            .field("chip", &self.config.chip.name)
            .field("host_id", &self.config.host_id)
            .field("ccbs", &self.ccbs.count())
            .field("busy", &self.ccbs.busy.len())
            .field("now", &self.wheel.now())
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

fn alloc_rings(memory: &DmaMemory, dma: DmaConstraints) -> MemResult<(DmaBlock, DmaBlock, DmaBlock)> {
    let idle = memory.alloc(dma, IDLE_BYTES, "IDLE")?;
    let squeue = memory.alloc(dma, QUEUE_BYTES, "SQUEUE")?;
    let dqueue = memory.alloc(dma, QUEUE_BYTES, "DQUEUE")?;
    Ok((idle, squeue, dqueue))
}

impl Hcb {
    /// Bring an adapter up
    ///
    /// Reads NVRAM when `lines` is given and folds it into `config`,
    /// allocates the rings and the initial CCBs, computes every target's
    /// transfer ceiling, starts the co-processor and resets the bus unless
    /// told not to.
    pub fn attach(
        config: SymConfig,
        memory: DmaMemory,
        scripts: Box<dyn Scripts>,
        lines: Option<&mut dyn NvramLines>,
    ) -> HbaResult<Self> {
        let mut config = config.sanitized();
        let nvram = lines.and_then(|lines| nvram::read_nvram(lines, &config.chip));
        if let Some(settings) = &nvram {
            settings.apply_host(&mut config);
            config = config.sanitized();
        }
        let dma = config.dma;
        let (idle, squeue, dqueue) = match alloc_rings(&memory, dma) {
            Ok(blocks) => blocks,
            Err(err) => {
                log::error!("[sym] {}: cannot allocate queues: {:?}", config.chip.name, err);
                memory.destroy_pool(dma);
                return Err(err.into());
            }
        };

        let limits = AdapterLimits::from_chip(&config.chip);
        let mut tcbs: [Tcb; MAX_TARGET] = core::array::from_fn(|id| Tcb::new(id as u8));
        for tcb in tcbs.iter_mut() {
            let user = match &nvram {
                Some(settings) => {
                    let t = &settings.targets[usize::from(tcb.id)];
                    tcb.user_flags = t.flags;
                    tcb.user_tags = t.tags.min(config.max_tag);
                    limits.clamp(t.transfer)
                }
                None => {
                    tcb.user_tags = config.max_tag;
                    limits.best_transfer()
                }
            };
            tcb.tinfo.user = user;
            tcb.reset_transfer();
        }

        let mut hcb = Self {
            squeue: StartQueue::new(squeue, idle.bus),
            dqueue: DoneQueue::new(dqueue),
            idle,
            limits,
            memory,
            scripts,
            tcbs,
            ccbs: CcbPool::new(),
            wheel: TimerWheel::new(),
            nvram,
            pending: Vec::new(),
            completions: Vec::new(),
            bus_reset_seen: false,
            counters: Arc::new(HbaCounters::default()),
            config,
        };

        for _ in 0..hcb.config.initial_ccbs {
            if let Err(err) = hcb.alloc_ccb() {
                log::error!("[sym] {}: cannot allocate CCBs: {}", hcb.config.chip.name, err);
                hcb.release_memory();
                return Err(err);
            }
        }
        if let Err(err) = hcb.scripts.start(hcb.squeue.bus_addr(), hcb.dqueue.bus_addr()) {
            log::error!("[sym] {}: co-processor did not start: {:?}", hcb.config.chip.name, err);
            hcb.release_memory();
            return Err(err.into());
        }
        if !hcb.config.avoid_bus_reset {
            if let Err(err) = hcb.scripts.reset_bus() {
                log::warn!("[sym] {}: initial bus reset failed: {:?}", hcb.config.chip.name, err);
            }
        }
        log::info!(
            "[sym] {}: attached, host ID {}, {} CCBs, {} NVRAM",
            hcb.config.chip.name,
            hcb.config.host_id,
            hcb.ccbs.count(),
            match &hcb.nvram {
                Some(s) => match s.kind {
                    NvramKind::Symbios => "Symbios",
                    NvramKind::Tekram => "Tekram",
                },
                None => "no",
            }
        );
        Ok(hcb)
    }

    /// Quiesce the adapter and give all its memory back
    ///
    /// Every outstanding command is failed as flushed by a reset; the
    /// returned completions still have to be delivered.
    pub fn detach(mut self) -> Vec<Completion> {
        log::info!("[sym] {}: detaching", self.config.chip.name);
        if let Err(err) = self.scripts.reset_chip() {
            log::warn!("[sym] {}: chip reset at detach failed: {:?}", self.config.chip.name, err);
        }
        self.squeue.clear();
        self.dqueue.clear();
        self.flush_all(HostStatus::Reset);
        for p in self.pending.drain(..) {
            p.state.finish(RecoveryOutcome::Forced);
        }
        self.wheel.clear();
        self.release_memory();
        core::mem::take(&mut self.completions)
    }

    fn release_memory(&mut self) {
        let dma = self.config.dma;
        let mut blocks: Vec<(DmaBlock, &'static str)> = Vec::new();
        for tcb in self.tcbs.iter_mut() {
            for lcb in tcb.take_lcbs() {
                if let Some(tags) = lcb.tags {
                    blocks.push((tags.dma, "TAGS"));
                }
                blocks.push((lcb.dma, "LCB"));
            }
        }
        blocks.extend(self.ccbs.drain_dma().into_iter().map(|b| (b, "CCB")));
        blocks.push((self.squeue.dma, "SQUEUE"));
        blocks.push((self.dqueue.dma, "DQUEUE"));
        blocks.push((self.idle, "IDLE"));
        for (block, name) in blocks {
            if let Err(err) = self.memory.free(dma, block, name) {
                log::warn!("[sym] freeing {} at {}: {:?}", name, block.bus, err);
            }
        }
        self.memory.destroy_pool(dma);
    }

    // =========================================================================
    // Resources
    // =========================================================================

    fn alloc_ccb(&mut self) -> HbaResult<CcbHandle> {
        if self.ccbs.count() >= self.config.max_ccbs {
            return Err(HbaError::ResourceShortage);
        }
        let block = self.memory.alloc(self.config.dma, CCB_DMA_BYTES, "CCB")?;
        let h = self.ccbs.add(block);
        log::trace!("[sym] CCB {} at {}", h.index(), block.bus);
        Ok(h)
    }

    fn alloc_lcb(&mut self, target: u8, lun: u8) -> HbaResult<()> {
        if self.tcbs[usize::from(target)].lcb(lun).is_some() {
            return Ok(());
        }
        let block = self.memory.alloc(self.config.dma, LCB_DMA_BYTES, "LCB")?;
        let tcb = &mut self.tcbs[usize::from(target)];
        let mut lcb = Lcb::new(
            lun,
            block,
            tcb.user_flags,
            tcb.user_tags,
            self.config.max_tag,
            self.config.reorder_window,
        );
        lcb.device_queueing = tcb.lun_cmdque(lun);
        lcb.retune();
        log::debug!("[sym] target {} lun {}: LCB, depth {}", target, lun, lcb.queue_depth());
        tcb.install_lcb(lcb);
        Ok(())
    }

    /// Give tag resources to a LUN the first time it goes tagged
    ///
    /// Returns false when the table cannot be allocated; the LUN then
    /// keeps running untagged.
    fn ensure_tags(&mut self, target: u8, lun: u8) -> bool {
        match self.tcbs[usize::from(target)].lcb(lun) {
            Some(lcb) if lcb.tags.is_some() => return true,
            Some(_) => {}
            None => return false,
        }
        match self.memory.alloc(self.config.dma, TAG_TABLE_BYTES, "TAGS") {
            Ok(block) => {
                if let Some(lcb) = self.tcbs[usize::from(target)].lcb_mut(lun) {
                    lcb.tags = Some(TagPool::new(block));
                }
                true
            }
            Err(err) => {
                log::warn!("[sym] target {} lun {}: no tag table ({:?}), staying untagged", target, lun, err);
                false
            }
        }
    }

    /// Take a CCB for a command to `target`/`lun` and reserve its nexus
    fn get_ccb(&mut self, target: u8, lun: u8, hint: TagHint) -> HbaResult<CcbHandle> {
        let chip_mode = self.config.device_queueing == DeviceQueueing::Chip;
        let known = self.tcbs[usize::from(target)].lun_known(lun);
        let mut tagged = false;
        if known {
            self.alloc_lcb(target, lun)?;
            let Some(lcb) = self.tcbs[usize::from(target)].lcb(lun) else {
                return Err(HbaError::ResourceShortage);
            };
            tagged = hint != TagHint::Untagged && lcb.tags_allowed();
            if tagged {
                if usize::from(lcb.busy_itlq) >= MAX_TASK || (chip_mode && lcb.busy_itl != 0) {
                    return Err(HbaError::Busy);
                }
            } else if chip_mode && !lcb.is_idle() {
                return Err(HbaError::Busy);
            }
            if tagged && !self.ensure_tags(target, lun) {
                tagged = false;
            }
        } else {
            let tcb = &self.tcbs[usize::from(target)];
            if lun > 0 && tcb.user_flags.contains(UnitFlags::SCAN_LUNS_DISABLED) {
                return Err(HbaError::InvalidLun);
            }
            if tcb.probing(lun) {
                return Err(HbaError::Busy);
            }
        }

        let h = match self.ccbs.take_free() {
            Some(h) => h,
            None => {
                self.alloc_ccb()?;
                self.ccbs.take_free().ok_or(HbaError::ResourceShortage)?
            }
        };

        let ccb = self.ccbs.get_mut(h);
        ccb.reset_for_reuse();
        ccb.target = target;
        ccb.lun = lun;
        ccb.host_status = HostStatus::Busy;
        let ba = ccb.bus_addr();
        let tcb = &mut self.tcbs[usize::from(target)];
        if !known {
            tcb.set_probing(lun, true);
            return Ok(h);
        }
        let Some(lcb) = tcb.lcb_mut(lun) else {
            ccb.host_status = HostStatus::Idle;
            self.ccbs.put_free(h);
            return Err(HbaError::ResourceShortage);
        };
        if tagged {
            match lcb.alloc_tag(ba) {
                Some(tag) => {
                    ccb.tag = tag;
                    ccb.tag_msg = hint.message().unwrap_or(msg::SIMPLE_TAG);
                }
                None => {
                    ccb.host_status = HostStatus::Idle;
                    self.ccbs.put_free(h);
                    return Err(HbaError::Busy);
                }
            }
        } else {
            lcb.busy_itl += 1;
        }
        ccb.on_unit = true;
        Ok(h)
    }

    /// Release a CCB and everything it held
    fn free_ccb(&mut self, h: CcbHandle) {
        if self.ccbs.get(h).host_status == HostStatus::Idle {
            log::error!("[sym] CCB {} freed twice", h.index());
            return;
        }
        let arena = self.ccbs.arena_mut();
        let ccb = &arena[h.index()];
        let (target, lun, tag, bucket, ba) = (ccb.target, ccb.lun, ccb.tag, ccb.tags_si, ccb.bus_addr());
        let (on_unit, started, tagged) = (ccb.on_unit, ccb.started, ccb.is_tagged());
        let tcb = &mut self.tcbs[usize::from(target)];
        if on_unit {
            if let Some(lcb) = tcb.lcb_mut(lun) {
                if started {
                    lcb.started.remove(arena, h);
                    if tagged {
                        lcb.started_tags = lcb.started_tags.saturating_sub(1);
                        lcb.limiter.release(bucket);
                    } else {
                        lcb.started_no_tag = lcb.started_no_tag.saturating_sub(1);
                    }
                } else {
                    lcb.waiting.remove(arena, h);
                }
                if tagged {
                    lcb.free_tag(tag);
                } else {
                    lcb.busy_itl = lcb.busy_itl.saturating_sub(1);
                    if lcb.itl_task == ba {
                        lcb.itl_task = BusAddr::NULL;
                    }
                }
            }
        } else {
            tcb.set_probing(lun, false);
        }
        if tcb.nego_cp == Some(h) {
            tcb.nego_cp = None;
        }
        let ccb = &mut arena[h.index()];
        ccb.host_status = HostStatus::Idle;
        ccb.timer_gen = ccb.timer_gen.wrapping_add(1);
        ccb.started = false;
        ccb.on_unit = false;
        ccb.waiter = None;
        self.ccbs.put_free(h);
    }

    /// Live CCB behind a command handle
    pub(crate) fn ccb(&self, id: CommandId) -> Option<&Ccb> {
        self.ccbs
            .arena()
            .get(id.handle.index())
            .filter(|c| c.generation == id.generation && c.host_status != HostStatus::Idle)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    fn check_target(&self, target: u8) -> HbaResult<usize> {
        let t = usize::from(target);
        if t >= MAX_TARGET || target == self.config.host_id || (self.limits.maxwide == 0 && t >= 8) {
            return Err(HbaError::InvalidTarget);
        }
        Ok(t)
    }

    fn check_unit(&self, target: u8, lun: u8) -> HbaResult<usize> {
        let t = self.check_target(target)?;
        if usize::from(lun) >= MAX_LUN {
            return Err(HbaError::InvalidLun);
        }
        Ok(t)
    }

    fn validate(&self, req: &ScsiRequest<'_>) -> HbaResult<()> {
        self.check_unit(req.target, req.lun)?;
        if req.cdb.is_empty() || req.cdb.len() > MAX_CDB || req.segments.len() > MAX_SG {
            return Err(HbaError::InvalidRequest);
        }
        if req.data_len() > u64::from(u32::MAX) {
            return Err(HbaError::InvalidRequest);
        }
        match (req.direction, req.segments.is_empty()) {
            (DataDirection::None, false) | (DataDirection::In | DataDirection::Out, true) => {
                Err(HbaError::InvalidRequest)
            }
            _ => Ok(()),
        }
    }

    /// Accept a command
    ///
    /// The command is on its way once this returns; its outcome shows up
    /// in the completions. [`HbaError::Busy`] and
    /// [`HbaError::ResourceShortage`] mean try again later.
    pub fn queue(&mut self, req: &ScsiRequest<'_>) -> HbaResult<CommandId> {
        self.validate(req)?;
        let h = self.get_ccb(req.target, req.lun, req.tag)?;
        let timeout = if req.timeout_ticks == 0 { self.config.default_timeout_ticks } else { req.timeout_ticks };

        let on_unit = self.ccbs.get(h).on_unit;
        if on_unit {
            if let Some(lcb) = self.tcbs[usize::from(req.target)].lcb_mut(req.lun) {
                lcb.waiting.push_back(self.ccbs.arena_mut(), h);
            }
        }
        let ccb = self.ccbs.get_mut(h);
        if on_unit {
            ccb.host_status = HostStatus::Wait;
        }
        ccb.request = Some(req.id);
        ccb.direction = req.direction;
        ccb.data_len = req.data_len() as u32;
        ccb.timeout_ticks = timeout;
        if ccb.cdb.try_extend_from_slice(req.cdb).is_err() || ccb.sg.try_extend_from_slice(req.segments).is_err() {
            self.free_ccb(h);
            return Err(HbaError::InvalidRequest);
        }

        if on_unit {
            match self.config.device_queueing {
                DeviceQueueing::Emulated => {
                    self.start_next_ccbs(req.target, req.lun, usize::MAX);
                }
                DeviceQueueing::Chip => {
                    self.start_next_ccbs(req.target, req.lun, 1);
                    if !self.ccbs.get(h).started {
                        self.free_ccb(h);
                        return Err(HbaError::Busy);
                    }
                }
            }
        } else {
            self.put_start_queue(h);
        }

        let ccb = self.ccbs.get_mut(h);
        ccb.timer_gen = ccb.timer_gen.wrapping_add(1);
        ccb.deadline = self.wheel.arm(h, ccb.timer_gen, timeout);
        HbaCounters::bump(&self.counters.queued);
        log::trace!(
            "[sym] queued {} as CCB {} target {} lun {} tag {}",
            req.id,
            h.index(),
            req.target,
            req.lun,
            ccb.tag
        );
        Ok(CommandId { handle: h, generation: ccb.generation })
    }

    /// Build the selection messages of a CCB and publish it to the chip
    fn put_start_queue(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get_mut(h);
        let tcb = &mut self.tcbs[usize::from(ccb.target)];
        let ba = ccb.bus_addr();

        let mut identify = msg::IDENTIFY | (ccb.lun & 0x3f);
        if tcb.user_flags.contains(UnitFlags::DISC) {
            identify |= msg::IDENTIFY_DISC;
        }
        ccb.msg_out.clear();
        ccb.msg_out.push(identify);
        if ccb.is_tagged() {
            ccb.msg_out.push(ccb.tag_msg);
            ccb.msg_out.push(ccb.tag as u8);
        } else if ccb.on_unit {
            if let Some(lcb) = tcb.lcb_mut(ccb.lun) {
                lcb.itl_task = ba;
            }
        }
        ccb.nego_status = nego::prepare_nego(tcb, &self.limits, h, &mut ccb.msg_out);
        ccb.host_status = if ccb.nego_status.is_some() {
            HbaCounters::bump(&self.counters.negotiations);
            HostStatus::Negotiate
        } else {
            HostStatus::Busy
        };
        ccb.chip = ChipStatus::default();
        ccb.started = true;
        log::trace!("[sym] start {} target {} lun {} tag {}", ba, ccb.target, ccb.lun, ccb.tag);
        self.squeue.put(ba);
        self.scripts.signal();
    }

    /// Move waiting commands of a LUN to the start queue
    ///
    /// Stops at the first command that may not start yet, so a LUN's
    /// commands reach the chip in submission order. Returns how many went.
    pub(crate) fn start_next_ccbs(&mut self, target: u8, lun: u8, max: usize) -> usize {
        let mut picked = Vec::new();
        let arena = self.ccbs.arena_mut();
        let Some(lcb) = self.tcbs[usize::from(target)].lcb_mut(lun) else {
            return 0;
        };
        while picked.len() < max {
            let Some(h) = lcb.waiting.front() else {
                break;
            };
            let ccb = &mut arena[h.index()];
            if ccb.is_tagged() {
                if lcb.started_no_tag != 0 || lcb.started_tags >= lcb.started_max {
                    break;
                }
                match lcb.limiter.admit() {
                    Admission::Hold => break,
                    Admission::Go { bucket, ordered } => {
                        ccb.tags_si = bucket;
                        if ordered {
                            ccb.tag_msg = msg::ORDERED_TAG;
                        }
                    }
                }
                lcb.started_tags += 1;
            } else {
                if lcb.started_no_tag != 0 || lcb.started_tags != 0 {
                    break;
                }
                lcb.started_no_tag += 1;
            }
            lcb.waiting.remove(arena, h);
            lcb.started.push_back(arena, h);
            picked.push(h);
        }
        for &h in &picked {
            self.put_start_queue(h);
        }
        picked.len()
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Service the co-processor: drain the done queue and handle events
    pub fn interrupt(&mut self) {
        loop {
            let event = {
                let mut port = ScriptsPort::new(&mut self.squeue, &mut self.dqueue, &mut self.ccbs);
                self.scripts.next_event(&mut port)
            };
            self.drain_done();
            match event {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    fn drain_done(&mut self) {
        for dsa in self.dqueue.drain() {
            let Some(h) = self.ccbs.from_dsa(dsa) else {
                log::error!("[sym] done queue: unknown CCB address {}", dsa);
                continue;
            };
            let ccb = self.ccbs.get_mut(h);
            if !ccb.host_status.is_busy() {
                log::warn!("[sym] done queue: CCB {} not busy ({:?})", h.index(), ccb.host_status);
                continue;
            }
            ccb.host_status = match ccb.chip.host_status {
                Some(status) if status.is_done() => status,
                _ => HostStatus::Fail,
            };
            if recovery::completed_ok(ccb) {
                self.complete_ok(h);
            } else {
                self.complete_error(h);
            }
        }
    }

    fn complete_ok(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get(h);
        let (target, lun, on_unit, nego) = (ccb.target, ccb.lun, ccb.on_unit, ccb.nego_status);
        let tcb = &mut self.tcbs[usize::from(target)];
        if !tcb.lun_known(lun) {
            log::debug!("[sym] target {} lun {}: present", target, lun);
            tcb.mark_lun(lun);
        }
        tcb.errors.busfree = 0;
        if tcb.nego_cp == Some(h) {
            // The target went through the command without ever answering
            if let Some(kind) = nego {
                nego::nego_rejected(tcb, &self.limits, kind);
            }
            tcb.nego_cp = None;
        }
        if on_unit {
            if let Some(lcb) = tcb.lcb_mut(lun) {
                if lcb.note_good(self.config.queue_full_recover) {
                    log::debug!("[sym] target {} lun {}: started limit back to {}", target, lun, lcb.started_max);
                }
            }
        }
        self.finish(h);
    }

    fn complete_error(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get(h);
        let status = recovery::command_status(ccb);
        let (target, lun, nego) = (ccb.target, ccb.lun, ccb.nego_status);
        log::debug!("[sym] target {} lun {}: CCB {} {}", target, lun, h.index(), status);
        let tcb = &mut self.tcbs[usize::from(target)];
        match status {
            CommandStatus::QueueFull => {
                if self.requeue_queue_full(h) {
                    return;
                }
            }
            CommandStatus::UnexpectedBusFree => {
                tcb.errors.busfree += 1;
                if tcb.errors.busfree >= self.config.busfree_threshold {
                    log::warn!("[sym] target {}: {} unexpected disconnects, resetting", target, tcb.errors.busfree);
                    tcb.errors.busfree = 0;
                    self.finish(h);
                    self.reset_target_internal(target, false);
                    return;
                }
            }
            CommandStatus::ParityError => {
                tcb.errors.parity += 1;
                if tcb.errors.parity >= self.config.parity_threshold {
                    log::error!("[sym] target {}: {} parity errors, resetting the bus", target, tcb.errors.parity);
                    self.finish(h);
                    self.reset_bus_internal(false);
                    return;
                }
            }
            CommandStatus::SelectionTimeout => {
                tcb.errors.sel_timeouts += 1;
            }
            CommandStatus::NegotiationFailed => {
                if let Some(kind) = nego {
                    nego::nego_rejected(tcb, &self.limits, kind);
                }
            }
            _ => {}
        }
        self.finish(h);
    }

    /// Put a LUN's bounced and not yet fetched commands back in line
    ///
    /// Only with emulated device queueing, and only until the command ran
    /// out of retries. The started limit drops to what the device still
    /// holds.
    fn requeue_queue_full(&mut self, h: CcbHandle) -> bool {
        if self.config.device_queueing != DeviceQueueing::Emulated {
            return false;
        }
        let ccb = self.ccbs.get(h);
        if !ccb.on_unit || ccb.queue_full_count >= self.config.queue_full_retries {
            return false;
        }
        let (target, lun) = (ccb.target, ccb.lun);
        HbaCounters::bump(&self.counters.queue_full);

        let mut pulled = Vec::with_capacity(1);
        pulled.push(h);
        pulled.extend(self.squeue.dequeue_matching(&self.ccbs, |c| c.target == target && c.lun == lun));

        let arena = self.ccbs.arena_mut();
        arena[h.index()].queue_full_count += 1;
        let tcb = &mut self.tcbs[usize::from(target)];
        let Some(lcb) = tcb.lcb_mut(lun) else {
            return false;
        };
        for &p in pulled.iter().rev() {
            let ccb = &mut arena[p.index()];
            if ccb.is_tagged() {
                lcb.started_tags = lcb.started_tags.saturating_sub(1);
                lcb.limiter.release(ccb.tags_si);
            } else {
                lcb.started_no_tag = lcb.started_no_tag.saturating_sub(1);
            }
            ccb.started = false;
            ccb.host_status = HostStatus::Wait;
            ccb.chip = ChipStatus::default();
            ccb.nego_status = None;
            lcb.started.remove(arena, p);
            lcb.waiting.push_front(arena, p);
        }
        lcb.note_queue_full();
        log::warn!(
            "[sym] target {} lun {}: queue full, {} requeued, started limit {}",
            target,
            lun,
            pulled.len(),
            lcb.started_max
        );
        if tcb.nego_cp.is_some_and(|cp| pulled.contains(&cp)) {
            tcb.nego_cp = None;
        }
        self.start_next_ccbs(target, lun, usize::MAX);
        true
    }

    /// Report a command and release its CCB
    fn retire(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get_mut(h);
        let status = recovery::command_status(ccb);
        let complete = ccb.host_status == HostStatus::Complete;
        let result = CommandResult {
            status,
            scsi_status: if complete { ccb.chip.scsi_status } else { crate::defs::status::ILLEGAL },
            sense: if status == CommandStatus::CheckCondition { ccb.chip.sense.clone() } else { SenseData::new() },
            residual: if complete { ccb.chip.residual } else { ccb.data_len },
        };
        if let Some(waiter) = ccb.waiter.take() {
            let outcome =
                if ccb.escalation > Escalation::Abort { RecoveryOutcome::Forced } else { RecoveryOutcome::Completed };
            waiter.finish(outcome);
        }
        let request = ccb.request.take();
        log::debug!("[sym] target {} lun {}: CCB {} done, {}", ccb.target, ccb.lun, h.index(), status);

        HbaCounters::bump(&self.counters.completed);
        if !status.is_good() {
            HbaCounters::bump(&self.counters.errors);
        }
        match status {
            CommandStatus::Timeout => HbaCounters::bump(&self.counters.timeouts),
            CommandStatus::Aborted => HbaCounters::bump(&self.counters.aborts),
            _ => {}
        }
        if let Some(request) = request {
            self.completions.push(Completion { request, result });
        }
        self.free_ccb(h);
    }

    /// Retire a command and let its LUN start the next ones
    fn finish(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get(h);
        let (target, lun, on_unit) = (ccb.target, ccb.lun, ccb.on_unit);
        self.retire(h);
        if on_unit {
            self.start_next_ccbs(target, lun, usize::MAX);
        }
    }

    /// Retire every handed out CCB with `status`
    fn flush_all(&mut self, status: HostStatus) {
        for h in self.ccbs.busy.to_vec(self.ccbs.arena()) {
            self.ccbs.get_mut(h).host_status = status;
            self.retire(h);
        }
    }

    // =========================================================================
    // Co-processor events
    // =========================================================================

    fn handle_event(&mut self, event: ScriptsEvent) {
        match event {
            ScriptsEvent::Message { dsa, bytes } => self.handle_message(dsa, &bytes),
            ScriptsEvent::MessageReject { dsa } => self.handle_reject(dsa),
            ScriptsEvent::Stopped => self.handle_stopped(),
            ScriptsEvent::TaskAborted { target, lun, tag } => self.handle_task_aborted(target, lun, tag),
            ScriptsEvent::TargetReset { target } => self.handle_target_reset(target),
            ScriptsEvent::BusReset => self.handle_bus_reset(),
            ScriptsEvent::Fatal => {
                log::error!("[sym] {}: fatal co-processor error", self.config.chip.name);
                self.reset_host_internal();
            }
        }
    }

    fn handle_message(&mut self, dsa: BusAddr, bytes: &[u8]) {
        let Some(h) = self.ccbs.from_dsa(dsa) else {
            log::error!("[sym] message on unknown CCB {}", dsa);
            self.scripts.resume(Resume::RejectMessage);
            return;
        };
        let ccb = self.ccbs.get_mut(h);
        let tcb = &mut self.tcbs[usize::from(ccb.target)];
        let ours = ccb.host_status == HostStatus::Negotiate && tcb.nego_cp == Some(h);
        let awaiting = if ours { ccb.nego_status } else { None };
        let resume = match nego::handle_message(tcb, &self.limits, awaiting, bytes) {
            NegoReply::Accepted => Resume::ClearAck,
            NegoReply::Send { bytes, kind, answer_expected } => {
                if answer_expected {
                    ccb.nego_status = Some(kind);
                    ccb.host_status = HostStatus::Negotiate;
                    tcb.nego_cp = Some(h);
                    HbaCounters::bump(&self.counters.negotiations);
                }
                Resume::SendMessage(bytes)
            }
            NegoReply::Reject => Resume::RejectMessage,
        };
        let continuing = matches!(resume, Resume::SendMessage(_)) && tcb.nego_cp == Some(h);
        if ours && !continuing {
            ccb.nego_status = None;
            ccb.host_status = HostStatus::Busy;
            tcb.nego_cp = None;
        }
        self.scripts.resume(resume);
    }

    fn handle_reject(&mut self, dsa: BusAddr) {
        if let Some(h) = self.ccbs.from_dsa(dsa) {
            let ccb = self.ccbs.get_mut(h);
            let tcb = &mut self.tcbs[usize::from(ccb.target)];
            if ccb.host_status == HostStatus::Negotiate && tcb.nego_cp == Some(h) {
                if let Some(kind) = ccb.nego_status.take() {
                    nego::nego_rejected(tcb, &self.limits, kind);
                }
                tcb.nego_cp = None;
                ccb.host_status = HostStatus::Busy;
            } else {
                log::debug!("[sym] target {}: MESSAGE REJECT ignored", ccb.target);
            }
        }
        self.scripts.resume(Resume::ClearAck);
    }

    /// The engine halted: pull or abort every command flagged for abort
    fn handle_stopped(&mut self) {
        let arena = self.ccbs.arena();
        let victims: Vec<CcbHandle> = self
            .ccbs
            .busy
            .iter(arena)
            .filter(|h| {
                let c = &arena[h.index()];
                c.to_abort != 0 && c.started && !c.abort_sent && c.host_status.is_busy()
            })
            .collect();
        for h in victims {
            let ccb = self.ccbs.get(h);
            if self.squeue.contains(ccb.bus_addr()) {
                let _ = self.squeue.dequeue_matching(&self.ccbs, |c| c.handle == h);
                self.ccbs.get_mut(h).host_status = HostStatus::Aborted;
                self.finish(h);
            } else {
                let ccb = self.ccbs.get_mut(h);
                ccb.abort_sent = true;
                log::warn!("[sym] target {} lun {}: ABORT TASK tag {}", ccb.target, ccb.lun, ccb.tag);
                self.scripts.abort_task(ccb.target, ccb.lun, ccb.tag);
            }
        }
        self.scripts.resume(Resume::Continue);
    }

    fn handle_task_aborted(&mut self, target: u8, lun: u8, tag: u16) {
        let arena = self.ccbs.arena();
        let hits: Vec<CcbHandle> = self
            .ccbs
            .busy
            .iter(arena)
            .filter(|h| {
                let c = &arena[h.index()];
                c.target == target && c.lun == lun && c.tag == tag && c.started && c.host_status.is_busy()
            })
            .collect();
        if hits.is_empty() {
            log::debug!("[sym] target {} lun {}: abort of tag {} matched nothing", target, lun, tag);
        }
        for h in hits {
            self.ccbs.get_mut(h).host_status = HostStatus::Aborted;
            self.finish(h);
        }
    }

    fn handle_target_reset(&mut self, target: u8) {
        log::warn!("[sym] target {}: reset", target);
        HbaCounters::bump(&self.counters.target_resets);
        let _ = self.squeue.dequeue_matching(&self.ccbs, |c| c.target == target);
        let arena = self.ccbs.arena();
        let hits: Vec<CcbHandle> = self
            .ccbs
            .busy
            .iter(arena)
            .filter(|h| {
                let c = &arena[h.index()];
                c.target == target && c.started && c.host_status.is_busy()
            })
            .collect();
        for h in hits {
            self.ccbs.get_mut(h).host_status = HostStatus::Reset;
            self.retire(h);
        }
        let tcb = &mut self.tcbs[usize::from(target)];
        tcb.reset_transfer();
        tcb.errors.busfree = 0;
        let luns: Vec<u8> = tcb.lcbs().map(|l| l.lun).collect();
        self.pending.retain(|p| {
            if p.scope == Scope::Target(target) {
                p.state.finish(RecoveryOutcome::Completed);
                false
            } else {
                true
            }
        });
        for lun in luns {
            self.start_next_ccbs(target, lun, usize::MAX);
        }
    }

    fn reset_transfers(&mut self) {
        for tcb in self.tcbs.iter_mut() {
            tcb.reset_transfer();
            tcb.errors = TargetErrors::default();
            for lcb in tcb.lcbs_mut() {
                lcb.limiter.reset();
            }
        }
    }

    fn handle_bus_reset(&mut self) {
        log::warn!("[sym] {}: SCSI bus reset", self.config.chip.name);
        HbaCounters::bump(&self.counters.bus_resets);
        self.squeue.clear();
        self.flush_all(HostStatus::Reset);
        self.reset_transfers();
        self.bus_reset_seen = true;
        for p in self.pending.drain(..) {
            let outcome = match p.scope {
                Scope::Bus if !p.escalated => RecoveryOutcome::Completed,
                _ => RecoveryOutcome::Forced,
            };
            p.state.finish(outcome);
        }
    }

    // =========================================================================
    // Recovery actions
    // =========================================================================

    fn recovery_deadline(&self) -> u64 {
        self.wheel.now() + u64::from(self.config.recovery_timeout_ticks)
    }

    fn reset_host_internal(&mut self) {
        log::error!("[sym] {}: reinitializing adapter", self.config.chip.name);
        HbaCounters::bump(&self.counters.host_resets);
        if let Err(err) = self.scripts.reset_chip() {
            log::error!("[sym] {}: chip reset failed: {:?}", self.config.chip.name, err);
        }
        self.squeue.clear();
        self.dqueue.clear();
        self.flush_all(HostStatus::Reset);
        self.reset_transfers();
        for p in self.pending.drain(..) {
            p.state.finish(RecoveryOutcome::Forced);
        }
        self.bus_reset_seen = true;
        if let Err(err) = self.scripts.start(self.squeue.bus_addr(), self.dqueue.bus_addr()) {
            log::error!("[sym] {}: co-processor did not restart: {:?}", self.config.chip.name, err);
        }
    }

    fn reset_bus_internal(&mut self, escalated: bool) -> (Arc<RecoveryState>, u64) {
        if let Some(p) = self.pending.iter().find(|p| p.scope == Scope::Bus) {
            return (p.state.clone(), p.deadline);
        }
        let state = RecoveryState::new();
        let deadline = self.recovery_deadline();
        log::error!("[sym] {}: resetting SCSI bus", self.config.chip.name);
        let failed = self.scripts.reset_bus().is_err();
        self.pending.push(PendingRecovery { scope: Scope::Bus, state: state.clone(), deadline, escalated: escalated || failed });
        if failed {
            log::error!("[sym] {}: bus reset failed", self.config.chip.name);
            self.reset_host_internal();
        }
        (state, deadline)
    }

    fn reset_target_internal(&mut self, target: u8, escalated: bool) -> (Arc<RecoveryState>, u64) {
        if let Some(p) = self.pending.iter().find(|p| p.scope == Scope::Target(target)) {
            return (p.state.clone(), p.deadline);
        }
        let state = RecoveryState::new();
        let deadline = self.recovery_deadline();
        log::error!("[sym] target {}: sending TARGET RESET", target);
        self.pending.push(PendingRecovery { scope: Scope::Target(target), state: state.clone(), deadline, escalated });
        self.scripts.reset_target(target);
        (state, deadline)
    }

    /// Take a command back from wherever it is
    fn abort_ccb(&mut self, h: CcbHandle) {
        let ccb = self.ccbs.get(h);
        if !ccb.started {
            self.ccbs.get_mut(h).host_status = HostStatus::Aborted;
            self.finish(h);
            return;
        }
        if self.squeue.contains(ccb.bus_addr()) {
            let _ = self.squeue.dequeue_matching(&self.ccbs, |c| c.handle == h);
            self.ccbs.get_mut(h).host_status = HostStatus::Aborted;
            self.finish(h);
            return;
        }
        self.scripts.request_stop();
    }

    /// Advance time by one tick
    ///
    /// Commands reaching their deadline move up the escalation ladder;
    /// recovery actions whose own deadline passed are replaced by the next
    /// heavier one.
    pub fn tick(&mut self) {
        let ccbs = &self.ccbs;
        let due = self.wheel.tick(|e| {
            ccbs.arena()
                .get(e.handle.index())
                .is_some_and(|c| c.timer_gen == e.generation && c.host_status != HostStatus::Idle)
        });
        for entry in due {
            self.expire(entry);
        }
        self.check_pending();
    }

    fn expire(&mut self, entry: TimerEntry) {
        let h = entry.handle;
        let ccb = self.ccbs.get_mut(h);
        // An earlier expiry on this tick may have reset the host
        if ccb.timer_gen != entry.generation || ccb.host_status == HostStatus::Idle {
            return;
        }
        let generation = ccb.generation;
        let level = ccb.escalation.next();
        ccb.escalation = level;
        let target = ccb.target;
        log::error!(
            "[sym] target {} lun {} tag {}: timed out, escalating to {:?}",
            ccb.target,
            ccb.lun,
            ccb.tag,
            level
        );
        match level {
            Escalation::None => {}
            Escalation::Abort => {
                if ccb.to_abort == 0 {
                    ccb.to_abort = AbortReason::Timeout as u8;
                }
                self.abort_ccb(h);
            }
            Escalation::TargetReset => {
                self.reset_target_internal(target, true);
            }
            Escalation::BusReset => {
                self.reset_bus_internal(true);
            }
            Escalation::HostReset => self.reset_host_internal(),
        }
        let ccb = self.ccbs.get_mut(h);
        if ccb.generation == generation && ccb.host_status != HostStatus::Idle {
            ccb.timer_gen = ccb.timer_gen.wrapping_add(1);
            ccb.deadline = self.wheel.arm(h, ccb.timer_gen, self.config.recovery_timeout_ticks);
        }
    }

    fn check_pending(&mut self) {
        self.pending.retain(|p| !p.state.is_done());
        let now = self.wheel.now();
        let mut escalate_bus = false;
        let mut escalate_host = false;
        for p in self.pending.iter_mut().filter(|p| p.deadline <= now) {
            p.escalated = true;
            p.deadline = u64::MAX;
            match p.scope {
                Scope::Target(t) => {
                    log::error!("[sym] target {}: reset not confirmed in time", t);
                    escalate_bus = true;
                }
                Scope::Bus => {
                    log::error!("[sym] {}: bus reset not confirmed in time", self.config.chip.name);
                    escalate_host = true;
                }
            }
        }
        if escalate_host {
            self.reset_host_internal();
        } else if escalate_bus {
            self.reset_bus_internal(true);
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Abort one command
    ///
    /// A command not yet fetched by the chip completes as aborted on the
    /// spot. Otherwise the engine is stopped and ABORT TASK goes out; an
    /// abort of a command already being aborted resets the bus.
    pub fn abort(&mut self, id: CommandId) -> RecoveryWaiter {
        let now = self.wheel.now();
        if self.ccb(id).is_none() {
            return RecoveryWaiter::finished(RecoveryOutcome::NotFound, now);
        }
        let h = id.handle;
        let ccb = self.ccbs.get_mut(h);
        if let Some(state) = ccb.waiter.clone() {
            log::warn!("[sym] target {}: second abort of CCB {}, resetting the bus", ccb.target, h.index());
            ccb.escalation = ccb.escalation.max(Escalation::BusReset);
            let (_, deadline) = self.reset_bus_internal(false);
            return RecoveryWaiter::new(state, deadline);
        }
        let state = RecoveryState::new();
        ccb.waiter = Some(state.clone());
        if ccb.to_abort == 0 {
            ccb.to_abort = AbortReason::Host as u8;
        }
        ccb.escalation = ccb.escalation.max(Escalation::Abort);
        ccb.timer_gen = ccb.timer_gen.wrapping_add(1);
        ccb.deadline = self.wheel.arm(h, ccb.timer_gen, self.config.recovery_timeout_ticks);
        let deadline = ccb.deadline;
        log::warn!("[sym] target {} lun {}: aborting CCB {}", ccb.target, ccb.lun, h.index());
        self.abort_ccb(h);
        RecoveryWaiter::new(state, deadline)
    }

    /// Send TARGET RESET to a target
    pub fn reset_target(&mut self, target: u8) -> HbaResult<RecoveryWaiter> {
        self.check_target(target)?;
        let (state, deadline) = self.reset_target_internal(target, false);
        Ok(RecoveryWaiter::new(state, deadline))
    }

    /// Reset the SCSI bus
    pub fn reset_bus(&mut self) -> RecoveryWaiter {
        let (state, deadline) = self.reset_bus_internal(false);
        RecoveryWaiter::new(state, deadline)
    }

    /// Reset the chip and start over; finishes synchronously
    pub fn reset_host(&mut self) -> RecoveryWaiter {
        self.reset_host_internal();
        RecoveryWaiter::finished(RecoveryOutcome::Completed, self.wheel.now())
    }

    /// Set a target's transfer ceiling and renegotiate towards it
    ///
    /// Returns the goal after clamping to adapter and device limits.
    pub fn set_negotiation_goal(&mut self, target: u8, requested: Transfer) -> HbaResult<Transfer> {
        let t = self.check_target(target)?;
        let tcb = &mut self.tcbs[t];
        tcb.rejected = Default::default();
        nego::set_goal(tcb, &self.limits, requested);
        log::info!("[sym] target {}: goal {:?}", target, tcb.tinfo.goal);
        Ok(tcb.tinfo.goal)
    }

    /// Change the tagged queue depth of a LUN
    ///
    /// Returns the depth in effect, which may be lower than asked for when
    /// the adapter or the device cannot go that deep.
    pub fn set_queue_depth(&mut self, target: u8, lun: u8, depth: u16) -> HbaResult<u16> {
        let t = self.check_unit(target, lun)?;
        self.alloc_lcb(target, lun)?;
        let Some(lcb) = self.tcbs[t].lcb_mut(lun) else {
            return Err(HbaError::ResourceShortage);
        };
        lcb.user_tags = depth.max(1);
        lcb.retune();
        let effective = lcb.queue_depth();
        log::info!("[sym] target {} lun {}: queue depth {}", target, lun, effective);
        self.start_next_ccbs(target, lun, usize::MAX);
        Ok(effective)
    }

    /// Learn a device's capabilities from its standard INQUIRY data
    pub fn sniff_inquiry(&mut self, target: u8, lun: u8, data: &[u8]) -> HbaResult<Option<Sniffed>> {
        let t = self.check_unit(target, lun)?;
        let tcb = &mut self.tcbs[t];
        let Some(sniffed) = nego::sniff_inquiry(tcb, &self.limits, data) else {
            return Ok(None);
        };
        tcb.set_lun_cmdque(lun, sniffed.cmdque);
        if let Some(lcb) = tcb.lcb_mut(lun) {
            lcb.device_queueing = sniffed.cmdque;
            lcb.retune();
        }
        Ok(Some(sniffed))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Transfer parameters of a target
    pub fn transfer_info(&self, target: u8) -> HbaResult<TransInfo> {
        let t = self.check_target(target)?;
        Ok(self.tcbs[t].tinfo)
    }

    /// Queueing state of a LUN, `None` before its first command
    pub fn unit_status(&self, target: u8, lun: u8) -> HbaResult<Option<UnitStatus>> {
        let t = self.check_unit(target, lun)?;
        Ok(self.tcbs[t].lcb(lun).map(|lcb| UnitStatus {
            depth: lcb.queue_depth(),
            started_max: lcb.started_max,
            waiting: lcb.waiting.len(),
            started: lcb.started.len(),
            busy_tagged: lcb.busy_itlq,
            busy_untagged: lcb.busy_itl,
        }))
    }

    /// Counter snapshot
    pub fn stats(&self) -> HbaStats {
        self.counters.snapshot()
    }

    /// Shared counters
    pub fn counters(&self) -> Arc<HbaCounters> {
        self.counters.clone()
    }

    /// DMA allocator statistics
    pub fn memory_stats(&self) -> AllocatorStats {
        self.memory.stats()
    }

    /// Settings read from NVRAM at attach
    pub fn nvram(&self) -> Option<&NvramSettings> {
        self.nvram.as_ref()
    }

    /// Effective configuration
    pub fn config(&self) -> &SymConfig {
        &self.config
    }

    /// Transfer limits of the chip
    pub fn limits(&self) -> &AdapterLimits {
        &self.limits
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.wheel.now()
    }

    /// CCBs handed out
    pub fn busy_ccbs(&self) -> usize {
        self.ccbs.busy.len()
    }

    /// CCBs ready for reuse
    pub fn free_ccbs(&self) -> usize {
        self.ccbs.free.len()
    }

    /// Take the completions collected so far
    pub fn take_completions(&mut self) -> Vec<Completion> {
        core::mem::take(&mut self.completions)
    }

    /// Whether a bus reset happened since the last call
    pub fn take_bus_reset(&mut self) -> bool {
        core::mem::take(&mut self.bus_reset_seen)
    }
}
