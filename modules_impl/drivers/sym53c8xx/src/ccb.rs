//! # Command Control Blocks
//!
//! CCBs live in an arena and are addressed by a stable [`CcbHandle`]. Each
//! owns a chip-visible DMA area whose bus address is what the co-processor
//! sees; a hash map turns that address back into a handle in O(1).
//!
//! Queue membership is kept with index links inside the CCB itself: one
//! link pair for the adapter's free/busy lists, one for the LUN's
//! waiting/started lists.

use crate::defs::{CCB_SG_OFFSET, MAX_SG, MSG_OUT_LEN, NO_TAG};
use crate::nego::NegoKind;
use crate::recovery::{Escalation, RecoveryState};
use crate::scsi::{Cdb, DataDirection, DataSegment, RequestId, SenseData};
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use hashbrown::HashMap;
use sym_hal::BusAddr;
use sym_memory::DmaBlock;

/// Stable index of a CCB in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CcbHandle(pub(crate) u16);

impl CcbHandle {
    /// Arena index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Host status of a command, shared with the co-processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// On the free list
    Idle,
    /// Queued or running
    Busy,
    /// Running with a negotiation message pending
    Negotiate,
    /// Target disconnected, waiting for reselection
    Disconnected,
    /// Waiting for a resource on the chip
    Wait,
    /// Finished, see the SCSI status
    Complete,
    /// Selection timed out
    SelTimeout,
    /// Terminated by a SCSI reset
    Reset,
    /// Terminated by an abort message
    Aborted,
    /// Terminated by the timeout handler
    Timeout,
    /// Target reported a failure the chip could not classify
    Fail,
    /// Unexpected disconnect
    Unexpected,
}

impl HostStatus {
    /// Whether the command reached a terminal state
    pub const fn is_done(self) -> bool {
        matches!(
            self,
            HostStatus::Complete
                | HostStatus::SelTimeout
                | HostStatus::Reset
                | HostStatus::Aborted
                | HostStatus::Timeout
                | HostStatus::Fail
                | HostStatus::Unexpected
        )
    }

    /// Whether the command is owned by the chip
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            HostStatus::Busy | HostStatus::Negotiate | HostStatus::Disconnected | HostStatus::Wait
        )
    }
}

bitflags! {
    /// Extended error conditions reported by the co-processor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XErr: u8 {
        /// Target offered more data than the buffer holds
        const EXTRA_DATA  = 0x01;
        /// Illegal phase sequence
        const BAD_PHASE   = 0x02;
        /// Unrecovered parity or CRC error
        const PARITY_ERR  = 0x04;
        /// SODL underrun on a wide output
        const SODL_UNRUN  = 0x08;
        /// SWIDE overrun on a wide input
        const SWIDE_OVRUN = 0x10;
    }
}

/// Status area the co-processor writes into a CCB
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipStatus {
    /// Host status, `None` while the chip has not touched it
    pub host_status: Option<HostStatus>,
    /// SCSI status byte
    pub scsi_status: u8,
    /// Extended errors
    pub xerr: XErr,
    /// Bytes not transferred
    pub residual: u32,
    /// Auto-sense data
    pub sense: SenseData,
}

impl ChipStatus {
    /// A clean completion
    pub fn good() -> Self {
        Self { host_status: Some(HostStatus::Complete), ..Self::default() }
    }

    /// Completion with a given SCSI status
    pub fn scsi(status: u8) -> Self {
        Self { host_status: Some(HostStatus::Complete), scsi_status: status, ..Self::default() }
    }

    /// Termination with a host status
    pub fn host(host_status: HostStatus) -> Self {
        Self { host_status: Some(host_status), ..Self::default() }
    }
}

/// Prev/next pair threading a CCB through one kind of list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    prev: Option<CcbHandle>,
    next: Option<CcbHandle>,
}

/// Which link pair a list threads through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// Adapter free/busy lists
    Adapter,
    /// LUN waiting/started lists
    Unit,
}

/// Per-command state
#[derive(Debug)]
pub struct Ccb {
    /// Own handle
    pub handle: CcbHandle,
    /// Chip-visible area
    pub dma: DmaBlock,
    /// Reuse counter, invalidates stale [`crate::CommandId`]s and timers
    pub generation: u32,
    /// Host status
    pub host_status: HostStatus,
    /// Target ID
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    /// Tag, or [`NO_TAG`]
    pub tag: u16,
    /// Tag message for tagged commands
    pub tag_msg: u8,
    /// Collaborator's cookie
    pub request: Option<RequestId>,
    /// Command bytes
    pub cdb: Cdb,
    /// Data direction
    pub direction: DataDirection,
    /// Scatter/gather table
    pub sg: ArrayVec<DataSegment, MAX_SG>,
    /// Total data length
    pub data_len: u32,
    /// Message-out bytes sent on selection
    pub msg_out: ArrayVec<u8, MSG_OUT_LEN>,
    /// Negotiation carried by this command
    pub nego_status: Option<NegoKind>,
    /// What the chip wrote back
    pub chip: ChipStatus,
    /// Abort request: 0 none, 1 host request, 2 timeout
    pub to_abort: u8,
    /// Recovery level reached for this command
    pub escalation: Escalation,
    /// Timeout in ticks
    pub timeout_ticks: u32,
    /// Tick at which the current timer expires
    pub deadline: u64,
    /// Timer entry generation, bumped on every arm and disarm
    pub timer_gen: u32,
    /// Placed on the start queue
    pub started: bool,
    /// Accounted in its LCB's lists and counters
    pub on_unit: bool,
    /// ABORT TASK was handed to the co-processor
    pub abort_sent: bool,
    /// Reordering limiter bucket it was counted in
    pub tags_si: u8,
    /// QUEUE FULL bounces so far
    pub queue_full_count: u8,
    /// Waiter of a host-initiated recovery
    pub waiter: Option<Arc<RecoveryState>>,
    adapter_links: Links,
    unit_links: Links,
}

impl Ccb {
    fn new(handle: CcbHandle, dma: DmaBlock) -> Self {
        Self {
            handle,
            dma,
            generation: 0,
            host_status: HostStatus::Idle,
            target: 0,
            lun: 0,
            tag: NO_TAG,
            tag_msg: 0,
            request: None,
            cdb: Cdb::new(),
            direction: DataDirection::None,
            sg: ArrayVec::new(),
            data_len: 0,
            msg_out: ArrayVec::new(),
            nego_status: None,
            chip: ChipStatus::default(),
            to_abort: 0,
            escalation: Escalation::None,
            timeout_ticks: 0,
            deadline: 0,
            timer_gen: 0,
            started: false,
            on_unit: false,
            abort_sent: false,
            tags_si: 0,
            queue_full_count: 0,
            waiter: None,
            adapter_links: Links::default(),
            unit_links: Links::default(),
        }
    }

    /// Bus address the chip knows this CCB by
    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.dma.bus
    }

    /// Bus address of the scatter/gather table
    #[inline]
    pub fn sg_bus_addr(&self) -> BusAddr {
        self.dma.bus_at(CCB_SG_OFFSET)
    }

    /// Whether the command carries a tag
    #[inline]
    pub fn is_tagged(&self) -> bool {
        self.tag != NO_TAG
    }

    /// Clear per-command fields before reuse
    pub(crate) fn reset_for_reuse(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.tag = NO_TAG;
        self.tag_msg = 0;
        self.request = None;
        self.cdb.clear();
        self.direction = DataDirection::None;
        self.sg.clear();
        self.data_len = 0;
        self.msg_out.clear();
        self.nego_status = None;
        self.chip = ChipStatus::default();
        self.to_abort = 0;
        self.escalation = Escalation::None;
        self.timer_gen = self.timer_gen.wrapping_add(1);
        self.started = false;
        self.on_unit = false;
        self.abort_sent = false;
        self.tags_si = 0;
        self.queue_full_count = 0;
        self.waiter = None;
    }

    fn links_mut(&mut self, chain: Chain) -> &mut Links {
        match chain {
            Chain::Adapter => &mut self.adapter_links,
            Chain::Unit => &mut self.unit_links,
        }
    }

    fn links(&self, chain: Chain) -> &Links {
        match chain {
            Chain::Adapter => &self.adapter_links,
            Chain::Unit => &self.unit_links,
        }
    }
}

// =============================================================================
// Index-linked lists
// =============================================================================

/// Doubly linked list of CCBs threaded through the arena
#[derive(Debug, Clone)]
pub struct CcbList {
    chain: Chain,
    head: Option<CcbHandle>,
    tail: Option<CcbHandle>,
    len: usize,
}

impl CcbList {
    /// Create an empty list on the given chain
    pub const fn new(chain: Chain) -> Self {
        Self { chain, head: None, tail: None, len: 0 }
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First entry
    #[inline]
    pub fn front(&self) -> Option<CcbHandle> {
        self.head
    }

    /// Append at the tail
    pub fn push_back(&mut self, arena: &mut [Ccb], h: CcbHandle) {
        let chain = self.chain;
        *arena[h.index()].links_mut(chain) = Links { prev: self.tail, next: None };
        match self.tail {
            Some(t) => arena[t.index()].links_mut(chain).next = Some(h),
            None => self.head = Some(h),
        }
        self.tail = Some(h);
        self.len += 1;
    }

    /// Insert at the head
    pub fn push_front(&mut self, arena: &mut [Ccb], h: CcbHandle) {
        let chain = self.chain;
        *arena[h.index()].links_mut(chain) = Links { prev: None, next: self.head };
        match self.head {
            Some(f) => arena[f.index()].links_mut(chain).prev = Some(h),
            None => self.tail = Some(h),
        }
        self.head = Some(h);
        self.len += 1;
    }

    /// Remove the head
    pub fn pop_front(&mut self, arena: &mut [Ccb]) -> Option<CcbHandle> {
        let h = self.head?;
        self.remove(arena, h);
        Some(h)
    }

    /// Unlink an entry known to be on this list
    pub fn remove(&mut self, arena: &mut [Ccb], h: CcbHandle) {
        let chain = self.chain;
        let Links { prev, next } = *arena[h.index()].links(chain);
        match prev {
            Some(p) => arena[p.index()].links_mut(chain).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n.index()].links_mut(chain).prev = prev,
            None => self.tail = prev,
        }
        *arena[h.index()].links_mut(chain) = Links::default();
        self.len -= 1;
    }

    /// Handles from head to tail
    pub fn iter<'a>(&self, arena: &'a [Ccb]) -> impl Iterator<Item = CcbHandle> + 'a {
        let chain = self.chain;
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let h = cursor?;
            cursor = arena[h.index()].links(chain).next;
            Some(h)
        })
    }

    /// Snapshot of the handles, for walks that mutate the list
    pub fn to_vec(&self, arena: &[Ccb]) -> Vec<CcbHandle> {
        self.iter(arena).collect()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// The CCB arena with its free/busy lists and bus-address hash
#[derive(Debug)]
pub struct CcbPool {
    arena: Vec<Ccb>,
    by_dsa: HashMap<BusAddr, CcbHandle>,
    /// Idle CCBs
    pub free: CcbList,
    /// CCBs handed out
    pub busy: CcbList,
}

impl CcbPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            by_dsa: HashMap::new(),
            free: CcbList::new(Chain::Adapter),
            busy: CcbList::new(Chain::Adapter),
        }
    }

    /// Add a CCB backed by `dma` to the free list
    pub fn add(&mut self, dma: DmaBlock) -> CcbHandle {
        let handle = CcbHandle(self.arena.len() as u16);
        self.arena.push(Ccb::new(handle, dma));
        self.by_dsa.insert(dma.bus, handle);
        self.free.push_back(&mut self.arena, handle);
        handle
    }

    /// Number of CCBs ever created
    pub fn count(&self) -> usize {
        self.arena.len()
    }

    /// Look a CCB up by the bus address the chip reported
    pub fn from_dsa(&self, dsa: BusAddr) -> Option<CcbHandle> {
        self.by_dsa.get(&dsa).copied()
    }

    /// Borrow a CCB
    #[inline]
    pub fn get(&self, h: CcbHandle) -> &Ccb {
        &self.arena[h.index()]
    }

    /// Borrow a CCB mutably
    #[inline]
    pub fn get_mut(&mut self, h: CcbHandle) -> &mut Ccb {
        &mut self.arena[h.index()]
    }

    /// The whole arena, for list operations
    #[inline]
    pub fn arena_mut(&mut self) -> &mut [Ccb] {
        &mut self.arena
    }

    /// The whole arena
    #[inline]
    pub fn arena(&self) -> &[Ccb] {
        &self.arena
    }

    /// Move a free CCB to the busy list
    pub fn take_free(&mut self) -> Option<CcbHandle> {
        let h = self.free.pop_front(&mut self.arena)?;
        self.busy.push_back(&mut self.arena, h);
        Some(h)
    }

    /// Move a busy CCB back to the head of the free list
    pub fn put_free(&mut self, h: CcbHandle) {
        self.busy.remove(&mut self.arena, h);
        self.free.push_front(&mut self.arena, h);
    }

    /// Every chip area, for release at detach
    pub fn drain_dma(&mut self) -> Vec<DmaBlock> {
        self.by_dsa.clear();
        self.free = CcbList::new(Chain::Adapter);
        self.busy = CcbList::new(Chain::Adapter);
        self.arena.drain(..).map(|ccb| ccb.dma).collect()
    }
}

impl Default for CcbPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::VirtAddr;

    fn block(i: u32) -> DmaBlock {
        DmaBlock {
            virt: VirtAddr::new(0x1000_0000 + u64::from(i) * 1024),
            bus: BusAddr::new(0x0010_0000 + i * 1024),
            size: 1024,
        }
    }

    #[test]
    fn test_pool_free_busy_exclusive() {
        let mut pool = CcbPool::new();
        for i in 0..4 {
            pool.add(block(i));
        }
        let a = pool.take_free().unwrap();
        let b = pool.take_free().unwrap();
        assert_eq!(pool.free.len(), 2);
        assert_eq!(pool.busy.len(), 2);
        pool.put_free(a);
        assert_eq!(pool.free.front(), Some(a));
        assert_eq!(pool.busy.to_vec(pool.arena()), alloc::vec![b]);
    }

    #[test]
    fn test_lookup_by_dsa() {
        let mut pool = CcbPool::new();
        let h = pool.add(block(3));
        assert_eq!(pool.from_dsa(BusAddr::new(0x0010_0c00)), Some(h));
        assert_eq!(pool.from_dsa(BusAddr::new(0x0010_0c04)), None);
        assert_eq!(pool.get(h).sg_bus_addr(), BusAddr::new(0x0010_0c00 + CCB_SG_OFFSET as u32));
    }

    #[test]
    fn test_list_remove_middle_and_chains_independent() {
        let mut pool = CcbPool::new();
        let hs: Vec<_> = (0..3).map(|i| pool.add(block(i))).collect();
        let mut unit = CcbList::new(Chain::Unit);
        for &h in &hs {
            unit.push_back(pool.arena_mut(), h);
        }
        unit.remove(pool.arena_mut(), hs[1]);
        assert_eq!(unit.to_vec(pool.arena()), alloc::vec![hs[0], hs[2]]);
        // Adapter chain untouched
        assert_eq!(pool.free.to_vec(pool.arena()), hs);
        assert_eq!(unit.pop_front(pool.arena_mut()), Some(hs[0]));
        assert_eq!(unit.pop_front(pool.arena_mut()), Some(hs[2]));
        assert!(unit.is_empty());
    }

    #[test]
    fn test_host_status_classes() {
        assert!(HostStatus::Disconnected.is_busy());
        assert!(!HostStatus::Disconnected.is_done());
        assert!(HostStatus::SelTimeout.is_done());
        assert!(!HostStatus::Idle.is_busy());
        assert!(HostStatus::Wait.is_busy());
        assert!(!HostStatus::Wait.is_done());
    }
}
