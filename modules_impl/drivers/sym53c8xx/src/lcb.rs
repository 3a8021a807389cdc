//! # Logical Unit Control Blocks
//!
//! Created the first time a command is issued to a LUN already known to
//! exist. Holds the tag allocator, the busy accounting that enforces the
//! single untagged nexus rule, and the queueing policy used when the core
//! throttles per-LUN concurrency itself.

use crate::ccb::{Chain, CcbList};
use crate::defs::{MAX_TAG, MAX_TASK};
use bitflags::bitflags;
use heapless::Deque;
use sym_hal::BusAddr;
use sym_memory::DmaBlock;

bitflags! {
    /// Per-unit and per-target user flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnitFlags: u8 {
        /// Disconnect privilege granted
        const DISC              = 0x01;
        /// Tagged queueing allowed
        const TAGS              = 0x02;
        /// Do not scan this target at boot
        const SCAN_BOOT_DISABLED = 0x04;
        /// Only probe LUN 0
        const SCAN_LUNS_DISABLED = 0x08;
    }
}

// =============================================================================
// Tags
// =============================================================================

/// Tag allocator and the reselection table the chip indexes by tag
///
/// Free tags sit in a circular buffer: allocation takes from the front,
/// release appends at the back, so a just-freed tag is the last one reused.
#[derive(Debug)]
pub struct TagPool {
    free: Deque<u8, MAX_TASK>,
    itlq_tbl: [BusAddr; MAX_TASK],
    /// Chip-visible copy of the reselection table
    pub dma: DmaBlock,
}

impl TagPool {
    /// Create a pool with every tag free, table in `dma`
    pub fn new(dma: DmaBlock) -> Self {
        let mut free = Deque::new();
        for tag in 0..MAX_TASK {
            // Capacity is exactly MAX_TASK
            let _ = free.push_back(tag as u8);
        }
        Self { free, itlq_tbl: [BusAddr::NULL; MAX_TASK], dma }
    }

    /// Tags currently available
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Reselection address recorded for a tag
    pub fn ccb_for(&self, tag: u16) -> BusAddr {
        self.itlq_tbl.get(usize::from(tag)).copied().unwrap_or(BusAddr::NULL)
    }
}

// =============================================================================
// Reordering limiter
// =============================================================================

/// Bounds how far tagged commands may overtake the oldest outstanding one
///
/// Dispatches are counted into one of two buckets. Once `window`
/// dispatches went into the current bucket the limiter wants to switch,
/// which it only does after the other bucket drained; the first command of
/// a fresh bucket goes out with an ORDERED tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderLimiter {
    window: u16,
    tags_sum: [u16; 2],
    tags_si: u8,
    tags_since: u16,
}

/// Verdict of the limiter for the next tagged dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch, counted in the given bucket
    Go {
        /// Bucket index
        bucket: u8,
        /// Force an ORDERED tag
        ordered: bool,
    },
    /// Hold until older commands drain
    Hold,
}

impl ReorderLimiter {
    /// Create a limiter; a zero window disables it
    pub const fn new(window: u16) -> Self {
        Self { window, tags_sum: [0; 2], tags_si: 0, tags_since: 0 }
    }

    /// Decide on the next tagged dispatch and count it
    pub fn admit(&mut self) -> Admission {
        if self.window == 0 {
            self.tags_sum[usize::from(self.tags_si)] += 1;
            return Admission::Go { bucket: self.tags_si, ordered: false };
        }
        let mut ordered = false;
        if self.tags_since >= self.window {
            let other = self.tags_si ^ 1;
            if self.tags_sum[usize::from(other)] != 0 {
                return Admission::Hold;
            }
            self.tags_si = other;
            self.tags_since = 0;
            ordered = self.tags_sum[usize::from(other ^ 1)] != 0;
        }
        self.tags_sum[usize::from(self.tags_si)] += 1;
        self.tags_since += 1;
        Admission::Go { bucket: self.tags_si, ordered }
    }

    /// Un-count a dispatch that finished or was pulled back
    pub fn release(&mut self, bucket: u8) {
        let sum = &mut self.tags_sum[usize::from(bucket & 1)];
        *sum = sum.saturating_sub(1);
    }

    /// Outstanding dispatches per bucket
    pub fn outstanding(&self) -> [u16; 2] {
        self.tags_sum
    }

    /// Forget all counts
    pub fn reset(&mut self) {
        *self = Self::new(self.window);
    }
}

// =============================================================================
// LCB
// =============================================================================

/// Logical unit control block
#[derive(Debug)]
pub struct Lcb {
    /// LUN number
    pub lun: u8,
    /// Chip-visible head (task address, reselect path, tag table address)
    pub dma: DmaBlock,
    /// Tag resources, allocated on the first tagged command
    pub tags: Option<TagPool>,
    /// Outstanding tagged commands
    pub busy_itlq: u16,
    /// Outstanding untagged commands, at most one
    pub busy_itl: u16,
    /// CCB of the untagged nexus, for reselection
    pub itl_task: BusAddr,
    /// Reselection goes through the tag table
    pub resel_tagged: bool,
    /// Disconnect and tagged queueing permission
    pub user_flags: UnitFlags,
    /// Device advertised tagged queueing
    pub device_queueing: bool,
    /// Operator or NVRAM tag depth
    pub user_tags: u16,
    /// Upper bound of the adapter
    pub max_tags: u16,
    /// Current started limit, shrinks on QUEUE FULL
    pub started_max: u16,
    /// Commands waiting to be started
    pub waiting: CcbList,
    /// Commands on the start queue or at the target
    pub started: CcbList,
    /// Started tagged commands
    pub started_tags: u16,
    /// Started untagged commands
    pub started_no_tag: u16,
    /// Reordering limiter state
    pub limiter: ReorderLimiter,
    /// Good completions since the last QUEUE FULL
    pub num_sgood: u16,
}

impl Lcb {
    /// Create an LCB; tag resources come later
    pub fn new(lun: u8, dma: DmaBlock, user_flags: UnitFlags, user_tags: u16, max_tags: u16, window: u16) -> Self {
        let mut lcb = Self {
            lun,
            dma,
            tags: None,
            busy_itlq: 0,
            busy_itl: 0,
            itl_task: BusAddr::NULL,
            resel_tagged: false,
            user_flags,
            device_queueing: true,
            user_tags,
            max_tags: max_tags.min(MAX_TAG as u16),
            started_max: 1,
            waiting: CcbList::new(Chain::Unit),
            started: CcbList::new(Chain::Unit),
            started_tags: 0,
            started_no_tag: 0,
            limiter: ReorderLimiter::new(window),
            num_sgood: 0,
        };
        lcb.started_max = lcb.queue_depth();
        lcb
    }

    /// Tagged queue depth: the smallest of the adapter limit, the user
    /// setting and what the device supports. One means untagged.
    pub fn queue_depth(&self) -> u16 {
        if !self.tags_allowed() {
            return 1;
        }
        self.user_tags.min(self.max_tags).max(1)
    }

    /// Whether commands to this unit may be tagged
    pub fn tags_allowed(&self) -> bool {
        self.device_queueing && self.user_flags.contains(UnitFlags::TAGS) && self.user_tags > 1
    }

    /// Re-derive the started limit after a depth change
    pub fn retune(&mut self) {
        self.started_max = self.queue_depth();
        self.num_sgood = 0;
    }

    /// Take a tag for a command whose CCB sits at `ccb_ba`
    pub fn alloc_tag(&mut self, ccb_ba: BusAddr) -> Option<u16> {
        let pool = self.tags.as_mut()?;
        if usize::from(self.busy_itlq) >= MAX_TASK {
            return None;
        }
        let tag = pool.free.pop_front()?;
        pool.itlq_tbl[usize::from(tag)] = ccb_ba;
        self.busy_itlq += 1;
        self.resel_tagged = true;
        Some(u16::from(tag))
    }

    /// Return a tag
    pub fn free_tag(&mut self, tag: u16) {
        if let Some(pool) = self.tags.as_mut() {
            pool.itlq_tbl[usize::from(tag)] = BusAddr::NULL;
            // Cannot overflow: a tag is only returned once
            let _ = pool.free.push_back(tag as u8);
        }
        self.busy_itlq = self.busy_itlq.saturating_sub(1);
    }

    /// Whether no command of this unit is outstanding
    pub fn is_idle(&self) -> bool {
        self.busy_itlq == 0 && self.busy_itl == 0
    }

    /// Note a good completion; returns true when the started limit grew
    pub fn note_good(&mut self, recover_after: u16) -> bool {
        if self.started_max >= self.queue_depth() {
            return false;
        }
        self.num_sgood += 1;
        if self.num_sgood >= recover_after {
            self.num_sgood = 0;
            self.started_max += 1;
            return true;
        }
        false
    }

    /// Shrink the started limit after a QUEUE FULL
    pub fn note_queue_full(&mut self) {
        self.started_max = self.started_tags.max(1);
        self.num_sgood = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use sym_hal::VirtAddr;

    fn dma(size: usize) -> DmaBlock {
        DmaBlock { virt: VirtAddr::new(0x2000_0000), bus: BusAddr::new(0x0020_0000), size }
    }

    fn tagged_lcb() -> Lcb {
        let mut lcb = Lcb::new(0, dma(16), UnitFlags::DISC | UnitFlags::TAGS, 16, 64, 2);
        lcb.tags = Some(TagPool::new(dma(MAX_TASK * 4)));
        lcb
    }

    #[test]
    fn test_depth_clamping() {
        let mut lcb = tagged_lcb();
        assert_eq!(lcb.queue_depth(), 16);
        lcb.user_tags = 200;
        assert_eq!(lcb.queue_depth(), 64);
        lcb.device_queueing = false;
        assert_eq!(lcb.queue_depth(), 1);
        assert!(!lcb.tags_allowed());
    }

    #[test]
    fn test_tags_unique_under_churn() {
        let mut lcb = tagged_lcb();
        let mut live: Vec<u16> = Vec::new();
        let mut seed: u32 = 0x1234_5678;
        for step in 0..5000u32 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 != 0 || live.is_empty() {
                if let Some(tag) = lcb.alloc_tag(BusAddr::new(0x1000 + step)) {
                    assert!(!live.contains(&tag), "tag {} handed out twice", tag);
                    live.push(tag);
                } else {
                    assert_eq!(live.len(), MAX_TASK);
                }
            } else {
                let tag = live.swap_remove(seed as usize % live.len());
                lcb.free_tag(tag);
            }
            assert_eq!(usize::from(lcb.busy_itlq), live.len());
        }
    }

    #[test]
    fn test_tag_table_tracks_ccb() {
        let mut lcb = tagged_lcb();
        let tag = lcb.alloc_tag(BusAddr::new(0xabc0)).unwrap();
        assert_eq!(lcb.tags.as_ref().unwrap().ccb_for(tag), BusAddr::new(0xabc0));
        lcb.free_tag(tag);
        assert_eq!(lcb.tags.as_ref().unwrap().ccb_for(tag), BusAddr::NULL);
        assert!(lcb.is_idle());
    }

    #[test]
    fn test_limiter_holds_until_old_bucket_drains() {
        let mut lim = ReorderLimiter::new(2);
        assert_eq!(lim.admit(), Admission::Go { bucket: 0, ordered: false });
        assert_eq!(lim.admit(), Admission::Go { bucket: 0, ordered: false });
        // Window reached, other bucket empty: switch, ordered because bucket 0 is busy
        assert_eq!(lim.admit(), Admission::Go { bucket: 1, ordered: true });
        assert_eq!(lim.admit(), Admission::Go { bucket: 1, ordered: false });
        // Bucket 0 still has two outstanding
        assert_eq!(lim.admit(), Admission::Hold);
        lim.release(0);
        assert_eq!(lim.admit(), Admission::Hold);
        lim.release(0);
        assert_eq!(lim.admit(), Admission::Go { bucket: 0, ordered: true });
    }

    #[test]
    fn test_limiter_disabled() {
        let mut lim = ReorderLimiter::new(0);
        for _ in 0..100 {
            assert_eq!(lim.admit(), Admission::Go { bucket: 0, ordered: false });
        }
    }

    #[test]
    fn test_queue_full_shrink_and_recover() {
        let mut lcb = tagged_lcb();
        lcb.started_tags = 3;
        lcb.note_queue_full();
        assert_eq!(lcb.started_max, 3);
        for _ in 0..9 {
            assert!(!lcb.note_good(10));
        }
        assert!(lcb.note_good(10));
        assert_eq!(lcb.started_max, 4);
    }
}
