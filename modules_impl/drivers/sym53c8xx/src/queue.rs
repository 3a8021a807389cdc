//! # Start and Done Queues
//!
//! Two rings of `2 * MAX_QUEUE` bus-address words shared with the
//! co-processor. Entries sit on even words. The host produces into the
//! start queue and consumes the done queue; the chip does the opposite.
//!
//! The start queue is terminated by the idle task address: before a CCB
//! is published at `put`, the idle marker is written at `put + 2`, so the
//! chip always stops at the next free slot. Done queue slots are zeroed
//! by the host as they are consumed.

use crate::ccb::{Ccb, CcbHandle, CcbPool};
use crate::defs::{MAX_QUEUE, QUEUE_SLOT_BYTES};
use alloc::vec;
use alloc::vec::Vec;
use sym_hal::BusAddr;
use sym_memory::DmaBlock;

/// Words in each ring
pub const QUEUE_WORDS: usize = 2 * MAX_QUEUE;

/// Bytes of chip memory backing one ring
pub const QUEUE_BYTES: usize = QUEUE_WORDS * QUEUE_SLOT_BYTES;

#[inline]
fn next_slot(i: usize) -> usize {
    let i = i + 2;
    if i >= QUEUE_WORDS {
        0
    } else {
        i
    }
}

// =============================================================================
// Start queue
// =============================================================================

/// Host-to-chip ring of CCB addresses
#[derive(Debug)]
pub struct StartQueue {
    /// Chip-visible ring
    pub dma: DmaBlock,
    words: Vec<BusAddr>,
    idle: BusAddr,
    put: usize,
    get: usize,
}

impl StartQueue {
    /// Create an empty queue terminated by `idle`
    pub fn new(dma: DmaBlock, idle: BusAddr) -> Self {
        Self { dma, words: vec![idle; QUEUE_WORDS], idle, put: 0, get: 0 }
    }

    /// Bus address of the ring
    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.dma.bus
    }

    /// Entries published but not yet fetched by the chip
    pub fn pending(&self) -> usize {
        let words = if self.put >= self.get { self.put - self.get } else { QUEUE_WORDS - self.get + self.put };
        words / 2
    }

    /// Whether another entry fits
    pub fn has_room(&self) -> bool {
        self.pending() + 1 < MAX_QUEUE
    }

    /// Publish a CCB address to the chip
    pub fn put(&mut self, ccb_ba: BusAddr) {
        debug_assert!(self.has_room(), "start queue overrun");
        let after = next_slot(self.put);
        self.words[after] = self.idle;
        self.words[self.put] = ccb_ba;
        self.put = after;
    }

    /// Chip side: take the next published address
    pub(crate) fn fetch(&mut self) -> Option<BusAddr> {
        let ba = self.words[self.get];
        if ba == self.idle {
            return None;
        }
        self.get = next_slot(self.get);
        Some(ba)
    }

    /// Whether `ccb_ba` is published and not yet fetched
    pub fn contains(&self, ccb_ba: BusAddr) -> bool {
        let mut i = self.get;
        while i != self.put {
            if self.words[i] == ccb_ba {
                return true;
            }
            i = next_slot(i);
        }
        false
    }

    /// Remove every not-yet-fetched entry whose CCB matches `pred`
    ///
    /// Survivors are compacted towards the chip's fetch position in
    /// their original order and the idle marker is copied behind them.
    /// Returns the removed handles, oldest first.
    pub fn dequeue_matching(&mut self, ccbs: &CcbPool, mut pred: impl FnMut(&Ccb) -> bool) -> Vec<CcbHandle> {
        let mut removed = Vec::new();
        let mut i = self.get;
        let mut j = i;
        while i != self.put {
            let ba = self.words[i];
            let hit = match ccbs.from_dsa(ba) {
                Some(h) if pred(ccbs.get(h)) => {
                    removed.push(h);
                    true
                }
                Some(_) => false,
                None => {
                    log::error!("[sym] bad address {} in start queue", ba);
                    true
                }
            };
            if !hit {
                if i != j {
                    self.words[j] = ba;
                }
                j = next_slot(j);
            }
            i = next_slot(i);
        }
        if i != j {
            self.words[j] = self.words[i];
        }
        self.put = j;
        removed
    }

    /// Empty the ring
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = self.idle);
        self.put = 0;
        self.get = 0;
    }
}

// =============================================================================
// Done queue
// =============================================================================

/// Chip-to-host ring of completed CCB addresses
#[derive(Debug)]
pub struct DoneQueue {
    /// Chip-visible ring
    pub dma: DmaBlock,
    words: Vec<BusAddr>,
    put: usize,
    get: usize,
}

impl DoneQueue {
    /// Create an empty queue
    pub fn new(dma: DmaBlock) -> Self {
        Self { dma, words: vec![BusAddr::NULL; QUEUE_WORDS], put: 0, get: 0 }
    }

    /// Bus address of the ring
    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.dma.bus
    }

    /// Chip side: post a completed CCB; false when the ring is full
    pub(crate) fn post(&mut self, dsa: BusAddr) -> bool {
        if !self.words[self.put].is_null() {
            return false;
        }
        self.words[self.put] = dsa;
        self.put = next_slot(self.put);
        true
    }

    /// Consume every posted entry, zeroing each slot
    pub fn drain(&mut self) -> Vec<BusAddr> {
        let mut out = Vec::new();
        loop {
            let dsa = self.words[self.get];
            if dsa.is_null() {
                break;
            }
            self.words[self.get] = BusAddr::NULL;
            self.get = next_slot(self.get);
            out.push(dsa);
        }
        out
    }

    /// Empty the ring
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = BusAddr::NULL);
        self.put = 0;
        self.get = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::VirtAddr;

    fn ring() -> DmaBlock {
        DmaBlock { virt: VirtAddr::new(0x8000), bus: BusAddr::new(0x8000), size: QUEUE_BYTES }
    }

    fn pool(n: u32) -> (CcbPool, Vec<CcbHandle>) {
        let mut pool = CcbPool::new();
        let hs = (0..n)
            .map(|i| {
                pool.add(DmaBlock {
                    virt: VirtAddr::new(0x10_0000 + u64::from(i) * 0x400),
                    bus: BusAddr::new(0x10_0000 + i * 0x400),
                    size: 0x400,
                })
            })
            .collect();
        (pool, hs)
    }

    const IDLE: BusAddr = BusAddr::new(0xfff0);

    #[test]
    fn test_start_queue_fifo_and_idle_marker() {
        let (pool, hs) = pool(3);
        let mut sq = StartQueue::new(ring(), IDLE);
        assert_eq!(sq.fetch(), None);
        for &h in &hs {
            sq.put(pool.get(h).bus_addr());
        }
        assert_eq!(sq.pending(), 3);
        assert_eq!(sq.words[6], IDLE);
        for &h in &hs {
            assert_eq!(sq.fetch(), Some(pool.get(h).bus_addr()));
        }
        assert_eq!(sq.fetch(), None);
    }

    #[test]
    fn test_start_queue_wraps() {
        let (pool, hs) = pool(1);
        let ba = pool.get(hs[0]).bus_addr();
        let mut sq = StartQueue::new(ring(), IDLE);
        for _ in 0..(MAX_QUEUE + 5) {
            sq.put(ba);
            assert_eq!(sq.fetch(), Some(ba));
        }
        assert_eq!(sq.pending(), 0);
        assert!(sq.has_room());
    }

    #[test]
    fn test_dequeue_matching_compacts() {
        let (mut pool, hs) = pool(5);
        for (i, &h) in hs.iter().enumerate() {
            pool.get_mut(h).target = (i % 2) as u8;
        }
        let mut sq = StartQueue::new(ring(), IDLE);
        for &h in &hs {
            sq.put(pool.get(h).bus_addr());
        }
        // The chip already took the first one
        assert_eq!(sq.fetch(), Some(pool.get(hs[0]).bus_addr()));
        let removed = sq.dequeue_matching(&pool, |c| c.target == 0);
        assert_eq!(removed, alloc::vec![hs[2], hs[4]]);
        assert_eq!(sq.pending(), 2);
        assert!(!sq.contains(pool.get(hs[2]).bus_addr()));
        assert_eq!(sq.fetch(), Some(pool.get(hs[1]).bus_addr()));
        assert_eq!(sq.fetch(), Some(pool.get(hs[3]).bus_addr()));
        assert_eq!(sq.fetch(), None);
    }

    #[test]
    fn test_done_queue_drain_zeroes() {
        let mut dq = DoneQueue::new(ring());
        assert!(dq.drain().is_empty());
        assert!(dq.post(BusAddr::new(0x100)));
        assert!(dq.post(BusAddr::new(0x200)));
        assert_eq!(dq.drain(), alloc::vec![BusAddr::new(0x100), BusAddr::new(0x200)]);
        assert!(dq.words.iter().all(|w| w.is_null()));
        assert!(dq.post(BusAddr::new(0x300)));
        assert_eq!(dq.drain(), alloc::vec![BusAddr::new(0x300)]);
    }
}
