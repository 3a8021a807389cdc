//! # Buddy Suballocator
//!
//! Splits platform clusters into power-of-two blocks from 16 bytes up to a
//! whole cluster. Blocks are tracked purely by address; the arena never
//! dereferences the memory it manages.
//!
//! Allocation takes the first non-empty class at or above the request,
//! fetching a fresh cluster when every class is empty, and splits down,
//! leaving the upper halves on the smaller free lists. Freeing walks up the
//! classes merging with the buddy (`addr ^ size`) while it is free.

use crate::{MemError, MemResult};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use static_assertions::const_assert;
use sym_hal::{CLUSTER_SHIFT, CLUSTER_SIZE};

/// log2 of the smallest block
pub const MEMO_SHIFT: u32 = 4;

/// Number of size classes, 16 bytes through one cluster
pub const MEMO_CLASSES: usize = (CLUSTER_SHIFT - MEMO_SHIFT + 1) as usize;

const_assert!(MEMO_SHIFT < CLUSTER_SHIFT);

/// Result of returning a block to the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freed {
    /// Block went back on a free list
    Kept,
    /// Block merged into a whole cluster that should go back to the platform
    Cluster(u64),
}

/// Power-of-two free-list arena
#[derive(Debug)]
pub struct BuddyArena {
    /// Free blocks per class, class 0 is 16 bytes
    free_lists: [BTreeSet<u64>; MEMO_CLASSES],
    /// Hand whole free clusters back instead of keeping them
    release_unused: bool,
}

impl BuddyArena {
    /// Create an empty arena
    pub fn new(release_unused: bool) -> Self {
        Self {
            free_lists: core::array::from_fn(|_| BTreeSet::new()),
            release_unused,
        }
    }

    /// Size class for a request, `None` when out of range
    pub fn class_of(size: usize) -> Option<usize> {
        if size == 0 || size as u64 > CLUSTER_SIZE {
            return None;
        }
        let rounded = size.next_power_of_two().max(1 << MEMO_SHIFT);
        Some((rounded.trailing_zeros() - MEMO_SHIFT) as usize)
    }

    /// Byte size of a class
    #[inline]
    pub const fn class_size(class: usize) -> u64 {
        1 << (class as u32 + MEMO_SHIFT)
    }

    /// Buddy of a block in a class
    #[inline]
    fn buddy_addr(addr: u64, class: usize) -> u64 {
        addr ^ Self::class_size(class)
    }

    /// Allocate a block of the class for `size`
    ///
    /// `refill` is asked for a fresh, cluster aligned address when no free
    /// block is large enough.
    pub fn alloc(&mut self, size: usize, refill: impl FnOnce() -> MemResult<u64>) -> MemResult<u64> {
        let class = Self::class_of(size).ok_or(MemError::InvalidSize)?;

        let found = (class..MEMO_CLASSES).find(|&c| !self.free_lists[c].is_empty());
        let (mut order, addr) = match found {
            Some(c) => {
                let addr = self.free_lists[c].pop_first().ok_or(MemError::OutOfMemory)?;
                (c, addr)
            }
            None => {
                let cluster = refill()?;
                debug_assert_eq!(cluster & (CLUSTER_SIZE - 1), 0);
                (MEMO_CLASSES - 1, cluster)
            }
        };

        // Split down, keeping the lower half and freeing the upper one
        while order > class {
            order -= 1;
            self.free_lists[order].insert(Self::buddy_addr(addr, order));
        }

        Ok(addr)
    }

    /// Return a block previously allocated with `size`
    pub fn free(&mut self, addr: u64, size: usize) -> MemResult<Freed> {
        let mut class = Self::class_of(size).ok_or(MemError::InvalidSize)?;
        if addr & (Self::class_size(class) - 1) != 0 || self.free_lists[class].contains(&addr) {
            return Err(MemError::InvalidAddress);
        }

        let mut addr = addr;
        while class < MEMO_CLASSES - 1 {
            let buddy = Self::buddy_addr(addr, class);
            if !self.free_lists[class].remove(&buddy) {
                break;
            }
            addr &= buddy;
            class += 1;
        }

        if class == MEMO_CLASSES - 1 && self.release_unused {
            return Ok(Freed::Cluster(addr));
        }
        self.free_lists[class].insert(addr);
        Ok(Freed::Kept)
    }

    /// Number of free blocks in a class
    pub fn free_blocks(&self, class: usize) -> usize {
        self.free_lists.get(class).map_or(0, BTreeSet::len)
    }

    /// Total free bytes across all classes
    pub fn free_bytes(&self) -> u64 {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(class, list)| list.len() as u64 * Self::class_size(class))
            .sum()
    }

    /// Remove and return every whole free cluster
    pub fn drain_free_clusters(&mut self) -> Vec<u64> {
        let top = &mut self.free_lists[MEMO_CLASSES - 1];
        let clusters = top.iter().copied().collect();
        top.clear();
        clusters
    }

    /// Forget every free block
    pub fn clear(&mut self) {
        for list in &mut self.free_lists {
            list.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x10_0000;

    fn refill_once() -> impl FnOnce() -> MemResult<u64> {
        || Ok(BASE)
    }

    #[test]
    fn test_class_of() {
        assert_eq!(BuddyArena::class_of(0), None);
        assert_eq!(BuddyArena::class_of(1), Some(0));
        assert_eq!(BuddyArena::class_of(16), Some(0));
        assert_eq!(BuddyArena::class_of(17), Some(1));
        assert_eq!(BuddyArena::class_of(4096), Some(MEMO_CLASSES - 1));
        assert_eq!(BuddyArena::class_of(4097), None);
    }

    #[test]
    fn test_split_leaves_upper_halves() {
        let mut arena = BuddyArena::new(false);
        let a = arena.alloc(16, refill_once()).unwrap();
        assert_eq!(a, BASE);
        // One free block in every class below the cluster
        for class in 0..MEMO_CLASSES - 1 {
            assert_eq!(arena.free_blocks(class), 1, "class {}", class);
        }
        assert_eq!(arena.free_bytes(), CLUSTER_SIZE - 16);
    }

    #[test]
    fn test_reuses_free_block_before_refill() {
        let mut arena = BuddyArena::new(false);
        let a = arena.alloc(64, refill_once()).unwrap();
        let b = arena.alloc(64, || panic!("no refill expected")).unwrap();
        assert_eq!(b, a + 64);
    }

    #[test]
    fn test_free_merges_back_to_cluster() {
        let mut arena = BuddyArena::new(false);
        let a = arena.alloc(32, refill_once()).unwrap();
        let b = arena.alloc(32, || panic!("no refill expected")).unwrap();
        assert_eq!(arena.free(a, 32), Ok(Freed::Kept));
        assert_eq!(arena.free(b, 32), Ok(Freed::Kept));
        assert_eq!(arena.free_blocks(MEMO_CLASSES - 1), 1);
        assert_eq!(arena.free_bytes(), CLUSTER_SIZE);
    }

    #[test]
    fn test_eager_release_returns_cluster() {
        let mut arena = BuddyArena::new(true);
        let a = arena.alloc(100, refill_once()).unwrap();
        assert_eq!(arena.free(a, 100), Ok(Freed::Cluster(BASE)));
        assert_eq!(arena.free_bytes(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut arena = BuddyArena::new(false);
        let a = arena.alloc(16, refill_once()).unwrap();
        let _b = arena.alloc(16, || panic!("no refill expected")).unwrap();
        arena.free(a, 16).unwrap();
        assert_eq!(arena.free(a, 16), Err(MemError::InvalidAddress));
        assert_eq!(arena.free(a + 8, 16), Err(MemError::InvalidAddress));
    }

    #[test]
    fn test_oversize_rejected() {
        let mut arena = BuddyArena::new(false);
        assert_eq!(arena.alloc(8192, refill_once()), Err(MemError::InvalidSize));
    }
}
