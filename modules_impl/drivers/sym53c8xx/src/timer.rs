//! # Timeout Wheel
//!
//! Two banks of `K` buckets, walked one bucket per tick. An entry is
//! always filed at most `K` ticks ahead, using the largest power-of-two
//! step that does not overshoot its deadline, and is re-filed each time
//! its bucket comes up until the deadline is reached. The bucket being
//! drained is taken out of the wheel first, so nothing filed during a
//! drain can land in it.

use crate::ccb::CcbHandle;
use alloc::vec::Vec;
use static_assertions::const_assert;

/// Buckets per bank
pub const TIMER_BUCKETS: usize = 8;

const SLOTS: usize = 2 * TIMER_BUCKETS;

const_assert!(TIMER_BUCKETS.is_power_of_two());

/// One armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// CCB the timer belongs to
    pub handle: CcbHandle,
    /// CCB timer generation at arm time
    pub generation: u32,
    /// Tick at which the timer fires
    pub deadline: u64,
}

/// Double-banked bucket wheel
#[derive(Debug)]
pub struct TimerWheel {
    slots: [Vec<TimerEntry>; SLOTS],
    now: u64,
}

impl TimerWheel {
    /// Create a wheel at tick zero
    pub fn new() -> Self {
        Self { slots: Default::default(), now: 0 }
    }

    /// Current tick
    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Arm a timer firing `ticks` from now (at least one)
    pub fn arm(&mut self, handle: CcbHandle, generation: u32, ticks: u32) -> u64 {
        let deadline = self.now + u64::from(ticks.max(1));
        self.file(TimerEntry { handle, generation, deadline });
        deadline
    }

    fn file(&mut self, entry: TimerEntry) {
        let remaining = entry.deadline.saturating_sub(self.now).max(1);
        let step = prev_power_of_two(remaining.min(TIMER_BUCKETS as u64));
        let slot = ((self.now + step) % SLOTS as u64) as usize;
        self.slots[slot].push(entry);
    }

    /// Advance one tick and return the timers that are due
    ///
    /// Entries for which `live` answers false are dropped. Live entries
    /// not yet due are re-filed closer to their deadline.
    pub fn tick(&mut self, mut live: impl FnMut(&TimerEntry) -> bool) -> Vec<TimerEntry> {
        self.now += 1;
        let slot = (self.now % SLOTS as u64) as usize;
        let bucket = core::mem::take(&mut self.slots[slot]);
        let mut due = Vec::new();
        for entry in bucket {
            if !live(&entry) {
                continue;
            }
            if entry.deadline <= self.now {
                due.push(entry);
            } else {
                self.file(entry);
            }
        }
        due
    }

    /// Number of filed entries, stale ones included
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Whether nothing is filed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(Vec::clear);
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn prev_power_of_two(n: u64) -> u64 {
    1 << (63 - n.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_exactly_at_deadline() {
        for timeout in 1..200u32 {
            let mut wheel = TimerWheel::new();
            // Start at an arbitrary phase of the wheel
            for _ in 0..(timeout % 13) {
                wheel.tick(|_| true);
            }
            let start = wheel.now();
            let deadline = wheel.arm(CcbHandle(1), 0, timeout);
            assert_eq!(deadline, start + u64::from(timeout));
            loop {
                let due = wheel.tick(|_| true);
                if !due.is_empty() {
                    assert_eq!(wheel.now(), deadline, "timeout {}", timeout);
                    break;
                }
                assert!(wheel.now() < deadline);
            }
            assert!(wheel.is_empty());
        }
    }

    #[test]
    fn test_stale_entries_dropped() {
        let mut wheel = TimerWheel::new();
        wheel.arm(CcbHandle(1), 5, 3);
        wheel.arm(CcbHandle(2), 1, 3);
        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.extend(wheel.tick(|e| e.generation != 5));
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].handle, CcbHandle(2));
    }

    #[test]
    fn test_many_timers_same_tick() {
        let mut wheel = TimerWheel::new();
        for i in 0..50u16 {
            wheel.arm(CcbHandle(i), 0, 37);
        }
        let mut fired = 0;
        for _ in 0..37 {
            fired += wheel.tick(|_| true).len();
        }
        assert_eq!(fired, 50);
    }

    #[test]
    fn test_prev_power_of_two() {
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(8), 8);
        assert_eq!(prev_power_of_two(9), 8);
    }
}
