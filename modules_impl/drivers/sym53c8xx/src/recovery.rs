//! # Error Recovery
//!
//! Escalation ladder for commands that do not come back, the waiter
//! handed to host-initiated recovery, and the mapping from what the chip
//! reported to the closed set of command outcomes.

use crate::ccb::{Ccb, HostStatus, XErr};
use crate::defs::status;
use crate::scsi::CommandStatus;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Recovery level reached for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Escalation {
    /// Running normally
    None,
    /// ABORT TASK requested
    Abort,
    /// TARGET RESET requested
    TargetReset,
    /// SCSI bus reset issued
    BusReset,
    /// Adapter reset and reinitialized
    HostReset,
}

impl Escalation {
    /// The level tried when this one runs out of time
    pub const fn next(self) -> Self {
        match self {
            Escalation::None => Escalation::Abort,
            Escalation::Abort => Escalation::TargetReset,
            Escalation::TargetReset => Escalation::BusReset,
            Escalation::BusReset | Escalation::HostReset => Escalation::HostReset,
        }
    }
}

/// Why an abort was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    /// The collaborator asked
    Host = 1,
    /// The command timed out
    Timeout = 2,
}

// =============================================================================
// Waiters
// =============================================================================

/// How a host-initiated recovery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecoveryOutcome {
    /// The interrupt path confirmed it
    Completed = 1,
    /// The recovery deadline ran out and a heavier action finished it
    Forced = 2,
    /// Nothing to recover: the command was already gone
    NotFound = 3,
}

impl RecoveryOutcome {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecoveryOutcome::Completed),
            2 => Some(RecoveryOutcome::Forced),
            3 => Some(RecoveryOutcome::NotFound),
            _ => None,
        }
    }
}

/// Shared completion flag of one recovery action
#[derive(Debug, Default)]
pub struct RecoveryState {
    done: AtomicBool,
    outcome: AtomicU8,
}

impl RecoveryState {
    /// A pending state
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the outcome; the first call wins
    pub fn finish(&self, outcome: RecoveryOutcome) {
        if self
            .outcome
            .compare_exchange(0, outcome as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.done.store(true, Ordering::Release);
        }
    }

    /// Whether an outcome was recorded
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The recorded outcome
    pub fn outcome(&self) -> Option<RecoveryOutcome> {
        if !self.is_done() {
            return None;
        }
        RecoveryOutcome::from_u8(self.outcome.load(Ordering::Acquire))
    }
}

/// Handle returned by host-initiated recovery
///
/// Waiting never holds the adapter lock. The caller passes a `poll`
/// closure that gives the interrupt and tick paths a chance to run when
/// nothing else drives them.
#[derive(Debug, Clone)]
pub struct RecoveryWaiter {
    state: Arc<RecoveryState>,
    deadline: u64,
}

impl RecoveryWaiter {
    pub(crate) fn new(state: Arc<RecoveryState>, deadline: u64) -> Self {
        Self { state, deadline }
    }

    /// Waiter that is already finished
    pub(crate) fn finished(outcome: RecoveryOutcome, now: u64) -> Self {
        let state = RecoveryState::new();
        state.finish(outcome);
        Self { state, deadline: now }
    }

    /// Tick by which the current recovery level gives up
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Whether the recovery finished
    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Outcome, once finished
    pub fn outcome(&self) -> Option<RecoveryOutcome> {
        self.state.outcome()
    }

    /// Spin until finished, calling `poll` between checks
    pub fn wait(&self, mut poll: impl FnMut()) -> RecoveryOutcome {
        loop {
            if let Some(outcome) = self.state.outcome() {
                return outcome;
            }
            poll();
            core::hint::spin_loop();
        }
    }
}

// =============================================================================
// Outcome mapping
// =============================================================================

/// Classify a finished command
pub fn command_status(ccb: &Ccb) -> CommandStatus {
    if ccb.to_abort == AbortReason::Timeout as u8 {
        return CommandStatus::Timeout;
    }
    let chip = &ccb.chip;
    match ccb.host_status {
        HostStatus::Complete => {}
        HostStatus::SelTimeout => return CommandStatus::SelectionTimeout,
        HostStatus::Unexpected => {
            return if ccb.nego_status.is_some() {
                CommandStatus::NegotiationFailed
            } else {
                CommandStatus::UnexpectedBusFree
            };
        }
        HostStatus::Reset => return CommandStatus::AbortedByReset,
        HostStatus::Aborted => return CommandStatus::Aborted,
        HostStatus::Timeout => return CommandStatus::Timeout,
        HostStatus::Fail => return CommandStatus::PhaseError,
        HostStatus::Idle
        | HostStatus::Busy
        | HostStatus::Negotiate
        | HostStatus::Disconnected
        | HostStatus::Wait => return CommandStatus::InvalidRequest,
    }
    if chip.xerr.contains(XErr::PARITY_ERR) {
        return CommandStatus::ParityError;
    }
    if chip.xerr.contains(XErr::BAD_PHASE) {
        return CommandStatus::PhaseError;
    }
    if chip.xerr.intersects(XErr::EXTRA_DATA | XErr::SODL_UNRUN | XErr::SWIDE_OVRUN) {
        return CommandStatus::DataRunError;
    }
    match chip.scsi_status {
        status::GOOD | status::CONDITION_MET => CommandStatus::Good,
        status::QUEUE_FULL => CommandStatus::QueueFull,
        _ => CommandStatus::CheckCondition,
    }
}

/// Whether the chip reported a clean completion
pub fn completed_ok(ccb: &Ccb) -> bool {
    ccb.chip.host_status == Some(HostStatus::Complete)
        && ccb.chip.scsi_status == status::GOOD
        && ccb.chip.xerr.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder() {
        let mut level = Escalation::None;
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..5 {
            level = level.next();
            seen.push(level);
        }
        assert_eq!(
            seen,
            alloc::vec![
                Escalation::Abort,
                Escalation::TargetReset,
                Escalation::BusReset,
                Escalation::HostReset,
                Escalation::HostReset
            ]
        );
        assert!(Escalation::Abort < Escalation::BusReset);
    }

    #[test]
    fn test_first_outcome_wins() {
        let state = RecoveryState::new();
        assert_eq!(state.outcome(), None);
        state.finish(RecoveryOutcome::Completed);
        state.finish(RecoveryOutcome::Forced);
        assert_eq!(state.outcome(), Some(RecoveryOutcome::Completed));
    }

    #[test]
    fn test_wait_polls_until_done() {
        let state = RecoveryState::new();
        let waiter = RecoveryWaiter::new(state.clone(), 10);
        let mut polls = 0;
        let outcome = waiter.wait(|| {
            polls += 1;
            if polls == 3 {
                state.finish(RecoveryOutcome::Forced);
            }
        });
        assert_eq!(outcome, RecoveryOutcome::Forced);
        assert_eq!(polls, 3);
        assert!(RecoveryWaiter::finished(RecoveryOutcome::NotFound, 0).is_done());
    }
}
