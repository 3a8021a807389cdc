//! # Requests and Results
//!
//! What the storage stack hands to the core and what it gets back.

use crate::ccb::CcbHandle;
use crate::defs::{status, MAX_CDB, SENSE_LEN};
use arrayvec::ArrayVec;
use core::fmt;
use sym_hal::BusAddr;

/// Collaborator's cookie for a request, echoed back on completion
pub type RequestId = u64;

/// Command descriptor block
pub type Cdb = ArrayVec<u8, MAX_CDB>;

/// Sense bytes returned with a CHECK CONDITION
pub type SenseData = ArrayVec<u8, SENSE_LEN>;

/// Direction of the data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// One physically contiguous piece of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegment {
    /// Bus address of the first byte
    pub addr: BusAddr,
    /// Length in bytes
    pub len: u32,
}

impl DataSegment {
    /// Create a segment
    pub const fn new(addr: BusAddr, len: u32) -> Self {
        Self { addr, len }
    }
}

/// Queueing the caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagHint {
    /// Never tag this command
    Untagged,
    /// SIMPLE queue tag
    Simple,
    /// ORDERED queue tag
    Ordered,
    /// HEAD OF QUEUE tag
    HeadOfQueue,
}

impl TagHint {
    /// Tag message byte for a tagged hint
    pub const fn message(self) -> Option<u8> {
        use crate::defs::msg;
        match self {
            TagHint::Untagged => None,
            TagHint::Simple => Some(msg::SIMPLE_TAG),
            TagHint::Ordered => Some(msg::ORDERED_TAG),
            TagHint::HeadOfQueue => Some(msg::HEAD_TAG),
        }
    }
}

/// A SCSI command submitted to the adapter
#[derive(Debug, Clone)]
pub struct ScsiRequest<'a> {
    /// Collaborator's cookie
    pub id: RequestId,
    /// Target ID
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    /// Command bytes
    pub cdb: &'a [u8],
    /// Data direction
    pub direction: DataDirection,
    /// Data buffer, already translated to bus addresses
    pub segments: &'a [DataSegment],
    /// Requested queueing
    pub tag: TagHint,
    /// Timeout in ticks, zero for the adapter default
    pub timeout_ticks: u32,
}

impl<'a> ScsiRequest<'a> {
    /// Create a request without a data phase
    pub fn new(id: RequestId, target: u8, lun: u8, cdb: &'a [u8]) -> Self {
        Self {
            id,
            target,
            lun,
            cdb,
            direction: DataDirection::None,
            segments: &[],
            tag: TagHint::Simple,
            timeout_ticks: 0,
        }
    }

    /// Attach a data buffer
    pub fn with_data(mut self, direction: DataDirection, segments: &'a [DataSegment]) -> Self {
        self.direction = direction;
        self.segments = segments;
        self
    }

    /// Set the queueing hint
    pub fn with_tag(mut self, tag: TagHint) -> Self {
        self.tag = tag;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, ticks: u32) -> Self {
        self.timeout_ticks = ticks;
        self
    }

    /// Total bytes described by the segments
    pub fn data_len(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// Handle to a queued command, for [`crate::Adapter::abort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub(crate) handle: CcbHandle,
    pub(crate) generation: u32,
}

/// Outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Completed with GOOD or CONDITION MET status
    Good,
    /// Completed with a status other than GOOD, see the status byte and sense
    CheckCondition,
    /// Target did not answer selection
    SelectionTimeout,
    /// Parity or CRC error the adapter could not recover
    ParityError,
    /// Target dropped off the bus mid-command
    UnexpectedBusFree,
    /// Target went through an illegal phase sequence
    PhaseError,
    /// More or less data was offered than the command asked for
    DataRunError,
    /// Transfer negotiation broke the connection
    NegotiationFailed,
    /// LUN kept rejecting the command as queue full
    QueueFull,
    /// Adapter ran out of internal resources
    ResourceShortage,
    /// Aborted at the caller's request or after a timeout
    Aborted,
    /// Flushed by a target, bus or adapter reset
    AbortedByReset,
    /// Timed out and could not be aborted cleanly
    Timeout,
    /// Request was malformed
    InvalidRequest,
}

impl CommandStatus {
    /// Whether the command succeeded
    pub const fn is_good(self) -> bool {
        matches!(self, CommandStatus::Good)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommandStatus::Good => "good",
            CommandStatus::CheckCondition => "check condition",
            CommandStatus::SelectionTimeout => "selection timeout",
            CommandStatus::ParityError => "parity error",
            CommandStatus::UnexpectedBusFree => "unexpected bus free",
            CommandStatus::PhaseError => "illegal phase",
            CommandStatus::DataRunError => "data overrun/underrun",
            CommandStatus::NegotiationFailed => "negotiation failed",
            CommandStatus::QueueFull => "queue full",
            CommandStatus::ResourceShortage => "resource shortage",
            CommandStatus::Aborted => "aborted",
            CommandStatus::AbortedByReset => "aborted by reset",
            CommandStatus::Timeout => "timeout",
            CommandStatus::InvalidRequest => "invalid request",
        };
        f.write_str(text)
    }
}

/// Everything the collaborator learns about a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Overall outcome
    pub status: CommandStatus,
    /// SCSI status byte from the target
    pub scsi_status: u8,
    /// Sense data when auto-sense ran
    pub sense: SenseData,
    /// Bytes requested but not transferred
    pub residual: u32,
}

impl CommandResult {
    /// Result with no target status
    pub fn with_status(status: CommandStatus) -> Self {
        Self { status, scsi_status: status::ILLEGAL, sense: SenseData::new(), residual: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let segs = [DataSegment::new(BusAddr::new(0x1000), 512), DataSegment::new(BusAddr::new(0x3000), 1024)];
        let req = ScsiRequest::new(7, 2, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 3, 0])
            .with_data(DataDirection::In, &segs)
            .with_tag(TagHint::Ordered)
            .with_timeout(50);
        assert_eq!(req.data_len(), 1536);
        assert_eq!(req.tag.message(), Some(0x22));
        assert_eq!(req.timeout_ticks, 50);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(alloc::format!("{}", CommandStatus::AbortedByReset), "aborted by reset");
        assert!(CommandStatus::Good.is_good());
        assert!(!CommandStatus::Timeout.is_good());
    }
}
