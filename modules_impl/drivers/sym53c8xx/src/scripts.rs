//! # Co-processor Boundary
//!
//! The SCSI phase engine runs on the adapter as microcode. The core only
//! sees it through [`Scripts`]: it is handed the two queue rings at start,
//! kicked when new work is queued, and polled for the events that need
//! the host. While the engine handles an event the host has to answer,
//! it waits for a [`Resume`].
//!
//! [`ScriptsPort`] is what the engine gets to touch of host memory: the
//! consumer end of the start queue, the producer end of the done queue,
//! and the chip-visible part of every CCB.

use crate::ccb::{CcbPool, ChipStatus, HostStatus};
use crate::defs::{MSG_IN_LEN, MSG_OUT_LEN};
use crate::nego::NegoKind;
use crate::queue::{DoneQueue, StartQueue};
use arrayvec::ArrayVec;
use sym_hal::{BusAddr, HalResult};

/// Something the engine needs the host to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptsEvent {
    /// Extended message received on the connection of `dsa`; the engine
    /// waits for a [`Resume`]
    Message {
        /// CCB of the current connection
        dsa: BusAddr,
        /// Message bytes, starting with the extended message introducer
        bytes: ArrayVec<u8, MSG_IN_LEN>,
    },
    /// Target answered our last message with MESSAGE REJECT; the engine
    /// waits for a [`Resume`]
    MessageReject {
        /// CCB of the current connection
        dsa: BusAddr,
    },
    /// Engine halted after [`Scripts::request_stop`]; the start queue is
    /// frozen until the host resumes it
    Stopped,
    /// ABORT TASK went out for the given nexus
    TaskAborted {
        /// Target ID
        target: u8,
        /// Logical unit
        lun: u8,
        /// Tag, or the untagged sentinel
        tag: u16,
    },
    /// TARGET RESET went out
    TargetReset {
        /// Target ID
        target: u8,
    },
    /// A reset condition was seen on the bus, ours or someone else's
    BusReset,
    /// Unrecoverable engine or bus error
    Fatal,
}

/// How the engine continues after a host-handled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Acknowledge the message and go on
    ClearAck,
    /// Send these bytes as the next message out
    SendMessage(ArrayVec<u8, MSG_IN_LEN>),
    /// Send MESSAGE REJECT
    RejectMessage,
    /// Restart the scheduler loop
    Continue,
}

/// The adapter's SCSI phase engine
pub trait Scripts: Send {
    /// Start the engine on the given rings
    fn start(&mut self, start_queue: BusAddr, done_queue: BusAddr) -> HalResult<()>;

    /// New entries were put on the start queue
    fn signal(&mut self);

    /// Run until something needs the host, or return `None` when idle
    fn next_event(&mut self, port: &mut ScriptsPort<'_>) -> Option<ScriptsEvent>;

    /// Continue after an event that wanted an answer
    fn resume(&mut self, how: Resume);

    /// Halt at the next safe point and report [`ScriptsEvent::Stopped`]
    fn request_stop(&mut self);

    /// Select the target and send ABORT TASK for one nexus
    fn abort_task(&mut self, target: u8, lun: u8, tag: u16);

    /// Select the target and send TARGET RESET
    fn reset_target(&mut self, target: u8);

    /// Assert RST on the bus
    fn reset_bus(&mut self) -> HalResult<()>;

    /// Soft reset the chip; the engine must be started again
    fn reset_chip(&mut self) -> HalResult<()>;
}

/// Read-only view of a CCB's chip area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcbView<'a> {
    /// Target ID
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    /// Tag, or the untagged sentinel
    pub tag: u16,
    /// Message-out bytes for selection
    pub msg_out: &'a ArrayVec<u8, MSG_OUT_LEN>,
    /// Command bytes
    pub cdb: &'a [u8],
    /// Negotiation carried in `msg_out`
    pub nego: Option<NegoKind>,
    /// Abort requested
    pub to_abort: bool,
}

/// Host memory as the engine sees it
pub struct ScriptsPort<'a> {
    squeue: &'a mut StartQueue,
    dqueue: &'a mut DoneQueue,
    ccbs: &'a mut CcbPool,
}

impl<'a> ScriptsPort<'a> {
    pub(crate) fn new(squeue: &'a mut StartQueue, dqueue: &'a mut DoneQueue, ccbs: &'a mut CcbPool) -> Self {
        Self { squeue, dqueue, ccbs }
    }

    /// Take the next CCB address off the start queue
    pub fn fetch_start(&mut self) -> Option<BusAddr> {
        self.squeue.fetch()
    }

    /// Look at the CCB behind a bus address
    pub fn ccb(&self, dsa: BusAddr) -> Option<CcbView<'_>> {
        let ccb = self.ccbs.get(self.ccbs.from_dsa(dsa)?);
        Some(CcbView {
            target: ccb.target,
            lun: ccb.lun,
            tag: ccb.tag,
            msg_out: &ccb.msg_out,
            cdb: ccb.cdb.as_slice(),
            nego: ccb.nego_status,
            to_abort: ccb.to_abort != 0,
        })
    }

    /// Mark the CCB as running a negotiation or back to plain busy
    pub fn set_negotiating(&mut self, dsa: BusAddr, negotiating: bool) {
        if let Some(h) = self.ccbs.from_dsa(dsa) {
            let ccb = self.ccbs.get_mut(h);
            if ccb.host_status.is_busy() {
                ccb.host_status = if negotiating { HostStatus::Negotiate } else { HostStatus::Busy };
            }
        }
    }

    /// Mark the CCB disconnected
    pub fn set_disconnected(&mut self, dsa: BusAddr) {
        if let Some(h) = self.ccbs.from_dsa(dsa) {
            let ccb = self.ccbs.get_mut(h);
            if ccb.host_status.is_busy() {
                ccb.host_status = HostStatus::Disconnected;
            }
        }
    }

    /// Write the status area of a CCB and post it on the done queue
    ///
    /// Returns false when the address is unknown or the ring is full.
    pub fn post_done(&mut self, dsa: BusAddr, status: ChipStatus) -> bool {
        let Some(h) = self.ccbs.from_dsa(dsa) else {
            return false;
        };
        self.ccbs.get_mut(h).chip = status;
        self.dqueue.post(dsa)
    }
}
