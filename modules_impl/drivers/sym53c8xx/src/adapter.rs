//! # Adapter
//!
//! Thread-safe front end of one host adapter. Submission, interrupt,
//! tick and administrative calls all serialize on one spin lock around
//! the [`Hcb`]. Completions gathered under the lock are delivered to the
//! [`CompletionSink`] after it is dropped, in completion order, followed
//! by the bus reset notice when one happened.

use crate::config::SymConfig;
use crate::hcb::{Completion, HbaCounters, HbaError, HbaStats, Hcb, UnitStatus};
use crate::nego::Sniffed;
use crate::recovery::{RecoveryOutcome, RecoveryWaiter};
use crate::scripts::Scripts;
use crate::scsi::{CommandId, CommandResult, RequestId, ScsiRequest};
use crate::tcb::{TransInfo, Transfer};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;
use sym_hal::NvramLines;
use sym_memory::{AllocatorStats, DmaMemory};

/// Receiver of finished commands
pub trait CompletionSink: Send + Sync {
    /// A command finished
    fn complete(&self, request: RequestId, result: CommandResult);

    /// The SCSI bus was reset; every outstanding command was failed
    fn bus_reset(&self) {}
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Resources are exhausted for now; resubmit later
    Busy,
    /// Target ID out of range or the adapter's own
    InvalidTarget,
    /// LUN out of range or not scanned
    InvalidLun,
    /// Malformed request
    InvalidRequest,
    /// The adapter is not operational
    Hardware,
}

impl From<HbaError> for QueueError {
    fn from(err: HbaError) -> Self {
        match err {
            HbaError::Busy | HbaError::ResourceShortage | HbaError::OutOfMemory => QueueError::Busy,
            HbaError::InvalidTarget => QueueError::InvalidTarget,
            HbaError::InvalidLun => QueueError::InvalidLun,
            HbaError::InvalidRequest => QueueError::InvalidRequest,
            HbaError::Hardware => QueueError::Hardware,
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            QueueError::Busy => "busy, retry later",
            QueueError::InvalidTarget => "invalid target",
            QueueError::InvalidLun => "invalid LUN",
            QueueError::InvalidRequest => "invalid request",
            QueueError::Hardware => "adapter failure",
        };
        f.write_str(text)
    }
}

/// One SYM53C8XX host adapter
pub struct Adapter {
    pub(crate) hcb: Mutex<Hcb>,
    sink: Arc<dyn CompletionSink>,
    counters: Arc<HbaCounters>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

impl Adapter {
    /// Bring an adapter up, see [`Hcb::attach`]
    pub fn attach(
        config: SymConfig,
        memory: DmaMemory,
        scripts: Box<dyn Scripts>,
        lines: Option<&mut dyn NvramLines>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, HbaError> {
        let mut hcb = Hcb::attach(config, memory, scripts, lines)?;
        // The attach-time reset has nothing to report
        let _ = hcb.take_bus_reset();
        let counters = hcb.counters();
        Ok(Self { hcb: Mutex::new(hcb), sink, counters })
    }

    /// Run `f` under the lock, then deliver what it produced
    fn run<R>(&self, f: impl FnOnce(&mut Hcb) -> R) -> R {
        let (ret, done, reset) = {
            let mut hcb = self.hcb.lock();
            let ret = f(&mut hcb);
            (ret, hcb.take_completions(), hcb.take_bus_reset())
        };
        self.deliver(done, reset);
        ret
    }

    fn deliver(&self, done: Vec<Completion>, reset: bool) {
        for c in done {
            self.sink.complete(c.request, c.result);
        }
        if reset {
            self.sink.bus_reset();
        }
    }

    /// Submit a command
    pub fn queue(&self, req: &ScsiRequest<'_>) -> Result<CommandId, QueueError> {
        self.run(|hcb| hcb.queue(req)).map_err(|err| {
            log::trace!("[sym] request {} refused: {}", req.id, err);
            QueueError::from(err)
        })
    }

    /// Interrupt entry: service the co-processor
    pub fn interrupt(&self) {
        self.run(Hcb::interrupt)
    }

    /// Timer entry: advance one tick
    pub fn tick(&self) {
        self.run(Hcb::tick)
    }

    /// Abort one command
    pub fn abort(&self, id: CommandId) -> RecoveryWaiter {
        self.run(|hcb| hcb.abort(id))
    }

    /// Reset one target
    pub fn reset_target(&self, target: u8) -> Result<RecoveryWaiter, HbaError> {
        self.run(|hcb| hcb.reset_target(target))
    }

    /// Reset the SCSI bus
    pub fn reset_bus(&self) -> RecoveryWaiter {
        self.run(Hcb::reset_bus)
    }

    /// Reset and reinitialize the adapter
    pub fn reset_host(&self) -> RecoveryWaiter {
        self.run(Hcb::reset_host)
    }

    /// Block until a recovery finished, servicing the adapter meanwhile
    ///
    /// Meant for contexts where no interrupt or timer drives the adapter.
    pub fn wait(&self, waiter: &RecoveryWaiter) -> RecoveryOutcome {
        waiter.wait(|| self.interrupt())
    }

    /// Set a target's transfer ceiling
    pub fn set_negotiation_goal(&self, target: u8, goal: Transfer) -> Result<Transfer, HbaError> {
        self.run(|hcb| hcb.set_negotiation_goal(target, goal))
    }

    /// Change a LUN's tagged queue depth
    pub fn set_queue_depth(&self, target: u8, lun: u8, depth: u16) -> Result<u16, HbaError> {
        self.run(|hcb| hcb.set_queue_depth(target, lun, depth))
    }

    /// Feed standard INQUIRY data of a LUN
    pub fn sniff_inquiry(&self, target: u8, lun: u8, data: &[u8]) -> Result<Option<Sniffed>, HbaError> {
        self.run(|hcb| hcb.sniff_inquiry(target, lun, data))
    }

    /// Transfer parameters of a target
    pub fn transfer_info(&self, target: u8) -> Result<TransInfo, HbaError> {
        self.hcb.lock().transfer_info(target)
    }

    /// Queueing state of a LUN
    pub fn unit_status(&self, target: u8, lun: u8) -> Result<Option<UnitStatus>, HbaError> {
        self.hcb.lock().unit_status(target, lun)
    }

    /// Counter snapshot, without taking the lock
    pub fn stats(&self) -> HbaStats {
        self.counters.snapshot()
    }

    /// DMA allocator statistics
    pub fn memory_stats(&self) -> AllocatorStats {
        self.hcb.lock().memory_stats()
    }

    /// Shut the adapter down, failing whatever is still outstanding
    pub fn detach(self) {
        let done = self.hcb.into_inner().detach();
        for c in done {
            self.sink.complete(c.request, c.result);
        }
    }
}
