//! # SYM53C8XX Host Adapter Core
//!
//! Command scheduling, transfer negotiation and error recovery for the
//! Symbios/LSI 53C8XX and 53C1010 family of parallel SCSI host adapters.
//!
//! ## Features
//! - CCB, LCB and TCB bookkeeping with per-LUN tag allocation
//! - Start/done queue rings shared with the adapter's co-processor
//! - Emulated device queueing with a bounded-reordering limiter
//! - SDTR, WDTR and PPR negotiation, steered by INQUIRY data
//! - Timeout wheel driving abort, target reset, bus reset and adapter
//!   reset in turn
//! - Symbios and Tekram NVRAM layouts over two- and three-wire EEPROMs
//!
//! ## Usage
//!
//! Build an [`Adapter`] from a [`SymConfig`], a [`sym_memory::DmaMemory`]
//! and an implementation of [`Scripts`]. Submit with [`Adapter::queue`],
//! call [`Adapter::interrupt`] from the interrupt path and
//! [`Adapter::tick`] from a periodic timer. Finished commands arrive at
//! the [`CompletionSink`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod adapter;
pub mod ccb;
pub mod config;
pub mod defs;
pub mod hcb;
pub mod lcb;
pub mod nego;
pub mod nvram;
pub mod queue;
pub mod recovery;
pub mod scripts;
pub mod scsi;
pub mod tcb;
pub mod timer;


pub use adapter::{Adapter, CompletionSink, QueueError};
pub use config::{ChipFeatures, ChipProfile, DeviceQueueing, SymConfig};
pub use hcb::{Completion, HbaError, HbaResult, HbaStats, Hcb, UnitStatus};
pub use nego::Sniffed;
pub use nvram::{NvramError, NvramSettings};
pub use recovery::{RecoveryOutcome, RecoveryWaiter};
pub use scripts::{Resume, Scripts, ScriptsEvent, ScriptsPort};
pub use scsi::{
    CommandId, CommandResult, CommandStatus, DataDirection, DataSegment, RequestId, ScsiRequest, TagHint,
};
pub use tcb::{TransInfo, Transfer};
