//! # Limits and Protocol Constants
//!
//! Compile-time limits of the core and the SCSI message and status codes
//! it speaks.

use static_assertions::const_assert;

// =============================================================================
// Limits
// =============================================================================

/// Targets per bus
pub const MAX_TARGET: usize = 16;

/// Logical units per target
pub const MAX_LUN: usize = 64;

/// log2 of the tag space per LUN
pub const MAX_TAG_ORDER: u32 = 6;

/// Tag space per LUN
pub const MAX_TASK: usize = 1 << MAX_TAG_ORDER;

/// Largest usable tagged queue depth
pub const MAX_TAG: usize = MAX_TASK;

/// Sentinel tag of an untagged command
pub const NO_TAG: u16 = 256;

/// Scatter/gather entries per command
pub const MAX_SG: usize = 96;

/// Start and done queue slots
pub const MAX_QUEUE: usize = 7 * MAX_TASK + 2;

/// Commands that may be queued to the chip at once
pub const MAX_START: usize = MAX_QUEUE - 2;

/// Longest CDB
pub const MAX_CDB: usize = 16;

/// Sense bytes kept per command
pub const SENSE_LEN: usize = 32;

/// Message-out buffer per command: identify, tag, and a PPR message
pub const MSG_OUT_LEN: usize = 12;

/// Longest extended message handled
pub const MSG_IN_LEN: usize = 8;

const_assert!(MAX_TAG <= MAX_TASK);
const_assert!(MAX_TASK <= 256);
const_assert!(MAX_QUEUE * 8 <= sym_hal::CLUSTER_SIZE as usize);
const_assert!(MAX_LUN <= 64);

// =============================================================================
// Chip-visible layout
// =============================================================================

/// Bytes of one queue slot
pub const QUEUE_SLOT_BYTES: usize = 4;

/// Fixed header of a CCB's chip area (status, pointers, CDB, sense)
pub const CCB_HEADER_BYTES: usize = 96;

/// Bytes of one scatter/gather entry (address, length)
pub const SG_ENTRY_BYTES: usize = 8;

/// Chip area of one CCB: header, message buffer, scatter/gather table
pub const CCB_DMA_BYTES: usize = CCB_HEADER_BYTES + 16 + MAX_SG * SG_ENTRY_BYTES;

/// Offset of the scatter/gather table inside a CCB's chip area
pub const CCB_SG_OFFSET: usize = CCB_HEADER_BYTES + 16;

/// Chip area of one LCB: task address, reselect address, tag table address
pub const LCB_DMA_BYTES: usize = 16;

const_assert!(CCB_DMA_BYTES <= sym_hal::CLUSTER_SIZE as usize);

// =============================================================================
// Messages
// =============================================================================

/// SCSI message codes
pub mod msg {
    /// COMMAND COMPLETE
    pub const COMPLETE: u8 = 0x00;
    /// Extended message introducer
    pub const EXTENDED: u8 = 0x01;
    /// SAVE DATA POINTER
    pub const SAVE_DP: u8 = 0x02;
    /// RESTORE POINTERS
    pub const RESTORE_DP: u8 = 0x03;
    /// DISCONNECT
    pub const DISCONNECT: u8 = 0x04;
    /// INITIATOR DETECTED ERROR
    pub const ID_ERROR: u8 = 0x05;
    /// ABORT TASK SET
    pub const ABORT: u8 = 0x06;
    /// MESSAGE REJECT
    pub const REJECT: u8 = 0x07;
    /// NO OPERATION
    pub const NOOP: u8 = 0x08;
    /// MESSAGE PARITY ERROR
    pub const PARITY: u8 = 0x09;
    /// TARGET RESET (bus device reset)
    pub const RESET: u8 = 0x0c;
    /// ABORT TASK
    pub const ABORT_TAG: u8 = 0x0d;
    /// CLEAR TASK SET
    pub const CLEAR_QUEUE: u8 = 0x0e;
    /// SIMPLE QUEUE TAG
    pub const SIMPLE_TAG: u8 = 0x20;
    /// HEAD OF QUEUE TAG
    pub const HEAD_TAG: u8 = 0x21;
    /// ORDERED QUEUE TAG
    pub const ORDERED_TAG: u8 = 0x22;
    /// IDENTIFY
    pub const IDENTIFY: u8 = 0x80;
    /// IDENTIFY bit granting disconnect privilege
    pub const IDENTIFY_DISC: u8 = 0x40;

    /// Extended SYNCHRONOUS DATA TRANSFER REQUEST
    pub const X_SYNC_REQ: u8 = 0x01;
    /// Extended WIDE DATA TRANSFER REQUEST
    pub const X_WIDE_REQ: u8 = 0x03;
    /// Extended PARALLEL PROTOCOL REQUEST
    pub const X_PPR_REQ: u8 = 0x04;

    /// PPR option: double transition clocking
    pub const PPR_OPT_DT: u8 = 0x02;
    /// PPR options understood by the chip
    pub const PPR_OPT_MASK: u8 = 0x07;
}

// =============================================================================
// SCSI status
// =============================================================================

/// SCSI status byte values
pub mod status {
    /// GOOD
    pub const GOOD: u8 = 0x00;
    /// CHECK CONDITION
    pub const CHECK_CONDITION: u8 = 0x02;
    /// CONDITION MET
    pub const CONDITION_MET: u8 = 0x04;
    /// BUSY
    pub const BUSY: u8 = 0x08;
    /// RESERVATION CONFLICT
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    /// TASK SET FULL
    pub const QUEUE_FULL: u8 = 0x28;
    /// Not a status the target sent; set before completion
    pub const ILLEGAL: u8 = 0xff;
}

// =============================================================================
// Identification data
// =============================================================================

/// Bits of the standard INQUIRY response the negotiation engine inspects
pub mod inquiry {
    /// Byte 7: tagged command queueing
    pub const BYTE7_CMDQUE: u8 = 0x02;
    /// Byte 7: synchronous transfers
    pub const BYTE7_SYNC: u8 = 0x10;
    /// Byte 7: 16-bit wide bus
    pub const BYTE7_WBUS16: u8 = 0x20;
    /// Byte 56: double transition clocking supported
    pub const BYTE56_CLOCKING_DT: u8 = 0x04;
    /// Minimum length of a standard response
    pub const MIN_LEN: usize = 36;
}
