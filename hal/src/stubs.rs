//! # Software Platform Models
//!
//! Stand-ins for the platform side of every HAL boundary: a cluster source
//! that fabricates address pairs, and bit-accurate models of the two serial
//! EEPROM families found next to 53C8XX parts. They are complete enough to
//! drive the real protocol decoders end to end.

use crate::{BusAddr, ClusterSource, DmaConstraints, HalError, HalResult, Level, Line, NvramLines, VirtAddr, CLUSTER_SIZE};
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

// =============================================================================
// Cluster Source
// =============================================================================

/// Cluster source handing out synthetic, never dereferenced address pairs
///
/// Virtual and bus addresses advance in lockstep from two bases, so a test
/// can predict the bus address of any virtual address it was given.
#[derive(Debug)]
pub struct SimulatedClusters {
    virt_base: u64,
    bus_base: u32,
    next: u64,
    limit: Option<usize>,
    live: BTreeMap<u64, BusAddr>,
    recycled: Vec<(u64, BusAddr)>,
    /// Number of successful `get_cluster` calls
    pub gets: usize,
    /// Number of `put_cluster` calls
    pub puts: usize,
}

impl SimulatedClusters {
    /// Create a source whose first cluster sits at the given bases
    pub fn new(virt_base: u64, bus_base: u32) -> Self {
        Self {
            virt_base,
            bus_base,
            next: 0,
            limit: None,
            live: BTreeMap::new(),
            recycled: Vec::new(),
            gets: 0,
            puts: 0,
        }
    }

    /// Cap the number of clusters outstanding at once
    pub fn with_limit(mut self, clusters: usize) -> Self {
        self.limit = Some(clusters);
        self
    }

    /// Clusters currently handed out
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }
}

impl Default for SimulatedClusters {
    fn default() -> Self {
        Self::new(0xffff_8000_1000_0000, 0x0010_0000)
    }
}

impl ClusterSource for SimulatedClusters {
    fn get_cluster(&mut self, constraints: DmaConstraints) -> HalResult<(VirtAddr, BusAddr)> {
        if self.limit.is_some_and(|limit| self.live.len() >= limit) {
            return Err(HalError::OutOfMemory);
        }
        let (virt, bus) = match self.recycled.pop() {
            Some(pair) => pair,
            None => {
                let offset = self.next * CLUSTER_SIZE;
                let bus = u32::try_from(offset)
                    .ok()
                    .and_then(|off| self.bus_base.checked_add(off))
                    .ok_or(HalError::OutOfMemory)?;
                self.next += 1;
                (self.virt_base + offset, BusAddr::new(bus))
            }
        };
        if !constraints.reaches(bus, CLUSTER_SIZE) {
            self.recycled.push((virt, bus));
            return Err(HalError::OutOfMemory);
        }
        self.live.insert(virt, bus);
        self.gets += 1;
        Ok((VirtAddr::new(virt), bus))
    }

    fn put_cluster(&mut self, virt: VirtAddr) {
        if let Some(bus) = self.live.remove(&virt.as_u64()) {
            self.recycled.push((virt.as_u64(), bus));
            self.puts += 1;
        }
    }
}

// =============================================================================
// Two-Wire EEPROM (24C16)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiving {
    Select,
    AddressLow,
    WriteData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TwoWirePhase {
    Idle,
    /// Shifting in a byte from the host
    Receive { role: Receiving, byte: u8, bits: u8 },
    /// Driving the acknowledge bit for a received byte
    Acknowledge { then_transmit: bool, role: Receiving },
    /// Shifting out a byte to the host
    Transmit { byte: u8, bit: u8 },
    /// Sampling the host's acknowledge after a transmitted byte
    HostAck { acked: bool },
}

/// Bit-level model of a 24C16 two-wire serial EEPROM (2 KiB)
///
/// Data is open-drain: the line reads low whenever either side drives it
/// low. START and STOP are detected as data transitions while the clock is
/// high, exactly like the real part.
#[derive(Debug)]
pub struct TwoWireEeprom {
    mem: Vec<u8>,
    address: usize,
    host_data: Level,
    host_clock: Level,
    device_data: Level,
    phase: TwoWirePhase,
    /// When set, the device never acknowledges its select byte
    pub absent: bool,
}

impl TwoWireEeprom {
    /// Total capacity in bytes
    pub const SIZE: usize = 2048;

    /// Create an erased (all 0xff) part
    pub fn new() -> Self {
        Self {
            mem: vec![0xff; Self::SIZE],
            address: 0,
            host_data: Level::High,
            host_clock: Level::High,
            device_data: Level::High,
            phase: TwoWirePhase::Idle,
            absent: false,
        }
    }

    /// Program bytes starting at `offset`
    pub fn program(&mut self, offset: usize, bytes: &[u8]) {
        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn data(&self) -> Level {
        if self.host_data == Level::Low || self.device_data == Level::Low {
            Level::Low
        } else {
            Level::High
        }
    }

    fn begin_transmit(&mut self) {
        let byte = self.mem[self.address];
        self.device_data = Level::from_bit(byte & 0x80 != 0);
        self.phase = TwoWirePhase::Transmit { byte, bit: 0 };
    }

    fn rising_edge(&mut self) {
        let sample = self.data().is_high();
        match self.phase {
            TwoWirePhase::Receive { role, byte, bits } if bits < 8 => {
                self.phase = TwoWirePhase::Receive { role, byte: (byte << 1) | u8::from(sample), bits: bits + 1 };
            }
            TwoWirePhase::HostAck { .. } => {
                self.phase = TwoWirePhase::HostAck { acked: !sample };
            }
            _ => {}
        }
    }

    fn falling_edge(&mut self) {
        match self.phase {
            TwoWirePhase::Receive { role, byte, bits: 8 } => self.byte_received(role, byte),
            TwoWirePhase::Acknowledge { then_transmit, role } => {
                self.device_data = Level::High;
                if then_transmit {
                    self.begin_transmit();
                } else {
                    self.phase = TwoWirePhase::Receive { role, byte: 0, bits: 0 };
                }
            }
            TwoWirePhase::Transmit { byte, bit } => {
                if bit == 7 {
                    self.device_data = Level::High;
                    self.phase = TwoWirePhase::HostAck { acked: false };
                } else {
                    let bit = bit + 1;
                    self.device_data = Level::from_bit(byte & (0x80 >> bit) != 0);
                    self.phase = TwoWirePhase::Transmit { byte, bit };
                }
            }
            TwoWirePhase::HostAck { acked } => {
                if acked {
                    self.address = (self.address + 1) % Self::SIZE;
                    self.begin_transmit();
                } else {
                    self.phase = TwoWirePhase::Idle;
                }
            }
            _ => {}
        }
    }

    fn byte_received(&mut self, role: Receiving, byte: u8) {
        let (then_transmit, next) = match role {
            Receiving::Select => {
                if byte & 0xf0 != 0xa0 || self.absent {
                    self.phase = TwoWirePhase::Idle;
                    return;
                }
                let block = usize::from((byte >> 1) & 0x07);
                self.address = (block << 8) | (self.address & 0xff);
                (byte & 0x01 != 0, Receiving::AddressLow)
            }
            Receiving::AddressLow => {
                self.address = (self.address & !0xff) | usize::from(byte);
                (false, Receiving::WriteData)
            }
            // Writes are acknowledged and dropped; only reads are modelled.
            Receiving::WriteData => (false, Receiving::WriteData),
        };
        self.device_data = Level::Low;
        self.phase = TwoWirePhase::Acknowledge { then_transmit, role: next };
    }
}

impl Default for TwoWireEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl NvramLines for TwoWireEeprom {
    fn set_line(&mut self, line: Line, level: Level) {
        match line {
            Line::Data => {
                let before = self.data();
                self.host_data = level;
                let after = self.data();
                if self.host_clock == Level::High && before != after {
                    // Data moving under a high clock is START or STOP.
                    self.device_data = Level::High;
                    self.phase = if after == Level::Low {
                        TwoWirePhase::Receive { role: Receiving::Select, byte: 0, bits: 0 }
                    } else {
                        TwoWirePhase::Idle
                    };
                }
            }
            Line::Clock => {
                if self.host_clock == level {
                    return;
                }
                self.host_clock = level;
                match level {
                    Level::High => self.rising_edge(),
                    Level::Low => self.falling_edge(),
                }
            }
            Line::Select | Line::DataOut => {}
        }
    }

    fn read_line(&mut self, line: Line) -> Level {
        match line {
            Line::Data => self.data(),
            Line::Clock => self.host_clock,
            Line::Select | Line::DataOut => Level::High,
        }
    }
}

// =============================================================================
// Three-Wire EEPROM (93C46)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreeWirePhase {
    /// Waiting for the leading one of a command
    AwaitStart,
    /// Shifting in opcode and address bits after the start bit
    Command { bits: u16, count: u8 },
    /// Shifting out a data word
    Output { word: u16, bit: u8 },
    /// Command finished or unsupported; wait for deselect
    Done,
}

/// Bit-level model of a 93C46 three-wire serial EEPROM (64 x 16 bits)
///
/// Commands are `1 OP1 OP0 A5..A0` clocked in on rising edges while chip
/// select is high. On READ the part answers with a dummy zero followed by
/// sixteen data bits, most significant first.
#[derive(Debug)]
pub struct ThreeWireEeprom {
    words: [u16; 64],
    select: Level,
    clock: Level,
    data_in: Level,
    data_out: Level,
    phase: ThreeWirePhase,
    /// When set, the part never drives the dummy zero
    pub absent: bool,
}

impl ThreeWireEeprom {
    /// Number of 16-bit words
    pub const WORDS: usize = 64;

    /// Create an erased (all ones) part
    pub fn new() -> Self {
        Self {
            words: [0xffff; Self::WORDS],
            select: Level::Low,
            clock: Level::Low,
            data_in: Level::Low,
            data_out: Level::High,
            phase: ThreeWirePhase::AwaitStart,
            absent: false,
        }
    }

    /// Program little-endian bytes as words starting at word 0
    pub fn program_bytes(&mut self, bytes: &[u8]) {
        for (word, pair) in self.words.iter_mut().zip(bytes.chunks(2)) {
            let hi = pair.get(1).copied().unwrap_or(0xff);
            *word = u16::from_le_bytes([pair[0], hi]);
        }
    }

    fn rising_edge(&mut self) {
        let bit = u16::from(self.data_in.is_high());
        self.phase = match self.phase {
            ThreeWirePhase::AwaitStart if bit == 1 => ThreeWirePhase::Command { bits: 0, count: 0 },
            ThreeWirePhase::AwaitStart => ThreeWirePhase::AwaitStart,
            ThreeWirePhase::Command { bits, count } => {
                let bits = (bits << 1) | bit;
                let count = count + 1;
                if count < 8 {
                    ThreeWirePhase::Command { bits, count }
                } else if bits >> 6 == 0b10 && !self.absent {
                    self.data_out = Level::Low;
                    ThreeWirePhase::Output { word: self.words[usize::from(bits & 0x3f)], bit: 0 }
                } else {
                    ThreeWirePhase::Done
                }
            }
            ThreeWirePhase::Output { word, bit } if bit < 16 => {
                self.data_out = Level::from_bit(word & (0x8000 >> bit) != 0);
                ThreeWirePhase::Output { word, bit: bit + 1 }
            }
            ThreeWirePhase::Output { .. } => {
                self.data_out = Level::High;
                ThreeWirePhase::Done
            }
            ThreeWirePhase::Done => ThreeWirePhase::Done,
        };
    }
}

impl Default for ThreeWireEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl NvramLines for ThreeWireEeprom {
    fn set_line(&mut self, line: Line, level: Level) {
        match line {
            Line::Select => {
                if level == Level::Low {
                    self.data_out = Level::High;
                }
                if self.select != level {
                    self.phase = ThreeWirePhase::AwaitStart;
                }
                self.select = level;
            }
            Line::Clock => {
                let rising = self.clock == Level::Low && level == Level::High;
                self.clock = level;
                if rising && self.select == Level::High {
                    self.rising_edge();
                }
            }
            Line::Data => self.data_in = level,
            Line::DataOut => {}
        }
    }

    fn read_line(&mut self, line: Line) -> Level {
        match line {
            Line::DataOut => self.data_out,
            Line::Data => self.data_in,
            Line::Clock => self.clock,
            Line::Select => self.select,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clusters_pairs() {
        let mut src = SimulatedClusters::new(0x1000_0000, 0x0020_0000);
        let (v0, b0) = src.get_cluster(DmaConstraints::BITS_32).unwrap();
        let (v1, b1) = src.get_cluster(DmaConstraints::BITS_32).unwrap();
        assert!(v0.is_aligned(CLUSTER_SIZE));
        assert_eq!(v1.as_u64() - v0.as_u64(), CLUSTER_SIZE);
        assert_eq!(u64::from(b1.as_u32() - b0.as_u32()), CLUSTER_SIZE);
        src.put_cluster(v0);
        assert_eq!(src.outstanding(), 1);
        assert_eq!(src.puts, 1);
    }

    #[test]
    fn test_simulated_clusters_limit() {
        let mut src = SimulatedClusters::default().with_limit(1);
        assert!(src.get_cluster(DmaConstraints::BITS_32).is_ok());
        assert_eq!(src.get_cluster(DmaConstraints::BITS_32), Err(HalError::OutOfMemory));
    }

    #[test]
    fn test_simulated_clusters_mask() {
        let mut src = SimulatedClusters::new(0x1000_0000, 0x0100_0000);
        assert_eq!(src.get_cluster(DmaConstraints::BITS_24), Err(HalError::OutOfMemory));
        assert!(src.get_cluster(DmaConstraints::BITS_32).is_ok());
    }

    #[test]
    fn test_two_wire_start_stop_detection() {
        let mut rom = TwoWireEeprom::new();
        rom.set_line(Line::Clock, Level::High);
        rom.set_line(Line::Data, Level::Low);
        assert!(matches!(rom.phase, TwoWirePhase::Receive { role: Receiving::Select, .. }));
        rom.set_line(Line::Data, Level::High);
        assert_eq!(rom.phase, TwoWirePhase::Idle);
    }

    #[test]
    fn test_three_wire_dummy_zero() {
        let mut rom = ThreeWireEeprom::new();
        rom.set_line(Line::Select, Level::High);
        for i in (0..9).rev() {
            rom.set_line(Line::Data, Level::from_bit((0x180u16 >> i) & 1 != 0));
            rom.set_line(Line::Clock, Level::High);
            rom.set_line(Line::Clock, Level::Low);
        }
        assert_eq!(rom.read_line(Line::DataOut), Level::Low);
    }
}
