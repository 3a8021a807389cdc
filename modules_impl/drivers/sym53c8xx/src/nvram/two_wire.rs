//! Two-wire (24C16) EEPROM reader
//!
//! The data line is open-drain: "releasing" it means setting it high and
//! letting the device pull it down. Every call to [`TwoWireReader::step`]
//! performs exactly one line operation.

use super::{NvramError, NvramResult};
use alloc::vec::Vec;
use sym_hal::{Level, Line, NvramLines};

/// Device select code of the 24C16
const DEVICE_CODE: u8 = 0xa0;

/// Which byte an acknowledge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    SelectWrite,
    AddressLow,
    SelectRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Park both lines low, then leave via STOP
    Init(u8),
    /// Data high, clock high, data low, clock low
    Start { step: u8, stage: Stage },
    /// Set data, clock high, clock low; eight times MSB first
    SendBit { byte: u8, bit: u8, step: u8, stage: Stage },
    /// Release data, clock high, sample, clock low
    GetAck { step: u8, stage: Stage },
    /// Release data, then clock high, sample, clock low per bit
    RecvBit { bit: u8, acc: u8, step: u8 },
    /// Drive ack or nack, clock high, clock low, release
    PutAck { step: u8 },
    /// Data low, clock high, data high
    Stop(u8),
    Done,
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More steps to go
    Running,
    /// Transfer finished
    Finished,
}

/// State machine reading a block from a 24C16
#[derive(Debug)]
pub struct TwoWireReader {
    offset: u16,
    len: usize,
    data: Vec<u8>,
    state: State,
    error: Option<NvramError>,
}

impl TwoWireReader {
    /// Prepare to read `len` bytes at `offset`
    pub fn new(offset: u16, len: usize) -> Self {
        Self { offset, len, data: Vec::with_capacity(len), state: State::Init(0), error: None }
    }

    fn select_byte(&self, read: bool) -> u8 {
        DEVICE_CODE | ((self.offset >> 7) as u8 & 0x0e) | u8::from(read)
    }

    /// Perform one line operation
    pub fn step(&mut self, lines: &mut dyn NvramLines) -> Progress {
        let state = self.state;
        self.state = match state {
            State::Init(step) => {
                match step {
                    0 => lines.set_line(Line::Clock, Level::Low),
                    1 => lines.set_line(Line::Data, Level::Low),
                    2 => lines.set_line(Line::Clock, Level::High),
                    _ => lines.set_line(Line::Data, Level::High),
                }
                if step < 3 {
                    State::Init(step + 1)
                } else {
                    State::Start { step: 0, stage: Stage::SelectWrite }
                }
            }
            State::Start { step, stage } => {
                match step {
                    0 => lines.set_line(Line::Data, Level::High),
                    1 => lines.set_line(Line::Clock, Level::High),
                    2 => lines.set_line(Line::Data, Level::Low),
                    _ => lines.set_line(Line::Clock, Level::Low),
                }
                if step < 3 {
                    State::Start { step: step + 1, stage }
                } else {
                    let byte = self.select_byte(stage == Stage::SelectRead);
                    State::SendBit { byte, bit: 0, step: 0, stage }
                }
            }
            State::SendBit { byte, bit, step, stage } => match step {
                0 => {
                    lines.set_line(Line::Data, Level::from_bit(byte & (0x80 >> bit) != 0));
                    State::SendBit { byte, bit, step: 1, stage }
                }
                1 => {
                    lines.set_line(Line::Clock, Level::High);
                    State::SendBit { byte, bit, step: 2, stage }
                }
                _ => {
                    lines.set_line(Line::Clock, Level::Low);
                    if bit < 7 {
                        State::SendBit { byte, bit: bit + 1, step: 0, stage }
                    } else {
                        State::GetAck { step: 0, stage }
                    }
                }
            },
            State::GetAck { step, stage } => match step {
                0 => {
                    lines.set_line(Line::Data, Level::High);
                    State::GetAck { step: 1, stage }
                }
                1 => {
                    lines.set_line(Line::Clock, Level::High);
                    State::GetAck { step: 2, stage }
                }
                2 => {
                    if lines.read_line(Line::Data).is_high() {
                        self.error = Some(NvramError::NoAcknowledge);
                    }
                    State::GetAck { step: 3, stage }
                }
                _ => {
                    lines.set_line(Line::Clock, Level::Low);
                    if self.error.is_some() {
                        return self.progress(State::Stop(0));
                    }
                    match stage {
                        Stage::SelectWrite => State::SendBit {
                            byte: (self.offset & 0xff) as u8,
                            bit: 0,
                            step: 0,
                            stage: Stage::AddressLow,
                        },
                        Stage::AddressLow => State::Start { step: 0, stage: Stage::SelectRead },
                        Stage::SelectRead if self.len == 0 => State::Stop(0),
                        Stage::SelectRead => State::RecvBit { bit: 0, acc: 0, step: 0 },
                    }
                }
            },
            State::RecvBit { bit, acc, step } => match step {
                0 => {
                    lines.set_line(Line::Data, Level::High);
                    State::RecvBit { bit, acc, step: 1 }
                }
                1 => {
                    lines.set_line(Line::Clock, Level::High);
                    State::RecvBit { bit, acc, step: 2 }
                }
                2 => {
                    let acc = (acc << 1) | u8::from(lines.read_line(Line::Data).is_high());
                    State::RecvBit { bit, acc, step: 3 }
                }
                _ => {
                    lines.set_line(Line::Clock, Level::Low);
                    if bit < 7 {
                        State::RecvBit { bit: bit + 1, acc, step: 1 }
                    } else {
                        self.data.push(acc);
                        State::PutAck { step: 0 }
                    }
                }
            },
            State::PutAck { step } => {
                let last = self.data.len() >= self.len;
                match step {
                    0 => lines.set_line(Line::Data, Level::from_bit(last)),
                    1 => lines.set_line(Line::Clock, Level::High),
                    2 => lines.set_line(Line::Clock, Level::Low),
                    _ => lines.set_line(Line::Data, Level::High),
                }
                match step {
                    0..=2 => State::PutAck { step: step + 1 },
                    _ if last => State::Stop(0),
                    _ => State::RecvBit { bit: 0, acc: 0, step: 0 },
                }
            }
            State::Stop(step) => {
                match step {
                    0 => lines.set_line(Line::Data, Level::Low),
                    1 => lines.set_line(Line::Clock, Level::High),
                    _ => lines.set_line(Line::Data, Level::High),
                }
                if step < 2 {
                    State::Stop(step + 1)
                } else {
                    State::Done
                }
            }
            State::Done => State::Done,
        };
        self.progress(self.state)
    }

    fn progress(&mut self, next: State) -> Progress {
        self.state = next;
        if next == State::Done {
            Progress::Finished
        } else {
            Progress::Running
        }
    }

    /// Result once [`Progress::Finished`] was returned
    pub fn finish(self) -> NvramResult<Vec<u8>> {
        match self.error {
            Some(err) => Err(err),
            None if self.data.len() == self.len => Ok(self.data),
            None => Err(NvramError::Incomplete),
        }
    }
}

/// Read `len` bytes at `offset` from a 24C16
pub fn read_block(lines: &mut dyn NvramLines, offset: u16, len: usize) -> NvramResult<Vec<u8>> {
    let mut reader = TwoWireReader::new(offset, len);
    // About 30 operations per byte read plus the addressing preamble
    let budget = 128 + len * 48;
    for _ in 0..budget {
        if reader.step(lines) == Progress::Finished {
            return reader.finish();
        }
    }
    Err(NvramError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::stubs::TwoWireEeprom;

    #[test]
    fn test_reads_programmed_bytes() {
        let mut rom = TwoWireEeprom::new();
        rom.program(0x100, b"symbios!");
        rom.program(0x3fe, &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(read_block(&mut rom, 0x100, 8).unwrap(), b"symbios!".to_vec());
        // Crosses into the next 256-byte block
        assert_eq!(read_block(&mut rom, 0x3fe, 4).unwrap(), alloc::vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_absent_device_fails() {
        let mut rom = TwoWireEeprom::new();
        rom.absent = true;
        assert_eq!(read_block(&mut rom, 0x100, 4), Err(NvramError::NoAcknowledge));
    }

    #[test]
    fn test_select_byte_carries_block() {
        let r = TwoWireReader::new(0x140, 1);
        assert_eq!(r.select_byte(false), 0xa2);
        assert_eq!(r.select_byte(true), 0xa3);
        let r = TwoWireReader::new(0x7ff, 1);
        assert_eq!(r.select_byte(false), 0xae);
    }
}
