//! Three-wire (93C46) EEPROM reader
//!
//! Each word is a separate READ command: select, start bit, opcode and
//! address, the dummy zero from the part, then sixteen data bits MSB first.

use super::{NvramError, NvramResult};
use alloc::vec::Vec;
use sym_hal::{Level, Line, NvramLines};

/// Start bit and READ opcode in front of the six address bits
const READ_COMMAND: u16 = 0x180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Park all lines low
    Init(u8),
    /// Raise chip select for the next word
    Select,
    /// Set data, clock high, clock low; nine command bits
    SendBit { bit: u8, step: u8 },
    /// Sample the dummy zero
    Dummy,
    /// Clock high, clock low, sample; sixteen times
    RecvBit { bit: u8, acc: u16, step: u8 },
    /// Drop select, then one clock pulse
    Deselect(u8),
    Done,
}

/// State machine reading whole words from a 93C46
#[derive(Debug)]
pub struct ThreeWireReader {
    count: usize,
    words: Vec<u16>,
    state: State,
    error: Option<NvramError>,
}

impl ThreeWireReader {
    /// Prepare to read `count` words from word 0
    pub fn new(count: usize) -> Self {
        Self { count, words: Vec::with_capacity(count), state: State::Init(0), error: None }
    }

    fn command(&self) -> u16 {
        READ_COMMAND | (self.words.len() as u16 & 0x3f)
    }

    /// Perform one line operation; true once finished
    pub fn step(&mut self, lines: &mut dyn NvramLines) -> bool {
        let state = self.state;
        self.state = match state {
            State::Init(step) => {
                match step {
                    0 => lines.set_line(Line::Select, Level::Low),
                    1 => lines.set_line(Line::Clock, Level::Low),
                    _ => lines.set_line(Line::Data, Level::Low),
                }
                match step {
                    0 | 1 => State::Init(step + 1),
                    _ if self.count == 0 => State::Done,
                    _ => State::Select,
                }
            }
            State::Select => {
                lines.set_line(Line::Select, Level::High);
                State::SendBit { bit: 0, step: 0 }
            }
            State::SendBit { bit, step } => match step {
                0 => {
                    let set = self.command() & (0x100 >> bit) != 0;
                    lines.set_line(Line::Data, Level::from_bit(set));
                    State::SendBit { bit, step: 1 }
                }
                1 => {
                    lines.set_line(Line::Clock, Level::High);
                    State::SendBit { bit, step: 2 }
                }
                _ => {
                    lines.set_line(Line::Clock, Level::Low);
                    if bit < 8 {
                        State::SendBit { bit: bit + 1, step: 0 }
                    } else {
                        State::Dummy
                    }
                }
            },
            State::Dummy => {
                if lines.read_line(Line::DataOut).is_high() {
                    self.error = Some(NvramError::NoDevice);
                    State::Deselect(0)
                } else {
                    State::RecvBit { bit: 0, acc: 0, step: 0 }
                }
            }
            State::RecvBit { bit, acc, step } => match step {
                0 => {
                    lines.set_line(Line::Clock, Level::High);
                    State::RecvBit { bit, acc, step: 1 }
                }
                1 => {
                    lines.set_line(Line::Clock, Level::Low);
                    State::RecvBit { bit, acc, step: 2 }
                }
                _ => {
                    let acc = (acc << 1) | u16::from(lines.read_line(Line::DataOut).is_high());
                    if bit < 15 {
                        State::RecvBit { bit: bit + 1, acc, step: 0 }
                    } else {
                        self.words.push(acc);
                        State::Deselect(0)
                    }
                }
            },
            State::Deselect(step) => {
                match step {
                    0 => lines.set_line(Line::Select, Level::Low),
                    1 => lines.set_line(Line::Clock, Level::High),
                    _ => lines.set_line(Line::Clock, Level::Low),
                }
                match step {
                    0 | 1 => State::Deselect(step + 1),
                    _ if self.error.is_some() || self.words.len() == self.count => State::Done,
                    _ => State::Select,
                }
            }
            State::Done => State::Done,
        };
        self.state == State::Done
    }

    /// Result once [`step`](Self::step) reported completion
    pub fn finish(self) -> NvramResult<Vec<u16>> {
        match self.error {
            Some(err) => Err(err),
            None if self.words.len() == self.count => Ok(self.words),
            None => Err(NvramError::Incomplete),
        }
    }
}

/// Read `count` words from a 93C46
pub fn read_words(lines: &mut dyn NvramLines, count: usize) -> NvramResult<Vec<u16>> {
    let mut reader = ThreeWireReader::new(count);
    let budget = 8 + count * 80;
    for _ in 0..budget {
        if reader.step(lines) {
            return reader.finish();
        }
    }
    Err(NvramError::Incomplete)
}

/// Read `count` words and lay them out as little-endian bytes
pub fn read_bytes(lines: &mut dyn NvramLines, count: usize) -> NvramResult<Vec<u8>> {
    Ok(read_words(lines, count)?.iter().flat_map(|w| w.to_le_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sym_hal::stubs::ThreeWireEeprom;

    #[test]
    fn test_reads_words_in_order() {
        let mut rom = ThreeWireEeprom::new();
        let bytes: Vec<u8> = (0..16u8).collect();
        rom.program_bytes(&bytes);
        let words = read_words(&mut rom, 8).unwrap();
        assert_eq!(words[0], 0x0100);
        assert_eq!(words[7], 0x0f0e);
        assert_eq!(read_bytes(&mut rom, 8).unwrap(), bytes);
    }

    #[test]
    fn test_missing_dummy_zero() {
        let mut rom = ThreeWireEeprom::new();
        rom.absent = true;
        assert_eq!(read_words(&mut rom, 4), Err(NvramError::NoDevice));
    }

    #[test]
    fn test_command_encoding() {
        let mut r = ThreeWireReader::new(64);
        assert_eq!(r.command(), 0x180);
        r.words.extend([0u16; 63]);
        assert_eq!(r.command(), 0x1bf);
    }
}
