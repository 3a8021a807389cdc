//! # NVRAM Line Boundary
//!
//! Serial EEPROMs hang off the adapter's general purpose I/O pins. The
//! platform exposes those pins as individually addressable lines; the
//! protocol decoders in the driver drive them one transition at a time.

/// Logic level of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Driven or pulled low
    Low,
    /// Driven high, or released on open-drain lines
    High,
}

impl Level {
    /// Level for a bit value
    #[inline]
    pub const fn from_bit(bit: bool) -> Self {
        if bit { Level::High } else { Level::Low }
    }

    /// Bit value of this level
    #[inline]
    pub const fn is_high(self) -> bool {
        matches!(self, Level::High)
    }
}

/// A GPIO line wired to the EEPROM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    /// Serial data. Bidirectional open-drain on two-wire parts; the
    /// host-to-device input on three-wire parts
    Data,
    /// Serial clock
    Clock,
    /// Chip select (three-wire parts only)
    Select,
    /// Device-to-host output (three-wire parts only)
    DataOut,
}

/// Raw access to the EEPROM lines
///
/// `set_line(Line::Data, Level::High)` releases the data line on two-wire
/// parts so the device can drive it.
pub trait NvramLines {
    /// Drive a line to the given level
    fn set_line(&mut self, line: Line, level: Level);

    /// Sample the current level of a line
    fn read_line(&mut self, line: Line) -> Level;
}
