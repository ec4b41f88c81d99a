//! Controller status decoding
//!
//! The `X0U4` reply carries four hexadecimal status digits. Each digit is a
//! column of four flags, most significant bit first:
//!
//! ```text
//! column 1: comError  encError     voltageError  cmdError
//! column 2: reset     xLimit       script        index
//! column 3: servoMode targetLimit  targetMode    targetReached
//! column 4: parked    overheat     reverse       running
//! ```

use crate::{PmdError, Result};
use serde::{Serialize, Serializer};
use std::fmt;

/// Number of hex digits (columns) in a status payload
pub const STATUS_COLUMNS: usize = 4;
/// Flags per column, one per nibble bit
pub const FLAGS_PER_COLUMN: usize = 4;

/// A single controller status bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlag {
    ComError,
    EncError,
    VoltageError,
    CmdError,
    Reset,
    XLimit,
    Script,
    Index,
    ServoMode,
    TargetLimit,
    TargetMode,
    TargetReached,
    Parked,
    Overheat,
    Reverse,
    Running,
}

/// (column, bit) -> flag, bit 0 being the most significant bit of the digit
pub const STATUS_TABLE: [[StatusFlag; FLAGS_PER_COLUMN]; STATUS_COLUMNS] = [
    [StatusFlag::ComError, StatusFlag::EncError, StatusFlag::VoltageError, StatusFlag::CmdError],
    [StatusFlag::Reset, StatusFlag::XLimit, StatusFlag::Script, StatusFlag::Index],
    [StatusFlag::ServoMode, StatusFlag::TargetLimit, StatusFlag::TargetMode, StatusFlag::TargetReached],
    [StatusFlag::Parked, StatusFlag::Overheat, StatusFlag::Reverse, StatusFlag::Running],
];

// Every flag appears exactly once, at the slot matching its discriminant.
const _: () = {
    let mut i = 0;
    while i < STATUS_COLUMNS * FLAGS_PER_COLUMN {
        assert!(STATUS_TABLE[i / FLAGS_PER_COLUMN][i % FLAGS_PER_COLUMN] as usize == i);
        i += 1;
    }
};

/// Flags that put the device into alarm
pub const ERROR_FLAGS: [StatusFlag; 4] = STATUS_TABLE[0];

impl StatusFlag {
    pub fn name(self) -> &'static str {
        match self {
            StatusFlag::ComError => "comError",
            StatusFlag::EncError => "encError",
            StatusFlag::VoltageError => "voltageError",
            StatusFlag::CmdError => "cmdError",
            StatusFlag::Reset => "reset",
            StatusFlag::XLimit => "xLimit",
            StatusFlag::Script => "script",
            StatusFlag::Index => "index",
            StatusFlag::ServoMode => "servoMode",
            StatusFlag::TargetLimit => "targetLimit",
            StatusFlag::TargetMode => "targetMode",
            StatusFlag::TargetReached => "targetReached",
            StatusFlag::Parked => "parked",
            StatusFlag::Overheat => "overheat",
            StatusFlag::Reverse => "reverse",
            StatusFlag::Running => "running",
        }
    }

    fn mask(self) -> u16 {
        1 << (self as u16)
    }

    pub fn is_error(self) -> bool {
        ERROR_FLAGS.contains(&self)
    }
}

impl fmt::Display for StatusFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of flags decoded from one status payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DecodedStatus {
    bits: u16,
}

impl DecodedStatus {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_flags(flags: &[StatusFlag]) -> Self {
        let mut status = Self::empty();
        for flag in flags {
            status.insert(*flag);
        }
        status
    }

    pub fn insert(&mut self, flag: StatusFlag) {
        self.bits |= flag.mask();
    }

    pub fn contains(&self, flag: StatusFlag) -> bool {
        self.bits & flag.mask() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn has_error(&self) -> bool {
        ERROR_FLAGS.iter().any(|flag| self.contains(*flag))
    }

    /// Flags in table order
    pub fn iter(&self) -> impl Iterator<Item = StatusFlag> + '_ {
        STATUS_TABLE
            .iter()
            .flatten()
            .copied()
            .filter(move |flag| self.contains(*flag))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(StatusFlag::name).collect()
    }
}

impl fmt::Display for DecodedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(", "))
    }
}

impl Serialize for DecodedStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(StatusFlag::name))
    }
}

/// Decode a raw status payload into its flags.
///
/// Only the first comma-separated field is significant; it must be exactly
/// four hex digits. Nothing is mutated on failure.
pub fn decode(payload: &str) -> Result<DecodedStatus> {
    let field = payload.split(',').next().unwrap_or_default().trim();

    if field.len() != STATUS_COLUMNS {
        return Err(PmdError::Decode(format!(
            "status payload '{}' must be {} hex digits",
            field, STATUS_COLUMNS
        )));
    }

    let mut status = DecodedStatus::empty();
    for (column, ch) in field.chars().enumerate() {
        let nibble = ch
            .to_digit(16)
            .ok_or_else(|| PmdError::Decode(format!("invalid hex digit '{}' in status '{}'", ch, field)))?;

        for (bit, flag) in STATUS_TABLE[column].iter().enumerate() {
            if nibble & (0b1000 >> bit) != 0 {
                status.insert(*flag);
            }
        }
    }

    Ok(status)
}
