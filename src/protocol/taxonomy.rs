//! Controller error codes.
//!
//! The controller reports failures as `E<code>`. This is the single table
//! mapping those numeric codes to named kinds; codes missing from it map to
//! [`ErrorKind::Unknown`] carrying the raw value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named error reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoStage,
    NotIdle,
    NoDrive,
    StringParse,
    CommandNotFound,
    InvalidShutter,
    NoFocus,
    ValueOutOfRange,
    InvalidWheel,
    Arg1OutOfRange,
    Arg2OutOfRange,
    Arg3OutOfRange,
    Arg4OutOfRange,
    Arg5OutOfRange,
    Arg6OutOfRange,
    IncorrectState,
    WheelNotFitted,
    QueueFull,
    CompatibilityModeSet,
    ShutterNotFitted,
    InvalidChecksum,
    EncoderError,
    EncoderRunOff,
    /// A code the table does not know.
    Unknown(u32),
}

/// Every documented code, in table order.
pub const DOCUMENTED: [(u32, ErrorKind); 23] = [
    (1, ErrorKind::NoStage),
    (2, ErrorKind::NotIdle),
    (3, ErrorKind::NoDrive),
    (4, ErrorKind::StringParse),
    (5, ErrorKind::CommandNotFound),
    (6, ErrorKind::InvalidShutter),
    (7, ErrorKind::NoFocus),
    (8, ErrorKind::ValueOutOfRange),
    (9, ErrorKind::InvalidWheel),
    (10, ErrorKind::Arg1OutOfRange),
    (11, ErrorKind::Arg2OutOfRange),
    (12, ErrorKind::Arg3OutOfRange),
    (13, ErrorKind::Arg4OutOfRange),
    (14, ErrorKind::Arg5OutOfRange),
    (15, ErrorKind::Arg6OutOfRange),
    (16, ErrorKind::IncorrectState),
    (17, ErrorKind::WheelNotFitted),
    (18, ErrorKind::QueueFull),
    (19, ErrorKind::CompatibilityModeSet),
    (20, ErrorKind::ShutterNotFitted),
    (21, ErrorKind::InvalidChecksum),
    (60, ErrorKind::EncoderError),
    (61, ErrorKind::EncoderRunOff),
];

impl ErrorKind {
    /// Map a numeric controller code to its kind.
    pub fn from_code(code: u32) -> Self {
        DOCUMENTED
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown(code))
    }

    /// Numeric code as sent by the controller.
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::Unknown(code) => *code,
            known => DOCUMENTED
                .iter()
                .find(|(_, kind)| kind == known)
                .map(|(c, _)| *c)
                .unwrap_or(0),
        }
    }

    /// Upper-case name used in logs and operator messages.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::NoStage => "NO STAGE",
            ErrorKind::NotIdle => "NOT IDLE",
            ErrorKind::NoDrive => "NO DRIVE",
            ErrorKind::StringParse => "STRING PARSE",
            ErrorKind::CommandNotFound => "COMMAND NOT FOUND",
            ErrorKind::InvalidShutter => "INVALID SHUTTER",
            ErrorKind::NoFocus => "NO FOCUS",
            ErrorKind::ValueOutOfRange => "VALUE OUT OF RANGE",
            ErrorKind::InvalidWheel => "INVALID WHEEL",
            ErrorKind::Arg1OutOfRange => "ARG1 OUT OF RANGE",
            ErrorKind::Arg2OutOfRange => "ARG2 OUT OF RANGE",
            ErrorKind::Arg3OutOfRange => "ARG3 OUT OF RANGE",
            ErrorKind::Arg4OutOfRange => "ARG4 OUT OF RANGE",
            ErrorKind::Arg5OutOfRange => "ARG5 OUT OF RANGE",
            ErrorKind::Arg6OutOfRange => "ARG6 OUT OF RANGE",
            ErrorKind::IncorrectState => "INCORRECT STATE",
            ErrorKind::WheelNotFitted => "WHEEL NOT FITTED",
            ErrorKind::QueueFull => "QUEUE FULL",
            ErrorKind::CompatibilityModeSet => "COMPATIBILITY MODE SET",
            ErrorKind::ShutterNotFitted => "SHUTTER NOT FITTED",
            ErrorKind::InvalidChecksum => "INVALID CHECKSUM",
            ErrorKind::EncoderError => "ENCODER ERROR",
            ErrorKind::EncoderRunOff => "ENCODER RUN OFF",
            ErrorKind::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
