//! Error types for the FIAS link protocol.

use thiserror::Error;

/// Protocol-level errors raised while framing, decoding or encoding records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame payload is shorter than a record id.
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// No end marker was found in the frame.
    #[error("Unterminated frame: no ETX found")]
    Unterminated,

    /// Buffered data grew past the frame limit without an end marker.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    /// Payload contains bytes outside 7-bit ASCII.
    #[error("Frame contains non-ASCII data")]
    NonAscii,

    /// Record id is not a two-character alphanumeric code.
    #[error("Invalid record id: {0:?}")]
    InvalidRecordId(String),

    /// Field id is not a two-character printable code.
    #[error("Invalid field id: {0:?}")]
    InvalidFieldId(String),

    /// Field value cannot be placed on the wire.
    #[error("Invalid value for field {field}: {reason}")]
    InvalidFieldValue { field: String, reason: &'static str },
}

/// Answer status carried in the `AS` field of posting answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnswerStatus {
    /// Posting accepted.
    Ok,
    /// Posting or inquiry declined.
    Declined,
    /// Room unknown to the system.
    UnknownRoom,
    /// Posting not allowed for this guest.
    NoPost,
}

impl AnswerStatus {
    /// Wire code for this status.
    pub fn code(self) -> &'static str {
        match self {
            AnswerStatus::Ok => "OK",
            AnswerStatus::Declined => "NG",
            AnswerStatus::UnknownRoom => "UR",
            AnswerStatus::NoPost => "NP",
        }
    }

    /// Parse a wire code. Unknown codes map to [`AnswerStatus::Declined`].
    pub fn from_code(code: &str) -> Self {
        match code {
            "OK" => AnswerStatus::Ok,
            "UR" => AnswerStatus::UnknownRoom,
            "NP" => AnswerStatus::NoPost,
            _ => AnswerStatus::Declined,
        }
    }

    /// Returns true if this status means the request was accepted.
    pub fn is_ok(self) -> bool {
        self == AnswerStatus::Ok
    }
}
