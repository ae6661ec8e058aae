//! Frame codec and record definitions for the FIAS PMS link.
//!
//! This crate defines the ASCII framing used between a hotel property
//! management system and an interface partner, plus the record ids and field
//! ids the bridge understands.
//!
//! # Frame Format
//!
//! ```text
//! STX <RECORD ID:2> '|' (<FIELD ID:2><value> '|')* ETX <LRC:1>
//! ```
//!
//! # Example
//!
//! ```rust
//! use fias_protocol::{decode_frame, encode_record, field, LrcCheck, OutboundRecord, RecordId};
//!
//! let record = OutboundRecord::new(RecordId::GuestCheckOut)
//!     .field(field::ROOM, "101")
//!     .field(field::RESERVATION, "R1");
//! let encoded = encode_record(&record).unwrap();
//!
//! let decoded = decode_frame(&encoded).unwrap();
//! assert_eq!(decoded.lrc, LrcCheck::Valid);
//! assert_eq!(decoded.message.record_id(), &RecordId::GuestCheckOut);
//! assert_eq!(decoded.message.field(field::RESERVATION), Some("R1"));
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_frame, encode_message, encode_record, extract_frame, lrc, parse_payload, render_raw,
    take_trailing_frame, validate_lrc, DecodedFrame, LrcCheck,
};
pub use error::{AnswerStatus, ProtocolError};
pub use types::{
    date_time_fields, field, Message, OutboundRecord, RecordId, ACK, DATE_FORMAT, ETX,
    FIELD_SEPARATOR, MAX_FRAME_SIZE, NAK, STX, SUPPORTED_RECORDS, TIME_FORMAT,
};
