//! Record and message definitions for the FIAS link protocol.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Start of text, opens every frame.
pub const STX: u8 = 0x02;

/// End of text, closes the payload. The LRC byte follows it.
pub const ETX: u8 = 0x03;

/// Transport-level positive acknowledgement.
pub const ACK: u8 = 0x06;

/// Transport-level negative acknowledgement.
pub const NAK: u8 = 0x15;

/// Separator between record id and fields.
pub const FIELD_SEPARATOR: u8 = b'|';

/// Maximum number of buffered bytes without an end marker (8 KB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024;

/// `DA` field format.
pub const DATE_FORMAT: &str = "%y%m%d";

/// `TI` field format.
pub const TIME_FORMAT: &str = "%H%M%S";

/// Two-character field identifiers used by the supported records.
pub mod field {
    pub const DATE: &str = "DA";
    pub const TIME: &str = "TI";
    pub const ROOM: &str = "RN";
    pub const RESERVATION: &str = "G#";
    pub const GUEST_NAME: &str = "GN";
    pub const LANGUAGE: &str = "GL";
    pub const ARRIVAL: &str = "GA";
    pub const DEPARTURE: &str = "GD";
    pub const GUEST_SHARE: &str = "GS";
    pub const AMOUNT: &str = "TA";
    pub const INQUIRY: &str = "PI";
    pub const ANSWER_STATUS: &str = "AS";
    pub const CLEAR_TEXT: &str = "CT";
    pub const VERSION: &str = "V#";
    pub const INTERFACE_FAMILY: &str = "IF";
    pub const REQUEST_TYPE: &str = "RT";
    pub const RECORD_ID: &str = "RI";
    pub const FIELD_LIST: &str = "FL";
}

/// Record types declared to the PMS during the link handshake, with the
/// concatenated field ids each one carries.
pub const SUPPORTED_RECORDS: &[(&str, &str)] = &[
    ("GI", "RNG#GNGLGAGDGSGV"),
    ("GO", "RNG#GS"),
    ("GC", "RNG#GNGLGAGDGSROGV"),
    ("PS", "RNTATIDATISOPM"),
    ("PR", "RNG#PMPITADATIWS"),
    ("PL", "RNG#GNGLDATIWS"),
    ("PA", "RNASCTDATIWS"),
];

/// Record identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordId {
    // Link control
    /// Link start (LS).
    LinkStart,
    /// Link alive (LA).
    LinkAlive,
    /// Link end (LE).
    LinkEnd,
    /// Link description (LD).
    LinkDescription,
    /// Link record declaration (LR).
    LinkRecord,

    // Database synchronisation
    /// Database resync request (DR).
    DatabaseResync,
    /// Database start (DS).
    DatabaseStart,
    /// Database end (DE).
    DatabaseEnd,

    // Guest records
    /// Guest check-in (GI).
    GuestCheckIn,
    /// Guest check-out (GO).
    GuestCheckOut,
    /// Guest data change (GC).
    GuestChange,

    // Postings
    /// Posting simple (PS).
    PostingSimple,
    /// Posting request or inquiry (PR).
    PostingRequest,
    /// Posting answer (PA).
    PostingAnswer,
    /// Posting list (PL).
    PostingList,

    /// Any other well-formed record id.
    Other(String),
}

impl RecordId {
    /// Parse a two-character record id.
    pub fn parse(code: &str) -> Result<Self, ProtocolError> {
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::InvalidRecordId(code.to_string()));
        }
        Ok(match code {
            "LS" => RecordId::LinkStart,
            "LA" => RecordId::LinkAlive,
            "LE" => RecordId::LinkEnd,
            "LD" => RecordId::LinkDescription,
            "LR" => RecordId::LinkRecord,
            "DR" => RecordId::DatabaseResync,
            "DS" => RecordId::DatabaseStart,
            "DE" => RecordId::DatabaseEnd,
            "GI" => RecordId::GuestCheckIn,
            "GO" => RecordId::GuestCheckOut,
            "GC" => RecordId::GuestChange,
            "PS" => RecordId::PostingSimple,
            "PR" => RecordId::PostingRequest,
            "PA" => RecordId::PostingAnswer,
            "PL" => RecordId::PostingList,
            other => RecordId::Other(other.to_string()),
        })
    }

    /// Wire code of this record id.
    pub fn code(&self) -> &str {
        match self {
            RecordId::LinkStart => "LS",
            RecordId::LinkAlive => "LA",
            RecordId::LinkEnd => "LE",
            RecordId::LinkDescription => "LD",
            RecordId::LinkRecord => "LR",
            RecordId::DatabaseResync => "DR",
            RecordId::DatabaseStart => "DS",
            RecordId::DatabaseEnd => "DE",
            RecordId::GuestCheckIn => "GI",
            RecordId::GuestCheckOut => "GO",
            RecordId::GuestChange => "GC",
            RecordId::PostingSimple => "PS",
            RecordId::PostingRequest => "PR",
            RecordId::PostingAnswer => "PA",
            RecordId::PostingList => "PL",
            RecordId::Other(code) => code,
        }
    }
}

impl FromStr for RecordId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordId::parse(s)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A decoded inbound record.
///
/// Built once per frame and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    record_id: RecordId,
    received_at: DateTime<Local>,
    fields: HashMap<String, String>,
}

impl Message {
    /// Create a message stamped with the current local time.
    pub fn new(record_id: RecordId, fields: HashMap<String, String>) -> Self {
        Self {
            record_id,
            received_at: Local::now(),
            fields,
        }
    }

    /// Record id of this message.
    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    /// Time the frame was decoded.
    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }

    /// Value of a field, if present.
    pub fn field(&self, id: &str) -> Option<&str> {
        self.fields.get(id).map(String::as_str)
    }

    /// Value of a field, or an empty string.
    pub fn field_or_empty(&self, id: &str) -> &str {
        self.field(id).unwrap_or("")
    }

    /// Value of a field if present and non-empty.
    pub fn non_empty_field(&self, id: &str) -> Option<&str> {
        self.field(id).filter(|v| !v.is_empty())
    }

    /// Returns true if the field was present in the frame.
    pub fn has_field(&self, id: &str) -> bool {
        self.fields.contains_key(id)
    }

    /// All fields of the message.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}

/// An outbound record with its fields in wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub record_id: RecordId,
    pub fields: Vec<(String, String)>,
}

impl OutboundRecord {
    /// Create a record without fields.
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            fields: Vec::new(),
        }
    }

    /// Create a record that starts with `DA`/`TI` stamps for the current time.
    pub fn stamped(record_id: RecordId) -> Self {
        Self::new(record_id).with_timestamp(Local::now())
    }

    /// Append a field.
    pub fn field(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((id.into(), value.into()));
        self
    }

    /// Append `DA` and `TI` fields for `at`.
    pub fn with_timestamp(self, at: DateTime<Local>) -> Self {
        let (date, time) = date_time_fields(at);
        self.field(field::DATE, date).field(field::TIME, time)
    }

    /// Value of the first field with this id.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, v)| v.as_str())
    }
}

/// Format a timestamp as `DA` (`yyMMdd`) and `TI` (`HHmmss`) values.
pub fn date_time_fields(at: DateTime<Local>) -> (String, String) {
    (
        at.format(DATE_FORMAT).to_string(),
        at.format(TIME_FORMAT).to_string(),
    )
}
