//! Codec for encoding and decoding FIAS frames.
//!
//! Frame format:
//! ```text
//! +-----+-----------+-----+------------------------+-----+-----+
//! | STX | Record id | '|' | (Field id, value, '|')* | ETX | LRC |
//! +-----+-----------+-----+------------------------+-----+-----+
//! |  1  |     2     |  1  |       variable         |  1  |  1  |
//! ```
//!
//! The LRC is the XOR of every payload byte between STX and ETX.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Result of checking the LRC byte of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrcCheck {
    /// Received LRC matches the payload.
    Valid,
    /// Received LRC differs from the recomputed value.
    Mismatch { expected: u8, received: u8 },
    /// Frame ended at ETX without an LRC byte.
    Missing,
}

impl LrcCheck {
    /// Returns true unless the LRC byte was present and wrong.
    pub fn is_acceptable(self) -> bool {
        !matches!(self, LrcCheck::Mismatch { .. })
    }
}

/// A decoded frame together with its checksum verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub message: Message,
    pub lrc: LrcCheck,
}

/// Compute the LRC of a payload.
pub fn lrc(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Check a received LRC against a payload.
pub fn validate_lrc(payload: &[u8], received: u8) -> bool {
    lrc(payload) == received
}

/// Encode an outbound record into a complete frame.
pub fn encode_record(record: &OutboundRecord) -> Result<Bytes, ProtocolError> {
    encode_message(&record.record_id, &record.fields)
}

/// Encode a record id and ordered fields into a complete frame.
pub fn encode_message<K, V>(record_id: &RecordId, fields: &[(K, V)]) -> Result<Bytes, ProtocolError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let code = record_id.code();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(ProtocolError::InvalidRecordId(code.to_string()));
    }

    let mut payload = BytesMut::with_capacity(64);
    payload.put_slice(code.as_bytes());
    payload.put_u8(FIELD_SEPARATOR);

    for (id, value) in fields {
        let id = id.as_ref();
        let value = value.as_ref();
        validate_field_id(id)?;
        validate_field_value(id, value)?;
        payload.put_slice(id.as_bytes());
        payload.put_slice(value.as_bytes());
        payload.put_u8(FIELD_SEPARATOR);
    }

    let checksum = lrc(&payload);
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.put_u8(STX);
    frame.put_slice(&payload);
    frame.put_u8(ETX);
    frame.put_u8(checksum);

    Ok(frame.freeze())
}

fn validate_field_id(id: &str) -> Result<(), ProtocolError> {
    if id.len() != 2 || !id.bytes().all(|b| b.is_ascii_graphic() && b != FIELD_SEPARATOR) {
        return Err(ProtocolError::InvalidFieldId(id.to_string()));
    }
    Ok(())
}

fn validate_field_value(id: &str, value: &str) -> Result<(), ProtocolError> {
    if !value.is_ascii() {
        return Err(ProtocolError::InvalidFieldValue {
            field: id.to_string(),
            reason: "non-ASCII character",
        });
    }
    if value.bytes().any(|b| b == FIELD_SEPARATOR) {
        return Err(ProtocolError::InvalidFieldValue {
            field: id.to_string(),
            reason: "contains field separator",
        });
    }
    if value.bytes().any(|b| b.is_ascii_control()) {
        return Err(ProtocolError::InvalidFieldValue {
            field: id.to_string(),
            reason: "contains control byte",
        });
    }
    Ok(())
}

fn is_padding(b: u8) -> bool {
    b != ETX && (b.is_ascii_control() || b.is_ascii_whitespace())
}

/// Decode a single frame.
///
/// Leading control and whitespace bytes (STX, stray ACKs, CR/LF) are skipped.
/// The payload runs up to the first ETX, and the byte after ETX is the LRC.
/// A checksum mismatch is reported in [`DecodedFrame::lrc`] rather than as an
/// error so the caller can decide how strict to be.
pub fn decode_frame(buf: &[u8]) -> Result<DecodedFrame, ProtocolError> {
    let start = buf.iter().position(|&b| !is_padding(b)).unwrap_or(buf.len());
    let body = &buf[start..];

    let etx = body
        .iter()
        .position(|&b| b == ETX)
        .ok_or(ProtocolError::Unterminated)?;
    let payload = &body[..etx];
    let lrc_check = match body.get(etx + 1) {
        Some(&received) => {
            let expected = lrc(payload);
            if expected == received {
                LrcCheck::Valid
            } else {
                LrcCheck::Mismatch { expected, received }
            }
        }
        None => LrcCheck::Missing,
    };

    let message = parse_payload(payload)?;
    Ok(DecodedFrame {
        message,
        lrc: lrc_check,
    })
}

/// Parse a payload (everything between STX and ETX) into a message.
pub fn parse_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    if !payload.is_ascii() {
        return Err(ProtocolError::NonAscii);
    }
    // ASCII was checked above, so this cannot fail.
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NonAscii)?;
    let text = text.trim_end_matches(|c: char| c.is_ascii_control() || c.is_ascii_whitespace());
    if text.len() < 2 {
        return Err(ProtocolError::FrameTooShort(text.len()));
    }

    let mut tokens = text.split(FIELD_SEPARATOR as char);
    let record_id = RecordId::parse(tokens.next().unwrap_or_default())?;

    let mut fields = HashMap::new();
    for token in tokens {
        // Single characters cannot hold a field id; legacy systems emit them as padding.
        if token.len() < 2 {
            continue;
        }
        let (id, value) = token.split_at(2);
        fields.insert(id.to_string(), value.to_string());
    }

    Ok(Message::new(record_id, fields))
}

/// Try to take one complete frame off the front of a streaming buffer.
///
/// Returns `Ok(None)` when more data is needed. A frame is complete once its
/// ETX and the LRC byte after it have arrived; any noise before the last STX
/// preceding that ETX is discarded.
pub fn extract_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    // Drop transport acknowledgements the peer sent for our own frames.
    while matches!(buf.first(), Some(&ACK) | Some(&NAK)) {
        buf.advance(1);
    }

    let Some(etx) = buf.iter().position(|&b| b == ETX) else {
        if buf.len() > MAX_FRAME_SIZE {
            let len = buf.len();
            buf.clear();
            return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }
        return Ok(None);
    };

    if buf.len() < etx + 2 {
        return Ok(None);
    }

    if let Some(stx) = buf[..etx].iter().rposition(|&b| b == STX) {
        buf.advance(stx);
        return Ok(Some(buf.split_to(etx - stx + 2).freeze()));
    }
    Ok(Some(buf.split_to(etx + 2).freeze()))
}

/// Take a frame whose LRC byte never arrived, for use once the peer has
/// closed the stream.
pub fn take_trailing_frame(buf: &mut BytesMut) -> Option<Bytes> {
    let etx = buf.iter().position(|&b| b == ETX)?;
    let frame = buf.split_to(etx + 1).freeze();
    buf.clear();
    Some(frame)
}

/// Render a frame for logs, with control bytes spelled out.
pub fn render_raw(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len() + 16);
    for (i, &b) in frame.iter().enumerate() {
        match b {
            STX => out.push_str("<STX>"),
            ETX => out.push_str("<ETX>"),
            ACK => out.push_str("<ACK>"),
            NAK => out.push_str("<NAK>"),
            // The byte after ETX is the LRC and may be printable by chance.
            _ if i > 0 && frame[i - 1] == ETX => out.push_str(&format!("<{:02X}>", b)),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("<{:02X}>", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_encode_layout() {
        let encoded = encode_message(&RecordId::LinkAlive, &fields(&[("DA", "240101"), ("TI", "120000")])).unwrap();
        let payload = b"LA|DA240101|TI120000|";

        assert_eq!(encoded[0], STX);
        assert_eq!(&encoded[1..encoded.len() - 2], payload);
        assert_eq!(encoded[encoded.len() - 2], ETX);
        assert_eq!(encoded[encoded.len() - 1], lrc(payload));
    }

    #[test]
    fn test_encode_decode_guest_check_in() {
        let sent = fields(&[
            ("RN", "101"),
            ("G#", "R1"),
            ("GN", "Smith John"),
            ("GL", "EN"),
            ("GA", ""),
        ]);
        let encoded = encode_message(&RecordId::GuestCheckIn, &sent).unwrap();
        let decoded = decode_frame(&encoded).unwrap();

        assert_eq!(decoded.lrc, LrcCheck::Valid);
        assert_eq!(decoded.message.record_id(), &RecordId::GuestCheckIn);
        assert_eq!(decoded.message.fields().len(), sent.len());
        for (k, v) in &sent {
            assert_eq!(decoded.message.field(k), Some(v.as_str()));
        }
        assert!(decoded.message.has_field("GA"));
        assert_eq!(decoded.message.non_empty_field("GA"), None);
    }

    #[test]
    fn test_encode_decode_unknown_record() {
        let id = RecordId::Other("XY".to_string());
        let encoded = encode_message(&id, &fields(&[("AB", "1")])).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.message.record_id(), &id);
        assert_eq!(decoded.message.field("AB"), Some("1"));
    }

    #[test]
    fn test_round_trip_table() {
        let ids = [
            RecordId::LinkStart,
            RecordId::LinkAlive,
            RecordId::LinkEnd,
            RecordId::LinkDescription,
            RecordId::LinkRecord,
            RecordId::DatabaseResync,
            RecordId::DatabaseStart,
            RecordId::DatabaseEnd,
            RecordId::GuestCheckIn,
            RecordId::GuestCheckOut,
            RecordId::GuestChange,
            RecordId::PostingSimple,
            RecordId::PostingRequest,
            RecordId::PostingAnswer,
            RecordId::PostingList,
            RecordId::Other("XY".to_string()),
            RecordId::Other("Z9".to_string()),
        ];
        let field_sets: &[&[(&str, &str)]] = &[
            &[],
            &[("GA", "")],
            &[("GA", ""), ("GD", ""), ("RN", "")],
            &[("GN", "  John Smith  "), ("RN", " 101")],
            &[("CT", "GUEST NOT FOUND "), ("TA", "-1050")],
            &[("WS", "#$%&'()*+,-./:;<=>?@[]^_`{}~")],
            &[("G#", "R1"), ("AB", "x"), ("1Z", "0")],
        ];

        for id in &ids {
            for set in field_sets {
                let sent = fields(set);
                let encoded = encode_message(id, &sent).unwrap();
                let decoded = decode_frame(&encoded).unwrap();

                assert_eq!(decoded.lrc, LrcCheck::Valid, "{} {:?}", id, set);
                assert_eq!(decoded.message.record_id(), id);
                assert_eq!(decoded.message.fields().len(), sent.len(), "{} {:?}", id, set);
                for (k, v) in &sent {
                    assert_eq!(decoded.message.field(k), Some(v.as_str()), "{} {}", id, k);
                }
            }
        }
    }

    #[test]
    fn test_lrc_is_xor_fold() {
        assert_eq!(lrc(b""), 0);
        assert_eq!(lrc(b"A"), b'A');
        assert_eq!(lrc(b"AB"), b'A' ^ b'B');
        let payload = b"LS|DA240101|";
        let mut expected = 0u8;
        for b in payload {
            expected ^= b;
        }
        assert_eq!(lrc(payload), expected);
        assert!(validate_lrc(payload, expected));
        assert!(!validate_lrc(payload, expected ^ 0x01));
    }

    #[test]
    fn test_checksum_mismatch_is_reported_not_fatal() {
        let mut frame = encode_message(&RecordId::LinkAlive, &fields(&[("DA", "240101")]))
            .unwrap()
            .to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let decoded = decode_frame(&frame).unwrap();
        assert!(matches!(decoded.lrc, LrcCheck::Mismatch { .. }));
        assert!(!decoded.lrc.is_acceptable());
        assert_eq!(decoded.message.record_id(), &RecordId::LinkAlive);
    }

    #[test]
    fn test_missing_lrc() {
        let decoded = decode_frame(b"\x02LE|\x03").unwrap();
        assert_eq!(decoded.lrc, LrcCheck::Missing);
        assert_eq!(decoded.message.record_id(), &RecordId::LinkEnd);
    }

    #[test]
    fn test_lrc_equal_to_etx() {
        // "LA|AO|" folds to 0x03, so the LRC byte looks like a second ETX.
        assert_eq!(lrc(b"LA|AO|"), ETX);
        let encoded = encode_message(&RecordId::LinkAlive, &fields(&[("AO", "")])).unwrap();
        assert_eq!(encoded[encoded.len() - 1], ETX);

        let mut buf = BytesMut::from(&encoded[..]);
        let frame = extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, encoded);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.lrc, LrcCheck::Valid);
        assert_eq!(decoded.message.field("AO"), Some(""));
    }

    #[test]
    fn test_leading_noise_is_trimmed() {
        let encoded = encode_message(&RecordId::LinkStart, &fields(&[])).unwrap();
        let mut noisy = b"\r\n\x06 ".to_vec();
        noisy.extend_from_slice(&encoded);
        let decoded = decode_frame(&noisy).unwrap();
        assert_eq!(decoded.message.record_id(), &RecordId::LinkStart);
        assert_eq!(decoded.lrc, LrcCheck::Valid);
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(decode_frame(b"\x02LS|"), Err(ProtocolError::Unterminated));
        assert_eq!(decode_frame(b"\x02L\x03\x00"), Err(ProtocolError::FrameTooShort(1)));
        assert_eq!(decode_frame(b"\x02\x03\x00"), Err(ProtocolError::FrameTooShort(0)));
        assert!(matches!(
            decode_frame(b"\x02G#|\x03\x00"),
            Err(ProtocolError::InvalidRecordId(_))
        ));
        assert_eq!(decode_frame(b"\x02LS|GN\xC3\xA9|\x03\x00"), Err(ProtocolError::NonAscii));
        assert_eq!(decode_frame(b""), Err(ProtocolError::Unterminated));
    }

    #[test]
    fn test_single_char_tokens_are_skipped() {
        let decoded = decode_frame(b"\x02GO|G#R1|X||\x03\x00").unwrap();
        assert_eq!(decoded.message.fields().len(), 1);
        assert_eq!(decoded.message.field("G#"), Some("R1"));
    }

    #[test]
    fn test_encode_rejects_bad_values() {
        assert!(matches!(
            encode_message(&RecordId::GuestChange, &fields(&[("GN", "a|b")])),
            Err(ProtocolError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            encode_message(&RecordId::GuestChange, &fields(&[("GN", "Müller")])),
            Err(ProtocolError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            encode_message(&RecordId::GuestChange, &fields(&[("GN", "a\x03b")])),
            Err(ProtocolError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            encode_message(&RecordId::GuestChange, &fields(&[("G", "x")])),
            Err(ProtocolError::InvalidFieldId(_))
        ));
        assert!(matches!(
            encode_message(&RecordId::Other("X".to_string()), &fields(&[])),
            Err(ProtocolError::InvalidRecordId(_))
        ));
    }

    #[test]
    fn test_extract_coalesced_frames() {
        let a = encode_message(&RecordId::LinkStart, &fields(&[("DA", "240101")])).unwrap();
        let b = encode_message(&RecordId::LinkAlive, &fields(&[])).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(ACK);
        buf.put_slice(&a);
        buf.put_slice(&b);
        buf.put_slice(&b[..3]);

        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), a);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), b);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], &b[..3]);

        buf.put_slice(&b[3..]);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), b);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_waits_for_lrc() {
        let frame = encode_message(&RecordId::LinkEnd, &fields(&[])).unwrap();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);

        let trailing = take_trailing_frame(&mut buf).unwrap();
        assert_eq!(decode_frame(&trailing).unwrap().lrc, LrcCheck::Missing);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_discards_noise_before_stx() {
        let frame = encode_message(&RecordId::LinkAlive, &fields(&[])).unwrap();
        let mut buf = BytesMut::from(&b"garbage"[..]);
        buf.put_slice(&frame);
        assert_eq!(extract_frame(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_extract_rejects_oversized_buffer() {
        let mut buf = BytesMut::from(&vec![b'A'; MAX_FRAME_SIZE + 1][..]);
        assert!(matches!(
            extract_frame(&mut buf),
            Err(ProtocolError::FrameTooLarge(_, MAX_FRAME_SIZE))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_render_raw() {
        let rendered = render_raw(b"\x02LA|\x03\x41");
        assert_eq!(rendered, "<STX>LA|<ETX><41>");
    }
}
