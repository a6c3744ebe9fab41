//! Message Encoding and Decoding
//!
//! ## Frame format
//!
//! ```text
//! ┌────┬────────┬─────────────┬──────────────┬─────────────┬─────┬───────┬──────┐
//! │ op │ status │ expires u64 │ modified u64 │ key_len u16 │ key │ value │ +END │
//! │ 1  │   1    │   8 (BE)    │    8 (BE)    │   2 (BE)    │     │       │  4   │
//! └────┴────────┴─────────────┴──────────────┴─────────────┴─────┴───────┴──────┘
//!  └──────────────────── header: 20 bytes ──────────────────┘
//! ```
//!
//! The value runs from the end of the key to the marker. Because frames are
//! delimited by scanning for the marker, it must never appear inside a frame
//! body; [`encode`] refuses such messages.

use crate::protocol::types::{Message, Op, Status};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Marker terminating every frame.
pub const SPLIT_MARKER: &[u8] = b"+END";

/// Smallest possible frame: an empty header-only body plus the marker.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + SPLIT_MARKER.len();

/// Errors that can occur while decoding a frame body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Body shorter than the fixed header
    #[error("frame body too short: {len} bytes, the header needs 20")]
    TooShort { len: usize },

    #[error("unknown op code: {0:#04x}")]
    UnknownOp(u8),

    #[error("unknown status byte: {0:#04x}")]
    UnknownStatus(u8),

    /// Declared key length runs past the end of the body
    #[error("key length {key_len} exceeds remaining {available} bytes")]
    KeyOverrun { key_len: usize, available: usize },

    #[error("key is not valid UTF-8")]
    InvalidKey,
}

/// Errors that can occur while encoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("key is {0} bytes, the limit is 65535")]
    KeyTooLong(usize),

    /// The frame marker occurs inside the body
    #[error("message body contains the frame marker")]
    MarkerInBody,
}

/// Encodes `msg` into a complete frame, marker included.
pub fn encode(msg: &Message) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Length of the frame [`encode`] would produce.
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_LEN + msg.key.len() + msg.value.len() + SPLIT_MARKER.len()
}

/// Appends the frame for `msg` to `buf`.
///
/// On error `buf` is left as it was.
pub fn encode_into(msg: &Message, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let key_len = u16::try_from(msg.key.len()).map_err(|_| EncodeError::KeyTooLong(msg.key.len()))?;

    let start = buf.len();
    buf.reserve(encoded_len(msg));
    buf.put_u8(msg.op.as_byte());
    buf.put_u8(msg.status.as_byte());
    buf.put_u64(msg.expires);
    buf.put_u64(msg.modified);
    buf.put_u16(key_len);
    buf.put_slice(msg.key.as_bytes());
    buf.put_slice(&msg.value);

    if find_marker(&buf[start..]).is_some() {
        buf.truncate(start);
        return Err(EncodeError::MarkerInBody);
    }

    buf.put_slice(SPLIT_MARKER);
    Ok(())
}

/// Decodes a frame body (marker already stripped).
///
/// The value shares memory with `body`.
pub fn decode(body: Bytes) -> Result<Message, DecodeError> {
    if body.len() < HEADER_LEN {
        return Err(DecodeError::TooShort { len: body.len() });
    }

    let op = Op::from_byte(body[0]).ok_or(DecodeError::UnknownOp(body[0]))?;
    let status = Status::from_byte(body[1]).ok_or(DecodeError::UnknownStatus(body[1]))?;
    let expires = read_u64(&body[2..10]);
    let modified = read_u64(&body[10..18]);
    let key_len = u16::from_be_bytes([body[18], body[19]]) as usize;

    let available = body.len() - HEADER_LEN;
    if key_len > available {
        return Err(DecodeError::KeyOverrun { key_len, available });
    }

    let key_end = HEADER_LEN + key_len;
    let key = std::str::from_utf8(&body[HEADER_LEN..key_end])
        .map_err(|_| DecodeError::InvalidKey)?
        .to_string();

    Ok(Message {
        op,
        status,
        expires,
        modified,
        key,
        value: body.slice(key_end..),
    })
}

#[inline]
fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

/// Position of the first frame marker in `buf`.
pub fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(SPLIT_MARKER.len()).position(|w| w == SPLIT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(frame: &Bytes) -> Bytes {
        frame.slice(..frame.len() - SPLIT_MARKER.len())
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::set("ab", "xyz", 7, false).with_modified(9);
        let frame = encode(&msg).unwrap();

        assert_eq!(frame.len(), HEADER_LEN + 2 + 3 + 4);
        assert_eq!(frame[0], 0x30);
        assert_eq!(frame[1], 0x00);
        assert_eq!(&frame[2..10], &7u64.to_be_bytes());
        assert_eq!(&frame[10..18], &9u64.to_be_bytes());
        assert_eq!(&frame[18..20], &[0, 2]);
        assert_eq!(&frame[20..22], b"ab");
        assert_eq!(&frame[22..25], b"xyz");
        assert!(frame.ends_with(SPLIT_MARKER));
    }

    #[test]
    fn test_decode_inverts_encode() {
        let messages = [
            Message::get("name"),
            Message::set("users/1", "Ariz", 1_700_000_000, true).with_modified(1_600_000_000),
            Message::new(Op::Ping),
            Message::status(Status::StreamEnd),
            Message::new(Op::Sync).with_value(vec![0u8, 1, 2, 0xff]),
        ];
        for msg in messages {
            let frame = encode(&msg).unwrap();
            assert_eq!(decode(body_of(&frame)).unwrap(), msg);
        }
    }

    #[test]
    fn test_empty_key_and_value() {
        let msg = Message::new(Op::Set);
        let frame = encode(&msg).unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(decode(body_of(&frame)).unwrap(), msg);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode(Bytes::from_static(&[0x20; 19])),
            Err(DecodeError::TooShort { len: 19 })
        );
    }

    #[test]
    fn test_decode_unknown_op_and_status() {
        let mut body = vec![0u8; HEADER_LEN];
        body[0] = 0x99;
        assert_eq!(decode(Bytes::from(body.clone())), Err(DecodeError::UnknownOp(0x99)));

        body[0] = Op::Get.as_byte();
        body[1] = b'?';
        assert_eq!(decode(Bytes::from(body)), Err(DecodeError::UnknownStatus(b'?')));
    }

    #[test]
    fn test_decode_key_overrun() {
        let mut body = vec![0u8; HEADER_LEN];
        body[0] = Op::Get.as_byte();
        body[19] = 5;
        body.extend_from_slice(b"abc");
        assert_eq!(
            decode(Bytes::from(body)),
            Err(DecodeError::KeyOverrun { key_len: 5, available: 3 })
        );
    }

    #[test]
    fn test_decode_invalid_utf8_key() {
        let mut body = vec![0u8; HEADER_LEN];
        body[0] = Op::Get.as_byte();
        body[19] = 2;
        body.extend_from_slice(&[0xc3, 0x28]);
        assert_eq!(decode(Bytes::from(body)), Err(DecodeError::InvalidKey));
    }

    #[test]
    fn test_encode_rejects_marker_in_body() {
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let msg = Message::set("k", "a+ENDb", 0, false);
        assert_eq!(encode_into(&msg, &mut buf), Err(EncodeError::MarkerInBody));
        assert_eq!(&buf[..], b"prefix");

        assert_eq!(encode(&Message::get("+END")), Err(EncodeError::MarkerInBody));
    }

    #[test]
    fn test_partial_marker_at_body_end_is_fine() {
        let msg = Message::set("k", "value+EN", 0, false);
        let frame = encode(&msg).unwrap();
        assert_eq!(find_marker(&frame), Some(frame.len() - SPLIT_MARKER.len()));
        assert_eq!(decode(body_of(&frame)).unwrap(), msg);
    }

    #[test]
    fn test_encode_rejects_long_key() {
        let msg = Message::get("k".repeat(70_000));
        assert_eq!(encode(&msg), Err(EncodeError::KeyTooLong(70_000)));
    }
}
