//! Incremental Frame Parser
//!
//! Frames arrive over a byte stream: a read may carry half a frame, or
//! several frames at once. The parser works on the connection's `BytesMut`
//! buffer and returns either:
//! - `Ok(Some(message))` - a complete frame was split off the buffer
//! - `Ok(None)` - no marker yet, read more data
//! - `Err(ParseError)` - the frame is invalid or too large
//!
//! The parser remembers how far it has already scanned, so a large frame
//! trickling in is not rescanned from the start on every read.

use crate::protocol::codec::{decode, find_marker, DecodeError, SPLIT_MARKER};
use crate::protocol::types::Message;
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Errors that can occur during frame parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A complete frame whose body could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No marker within the size limit
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Splits marker-delimited frames off a buffer and decodes them.
///
/// # Example
///
/// ```
/// use blockkv::protocol::{encode, FrameParser, Message};
/// use bytes::BytesMut;
///
/// let mut parser = FrameParser::new(1024);
/// let mut buffer = BytesMut::from(&encode(&Message::get("name")).unwrap()[..]);
///
/// let msg = parser.parse(&mut buffer).unwrap().unwrap();
/// assert_eq!(msg.key, "name");
/// assert!(buffer.is_empty());
/// ```
#[derive(Debug)]
pub struct FrameParser {
    /// Largest accepted frame, marker included
    max_frame: usize,
    /// Bytes at the front of the buffer known not to start a marker
    scanned: usize,
}

impl FrameParser {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            scanned: 0,
        }
    }

    /// Attempts to split one frame off the front of `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ParseResult<Option<Message>> {
        let from = self.scanned.min(buf.len());

        let Some(offset) = find_marker(&buf[from..]) else {
            // The tail may hold the start of a marker
            self.scanned = buf.len().saturating_sub(SPLIT_MARKER.len() - 1);
            if buf.len() > self.max_frame {
                return Err(ParseError::FrameTooLarge {
                    size: buf.len(),
                    max: self.max_frame,
                });
            }
            return Ok(None);
        };

        let end = from + offset;
        self.scanned = 0;
        if end + SPLIT_MARKER.len() > self.max_frame {
            return Err(ParseError::FrameTooLarge {
                size: end + SPLIT_MARKER.len(),
                max: self.max_frame,
            });
        }

        let body = buf.split_to(end).freeze();
        buf.advance(SPLIT_MARKER.len());
        Ok(Some(decode(body)?))
    }
}
