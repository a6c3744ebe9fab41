//! Binary Wire Protocol
//!
//! This module implements the framed binary protocol spoken by clients,
//! servers and replicas.
//!
//! ## Overview
//!
//! A frame is a 20 byte header, a UTF-8 key and an opaque value, terminated
//! by the `+END` marker. Frames are found by scanning for the marker, so it
//! must never occur inside a frame.
//!
//! ## Modules
//!
//! - `types`: `Op`, `Status` and `Message`
//! - `codec`: Frame encoding and body decoding
//! - `parser`: Incremental splitting of frames off a read buffer
//! - `stream`: Message reader/writer over async streams, with read backoff
//!
//! ## Example
//!
//! ```
//! use blockkv::protocol::{decode, encode, Message, SPLIT_MARKER};
//!
//! let frame = encode(&Message::set("name", "Ariz", 0, true)).unwrap();
//! let body = frame.slice(..frame.len() - SPLIT_MARKER.len());
//! assert_eq!(decode(body).unwrap().key, "name");
//! ```

pub mod codec;
pub mod parser;
pub mod stream;
pub mod types;

// Re-export commonly used types for convenience
pub use codec::{decode, encode, encode_into, DecodeError, EncodeError, HEADER_LEN, MIN_FRAME_LEN, SPLIT_MARKER};
pub use parser::{FrameParser, ParseError, ParseResult};
pub use stream::{write_message, Backoff, MessageReader, StreamError};
pub use types::{Message, Op, Status};
