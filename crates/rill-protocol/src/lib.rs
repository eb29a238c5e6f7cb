//! # rill-protocol
//!
//! Wire formats for the rill realtime transport cores.
//!
//! Two byte grammars live here, both implemented directly against their
//! on-wire form:
//!
//! - **RFC 6455 framing**: streaming frame decoder, encoder, masking,
//!   close-code registry, and the opening-handshake digest.
//! - **`text/event-stream`**: the Server-Sent Events record grammar.
//!
//! This crate performs no I/O. The transport layer feeds the decoder from
//! its read buffer and writes encoder output through its connections.
//!
//! ## Example
//!
//! ```rust
//! use rill_protocol::{codec, DecodeConfig, Opcode};
//! use bytes::BytesMut;
//!
//! // A client frame, masked as RFC 6455 requires.
//! let encoded =
//!     codec::encode_frame(Opcode::Text, b"hello", true, Some([0x37, 0xfa, 0x21, 0x3d])).unwrap();
//!
//! let mut buf = BytesMut::from(&encoded[..]);
//! let frame = codec::decode_from(&mut buf, &DecodeConfig::default())
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(&frame.payload[..], b"hello");
//! ```

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod sse;

pub use codec::{DecodeConfig, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
pub use frame::{CloseCode, Frame, Opcode, MAX_CONTROL_PAYLOAD};
pub use sse::{SseError, SseEvent};
