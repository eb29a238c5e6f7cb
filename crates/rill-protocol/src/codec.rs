//! Codec for RFC 6455 frames.
//!
//! The decoder is a streaming parser over a `BytesMut`: it returns
//! `Ok(None)` until a complete frame is buffered and only then advances
//! the buffer, so callers can feed it partial reads straight off the
//! socket. Encoding always emits the smallest legal length form; the
//! decoder accepts longer forms, as the RFC permits.
//!
//! Frame layout (network byte order throughout):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |           (16/64)             |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Masking-key (if MASK set)                              |
//! +---------------------------------------------------------------+
//! |                          Payload                              |
//! +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{CloseCode, Frame, Opcode, MAX_CONTROL_PAYLOAD};

/// Default cap on a single message's payload (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Violations of the framing protocol.
///
/// Each kind maps to exactly one RFC 6455 close code via
/// [`ProtocolError::close_code`]; that table is the single source of truth
/// for what goes on the wire when a peer misbehaves.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// RSV1-3 set without a negotiated extension.
    #[error("reserved bits set without a negotiated extension")]
    RsvBits,

    /// Opcode outside {0, 1, 2, 8, 9, 10}.
    #[error("reserved opcode {0:#x}")]
    BadOpcode(u8),

    /// Client frame arrived without masking.
    #[error("client frame is not masked")]
    UnmaskedClient,

    /// Control frame payload exceeds 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),

    /// Control frame with the FIN bit clear.
    #[error("fragmented control frame")]
    ControlFragmented,

    /// Continuation without an open message, or a new data frame while one
    /// is open.
    #[error("continuation does not match an open message")]
    InvalidContinuation,

    /// Text message or close reason is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// Declared or accumulated payload exceeds the configured limit.
    #[error("message of {0} bytes exceeds the configured limit")]
    MessageTooLarge(u64),

    /// Close frame carried a status code that may not appear on the wire.
    #[error("illegal close code {0}")]
    BadCloseCode(u16),
}

impl ProtocolError {
    /// The close code announced to the peer for this violation.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::RsvBits
            | ProtocolError::BadOpcode(_)
            | ProtocolError::UnmaskedClient
            | ProtocolError::ControlTooLong(_)
            | ProtocolError::ControlFragmented
            | ProtocolError::InvalidContinuation
            | ProtocolError::BadCloseCode(_) => CloseCode::PROTOCOL_ERROR,
            ProtocolError::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            ProtocolError::MessageTooLarge(_) => CloseCode::MESSAGE_TOO_BIG,
        }
    }
}

/// Decoder settings.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Upper bound on a single frame's declared payload length.
    pub max_payload_len: usize,
    /// Reject unmasked frames. Servers must leave this on: RFC 6455
    /// requires every client-originated frame to be masked.
    pub require_mask: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_MESSAGE_SIZE,
            require_mask: true,
        }
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some(frame))` with `buf` advanced past it, `Ok(None)` if
/// more bytes are needed (`buf` untouched), or a [`ProtocolError`] the
/// moment the buffered header is provably invalid.
///
/// # Errors
///
/// Returns an error for reserved bits, reserved opcodes, oversized or
/// fragmented control frames, unmasked client frames, and payloads larger
/// than `cfg.max_payload_len`.
pub fn decode_from(buf: &mut BytesMut, cfg: &DecodeConfig) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & 0x70 != 0 {
        return Err(ProtocolError::RsvBits);
    }
    let opcode =
        Opcode::try_from(b0 & 0x0F).map_err(ProtocolError::BadOpcode)?;
    let fin = b0 & 0x80 != 0;
    let masked = b1 & 0x80 != 0;
    if !masked && cfg.require_mask {
        return Err(ProtocolError::UnmaskedClient);
    }

    let len7 = u64::from(b1 & 0x7F);
    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::ControlFragmented);
        }
        // 126 and 127 are extended-length markers, which only encode
        // payloads beyond the control limit anyway.
        if len7 > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::ControlTooLong(len7 as usize));
        }
    }

    let (payload_len, mut header_len) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len_bytes), 10)
        }
        n => (n, 2),
    };

    if payload_len > cfg.max_payload_len as u64 {
        return Err(ProtocolError::MessageTooLarge(payload_len));
    }
    let payload_len = payload_len as usize;

    let key = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < header_len + payload_len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(payload_len);
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Encode a frame into an existing buffer.
///
/// Servers emit with `mask: None`; `Some(key)` produces a client-style
/// masked frame (the test suites use this to play the client role).
///
/// # Errors
///
/// Returns [`ProtocolError::ControlTooLong`] when a control opcode carries
/// more than 125 payload bytes.
pub fn encode_frame_into(
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::ControlTooLong(payload.len()));
    }

    buf.reserve(14 + payload.len());
    buf.put_u8(u8::from(fin) << 7 | u8::from(opcode));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        n if n < 126 => buf.put_u8(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(n as u64);
        }
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }

    Ok(())
}

/// Encode a frame to a fresh buffer.
///
/// # Errors
///
/// Same rules as [`encode_frame_into`].
pub fn encode_frame(
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(14 + payload.len());
    encode_frame_into(opcode, payload, fin, mask, &mut buf)?;
    Ok(buf.freeze())
}

/// XOR `payload` with `key[i % 4]`, in place.
///
/// Masking is an involution: applying it twice restores the input. The
/// middle of the buffer is processed in 8-byte chunks (the key repeats
/// every 4 bytes, so a doubled key covers a full chunk); head and tail
/// fall back to byte-wise XOR.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    let key64 = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = payload.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ key64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // chunks_exact_mut leaves a remainder starting at a multiple of 8,
    // which is also a multiple of 4, so the key phase restarts cleanly.
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decode a Close frame payload into its status code and reason.
///
/// An empty payload is legal and yields `None`.
///
/// # Errors
///
/// A truncated (1-byte) payload or a code outside the wire-legal set is
/// [`ProtocolError::BadCloseCode`]; a reason that is not UTF-8 is
/// [`ProtocolError::InvalidUtf8`].
pub fn decode_close(payload: &[u8]) -> Result<Option<(CloseCode, String)>, ProtocolError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::BadCloseCode(u16::from(payload[0]))),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_on_wire(code) {
                return Err(ProtocolError::BadCloseCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Some((CloseCode::new(code), reason.to_owned())))
        }
    }
}

/// Encode a Close frame payload.
///
/// The reason is truncated at a character boundary so the payload fits the
/// 125-byte control limit.
#[must_use]
pub fn encode_close(code: CloseCode, reason: &str) -> Bytes {
    const MAX_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

    let mut end = reason.len().min(MAX_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut buf = BytesMut::with_capacity(2 + end);
    buf.put_u16(code.as_u16());
    buf.put_slice(&reason.as_bytes()[..end]);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmasked_cfg() -> DecodeConfig {
        DecodeConfig {
            require_mask: false,
            ..DecodeConfig::default()
        }
    }

    #[test]
    fn test_decode_single_text_frame() {
        // Unmasked "hello" from a server.
        let mut buf = BytesMut::from(&b"\x81\x05hello"[..]);
        let frame = decode_from(&mut buf, &unmasked_cfg()).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_masked_client_frame() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let encoded = encode_frame(Opcode::Text, b"hello", true, Some(key)).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);

        let frame = decode_from(&mut buf, &DecodeConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let key = [1, 2, 3, 4];
        let encoded = encode_frame(Opcode::Binary, &[0u8; 300], true, Some(key)).unwrap();

        // Feed the frame byte by byte; the decoder must not consume or
        // error on any prefix.
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decode_from(&mut buf, &DecodeConfig::default()).unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                assert_eq!(result.unwrap().payload.len(), 300);
            }
        }
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frame_into(Opcode::Text, b"one", true, Some([9, 9, 9, 9]), &mut buf).unwrap();
        encode_frame_into(Opcode::Text, b"two", true, Some([7, 7, 7, 7]), &mut buf).unwrap();

        let cfg = DecodeConfig::default();
        let first = decode_from(&mut buf, &cfg).unwrap().unwrap();
        let second = decode_from(&mut buf, &cfg).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(&second.payload[..], b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reject_rsv_bits() {
        let mut buf = BytesMut::from(&[0xC1u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_from(&mut buf, &DecodeConfig::default()),
            Err(ProtocolError::RsvBits)
        ));
    }

    #[test]
    fn test_reject_reserved_opcode() {
        let mut buf = BytesMut::from(&[0x83u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_from(&mut buf, &DecodeConfig::default()),
            Err(ProtocolError::BadOpcode(0x3))
        ));
    }

    #[test]
    fn test_reject_unmasked_client_frame() {
        let mut buf = BytesMut::from(&b"\x81\x05hello"[..]);
        assert!(matches!(
            decode_from(&mut buf, &DecodeConfig::default()),
            Err(ProtocolError::UnmaskedClient)
        ));
    }

    #[test]
    fn test_reject_fragmented_control() {
        // Ping with fin=0.
        let mut buf = BytesMut::from(&[0x09u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_from(&mut buf, &DecodeConfig::default()),
            Err(ProtocolError::ControlFragmented)
        ));
    }

    #[test]
    fn test_control_payload_boundaries() {
        let cfg = unmasked_cfg();
        for len in [0usize, 1, 125] {
            let payload = vec![0u8; len];
            let encoded = encode_frame(Opcode::Ping, &payload, true, None).unwrap();
            let mut buf = BytesMut::from(&encoded[..]);
            let frame = decode_from(&mut buf, &cfg).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }

        // 126 cannot even be encoded, and a hand-built frame is rejected.
        assert!(matches!(
            encode_frame(Opcode::Ping, &[0u8; 126], true, None),
            Err(ProtocolError::ControlTooLong(126))
        ));
        let mut buf = BytesMut::from(&[0x89u8, 0xFE, 0x00, 0x7E][..]);
        assert!(matches!(
            decode_from(&mut buf, &DecodeConfig::default()),
            Err(ProtocolError::ControlTooLong(_))
        ));
    }

    #[test]
    fn test_length_form_boundaries() {
        // Smallest legal form on emission at each boundary.
        let cases: [(usize, usize); 4] = [
            (125, 2),   // 7-bit form
            (126, 4),   // 16-bit form
            (65535, 4), // largest 16-bit
            (65536, 10), // 64-bit form
        ];

        let cfg = DecodeConfig {
            max_payload_len: 1 << 20,
            require_mask: false,
        };
        for (len, header) in cases {
            let payload = vec![0xAB; len];
            let encoded = encode_frame(Opcode::Binary, &payload, true, None).unwrap();
            assert_eq!(encoded.len(), header + len, "length {}", len);

            let mut buf = BytesMut::from(&encoded[..]);
            let frame = decode_from(&mut buf, &cfg).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn test_decoder_accepts_non_minimal_length() {
        // 5 bytes advertised through the 16-bit form: legal to accept.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x81, 0x7E, 0x00, 0x05]);
        buf.put_slice(b"hello");
        let frame = decode_from(&mut buf, &unmasked_cfg()).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn test_reject_oversized_declared_length() {
        let cfg = DecodeConfig {
            max_payload_len: 16,
            require_mask: false,
        };
        let mut buf = BytesMut::from(&[0x82u8, 0x11][..]);
        assert!(matches!(
            decode_from(&mut buf, &cfg),
            Err(ProtocolError::MessageTooLarge(17))
        ));
    }

    #[test]
    fn test_mask_involution() {
        let key = [0xDE, 0xAD, 0xBE, 0xEF];
        for len in [0usize, 1, 3, 4, 7, 8, 9, 31, 64, 1000] {
            let original: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut data = original.clone();
            apply_mask(&mut data, key);
            if len > 0 {
                assert_ne!(data, original, "len {}", len);
            }
            apply_mask(&mut data, key);
            assert_eq!(data, original, "len {}", len);
        }
    }

    #[test]
    fn test_mask_matches_reference() {
        // Chunked XOR must agree with the naive definition.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data: Vec<u8> = (0..100).collect();
        let expected: Vec<u8> = data
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect();
        apply_mask(&mut data, key);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_close_payload_roundtrip() {
        let payload = encode_close(CloseCode::NORMAL, "bye");
        let (code, reason) = decode_close(&payload).unwrap().unwrap();
        assert_eq!(code, CloseCode::NORMAL);
        assert_eq!(reason, "bye");

        assert_eq!(decode_close(&[]).unwrap(), None);
    }

    #[test]
    fn test_close_payload_rejects_bad_codes() {
        assert!(matches!(
            decode_close(&[0x03]),
            Err(ProtocolError::BadCloseCode(3))
        ));
        for code in [1005u16, 1006, 1015, 999, 2500] {
            let payload = code.to_be_bytes();
            assert!(matches!(
                decode_close(&payload),
                Err(ProtocolError::BadCloseCode(c)) if c == code
            ));
        }
    }

    #[test]
    fn test_close_reason_utf8_validation() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            decode_close(&payload),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_close_reason_truncates_at_char_boundary() {
        // 62 two-byte characters: 124 bytes of reason, 2 of code. The last
        // character would straddle the 123-byte limit and must be dropped
        // whole.
        let reason = "é".repeat(62);
        let payload = encode_close(CloseCode::GOING_AWAY, &reason);
        assert!(payload.len() <= MAX_CONTROL_PAYLOAD);
        let (_, decoded) = decode_close(&payload).unwrap().unwrap();
        assert_eq!(decoded, "é".repeat(61));
    }

    #[test]
    fn test_close_code_table() {
        assert_eq!(ProtocolError::RsvBits.close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::BadOpcode(3).close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::UnmaskedClient.close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::ControlTooLong(126).close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::ControlFragmented.close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::InvalidContinuation.close_code().as_u16(), 1002);
        assert_eq!(ProtocolError::InvalidUtf8.close_code().as_u16(), 1007);
        assert_eq!(ProtocolError::MessageTooLarge(0).close_code().as_u16(), 1009);
        assert_eq!(ProtocolError::BadCloseCode(1006).close_code().as_u16(), 1002);
    }
}
