//! WebSocket opening-handshake primitives.
//!
//! The upgrade itself lives in the transport layer; this module holds the
//! pure pieces: the accept-key digest and client-key validation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// The GUID every conforming endpoint appends to the client key before
/// hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this implementation speaks.
pub const WS_VERSION: &str = "13";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Whether `client_key` is a well-formed `Sec-WebSocket-Key`: base64 text
/// decoding to exactly 16 bytes.
#[must_use]
pub fn is_valid_key(client_key: &str) -> bool {
    matches!(BASE64.decode(client_key.trim()), Ok(bytes) if bytes.len() == 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(is_valid_key("  dGhlIHNhbXBsZSBub25jZQ==  "));

        // Wrong decoded length.
        assert!(!is_valid_key("c2hvcnQ="));
        // Not base64 at all.
        assert!(!is_valid_key("not base64!!"));
        assert!(!is_valid_key(""));
    }
}
