//! Error taxonomy for the transport layer.

use http::{header, HeaderValue, Response, StatusCode};
use rill_protocol::handshake::WS_VERSION;
use rill_protocol::ProtocolError;
use thiserror::Error;

/// Reasons an upgrade request is refused.
///
/// Each validation kind maps to one HTTP status via [`status`]; the host
/// HTTP server answers the request itself, since a refused stream is never
/// hijacked.
///
/// [`status`]: HandshakeError::status
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The request method is not GET.
    #[error("handshake requires GET")]
    MethodNotAllowed,

    /// A required header is absent or carries the wrong token.
    #[error("missing or malformed {0} header")]
    MissingHeader(&'static str),

    /// Wrong HTTP version, or a `Sec-WebSocket-Version` other than 13.
    #[error("unsupported protocol version")]
    BadVersion,

    /// `Sec-WebSocket-Key` does not decode to 16 bytes.
    #[error("malformed Sec-WebSocket-Key")]
    BadKey,

    /// The origin-check predicate refused the request.
    #[error("origin not allowed")]
    OriginRejected,

    /// The host HTTP server cannot hand over the raw stream, or (for SSE)
    /// cannot flush response bytes.
    #[error("connection cannot be hijacked")]
    NotHijackable,

    /// The handshake exchange exceeded its deadline.
    #[error("handshake timed out")]
    Timeout,

    /// The stream failed mid-handshake.
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// The HTTP status the host should answer with.
    ///
    /// `None` for `Timeout` and `Io`: by then the connection is already
    /// gone and there is nobody left to answer.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HandshakeError::MethodNotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
            HandshakeError::MissingHeader(_) | HandshakeError::BadKey => {
                Some(StatusCode::BAD_REQUEST)
            }
            HandshakeError::BadVersion => Some(StatusCode::UPGRADE_REQUIRED),
            HandshakeError::OriginRejected => Some(StatusCode::FORBIDDEN),
            HandshakeError::NotHijackable => Some(StatusCode::INTERNAL_SERVER_ERROR),
            HandshakeError::Timeout | HandshakeError::Io(_) => None,
        }
    }

    /// Build the refusal response for the host to send.
    ///
    /// Version rejections advertise the version this endpoint speaks, as
    /// the RFC requires of a 426.
    #[must_use]
    pub fn to_response(&self) -> Option<Response<()>> {
        let status = self.status()?;
        let mut response = Response::new(());
        *response.status_mut() = status;
        if matches!(self, HandshakeError::BadVersion) {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static(WS_VERSION),
            );
        }
        Some(response)
    }
}

/// Failures of an established connection.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The connection is not open; every public operation reports this
    /// once the lifecycle has left `Open`.
    #[error("connection is closed")]
    Closed,

    /// The peer violated the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying stream failed.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write deadline elapsed. Semantically an I/O failure with
    /// the cause preserved.
    #[error("deadline exceeded")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(
            HandshakeError::MethodNotAllowed.status(),
            Some(StatusCode::METHOD_NOT_ALLOWED)
        );
        assert_eq!(
            HandshakeError::MissingHeader("Upgrade").status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            HandshakeError::BadVersion.status(),
            Some(StatusCode::UPGRADE_REQUIRED)
        );
        assert_eq!(
            HandshakeError::BadKey.status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            HandshakeError::OriginRejected.status(),
            Some(StatusCode::FORBIDDEN)
        );
        assert_eq!(
            HandshakeError::NotHijackable.status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(HandshakeError::Timeout.status(), None);
    }

    #[test]
    fn test_version_rejection_advertises_13() {
        let response = HandshakeError::BadVersion.to_response().unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(
            response
                .headers()
                .get(header::SEC_WEBSOCKET_VERSION)
                .unwrap(),
            "13"
        );
    }
}
