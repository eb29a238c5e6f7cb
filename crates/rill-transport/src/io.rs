//! The seam between this crate and the host HTTP server.
//!
//! The core assumes exactly three capabilities of its host (and nothing
//! else): a parsed request head, a way to take over the raw byte stream
//! once validation passes, and (for SSE) a flush primitive. `Hijack`
//! models the takeover; hosts implement it once per framework.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HOST};
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::HandshakeError;

/// The raw bidirectional stream a host yields after hijacking.
pub trait RawIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> RawIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// What a successful hijack hands back.
pub struct Hijacked {
    /// The raw stream, free of the host's HTTP framing.
    pub io: Box<dyn RawIo>,
    /// Bytes the host had already read past the request head. They are
    /// treated as the first bytes of the stream.
    pub buffered: Bytes,
}

/// Host-side takeover of an HTTP connection.
///
/// Implementations bridge a specific HTTP server's hijacking facility.
/// The upgraders consume the value only after the request validates, so a
/// refused request never touches the stream.
#[async_trait]
pub trait Hijack: Send + 'static {
    /// Whether the host can flush response bytes before handover. SSE
    /// refuses hosts that cannot.
    fn supports_flush(&self) -> bool {
        true
    }

    /// Take over the connection.
    ///
    /// # Errors
    ///
    /// `NotHijackable` if the host has no raw stream to give, or `Io` if
    /// the takeover itself fails.
    async fn hijack(self) -> Result<Hijacked, HandshakeError>;
}

/// Adapter for hosts (and tests) that already hold a plain byte stream.
pub struct StreamHijack<S>(pub S);

#[async_trait]
impl<S> Hijack for StreamHijack<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn hijack(self) -> Result<Hijacked, HandshakeError> {
        Ok(Hijacked {
            io: Box::new(self.0),
            buffered: Bytes::new(),
        })
    }
}

/// The slice of an HTTP request the upgraders validate.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// HTTP protocol version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Assemble a head from its parts.
    #[must_use]
    pub fn new(method: Method, version: Version, headers: HeaderMap) -> Self {
        Self {
            method,
            version,
            headers,
        }
    }

    /// A header's value as text, if present and visible ASCII.
    #[must_use]
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `Host` header.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.header_str(&HOST).map(str::trim)
    }

    /// Whether `name` contains `token` in its comma-separated value list,
    /// compared case-insensitively. Headers like `Connection` are lists;
    /// `Connection: keep-alive, Upgrade` must match the token `upgrade`.
    #[must_use]
    pub fn header_has_token(&self, name: &HeaderName, token: &str) -> bool {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
    }

    /// The `Last-Event-ID` header, verbatim.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        static LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");
        self.header_str(&LAST_EVENT_ID)
    }
}
