//! The `text/event-stream` wire grammar.
//!
//! Events serialize as a run of `field: value` lines terminated by one
//! empty line:
//!
//! ```text
//! retry: 3000
//! id: 42
//! event: tick
//! data: first line
//! data: second line
//!
//! ```
//!
//! Comment lines start with a colon and are ignored by conforming parsers;
//! they double as keep-alive traffic.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Rejected event fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SseError {
    /// Event data must not be empty.
    #[error("event data must not be empty")]
    EmptyData,

    /// Event data must be valid UTF-8.
    #[error("event data must be valid UTF-8")]
    InvalidUtf8,

    /// Event type must match `[A-Za-z0-9_-]+`.
    #[error("event type {0:?} is not a valid token")]
    InvalidEventType(String),

    /// Event ids cannot contain CR or LF.
    #[error("event id must not contain line breaks")]
    InvalidId,
}

fn is_event_type_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A server-sent event.
///
/// Immutable once built; the `with_*` constructors consume and return the
/// event, validating each field against the stream grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    data: Bytes,
    event_type: Option<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseEvent {
    /// Create an event carrying `data`.
    ///
    /// Embedded line feeds are fine; each line is emitted as its own
    /// `data:` field.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty or not UTF-8.
    pub fn new(data: impl Into<Bytes>) -> Result<Self, SseError> {
        let data = data.into();
        if data.is_empty() {
            return Err(SseError::EmptyData);
        }
        if std::str::from_utf8(&data).is_err() {
            return Err(SseError::InvalidUtf8);
        }
        Ok(Self {
            data,
            event_type: None,
            id: None,
            retry_ms: None,
        })
    }

    /// Set the event type. Clients dispatch untyped events as `message`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the type matches `[A-Za-z0-9_-]+`.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Result<Self, SseError> {
        let event_type = event_type.into();
        if !is_event_type_token(&event_type) {
            return Err(SseError::InvalidEventType(event_type));
        }
        self.event_type = Some(event_type);
        Ok(self)
    }

    /// Set the event id surfaced to clients as `Last-Event-ID`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id contains CR or LF.
    pub fn with_id(mut self, id: impl Into<String>) -> Result<Self, SseError> {
        let id = id.into();
        if id.contains(['\n', '\r']) {
            return Err(SseError::InvalidId);
        }
        self.id = Some(id);
        Ok(self)
    }

    /// Set the client reconnection-delay hint, in milliseconds.
    #[must_use]
    pub fn with_retry_ms(mut self, retry_ms: u64) -> Self {
        self.retry_ms = Some(retry_ms);
        self
    }

    /// The event data.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The event type, if set.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// The event id, if set.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The retry hint, if set.
    #[must_use]
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }
}

/// Serialize an event into `buf`.
///
/// Fields are emitted in `retry`, `id`, `event`, `data` order, then the
/// blank line that terminates the event. An event with no fields at all
/// writes nothing.
pub fn encode_event_into(event: &SseEvent, buf: &mut BytesMut) {
    if event.data.is_empty()
        && event.event_type.is_none()
        && event.id.is_none()
        && event.retry_ms.is_none()
    {
        return;
    }

    if let Some(retry) = event.retry_ms {
        buf.put_slice(b"retry: ");
        buf.put_slice(retry.to_string().as_bytes());
        buf.put_u8(b'\n');
    }
    if let Some(id) = &event.id {
        buf.put_slice(b"id: ");
        buf.put_slice(id.as_bytes());
        buf.put_u8(b'\n');
    }
    if let Some(event_type) = &event.event_type {
        buf.put_slice(b"event: ");
        buf.put_slice(event_type.as_bytes());
        buf.put_u8(b'\n');
    }

    for line in event.data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        buf.put_slice(b"data: ");
        buf.put_slice(line);
        buf.put_u8(b'\n');
    }

    buf.put_u8(b'\n');
}

/// Serialize a comment (keep-alive) line into `buf`.
///
/// Multi-line text becomes one comment line per line of input, sharing a
/// single terminating blank line.
pub fn encode_comment_into(text: &str, buf: &mut BytesMut) {
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        buf.put_slice(b": ");
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
}
