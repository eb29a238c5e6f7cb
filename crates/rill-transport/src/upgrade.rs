//! The WebSocket opening handshake.
//!
//! Validation happens against the request head alone; the stream is only
//! hijacked once a request passes, so refusals (403, 426, ...) stay the
//! host's to answer via [`HandshakeError::to_response`].
//!
//! [`HandshakeError::to_response`]: crate::HandshakeError::to_response

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{
    CONNECTION, ORIGIN, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Version};
use rill_protocol::handshake::{accept_key, is_valid_key, WS_VERSION};
use rill_protocol::DEFAULT_MAX_MESSAGE_SIZE;
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::{debug, warn};

use crate::error::HandshakeError;
use crate::io::{Hijack, Hijacked, RequestHead};
use crate::ws::WsConn;

/// A pluggable origin check.
pub type OriginPredicate = Arc<dyn Fn(&RequestHead) -> bool + Send + Sync>;

/// Tunables for the upgrade and the connection it produces.
#[derive(Clone)]
pub struct UpgradeConfig {
    /// Initial capacity of the connection's read buffer.
    pub read_buffer_size: usize,
    /// Initial capacity of the connection's write buffer.
    pub write_buffer_size: usize,
    /// Cap on a single application message, fragments included.
    pub max_message_size: usize,
    /// Deadline for the whole handshake exchange.
    pub handshake_timeout: Duration,
    /// Per-read deadline. Zero disables it.
    pub read_deadline: Duration,
    /// Per-write deadline. Zero disables it.
    pub write_deadline: Duration,
    /// How often the keepalive task pings. Zero disables keepalive.
    pub ping_interval: Duration,
    /// How long a peer may go without answering a ping before the
    /// connection is closed with 1011. Zero disables the check.
    pub pong_wait: Duration,
    /// Capacity of the per-connection outbound queue.
    pub send_queue_size: usize,
    /// Subprotocols this endpoint accepts, in preference order. Empty
    /// means no subprotocol is ever negotiated.
    pub subprotocols: Vec<String>,
    /// Origin policy. `None` applies the default: requests with an
    /// `Origin` header must match the request host.
    pub check_origin: Option<OriginPredicate>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout: Duration::from_secs(10),
            read_deadline: Duration::ZERO,
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            send_queue_size: 64,
            subprotocols: Vec::new(),
            check_origin: None,
        }
    }
}

impl fmt::Debug for UpgradeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeConfig")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_message_size", &self.max_message_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("read_deadline", &self.read_deadline)
            .field("write_deadline", &self.write_deadline)
            .field("ping_interval", &self.ping_interval)
            .field("pong_wait", &self.pong_wait)
            .field("send_queue_size", &self.send_queue_size)
            .field("subprotocols", &self.subprotocols)
            .field(
                "check_origin",
                &self.check_origin.as_ref().map(|_| "<predicate>"),
            )
            .finish()
    }
}

/// Validates upgrade requests and turns their streams into [`WsConn`]s.
pub struct WsUpgrader {
    config: UpgradeConfig,
}

impl WsUpgrader {
    /// Create an upgrader with the given configuration.
    #[must_use]
    pub fn new(config: UpgradeConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Validate `head` and, on success, hijack the stream and complete the
    /// 101 exchange.
    ///
    /// # Errors
    ///
    /// A validation failure leaves the stream untouched and names the HTTP
    /// status the host should answer with. `Timeout` and `Io` mean the
    /// exchange itself died.
    pub async fn upgrade<H: Hijack>(
        &self,
        head: &RequestHead,
        hijack: H,
    ) -> Result<WsConn, HandshakeError> {
        let key = self.validate(head)?;
        let subprotocol = self.select_subprotocol(head);
        let accept = accept_key(key);

        let exchange = async {
            let Hijacked { mut io, buffered } = hijack.hijack().await?;
            let response = switching_protocols(&accept, subprotocol.as_deref());
            io.write_all(response.as_bytes()).await?;
            io.flush().await?;
            Ok::<_, HandshakeError>((io, buffered))
        };

        let (io, buffered) = if self.config.handshake_timeout.is_zero() {
            exchange.await?
        } else {
            time::timeout(self.config.handshake_timeout, exchange)
                .await
                .map_err(|_| HandshakeError::Timeout)??
        };

        let conn = WsConn::spawn(io, buffered, subprotocol, &self.config);
        debug!(connection = %conn.id(), "websocket upgrade complete");
        Ok(conn)
    }

    fn validate<'h>(&self, head: &'h RequestHead) -> Result<&'h str, HandshakeError> {
        if head.method != Method::GET {
            return Err(HandshakeError::MethodNotAllowed);
        }
        if head.version < Version::HTTP_11 {
            return Err(HandshakeError::BadVersion);
        }
        if !head.header_has_token(&UPGRADE, "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !head.header_has_token(&CONNECTION, "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }
        match head.header_str(&SEC_WEBSOCKET_VERSION) {
            Some(version) if version.trim() == WS_VERSION => {}
            _ => return Err(HandshakeError::BadVersion),
        }
        let key = head
            .header_str(&SEC_WEBSOCKET_KEY)
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        if !is_valid_key(key) {
            return Err(HandshakeError::BadKey);
        }

        let allowed = match &self.config.check_origin {
            Some(predicate) => predicate(head),
            None => same_origin(head),
        };
        if !allowed {
            warn!(origin = ?head.header_str(&ORIGIN), "origin rejected");
            return Err(HandshakeError::OriginRejected);
        }

        Ok(key)
    }

    fn select_subprotocol(&self, head: &RequestHead) -> Option<String> {
        if self.config.subprotocols.is_empty() {
            return None;
        }
        self.config
            .subprotocols
            .iter()
            .find(|accepted| head.header_has_token(&SEC_WEBSOCKET_PROTOCOL, accepted))
            .cloned()
    }
}

/// The default origin policy: no `Origin` header passes (non-browser
/// clients), otherwise the origin's authority must equal the request host.
fn same_origin(head: &RequestHead) -> bool {
    let Some(origin) = head.header_str(&ORIGIN) else {
        return true;
    };
    let Some(host) = head.host() else {
        return false;
    };
    let Some(scheme_end) = origin.find("://") else {
        return false;
    };
    let authority = origin[scheme_end + 3..]
        .split('/')
        .next()
        .unwrap_or_default();
    !authority.is_empty() && authority.eq_ignore_ascii_case(host)
}

fn switching_protocols(accept: &str, subprotocol: Option<&str>) -> String {
    let mut response = String::with_capacity(160);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(accept);
    response.push_str("\r\n");
    if let Some(protocol) = subprotocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}
