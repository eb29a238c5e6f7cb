//! The Server-Sent Events connection.
//!
//! SSE is write-mostly: after the response head goes out, the server owns
//! the stream and emits events until either side hangs up. A small watch
//! task holds the read half purely to notice the peer's FIN, which is the
//! only signal a disconnected EventSource leaves behind.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rill_protocol::sse::{encode_comment_into, encode_event_into};
use rill_protocol::SseEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::conn::{ConnectionId, Lifecycle};
use crate::error::{ConnError, HandshakeError};
use crate::io::{Hijack, Hijacked, RawIo, RequestHead};

/// Response head sent before the event stream starts. `X-Accel-Buffering`
/// keeps nginx-style proxies from absorbing the flushes.
const RESPONSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\
X-Accel-Buffering: no\r\n\
\r\n";

/// Tunables for SSE connections.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Initial capacity of the write buffer.
    pub write_buffer_size: usize,
    /// Per-write deadline. Zero disables it.
    pub write_deadline: Duration,
    /// Interval for automatic keep-alive comments. `None` disables them;
    /// applications can still heartbeat through `send_comment`.
    pub keep_alive: Option<Duration>,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4096,
            write_deadline: Duration::from_secs(10),
            keep_alive: Some(Duration::from_secs(30)),
        }
    }
}

/// Turns validated requests into [`SseConn`]s.
pub struct SseUpgrader {
    config: SseConfig,
}

impl SseUpgrader {
    /// Create an upgrader with the given configuration.
    #[must_use]
    pub fn new(config: SseConfig) -> Self {
        Self { config }
    }

    /// Hijack the stream, send the event-stream response head, and hand
    /// the connection to the application.
    ///
    /// # Errors
    ///
    /// `NotHijackable` when the host cannot hijack or cannot flush; `Io`
    /// when writing the response head fails.
    pub async fn upgrade<H: Hijack>(
        &self,
        head: &RequestHead,
        hijack: H,
    ) -> Result<SseConn, HandshakeError> {
        if !hijack.supports_flush() {
            return Err(HandshakeError::NotHijackable);
        }

        let last_event_id = head.last_event_id().map(str::to_owned);

        let Hijacked { io, .. } = hijack.hijack().await?;
        let (read_half, mut write_half) = tokio::io::split(io);
        write_half.write_all(RESPONSE_HEAD.as_bytes()).await?;
        write_half.flush().await?;

        let shared = Arc::new(SseShared {
            id: ConnectionId::generate(),
            lifecycle: Lifecycle::new(),
            writer: Mutex::new(SseWriteEnd {
                io: write_half,
                buf: BytesMut::with_capacity(self.config.write_buffer_size.max(64)),
            }),
            write_deadline: self.config.write_deadline,
        });

        tokio::spawn(watch_peer(shared.clone(), read_half));
        match self.config.keep_alive {
            Some(interval) if !interval.is_zero() => {
                tokio::spawn(run_keep_alive(shared.clone(), interval));
            }
            _ => {}
        }

        debug!(connection = %shared.id, last_event_id = ?last_event_id, "sse stream open");
        Ok(SseConn {
            shared,
            last_event_id,
        })
    }
}

struct SseWriteEnd {
    io: WriteHalf<Box<dyn RawIo>>,
    buf: BytesMut,
}

struct SseShared {
    id: ConnectionId,
    lifecycle: Lifecycle,
    writer: Mutex<SseWriteEnd>,
    write_deadline: Duration,
}

impl SseShared {
    /// Write whatever `fill` encoded into the write buffer, then flush so
    /// the client sees the event immediately.
    async fn write_flush(
        &self,
        fill: impl FnOnce(&mut BytesMut),
    ) -> Result<(), ConnError> {
        if !self.lifecycle.is_open() {
            return Err(ConnError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let SseWriteEnd { io, buf } = &mut *writer;
        buf.clear();
        fill(buf);
        if buf.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = buf;

        let write = async {
            io.write_all(bytes).await?;
            io.flush().await
        };
        let result = if self.write_deadline.is_zero() {
            write.await.map_err(ConnError::Io)
        } else {
            match time::timeout(self.write_deadline, write).await {
                Ok(result) => result.map_err(ConnError::Io),
                Err(_) => Err(ConnError::Timeout),
            }
        };

        drop(writer);
        if let Err(err) = result {
            warn!(connection = %self.id, error = %err, "event write failed");
            self.teardown().await;
            return Err(err);
        }
        Ok(())
    }

    /// Tear the stream down. Idempotent; fires `done` once.
    async fn teardown(&self) {
        self.lifecycle.begin_close();
        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
        writer.buf = BytesMut::new();
        drop(writer);
        if self.lifecycle.finalize() {
            debug!(connection = %self.id, "sse stream closed");
        }
    }
}

/// A server-side SSE connection.
///
/// Events are encoded straight into the connection's write buffer and
/// flushed per event, in submission order.
pub struct SseConn {
    shared: Arc<SseShared>,
    last_event_id: Option<String>,
}

impl SseConn {
    /// Encode and flush one event.
    ///
    /// # Errors
    ///
    /// `Closed` when the stream is not open; an I/O or deadline failure
    /// closes the stream and is reported to this call.
    pub async fn send(&self, event: &SseEvent) -> Result<(), ConnError> {
        trace!(connection = %self.shared.id, event_type = ?event.event_type(), "send event");
        self.shared
            .write_flush(|buf| encode_event_into(event, buf))
            .await
    }

    /// Emit a comment line, the heartbeat path.
    ///
    /// # Errors
    ///
    /// Same contract as [`send`](Self::send).
    pub async fn send_comment(&self, text: &str) -> Result<(), ConnError> {
        self.shared
            .write_flush(|buf| encode_comment_into(text, buf))
            .await
    }

    /// The request's `Last-Event-ID` header, verbatim. Replay is the
    /// application's business.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Resolves when the peer disconnects or the stream is closed
    /// locally.
    pub async fn done(&self) {
        self.shared.lifecycle.wait_closed().await;
    }

    /// Whether the stream is still `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.is_open()
    }

    /// The connection's stable identity.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Close the stream: flushes nothing further, shuts the hijacked
    /// stream down, releases buffers. Idempotent.
    ///
    /// # Errors
    ///
    /// Infallible today; the `Result` keeps the contract room to report
    /// teardown failures.
    pub async fn close(&self) -> Result<(), ConnError> {
        self.shared.teardown().await;
        Ok(())
    }
}

impl Drop for SseConn {
    fn drop(&mut self) {
        // Wake the peer-watch task, which owns the async teardown.
        self.shared.lifecycle.begin_close();
    }
}

impl fmt::Debug for SseConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseConn")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

/// Watch the read half for the peer's FIN. Clients have nothing to say on
/// an event stream; anything they do send is discarded.
async fn watch_peer(shared: Arc<SseShared>, mut read_half: ReadHalf<Box<dyn RawIo>>) {
    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            result = read_half.read(&mut scratch) => match result {
                Ok(0) | Err(_) => {
                    debug!(connection = %shared.id, "peer disconnected");
                    shared.teardown().await;
                    break;
                }
                Ok(_) => {}
            },
            _ = shared.lifecycle.wait_closing() => {
                shared.teardown().await;
                break;
            }
        }
    }
}

async fn run_keep_alive(shared: Arc<SseShared>, interval: Duration) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = shared
                    .write_flush(|buf| encode_comment_into("keep-alive", buf))
                    .await;
                if result.is_err() {
                    break;
                }
            }
            _ = shared.lifecycle.wait_closing() => break,
        }
    }
}
