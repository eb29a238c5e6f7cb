//! The WebSocket connection.
//!
//! Each connection runs three tasks around the hijacked stream:
//!
//! - a **reader**, sole owner of the read half and the read buffer. It
//!   feeds the frame decoder, reassembles fragments, answers Ping and
//!   Close inline, and delivers complete messages to `read`.
//! - a **writer**, sole consumer of the bounded outbound queue that
//!   `write` and the Hub feed.
//! - a **keepalive** timer that pings on an interval and closes the
//!   connection when the peer stops answering.
//!
//! The write half and write buffer sit behind one async mutex, held per
//! full frame; the reader takes it only for its automatic Pong and Close
//! replies, so application frames are never interleaved mid-frame.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rill_protocol::{codec, CloseCode, DecodeConfig, Frame, Opcode, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::conn::{ConnectionId, Lifecycle, Message, MessageKind};
use crate::error::ConnError;
use crate::io::RawIo;
use crate::upgrade::UpgradeConfig;

/// Depth of the inbound message queue between the reader task and `read`.
const INCOMING_QUEUE: usize = 8;

/// How long tasks may linger after a close is initiated, waiting for the
/// peer's half of the handshake.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a non-blocking enqueue onto the send queue failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The bounded send queue is at capacity.
    #[error("send queue is full")]
    Full,
    /// The connection is closed or closing.
    #[error("connection is closed")]
    Closed,
}

enum Outbound {
    Message { opcode: Opcode, payload: Bytes },
    Raw(Bytes),
}

struct WriteEnd {
    io: WriteHalf<Box<dyn RawIo>>,
    buf: BytesMut,
}

struct ConnShared {
    id: ConnectionId,
    lifecycle: Lifecycle,
    writer: Mutex<WriteEnd>,
    write_deadline: Duration,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last Pong (or connect).
    last_pong_ms: AtomicU64,
    close_sent: AtomicBool,
    /// The error `read` reports once the incoming queue runs dry.
    terminal: StdMutex<Option<ConnError>>,
}

async fn timed_io<F>(deadline: Duration, op: F) -> Result<(), ConnError>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if deadline.is_zero() {
        op.await.map_err(ConnError::Io)
    } else {
        match time::timeout(deadline, op).await {
            Ok(result) => result.map_err(ConnError::Io),
            Err(_) => Err(ConnError::Timeout),
        }
    }
}

impl ConnShared {
    async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        let WriteEnd { io, buf } = &mut *writer;
        buf.clear();
        codec::encode_frame_into(opcode, payload, true, None, buf)?;
        let frame: &[u8] = buf;
        timed_io(self.write_deadline, async {
            io.write_all(frame).await?;
            io.flush().await
        })
        .await
    }

    async fn write_raw(&self, frame: &[u8]) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        let io = &mut writer.io;
        timed_io(self.write_deadline, async {
            io.write_all(frame).await?;
            io.flush().await
        })
        .await
    }

    /// Emit the connection's one and only Close frame.
    async fn send_close(&self, code: CloseCode, reason: &str) -> Result<(), ConnError> {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!(connection = %self.id, code = %code, "sending close frame");
        let payload = codec::encode_close(code, reason);
        self.write_frame(Opcode::Close, &payload).await
    }

    fn note_pong(&self) {
        self.last_pong_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last_pong_at(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed))
    }

    fn record_terminal(&self, err: ConnError) {
        let mut terminal = self.terminal.lock().unwrap();
        if terminal.is_none() {
            *terminal = Some(err);
        }
    }

    fn take_terminal(&self) -> Option<ConnError> {
        self.terminal.lock().unwrap().take()
    }

    /// Tear the connection down. First caller wins; fires `done`.
    async fn finalize(&self) {
        if !self.lifecycle.finalize() {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
        writer.buf = BytesMut::new();
        debug!(connection = %self.id, "connection closed");
    }
}

/// Cloneable write/control handle to a connection.
///
/// The Hub holds one per member; applications clone it to write from
/// tasks other than the one calling [`WsConn::read`]. It never extends
/// the connection's lifetime: once the connection closes, every
/// operation reports [`ConnError::Closed`].
#[derive(Clone)]
pub struct WsSender {
    shared: Arc<ConnShared>,
    outbox: mpsc::Sender<Outbound>,
}

impl WsSender {
    /// The connection's stable identity.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    /// Whether the connection is still `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.is_open()
    }

    /// Resolves when the connection reaches `Closed`.
    pub async fn done(&self) {
        self.shared.lifecycle.wait_closed().await;
    }

    /// Send an application message.
    ///
    /// Text and Binary are queued behind the connection's bounded send
    /// queue and emitted as single frames in call order; the call blocks
    /// while the queue is full. Control kinds take the direct path:
    /// Ping/Pong are written immediately, Close starts a normal (1000)
    /// close handshake.
    ///
    /// # Errors
    ///
    /// `Closed` when the connection is not open, otherwise the write
    /// path's I/O or timeout failure.
    pub async fn write(
        &self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), ConnError> {
        let payload = payload.into();
        match kind {
            MessageKind::Text | MessageKind::Binary => {
                if !self.shared.lifecycle.is_open() {
                    return Err(ConnError::Closed);
                }
                self.outbox
                    .send(Outbound::Message {
                        opcode: kind.opcode(),
                        payload,
                    })
                    .await
                    .map_err(|_| ConnError::Closed)
            }
            MessageKind::Ping | MessageKind::Pong => self.control(kind.opcode(), &payload).await,
            MessageKind::Close => self.close(CloseCode::NORMAL, "").await,
        }
    }

    /// Send a Ping with an empty payload.
    ///
    /// # Errors
    ///
    /// Same contract as [`write`](Self::write).
    pub async fn ping(&self) -> Result<(), ConnError> {
        self.control(Opcode::Ping, b"").await
    }

    /// Send an unsolicited Pong.
    ///
    /// # Errors
    ///
    /// Same contract as [`write`](Self::write).
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<(), ConnError> {
        let data = data.into();
        self.control(Opcode::Pong, &data).await
    }

    async fn control(&self, opcode: Opcode, payload: &[u8]) -> Result<(), ConnError> {
        if !self.shared.lifecycle.is_open() {
            return Err(ConnError::Closed);
        }
        self.shared.write_frame(opcode, payload).await
    }

    /// Initiate the close handshake.
    ///
    /// Idempotent: only the first call on an open connection emits a
    /// Close frame; later calls (and calls racing the peer's own close)
    /// return `Ok` without effect. The connection reaches `Closed` once
    /// the peer answers or the drain deadline expires.
    ///
    /// # Errors
    ///
    /// Rejects codes that may not appear on the wire (1004, 1005, 1006,
    /// 1015, and unassigned ranges).
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), ConnError> {
        if !CloseCode::is_valid_on_wire(code.as_u16()) {
            return Err(ConnError::Protocol(ProtocolError::BadCloseCode(
                code.as_u16(),
            )));
        }
        if !self.shared.lifecycle.begin_close() {
            return Ok(());
        }
        debug!(connection = %self.shared.id, code = %code, reason, "closing connection");
        if let Err(err) = self.shared.send_close(code, reason).await {
            warn!(connection = %self.shared.id, error = %err, "close frame write failed");
        }
        Ok(())
    }

    /// Non-blocking enqueue of a pre-encoded frame onto the send queue.
    ///
    /// This is the Hub's broadcast path: the frame is encoded once and its
    /// bytes shared read-only across every member.
    ///
    /// # Errors
    ///
    /// `Full` when the bounded queue is at capacity (the caller decides
    /// the slow-consumer policy), `Closed` when the connection is gone.
    pub fn try_enqueue_raw(&self, frame: Bytes) -> Result<(), EnqueueError> {
        if !self.shared.lifecycle.is_open() {
            return Err(EnqueueError::Closed);
        }
        self.outbox
            .try_send(Outbound::Raw(frame))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })
    }
}

/// A server-side WebSocket connection.
///
/// Produced by [`WsUpgrader::upgrade`]; owns the receive side. Writing is
/// available here and on any number of [`WsSender`] clones.
///
/// [`WsUpgrader::upgrade`]: crate::upgrade::WsUpgrader::upgrade
pub struct WsConn {
    sender: WsSender,
    incoming: mpsc::Receiver<Message>,
    subprotocol: Option<String>,
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

impl WsConn {
    pub(crate) fn spawn(
        io: Box<dyn RawIo>,
        buffered: Bytes,
        subprotocol: Option<String>,
        config: &UpgradeConfig,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);

        let shared = Arc::new(ConnShared {
            id: ConnectionId::generate(),
            lifecycle: Lifecycle::new(),
            writer: Mutex::new(WriteEnd {
                io: write_half,
                buf: BytesMut::with_capacity(config.write_buffer_size.max(64)),
            }),
            write_deadline: config.write_deadline,
            epoch: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            close_sent: AtomicBool::new(false),
            terminal: StdMutex::new(None),
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let (outbox_tx, outbox_rx) = mpsc::channel(config.send_queue_size.max(1));

        let mut read_buf = BytesMut::with_capacity(config.read_buffer_size.max(64));
        read_buf.extend_from_slice(&buffered);

        let reader = ReaderTask {
            shared: shared.clone(),
            read_half,
            buf: read_buf,
            decode_cfg: DecodeConfig {
                max_payload_len: config.max_message_size,
                require_mask: true,
            },
            read_deadline: config.read_deadline,
            max_message_size: config.max_message_size,
            incoming_tx,
            assembling: None,
        };
        tokio::spawn(reader.run());
        tokio::spawn(run_writer(shared.clone(), outbox_rx));
        if !config.ping_interval.is_zero() {
            tokio::spawn(run_keepalive(
                shared.clone(),
                config.ping_interval,
                config.pong_wait,
            ));
        }

        Self {
            sender: WsSender {
                shared,
                outbox: outbox_tx,
            },
            incoming: incoming_rx,
            subprotocol,
        }
    }

    /// Receive the next application message, reassembled from its
    /// fragments. Control frames never surface here.
    ///
    /// # Errors
    ///
    /// The failure that ended the connection (`Protocol`, `Io` or
    /// `Timeout`) exactly once, then `Closed` forever after. A clean
    /// close handshake, a peer disconnect, or a prior local `close` all
    /// report `Closed` directly.
    pub async fn read(&mut self) -> Result<Message, ConnError> {
        if !self.sender.shared.lifecycle.is_open() {
            return Err(self
                .sender
                .shared
                .take_terminal()
                .unwrap_or(ConnError::Closed));
        }
        match self.incoming.recv().await {
            Some(message) => Ok(message),
            None => Err(self
                .sender
                .shared
                .take_terminal()
                .unwrap_or(ConnError::Closed)),
        }
    }

    /// See [`WsSender::write`].
    ///
    /// # Errors
    ///
    /// See [`WsSender::write`].
    pub async fn write(
        &self,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<(), ConnError> {
        self.sender.write(kind, payload).await
    }

    /// See [`WsSender::ping`].
    ///
    /// # Errors
    ///
    /// See [`WsSender::ping`].
    pub async fn ping(&self) -> Result<(), ConnError> {
        self.sender.ping().await
    }

    /// See [`WsSender::pong`].
    ///
    /// # Errors
    ///
    /// See [`WsSender::pong`].
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<(), ConnError> {
        self.sender.pong(data).await
    }

    /// See [`WsSender::close`].
    ///
    /// # Errors
    ///
    /// See [`WsSender::close`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), ConnError> {
        self.sender.close(code, reason).await
    }

    /// Resolves when the connection reaches `Closed`.
    pub async fn done(&self) {
        self.sender.done().await;
    }

    /// Whether the connection is still `Open`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    /// The connection's stable identity.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.sender.id()
    }

    /// The subprotocol negotiated during the handshake, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// A cloneable write/control handle.
    #[must_use]
    pub fn sender(&self) -> WsSender {
        self.sender.clone()
    }
}

impl Drop for WsConn {
    fn drop(&mut self) {
        // Abandoned without a handshake: let the reader drain and tear
        // down. The Drop cannot await, so the close frame is skipped.
        if self.sender.shared.lifecycle.begin_close() {
            debug!(connection = %self.sender.shared.id, "connection dropped while open");
        }
    }
}

enum Exit {
    /// Close handshake completed (either side initiated).
    CleanClose,
    /// Peer went away without a Close frame.
    PeerGone,
    /// Local close never got its reply within the drain window, or the
    /// application dropped the connection.
    Stopped,
    /// Protocol, I/O or deadline failure.
    Fault(ConnError),
}

struct ReaderTask {
    shared: Arc<ConnShared>,
    read_half: ReadHalf<Box<dyn RawIo>>,
    buf: BytesMut,
    decode_cfg: DecodeConfig,
    read_deadline: Duration,
    max_message_size: usize,
    incoming_tx: mpsc::Sender<Message>,
    /// Kind and accumulated payload of the message being reassembled.
    assembling: Option<(MessageKind, BytesMut)>,
}

impl ReaderTask {
    async fn run(mut self) {
        let mut closing_rx = self.shared.lifecycle.subscribe_states();
        let exit = self.read_loop(&mut closing_rx).await;

        match exit {
            Exit::CleanClose => {
                debug!(connection = %self.shared.id, "close handshake complete");
            }
            Exit::PeerGone => {
                debug!(connection = %self.shared.id, "peer disconnected");
                self.shared.lifecycle.begin_close();
            }
            Exit::Stopped => {
                self.shared.lifecycle.begin_close();
            }
            Exit::Fault(err) => {
                // Record before the state flips so a racing `read` sees
                // the cause, not a bare Closed.
                let close_frame = match &err {
                    ConnError::Protocol(violation) => {
                        warn!(connection = %self.shared.id, error = %violation, "protocol violation");
                        Some((violation.close_code(), violation.to_string()))
                    }
                    other => {
                        warn!(connection = %self.shared.id, error = %other, "connection failed");
                        None
                    }
                };
                self.shared.record_terminal(err);
                self.shared.lifecycle.begin_close();
                if let Some((code, reason)) = close_frame {
                    let _ = self.shared.send_close(code, &reason).await;
                }
            }
        }

        self.shared.finalize().await;
    }

    async fn read_loop(&mut self, closing_rx: &mut watch::Receiver<u8>) -> Exit {
        let mut drain_deadline: Option<Instant> = None;

        loop {
            // Drain every complete frame already buffered.
            loop {
                match codec::decode_from(&mut self.buf, &self.decode_cfg) {
                    Ok(Some(frame)) => match self.handle_frame(frame).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(exit)) => return exit,
                        Err(err) => return Exit::Fault(err),
                    },
                    Ok(None) => break,
                    Err(err) => return Exit::Fault(ConnError::Protocol(err)),
                }
            }

            // A local close is in flight: bound the wait for the reply.
            if drain_deadline.is_none() && !self.shared.lifecycle.is_open() {
                drain_deadline = Some(Instant::now() + DRAIN_TIMEOUT);
            }
            let drain_at = drain_deadline
                .unwrap_or_else(|| Instant::now() + DRAIN_TIMEOUT);

            let read_deadline = self.read_deadline;
            let read = async {
                if read_deadline.is_zero() {
                    self.read_half.read_buf(&mut self.buf).await.map_err(ConnError::Io)
                } else {
                    match time::timeout(read_deadline, self.read_half.read_buf(&mut self.buf))
                        .await
                    {
                        Ok(result) => result.map_err(ConnError::Io),
                        Err(_) => Err(ConnError::Timeout),
                    }
                }
            };

            tokio::select! {
                result = read => match result {
                    Ok(0) => return Exit::PeerGone,
                    Ok(_) => {}
                    Err(err) => return Exit::Fault(err),
                },
                _ = closing_rx.changed(), if drain_deadline.is_none() => {}
                _ = time::sleep_until(drain_at), if drain_deadline.is_some() => {
                    return Exit::Stopped;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<ControlFlow<Exit>, ConnError> {
        match frame.opcode {
            Opcode::Ping => {
                trace!(connection = %self.shared.id, len = frame.payload.len(), "ping");
                self.shared.write_frame(Opcode::Pong, &frame.payload).await?;
                Ok(ControlFlow::Continue(()))
            }
            Opcode::Pong => {
                trace!(connection = %self.shared.id, "pong");
                self.shared.note_pong();
                Ok(ControlFlow::Continue(()))
            }
            Opcode::Close => {
                let parsed = codec::decode_close(&frame.payload)?;
                let mirrored = parsed
                    .as_ref()
                    .map_or(CloseCode::NORMAL, |(code, _)| *code);
                debug!(connection = %self.shared.id, code = %mirrored, "peer close");
                self.shared.lifecycle.begin_close();
                let _ = self.shared.send_close(mirrored, "").await;
                Ok(ControlFlow::Break(Exit::CleanClose))
            }
            Opcode::Text | Opcode::Binary => {
                if self.assembling.is_some() {
                    return Err(ProtocolError::InvalidContinuation.into());
                }
                let kind = if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                if frame.fin {
                    self.finish_message(kind, frame.payload).await
                } else {
                    self.assembling = Some((kind, BytesMut::from(&frame.payload[..])));
                    Ok(ControlFlow::Continue(()))
                }
            }
            Opcode::Continuation => {
                let Some((_, accumulated)) = self.assembling.as_mut() else {
                    return Err(ProtocolError::InvalidContinuation.into());
                };
                let total = accumulated.len() + frame.payload.len();
                if total > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge(total as u64).into());
                }
                accumulated.extend_from_slice(&frame.payload);
                if frame.fin {
                    let (kind, accumulated) = self.assembling.take().expect("open message");
                    self.finish_message(kind, accumulated.freeze()).await
                } else {
                    Ok(ControlFlow::Continue(()))
                }
            }
        }
    }

    async fn finish_message(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
    ) -> Result<ControlFlow<Exit>, ConnError> {
        if kind == MessageKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(ProtocolError::InvalidUtf8.into());
        }
        if !self.shared.lifecycle.is_open() {
            // Data arriving after a close was initiated is dropped.
            return Ok(ControlFlow::Continue(()));
        }

        let message = Message { kind, payload };
        tokio::select! {
            sent = self.incoming_tx.send(message) => {
                if sent.is_err() {
                    // Application dropped the connection.
                    return Ok(ControlFlow::Break(Exit::Stopped));
                }
            }
            _ = self.shared.lifecycle.wait_closing() => {}
        }
        Ok(ControlFlow::Continue(()))
    }
}

async fn run_writer(shared: Arc<ConnShared>, mut outbox: mpsc::Receiver<Outbound>) {
    loop {
        tokio::select! {
            maybe_out = outbox.recv() => {
                let Some(out) = maybe_out else { break };
                let result = match out {
                    Outbound::Message { opcode, payload } => {
                        shared.write_frame(opcode, &payload).await
                    }
                    Outbound::Raw(frame) => shared.write_raw(&frame).await,
                };
                if let Err(err) = result {
                    warn!(connection = %shared.id, error = %err, "write failed");
                    shared.record_terminal(err);
                    shared.lifecycle.begin_close();
                    break;
                }
            }
            _ = shared.lifecycle.wait_closing() => break,
        }
    }
}

async fn run_keepalive(shared: Arc<ConnShared>, ping_interval: Duration, pong_wait: Duration) {
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let pong_deadline = shared.last_pong_at() + pong_wait;
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = shared.write_frame(Opcode::Ping, b"").await {
                    warn!(connection = %shared.id, error = %err, "keepalive ping failed");
                    shared.record_terminal(err);
                    shared.lifecycle.begin_close();
                    break;
                }
            }
            _ = time::sleep_until(pong_deadline), if !pong_wait.is_zero() => {
                warn!(connection = %shared.id, "pong wait exceeded");
                shared.record_terminal(ConnError::Timeout);
                if shared.lifecycle.begin_close() {
                    let _ = shared
                        .send_close(CloseCode::INTERNAL_ERROR, "keepalive timeout")
                        .await;
                }
                break;
            }
            _ = shared.lifecycle.wait_closing() => break,
        }
    }
}
