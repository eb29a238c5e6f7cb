//! Connection identity, message types, and the shared lifecycle machine.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rill_protocol::Opcode;
use tokio::sync::watch;

/// Monotonic tail for connection ids minted in the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stable identity for a connection.
///
/// Ids are how the Hub addresses members; equality and hashing are the only
/// guarantees, the textual form is for logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Mint a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of WebSocket messages.
///
/// Applications read and write `Text` and `Binary`; the control kinds are
/// handled inside the connection and never surface from `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl MessageKind {
    pub(crate) fn opcode(self) -> Opcode {
        match self {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
            MessageKind::Ping => Opcode::Ping,
            MessageKind::Pong => Opcode::Pong,
            MessageKind::Close => Opcode::Close,
        }
    }
}

/// A complete application message, reassembled from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text` or `Binary`.
    pub kind: MessageKind,
    /// The full payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into(),
        }
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// The payload as text. `None` for binary messages.
    ///
    /// Text payloads were UTF-8 validated on receipt.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// The `Open -> Closing -> Closed` machine shared by both connection
/// flavors.
///
/// Transitions are compare-and-set: exactly one caller wins each edge, so
/// teardown runs once and the `done` signal fires once. State changes are
/// also published on a watch channel so tasks can park on them.
pub(crate) struct Lifecycle {
    state: AtomicU8,
    tx: watch::Sender<u8>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(OPEN);
        Self {
            state: AtomicU8::new(OPEN),
            tx,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OPEN
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    /// `Open -> Closing`. Returns whether this call won the transition.
    pub(crate) fn begin_close(&self) -> bool {
        let won = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            // Monotonic publish: never step the watch value backwards past
            // a concurrent finalize.
            self.tx.send_if_modified(|s| {
                if *s < CLOSING {
                    *s = CLOSING;
                    true
                } else {
                    false
                }
            });
        }
        won
    }

    /// `* -> Closed`. Returns whether this call won the transition.
    pub(crate) fn finalize(&self) -> bool {
        let won = self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED;
        if won {
            self.tx.send_replace(CLOSED);
        }
        won
    }

    /// A receiver over raw state values, for tasks that park in `select!`
    /// loops.
    pub(crate) fn subscribe_states(&self) -> watch::Receiver<u8> {
        self.tx.subscribe()
    }

    /// Resolves once the connection leaves `Open`.
    pub(crate) async fn wait_closing(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s >= CLOSING).await;
    }

    /// Resolves once the connection reaches `Closed`.
    pub(crate) async fn wait_closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s == CLOSED).await;
    }
}
