//! # rill-transport
//!
//! The connection layer of the rill realtime transport cores: HTTP
//! upgrades, the hijacked-stream lifecycle, and the two connection
//! flavors.
//!
//! ```text
//! ┌──────────────┐  validate   ┌────────────┐   hijack    ┌──────────┐
//! │ RequestHead  │────────────▶│  Upgrader  │────────────▶│   Conn   │
//! └──────────────┘             └────────────┘             └──────────┘
//!    (from host)               WsUpgrader /               WsConn /
//!                              SseUpgrader                SseConn
//! ```
//!
//! The only assumptions made of the host HTTP server are captured by the
//! [`Hijack`] trait: a parsed request head, a raw stream once validation
//! passes, and (for SSE) a flush primitive. Refused upgrades never touch
//! the stream; [`HandshakeError::status`] tells the host what to answer.
//!
//! Both connection flavors share one lifecycle: `Open -> Closing ->
//! Closed`, with `Closed` terminal, every public operation failing with
//! [`ConnError::Closed`] afterwards, and a `done` signal that fires
//! exactly once.

pub mod conn;
pub mod error;
pub mod io;
pub mod sse;
pub mod upgrade;
pub mod ws;

pub use conn::{ConnectionId, Message, MessageKind};
pub use error::{ConnError, HandshakeError};
pub use io::{Hijack, Hijacked, RawIo, RequestHead, StreamHijack};
pub use sse::{SseConfig, SseConn, SseUpgrader};
pub use upgrade::{OriginPredicate, UpgradeConfig, WsUpgrader};
pub use ws::{EnqueueError, WsConn, WsSender};
