//! # rill-core
//!
//! Broadcast scheduling for the rill realtime transport cores.
//!
//! The [`Hub`] fans messages out to a fleet of WebSocket connections:
//!
//! ```text
//! ┌─────────────┐  broadcast  ┌─────────┐  try_enqueue  ┌───────────┐
//! │ application │────────────▶│   Hub   │──────────────▶│ WsSender  │ × N
//! └─────────────┘             └─────────┘               └───────────┘
//!                          (single-writer actor)     (bounded send queue)
//! ```
//!
//! Delivery is at-most-once by design: a member whose send queue is full
//! is unregistered and closed with 1008 rather than allowed to stall the
//! broadcast path.

pub mod hub;

pub use hub::{Hub, HubConfig, HubError};
