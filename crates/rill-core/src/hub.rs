//! The Hub: a single-writer broadcast scheduler.
//!
//! One task owns the member map outright and is the only reader of the
//! Hub's inbound channels, so no lock ever guards membership: every
//! mutation is serialized through the actor's queues. Broadcast payloads
//! are encoded to their final frame bytes exactly once and the refcounted
//! buffer is shared read-only across every member's send queue.
//!
//! A member whose bounded send queue is full when a broadcast arrives is
//! a slow consumer: it is unregistered on the spot and closed with 1008,
//! so one stalled peer can never hold up the fleet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use rill_protocol::{codec, CloseCode, Opcode};
use rill_transport::{ConnectionId, EnqueueError, WsSender};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Hub failures.
#[derive(Debug, Error)]
pub enum HubError {
    /// The Hub has been shut down; registrations and broadcasts are over.
    #[error("hub is closed")]
    Closed,

    /// `broadcast_json` could not serialize the value.
    #[error("broadcast encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Channel capacities.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the registration queue.
    pub register_capacity: usize,
    /// Capacity of the unregistration queue.
    pub unregister_capacity: usize,
    /// Capacity of the broadcast queue.
    pub broadcast_capacity: usize,
    /// Capacity of the shutdown queue.
    pub shutdown_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_capacity: 16,
            unregister_capacity: 16,
            broadcast_capacity: 256,
            shutdown_capacity: 1,
        }
    }
}

/// Handle to a running Hub.
///
/// Membership is a weak relation: the Hub holds only each connection's
/// [`WsSender`], never the connection itself, and drops the handle the
/// moment a member is unregistered or turns out to be closed.
pub struct Hub {
    register_tx: mpsc::Sender<WsSender>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Bytes>,
    shutdown_tx: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
    member_count: Arc<AtomicUsize>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Start a Hub with the given channel capacities.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let (register_tx, register_rx) = mpsc::channel(config.register_capacity.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(config.unregister_capacity.max(1));
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(config.shutdown_capacity.max(1));

        let member_count = Arc::new(AtomicUsize::new(0));
        let actor = HubTask {
            members: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown_rx,
            member_count: member_count.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            shutdown_tx,
            closed: Arc::new(AtomicBool::new(false)),
            member_count,
            task: StdMutex::new(Some(task)),
        }
    }

    /// Add a connection to the member set.
    ///
    /// Returns the membership token used to request unregistration.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close).
    pub async fn register(&self, sender: WsSender) -> Result<ConnectionId, HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        let id = sender.id().clone();
        self.register_tx
            .send(sender)
            .await
            .map_err(|_| HubError::Closed)?;
        Ok(id)
    }

    /// Remove a member. Idempotent: unknown or already-removed tokens are
    /// fine, and so is racing the Hub's own shutdown (which drains this
    /// queue before closing members).
    pub async fn unregister(&self, id: &ConnectionId) {
        let _ = self.unregister_tx.send(id.clone()).await;
    }

    /// Broadcast a Text message to every member.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close).
    pub async fn broadcast_text(&self, text: impl AsRef<str>) -> Result<(), HubError> {
        self.dispatch(encode_data_frame(Opcode::Text, text.as_ref().as_bytes()))
            .await
    }

    /// Broadcast a Binary message to every member.
    ///
    /// # Errors
    ///
    /// `Closed` after [`close`](Self::close).
    pub async fn broadcast_binary(&self, data: impl AsRef<[u8]>) -> Result<(), HubError> {
        self.dispatch(encode_data_frame(Opcode::Binary, data.as_ref()))
            .await
    }

    /// Serialize `value` to JSON once and broadcast it as a Text message.
    ///
    /// # Errors
    ///
    /// `Json` when serialization fails, `Closed` after
    /// [`close`](Self::close).
    pub async fn broadcast_json<T: Serialize>(&self, value: &T) -> Result<(), HubError> {
        let json = serde_json::to_vec(value)?;
        self.dispatch(encode_data_frame(Opcode::Text, &json)).await
    }

    async fn dispatch(&self, frame: Bytes) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        self.broadcast_tx
            .send(frame)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Current size of the member set.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.member_count.load(Ordering::SeqCst)
    }

    /// Shut the Hub down: pending unregistrations are drained, every
    /// remaining member is closed with 1001 ("going away"), and the actor
    /// task returns. Idempotent; resolves once the actor has finished.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // A full queue means shutdown is already signaled.
        let _ = self.shutdown_tx.try_send(());

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// One encode per broadcast; members share the resulting buffer.
fn encode_data_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    codec::encode_frame(opcode, payload, true, None)
        .expect("data frames are exempt from the control-frame size limit")
}

struct HubTask {
    members: HashMap<ConnectionId, WsSender>,
    register_rx: mpsc::Receiver<WsSender>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<Bytes>,
    shutdown_rx: mpsc::Receiver<()>,
    member_count: Arc<AtomicUsize>,
}

impl HubTask {
    async fn run(mut self) {
        debug!("hub started");
        loop {
            tokio::select! {
                biased;

                Some(()) = self.shutdown_rx.recv() => {
                    self.shutdown().await;
                    return;
                }
                Some(id) = self.unregister_rx.recv() => {
                    self.remove(&id);
                }
                Some(sender) = self.register_rx.recv() => {
                    self.insert(sender);
                }
                Some(frame) = self.broadcast_rx.recv() => {
                    self.fan_out(frame);
                }
                // Every handle dropped without an explicit close.
                else => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    fn insert(&mut self, sender: WsSender) {
        debug!(connection = %sender.id(), "member registered");
        self.members.insert(sender.id().clone(), sender);
        self.publish_count();
    }

    fn remove(&mut self, id: &ConnectionId) {
        if self.members.remove(id).is_some() {
            debug!(connection = %id, "member unregistered");
        }
        self.publish_count();
    }

    /// Deliver one pre-encoded frame to every member.
    ///
    /// Enqueueing is strictly non-blocking: a full queue marks the member
    /// a slow consumer, which is evicted and closed with 1008 before this
    /// dispatch returns; a closed member is dropped quietly.
    fn fan_out(&mut self, frame: Bytes) {
        let mut evicted: Vec<ConnectionId> = Vec::new();

        for (id, sender) in &self.members {
            match sender.try_enqueue_raw(frame.clone()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    warn!(connection = %id, "slow consumer evicted");
                    let sender = sender.clone();
                    // The close frame must not ride the broadcast path:
                    // the slow peer's stream is exactly what is stalled.
                    tokio::spawn(async move {
                        let _ = sender
                            .close(CloseCode::POLICY_VIOLATION, "policy violation: slow consumer")
                            .await;
                    });
                    evicted.push(id.clone());
                }
                Err(EnqueueError::Closed) => {
                    trace!(connection = %id, "dropping closed member");
                    evicted.push(id.clone());
                }
            }
        }

        for id in &evicted {
            self.members.remove(id);
        }
        if !evicted.is_empty() {
            self.publish_count();
        }
    }

    async fn shutdown(&mut self) {
        debug!(members = self.members.len(), "hub shutting down");

        while let Ok(id) = self.unregister_rx.try_recv() {
            self.members.remove(&id);
        }

        for (id, sender) in self.members.drain() {
            trace!(connection = %id, "closing member");
            let _ = sender.close(CloseCode::GOING_AWAY, "going away").await;
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        self.member_count.store(self.members.len(), Ordering::SeqCst);
    }
}
