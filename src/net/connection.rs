//! Connection abstraction
//!
//! A [`Connection`] is what handlers talk to: correlated request/reply,
//! fire-and-forget push and keep-alive over whichever transport carries it.
//!
//! Outbound frames go through one ordered queue drained by a single writer
//! task, so pushes and replies leave in the order they were issued. Pending
//! requests live in a table keyed by correlation id; closing the connection
//! fails every one of them with [`NetworkError::ConnectionClosed`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{NetworkError, Result, SyncError};
use crate::net::transport::TransportKind;
use crate::protocol::frame::PacketCodec;
use crate::protocol::packet::{CorrelationId, Packet, Payload};

/// Unique connection identifier
pub type ConnectionId = u64;

/// Command id of the stream keep-alive frame
pub const KEEP_ALIVE_COMMAND: &str = "keep_alive";

type PendingReply = oneshot::Sender<std::result::Result<Packet, NetworkError>>;

/// Connection state in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport open, no session presented yet
    Connected,
    /// A session token resolving to a known user was presented
    Authenticated,
    /// Torn down; nothing more is sent
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::Authenticated => "Authenticated",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Item on the outbound queue
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Bytes),
    /// Liveness check; carries the frame to send on stream transports
    KeepAlive(Bytes),
}

/// Receiving end of a connection's outbound queue, owned by the writer task
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

/// Per-connection tuning
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Default wait for a reply to `send_request`
    pub request_timeout: Duration,
    /// Outbound queue capacity
    pub queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// A logical persistent channel to one game client
pub struct Connection {
    id: ConnectionId,
    address: SocketAddr,
    kind: TransportKind,
    codec: Arc<PacketCodec>,
    outbound_tx: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<CorrelationId, PendingReply>>,
    state: RwLock<ConnectionState>,
    session_token: RwLock<Option<String>>,
    user_id: RwLock<Option<Uuid>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    request_timeout: Duration,
    created_at: Instant,
    last_activity: RwLock<Instant>,
}

impl Connection {
    /// Create a connection and the queue its writer task drains
    pub fn new(
        id: ConnectionId,
        address: SocketAddr,
        kind: TransportKind,
        codec: Arc<PacketCodec>,
        options: ConnectionOptions,
    ) -> (Arc<Self>, OutboundQueue) {
        let (outbound_tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        let now = Instant::now();
        let connection = Arc::new(Self {
            id,
            address,
            kind,
            codec,
            outbound_tx,
            pending: Mutex::new(HashMap::new()),
            state: RwLock::new(ConnectionState::Connected),
            session_token: RwLock::new(None),
            user_id: RwLock::new(None),
            closed: AtomicBool::new(false),
            closed_tx,
            request_timeout: options.request_timeout,
            created_at: now,
            last_activity: RwLock::new(now),
        });
        (connection, OutboundQueue { rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Get the IP address as a string (without port)
    pub fn ip(&self) -> String {
        self.address.ip().to_string()
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!(
                connection_id = self.id,
                old_state = %old_state,
                new_state = %new_state,
                "Connection state changed"
            );
        }
    }

    /// Session token presented on this connection, if any
    pub fn session_token(&self) -> Option<String> {
        self.session_token.read().clone()
    }

    /// Record the presented session token and the user it belongs to
    pub fn authenticate(&self, token: String, user_id: Uuid) {
        *self.session_token.write() = Some(token);
        *self.user_id.write() = Some(user_id);
        if !self.is_closed() {
            self.set_state(ConnectionState::Authenticated);
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        *self.user_id.read()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Check if the connection has been idle too long
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_duration() > max_idle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a request and wait for its reply using the default timeout
    pub async fn send_request(&self, id: &str, payload: impl Into<Payload>) -> Result<Packet> {
        self.send_request_timeout(id, payload, self.request_timeout).await
    }

    /// Send a request and wait up to `timeout` for the reply with its correlation id
    pub async fn send_request_timeout(
        &self,
        id: &str,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> Result<Packet> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }

        let correlation_id = CorrelationId::new();
        let packet = Packet::new(id, payload).with_correlation_id(correlation_id);
        let frame = self.codec.encode(&packet)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        // A close that raced the insert has already drained the table
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }

        // A full outbound queue counts against the same deadline as the reply
        let exchange = async {
            self.enqueue(Outbound::Frame(frame)).await?;
            match rx.await {
                Ok(reply) => reply.map_err(SyncError::from),
                Err(_) => Err(NetworkError::ConnectionClosed.into()),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    connection_id = self.id,
                    command = id,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(NetworkError::RequestTimeout {
                    command: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Send a reply carrying the request's correlation id
    pub async fn reply(&self, correlation_id: CorrelationId, id: &str, payload: impl Into<Payload>) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        let packet = Packet::new(id, payload).with_correlation_id(correlation_id);
        let frame = self.codec.encode(&packet)?;
        self.enqueue(Outbound::Frame(frame)).await
    }

    /// Fire-and-forget send; false if the connection is closed or its queue is full
    pub fn push(&self, id: &str, payload: impl Into<Payload>) -> bool {
        if self.is_closed() {
            return false;
        }
        let packet = Packet::new(id, payload);
        match self.codec.encode(&packet) {
            Ok(frame) => self.try_enqueue(Outbound::Frame(frame)),
            Err(e) => {
                warn!(connection_id = self.id, command = id, error = %e, "Failed to encode push");
                false
            }
        }
    }

    /// Queue a liveness check
    pub fn keep_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.codec.encode(&Packet::new(KEEP_ALIVE_COMMAND, ())) {
            Ok(frame) => self.try_enqueue(Outbound::KeepAlive(frame)),
            Err(_) => false,
        }
    }

    /// Hand an inbound packet to the request waiting for it
    ///
    /// Returns the packet back when no pending request matches, so the caller
    /// can dispatch it instead.
    pub fn complete_request(&self, packet: Packet) -> Option<Packet> {
        let Some(correlation_id) = packet.correlation_id else {
            return Some(packet);
        };
        let Some(tx) = self.pending.lock().remove(&correlation_id) else {
            return Some(packet);
        };
        // The waiter may have timed out between the lookup and now
        let _ = tx.send(Ok(packet));
        None
    }

    /// Tear the connection down, failing every pending request
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            debug!(
                connection_id = self.id,
                pending = pending.len(),
                "Failing pending requests on close"
            );
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(NetworkError::ConnectionClosed));
        }

        self.set_state(ConnectionState::Closed);
        self.closed_tx.send_replace(true);
    }

    async fn enqueue(&self, item: Outbound) -> Result<()> {
        self.outbound_tx
            .send(item)
            .await
            .map_err(|_| SyncError::Network(NetworkError::ConnectionClosed))
    }

    fn try_enqueue(&self, item: Outbound) -> bool {
        match self.outbound_tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = self.id, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Removes a request's pending entry when the request finishes or is cancelled
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<CorrelationId, PendingReply>>,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.correlation_id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .field("pending", &self.pending_requests())
            .finish()
    }
}
