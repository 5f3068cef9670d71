//! Session management
//!
//! Tracks every open connection, enforces the per-IP connection limit, and
//! maps authenticated users to the connection they play on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{NetworkError, Result};
use crate::net::connection::{Connection, ConnectionId, ConnectionOptions, OutboundQueue};
use crate::net::transport::TransportKind;
use crate::protocol::frame::PacketCodec;

/// Thread-safe registry of open connections
pub struct SessionManager {
    /// Map of connection ID to connection
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Map of user ID to the connection they authenticated on
    user_to_connection: DashMap<Uuid, ConnectionId>,
    /// Map of IP address to its connection IDs (for connection limiting)
    ip_to_connections: DashMap<String, Vec<ConnectionId>>,
    /// Next connection ID to assign
    next_id: AtomicU64,
    /// Maximum connections per IP
    max_per_ip: usize,
}

impl SessionManager {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            connections: DashMap::new(),
            user_to_connection: DashMap::new(),
            ip_to_connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_per_ip,
        }
    }

    /// Create a connection and register it
    pub fn create_connection(
        &self,
        address: SocketAddr,
        kind: TransportKind,
        codec: Arc<PacketCodec>,
        options: ConnectionOptions,
    ) -> Result<(Arc<Connection>, OutboundQueue)> {
        let ip = address.ip().to_string();

        // Reserve the slot under the entry lock so concurrent accepts cannot overshoot
        let mut slots = self.ip_to_connections.entry(ip.clone()).or_default();
        if slots.len() >= self.max_per_ip {
            warn!(
                ip = %ip,
                count = slots.len(),
                max = self.max_per_ip,
                "Connection limit exceeded for IP"
            );
            return Err(NetworkError::TooManyConnections(ip).into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (connection, queue) = Connection::new(id, address, kind, codec, options);
        slots.push(id);
        drop(slots);
        self.connections.insert(id, Arc::clone(&connection));

        info!(
            connection_id = id,
            address = %address,
            transport = %kind,
            "Connection registered"
        );

        Ok((connection, queue))
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    /// Connection a user authenticated on
    pub fn get_by_user(&self, user_id: Uuid) -> Option<Arc<Connection>> {
        self.user_to_connection
            .get(&user_id)
            .map(|id| *id)
            .and_then(|id| self.get(id))
    }

    /// Bind a user to a connection; a newer connection replaces an older one
    pub fn bind_user(&self, user_id: Uuid, connection_id: ConnectionId) {
        if let Some(previous) = self.user_to_connection.insert(user_id, connection_id) {
            if previous != connection_id {
                debug!(
                    user_id = %user_id,
                    previous_connection = previous,
                    connection_id,
                    "User moved to a new connection"
                );
            }
        }
    }

    /// Unregister a connection, returning it and the user it was bound to
    pub fn remove(&self, id: ConnectionId) -> Option<(Arc<Connection>, Option<Uuid>)> {
        let (_, connection) = self.connections.remove(&id)?;

        let mut bound_user = None;
        if let Some(user_id) = connection.user_id() {
            if self
                .user_to_connection
                .remove_if(&user_id, |_, bound| *bound == id)
                .is_some()
            {
                bound_user = Some(user_id);
            }
        }

        let ip = connection.ip();
        if let Some(mut ids) = self.ip_to_connections.get_mut(&ip) {
            ids.retain(|&cid| cid != id);
        }
        self.ip_to_connections.remove_if(&ip, |_, ids| ids.is_empty());

        info!(
            connection_id = id,
            user_id = ?connection.user_id(),
            "Connection removed"
        );
        Some((connection, bound_user))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of users with a bound connection
    pub fn user_count(&self) -> usize {
        self.user_to_connection.len()
    }

    pub fn connections_from_ip(&self, ip: &str) -> usize {
        self.ip_to_connections.get(ip).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|r| *r.key()).collect()
    }

    /// Users and the open connection each is bound to
    pub fn authenticated_users(&self) -> Vec<(Uuid, Arc<Connection>)> {
        let bindings: Vec<(Uuid, ConnectionId)> = self
            .user_to_connection
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        bindings
            .into_iter()
            .filter_map(|(user_id, id)| self.get(id).map(|connection| (user_id, connection)))
            .filter(|(_, connection)| !connection.is_closed())
            .collect()
    }

    /// Close connections idle longer than `max_idle`
    ///
    /// Closed connections are unregistered by their read loop.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| !c.is_closed() && c.is_idle(max_idle))
            .map(|c| c.value().clone())
            .collect();

        for connection in &idle {
            debug!(
                connection_id = connection.id(),
                idle_duration = ?connection.idle_duration(),
                "Connection idle timeout"
            );
            connection.close();
        }
        idle.len()
    }

    /// Queue a keep-alive on every open connection, returning how many accepted it
    pub fn keep_alive_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        connections.iter().filter(|c| c.keep_alive()).count()
    }

    /// Close every connection, failing their pending requests
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        for connection in connections {
            connection.close();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("connections", &self.connections.len())
            .field("users", &self.user_to_connection.len())
            .field("max_per_ip", &self.max_per_ip)
            .finish()
    }
}
