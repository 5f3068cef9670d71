//! Networking module
//!
//! This module handles all network-related functionality for the IdleSync server:
//! - TCP socket handling for native clients
//! - WebSocket handling for browser clients
//! - Connections with request/reply correlation and an ordered outbound queue
//! - Session management
//! - Connection lifecycle

pub mod buffer;
pub mod connection;
pub mod handler;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionId, ConnectionOptions};
pub use session::SessionManager;
pub use transport::TransportKind;
