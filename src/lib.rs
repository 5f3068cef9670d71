//! IdleSync Server Library
//!
//! This library provides the sync protocol core of the IdleSync server: the
//! packet envelope and its codecs, connection handling, command dispatch,
//! delta synchronization of character state and the timeout scheduler.
//!
//! ## Modules
//!
//! - `auth` - Session token validation
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Character state, the game-state store and delta sync
//! - `kernel` - Timeout scheduler driving deferred and periodic work
//! - `net` - Transports, connections and session management
//! - `protocol` - Packet envelope, type registry, framing and dispatch

pub mod auth;
pub mod config;
pub mod error;
pub mod game;
pub mod kernel;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{Result, SyncError};
pub use kernel::Kernel;
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
