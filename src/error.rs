//! Error handling module
//!
//! Defines the error taxonomy for the sync server. Each layer has its own
//! enum; `SyncError` ties them together so `?` works across layers.

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the sync server
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport and connection errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Framing errors (incomplete or corrupt frames)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload bytes that do not match their declared type
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Dispatch and registration errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Session validation errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Game state errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Whether this is a framing error caused by a frame that has not fully arrived yet
    pub fn is_truncated(&self) -> bool {
        matches!(self, SyncError::Protocol(ProtocolError::Truncated { .. }))
    }
}

/// Network-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request '{command}' timed out after {timeout_ms}ms")]
    RequestTimeout { command: String, timeout_ms: u64 },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated frame: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid length field: {0}")]
    InvalidLength(i64),

    #[error("Invalid string encoding")]
    InvalidStringEncoding,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Payload codec errors, carrying the context needed to reproduce them offline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {type_name}: {message}")]
    Encode { type_name: String, message: String },

    #[error("Failed to decode {type_name} (frame {frame_len} bytes, payload {payload_len} bytes): {message}")]
    Decode {
        type_name: String,
        frame_len: usize,
        payload_len: usize,
        message: String,
    },
}

/// Dispatch and registration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Handler already registered for command: {0}")]
    DuplicateHandler(String),

    #[error("Payload type already registered: {0}")]
    DuplicateType(String),
}

/// Session validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Session missing")]
    SessionMissing,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid session token: {0}")]
    InvalidToken(String),
}

/// Game state errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GameError {
    #[error("Character {character_id} is not owned by user {user_id}")]
    CharacterNotOwned { character_id: Uuid, user_id: Uuid },

    #[error("Field index {index} out of range (entity has {count} fields)")]
    InvalidField { index: usize, count: usize },

    #[error("Field {index} expects a {expected} value")]
    FieldTypeMismatch { index: usize, expected: &'static str },

    #[error("Delta mask marks {mask_bits} fields but carries {values} values")]
    DeltaLengthMismatch { mask_bits: usize, values: usize },

    #[error("Unexpected payload {payload_type} for command {command}")]
    UnexpectedPayload { command: String, payload_type: String },
}

/// Result type alias for sync server operations
pub type Result<T> = std::result::Result<T, SyncError>;
