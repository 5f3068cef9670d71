//! Packet envelope
//!
//! A packet is a command id, the wire type name of its payload, the payload
//! itself and an optional correlation id pairing a reply with its request.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub use crate::protocol::messages::Payload;

/// Length of a correlation id on the wire
pub const CORRELATION_ID_LEN: usize = 16;

/// Token pairing a reply with the request that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse from a wire slice, which must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        self.0.as_bytes()
    }

    /// The all-zero id is treated as "no correlation" on decode
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A payload type with a registered wire name
pub trait PayloadType: Serialize + DeserializeOwned + Into<Payload> + Send + Sync + 'static {
    /// Name written in the frame's type field
    const TYPE_NAME: &'static str;

    /// Borrow this type out of a decoded payload
    fn from_payload(payload: &Payload) -> Option<&Self>;
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Command id, selects the handler
    pub id: String,
    /// Wire type name of the payload
    pub type_name: String,
    pub payload: Payload,
    pub correlation_id: Option<CorrelationId>,
}

impl Packet {
    /// Create a push packet; the type name is taken from the payload
    pub fn new(id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            id: id.into(),
            type_name: payload.type_name().unwrap_or_default().to_string(),
            payload,
            correlation_id: None,
        }
    }

    /// Create a packet carrying an unresolved payload under an explicit type name
    pub fn raw(id: impl Into<String>, type_name: impl Into<String>, data: impl Into<bytes::Bytes>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            payload: Payload::Raw(data.into()),
            correlation_id: None,
        }
    }

    /// Wrap several packets into one `collection` envelope
    pub fn collection(packets: Vec<Packet>) -> Self {
        Self::new(crate::protocol::dispatch::COLLECTION_COMMAND, packets)
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Whether the sender expects a reply
    pub fn expects_reply(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Borrow the payload as a concrete type
    pub fn payload_as<T: PayloadType>(&self) -> Option<&T> {
        T::from_payload(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::AuthToken;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_packet_takes_type_name_from_payload() {
        let packet = Packet::new(
            "authenticate",
            AuthToken {
                token: "abc".to_string(),
            },
        );
        assert_eq!(packet.type_name, "AuthToken");
        assert!(!packet.expects_reply());
        assert_eq!(packet.payload_as::<AuthToken>().unwrap().token, "abc");
        assert!(packet.payload_as::<bool>().is_none());
    }

    #[test]
    fn test_empty_and_raw_packets() {
        let packet = Packet::new("keep_alive", ());
        assert_eq!(packet.type_name, "");
        assert_eq!(packet.payload, Payload::Empty);

        let packet = Packet::raw("mystery", "FutureType", vec![1u8, 2, 3]);
        assert_eq!(packet.type_name, "FutureType");
        assert_eq!(packet.payload, Payload::Raw(bytes::Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn test_correlation_id_bytes() {
        let id = CorrelationId::new();
        assert!(!id.is_nil());
        assert_eq!(CorrelationId::from_slice(id.as_bytes()), Some(id));
        assert_eq!(CorrelationId::from_slice(&[0u8; 4]), None);
        assert_ne!(CorrelationId::new(), id);
    }

    #[test]
    fn test_with_correlation_id() {
        let id = CorrelationId::new();
        let packet = Packet::new("sync_time", true).with_correlation_id(id);
        assert!(packet.expects_reply());
        assert_eq!(packet.correlation_id, Some(id));
        assert_eq!(packet.type_name, "Boolean");
    }
}
