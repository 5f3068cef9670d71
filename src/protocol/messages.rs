//! Payload types
//!
//! Every payload that may appear on the wire is listed once in the
//! `payloads!` table below. The table generates the [`Payload`] enum, the
//! [`PayloadType`] impls used for typed access, and the registration function
//! that feeds the type registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::game::character::{CharacterSkills, CharacterState};
use crate::game::sync::delta::EntityDelta;
use crate::protocol::codec::{PayloadCodec, PayloadCodecError};
use crate::protocol::packet::{Packet, PayloadType};
use crate::protocol::registry::TypeRegistryBuilder;

/// Wire type name of a batch of packets
pub const COLLECTION_TYPE: &str = "PacketCollection";

/// Presents a session token on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub token: String,
}

/// Clock exchange between client and server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSync {
    pub server_time: DateTime<Utc>,
    pub client_time: Option<DateTime<Utc>>,
    /// Server time minus client time, when the client supplied one
    pub offset_ms: i64,
}

/// Full runtime state of one character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterStateUpdate {
    pub character_id: Uuid,
    pub state: CharacterState,
}

/// Full skill set of one character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterSkillUpdate {
    pub character_id: Uuid,
    pub skills: CharacterSkills,
}

/// Batch of character state deltas, keyed by character id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterStateDelta {
    pub deltas: Vec<EntityDelta>,
}

/// Batch of character skill deltas, keyed by character id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSkillsDelta {
    pub deltas: Vec<EntityDelta>,
}

/// Aggregate statistics for the streamer's current game session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionStats {
    pub online_characters: u32,
    pub raids_completed: u32,
    pub dungeons_completed: u32,
    pub experience_gained: f64,
    pub play_time_seconds: u64,
}

/// Loyalty activity of a viewer on a streaming platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoyaltyUpdate {
    pub user_id: Uuid,
    pub user_name: String,
    pub platform: String,
    pub platform_id: String,
    pub new_gifted_subs: i32,
    pub new_cheered_bits: i32,
    pub is_moderator: bool,
    pub is_subscriber: bool,
    pub is_vip: bool,
}

macro_rules! payloads {
    ($($variant:ident($ty:ty) => $name:literal,)*) => {
        /// Decoded packet payload
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            /// No payload (empty type name, zero-length data)
            Empty,
            $($variant($ty),)*
            /// Inner packets of a `collection` envelope
            Collection(Vec<Packet>),
            /// Payload whose wire type is not registered, kept as-is
            Raw(Bytes),
        }

        impl Payload {
            /// Wire type name, or `None` for raw payloads which keep the name they arrived with
            pub fn type_name(&self) -> Option<&'static str> {
                match self {
                    Payload::Empty => Some(""),
                    $(Payload::$variant(_) => Some($name),)*
                    Payload::Collection(_) => Some(COLLECTION_TYPE),
                    Payload::Raw(_) => None,
                }
            }

            pub(crate) fn serialize_with(&self, codec: PayloadCodec) -> Result<Vec<u8>, PayloadCodecError> {
                match self {
                    Payload::Empty => Ok(Vec::new()),
                    $(Payload::$variant(value) => codec.serialize(value),)*
                    Payload::Raw(bytes) => Ok(bytes.to_vec()),
                    Payload::Collection(_) => Err(PayloadCodecError::Unsupported(
                        "collections are framed by the packet codec".to_string(),
                    )),
                }
            }
        }

        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }

            impl PayloadType for $ty {
                const TYPE_NAME: &'static str = $name;

                fn from_payload(payload: &Payload) -> Option<&Self> {
                    match payload {
                        Payload::$variant(value) => Some(value),
                        _ => None,
                    }
                }
            }
        )*

        /// Register every built-in payload type
        pub(crate) fn register_payload_types(builder: &mut TypeRegistryBuilder) -> Result<(), DispatchError> {
            $(builder.register::<$ty>()?;)*
            Ok(())
        }
    };
}

payloads! {
    Bool(bool) => "Boolean",
    AuthToken(AuthToken) => "AuthToken",
    TimeSync(TimeSync) => "TimeSync",
    CharacterStateUpdate(CharacterStateUpdate) => "CharacterStateUpdate",
    CharacterSkillUpdate(CharacterSkillUpdate) => "CharacterSkillUpdate",
    CharacterStateDelta(CharacterStateDelta) => "CharacterStateDelta",
    CharacterSkillsDelta(CharacterSkillsDelta) => "CharacterSkillsDelta",
    UserSessionStats(UserSessionStats) => "UserSessionStats",
    UserLoyaltyUpdate(UserLoyaltyUpdate) => "UserLoyaltyUpdate",
}

impl From<Vec<Packet>> for Payload {
    fn from(packets: Vec<Packet>) -> Self {
        Payload::Collection(packets)
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Payload::Empty
    }
}
