//! Wire framing
//!
//! Frame layout:
//!
//! ```text
//! [var len]Id (utf8) [var len]Type (utf8) [i32 len][correlation id] [i32 len][payload]
//! ```
//!
//! String lengths use a 7-bit variable-length prefix; int32 fields are
//! little-endian. A correlation id is either absent (length 0) or 16 bytes.
//! The payload section is produced by the deployment's [`PayloadCodec`].

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error};

use crate::error::{CodecError, ProtocolError, Result, SyncError};
use crate::net::buffer::{PacketBuffer, PacketReader};
use crate::protocol::codec::PayloadCodec;
use crate::protocol::messages::{Payload, COLLECTION_TYPE};
use crate::protocol::packet::{CorrelationId, Packet, CORRELATION_ID_LEN};
use crate::protocol::registry::TypeRegistry;

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Number of payload bytes included in codec failure logs
const LOG_PREVIEW_BYTES: usize = 32;

/// Deepest collection nesting accepted from a peer
pub const MAX_COLLECTION_DEPTH: usize = 16;

/// A frame whose envelope has been parsed but whose payload is still bytes
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame<'a> {
    pub id: String,
    pub type_name: String,
    pub correlation_id: Option<CorrelationId>,
    pub payload: &'a [u8],
    /// Total bytes the frame occupies on the wire
    pub frame_len: usize,
}

/// Encodes packets to frames and back; shared by every connection
#[derive(Debug, Clone)]
pub struct PacketCodec {
    payload_codec: PayloadCodec,
    registry: Arc<TypeRegistry>,
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new(payload_codec: PayloadCodec, registry: Arc<TypeRegistry>) -> Self {
        Self {
            payload_codec,
            registry,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn payload_codec(&self) -> PayloadCodec {
        self.payload_codec
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Encode a packet into one frame
    pub fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let payload = self.encode_payload(packet)?;

        let mut buf = PacketBuffer::with_capacity(payload.len() + packet.id.len() + packet.type_name.len() + 32);
        buf.write_string(&packet.id);
        buf.write_string(&packet.type_name);
        match packet.correlation_id {
            Some(correlation_id) => buf.write_len_prefixed(correlation_id.as_bytes()),
            None => buf.write_i32_le(0),
        }
        buf.write_len_prefixed(&payload);

        if buf.len() > self.max_frame_size {
            return Err(ProtocolError::PacketTooLarge {
                size: buf.len(),
                max: self.max_frame_size,
            }
            .into());
        }
        Ok(buf.freeze())
    }

    fn encode_payload(&self, packet: &Packet) -> Result<Vec<u8>> {
        match &packet.payload {
            Payload::Collection(packets) => {
                let mut buf = PacketBuffer::new();
                for inner in packets {
                    buf.write_bytes(&self.encode(inner)?);
                }
                Ok(buf.as_bytes().to_vec())
            }
            payload => payload.serialize_with(self.payload_codec).map_err(|e| {
                SyncError::from(CodecError::Encode {
                    type_name: packet.type_name.clone(),
                    message: e.to_string(),
                })
            }),
        }
    }

    /// Parse the envelope of the frame at the start of `bytes`
    ///
    /// Fails with [`ProtocolError::Truncated`] when the frame has not fully arrived.
    pub fn split_frame<'a>(&self, bytes: &'a [u8]) -> Result<RawFrame<'a>> {
        let mut reader = PacketReader::new(bytes);
        let id = reader.read_string()?;
        let type_name = reader.read_string()?;

        let correlation_len = reader.read_length(self.max_frame_size)?;
        let correlation_id = match correlation_len {
            0 => None,
            CORRELATION_ID_LEN => {
                let raw = reader.read_bytes(CORRELATION_ID_LEN)?;
                CorrelationId::from_slice(raw).filter(|id| !id.is_nil())
            }
            other => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "correlation id must be 0 or {} bytes, got {}",
                    CORRELATION_ID_LEN, other
                ))
                .into())
            }
        };

        let payload_len = reader.read_length(self.max_frame_size)?;
        let payload = reader.read_bytes(payload_len)?;

        Ok(RawFrame {
            id,
            type_name,
            correlation_id,
            payload,
            frame_len: reader.read_position(),
        })
    }

    /// Decode one complete frame
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        let frame = self.split_frame(bytes)?;
        if frame.frame_len != bytes.len() {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} trailing bytes after frame",
                bytes.len() - frame.frame_len
            ))
            .into());
        }
        self.decode_frame(frame)
    }

    /// Resolve and deserialize the payload of a split frame
    pub fn decode_frame(&self, frame: RawFrame<'_>) -> Result<Packet> {
        self.decode_frame_at(frame, 0)
    }

    fn decode_frame_at(&self, frame: RawFrame<'_>, depth: usize) -> Result<Packet> {
        let payload = self.decode_payload(&frame, depth)?;
        Ok(Packet {
            id: frame.id,
            type_name: frame.type_name,
            payload,
            correlation_id: frame.correlation_id,
        })
    }

    fn decode_payload(&self, frame: &RawFrame<'_>, depth: usize) -> Result<Payload> {
        if frame.type_name.is_empty() && frame.payload.is_empty() {
            return Ok(Payload::Empty);
        }

        if frame.type_name == COLLECTION_TYPE {
            return self.decode_collection(frame.payload, depth + 1);
        }

        let Some(descriptor) = self.registry.resolve(&frame.type_name) else {
            debug!(
                command = %frame.id,
                type_name = %frame.type_name,
                payload_len = frame.payload.len(),
                "Unregistered payload type, keeping raw bytes"
            );
            return Ok(Payload::Raw(Bytes::copy_from_slice(frame.payload)));
        };

        descriptor.decode(self.payload_codec, frame.payload).map_err(|e| {
            let preview = &frame.payload[..frame.payload.len().min(LOG_PREVIEW_BYTES)];
            error!(
                command = %frame.id,
                type_name = %frame.type_name,
                frame_len = frame.frame_len,
                payload_len = frame.payload.len(),
                codec = %self.payload_codec,
                payload_preview = ?preview,
                error = %e,
                "Failed to decode packet payload"
            );
            SyncError::from(CodecError::Decode {
                type_name: frame.type_name.clone(),
                frame_len: frame.frame_len,
                payload_len: frame.payload.len(),
                message: e.to_string(),
            })
        })
    }

    fn decode_collection(&self, mut bytes: &[u8], depth: usize) -> Result<Payload> {
        if depth > MAX_COLLECTION_DEPTH {
            return Err(ProtocolError::MalformedPacket(format!(
                "collection nested deeper than {MAX_COLLECTION_DEPTH} levels"
            ))
            .into());
        }
        let mut packets = Vec::new();
        while !bytes.is_empty() {
            let frame = self.split_frame(bytes).map_err(|e| {
                if e.is_truncated() {
                    ProtocolError::MalformedPacket("truncated frame inside collection".to_string()).into()
                } else {
                    e
                }
            })?;
            let consumed = frame.frame_len;
            packets.push(self.decode_frame_at(frame, depth)?);
            bytes = &bytes[consumed..];
        }
        Ok(Payload::Collection(packets))
    }
}

/// Reassembly buffer for frames that arrive across several transport reads
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    received: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            received: 0,
        }
    }

    /// Append a fragment
    pub fn push(&mut self, fragment: &[u8]) {
        self.buffer.extend_from_slice(fragment);
        self.received += fragment.len();
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes received since the last reset
    pub fn received(&self) -> usize {
        self.received
    }

    /// Drop everything buffered
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.received = 0;
    }

    /// Take the next complete packet, if one has fully arrived
    ///
    /// Framing errors other than truncation reset the buffer. Codec errors are
    /// returned after the frame was consumed, so the stream stays aligned.
    pub fn next_packet(&mut self, codec: &PacketCodec) -> Result<Option<Packet>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let split = codec
            .split_frame(&self.buffer)
            .map(|frame| (frame.frame_len, codec.decode_frame(frame)));

        let (frame_len, result) = match split {
            Ok(decoded) => decoded,
            Err(e) if e.is_truncated() => {
                if self.buffer.len() > codec.max_frame_size() {
                    let size = self.buffer.len();
                    self.reset();
                    return Err(ProtocolError::PacketTooLarge {
                        size,
                        max: codec.max_frame_size(),
                    }
                    .into());
                }
                return Ok(None);
            }
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        self.buffer.advance(frame_len);
        if self.buffer.is_empty() {
            self.received = 0;
        }
        result.map(Some)
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::character::{CharacterSkills, CharacterState, Skill};
    use crate::game::sync::delta::{EntityDelta, FieldValue};
    use crate::protocol::messages::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn codec(payload_codec: PayloadCodec) -> PacketCodec {
        PacketCodec::new(payload_codec, Arc::new(TypeRegistry::builtin().unwrap()))
    }

    fn sample_packets() -> Vec<Packet> {
        let character_id = Uuid::new_v4();
        let mut state = CharacterState::default();
        state.health = 42;
        state.island = "Away".to_string();
        let mut skills = CharacterSkills::default();
        skills.set(Skill::Fishing, 30, 13_363.5);

        vec![
            Packet::new("keep_alive", ()),
            Packet::new("authenticate", AuthToken { token: "t0k3n".to_string() })
                .with_correlation_id(CorrelationId::new()),
            Packet::new(
                "sync_time",
                TimeSync {
                    server_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                    client_time: None,
                    offset_ms: 0,
                },
            ),
            Packet::new("update_character_state", CharacterStateUpdate { character_id, state }),
            Packet::new("update_character_skills", CharacterSkillUpdate { character_id, skills }),
            Packet::new(
                "update_character_state",
                CharacterStateDelta {
                    deltas: vec![EntityDelta {
                        entity_id: character_id,
                        mask: 0b11,
                        values: vec![FieldValue::Int(1), FieldValue::Text("Home".to_string())],
                    }],
                },
            ),
            Packet::new("update_character_skills", CharacterSkillsDelta { deltas: Vec::new() }),
            Packet::new(
                "update_user_session_stats",
                UserSessionStats {
                    online_characters: 12,
                    raids_completed: 2,
                    dungeons_completed: 1,
                    experience_gained: 4500.75,
                    play_time_seconds: 3600,
                },
            ),
            Packet::new(
                "update_user_loyalty",
                UserLoyaltyUpdate {
                    user_id: Uuid::new_v4(),
                    user_name: "viewer".to_string(),
                    platform: "twitch".to_string(),
                    platform_id: "1234".to_string(),
                    new_gifted_subs: 1,
                    new_cheered_bits: 100,
                    is_moderator: false,
                    is_subscriber: true,
                    is_vip: false,
                },
            ),
            Packet::new("reply", false).with_correlation_id(CorrelationId::new()),
        ]
    }

    #[test]
    fn test_every_payload_type_survives_each_codec() {
        for payload_codec in [PayloadCodec::Json, PayloadCodec::GzipJson, PayloadCodec::Binary] {
            let codec = codec(payload_codec);
            for packet in sample_packets() {
                let frame = codec.encode(&packet).unwrap();
                assert_eq!(codec.decode(&frame).unwrap(), packet, "codec {}", payload_codec);
            }
        }
    }

    #[test]
    fn test_frame_layout() {
        let codec = codec(PayloadCodec::Json);
        let frame = codec.encode(&Packet::new("sync_time", true)).unwrap();

        let mut expected = vec![9u8];
        expected.extend_from_slice(b"sync_time");
        expected.push(7);
        expected.extend_from_slice(b"Boolean");
        expected.extend_from_slice(&0i32.to_le_bytes());
        expected.extend_from_slice(&4i32.to_le_bytes());
        expected.extend_from_slice(b"true");
        assert_eq!(frame.to_vec(), expected);
    }

    #[test]
    fn test_unknown_type_is_kept_raw() {
        let codec = codec(PayloadCodec::Binary);
        let packet = Packet::raw("future_command", "SomethingNew", vec![9u8, 8, 7]);
        let decoded = codec.decode(&codec.encode(&packet).unwrap()).unwrap();

        assert_eq!(decoded.type_name, "SomethingNew");
        assert_eq!(decoded.payload, Payload::Raw(Bytes::from_static(&[9, 8, 7])));
    }

    #[test]
    fn test_truncated_frame_is_framing_error() {
        let codec = codec(PayloadCodec::Json);
        let packet = sample_packets().remove(3);
        let frame = codec.encode(&packet).unwrap();

        for cut in 0..frame.len() {
            let err = codec.decode(&frame[..cut]).unwrap_err();
            assert!(err.is_truncated(), "cut at {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_corrupt_payload_is_codec_error() {
        let codec = codec(PayloadCodec::Json);
        let packet = Packet::raw("update_character_state", "CharacterStateUpdate", b"{not json".to_vec());
        let frame = codec.encode(&packet).unwrap();

        match codec.decode(&frame).unwrap_err() {
            SyncError::Codec(CodecError::Decode {
                type_name,
                frame_len,
                payload_len,
                ..
            }) => {
                assert_eq!(type_name, "CharacterStateUpdate");
                assert_eq!(frame_len, frame.len());
                assert_eq!(payload_len, 9);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_bad_correlation_length() {
        let mut buf = PacketBuffer::new();
        buf.write_string("sync_time");
        buf.write_string("");
        buf.write_len_prefixed(&[1, 2, 3]);
        buf.write_i32_le(0);

        let err = codec(PayloadCodec::Json).decode(buf.as_bytes()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_collection_roundtrip() {
        let codec = codec(PayloadCodec::Binary);
        let inner = sample_packets();
        let packet = Packet::collection(inner.clone());
        assert_eq!(packet.type_name, COLLECTION_TYPE);

        let decoded = codec.decode(&codec.encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded.payload, Payload::Collection(inner));
    }

    fn nested_collection(levels: usize) -> Packet {
        let mut packet = Packet::collection(Vec::new());
        for _ in 1..levels {
            packet = Packet::collection(vec![packet]);
        }
        packet
    }

    #[test]
    fn test_collection_depth_limit() {
        let codec = codec(PayloadCodec::Json);

        let deepest = nested_collection(MAX_COLLECTION_DEPTH);
        let decoded = codec.decode(&codec.encode(&deepest).unwrap()).unwrap();
        assert_eq!(decoded, deepest);

        let too_deep = codec.encode(&nested_collection(MAX_COLLECTION_DEPTH + 1)).unwrap();
        assert!(matches!(
            codec.decode(&too_deep),
            Err(SyncError::Protocol(ProtocolError::MalformedPacket(_)))
        ));
    }

    #[test]
    fn test_assembler_rejects_deeply_nested_collection() {
        let codec = codec(PayloadCodec::Json);
        // Hand-built so the sender side never recurses either
        let mut frame = Vec::new();
        for _ in 0..1000 {
            let mut outer = PacketBuffer::new();
            outer.write_string("collection");
            outer.write_string(COLLECTION_TYPE);
            outer.write_i32_le(0);
            outer.write_len_prefixed(&frame);
            frame = outer.as_bytes().to_vec();
        }

        let mut assembler = FrameAssembler::new();
        assembler.push(&frame);
        assert!(matches!(
            assembler.next_packet(&codec),
            Err(SyncError::Protocol(ProtocolError::MalformedPacket(_)))
        ));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_frame_size_limit() {
        let codec = codec(PayloadCodec::Json).with_max_frame_size(32);
        let packet = Packet::raw("big", "Blob", vec![0u8; 64]);
        assert!(matches!(
            codec.encode(&packet),
            Err(SyncError::Protocol(ProtocolError::PacketTooLarge { .. }))
        ));
    }

    #[test]
    fn test_assembler_reassembles_fragments() {
        let codec = codec(PayloadCodec::GzipJson);
        let packets = sample_packets();
        let mut stream = Vec::new();
        for packet in &packets {
            stream.extend_from_slice(&codec.encode(packet).unwrap());
        }

        let mut assembler = FrameAssembler::new();
        let mut decoded = Vec::new();
        for fragment in stream.chunks(7) {
            assembler.push(fragment);
            while let Some(packet) = assembler.next_packet(&codec).unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, packets);
        assert_eq!(assembler.buffered(), 0);
        assert_eq!(assembler.received(), 0);
    }

    #[test]
    fn test_assembler_skips_frame_with_codec_error() {
        let codec = codec(PayloadCodec::Json);
        let bad = Packet::raw("update_user_loyalty", "UserLoyaltyUpdate", b"[]".to_vec());
        let good = Packet::new("sync_time", true);

        let mut assembler = FrameAssembler::new();
        assembler.push(&codec.encode(&bad).unwrap());
        assembler.push(&codec.encode(&good).unwrap());

        assert!(matches!(assembler.next_packet(&codec), Err(SyncError::Codec(_))));
        assert_eq!(assembler.next_packet(&codec).unwrap(), Some(good));
        assert_eq!(assembler.next_packet(&codec).unwrap(), None);
    }

    #[test]
    fn test_assembler_resets_on_corrupt_frame() {
        let codec = codec(PayloadCodec::Json);
        let mut assembler = FrameAssembler::new();
        // String length prefix followed by invalid UTF-8
        assembler.push(&[2, 0xC3, 0x28, 0, 0]);

        assert!(matches!(
            assembler.next_packet(&codec),
            Err(SyncError::Protocol(ProtocolError::InvalidStringEncoding))
        ));
        assert_eq!(assembler.buffered(), 0);
    }
}
