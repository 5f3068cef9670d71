//! Protocol module
//!
//! This module contains the wire protocol spoken with game clients:
//! - Payload codecs (JSON, gzip-compressed JSON, compact binary)
//! - The packet envelope and the payload types it carries
//! - The type registry mapping wire type names to decoders
//! - Framing and reassembly of partial frames
//! - Command dispatch and the built-in command handlers

pub mod codec;
pub mod dispatch;
pub mod frame;
pub mod handlers;
pub mod messages;
pub mod packet;
pub mod registry;

pub use codec::PayloadCodec;
pub use dispatch::{DispatchOutcome, DispatchRegistry, HandlerContext, PacketHandler};
pub use frame::{FrameAssembler, PacketCodec};
pub use packet::{CorrelationId, Packet, Payload};
pub use registry::TypeRegistry;
