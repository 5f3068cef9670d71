//! Type registry
//!
//! Maps a payload's wire type name to the function that deserializes it. The
//! table is built once at startup from an explicit registration list and is
//! read-only afterwards.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::protocol::codec::{PayloadCodec, PayloadCodecError};
use crate::protocol::messages::{register_payload_types, Payload};
use crate::protocol::packet::PayloadType;

/// Deserializes payload bytes into a typed [`Payload`]
pub type DecodeFn = fn(PayloadCodec, &[u8]) -> Result<Payload, PayloadCodecError>;

/// Registered payload type
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    pub name: &'static str,
    decode: DecodeFn,
}

impl TypeDescriptor {
    pub fn decode(&self, codec: PayloadCodec, bytes: &[u8]) -> Result<Payload, PayloadCodecError> {
        (self.decode)(codec, bytes)
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor").field("name", &self.name).finish()
    }
}

fn decode_as<T: PayloadType>(codec: PayloadCodec, bytes: &[u8]) -> Result<Payload, PayloadCodecError> {
    codec.deserialize::<T>(bytes).map(Into::into)
}

/// Builder collecting registrations; rejects name collisions
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: HashMap<&'static str, TypeDescriptor>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its wire name
    ///
    /// A second registration of the same name is refused; the first one stays.
    pub fn register<T: PayloadType>(&mut self) -> Result<&mut Self, DispatchError> {
        self.register_descriptor(TypeDescriptor {
            name: T::TYPE_NAME,
            decode: decode_as::<T>,
        })
    }

    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> Result<&mut Self, DispatchError> {
        if self.types.contains_key(descriptor.name) {
            warn!(type_name = descriptor.name, "Payload type name registered twice");
            return Err(DispatchError::DuplicateType(descriptor.name.to_string()));
        }
        self.types.insert(descriptor.name, descriptor);
        Ok(self)
    }

    pub fn build(self) -> TypeRegistry {
        debug!(types = self.types.len(), "Type registry built");
        TypeRegistry { types: self.types }
    }
}

/// Read-only lookup from wire type name to descriptor
#[derive(Debug)]
pub struct TypeRegistry {
    types: HashMap<&'static str, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    /// Registry holding every built-in payload type
    pub fn builtin() -> Result<Self, DispatchError> {
        let mut builder = TypeRegistryBuilder::new();
        register_payload_types(&mut builder)?;
        Ok(builder.build())
    }

    pub fn resolve(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.types.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{AuthToken, CharacterStateUpdate};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_registry() {
        let registry = TypeRegistry::builtin().unwrap();
        assert!(registry.contains("CharacterStateUpdate"));
        assert!(registry.contains("Boolean"));
        assert!(registry.resolve("NoSuchType").is_none());
        assert_eq!(registry.len(), registry.names().len());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut builder = TypeRegistry::builder();
        builder.register::<AuthToken>().unwrap();
        assert_eq!(
            builder.register::<AuthToken>().unwrap_err(),
            DispatchError::DuplicateType("AuthToken".to_string())
        );

        let registry = builder.build();
        assert_eq!(registry.names(), vec!["AuthToken"]);
    }

    #[test]
    fn test_descriptor_decodes() {
        let registry = TypeRegistry::builtin().unwrap();
        let descriptor = registry.resolve(CharacterStateUpdate::TYPE_NAME).unwrap();
        let codec = PayloadCodec::Json;
        let bytes = codec.serialize(&true).unwrap();

        // Wrong type for the descriptor
        assert!(descriptor.decode(codec, &bytes).is_err());

        let descriptor = registry.resolve("Boolean").unwrap();
        assert_eq!(descriptor.decode(codec, &bytes).unwrap(), Payload::Bool(true));
    }
}
