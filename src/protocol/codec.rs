//! Payload codecs
//!
//! The payload section of a frame is produced by one codec chosen for the whole
//! deployment. Both ends of a connection must agree on it.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a payload codec
#[derive(Error, Debug)]
pub enum PayloadCodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary: {0}")]
    Binary(#[from] bincode::Error),

    #[error("gzip: {0}")]
    Compression(#[from] std::io::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// Serialization strategy for packet payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCodec {
    /// Plain UTF-8 JSON
    Json,
    /// JSON compressed with gzip
    GzipJson,
    /// Compact binary (bincode)
    #[default]
    Binary,
}

impl PayloadCodec {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadCodec::Json => "json",
            PayloadCodec::GzipJson => "gzip_json",
            PayloadCodec::Binary => "binary",
        }
    }

    /// Serialize a payload value
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, PayloadCodecError> {
        match self {
            PayloadCodec::Json => Ok(serde_json::to_vec(value)?),
            PayloadCodec::GzipJson => {
                let json = serde_json::to_vec(value)?;
                let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
                encoder.write_all(&json)?;
                Ok(encoder.finish()?)
            }
            PayloadCodec::Binary => Ok(bincode::serialize(value)?),
        }
    }

    /// Deserialize a payload value
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PayloadCodecError> {
        match self {
            PayloadCodec::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadCodec::GzipJson => {
                let mut json = Vec::new();
                GzDecoder::new(bytes).read_to_end(&mut json)?;
                Ok(serde_json::from_slice(&json)?)
            }
            PayloadCodec::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}

impl fmt::Display for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PayloadCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(PayloadCodec::Json),
            "gzip_json" | "gzip" => Ok(PayloadCodec::GzipJson),
            "binary" | "bincode" => Ok(PayloadCodec::Binary),
            other => Err(format!("unknown payload codec: {}", other)),
        }
    }
}
