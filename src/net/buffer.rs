//! Packet buffer implementation
//!
//! Wire primitives for the packet envelope:
//! - 7-bit variable-length unsigned integers (string length prefixes)
//! - Little-endian int32 length fields
//! - Length-prefixed UTF-8 strings
//! - Raw byte runs
//!
//! Writes go through [`PacketBuffer`]; reads go through [`PacketReader`], which
//! borrows the input and reports a truncated read instead of returning zeroes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Maximum number of bytes in a 7-bit encoded u32
const MAX_VAR_U32_BYTES: usize = 5;

/// Growable buffer for writing wire frames
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    data: BytesMut,
}

impl PacketBuffer {
    /// Create a new empty packet buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    /// Create a packet buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Freeze the written bytes into an immutable frame
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    pub fn write_ubyte(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a little-endian int32
    pub fn write_i32_le(&mut self, value: i32) {
        self.data.put_i32_le(value);
    }

    /// Write a 7-bit variable-length unsigned integer
    pub fn write_var_u32(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.data.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.data.put_u8(value as u8);
    }

    /// Write a UTF-8 string prefixed with its byte length
    pub fn write_string(&mut self, value: &str) {
        self.write_var_u32(value.len() as u32);
        self.data.put_slice(value.as_bytes());
    }

    /// Write a run of bytes prefixed with an int32 length
    pub fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.write_i32_le(bytes.len() as i32);
        self.data.put_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Bounds-checked reader over a borrowed frame
#[derive(Debug, Clone, Copy)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    read_pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, read_pos: 0 }
    }

    /// Bytes consumed so far
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Fail with a truncation error unless `count` more bytes are available
    fn ensure(&self, count: usize) -> Result<(), ProtocolError> {
        if self.remaining() < count {
            return Err(ProtocolError::Truncated {
                needed: self.read_pos + count,
                available: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn read_ubyte(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        let value = self.data[self.read_pos];
        self.read_pos += 1;
        Ok(value)
    }

    /// Read a little-endian int32
    pub fn read_i32_le(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.read_pos..self.read_pos + 4]);
        self.read_pos += 4;
        Ok(i32::from_le_bytes(raw))
    }

    /// Read a 7-bit variable-length unsigned integer
    pub fn read_var_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut value: u32 = 0;
        for i in 0..MAX_VAR_U32_BYTES {
            let byte = self.read_ubyte()?;
            value |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::MalformedPacket(
            "variable-length integer exceeds 5 bytes".to_string(),
        ))
    }

    /// Read a UTF-8 string prefixed with its byte length
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidStringEncoding)
    }

    /// Read an int32 length and validate it against `max`
    pub fn read_length(&mut self, max: usize) -> Result<usize, ProtocolError> {
        let len = self.read_i32_le()?;
        if len < 0 {
            return Err(ProtocolError::InvalidLength(i64::from(len)));
        }
        let len = len as usize;
        if len > max {
            return Err(ProtocolError::PacketTooLarge { size: len, max });
        }
        Ok(len)
    }

    /// Borrow the next `count` bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(count)?;
        let bytes = &self.data[self.read_pos..self.read_pos + count];
        self.read_pos += count;
        Ok(bytes)
    }
}
