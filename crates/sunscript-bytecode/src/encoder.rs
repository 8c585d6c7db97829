//! Bytecode encoding and decoding utilities
//!
//! Low-level writer/reader pair shared by the program image, the emitter,
//! and the engine's dispatcher. All multi-byte values are little-endian.

use crate::Real;
use thiserror::Error;

/// Errors that can occur while decoding a byte stream
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string payload
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Byte is not a known opcode
    #[error("Invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// Byte is not a known type tag
    #[error("Invalid type tag {0:#04x} at offset {1}")]
    InvalidTypeTag(u8, usize),

    /// Byte is not a known jump kind
    #[error("Invalid jump kind {0:#04x} at offset {1}")]
    InvalidJumpKind(u8, usize),
}

/// Bytecode writer for encoding instructions and image sections
pub struct BytecodeWriter {
    buffer: Vec<u8>,
}

impl BytecodeWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Current offset (bytes written so far).
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Borrow the encoded bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Emit a raw byte.
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer.
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 16-bit signed integer.
    pub fn emit_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer.
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer.
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a real ([`crate::REAL_SIZE`] bytes).
    pub fn emit_real(&mut self, value: Real) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a string: u16 length prefix, then UTF-8 bytes, no terminator.
    pub fn emit_str(&mut self, value: &str) {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.emit_u16(value.len() as u16);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Emit raw bytes verbatim.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Overwrite two bytes at `offset` with a signed 16-bit value.
    ///
    /// Used for back-patching jump offsets once a label is resolved.
    pub fn patch_i16(&mut self, offset: usize, value: i16) {
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode reader for decoding instructions and image sections
pub struct BytecodeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeReader<'a> {
    /// Create a reader over a byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Create a reader positioned at `pos`.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    /// Current read offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Reposition the reader.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Whether the reader has consumed every byte.
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + count > self.bytes.len() {
            return Err(DecodeError::UnexpectedEnd(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 16-bit signed integer.
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 32-bit signed integer.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a real ([`crate::REAL_SIZE`] bytes).
    pub fn read_real(&mut self) -> Result<Real, DecodeError> {
        let bytes = self.take(crate::REAL_SIZE)?;
        let mut raw = [0u8; crate::REAL_SIZE];
        raw.copy_from_slice(bytes);
        Ok(Real::from_le_bytes(raw))
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Read `count` raw bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }
}
