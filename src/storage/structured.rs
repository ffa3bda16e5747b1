//! Structured binary I/O for index files.
//!
//! [`StructWriter`] writes little-endian fixed-width values, varints and
//! length-prefixed byte strings to a [`StorageOutput`] while keeping a running
//! CRC32 of everything written. [`StructReader`] decodes the same primitives
//! from a [`FileBytes`] view with random access; every out-of-bounds read is
//! reported as corruption of the file being read.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Result, TesseraError};
use crate::storage::{FileBytes, StorageOutput};
use crate::util::varint::{encode_u64_into, zigzag_decode, zigzag_encode};

/// A structured file writer for binary data.
pub struct StructWriter {
    writer: Box<dyn StorageOutput>,
    hasher: crc32fast::Hasher,
    position: u64,
    scratch: Vec<u8>,
}

impl StructWriter {
    /// Create a new structured file writer.
    pub fn new(writer: Box<dyn StorageOutput>) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            scratch: Vec::with_capacity(10),
        }
    }

    /// Name of the underlying file.
    pub fn name(&self) -> &str {
        self.writer.name()
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.hasher.update(&[value]);
        self.position += 1;
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.hasher.update(&value.to_le_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    /// Write a f32 value (little-endian).
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_u32(value.to_bits())
    }

    /// Write a f64 value (little-endian).
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        self.scratch.clear();
        encode_u64_into(value, &mut self.scratch);
        let encoded = std::mem::take(&mut self.scratch);
        let result = self.write_raw(&encoded);
        self.scratch = encoded;
        result
    }

    /// Write a signed variable-length integer (zigzag).
    pub fn write_zigzag(&mut self, value: i64) -> Result<()> {
        self.write_varint(zigzag_encode(value))
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CRC32 of every byte written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Flush and close the file.
    pub fn close(mut self) -> Result<()> {
        self.writer.close()
    }
}

impl std::fmt::Debug for StructWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructWriter")
            .field("name", &self.writer.name())
            .field("position", &self.position)
            .finish()
    }
}

/// A structured reader over an immutable file view.
#[derive(Debug, Clone)]
pub struct StructReader {
    bytes: FileBytes,
    position: usize,
    end: usize,
}

impl StructReader {
    /// Create a reader over the whole file.
    pub fn new(bytes: FileBytes) -> Self {
        let end = bytes.len();
        StructReader {
            bytes,
            position: 0,
            end,
        }
    }

    /// Create a reader limited to `[start, end)`.
    pub fn with_range(bytes: FileBytes, start: usize, end: usize) -> Self {
        let end = end.min(bytes.len());
        StructReader {
            bytes,
            position: start.min(end),
            end,
        }
    }

    /// Name of the underlying file.
    pub fn name(&self) -> &str {
        self.bytes.name()
    }

    /// The underlying file view.
    pub fn bytes(&self) -> &FileBytes {
        &self.bytes
    }

    fn corrupt(&self, msg: &str) -> TesseraError {
        TesseraError::corruption(self.bytes.name(), format!("{msg} at offset {}", self.position))
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<&[u8]> {
        let start = self.position;
        let stop = start
            .checked_add(length)
            .filter(|&stop| stop <= self.end)
            .ok_or_else(|| self.corrupt("read past end of file"))?;
        self.position = stop;
        Ok(&self.bytes.as_slice()[start..stop])
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_raw(1)?[0])
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read_raw(4)?))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.read_raw(8)?))
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a f32 value (little-endian).
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a f64 value (little-endian).
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(self.corrupt("varint overflow"));
            }
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a varint that must fit in a u32.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| self.corrupt("value does not fit in u32"))
    }

    /// Read a signed variable-length integer (zigzag).
    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        Ok(self.read_raw(length)?.to_vec())
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| self.corrupt("invalid UTF-8"))
    }

    /// Skip `length` bytes.
    pub fn skip(&mut self, length: usize) -> Result<()> {
        self.read_raw(length).map(|_| ())
    }

    /// Move to an absolute offset.
    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.end {
            return Err(self.corrupt("seek past end of file"));
        }
        self.position = position;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Readable end of the view.
    pub fn end(&self) -> usize {
        self.end
    }

    /// True once every readable byte has been consumed.
    pub fn is_eof(&self) -> bool {
        self.position >= self.end
    }
}
