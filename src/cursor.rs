//! Growable little-endian byte cursor with VLQ support.
//!
//! A cursor is owned by a single encode or decode pass. Writes grow the
//! backing buffer geometrically; reads past the written length fail with
//! [`ReplicationError::UnexpectedEof`].

use crate::error::{ReplicationError, Result};
use crate::protocol::{Primitive, Value};
use bytes::Bytes;

const DEFAULT_CAPACITY: usize = 64;
const VLQ_MAX_BYTES: usize = 5;

pub struct Cursor {
    buffer: Vec<u8>,
    offset: usize,
}

impl Cursor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity.max(1)],
            offset: 0,
        }
    }

    /// Wraps an existing buffer for reading from offset 0.
    pub fn from(buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: buffer.into(),
            offset: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Allocated size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    fn tryalloc(&mut self, bytes: usize) {
        let needed = self.offset + bytes;
        if needed <= self.buffer.len() {
            return;
        }

        let mut size = self.buffer.len().max(1);
        while size < needed {
            size *= 2;
        }
        self.buffer.resize(size, 0);
    }

    fn put(&mut self, bytes: &[u8]) {
        self.tryalloc(bytes.len());
        self.buffer[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.offset + len > self.buffer.len() {
            return Err(ReplicationError::UnexpectedEof {
                offset: self.offset,
                needed: len,
                len: self.buffer.len(),
            });
        }

        let start = self.offset;
        self.offset += len;
        Ok(&self.buffer[start..start + len])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn write_buffer(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    /// Writes `value` as three bytes. Values above `0xFF_FFFF` are not written
    /// and return false.
    pub fn write_u24(&mut self, value: u32) -> bool {
        if value > 0xFF_FFFF {
            return false;
        }
        let bytes = value.to_le_bytes();
        self.put(&bytes[..3]);
        true
    }

    pub fn write_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_i8(&mut self, value: i8) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.put(&value.to_le_bytes());
    }

    pub fn write_vlq(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.write_u8(byte);
                return;
            }
            self.write_u8(byte | 0x80);
        }
    }

    pub fn read_buffer(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let [a, b, c] = self.take_array::<3>()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_vlq(&mut self) -> Result<u32> {
        let start = self.offset;
        let mut value: u32 = 0;

        for index in 0..VLQ_MAX_BYTES {
            let byte = self.read_u8()?;
            let bits = (byte & 0x7F) as u32;

            // The fifth group only has room for the top 4 bits of a u32.
            if index == VLQ_MAX_BYTES - 1 && (bits > 0x0F || byte & 0x80 != 0) {
                return Err(ReplicationError::MalformedVlq { offset: start });
            }

            value |= bits << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }

        Err(ReplicationError::MalformedVlq { offset: start })
    }

    pub fn write_primitive(&mut self, primitive: Primitive, value: &Value) -> bool {
        match (primitive, value) {
            (Primitive::Bool, Value::Bool(v)) => self.write_u8(*v as u8),
            (Primitive::U8, Value::U8(v)) => self.write_u8(*v),
            (Primitive::U16, Value::U16(v)) => self.write_u16(*v),
            (Primitive::U24, Value::U32(v)) => return self.write_u24(*v),
            (Primitive::U32, Value::U32(v)) => self.write_u32(*v),
            (Primitive::I8, Value::I8(v)) => self.write_i8(*v),
            (Primitive::I16, Value::I16(v)) => self.write_i16(*v),
            (Primitive::I32, Value::I32(v)) => self.write_i32(*v),
            (Primitive::F32, Value::F32(v)) => self.write_f32(*v),
            (Primitive::F64, Value::F64(v)) => self.write_f64(*v),
            _ => return false,
        }
        true
    }

    pub fn read_primitive(&mut self, primitive: Primitive) -> Result<Value> {
        Ok(match primitive {
            Primitive::Bool => Value::Bool(self.read_u8()? != 0),
            Primitive::U8 => Value::U8(self.read_u8()?),
            Primitive::U16 => Value::U16(self.read_u16()?),
            Primitive::U24 => Value::U32(self.read_u24()?),
            Primitive::U32 => Value::U32(self.read_u32()?),
            Primitive::I8 => Value::I8(self.read_i8()?),
            Primitive::I16 => Value::I16(self.read_i16()?),
            Primitive::I32 => Value::I32(self.read_i32()?),
            Primitive::F32 => Value::F32(self.read_f32()?),
            Primitive::F64 => Value::F64(self.read_f64()?),
        })
    }

    /// Returns exactly the bytes written so far.
    pub fn close(mut self) -> Bytes {
        self.buffer.truncate(self.offset);
        Bytes::from(self.buffer)
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of bytes `write_vlq` emits for `value`.
pub fn vlq_span(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Smallest fixed unsigned width that holds `value`.
pub fn number_span(value: u32) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}
