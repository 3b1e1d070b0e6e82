//! Big-endian byte cursor
//!
//! `bytes::Buf` panics when a read runs past the end of the buffer. The chunk
//! decoder has to treat a short buffer as "wait for more data" and the AMF
//! decoder as a decode error, so both read through [`ByteReader`], which
//! reports underflow as `None` and never consumes on failure.
//!
//! The write side is `bytes::BufMut`, plus [`BufMutExt::put_u24`] for the
//! 24-bit fields RTMP and FLV headers use.

use bytes::BufMut;

/// Checked big-endian reader over a borrowed slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read exactly `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.read_array().map(i16::from_be_bytes)
    }

    pub fn read_u24(&mut self) -> Option<u32> {
        let b: [u8; 3] = self.read_array()?;
        Some(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    /// Little-endian u32 (the message stream id in a type-0 chunk header)
    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.read_array().map(f64::from_be_bytes)
    }
}

/// 24-bit writes for `BufMut`
pub trait BufMutExt: BufMut {
    /// Write the low 24 bits of `value`, big-endian
    fn put_u24(&mut self, value: u32) {
        self.put_u8(((value >> 16) & 0xFF) as u8);
        self.put_u8(((value >> 8) & 0xFF) as u8);
        self.put_u8((value & 0xFF) as u8);
    }
}

impl<B: BufMut + ?Sized> BufMutExt for B {}
