/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Deterministic binary encoding shared by the wire protocol and by signing preimages.
//!
//! ## Rules
//!
//! - Fixed-width integers are big-endian.
//! - Byte strings and UTF-8 strings are prefixed with their length as an unsigned LEB128 varint.
//! - Fixed-size arrays (hashes, keys, signatures, sectors) are written as-is with no prefix.
//! - Variable-length slices are a varint element count followed by each element.
//!
//! Decoding enforces two caps so that a malicious peer cannot make us allocate unbounded memory:
//! at most [`MAX_ARRAY_LEN`] elements per slice and at most [`MAX_BYTES_LEN`] bytes per byte
//! field. Sectors are fixed arrays and therefore never hit the byte-field cap.

use thiserror::Error;

use crate::types::data_types::{
    CryptoHash, PeerID, PublicKeyBytes, Sector, SignatureBytes, SECTOR_LEN,
};

/// Maximum number of elements in a decoded slice.
pub const MAX_ARRAY_LEN: usize = 1024;

/// Default maximum length of a decoded byte field.
pub const MAX_BYTES_LEN: usize = 256 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("slice of {len} elements exceeds the maximum of {max}")]
    ArrayTooLong { len: u64, max: usize },
    #[error("byte field of {len} bytes exceeds the maximum of {max}")]
    BytesTooLong { len: u64, max: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
}

/// Implemented by every type that can be written in the wire encoding.
pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Implemented by every type that can be read from the wire encoding.
pub trait Decode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Decode `bytes` in full. Leftover bytes are an error.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn put_slice<T: Encode>(buf: &mut Vec<u8>, items: &[T]) {
    put_varint(buf, items.len() as u64);
    for item in items {
        item.encode(buf);
    }
}

/// A cursor over an encoded byte string.
pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            let low = (byte & 0x7f) as u64;
            if shift == 63 && low > 1 {
                return Err(CodecError::VarintOverflow);
            }
            value |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// Read a length-prefixed byte field of at most [`MAX_BYTES_LEN`] bytes.
    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        self.bytes_with_limit(MAX_BYTES_LEN)
    }

    pub fn bytes_with_limit(&mut self, max: usize) -> Result<Vec<u8>, CodecError> {
        let len = self.varint()?;
        if len > max as u64 {
            return Err(CodecError::BytesTooLong { len, max });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a varint-prefixed slice of at most [`MAX_ARRAY_LEN`] elements.
    pub fn slice<T: Decode>(&mut self) -> Result<Vec<T>, CodecError> {
        let len = self.varint()?;
        if len > MAX_ARRAY_LEN as u64 {
            return Err(CodecError::ArrayTooLong {
                len,
                max: MAX_ARRAY_LEN,
            });
        }
        (0..len).map(|_| T::decode(self)).collect()
    }
}

impl Encode for u8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self)
    }
}

impl Decode for u8 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.u8()
    }
}

impl Encode for u16 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes())
    }
}

impl Decode for u16 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.u16()
    }
}

impl Encode for u32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes())
    }
}

impl Decode for u32 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.u32()
    }
}

impl Encode for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes())
    }
}

impl Decode for u64 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.u64()
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        reader.string()
    }
}

impl Encode for CryptoHash {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes())
    }
}

impl Decode for CryptoHash {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(CryptoHash::new(reader.array()?))
    }
}

impl Encode for SignatureBytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes())
    }
}

impl Decode for SignatureBytes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SignatureBytes::new(reader.array()?))
    }
}

impl Encode for PublicKeyBytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes())
    }
}

impl Decode for PublicKeyBytes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(PublicKeyBytes::new(reader.array()?))
    }
}

impl Encode for PeerID {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bytes())
    }
}

impl Decode for PeerID {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(PeerID::new(reader.array()?))
    }
}

impl Encode for Sector {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.bytes())
    }
}

impl Decode for Sector {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Sector::from_vec(reader.take(SECTOR_LEN)?.to_vec())
            .ok_or(CodecError::InvalidValue("sector length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varints_use_leb128() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
        assert_eq!(Reader::new(&buf).varint().unwrap(), 300);

        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(Reader::new(&buf).varint().unwrap(), u64::MAX);
    }

    #[test]
    fn overlong_varints_are_rejected() {
        let bytes = [0xffu8; 11];
        assert_eq!(Reader::new(&bytes).varint(), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(0x0102u16.to_bytes(), vec![1, 2]);
        assert_eq!(0xCAFECAFEu32.to_bytes(), vec![0xca, 0xfe, 0xca, 0xfe]);
    }

    #[test]
    fn byte_fields_over_the_cap_are_rejected() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &vec![0u8; MAX_BYTES_LEN + 1]);
        assert!(matches!(
            Reader::new(&buf).bytes(),
            Err(CodecError::BytesTooLong { .. })
        ));
    }

    #[test]
    fn slices_over_the_cap_are_rejected() {
        let mut buf = Vec::new();
        put_varint(&mut buf, MAX_ARRAY_LEN as u64 + 1);
        assert!(matches!(
            Reader::new(&buf).slice::<u16>(),
            Err(CodecError::ArrayTooLong { .. })
        ));
    }

    #[test]
    fn truncated_input_and_trailing_bytes_fail() {
        assert_eq!(u32::from_bytes(&[1, 2, 3]), Err(CodecError::UnexpectedEof));
        assert_eq!(u16::from_bytes(&[1, 2, 3]), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn strings_must_be_utf8() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &[0xff, 0xfe]);
        assert_eq!(String::from_bytes(&buf), Err(CodecError::InvalidUtf8));
    }
}
