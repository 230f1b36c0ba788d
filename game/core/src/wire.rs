//! Little helpers for reading and writing the fixed-layout command bodies.
//! Text fields on the wire are fixed-width and NUL-padded; ASCII fields hold
//! Shift-JIS bytes and wide fields hold UTF-16LE code units.

use byteorder::{ByteOrder, LittleEndian};
use keel::text;
use std::fmt;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireError {
    /// The command body ended before a required field.
    Truncated { wanted: usize, have: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Truncated { wanted, have } => {
                write!(f, "command body truncated: wanted {} bytes, have {}", wanted, have)
            }
        }
    }
}

impl std::error::Error for WireError {}

pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Writer {
        Writer { buf: Vec::with_capacity(capacity) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u64(&mut self, value: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    /// Writes an IPv4 address as its four dotted-quad octets.
    pub fn put_ipv4(&mut self, address: u32) {
        self.buf.extend_from_slice(&address.to_be_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_f32(&mut tmp, value);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_zeroes(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    /// Writes a Shift-JIS text field of exactly `width` bytes, truncating or
    /// NUL-padding as needed.
    pub fn put_ascii(&mut self, value: &str, width: usize) {
        let mut encoded = text::encode_sjis(value);
        encoded.truncate(width.saturating_sub(1));
        let padding = width - encoded.len();
        self.buf.extend_from_slice(&encoded);
        self.put_zeroes(padding);
    }

    /// Writes a UTF-16LE text field of exactly `units` code units.
    pub fn put_utf16(&mut self, value: &str, units: usize) {
        let mut encoded = text::encode_utf16(value);
        encoded.truncate(units.saturating_sub(1));
        for unit in &encoded {
            self.put_u16(*unit);
        }
        for _ in encoded.len()..units {
            self.put_u16(0);
        }
    }

    /// Writes a text field in the connection's wire encoding.
    pub fn put_text(&mut self, value: &str, width: usize, utf16: bool) {
        if utf16 {
            self.put_utf16(value, width);
        } else {
            self.put_ascii(value, width);
        }
    }

    /// NUL-pads to the given alignment.
    pub fn pad_to(&mut self, alignment: usize) {
        while self.buf.len() % alignment != 0 {
            self.buf.push(0);
        }
    }
}

pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < count {
            return Err(WireError::Truncated { wanted: count, have: self.remaining() });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), WireError> {
        self.take(count).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_f32(&mut self) -> Result<f32, WireError> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        self.take(count)
    }

    /// Reads a fixed-width Shift-JIS field, trimming at the first NUL.
    pub fn get_ascii(&mut self, width: usize) -> Result<String, WireError> {
        let raw = self.take(width)?;
        Ok(text::decode_sjis(raw))
    }

    /// Reads a fixed-width UTF-16LE field, trimming at the first NUL.
    pub fn get_utf16(&mut self, units: usize) -> Result<String, WireError> {
        let raw = self.take(units * 2)?;
        let mut decoded = Vec::with_capacity(units);
        for pair in raw.chunks_exact(2) {
            decoded.push(LittleEndian::read_u16(pair));
        }
        Ok(text::decode_utf16(&decoded))
    }

    /// Reads a text field in the connection's wire encoding. `width` is in
    /// code units, not bytes.
    pub fn get_text(&mut self, width: usize, utf16: bool) -> Result<String, WireError> {
        if utf16 {
            self.get_utf16(width)
        } else {
            self.get_ascii(width)
        }
    }

    /// Decodes the rest of the body as variable-length text in the wire
    /// encoding, stopping at the first NUL.
    pub fn get_text_to_end(&mut self, utf16: bool) -> String {
        let raw = &self.data[self.pos..];
        self.pos = self.data.len();
        if utf16 {
            let mut decoded = Vec::with_capacity(raw.len() / 2);
            for pair in raw.chunks_exact(2) {
                decoded.push(LittleEndian::read_u16(pair));
            }
            text::decode_utf16(&decoded)
        } else {
            text::decode_sjis(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_text_roundtrip() {
        let mut writer = Writer::new();
        writer.put_ascii("RAcast", 16);
        writer.put_utf16("FOnewm", 8);
        let data = writer.into_vec();
        assert_eq!(data.len(), 32);

        let mut reader = Reader::new(&data);
        assert_eq!(reader.get_ascii(16).unwrap(), "RAcast");
        assert_eq!(reader.get_utf16(8).unwrap(), "FOnewm");
    }

    #[test]
    fn truncation_reports_wanted_bytes() {
        let mut reader = Reader::new(&[1, 2]);
        assert_eq!(reader.get_u32(), Err(WireError::Truncated { wanted: 4, have: 2 }));
    }

    #[test]
    fn long_names_are_clipped_to_field_width() {
        let mut writer = Writer::new();
        writer.put_ascii("a-name-well-beyond-the-field", 8);
        let data = writer.into_vec();
        assert_eq!(data.len(), 8);
        assert_eq!(data[7], 0);
    }
}
