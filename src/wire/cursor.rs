//! Bounds-checked little-endian cursor over a byte buffer.
//!
//! The sole place integers are (de)serialized for the wire protocol. Reads
//! fail fast with [`Error::Range`] if they would cross the logical end of
//! the buffer; writes never grow the buffer, callers size it up front.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub struct Cursor<'a> {
    data: &'a mut [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    /// Wrap `data`, with the logical end initially at the full buffer length.
    pub fn new(data: &'a mut [u8]) -> Self {
        let end = data.len();
        Self { data, pos: 0, end }
    }

    pub fn set_end(&mut self, end: usize) {
        self.end = end.min(self.data.len());
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub fn check_remaining(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.check_remaining(n) {
            Ok(())
        } else {
            Err(Error::Range)
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.require(4)?;
        let v = LittleEndian::read_u32(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data[self.pos] = v;
        self.pos += 1;
    }

    pub fn write_u16_le(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.data[self.pos..self.pos + 2], v);
        self.pos += 2;
    }

    pub fn write_u32_le(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.data[self.pos..self.pos + 4], v);
        self.pos += 4;
    }

    pub fn write_bytes_raw(&mut self, bytes: &[u8]) {
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn skip_bytes(&mut self, n: usize) {
        for i in 0..n {
            self.data[self.pos + i] = 0;
        }
        self.pos += n;
    }
}

/// Trace-level diagnostic dump of a buffer, used while debugging PDU framing.
pub fn hex_dump(data: &[u8]) {
    if !tracing::event_enabled!(tracing::Level::TRACE) {
        return;
    }
    for (row_index, row) in data.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        tracing::trace!("{:04x}: {}", row_index * 16, hex.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_u32_le() {
        let mut buf = [0u8; 8];
        {
            let mut c = Cursor::new(&mut buf);
            c.write_u32_le(0x0102_0304);
            c.write_u32_le(42);
        }
        let mut c = Cursor::new(&mut buf);
        assert_eq!(c.read_u32_le().unwrap(), 0x0102_0304);
        assert_eq!(c.read_u32_le().unwrap(), 42);
    }

    #[test]
    fn read_past_end_is_range_error() {
        let mut buf = [0u8; 4];
        let mut c = Cursor::new(&mut buf);
        c.set_end(4);
        assert!(c.read_u32_le().is_ok());
        assert!(matches!(c.read_u8(), Err(Error::Range)));
    }

    #[test]
    fn check_remaining_respects_logical_end() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf);
        c.set_end(8);
        assert!(c.check_remaining(8));
        assert!(!c.check_remaining(9));
    }
}
