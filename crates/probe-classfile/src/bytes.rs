//! Big-endian byte cursor and writer for class-file structures.

use anyhow::{anyhow, Result};

/// Read cursor over class-file bytes. Every read is bounds checked and reports
/// the offset it failed at.
pub struct ByteReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(anyhow!(
                "unexpected end of data: need {} byte(s) at offset {}, {} left",
                len,
                self.cursor,
                self.remaining()
            ));
        }
        let bytes = &self.data[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok((hi << 32) | lo)
    }
}

/// Growable big-endian output buffer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a `u16` length prefix, failing when `len` does not fit.
    pub fn write_len_u16(&mut self, len: usize, what: &str) -> Result<()> {
        let len = u16::try_from(len).map_err(|_| anyhow!("too many {}: {}", what, len))?;
        self.write_u16(len);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let data = [0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x37, 0xFF];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0xCAFE_BABE);
        assert_eq!(reader.read_u16().unwrap(), 55);
        assert_eq!(reader.read_i8().unwrap(), -1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_past_end_reports_offset() {
        let data = [0x01];
        let mut reader = ByteReader::new(&data);
        let err = reader.read_u16().unwrap_err();
        assert!(err.to_string().contains("offset 0"));
    }

    #[test]
    fn test_write_len_rejects_overflow() {
        let mut writer = ByteWriter::new();
        assert!(writer.write_len_u16(70_000, "fields").is_err());
        writer.write_len_u16(3, "fields").unwrap();
        writer.write_i16(-2);
        assert_eq!(writer.into_bytes(), vec![0x00, 0x03, 0xFF, 0xFE]);
    }
}
