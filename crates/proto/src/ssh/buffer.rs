//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Reading goes through [`SshReader`], a cursor over a received payload that
//! fails with a protocol error instead of panicking on truncated input.
//! Writing uses the [`SshWrite`] extension trait on any [`BufMut`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fjord_platform::{FjordError, FjordResult};

/// Upper bound accepted for a single length-prefixed field.
pub const MAX_FIELD_LEN: usize = 256 * 1024;

/// Cursor over an SSH payload.
#[derive(Debug, Clone)]
pub struct SshReader {
    data: Bytes,
}

impl SshReader {
    /// Wraps a payload.
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Bytes still unread.
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Returns the unread tail without consuming it.
    pub fn peek_rest(&self) -> &[u8] {
        &self.data
    }

    /// Consumes and returns the unread tail.
    pub fn take_rest(&mut self) -> Bytes {
        self.data.split_off(0)
    }

    fn need(&self, n: usize, what: &str) -> FjordResult<()> {
        if self.data.remaining() < n {
            return Err(FjordError::Protocol(format!(
                "Truncated {}: need {} bytes, have {}",
                what,
                n,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    /// Reads a byte.
    pub fn get_u8(&mut self) -> FjordResult<u8> {
        self.need(1, "byte")?;
        Ok(self.data.get_u8())
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn get_bool(&mut self) -> FjordResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> FjordResult<u32> {
        self.need(4, "uint32")?;
        Ok(self.data.get_u32())
    }

    /// Reads a big-endian uint64.
    pub fn get_u64(&mut self) -> FjordResult<u64> {
        self.need(8, "uint64")?;
        Ok(self.data.get_u64())
    }

    /// Reads exactly `n` raw bytes.
    pub fn get_raw(&mut self, n: usize) -> FjordResult<Bytes> {
        self.need(n, "raw bytes")?;
        Ok(self.data.split_to(n))
    }

    /// Reads a length-prefixed binary string.
    pub fn get_string(&mut self) -> FjordResult<Bytes> {
        let len = self.get_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(FjordError::Protocol(format!(
                "String length {} exceeds limit {}",
                len, MAX_FIELD_LEN
            )));
        }
        self.need(len, "string")?;
        Ok(self.data.split_to(len))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_utf8(&mut self) -> FjordResult<String> {
        let raw = self.get_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FjordError::Protocol("Invalid UTF-8 in string field".to_string()))
    }

    /// Reads a comma separated name-list.
    pub fn get_name_list(&mut self) -> FjordResult<Vec<String>> {
        let s = self.get_utf8()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(str::to_string).collect())
    }

    /// Reads an mpint and returns its magnitude bytes (leading zero stripped).
    pub fn get_mpint(&mut self) -> FjordResult<Bytes> {
        let mut raw = self.get_string()?;
        while raw.first() == Some(&0) {
            raw.advance(1);
        }
        Ok(raw)
    }
}

impl From<Bytes> for SshReader {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

/// SSH encodings on top of [`BufMut`].
pub trait SshWrite: BufMut {
    /// Writes a boolean.
    fn put_bool(&mut self, v: bool) {
        self.put_u8(u8::from(v));
    }

    /// Writes a length-prefixed binary string.
    fn put_ssh_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    /// Writes a length-prefixed UTF-8 string.
    fn put_utf8(&mut self, s: &str) {
        self.put_ssh_string(s.as_bytes());
    }

    /// Writes a comma separated name-list.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(",");
        self.put_utf8(&joined);
    }

    /// Writes an unsigned big-endian magnitude as an mpint.
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let mut start = 0;
        while start < magnitude.len() && magnitude[start] == 0 {
            start += 1;
        }
        let m = &magnitude[start..];
        if m.is_empty() {
            self.put_u32(0);
        } else if m[0] & 0x80 != 0 {
            self.put_u32(m.len() as u32 + 1);
            self.put_u8(0);
            self.put_slice(m);
        } else {
            self.put_u32(m.len() as u32);
            self.put_slice(m);
        }
    }
}

impl<B: BufMut> SshWrite for B {}

/// Starts a payload with the given opcode.
pub fn payload(opcode: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(opcode);
    buf
}

/// Encodes a magnitude as a standalone mpint.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(magnitude.len() + 5);
    out.put_mpint(magnitude);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_and_ints() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_bool(true);
        buf.put_u32(0xdead_beef);
        buf.put_utf8("hello");
        buf.put_name_list(&["a", "b", "c"]);
        buf.put_name_list::<&str>(&[]);

        let mut r = SshReader::new(buf.freeze());
        assert_eq!(r.get_u8().unwrap(), 7);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_utf8().unwrap(), "hello");
        assert_eq!(r.get_name_list().unwrap(), vec!["a", "b", "c"]);
        assert!(r.get_name_list().unwrap().is_empty());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let mut r = SshReader::new(Bytes::from_static(&[0, 0, 0, 10, b'a']));
        assert!(matches!(r.get_string(), Err(FjordError::Protocol(_))));

        let mut r = SshReader::new(Bytes::from_static(&[1, 2]));
        assert!(r.get_u32().is_err());
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 examples
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(
            encode_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]),
            vec![0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );
        assert_eq!(encode_mpint(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(encode_mpint(&[0, 0, 0x7f]), vec![0, 0, 0, 1, 0x7f]);

        let mut r = SshReader::new(Bytes::from(encode_mpint(&[0x80, 0x01])));
        assert_eq!(&r.get_mpint().unwrap()[..], &[0x80, 0x01]);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FIELD_LEN + 1) as u32);
        let mut r = SshReader::new(buf.freeze());
        assert!(r.get_string().is_err());
    }
}
