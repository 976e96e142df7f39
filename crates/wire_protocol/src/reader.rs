use byteorder::{ByteOrder, LE};
use libed2k_core::hash_id::Md4Hash;

use crate::MessageDeserializeError;

/// Little-endian cursor over one frame's payload.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], MessageDeserializeError> {
        if self.buf.len() < n {
            return Err(MessageDeserializeError::NotEnoughData(n - self.buf.len()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, MessageDeserializeError> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, MessageDeserializeError> {
        Ok(LE::read_u16(self.read_exact(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, MessageDeserializeError> {
        Ok(LE::read_u32(self.read_exact(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, MessageDeserializeError> {
        Ok(LE::read_u64(self.read_exact(8)?))
    }

    pub fn read_f32(&mut self) -> Result<f32, MessageDeserializeError> {
        Ok(LE::read_f32(self.read_exact(4)?))
    }

    pub fn read_hash(&mut self) -> Result<Md4Hash, MessageDeserializeError> {
        let bytes = self.read_exact(16)?;
        let mut h = [0u8; 16];
        h.copy_from_slice(bytes);
        Ok(Md4Hash::new(h))
    }

    /// ed2k strings are length-prefixed byte sequences with no declared
    /// encoding; non-UTF-8 input is replaced, not rejected.
    pub fn read_string(&mut self, len: usize) -> Result<String, MessageDeserializeError> {
        Ok(String::from_utf8_lossy(self.read_exact(len)?).into_owned())
    }

    pub fn read_u16_string(&mut self) -> Result<String, MessageDeserializeError> {
        let len = self.read_u16()? as usize;
        self.read_string(len)
    }
}

pub(crate) fn write_u16_string(out: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize) as u16;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&s.as_bytes()[..len as usize]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_in_order() {
        let buf = [1u8, 2, 0, 3, 0, 0, 0];
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 2);
        assert_eq!(r.read_u32().unwrap(), 3);
        assert!(r.is_empty());
    }

    #[test]
    fn test_underflow_reports_missing_bytes() {
        let mut r = Reader::new(&[0u8; 3]);
        match r.read_u64() {
            Err(MessageDeserializeError::NotEnoughData(5)) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_u16_string_round_trip() {
        let mut out = Vec::new();
        write_u16_string(&mut out, "hello world");
        let mut r = Reader::new(&out);
        assert_eq!(r.read_u16_string().unwrap(), "hello world");
    }
}
