// Tag lists carry the metadata fields of both server and peer messages:
// a 1-byte type code, a length-prefixed name (usually a single numeric id),
// and a type-dependent value.

use libed2k_core::hash_id::Md4Hash;

use crate::reader::{write_u16_string, Reader};
use crate::{MessageDeserializeError, MAX_FRAME_SIZE};

pub const TAGTYPE_HASH16: u8 = 0x01;
pub const TAGTYPE_STRING: u8 = 0x02;
pub const TAGTYPE_UINT32: u8 = 0x03;
pub const TAGTYPE_FLOAT32: u8 = 0x04;
pub const TAGTYPE_BOOL: u8 = 0x05;
pub const TAGTYPE_BOOLARRAY: u8 = 0x06;
pub const TAGTYPE_BLOB: u8 = 0x07;
pub const TAGTYPE_UINT16: u8 = 0x08;
pub const TAGTYPE_UINT8: u8 = 0x09;
pub const TAGTYPE_BSOB: u8 = 0x0A;
pub const TAGTYPE_UINT64: u8 = 0x0B;
// Strings of 1..=22 bytes inline their length in the type code.
pub const TAGTYPE_STR1: u8 = 0x11;
pub const TAGTYPE_STR22: u8 = 0x26;

// Numeric tag names used by the engine.
pub const CT_NAME: u8 = 0x01;
pub const CT_PORT: u8 = 0x0F;
pub const CT_VERSION: u8 = 0x11;
pub const CT_SERVER_FLAGS: u8 = 0x20;
pub const FT_FILENAME: u8 = 0x01;
pub const FT_FILESIZE: u8 = 0x02;
pub const FT_FILETYPE: u8 = 0x03;
pub const FT_SOURCES: u8 = 0x15;
pub const FT_COMPLETE_SOURCES: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagName {
    Id(u8),
    Name(String),
}

impl From<u8> for TagName {
    fn from(id: u8) -> Self {
        TagName::Id(id)
    }
}

impl From<&str> for TagName {
    fn from(name: &str) -> Self {
        TagName::Name(name.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Hash(Md4Hash),
    String(String),
    U32(u32),
    F32(f32),
    Bool(bool),
    BoolArray { bits: u16, data: Vec<u8> },
    Blob(Vec<u8>),
    U16(u16),
    U8(u8),
    Bsob(Vec<u8>),
    U64(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: TagName,
    pub value: TagValue,
}

impl Tag {
    pub fn new(name: impl Into<TagName>, value: TagValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn string(name: impl Into<TagName>, value: impl Into<String>) -> Self {
        Self::new(name, TagValue::String(value.into()))
    }

    pub fn u32(name: impl Into<TagName>, value: u32) -> Self {
        Self::new(name, TagValue::U32(value))
    }

    pub fn u64(name: impl Into<TagName>, value: u64) -> Self {
        Self::new(name, TagValue::U64(value))
    }

    pub fn name_id(&self) -> Option<u8> {
        match &self.name {
            TagName::Id(id) => Some(*id),
            TagName::Name(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            TagValue::U8(v) => Some(*v as u64),
            TagValue::U16(v) => Some(*v as u64),
            TagValue::U32(v) => Some(*v as u64),
            TagValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<Md4Hash> {
        match &self.value {
            TagValue::Hash(h) => Some(*h),
            _ => None,
        }
    }

    fn type_code(&self) -> u8 {
        match &self.value {
            TagValue::Hash(_) => TAGTYPE_HASH16,
            TagValue::String(s) if (1..=22).contains(&s.len()) => {
                TAGTYPE_STR1 + (s.len() as u8 - 1)
            }
            TagValue::String(_) => TAGTYPE_STRING,
            TagValue::U32(_) => TAGTYPE_UINT32,
            TagValue::F32(_) => TAGTYPE_FLOAT32,
            TagValue::Bool(_) => TAGTYPE_BOOL,
            TagValue::BoolArray { .. } => TAGTYPE_BOOLARRAY,
            TagValue::Blob(_) => TAGTYPE_BLOB,
            TagValue::U16(_) => TAGTYPE_UINT16,
            TagValue::U8(_) => TAGTYPE_UINT8,
            TagValue::Bsob(_) => TAGTYPE_BSOB,
            TagValue::U64(_) => TAGTYPE_UINT64,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.type_code());
        match &self.name {
            TagName::Id(id) => {
                out.extend_from_slice(&1u16.to_le_bytes());
                out.push(*id);
            }
            TagName::Name(name) => write_u16_string(out, name),
        }
        match &self.value {
            TagValue::Hash(h) => out.extend_from_slice(&h.0),
            TagValue::String(s) if (1..=22).contains(&s.len()) => {
                out.extend_from_slice(s.as_bytes())
            }
            TagValue::String(s) => write_u16_string(out, s),
            TagValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TagValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TagValue::Bool(v) => out.push(*v as u8),
            TagValue::BoolArray { bits, data } => {
                out.extend_from_slice(&bits.to_le_bytes());
                out.extend_from_slice(data);
            }
            TagValue::Blob(data) => {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            TagValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            TagValue::U8(v) => out.push(*v),
            TagValue::Bsob(data) => {
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            TagValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Tag, MessageDeserializeError> {
        let type_code = r.read_u8()?;
        let name_len = r.read_u16()? as usize;
        let name = if name_len == 1 {
            TagName::Id(r.read_u8()?)
        } else {
            TagName::Name(r.read_string(name_len)?)
        };
        let value = match type_code {
            TAGTYPE_HASH16 => TagValue::Hash(r.read_hash()?),
            TAGTYPE_STRING => TagValue::String(r.read_u16_string()?),
            TAGTYPE_UINT32 => TagValue::U32(r.read_u32()?),
            TAGTYPE_FLOAT32 => TagValue::F32(r.read_f32()?),
            TAGTYPE_BOOL => TagValue::Bool(r.read_u8()? != 0),
            TAGTYPE_BOOLARRAY => {
                let bits = r.read_u16()?;
                let data = r.read_exact((bits as usize).div_ceil(8))?.to_vec();
                TagValue::BoolArray { bits, data }
            }
            TAGTYPE_BLOB => {
                let len = r.read_u32()?;
                if len > MAX_FRAME_SIZE {
                    return Err(MessageDeserializeError::BlobTagTooLong(len));
                }
                TagValue::Blob(r.read_exact(len as usize)?.to_vec())
            }
            TAGTYPE_UINT16 => TagValue::U16(r.read_u16()?),
            TAGTYPE_UINT8 => TagValue::U8(r.read_u8()?),
            TAGTYPE_BSOB => {
                let len = r.read_u8()? as usize;
                TagValue::Bsob(r.read_exact(len)?.to_vec())
            }
            TAGTYPE_UINT64 => TagValue::U64(r.read_u64()?),
            t if (TAGTYPE_STR1..=TAGTYPE_STR22).contains(&t) => {
                let len = (t - TAGTYPE_STR1) as usize + 1;
                TagValue::String(r.read_string(len)?)
            }
            other => return Err(MessageDeserializeError::InvalidTagType(other)),
        };
        Ok(Tag { name, value })
    }
}

pub fn write_tag_list(out: &mut Vec<u8>, tags: &[Tag]) {
    out.extend_from_slice(&(tags.len() as u32).to_le_bytes());
    for tag in tags {
        tag.write(out);
    }
}

pub fn read_tag_list(r: &mut Reader<'_>) -> Result<Vec<Tag>, MessageDeserializeError> {
    let count = r.read_u32()?;
    // The count is attacker-controlled; each tag is at least 4 bytes.
    if count as usize > r.remaining() / 4 + 1 {
        return Err(MessageDeserializeError::NotEnoughData(count as usize * 4));
    }
    let mut tags = Vec::with_capacity(count as usize);
    for _ in 0..count {
        tags.push(Tag::read(r)?);
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(tag: Tag) -> Tag {
        let mut out = Vec::new();
        tag.write(&mut out);
        let mut r = Reader::new(&out);
        let back = Tag::read(&mut r).unwrap();
        assert!(r.is_empty(), "trailing bytes after {tag:?}");
        back
    }

    #[test]
    fn test_round_trip_every_type() {
        let tags = [
            Tag::new(CT_NAME, TagValue::Hash(Md4Hash::TERMINAL)),
            Tag::string(FT_FILENAME, "a name longer than twenty-two bytes"),
            Tag::u32(FT_SOURCES, 0xDEADBEEF),
            Tag::new(0x21, TagValue::F32(2.5)),
            Tag::new(0x22, TagValue::Bool(true)),
            Tag::new(
                0x23,
                TagValue::BoolArray {
                    bits: 11,
                    data: vec![0xFF, 0x07],
                },
            ),
            Tag::new(0x24, TagValue::Blob(vec![1, 2, 3, 4, 5])),
            Tag::new(0x25, TagValue::U16(65535)),
            Tag::new(0x26, TagValue::U8(7)),
            Tag::new(0x27, TagValue::Bsob(vec![9, 9, 9])),
            Tag::u64(FT_FILESIZE, u64::MAX - 1),
            Tag::new("named tag", TagValue::U32(1)),
        ];
        for tag in tags {
            assert_eq!(round_trip(tag.clone()), tag);
        }
    }

    #[test]
    fn test_short_strings_inline() {
        let tag = Tag::string(CT_NAME, "short");
        let mut out = Vec::new();
        tag.write(&mut out);
        // type, name_len(2), name(1), then the 5 raw bytes with no length.
        assert_eq!(out[0], TAGTYPE_STR1 + 4);
        assert_eq!(out.len(), 1 + 2 + 1 + 5);
        assert_eq!(round_trip(tag.clone()), tag);
    }

    #[test]
    fn test_empty_string_uses_long_form() {
        let tag = Tag::string(CT_NAME, "");
        let mut out = Vec::new();
        tag.write(&mut out);
        assert_eq!(out[0], TAGTYPE_STRING);
        assert_eq!(round_trip(tag.clone()), tag);
    }

    #[test]
    fn test_tag_list_round_trip() {
        let tags = vec![
            Tag::string(CT_NAME, "client"),
            Tag::u32(CT_VERSION, 0x3C),
            Tag::u32(CT_PORT, 4662),
        ];
        let mut out = Vec::new();
        write_tag_list(&mut out, &tags);
        let mut r = Reader::new(&out);
        assert_eq!(read_tag_list(&mut r).unwrap(), tags);
    }

    #[test]
    fn test_invalid_type_rejected() {
        let buf = [0x0Cu8, 1, 0, 0x01, 0, 0, 0, 0];
        let mut r = Reader::new(&buf);
        assert!(matches!(
            Tag::read(&mut r),
            Err(MessageDeserializeError::InvalidTagType(0x0C))
        ));
    }

    #[test]
    fn test_oversize_blob_rejected() {
        let mut buf = vec![TAGTYPE_BLOB, 1, 0, 0x01];
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        let mut r = Reader::new(&buf);
        assert!(matches!(
            Tag::read(&mut r),
            Err(MessageDeserializeError::BlobTagTooLong(_))
        ));
    }

    #[test]
    fn test_bogus_tag_count_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut r = Reader::new(&out);
        assert!(read_tag_list(&mut r).is_err());
    }
}
