use std::fmt;
use std::io::Write;

use integer_encoding::{FixedIntWriter, VarInt, VarIntWriter};

use crate::{
    codec::NumberReader,
    error::{Error, Result},
    types::{SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK},
};

pub fn pack_sequence_and_type(seq: SequenceNumber, t: ValueType) -> u64 {
    assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t as u64
}

/// The user key is everything up to the trailing 8-byte tag.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

pub fn extract_tag(internal_key: &[u8]) -> u64 {
    assert!(internal_key.len() >= 8);
    let mut buf = &internal_key[internal_key.len() - 8..];
    buf.read_u64_le().unwrap()
}

pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub val_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn append(&self, result: &mut Vec<u8>) {
        result.extend_from_slice(self.user_key);
        result
            .write_fixedint(pack_sequence_and_type(self.sequence, self.val_type))
            .unwrap();
    }

    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Corruption("internal key too short".into()));
        }
        let user_key = &data[..data.len() - 8];
        let tag = extract_tag(data);
        let val_type = ValueType::try_from((tag & 0xff) as u8)?;

        Ok(ParsedInternalKey {
            user_key,
            sequence: tag >> 8,
            val_type,
        })
    }
}

impl fmt::Debug for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' @ {} : {:?}",
            String::from_utf8_lossy(self.user_key),
            self.sequence,
            self.val_type
        )
    }
}

/// An internal key that owns its encoding. Used where keys outlive the
/// buffers they were parsed from (file metadata, compaction pointers).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn empty() -> Self {
        InternalKey { rep: Vec::new() }
    }

    pub fn new(key: &[u8], s: SequenceNumber, t: ValueType) -> Self {
        let mut rep = Vec::with_capacity(key.len() + 8);
        ParsedInternalKey {
            user_key: key,
            sequence: s,
            val_type: t,
        }
        .append(&mut rep);
        InternalKey { rep }
    }

    pub fn decode(&mut self, data: &[u8]) -> bool {
        self.rep.clear();
        self.rep.extend_from_slice(data);
        !self.rep.is_empty() && self.rep.len() >= 8
    }

    pub fn encode(&self) -> &[u8] {
        &self.rep
    }

    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    pub fn clear(&mut self) {
        self.rep.clear();
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn sequence(&self) -> SequenceNumber {
        extract_tag(&self.rep) >> 8
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rep.len() < 8 {
            return write!(f, "(bad){:?}", self.rep);
        }
        ParsedInternalKey::parse(&self.rep)
            .map_err(|_| fmt::Error)?
            .fmt(f)
    }
}

/// A key formatted for memtable lookups. Holds, contiguously:
/// varint length of the internal key, the user key, and the 8-byte tag
/// built from the snapshot sequence and the seek value type.
pub struct LookupKey {
    key: Vec<u8>,
    key_offset: usize,
}

impl LookupKey {
    pub fn new(key: impl AsRef<[u8]>, seq: SequenceNumber) -> Self {
        let key = key.as_ref();
        let key_size = key.len() + 8;
        let size = key_size + key_size.required_space();

        let mut buf = Vec::with_capacity(size);
        buf.write_varint(key_size).unwrap();
        buf.write_all(key).unwrap();
        buf.write_fixedint(pack_sequence_and_type(seq, VALUE_TYPE_FOR_SEEK))
            .unwrap();

        LookupKey {
            key: buf,
            key_offset: key_size.required_space(),
        }
    }

    pub fn memtable_key(&self) -> &[u8] {
        self.key.as_slice()
    }

    pub fn user_key(&self) -> &[u8] {
        &self.key[self.key_offset..self.key.len() - 8]
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.key[self.key_offset..]
    }

    pub fn sequence(&self) -> SequenceNumber {
        extract_tag(self.internal_key()) >> 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let key = InternalKey::new(b"apple", 99, ValueType::Value);
        assert_eq!(key.user_key(), b"apple");
        assert_eq!(key.sequence(), 99);

        let parsed = ParsedInternalKey::parse(key.encode()).unwrap();
        assert_eq!(parsed.user_key, b"apple");
        assert_eq!(parsed.sequence, 99);
        assert_eq!(parsed.val_type, ValueType::Value);
    }

    #[test]
    fn test_lookup_key_parts() {
        let lk = LookupKey::new("banana", 7);
        assert_eq!(lk.user_key(), b"banana");
        assert_eq!(lk.sequence(), 7);
        assert_eq!(extract_user_key(lk.internal_key()), b"banana");

        // memtable key = varint length + internal key
        let mt = lk.memtable_key();
        assert_eq!(mt[0] as usize, lk.internal_key().len());
        assert_eq!(&mt[1..], lk.internal_key());
    }

    #[test]
    fn test_parse_rejects_short_keys() {
        assert!(ParsedInternalKey::parse(b"short").is_err());
    }
}
