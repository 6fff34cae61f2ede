use std::io::Write;

use crate::{
    codec::{put_varint32, put_varint64, read_length_prefixed_slice, VarIntReader},
    error::{Error, Result},
    format::InternalKey,
    types::SequenceNumber,
    version::FileMetaData,
};

const COMPARATOR: u32 = 1;
const LOG_NUMBER: u32 = 2;
const NEXT_FILE_NUMBER: u32 = 3;
const LAST_SEQUENCE: u32 = 4;
const COMPACT_POINTER: u32 = 5;
const DELETED_FILE: u32 = 6;
const NEW_FILE: u32 = 7;
// 8 was used for large value refs
const PREV_LOG_NUMBER: u32 = 9;
// extended records carry sequence bounds and an optional path id
const NEW_FILE_2: u32 = 100;
const NEW_FILE_3: u32 = 102;
// column-family records
const COLUMN_FAMILY: u32 = 200;
const COLUMN_FAMILY_ADD: u32 = 201;
const COLUMN_FAMILY_DROP: u32 = 202;
const MAX_COLUMN_FAMILY: u32 = 203;

// Sanity bound during decode; the configured level count is not known here.
const MAX_DECODED_LEVEL: u64 = 64;

/// A delta against the current Version, serialized as one manifest record.
#[derive(Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub max_column_family: Option<u32>,

    /// Family this edit applies to; 0 is the default family.
    pub column_family: u32,
    pub column_family_add: Option<String>,
    pub column_family_drop: bool,

    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> VersionEdit {
        VersionEdit::default()
    }

    pub fn set_comparator(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, num: SequenceNumber) {
        self.last_sequence = Some(num);
    }

    pub fn set_max_column_family(&mut self, cf: u32) {
        self.max_column_family = Some(cf);
    }

    pub fn set_column_family(&mut self, cf: u32) {
        self.column_family = cf;
    }

    pub fn add_column_family(&mut self, name: impl Into<String>) {
        self.column_family_add = Some(name.into());
    }

    pub fn drop_column_family(&mut self) {
        self.column_family_drop = true;
    }

    pub fn add_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn add_file(&mut self, level: usize, meta: FileMetaData) {
        self.new_files.push((level, meta));
    }

    pub fn delete_file(&mut self, level: usize, file_num: u64) {
        self.deleted_files.push((level, file_num));
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        if self.column_family != 0 {
            put_varint32(dst, COLUMN_FAMILY);
            put_varint32(dst, self.column_family);
        }
        if let Some(name) = &self.column_family_add {
            put_varint32(dst, COLUMN_FAMILY_ADD);
            put_varint32(dst, name.len() as u32);
            dst.write_all(name.as_bytes()).unwrap();
        }
        if self.column_family_drop {
            put_varint32(dst, COLUMN_FAMILY_DROP);
        }
        if let Some(cf) = self.max_column_family {
            put_varint32(dst, MAX_COLUMN_FAMILY);
            put_varint32(dst, cf);
        }
        if let Some(c) = &self.comparator {
            put_varint32(dst, COMPARATOR);
            put_varint32(dst, c.len() as u32);
            dst.write_all(c.as_bytes()).unwrap();
        }
        if let Some(n) = self.log_number {
            put_varint32(dst, LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(dst, PREV_LOG_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(dst, NEXT_FILE_NUMBER);
            put_varint64(dst, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(dst, LAST_SEQUENCE);
            put_varint64(dst, n);
        }
        for (level, key) in self.compact_pointers.iter() {
            put_varint32(dst, COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            let encoded = key.encode();
            put_varint32(dst, encoded.len() as u32);
            dst.write_all(encoded).unwrap();
        }
        for (level, num) in self.deleted_files.iter() {
            put_varint32(dst, DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *num);
        }
        for (level, f) in self.new_files.iter() {
            if f.path_id == 0 {
                put_varint32(dst, NEW_FILE_2);
            } else {
                put_varint32(dst, NEW_FILE_3);
            }
            put_varint32(dst, *level as u32);
            put_varint64(dst, f.number);
            if f.path_id != 0 {
                put_varint32(dst, f.path_id);
            }
            put_varint64(dst, f.file_size);
            let (small, large) = (f.smallest.encode(), f.largest.encode());
            put_varint32(dst, small.len() as u32);
            dst.write_all(small).unwrap();
            put_varint32(dst, large.len() as u32);
            dst.write_all(large).unwrap();
            put_varint64(dst, f.smallest_seq);
            put_varint64(dst, f.largest_seq);
        }
    }

    pub fn decode(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let (tag, _) = src.read_var_u32()?;
            match tag {
                COLUMN_FAMILY => {
                    self.column_family = src.read_var_u32()?.0;
                }
                COLUMN_FAMILY_ADD => {
                    let name = read_length_prefixed_slice(&mut src)?;
                    self.column_family_add = Some(String::from_utf8(name.to_vec())?);
                }
                COLUMN_FAMILY_DROP => {
                    self.column_family_drop = true;
                }
                MAX_COLUMN_FAMILY => {
                    self.max_column_family = Some(src.read_var_u32()?.0);
                }
                COMPARATOR => {
                    let name = read_length_prefixed_slice(&mut src)?;
                    self.comparator = Some(String::from_utf8_lossy(name).to_string());
                }
                LOG_NUMBER => {
                    self.log_number = Some(src.read_var_u64()?.0);
                }
                PREV_LOG_NUMBER => {
                    self.prev_log_number = Some(src.read_var_u64()?.0);
                }
                NEXT_FILE_NUMBER => {
                    self.next_file_number = Some(src.read_var_u64()?.0);
                }
                LAST_SEQUENCE => {
                    self.last_sequence = Some(src.read_var_u64()?.0);
                }
                COMPACT_POINTER => {
                    let level = decode_level(&mut src)?;
                    let key = decode_internal_key(&mut src)?;
                    self.compact_pointers.push((level, key));
                }
                DELETED_FILE => {
                    let level = decode_level(&mut src)?;
                    let num = src.read_var_u64()?.0;
                    self.deleted_files.push((level, num));
                }
                NEW_FILE | NEW_FILE_2 | NEW_FILE_3 => {
                    let level = decode_level(&mut src)?;
                    let mut meta = FileMetaData {
                        number: src.read_var_u64()?.0,
                        ..Default::default()
                    };
                    if tag == NEW_FILE_3 {
                        meta.path_id = src.read_var_u32()?.0;
                    }
                    meta.file_size = src.read_var_u64()?.0;
                    meta.smallest = decode_internal_key(&mut src)?;
                    meta.largest = decode_internal_key(&mut src)?;
                    if tag != NEW_FILE {
                        meta.smallest_seq = src.read_var_u64()?.0;
                        meta.largest_seq = src.read_var_u64()?.0;
                    }
                    self.new_files.push((level, meta));
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "VersionEdit: unknown tag {}",
                        tag
                    )));
                }
            }
        }
        Ok(())
    }
}

fn decode_level(src: &mut &[u8]) -> Result<usize> {
    let (level, _) = src.read_var_u32()?;
    if (level as u64) < MAX_DECODED_LEVEL {
        Ok(level as usize)
    } else {
        Err(Error::Corruption("VersionEdit: level out of range".into()))
    }
}

fn decode_internal_key(src: &mut &[u8]) -> Result<InternalKey> {
    let data = read_length_prefixed_slice(src)?;
    let mut key = InternalKey::empty();
    if !key.decode(data) {
        return Err(Error::Corruption("VersionEdit: bad internal key".into()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    fn sample_meta(num: u64, path_id: u32) -> FileMetaData {
        FileMetaData {
            number: num,
            file_size: 1 << 20,
            path_id,
            smallest: InternalKey::new(b"aaa", 3, ValueType::Value),
            largest: InternalKey::new(b"zzz", 9, ValueType::Value),
            smallest_seq: 3,
            largest_seq: 9,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut edit = VersionEdit::new();
        edit.set_comparator("stratadb.BitwiseComparator");
        edit.set_log_number(12);
        edit.set_prev_log_number(0);
        edit.set_next_file_number(42);
        edit.set_last_sequence(9999);
        edit.add_compact_pointer(2, InternalKey::new(b"ptr", 5, ValueType::Value));
        edit.delete_file(1, 7);
        edit.add_file(2, sample_meta(8, 0));
        edit.add_file(3, sample_meta(9, 2));

        let mut record = Vec::new();
        edit.encode(&mut record);

        let mut decoded = VersionEdit::new();
        decoded.decode(&record).unwrap();

        assert_eq!(decoded.comparator.as_deref(), Some("stratadb.BitwiseComparator"));
        assert_eq!(decoded.log_number, Some(12));
        assert_eq!(decoded.prev_log_number, Some(0));
        assert_eq!(decoded.next_file_number, Some(42));
        assert_eq!(decoded.last_sequence, Some(9999));
        assert_eq!(decoded.compact_pointers.len(), 1);
        assert_eq!(decoded.deleted_files, vec![(1, 7)]);
        assert_eq!(decoded.new_files.len(), 2);
        assert_eq!(decoded.new_files[0].1.number, 8);
        assert_eq!(decoded.new_files[1].1.path_id, 2);
        assert_eq!(decoded.new_files[1].1.smallest_seq, 3);
        assert_eq!(decoded.new_files[1].1.largest.user_key(), b"zzz");
    }

    #[test]
    fn test_column_family_records() {
        let mut edit = VersionEdit::new();
        edit.set_column_family(3);
        edit.add_column_family("metrics");
        edit.set_max_column_family(3);

        let mut record = Vec::new();
        edit.encode(&mut record);

        let mut decoded = VersionEdit::new();
        decoded.decode(&record).unwrap();
        assert_eq!(decoded.column_family, 3);
        assert_eq!(decoded.column_family_add.as_deref(), Some("metrics"));
        assert_eq!(decoded.max_column_family, Some(3));
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let mut record = Vec::new();
        put_varint32(&mut record, 77);
        let mut decoded = VersionEdit::new();
        assert!(matches!(
            decoded.decode(&record),
            Err(Error::Corruption(_))
        ));
    }
}
