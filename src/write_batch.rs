use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Buf;
use integer_encoding::VarIntWriter;

use crate::{
    codec::{read_length_prefixed_slice, VarIntReader},
    error::{Error, Result},
    format::LookupKey,
    lookup::GetContext,
    memtable::MemTable,
    merge_operator::MergeOperator,
    types::{SequenceNumber, ValueType},
};

const HEAD_SIZE: usize = 12;

// Record kinds inside a serialized batch. Plain kinds mirror ValueType;
// family-tagged kinds carry a varint family id before the key.
const TAG_DELETION: u8 = 0;
const TAG_VALUE: u8 = 1;
const TAG_MERGE: u8 = 2;
const TAG_CF_DELETION: u8 = 4;
const TAG_CF_VALUE: u8 = 5;
const TAG_CF_MERGE: u8 = 6;

pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;

/// Atomic unit of mutation: a 12-byte header (fixed64 starting sequence,
/// fixed32 count) followed by tagged records. The serialized form is exactly
/// what the WAL stores.
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; HEAD_SIZE],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.put_cf(DEFAULT_COLUMN_FAMILY_ID, key, value)
    }

    pub fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(TAG_VALUE);
        } else {
            self.rep.push(TAG_CF_VALUE);
            self.rep.write_varint(cf).unwrap();
        }
        self.append_slice(key);
        self.append_slice(value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.delete_cf(DEFAULT_COLUMN_FAMILY_ID, key)
    }

    pub fn delete_cf(&mut self, cf: u32, key: &[u8]) {
        self.set_count(self.count() + 1);
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(TAG_DELETION);
        } else {
            self.rep.push(TAG_CF_DELETION);
            self.rep.write_varint(cf).unwrap();
        }
        self.append_slice(key);
    }

    pub fn merge(&mut self, key: &[u8], value: &[u8]) {
        self.merge_cf(DEFAULT_COLUMN_FAMILY_ID, key, value)
    }

    pub fn merge_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        if cf == DEFAULT_COLUMN_FAMILY_ID {
            self.rep.push(TAG_MERGE);
        } else {
            self.rep.push(TAG_CF_MERGE);
            self.rep.write_varint(cf).unwrap();
        }
        self.append_slice(key);
        self.append_slice(value);
    }

    fn append_slice(&mut self, data: &[u8]) {
        self.rep.write_varint(data.len() as u32).unwrap();
        self.rep.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEAD_SIZE, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.rep.len() == HEAD_SIZE
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep
            .as_mut_slice()
            .write_u64::<LittleEndian>(seq)
            .unwrap()
    }

    pub fn sequence(&self) -> SequenceNumber {
        let mut buf = &self.rep[..8];
        buf.read_u64::<LittleEndian>().unwrap()
    }

    pub fn set_count(&mut self, n: u32) {
        let mut buf = self.rep[8..].as_mut();
        buf.write_u32::<LittleEndian>(n).unwrap()
    }

    pub fn count(&self) -> u32 {
        let mut buf = &self.rep[8..];
        buf.read_u32::<LittleEndian>().unwrap()
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Steals the records of `source`; used by group commit to coalesce
    /// queued batches behind one WAL record.
    pub fn append(&mut self, source: &WriteBatch) {
        assert!(source.rep.len() >= HEAD_SIZE);
        assert!(self.rep.len() >= HEAD_SIZE);
        self.set_count(self.count() + source.count());
        self.rep.extend_from_slice(&source.rep[HEAD_SIZE..]);
    }

    pub fn content(&self) -> &[u8] {
        &self.rep
    }

    pub fn set_content(&mut self, content: Vec<u8>) {
        assert!(content.len() >= HEAD_SIZE);
        self.rep = content;
    }

    pub fn iterate<H: Handler>(&self, handler: &mut H) -> Result<()> {
        if self.rep.len() < HEAD_SIZE {
            return Err(Error::Corruption("malformed write batch (too small)".into()));
        }
        let mut buf = &self.rep[HEAD_SIZE..];
        let mut found = 0;
        while !buf.is_empty() {
            let tag = buf[0];
            buf.advance(1);
            found += 1;
            let cf = match tag {
                TAG_CF_DELETION | TAG_CF_VALUE | TAG_CF_MERGE => buf.read_var_u32()?.0,
                _ => DEFAULT_COLUMN_FAMILY_ID,
            };
            match tag {
                TAG_DELETION | TAG_CF_DELETION => {
                    let key = read_length_prefixed_slice(&mut buf)?;
                    handler.delete(cf, key)?;
                }
                TAG_VALUE | TAG_CF_VALUE => {
                    let key = read_length_prefixed_slice(&mut buf)?;
                    let value = read_length_prefixed_slice(&mut buf)?;
                    handler.put(cf, key, value)?;
                }
                TAG_MERGE | TAG_CF_MERGE => {
                    let key = read_length_prefixed_slice(&mut buf)?;
                    let value = read_length_prefixed_slice(&mut buf)?;
                    handler.merge(cf, key, value)?;
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown write batch record tag {}",
                        tag
                    )))
                }
            }
        }
        if found != self.count() {
            return Err(Error::Corruption("write batch has wrong count".into()));
        }

        Ok(())
    }

    /// Applies every record to the memtables selected by `resolve`, in
    /// order, consuming one sequence number per record.
    pub fn insert_into<F>(&self, resolve: F, ignore_missing_column_families: bool) -> Result<()>
    where
        F: Fn(u32) -> Option<MemTableTarget>,
    {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            resolve,
            ignore_missing_column_families,
        };
        self.iterate(&mut inserter)
    }
}

/// Destination for one family's records, carrying the family's own merge
/// configuration.
pub struct MemTableTarget {
    pub mem: Arc<MemTable>,
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    pub max_successive_merges: usize,
}

pub trait Handler {
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()>;
    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()>;
}

struct MemTableInserter<F>
where
    F: Fn(u32) -> Option<MemTableTarget>,
{
    sequence: SequenceNumber,
    resolve: F,
    ignore_missing_column_families: bool,
}

impl<F> MemTableInserter<F>
where
    F: Fn(u32) -> Option<MemTableTarget>,
{
    fn target(&self, cf: u32) -> Result<Option<MemTableTarget>> {
        match (self.resolve)(cf) {
            Some(target) => Ok(Some(target)),
            None if self.ignore_missing_column_families => Ok(None),
            None => Err(Error::InvalidArgument(format!(
                "unknown column family id {}",
                cf
            ))),
        }
    }
}

impl<F> Handler for MemTableInserter<F>
where
    F: Fn(u32) -> Option<MemTableTarget>,
{
    fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(target) = self.target(cf)? {
            target.mem.add(self.sequence, ValueType::Value, key, value);
        }
        self.sequence += 1;
        Ok(())
    }

    fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        if let Some(target) = self.target(cf)? {
            target.mem.add(self.sequence, ValueType::Deletion, key, b"");
        }
        self.sequence += 1;
        Ok(())
    }

    fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let target = match self.target(cf)? {
            Some(target) => target,
            None => {
                self.sequence += 1;
                return Ok(());
            }
        };

        let mut folded = false;
        if target.max_successive_merges > 0 {
            if let Some(op) = &target.merge_operator {
                let lookup = LookupKey::new(key, self.sequence);
                if target.mem.count_successive_merges(&lookup) >= target.max_successive_merges {
                    // Collapse the chain: read the key's current state out of
                    // this memtable and write a full-merged value instead.
                    let ucmp = target.mem.user_comparator().clone();
                    let mut ctx = GetContext::new(ucmp.as_ref(), Some(op.as_ref()), key);
                    target.mem.get(&lookup, &mut ctx)?;
                    let existing = ctx.finalize()?;
                    if let Some(merged) =
                        op.full_merge(key, existing.as_deref(), &[value.to_vec()])
                    {
                        target.mem.add(self.sequence, ValueType::Value, key, &merged);
                        folded = true;
                    }
                }
            }
        }
        if !folded {
            target.mem.add(self.sequence, ValueType::Merge, key, value);
        }
        self.sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::{BitwiseComparator, InternalKeyComparator};

    struct Collector {
        ops: Vec<(u32, String, Vec<u8>, Vec<u8>)>,
    }

    impl Handler for Collector {
        fn put(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
            self.ops
                .push((cf, "put".into(), key.to_vec(), value.to_vec()));
            Ok(())
        }

        fn delete(&mut self, cf: u32, key: &[u8]) -> Result<()> {
            self.ops.push((cf, "delete".into(), key.to_vec(), vec![]));
            Ok(())
        }

        fn merge(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
            self.ops
                .push((cf, "merge".into(), key.to_vec(), value.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_batch_round_trip() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.merge(b"c", b"3");
        batch.put_cf(7, b"d", b"4");
        batch.set_sequence(100);

        assert_eq!(batch.count(), 4);
        assert_eq!(batch.sequence(), 100);

        let mut collector = Collector { ops: vec![] };
        batch.iterate(&mut collector).unwrap();
        assert_eq!(
            collector.ops,
            vec![
                (0, "put".into(), b"a".to_vec(), b"1".to_vec()),
                (0, "delete".into(), b"b".to_vec(), vec![]),
                (0, "merge".into(), b"c".to_vec(), b"3".to_vec()),
                (7, "put".into(), b"d".to_vec(), b"4".to_vec()),
            ]
        );
    }

    #[test]
    fn test_append_coalesces() {
        let mut group = WriteBatch::new();
        group.put(b"x", b"1");
        let mut other = WriteBatch::new();
        other.put(b"y", b"2");
        other.delete(b"z");

        group.append(&other);
        assert_eq!(group.count(), 3);

        let mut collector = Collector { ops: vec![] };
        group.iterate(&mut collector).unwrap();
        assert_eq!(collector.ops.len(), 3);
    }

    #[test]
    fn test_insert_into_memtable_assigns_sequences() {
        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = Arc::new(MemTable::new(icmp));

        let mut batch = WriteBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        batch.delete(b"k1");
        batch.set_sequence(10);

        let mem_for_resolve = mem.clone();
        batch
            .insert_into(
                move |cf| {
                    (cf == 0).then(|| MemTableTarget {
                        mem: mem_for_resolve.clone(),
                        merge_operator: None,
                        max_successive_merges: 0,
                    })
                },
                false,
            )
            .unwrap();

        let cmp = BitwiseComparator {};
        // k1 deleted at sequence 12
        let lookup = LookupKey::new("k1", 12);
        let mut ctx = GetContext::new(&cmp, None, lookup.user_key());
        mem.get(&lookup, &mut ctx).unwrap();
        assert_eq!(ctx.finalize().unwrap(), None);

        // but visible at sequence 10
        let lookup = LookupKey::new("k1", 10);
        let mut ctx = GetContext::new(&cmp, None, lookup.user_key());
        mem.get(&lookup, &mut ctx).unwrap();
        assert_eq!(ctx.finalize().unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_unknown_family_errors_unless_ignored() {
        let mut batch = WriteBatch::new();
        batch.put_cf(42, b"k", b"v");
        batch.set_sequence(1);

        let err = batch.insert_into(|_| None, false);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        batch.insert_into(|_| None, true).unwrap();
    }

    #[test]
    fn test_corrupt_count_detected() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.set_count(5);
        let mut collector = Collector { ops: vec![] };
        assert!(matches!(
            batch.iterate(&mut collector),
            Err(Error::Corruption(_))
        ));
    }
}
