use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use integer_encoding::{FixedIntWriter, VarInt, VarIntWriter};

use crate::{
    cmp::{Comparator, InternalKeyComparator, MemEntryComparator, SliceTransform},
    codec::decode_length_prefixed_slice,
    error::Result,
    filter::DynamicBloom,
    format::{extract_tag, pack_sequence_and_type, LookupKey},
    iterator::DBIterator,
    lookup::GetContext,
    skiplist::{SkipList, SkipListIter},
    types::{SequenceNumber, ValueType},
};

/// In-memory write buffer. Entries live in the skiplist's arena; the whole
/// structure is dropped at once after a successful flush once the last
/// reader releases its reference.
///
/// Entry layout, contiguous:
///   varint32   internal key length (user key length + 8)
///   bytes      user key
///   fixed64    tag: (sequence << 8) | type
///   varint32   value length
///   bytes      value
pub struct MemTable {
    table: Arc<SkipList>,
    comparator: Arc<dyn Comparator>,
    num_entries: AtomicUsize,
    prefix_bloom: Option<DynamicBloom>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
}

impl MemTable {
    pub fn new(internal_comparator: InternalKeyComparator) -> MemTable {
        Self::with_prefix_bloom(internal_comparator, None, 0, 0)
    }

    pub fn with_prefix_bloom(
        internal_comparator: InternalKeyComparator,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        bloom_bits: u32,
        bloom_probes: u32,
    ) -> MemTable {
        let comparator = internal_comparator.user_comparator();
        let entry_comparator = MemEntryComparator::new(internal_comparator);

        let prefix_bloom = match (&prefix_extractor, bloom_bits) {
            (Some(_), bits) if bits > 0 => Some(DynamicBloom::new(bits, bloom_probes)),
            _ => None,
        };

        MemTable {
            table: Arc::new(SkipList::new(Arc::new(entry_comparator))),
            comparator,
            num_entries: AtomicUsize::new(0),
            prefix_bloom,
            prefix_extractor,
        }
    }

    pub fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        seq: SequenceNumber,
        t: ValueType,
        key: K,
        value: V,
    ) {
        let key = key.as_ref();
        let value = value.as_ref();

        let key_size = key.len() + 8;
        let value_size = value.len();
        let size = key_size + value_size + key_size.required_space() + value_size.required_space();

        let mut buf = Vec::with_capacity(size);
        buf.write_varint(key_size).unwrap();
        buf.write_all(key).unwrap();
        buf.write_fixedint(pack_sequence_and_type(seq, t)).unwrap();
        buf.write_varint(value_size).unwrap();
        buf.write_all(value).unwrap();
        assert_eq!(buf.len(), size);

        if let (Some(bloom), Some(extractor)) = (&self.prefix_bloom, &self.prefix_extractor) {
            if extractor.in_domain(key) {
                bloom.add(extractor.transform(key));
            }
        }

        self.table.insert(&buf);
        self.num_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Feeds every version of the lookup key, newest first, into `ctx` until
    /// the context reports done or this memtable is exhausted for the key.
    pub fn get(&self, key: &LookupKey, ctx: &mut GetContext<'_>) -> Result<()> {
        if let (Some(bloom), Some(extractor)) = (&self.prefix_bloom, &self.prefix_extractor) {
            let user_key = key.user_key();
            if extractor.in_domain(user_key) && !bloom.may_contain(extractor.transform(user_key)) {
                return Ok(());
            }
        }

        let mut iter = SkipListIter::new(self.table.clone());
        iter.seek(key.memtable_key());

        while iter.valid() {
            let entry = iter.entry();
            let (internal_key, key_end) = decode_length_prefixed_slice(entry)?;
            let user_key = &internal_key[..internal_key.len() - 8];
            if !ctx.matches(user_key) {
                break;
            }
            let tag = extract_tag(internal_key);
            let t = ValueType::try_from((tag & 0xff) as u8)?;
            let (value, _) = decode_length_prefixed_slice(&entry[key_end..])?;
            if ctx.sees(t, value) {
                break;
            }
            iter.next();
        }
        Ok(())
    }

    /// Number of MERGE entries stacked on top of the key's newest base
    /// version. Consulted by the write path to cap successive merges.
    pub fn count_successive_merges(&self, key: &LookupKey) -> usize {
        let mut iter = SkipListIter::new(self.table.clone());
        iter.seek(key.memtable_key());

        let mut count = 0;
        while iter.valid() {
            let entry = iter.entry();
            let (internal_key, _) = match decode_length_prefixed_slice(entry) {
                Ok(v) => v,
                Err(_) => break,
            };
            let user_key = &internal_key[..internal_key.len() - 8];
            if self.comparator.compare(user_key, key.user_key()) != std::cmp::Ordering::Equal {
                break;
            }
            let tag = extract_tag(internal_key);
            if tag & 0xff != ValueType::Merge as u64 {
                break;
            }
            count += 1;
            iter.next();
        }
        count
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.table.memory_usage()
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> Box<dyn DBIterator> {
        Box::new(MemTableIterator::new(SkipListIter::new(self.table.clone())))
    }
}

pub struct MemTableIterator {
    iter: SkipListIter,
    scratch: Vec<u8>,
}

impl MemTableIterator {
    pub fn new(iter: SkipListIter) -> Self {
        MemTableIterator {
            iter,
            scratch: Vec::new(),
        }
    }
}

impl DBIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // Targets arrive as internal keys; entries are length-prefixed.
        self.scratch.clear();
        self.scratch.write_varint(target.len()).unwrap();
        self.scratch.extend_from_slice(target);
        self.iter.seek(&self.scratch);
    }

    fn next(&mut self) {
        self.iter.next();
    }

    fn prev(&mut self) {
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        let raw = self.iter.entry();
        let (key, _) = decode_length_prefixed_slice(raw).unwrap();
        key
    }

    fn value(&self) -> &[u8] {
        let raw = self.iter.entry();
        let (_, offset) = decode_length_prefixed_slice(raw).unwrap();
        let (value, _) = decode_length_prefixed_slice(&raw[offset..]).unwrap();
        value
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;
    use crate::format::ParsedInternalKey;

    fn new_memtable() -> MemTable {
        let comparator = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        MemTable::new(comparator)
    }

    fn get(table: &MemTable, key: &str, seq: SequenceNumber) -> Result<Option<Vec<u8>>> {
        let comparator = BitwiseComparator {};
        let lookup_key = LookupKey::new(key, seq);
        let mut ctx = GetContext::new(&comparator, None, lookup_key.user_key());
        table.get(&lookup_key, &mut ctx)?;
        ctx.finalize()
    }

    #[test]
    fn test_add_and_get() {
        let table = new_memtable();
        table.add(1, ValueType::Value, "alpha", "one");
        table.add(2, ValueType::Value, "beta", "two");
        table.add(3, ValueType::Deletion, "alpha", "");

        // At sequence 2 the old value is still visible.
        assert_eq!(get(&table, "alpha", 2).unwrap(), Some(b"one".to_vec()));
        // At sequence 3 the deletion wins.
        assert_eq!(get(&table, "alpha", 3).unwrap(), None);
        assert_eq!(get(&table, "beta", 5).unwrap(), Some(b"two".to_vec()));
        assert_eq!(get(&table, "gamma", 5).unwrap(), None);
    }

    #[test]
    fn test_iterator_yields_internal_keys_in_order() {
        let table = new_memtable();
        table.add(1, ValueType::Value, "b", "vb");
        table.add(2, ValueType::Value, "a", "va2");
        table.add(3, ValueType::Value, "a", "va3");

        let mut iter = table.iter();
        iter.seek_to_first();

        // "a" versions first, newest (seq 3) before seq 2, then "b".
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = ParsedInternalKey::parse(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 2),
                (b"b".to_vec(), 1)
            ]
        );
    }

    #[test]
    fn test_count_successive_merges() {
        let table = new_memtable();
        table.add(1, ValueType::Value, "counter", "base");
        table.add(2, ValueType::Merge, "counter", "m1");
        table.add(3, ValueType::Merge, "counter", "m2");

        let lookup = LookupKey::new("counter", 10);
        assert_eq!(table.count_successive_merges(&lookup), 2);

        table.add(4, ValueType::Value, "counter", "fresh");
        assert_eq!(table.count_successive_merges(&lookup), 0);
    }

    #[test]
    fn test_memory_usage_grows() {
        let table = new_memtable();
        let before = table.approximate_memory_usage();
        for i in 0..100 {
            table.add(i, ValueType::Value, format!("key{}", i), "x".repeat(100));
        }
        assert!(table.approximate_memory_usage() > before);
        assert_eq!(table.num_entries(), 100);
    }
}
