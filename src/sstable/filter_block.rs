use std::sync::Arc;

use crate::{
    cmp::SliceTransform,
    codec::{decode_u32_le, NumberWriter},
    filter::FilterPolicy,
    format::extract_user_key,
};

// One filter unit covers 2 KiB of data-block bytes.
const FILTER_BASE_LG: usize = 11;
const FILTER_BASE: usize = 1 << FILTER_BASE_LG;

/// Builds the filter block: a run of filter units, an offset table, the
/// offset-table position, and the base log. Keys are flattened into one
/// buffer with a start-offset table to avoid per-key allocations.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,
    keys: Vec<u8>,
    start: Vec<usize>,
    result: Vec<u8>,
    filter_offset: Vec<usize>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self::with_prefix_extractor(policy, None, true)
    }

    pub fn with_prefix_extractor(
        policy: Arc<dyn FilterPolicy>,
        prefix_extractor: Option<Arc<dyn SliceTransform>>,
        whole_key_filtering: bool,
    ) -> Self {
        FilterBlockBuilder {
            policy,
            prefix_extractor,
            whole_key_filtering,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offset: Vec::new(),
        }
    }

    /// `key` is an internal key; what lands in the filter depends on the
    /// whole-key and prefix settings.
    pub fn add_key(&mut self, key: &[u8]) {
        if self.whole_key_filtering {
            self.push_key(key);
        }
        if let Some(extractor) = self.prefix_extractor.clone() {
            let user_key = extract_user_key(key);
            if extractor.in_domain(user_key) {
                // Prefixes are stored with a fresh max tag so the internal
                // policy wrapper strips consistently.
                let prefix = extractor.transform(user_key);
                let mut padded = Vec::with_capacity(prefix.len() + 8);
                padded.extend_from_slice(prefix);
                padded.extend_from_slice(&[0xff; 8]);
                self.push_key(&padded);
            }
        }
    }

    fn push_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn start_block(&mut self, block_offset: usize) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offset.len());

        while filter_index > self.filter_offset.len() {
            self.generate_filter();
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len();
        for offset in self.filter_offset.iter() {
            self.result.write_u32_le(*offset as u32).unwrap();
        }
        self.result.write_u32_le(array_offset as u32).unwrap();
        self.result.push(FILTER_BASE_LG as u8);

        self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        self.filter_offset.push(self.result.len());
        if num_keys == 0 {
            return;
        }

        self.start.push(self.keys.len());
        let keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();
        self.policy.create_filter(&keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

pub struct FilterBlockReader<'a> {
    policy: Arc<dyn FilterPolicy>,
    data: &'a [u8],
    offset: usize,
    num: usize,
    base_lg: usize,
}

impl<'a> FilterBlockReader<'a> {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: &'a [u8]) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: Default::default(),
            offset: 0,
            num: 0,
            base_lg: 0,
        };

        let n = data.len();
        if n < 5 {
            return reader;
        }

        reader.base_lg = data[n - 1] as usize;
        let array_offset = decode_u32_le(&data[n - 5..]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.offset = array_offset;
        reader.data = data;
        reader.num = (n - 5 - array_offset) / 4;
        reader
    }

    pub fn key_may_match(&self, block_offset: usize, key: &[u8]) -> bool {
        let index = block_offset >> self.base_lg;
        if index < self.num {
            let start = decode_u32_le(&self.data[self.offset + index * 4..]) as usize;
            let limit = if index + 1 < self.num {
                decode_u32_le(&self.data[self.offset + (index + 1) * 4..]) as usize
            } else {
                self.offset
            };

            if start == limit {
                // No keys mapped to this range.
                return false;
            }
            if start < limit && limit <= self.offset {
                return self.policy.key_may_match(key, &self.data[start..limit]);
            }
        }
        // Malformed information is treated as "might match".
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{BloomFilterPolicy, InternalFilterPolicy};
    use crate::format::InternalKey;
    use crate::types::ValueType;

    fn internal_policy() -> Arc<dyn FilterPolicy> {
        Arc::new(InternalFilterPolicy::new(Arc::new(BloomFilterPolicy::new(
            10,
        ))))
    }

    fn ikey(user_key: &str) -> InternalKey {
        InternalKey::new(user_key.as_bytes(), 1, ValueType::Value)
    }

    #[test]
    fn test_single_unit() {
        let policy = internal_policy();
        let mut builder = FilterBlockBuilder::new(policy.clone());
        builder.start_block(0);
        builder.add_key(ikey("apple").encode());
        builder.add_key(ikey("banana").encode());
        let data = builder.finish();

        let reader = FilterBlockReader::new(policy, &data);
        assert!(reader.key_may_match(0, ikey("apple").encode()));
        assert!(reader.key_may_match(0, ikey("banana").encode()));
        assert!(!reader.key_may_match(0, ikey("grape").encode()));
    }

    #[test]
    fn test_multiple_units_by_offset() {
        let policy = internal_policy();
        let mut builder = FilterBlockBuilder::new(policy.clone());
        builder.start_block(0);
        builder.add_key(ikey("one").encode());
        builder.start_block(FILTER_BASE * 3);
        builder.add_key(ikey("three").encode());
        let data = builder.finish();

        let reader = FilterBlockReader::new(policy, &data);
        assert!(reader.key_may_match(0, ikey("one").encode()));
        assert!(reader.key_may_match(FILTER_BASE * 3, ikey("three").encode()));
        // Units in between saw no keys at all.
        assert!(!reader.key_may_match(FILTER_BASE, ikey("one").encode()));
    }

    #[test]
    fn test_empty_filter_block_cannot_exclude() {
        let policy = internal_policy();
        let builder = FilterBlockBuilder::new(policy.clone());
        let data = builder.finish();
        let reader = FilterBlockReader::new(policy, &data);
        // With no filter information nothing can be ruled out.
        assert!(reader.key_may_match(0, ikey("whatever").encode()));
    }
}
