use super::format::BlockContent;
use crate::{
    codec::{decode_u32_le, VarIntReader},
    cmp::Comparator,
    error::{Error, Result},
    iterator::DBIterator,
};
use std::{cmp::Ordering, sync::Arc};

const RESTART_SIZE: usize = 4;

/// Decoded block: entries, then an array of fixed32 restart offsets, then a
/// fixed32 restart count.
pub struct Block {
    content: Arc<BlockContent>,
    restart_offset: u32,
    num_restarts: u32,
}

impl Block {
    pub fn from_raw(content: BlockContent) -> Result<Self> {
        let n = content.len();
        if n < RESTART_SIZE {
            return Err(Error::Corruption("block too small".into()));
        }
        let num_restarts = decode_u32_le(&content[n - 4..]);
        let max_restarts_allowed = (n - RESTART_SIZE) / RESTART_SIZE;
        if num_restarts as usize > max_restarts_allowed || num_restarts == 0 {
            Err(Error::Corruption("bad block contents".into()))
        } else {
            Ok(Block {
                content: Arc::new(content),
                restart_offset: (n - RESTART_SIZE) as u32 - num_restarts * RESTART_SIZE as u32,
                num_restarts,
            })
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter::new(self, comparator)
    }
}

pub struct BlockIter {
    content: Arc<BlockContent>,
    comparator: Arc<dyn Comparator>,

    restarts: u32,
    num_restarts: u32,

    // offset of the current entry; == restarts when invalid
    current: u32,
    restart_index: u32,
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    err: Option<Error>,
}

impl BlockIter {
    pub fn new(block: &Block, comparator: Arc<dyn Comparator>) -> Self {
        BlockIter {
            content: block.content.clone(),
            comparator,

            restarts: block.restart_offset,
            num_restarts: block.num_restarts,

            current: block.restart_offset,
            restart_index: block.num_restarts,

            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            err: None,
        }
    }

    #[inline]
    fn next_entry_offset(&self) -> u32 {
        (self.value_offset + self.value_len) as u32
    }

    fn get_restart_point(&self, index: u32) -> u32 {
        assert!(index < self.num_restarts);
        let offset = self.restarts as usize + RESTART_SIZE * index as usize;
        decode_u32_le(&self.content[offset..])
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        let offset = self.get_restart_point(index);
        // An empty pending "value" at the restart offset makes
        // next_entry_offset land on the restart's first entry.
        self.value_offset = offset as usize;
        self.value_len = 0;
    }

    /// Returns (shared, non_shared, value_len, header_len) of the entry at
    /// `offset`.
    fn decode_entry(&self, offset: u32) -> Result<(u32, u32, u32, u32)> {
        if self.restarts - offset < 3 {
            return Err(Error::Corruption("bad entry in block".into()));
        }
        let data = &self.content[offset as usize..self.restarts as usize];

        let (shared, non_shared, value_len, header_len);
        if (data[0] | data[1] | data[2]) < 128 {
            // All three lengths fit in one byte each.
            shared = data[0] as u32;
            non_shared = data[1] as u32;
            value_len = data[2] as u32;
            header_len = 3;
        } else {
            let mut buf = data;
            let (s, l1) = buf.read_var_u32()?;
            let (n, l2) = buf.read_var_u32()?;
            let (v, l3) = buf.read_var_u32()?;
            shared = s;
            non_shared = n;
            value_len = v;
            header_len = (l1 + l2 + l3) as u32;
        }

        if (self.restarts - offset - header_len) < non_shared + value_len {
            return Err(Error::Corruption("bad entry in block".into()));
        }

        Ok((shared, non_shared, value_len, header_len))
    }

    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts {
            self.current = self.restarts;
            self.restart_index = self.num_restarts;
            return false;
        }

        match self.decode_entry(self.current) {
            Ok((shared, non_shared, value_len, header_len)) => {
                let key_offset = (self.current + header_len) as usize;
                if shared as usize > self.key.len() {
                    self.corruption_err();
                    return false;
                }
                self.key.truncate(shared as usize);
                self.key
                    .extend_from_slice(&self.content[key_offset..key_offset + non_shared as usize]);
                self.value_offset = key_offset + non_shared as usize;
                self.value_len = value_len as usize;
                while self.restart_index + 1 < self.num_restarts
                    && self.get_restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            Err(_) => {
                self.corruption_err();
                false
            }
        }
    }

    fn corruption_err(&mut self) {
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
        self.err
            .get_or_insert(Error::Corruption("bad entry in block".into()));
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }
}

impl DBIterator for BlockIter {
    fn valid(&self) -> bool {
        self.err.is_none() && self.current < self.restarts
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.num_restarts - 1);
        while self.parse_next_entry() && self.next_entry_offset() < self.restarts {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search over restart points for the last restart whose key
        // is < target, then scan linearly within the region.
        let (mut left, mut right) = (0u32, self.num_restarts - 1);
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.get_restart_point(mid);
            match self.decode_entry(region_offset) {
                Ok((shared, non_shared, _, header_len)) => {
                    if shared != 0 {
                        // Restart keys are stored whole.
                        self.corruption_err();
                        return;
                    }
                    let key_offset = (region_offset + header_len) as usize;
                    let key = &self.content[key_offset..key_offset + non_shared as usize];
                    if self.compare(key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                Err(_) => {
                    self.corruption_err();
                    return;
                }
            }
        }

        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        assert!(self.valid());

        // Back up to the restart point before the current entry, then scan
        // forward until just before it.
        let original = self.current;
        while self.get_restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.current = self.restarts;
                self.restart_index = self.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.content[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&mut self) -> Result<()> {
        if let Some(err) = self.err.take() {
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{cmp::BitwiseComparator, sstable::block_builder::BlockBuilder};

    use super::*;

    fn test_data() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (b"key1".as_slice(), b"value1".as_slice()),
            (b"loooooooooooooooooooongerkey1", b"shortval1"),
            (b"medium length key 1", b"some value 2"),
            (b"prefix_key1", b"value"),
            (b"prefix_key2", b"value"),
            (b"prefix_key3", b"value"),
        ]
    }

    fn build_block(restart_interval: u32) -> Block {
        let comparator = Arc::new(BitwiseComparator {});
        let mut builder = BlockBuilder::new(comparator, restart_interval);
        for &(k, v) in test_data().iter() {
            builder.add(k, v);
        }
        Block::from_raw(BlockContent::new(builder.finish())).unwrap()
    }

    #[test]
    fn test_forward_scan() {
        let block = build_block(3);
        let mut iter = block.iter(Arc::new(BitwiseComparator {}));

        iter.seek_to_first();
        for &(key, val) in test_data().iter() {
            assert!(iter.valid());
            assert_eq!(key, iter.key());
            assert_eq!(val, iter.value());
            iter.next();
        }
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_seek_positions_on_or_after_target() {
        let block = build_block(2);
        let mut iter = block.iter(Arc::new(BitwiseComparator {}));

        iter.seek(b"prefix_key2");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"prefix_key2");

        iter.seek(b"prefix_key2a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"prefix_key3");

        iter.seek(b"a");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key1");

        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_backward_scan() {
        let block = build_block(3);
        let mut iter = block.iter(Arc::new(BitwiseComparator {}));

        iter.seek_to_last();
        let data = test_data();
        for &(key, val) in data.iter().rev() {
            assert!(iter.valid());
            assert_eq!(key, iter.key());
            assert_eq!(val, iter.value());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::from_raw(BlockContent::new(vec![1, 2])).is_err());
        // restart count absurdly large
        assert!(Block::from_raw(BlockContent::new(vec![0xff; 8])).is_err());
    }
}
