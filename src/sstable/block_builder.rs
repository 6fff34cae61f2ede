use std::{
    cmp::{self, Ordering},
    sync::Arc,
};

use integer_encoding::{FixedIntWriter, VarIntWriter};

use crate::cmp::Comparator;

/// Builds the prefix-compressed entry stream of one block: entries between
/// restart points share a prefix with their predecessor; every
/// `block_restart_interval` entries the full key is stored so readers can
/// binary-search across restart points.
pub struct BlockBuilder {
    comparator: Arc<dyn Comparator>,
    block_restart_interval: u32,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: u32,
    last_key: Vec<u8>,
    restart_counter: u32,
}

impl BlockBuilder {
    pub fn new(comparator: Arc<dyn Comparator>, block_restart_interval: u32) -> Self {
        assert!(block_restart_interval >= 1);
        BlockBuilder {
            comparator,
            block_restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            restart_counter: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.counter as usize
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + 4 * self.restarts.len() + 4
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.last_key.clear();
        self.restart_counter = 0;
        self.counter = 0;
    }

    pub fn add<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, val: V) {
        let key = key.as_ref();
        let val = val.as_ref();

        assert!(self.restart_counter <= self.block_restart_interval);
        assert!(
            self.buffer.is_empty()
                || self.comparator.compare(key, &self.last_key) == Ordering::Greater
        );

        let mut shared = 0;
        if self.restart_counter < self.block_restart_interval {
            let smallest = cmp::min(key.len(), self.last_key.len());
            while shared < smallest && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.restart_counter = 0;
        }

        let non_shared = key.len() - shared;

        self.buffer.write_varint(shared).unwrap();
        self.buffer.write_varint(non_shared).unwrap();
        self.buffer.write_varint(val.len()).unwrap();

        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(val);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);

        self.restart_counter += 1;
        self.counter += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buffer.reserve(self.restarts.len() * 4 + 4);
        for r in self.restarts.iter() {
            self.buffer.write_fixedint(*r).unwrap();
        }
        self.buffer
            .write_fixedint(self.restarts.len() as u32)
            .unwrap();

        self.buffer
    }
}
