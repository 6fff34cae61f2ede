use std::{
    cmp,
    sync::atomic::{AtomicU32, Ordering},
    sync::Arc,
};

use crate::format::extract_user_key;

pub fn bloom_hash(key: &[u8]) -> u32 {
    let mut key = key;
    murmur3::murmur3_32(&mut key, 0xbc9f1d34).unwrap()
}

pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// May return false positives, never false negatives.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

pub struct BloomFilterPolicy {
    bits_per_key: usize,
    hash_num: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // ln(2) * bits/key minimizes the false-positive rate.
        let mut hash_num = (bits_per_key as f64 * 0.69) as usize;
        hash_num = cmp::max(1, hash_num);
        hash_num = cmp::min(30, hash_num);

        BloomFilterPolicy {
            bits_per_key,
            hash_num,
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "stratadb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let mut bits = keys.len() * self.bits_per_key;
        // Tiny filters have large false-positive rates for no space savings.
        bits = cmp::max(bits, 64);

        let bytes = (bits + 7) / 8;
        bits = bytes * 8;
        let init_size = dst.len();
        dst.resize(init_size + bytes + 1, 0);
        *dst.last_mut().unwrap() = self.hash_num as u8;

        let (_, data) = dst.split_at_mut(init_size);
        for key in keys {
            // Double hashing: h and a rotated delta generate hash_num probes.
            let mut h = bloom_hash(key) as usize;
            let delta = (h >> 17) | (h << 15);
            for _ in 0..self.hash_num {
                let bitpos = h % bits;
                data[bitpos / 8] |= 1 << (bitpos % 8) as u8;
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }
        let bits = (len - 1) * 8;
        let hash_num = filter[len - 1] as usize;
        if hash_num > 30 {
            // Reserved for future encodings; err on keeping the key.
            return true;
        }
        let mut h = bloom_hash(key) as usize;
        let delta = (h >> 17) | (h << 15);
        for _ in 0..hash_num {
            let bitpos = h % bits;
            if filter[bitpos / 8] & (1 << (bitpos % 8) as u8) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }

        true
    }
}

/// Adapts a user-key filter policy to the internal keys the table builder
/// feeds it: the tag is stripped before hashing, so filters never distinguish
/// versions of the same user key.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        InternalFilterPolicy { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let stripped: Vec<&[u8]> = keys.iter().map(|k| extract_user_key(k)).collect();
        self.user_policy.create_filter(&stripped, dst)
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_may_match(extract_user_key(key), filter)
    }
}

/// Concurrent-read bloom used for memtable prefix acceleration. Bits are set
/// by the single writer and observed by readers without locking.
pub struct DynamicBloom {
    words: Vec<AtomicU32>,
    total_bits: usize,
    num_probes: usize,
}

impl DynamicBloom {
    pub fn new(total_bits: u32, num_probes: u32) -> Self {
        let total_bits = cmp::max(total_bits, 64) as usize;
        let words = (total_bits + 31) / 32;
        DynamicBloom {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
            total_bits: words * 32,
            num_probes: num_probes.max(1) as usize,
        }
    }

    pub fn add(&self, key: &[u8]) {
        let mut h = bloom_hash(key) as usize;
        let delta = (h >> 17) | (h << 15);
        for _ in 0..self.num_probes {
            let bitpos = h % self.total_bits;
            self.words[bitpos / 32].fetch_or(1 << (bitpos % 32), Ordering::Relaxed);
            h = h.wrapping_add(delta);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        let mut h = bloom_hash(key) as usize;
        let delta = (h >> 17) | (h << 15);
        for _ in 0..self.num_probes {
            let bitpos = h % self.total_bits;
            if self.words[bitpos / 32].load(Ordering::Relaxed) & (1 << (bitpos % 32)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_no_false_negatives() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{:05}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();

        let mut filter = Vec::new();
        policy.create_filter(&refs, &mut filter);

        for k in &keys {
            assert!(policy.key_may_match(k, &filter));
        }
    }

    #[test]
    fn test_bloom_filters_most_absent_keys() {
        let policy = BloomFilterPolicy::new(10);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{:05}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();

        let mut filter = Vec::new();
        policy.create_filter(&refs, &mut filter);

        let mut false_positives = 0;
        for i in 0..1000 {
            let absent = format!("other{:05}", i);
            if policy.key_may_match(absent.as_bytes(), &filter) {
                false_positives += 1;
            }
        }
        // ~1% expected at 10 bits/key; allow generous slack.
        assert!(false_positives < 100, "{} false positives", false_positives);
    }

    #[test]
    fn test_empty_filter_rejects() {
        let policy = BloomFilterPolicy::new(10);
        assert!(!policy.key_may_match(b"anything", &[]));
    }

    #[test]
    fn test_dynamic_bloom() {
        let bloom = DynamicBloom::new(1024, 4);
        for i in 0..100 {
            bloom.add(format!("prefix{}", i).as_bytes());
        }
        for i in 0..100 {
            assert!(bloom.may_contain(format!("prefix{}", i).as_bytes()));
        }
        let mut misses = 0;
        for i in 0..100 {
            if !bloom.may_contain(format!("absent{}", i).as_bytes()) {
                misses += 1;
            }
        }
        assert!(misses > 50);
    }
}
