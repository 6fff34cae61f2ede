use rand::{thread_rng, Rng};
use std::{
    cmp::Ordering,
    ptr,
    slice::from_raw_parts,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
};

use super::arena::Arena;
use crate::cmp::Comparator;

const MAX_HEIGHT: usize = 12;
const BRANCHING_FACTOR: u32 = 4;

#[repr(C)]
struct Node {
    entry_ptr: *const u8,
    entry_len: usize,
    height: usize,
    tower: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    fn entry(&self) -> &[u8] {
        unsafe { from_raw_parts(self.entry_ptr, self.entry_len) }
    }

    #[inline]
    fn next(&self, level: usize) -> *mut Node {
        // Acquire pairs with the release store in `set_next`, making the
        // pointed-to node's fields visible to this thread.
        self.tower[level].load(AtomicOrdering::Acquire)
    }

    #[inline]
    fn set_next(&self, level: usize, node: *mut Node) {
        self.tower[level].store(node, AtomicOrdering::Release);
    }

    #[inline]
    fn set_next_relaxed(&self, level: usize, node: *mut Node) {
        self.tower[level].store(node, AtomicOrdering::Relaxed);
    }
}

/// Probabilistic ordered index over arena-owned entries. One writer at a
/// time; any number of concurrent readers. A new node becomes visible by
/// publishing its forward pointers with release ordering; readers observe
/// them with acquire loads and need no other synchronization.
pub struct SkipList {
    head: *mut Node,
    arena: Mutex<Arena>,
    comparator: Arc<dyn Comparator>,
    max_height: AtomicUsize,
    len: AtomicUsize,
}

unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub fn new(comparator: Arc<dyn Comparator>) -> Self {
        let mut arena = Arena::new();
        let head = Self::new_node(&mut arena, &[], MAX_HEIGHT);
        SkipList {
            head,
            arena: Mutex::new(arena),
            comparator,
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.arena.lock().unwrap().memory_usage()
    }

    fn new_node(arena: &mut Arena, entry: &[u8], height: usize) -> *mut Node {
        let entry_ptr = if entry.is_empty() {
            ptr::null()
        } else {
            let p = arena.allocate(entry.len());
            unsafe {
                ptr::copy_nonoverlapping(entry.as_ptr(), p, entry.len());
            }
            p as *const u8
        };

        let node_mem = arena.allocate_aligned(std::mem::size_of::<Node>()) as *mut Node;
        unsafe {
            ptr::write(
                node_mem,
                Node {
                    entry_ptr,
                    entry_len: entry.len(),
                    height,
                    tower: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
                },
            );
        }
        node_mem
    }

    fn random_height() -> usize {
        let mut height = 1;
        let mut rng = thread_rng();
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING_FACTOR) == 0 {
            height += 1;
        }
        height
    }

    #[inline]
    fn key_is_after_node(&self, key: &[u8], node: *const Node) -> bool {
        if node.is_null() {
            return false;
        }
        unsafe { self.comparator.compare((*node).entry(), key) == Ordering::Less }
    }

    /// Returns the first node whose entry is >= key, recording the
    /// predecessor at every level in `prevs` if given.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prevs: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut current = self.head;
        let mut level = self.max_height.load(AtomicOrdering::Relaxed) - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if self.key_is_after_node(key, next) {
                current = next;
            } else {
                if let Some(ref mut p) = prevs {
                    p[level] = current;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Returns the last node whose entry is < key, or the head.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut current = self.head;
        let mut level = self.max_height.load(AtomicOrdering::Relaxed) - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if self.key_is_after_node(key, next) {
                current = next;
            } else if level == 0 {
                return current;
            } else {
                level -= 1;
            }
        }
    }

    fn find_last(&self) -> *mut Node {
        let mut current = self.head;
        let mut level = self.max_height.load(AtomicOrdering::Relaxed) - 1;
        loop {
            let next = unsafe { (*current).next(level) };
            if !next.is_null() {
                current = next;
            } else if level == 0 {
                return current;
            } else {
                level -= 1;
            }
        }
    }

    /// Inserts an entry. The caller guarantees a single writer and that no
    /// equal entry exists (internal keys are unique by sequence number).
    pub fn insert(&self, entry: &[u8]) {
        let mut prevs: [*mut Node; MAX_HEIGHT] = [self.head; MAX_HEIGHT];
        let next = self.find_greater_or_equal(entry, Some(&mut prevs));
        if !next.is_null() {
            unsafe {
                assert!(
                    self.comparator.compare((*next).entry(), entry) != Ordering::Equal,
                    "duplicate entry inserted into skiplist"
                );
            }
        }

        let height = Self::random_height();
        let max_height = self.max_height.load(AtomicOrdering::Relaxed);
        if height > max_height {
            for prev in prevs.iter_mut().take(height).skip(max_height) {
                *prev = self.head;
            }
            // Racing readers that see the new height before the links below
            // just walk from head through null pointers, which is harmless.
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = {
            let mut arena = self.arena.lock().unwrap();
            Self::new_node(&mut arena, entry, height)
        };

        for (level, prev) in prevs.iter().enumerate().take(height) {
            unsafe {
                // Link the new node in before publishing it from the
                // predecessor; the release store makes both visible.
                (*node).set_next_relaxed(level, (**prev).next(level));
                (**prev).set_next(level, node);
            }
        }
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null()
            && unsafe { self.comparator.compare((*node).entry(), key) == Ordering::Equal }
    }
}

pub struct SkipListIter {
    list: Arc<SkipList>,
    current: *const Node,
}

impl SkipListIter {
    pub fn new(list: Arc<SkipList>) -> Self {
        SkipListIter {
            list,
            current: ptr::null(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.current.is_null()
    }

    pub fn seek_to_first(&mut self) {
        self.current = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.current = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.current = self.list.find_greater_or_equal(target, None);
    }

    pub fn next(&mut self) {
        assert!(self.valid());
        self.current = unsafe { (*self.current).next(0) };
    }

    pub fn prev(&mut self) {
        assert!(self.valid());
        let node = self.list.find_less_than(unsafe { (*self.current).entry() });
        self.current = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }

    pub fn entry(&self) -> &[u8] {
        assert!(self.valid());
        unsafe { (*self.current).entry() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;

    fn new_list() -> Arc<SkipList> {
        Arc::new(SkipList::new(Arc::new(BitwiseComparator {})))
    }

    #[test]
    fn test_insert_and_lookup() {
        let list = new_list();
        let keys: &[&[u8]] = &[b"delta", b"alpha", b"echo", b"bravo", b"charlie"];
        for k in keys {
            list.insert(k);
        }
        assert_eq!(list.len(), keys.len());
        for k in keys {
            assert!(list.contains(k));
        }
        assert!(!list.contains(b"foxtrot"));
    }

    #[test]
    fn test_iteration_is_sorted() {
        let list = new_list();
        for k in ["m", "a", "z", "k", "b"] {
            list.insert(k.as_bytes());
        }
        let mut iter = SkipListIter::new(list);
        iter.seek_to_first();
        let mut collected = Vec::new();
        while iter.valid() {
            collected.push(iter.entry().to_vec());
            iter.next();
        }
        assert_eq!(collected, vec![b"a".to_vec(), b"b".to_vec(), b"k".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_seek_and_prev() {
        let list = new_list();
        for k in ["a", "c", "e", "g"] {
            list.insert(k.as_bytes());
        }
        let mut iter = SkipListIter::new(list);
        iter.seek(b"d");
        assert!(iter.valid());
        assert_eq!(iter.entry(), b"e");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.entry(), b"c");

        iter.seek(b"a");
        assert_eq!(iter.entry(), b"a");
        iter.prev();
        assert!(!iter.valid());

        iter.seek_to_last();
        assert_eq!(iter.entry(), b"g");
        iter.seek(b"h");
        assert!(!iter.valid());
    }

    #[test]
    fn test_concurrent_readers_during_insert() {
        use std::thread;

        let list = new_list();
        let reader_list = list.clone();
        let writer = thread::spawn(move || {
            for i in 0..1000u32 {
                list.insert(format!("key{:08}", i).as_bytes());
            }
        });
        let reader = thread::spawn(move || {
            for _ in 0..100 {
                let mut iter = SkipListIter::new(reader_list.clone());
                iter.seek_to_first();
                let mut prev: Option<Vec<u8>> = None;
                while iter.valid() {
                    let cur = iter.entry().to_vec();
                    if let Some(p) = prev {
                        assert!(p < cur);
                    }
                    prev = Some(cur);
                    iter.next();
                }
            }
        });
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
