use std::cmp::Ordering;

use crate::{cmp::Comparator, error::Result, iterator::DBIterator};

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// K-way ordered merge over child iterators. Children are few (memtables,
/// L0 files, one per deeper level), so the current child is found by a
/// linear scan rather than a heap; direction reversal re-seeks the others
/// around the pivot key.
pub struct MergingIterator<C: Comparator> {
    children: Vec<Box<dyn DBIterator>>,
    current: Option<usize>,
    comparator: C,
    direction: Direction,
    pivot: Vec<u8>,
}

impl<C: Comparator> MergingIterator<C> {
    pub fn new(comparator: C, children: Vec<Box<dyn DBIterator>>) -> Self {
        MergingIterator {
            children,
            current: None,
            comparator,
            direction: Direction::Forward,
            pivot: Vec::new(),
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if child.valid() {
                match smallest {
                    Some(small)
                        if self
                            .comparator
                            .compare(child.key(), self.children[small].key())
                            != Ordering::Less => {}
                    _ => smallest = Some(idx),
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if child.valid() {
                match largest {
                    Some(large)
                        if self
                            .comparator
                            .compare(child.key(), self.children[large].key())
                            != Ordering::Greater => {}
                    _ => largest = Some(idx),
                }
            }
        }
        self.current = largest;
    }

    fn save_pivot(&mut self) {
        let key = self.children[self.current.unwrap()].key();
        self.pivot.clear();
        self.pivot.extend_from_slice(key);
    }
}

impl<C: Comparator> DBIterator for MergingIterator<C> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        assert!(self.valid());

        let current = self.current.unwrap();
        if self.direction == Direction::Reverse {
            // The other children sit before the pivot; put each at its first
            // entry after it.
            self.save_pivot();
            for pos in 0..self.children.len() {
                if pos == current {
                    continue;
                }
                self.children[pos].seek(&self.pivot);
                let at_pivot = self.children[pos].valid()
                    && self
                        .comparator
                        .compare(&self.pivot, self.children[pos].key())
                        == Ordering::Equal;
                if at_pivot {
                    self.children[pos].next();
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next();
        self.find_smallest()
    }

    fn prev(&mut self) {
        assert!(self.valid());

        let current = self.current.unwrap();
        if self.direction == Direction::Forward {
            // The other children sit at or after the pivot; put each at its
            // last entry before it.
            self.save_pivot();
            for pos in 0..self.children.len() {
                if pos == current {
                    continue;
                }
                self.children[pos].seek(&self.pivot);
                if self.children[pos].valid() {
                    self.children[pos].prev();
                } else {
                    self.children[pos].seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }
        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].value()
    }

    fn status(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;

    /// Simple sorted-vec iterator for merge tests.
    struct VecIter {
        data: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecIter {
        fn new(mut data: Vec<(&str, &str)>) -> Box<dyn DBIterator> {
            data.sort();
            Box::new(VecIter {
                data: data
                    .into_iter()
                    .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                    .collect(),
                pos: None,
            })
        }
    }

    impl DBIterator for VecIter {
        fn valid(&self) -> bool {
            self.pos.map(|p| p < self.data.len()).unwrap_or(false)
        }

        fn seek_to_first(&mut self) {
            self.pos = Some(0);
        }

        fn seek_to_last(&mut self) {
            self.pos = if self.data.is_empty() {
                None
            } else {
                Some(self.data.len() - 1)
            };
        }

        fn seek(&mut self, target: &[u8]) {
            self.pos = Some(
                self.data
                    .partition_point(|(k, _)| k.as_slice() < target),
            );
        }

        fn next(&mut self) {
            self.pos = self.pos.map(|p| p + 1);
        }

        fn prev(&mut self) {
            match self.pos {
                Some(0) | None => self.pos = Some(self.data.len()),
                Some(p) => self.pos = Some(p - 1),
            }
        }

        fn key(&self) -> &[u8] {
            &self.data[self.pos.unwrap()].0
        }

        fn value(&self) -> &[u8] {
            &self.data[self.pos.unwrap()].1
        }

        fn status(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn merged() -> MergingIterator<BitwiseComparator> {
        MergingIterator::new(
            BitwiseComparator {},
            vec![
                VecIter::new(vec![("a", "1"), ("d", "4"), ("g", "7")]),
                VecIter::new(vec![("b", "2"), ("e", "5")]),
                VecIter::new(vec![("c", "3"), ("f", "6")]),
            ],
        )
    }

    #[test]
    fn test_forward_merge() {
        let mut iter = merged();
        iter.seek_to_first();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g"]);
    }

    #[test]
    fn test_seek_then_scan() {
        let mut iter = merged();
        iter.seek(b"d");
        assert_eq!(iter.key(), b"d");
        iter.next();
        assert_eq!(iter.key(), b"e");
    }

    #[test]
    fn test_direction_reversal() {
        let mut iter = merged();
        iter.seek(b"d");
        iter.prev();
        assert_eq!(iter.key(), b"c");
        iter.prev();
        assert_eq!(iter.key(), b"b");
        iter.next();
        assert_eq!(iter.key(), b"c");
    }

    #[test]
    fn test_backward_merge() {
        let mut iter = merged();
        iter.seek_to_last();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.prev();
        }
        assert_eq!(keys, vec![b"g", b"f", b"e", b"d", b"c", b"b", b"a"]);
    }
}
