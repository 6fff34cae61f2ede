use std::{cmp::Ordering, sync::Arc};

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    env::Env,
    error::{Error, Result},
    format::{extract_tag, extract_user_key, pack_sequence_and_type},
    iterator::DBIterator,
    memtable::MemTable,
    merge::MergingIterator,
    merge_operator::MergeOperator,
    types::{SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK},
    version::Version,
};

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// User-visible iterator: a merging iterator over memtables and tables,
/// filtered to the snapshot sequence, yielding each live user key once with
/// deletions hidden and merge chains resolved. The iterator pins the
/// memtables and Version it reads so its view never changes.
pub struct DBIter<E: Env> {
    inner: MergingIterator<InternalKeyComparator>,
    ucmp: Arc<dyn Comparator>,
    merge_operator: Option<Arc<dyn MergeOperator>>,
    sequence: SequenceNumber,

    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    status: Option<Error>,

    // Held only to keep the sources alive.
    _pinned_mems: Vec<Arc<MemTable>>,
    _pinned_version: Arc<Version<E>>,
}

impl<E: Env> DBIter<E> {
    pub(crate) fn new(
        inner: MergingIterator<InternalKeyComparator>,
        ucmp: Arc<dyn Comparator>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
        sequence: SequenceNumber,
        pinned_mems: Vec<Arc<MemTable>>,
        pinned_version: Arc<Version<E>>,
    ) -> Self {
        DBIter {
            inner,
            ucmp,
            merge_operator,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            _pinned_mems: pinned_mems,
            _pinned_version: pinned_version,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        assert!(self.valid);
        &self.saved_key
    }

    pub fn value(&self) -> &[u8] {
        assert!(self.valid);
        &self.saved_value
    }

    pub fn status(&mut self) -> Result<()> {
        if let Some(err) = self.status.take() {
            return Err(err);
        }
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.inner.seek_to_first();
        self.find_next_user_entry(false);
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn seek(&mut self, user_key: &[u8]) {
        self.direction = Direction::Forward;
        let mut target = Vec::with_capacity(user_key.len() + 8);
        target.extend_from_slice(user_key);
        target.extend_from_slice(
            &pack_sequence_and_type(self.sequence, VALUE_TYPE_FOR_SEEK).to_le_bytes(),
        );
        self.inner.seek(&target);
        self.find_next_user_entry(false);
    }

    pub fn next(&mut self) {
        assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // inner rests before the current key (or off the front): move to
            // the first entry at or after it.
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        assert!(self.valid);

        if self.direction == Direction::Forward {
            // inner rests somewhere within (or just past) the current key's
            // entries: back it up before all of them.
            loop {
                if !self.inner.valid() {
                    // resolution ran off the end of the data
                    self.inner.seek_to_last();
                    if !self.inner.valid() {
                        self.valid = false;
                        return;
                    }
                } else {
                    self.inner.prev();
                    if !self.inner.valid() {
                        self.valid = false;
                        self.saved_key.clear();
                        self.saved_value.clear();
                        return;
                    }
                }
                let ukey = extract_user_key(self.inner.key());
                if self.ucmp.compare(ukey, &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Advances inner to the newest visible, non-hidden entry of the next
    /// acceptable user key. With `skipping`, entries for `saved_key` (and
    /// anything before it) are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        loop {
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            let key = self.inner.key();
            let tag = extract_tag(key);
            let sequence = tag >> 8;

            if sequence <= self.sequence {
                let ukey = extract_user_key(key);
                if skipping && self.ucmp.compare(ukey, &self.saved_key) != Ordering::Greater {
                    // hidden by a newer deletion or already yielded
                } else {
                    match ValueType::try_from((tag & 0xff) as u8) {
                        Ok(ValueType::Deletion) => {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(ukey);
                            skipping = true;
                        }
                        Ok(ValueType::Value) => {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(ukey);
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.inner.value());
                            self.valid = true;
                            return;
                        }
                        Ok(ValueType::Merge) => {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(ukey);
                            self.resolve_merge_forward();
                            return;
                        }
                        Err(e) => {
                            self.status.get_or_insert(e);
                            self.valid = false;
                            return;
                        }
                    }
                }
            }
            self.inner.next();
        }
    }

    /// inner sits on the newest visible MERGE entry of `saved_key`; walk the
    /// chain down to its base and combine.
    fn resolve_merge_forward(&mut self) {
        let mut operands: Vec<Vec<u8>> = vec![self.inner.value().to_vec()];
        let mut base: Option<Vec<u8>> = None;

        loop {
            self.inner.next();
            if !self.inner.valid() {
                break;
            }
            let key = self.inner.key();
            if self.ucmp.compare(extract_user_key(key), &self.saved_key) != Ordering::Equal {
                break;
            }
            let tag = extract_tag(key);
            match ValueType::try_from((tag & 0xff) as u8) {
                Ok(ValueType::Merge) => operands.push(self.inner.value().to_vec()),
                Ok(ValueType::Value) => {
                    base = Some(self.inner.value().to_vec());
                    break;
                }
                Ok(ValueType::Deletion) => break,
                Err(e) => {
                    self.status.get_or_insert(e);
                    self.valid = false;
                    return;
                }
            }
        }

        // Operands were collected newest first.
        operands.reverse();
        match &self.merge_operator {
            Some(op) => match op.full_merge(&self.saved_key, base.as_deref(), &operands) {
                Some(v) => {
                    self.saved_value = v;
                    self.valid = true;
                }
                None => {
                    self.status
                        .get_or_insert(Error::Corruption("merge operator failed".into()));
                    self.valid = false;
                }
            },
            None => {
                self.status.get_or_insert(Error::MergeInProgress(
                    "merge entries require a merge operator".into(),
                ));
                self.valid = false;
            }
        }
    }

    /// Walks backward, resolving the newest visible state of each user key
    /// oldest-entry-first, and stops once a visible key is complete.
    fn find_prev_user_entry(&mut self) {
        let mut resolving = false;
        let mut base: Option<Vec<u8>> = None;
        // oldest first, built up naturally while walking backward
        let mut operands: Vec<Vec<u8>> = Vec::new();

        self.saved_key.clear();
        self.saved_value.clear();

        while self.inner.valid() {
            let key = self.inner.key();
            let tag = extract_tag(key);
            if (tag >> 8) > self.sequence {
                self.inner.prev();
                continue;
            }
            let ukey = extract_user_key(key);

            if resolving && self.ucmp.compare(ukey, &self.saved_key) != Ordering::Equal {
                if base.is_some() || !operands.is_empty() {
                    // The key we were resolving is visible; emit it. inner
                    // stays on the earlier key for the next prev().
                    break;
                }
                // Entirely deleted; restart on this earlier key.
                resolving = false;
            }

            if !resolving {
                resolving = true;
                base = None;
                operands.clear();
                self.saved_key.clear();
                self.saved_key.extend_from_slice(ukey);
            }

            match ValueType::try_from((tag & 0xff) as u8) {
                Ok(ValueType::Value) => {
                    base = Some(self.inner.value().to_vec());
                    operands.clear();
                }
                Ok(ValueType::Deletion) => {
                    base = None;
                    operands.clear();
                }
                Ok(ValueType::Merge) => {
                    operands.push(self.inner.value().to_vec());
                }
                Err(e) => {
                    self.status.get_or_insert(e);
                    self.valid = false;
                    return;
                }
            }
            self.inner.prev();
        }

        if !resolving || (base.is_none() && operands.is_empty()) {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
            return;
        }

        if operands.is_empty() {
            self.saved_value = base.expect("visible key without value");
            self.valid = true;
            return;
        }

        match &self.merge_operator {
            Some(op) => match op.full_merge(&self.saved_key, base.as_deref(), &operands) {
                Some(v) => {
                    self.saved_value = v;
                    self.valid = true;
                }
                None => {
                    self.status
                        .get_or_insert(Error::Corruption("merge operator failed".into()));
                    self.valid = false;
                }
            },
            None => {
                self.status.get_or_insert(Error::MergeInProgress(
                    "merge entries require a merge operator".into(),
                ));
                self.valid = false;
            }
        }
    }
}
