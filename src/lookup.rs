use std::cmp::Ordering;

use crate::{
    cmp::Comparator,
    error::{Error, Result},
    merge_operator::MergeOperator,
    types::ValueType,
};

#[derive(PartialEq, Debug, Clone, Copy)]
enum GetState {
    NotFound,
    Found,
    Deleted,
    Merging,
}

/// Accumulator for a point lookup. Sources feed versions of one user key in
/// newest-to-oldest order (memtable, then immutable memtables, then tables
/// level by level); the context decides when the answer is complete, which
/// lets MERGE operand chains span sources.
pub struct GetContext<'a> {
    user_comparator: &'a dyn Comparator,
    merge_operator: Option<&'a dyn MergeOperator>,
    user_key: &'a [u8],
    state: GetState,
    value: Vec<u8>,
    // newest first, as encountered
    operands: Vec<Vec<u8>>,
    no_operator: bool,
    merge_failed: bool,
}

impl<'a> GetContext<'a> {
    pub fn new(
        user_comparator: &'a dyn Comparator,
        merge_operator: Option<&'a dyn MergeOperator>,
        user_key: &'a [u8],
    ) -> Self {
        GetContext {
            user_comparator,
            merge_operator,
            user_key,
            state: GetState::NotFound,
            value: Vec::new(),
            operands: Vec::new(),
            no_operator: false,
            merge_failed: false,
        }
    }

    pub fn user_key(&self) -> &[u8] {
        self.user_key
    }

    pub fn matches(&self, user_key: &[u8]) -> bool {
        self.user_comparator.compare(user_key, self.user_key) == Ordering::Equal
    }

    /// Resolution is complete; stop feeding.
    pub fn done(&self) -> bool {
        matches!(self.state, GetState::Found | GetState::Deleted)
    }

    /// Feeds one version of the user key. Returns `done()`.
    pub fn sees(&mut self, t: ValueType, value: &[u8]) -> bool {
        debug_assert!(!self.done());
        match t {
            ValueType::Value => {
                if self.state == GetState::Merging {
                    self.resolve_merge(Some(value));
                } else {
                    self.value.clear();
                    self.value.extend_from_slice(value);
                    self.state = GetState::Found;
                }
            }
            ValueType::Deletion => {
                if self.state == GetState::Merging {
                    self.resolve_merge(None);
                } else {
                    self.state = GetState::Deleted;
                }
            }
            ValueType::Merge => {
                self.operands.push(value.to_vec());
                self.state = GetState::Merging;
            }
        }
        self.done()
    }

    fn resolve_merge(&mut self, base: Option<&[u8]>) {
        match self.merge_operator {
            Some(op) => {
                let mut ordered = self.operands.clone();
                ordered.reverse();
                match op.full_merge(self.user_key, base, &ordered) {
                    Some(v) => {
                        self.value = v;
                        self.state = GetState::Found;
                    }
                    None => {
                        self.value.clear();
                        self.operands.clear();
                        self.state = GetState::Deleted;
                        self.merge_failed = true;
                    }
                }
            }
            None => {
                self.state = GetState::Found;
                self.no_operator = true;
            }
        }
    }

    pub fn finalize(mut self) -> Result<Option<Vec<u8>>> {
        if self.state == GetState::Merging {
            // The key exists only as a chain of operands.
            self.resolve_merge(None);
        }
        if self.no_operator {
            return Err(Error::MergeInProgress(
                "merge operands found but no merge operator configured".into(),
            ));
        }
        if self.merge_failed {
            return Err(Error::Corruption("merge operator failed to merge".into()));
        }
        match self.state {
            GetState::Found => Ok(Some(std::mem::take(&mut self.value))),
            GetState::Deleted | GetState::NotFound => Ok(None),
            GetState::Merging => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;
    use crate::merge_operator::U64AddOperator;

    #[test]
    fn test_plain_value_wins() {
        let cmp = BitwiseComparator {};
        let mut ctx = GetContext::new(&cmp, None, b"k");
        assert!(ctx.sees(ValueType::Value, b"v1"));
        assert_eq!(ctx.finalize().unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_deletion_hides_older_versions() {
        let cmp = BitwiseComparator {};
        let mut ctx = GetContext::new(&cmp, None, b"k");
        assert!(ctx.sees(ValueType::Deletion, b""));
        assert_eq!(ctx.finalize().unwrap(), None);
    }

    #[test]
    fn test_merge_chain_resolves_against_base() {
        let cmp = BitwiseComparator {};
        let op = U64AddOperator {};
        let mut ctx = GetContext::new(&cmp, Some(&op), b"k");
        // fed newest-to-oldest: +2, +3, then base 5
        assert!(!ctx.sees(ValueType::Merge, &2u64.to_le_bytes()));
        assert!(!ctx.sees(ValueType::Merge, &3u64.to_le_bytes()));
        assert!(ctx.sees(ValueType::Value, &5u64.to_le_bytes()));
        assert_eq!(ctx.finalize().unwrap(), Some(10u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_merge_without_base_uses_empty_existing() {
        let cmp = BitwiseComparator {};
        let op = U64AddOperator {};
        let mut ctx = GetContext::new(&cmp, Some(&op), b"k");
        assert!(!ctx.sees(ValueType::Merge, &7u64.to_le_bytes()));
        assert_eq!(ctx.finalize().unwrap(), Some(7u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_merge_without_operator_is_an_error() {
        let cmp = BitwiseComparator {};
        let mut ctx = GetContext::new(&cmp, None, b"k");
        ctx.sees(ValueType::Merge, b"op");
        assert!(matches!(ctx.finalize(), Err(Error::MergeInProgress(_))));
    }
}
