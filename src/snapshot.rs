use std::sync::Arc;

use crate::types::SequenceNumber;

/// A pinned sequence number. While alive, compaction keeps every version a
/// reader at this sequence could observe.
pub struct Snapshot {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

/// Live snapshots ordered by sequence. Sequences only grow, so insertion is
/// a push; release unlinks by identity.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: Vec<Arc<Snapshot>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        SnapshotList::default()
    }

    pub fn new_snapshot(&mut self, sequence: SequenceNumber) -> Arc<Snapshot> {
        debug_assert!(self
            .snapshots
            .last()
            .map(|s| s.sequence <= sequence)
            .unwrap_or(true));
        let snapshot = Arc::new(Snapshot { sequence });
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    pub fn release(&mut self, snapshot: &Arc<Snapshot>) {
        self.snapshots.retain(|s| !Arc::ptr_eq(s, snapshot));
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.snapshots.first().map(|s| s.sequence)
    }

    /// All live sequences, ascending. Compaction snapshots this set once at
    /// the start of a job.
    pub fn sequences(&self) -> Vec<SequenceNumber> {
        self.snapshots.iter().map(|s| s.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_and_released() {
        let mut list = SnapshotList::new();
        let s1 = list.new_snapshot(5);
        let s2 = list.new_snapshot(9);
        let s3 = list.new_snapshot(9);

        assert_eq!(list.oldest(), Some(5));
        assert_eq!(list.sequences(), vec![5, 9, 9]);

        list.release(&s1);
        assert_eq!(list.oldest(), Some(9));

        // Releasing one of two equal-sequence snapshots keeps the other.
        list.release(&s2);
        assert_eq!(list.oldest(), Some(9));
        list.release(&s3);
        assert!(list.is_empty());
    }
}
