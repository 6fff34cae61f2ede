use std::{cmp::Ordering, sync::Arc};

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    env::Env,
    format::InternalKey,
    options::Options,
    version::{max_file_size_for_level, total_file_size, FileMetaData, Version},
    version_edit::VersionEdit,
};

/// User hook consulted for each surviving VALUE entry during compaction.
pub trait CompactionFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(&self, level: usize, user_key: &[u8], existing_value: &[u8]) -> FilterDecision;
}

pub enum FilterDecision {
    Keep,
    Remove,
    Change(Vec<u8>),
}

/// Produces a fresh `CompactionFilter` per compaction job.
pub trait CompactionFilterFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, level: usize) -> Arc<dyn CompactionFilter>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub count: u64,
}

impl CompactionStats {
    pub fn add(&mut self, other: CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.count += other.count;
    }
}

/// A picked compaction: inputs at `level` (and the overlapping files at the
/// output level), grandparent bookkeeping for output cutting, and the edit
/// the driver fills in.
pub struct Compaction<E: Env> {
    pub cf_id: u32,
    level: usize,
    output_level: usize,
    max_output_file_size: u64,
    grandparent_overlap_cap: u64,

    input_version: Option<Arc<Version<E>>>,
    pub edit: VersionEdit,
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
    pub grandparents: Vec<Arc<FileMetaData>>,

    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    level_ptrs: Vec<usize>,

    /// FIFO deletes inputs without writing outputs.
    pub deletion_only: bool,
}

impl<E: Env> Compaction<E> {
    pub fn new(
        options: &Options,
        cf_id: u32,
        level: usize,
        output_level: usize,
        input_version: Arc<Version<E>>,
    ) -> Self {
        let num_levels = input_version.num_levels();
        let mut edit = VersionEdit::new();
        edit.set_column_family(cf_id);
        Compaction {
            cf_id,
            level,
            output_level,
            max_output_file_size: max_file_size_for_level(options, output_level),
            grandparent_overlap_cap: options.max_grandparent_overlap_factor as u64
                * max_file_size_for_level(options, output_level),
            input_version: Some(input_version),
            edit,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; num_levels],
            deletion_only: false,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn output_level(&self) -> usize {
        self.output_level
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn input_version(&self) -> &Arc<Version<E>> {
        self.input_version.as_ref().unwrap()
    }

    pub fn total_input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// A single input file with no output-level overlap and modest
    /// grandparent overlap is promoted by a metadata-only move.
    pub fn is_trivial_move(&self) -> bool {
        !self.deletion_only
            && self.level != self.output_level
            && self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.grandparent_overlap_cap
    }

    pub fn add_input_deletions(&mut self) {
        for (which, level) in [(0usize, self.level), (1usize, self.output_level)] {
            for f in self.inputs[which].iter() {
                self.edit.delete_file(level, f.number);
            }
        }
    }

    /// True when no level below the output holds this user key, which lets
    /// a deletion entry be dropped outright.
    pub fn is_base_level_for(&mut self, user_key: &[u8]) -> bool {
        let version = self.input_version.as_ref().unwrap();
        let ucmp = version.icmp().user_comparator();
        for level in (self.output_level + 1)..version.num_levels() {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                // Keys arrive in order, so the pointer never moves back.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Checked before each output record: cut the current output file when
    /// it would overlap too much of the grandparent level.
    pub fn should_stop_before(&mut self, internal_key: &[u8], icmp: &InternalKeyComparator) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encode(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.grandparent_overlap_cap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    pub fn release_input_version(&mut self) {
        self.input_version = None;
    }
}

/// A user-requested range compaction, processed one level at a time by the
/// background thread.
pub struct ManualCompaction {
    pub cf_id: u32,
    pub level: usize,
    pub done: bool,
    pub begin: Option<InternalKey>,
    pub end: Option<InternalKey>,
}
