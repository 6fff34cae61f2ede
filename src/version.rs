use std::{
    cmp::Ordering,
    collections::HashSet,
    sync::Arc,
};

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    codec::{decode_u32_le, NumberReader, NumberWriter},
    env::Env,
    error::{Error, Result},
    format::{InternalKey, LookupKey},
    iterator::DBIterator,
    lookup::GetContext,
    options::{ColumnFamilyOptions, Options, ReadOptions},
    sstable::two_level_iterator::{BlockIterBuilder, TwoLevelIterator},
    table_cache::TableCache,
    types::SequenceNumber,
    version_edit::VersionEdit,
};

#[derive(Clone, Default, Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Index into `Options::db_paths`; 0 is the DB directory.
    pub path_id: u32,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_seq: SequenceNumber,
    pub largest_seq: SequenceNumber,
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Byte budget for level L (level-style scoring); level 0 is scored by file
/// count instead.
pub fn max_bytes_for_level(options: &Options, level: usize) -> f64 {
    let mut result = options.max_bytes_for_level_base as f64;
    for l in 1..level {
        let extra = options
            .max_bytes_for_level_multiplier_additional
            .get(l - 1)
            .copied()
            .unwrap_or(1);
        result *= (options.max_bytes_for_level_multiplier * extra.max(1)) as f64;
    }
    result
}

pub fn max_file_size_for_level(options: &Options, level: usize) -> u64 {
    let mut result = options.target_file_size_base;
    for _ in 1..level.max(1) {
        result = result.saturating_mul(options.target_file_size_multiplier.max(1) as u64);
    }
    result
}

/// Index of the file whose largest key is >= `internal_key` (files must be
/// the sorted, disjoint list of a level >= 1).
pub fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    internal_key: &[u8],
) -> usize {
    files.partition_point(|f| icmp.compare(f.largest.encode(), internal_key) == Ordering::Less)
}

fn after_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        Some(key) => ucmp.compare(key, file.largest.user_key()) == Ordering::Greater,
        None => false,
    }
}

fn before_file(ucmp: &dyn Comparator, user_key: Option<&[u8]>, file: &FileMetaData) -> bool {
    match user_key {
        Some(key) => ucmp.compare(key, file.smallest.user_key()) == Ordering::Less,
        None => false,
    }
}

pub fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint_sorted_files: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint_sorted_files {
        // Level 0: check every file.
        return files.iter().any(|f| {
            !(after_file(ucmp.as_ref(), smallest_user_key, f)
                || before_file(ucmp.as_ref(), largest_user_key, f))
        });
    }

    let index = match smallest_user_key {
        Some(key) => {
            let small = InternalKey::new(key, crate::types::MAX_SEQUENCE_NUMBER, crate::types::VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encode())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(ucmp.as_ref(), largest_user_key, &files[index])
}

/// Immutable snapshot of one column family's file set. Shared by reference
/// counting; a new Version is produced by applying a VersionEdit through a
/// VersionBuilder.
pub struct Version<E: Env> {
    icmp: InternalKeyComparator,
    options: Arc<Options>,
    cf_options: Arc<ColumnFamilyOptions>,
    table_cache: TableCache<E>,

    pub files: Vec<Vec<Arc<FileMetaData>>>,

    // Filled by VersionSet::finalize after each apply.
    pub compaction_score: f64,
    pub compaction_level: i32,
}

impl<E: Env> Version<E> {
    pub fn new(
        icmp: InternalKeyComparator,
        options: Arc<Options>,
        cf_options: Arc<ColumnFamilyOptions>,
        table_cache: TableCache<E>,
    ) -> Version<E> {
        let num_levels = options.num_levels;
        Version {
            icmp,
            options,
            cf_options,
            table_cache,
            files: vec![Vec::new(); num_levels],
            compaction_score: -1.0,
            compaction_level: -1,
        }
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn cf_options(&self) -> &Arc<ColumnFamilyOptions> {
        &self.cf_options
    }

    pub fn num_levels(&self) -> usize {
        self.files.len()
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_total_file_size(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    pub fn num_level_files_total(&self) -> usize {
        self.files.iter().map(|l| l.len()).sum()
    }

    /// Searches the file set newest-to-oldest: level 0 by descending file
    /// number, then each deeper level through its single candidate file.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        key: &LookupKey,
        ctx: &mut GetContext<'_>,
    ) -> Result<()> {
        let ikey = key.internal_key();
        let ukey = key.user_key();
        let ucmp = self.icmp.user_comparator();

        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(ukey, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(ukey, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            self.table_cache
                .get(read_options, &self.cf_options, file, ikey, ctx)?;
            if ctx.done() {
                return Ok(());
            }
        }

        for level in 1..self.num_levels() {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, ikey);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if ucmp.compare(ukey, file.smallest.user_key()) == Ordering::Less {
                continue;
            }
            self.table_cache
                .get(read_options, &self.cf_options, file, ikey, ctx)?;
            if ctx.done() {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// All files at `level` whose range intersects [begin, end]. For level 0
    /// the range grows to cover transitively overlapping files, as one user
    /// key may span several of them.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let f = self.files[level][i].clone();
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();
            if let Some(b) = &user_begin {
                if ucmp.compare(file_limit, b) == Ordering::Less {
                    continue;
                }
            }
            if let Some(e) = &user_end {
                if ucmp.compare(file_start, e) == Ordering::Greater {
                    continue;
                }
            }

            if level == 0 {
                // Restart with a widened range when this file extends it.
                let widen_begin = user_begin
                    .as_ref()
                    .map(|b| ucmp.compare(file_start, b) == Ordering::Less)
                    .unwrap_or(false);
                let widen_end = user_end
                    .as_ref()
                    .map(|e| ucmp.compare(file_limit, e) == Ordering::Greater)
                    .unwrap_or(false);
                if widen_begin {
                    user_begin = Some(file_start.to_vec());
                }
                if widen_end {
                    user_end = Some(file_limit.to_vec());
                }
                if widen_begin || widen_end {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
        inputs
    }

    /// Level a fresh memtable flush may skip down to when nothing overlaps.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, smallest_user_key, largest_user_key) {
            let start = smallest_user_key.map(|k| {
                InternalKey::new(k, crate::types::MAX_SEQUENCE_NUMBER, crate::types::VALUE_TYPE_FOR_SEEK)
            });
            let limit = largest_user_key.map(|k| InternalKey::new(k, 0, crate::types::ValueType::Value));
            while level < self.options.max_mem_compaction_level {
                if self.overlap_in_level(level + 1, smallest_user_key, largest_user_key) {
                    break;
                }
                if level + 2 < self.num_levels() {
                    let overlaps =
                        self.overlapping_inputs(level + 2, start.as_ref(), limit.as_ref());
                    let grandparent_bytes = total_file_size(&overlaps);
                    let cap = self.options.max_grandparent_overlap_factor as u64
                        * max_file_size_for_level(&self.options, level + 2);
                    if grandparent_bytes > cap {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// One iterator per L0 file plus one two-level iterator per deeper
    /// non-empty level.
    pub fn iters(&self, read_options: &ReadOptions) -> Result<Vec<Box<dyn DBIterator>>> {
        let mut iters: Vec<Box<dyn DBIterator>> = Vec::new();
        for file in self.files[0].iter() {
            iters.push(
                self.table_cache
                    .iter(read_options, &self.cf_options, file)?,
            );
        }
        for level in 1..self.num_levels() {
            if self.files[level].is_empty() {
                continue;
            }
            iters.push(Box::new(self.level_iter(read_options, level)));
        }
        Ok(iters)
    }

    pub fn level_iter(
        &self,
        read_options: &ReadOptions,
        level: usize,
    ) -> TwoLevelIterator<LevelFileNumIterator, LevelTableIterBuilder<E>> {
        assert!(level > 0);
        TwoLevelIterator::new(
            LevelFileNumIterator::new(self.icmp.clone(), self.files[level].clone()),
            LevelTableIterBuilder {
                table_cache: self.table_cache.clone(),
                cf_options: self.cf_options.clone(),
            },
            read_options.clone(),
        )
    }

    /// Approximate byte offset of `internal_key` within this version's data.
    pub fn approximate_offset_of(&self, internal_key: &InternalKey) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for file in files.iter() {
                if self
                    .icmp
                    .compare(file.largest.encode(), internal_key.encode())
                    != Ordering::Greater
                {
                    result += file.file_size;
                } else if self
                    .icmp
                    .compare(file.smallest.encode(), internal_key.encode())
                    == Ordering::Greater
                {
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.find_table(&self.cf_options, file) {
                    result += table.approximate_offset_of(internal_key.encode());
                }
            }
        }
        result
    }

    /// Level >= 1 files must be disjoint and ordered; checked after every
    /// edit application.
    pub fn check_ordering(&self) -> Result<()> {
        for level in 1..self.num_levels() {
            let files = &self.files[level];
            for pair in files.windows(2) {
                let ok = self
                    .icmp
                    .compare(pair[0].largest.encode(), pair[1].smallest.encode())
                    == Ordering::Less;
                if !ok {
                    return Err(Error::Corruption(format!(
                        "level {} files {} and {} overlap or are out of order",
                        level, pair[0].number, pair[1].number
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Index iterator over one level's file list: key is each file's largest
/// internal key, value encodes (number, size, path id) for the table-iter
/// builder.
pub struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: Vec<u8>,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        LevelFileNumIterator {
            icmp,
            files,
            index,
            value_buf: Vec::with_capacity(20),
        }
    }

    fn update_value(&mut self) {
        self.value_buf.clear();
        if self.index < self.files.len() {
            let f = &self.files[self.index];
            self.value_buf.write_u64_le(f.number).unwrap();
            self.value_buf.write_u64_le(f.file_size).unwrap();
            self.value_buf.write_u32_le(f.path_id).unwrap();
        }
    }
}

impl DBIterator for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.update_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            0
        } else {
            self.files.len() - 1
        };
        self.update_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.update_value();
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.index += 1;
        self.update_value();
    }

    fn prev(&mut self) {
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
        }
        self.update_value();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.files[self.index].largest.encode()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        &self.value_buf
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LevelTableIterBuilder<E: Env> {
    pub table_cache: TableCache<E>,
    pub cf_options: Arc<ColumnFamilyOptions>,
}

impl<E: Env> BlockIterBuilder for LevelTableIterBuilder<E> {
    type Iter = Box<dyn DBIterator>;

    fn build(&self, options: &ReadOptions, index_value: &[u8]) -> Result<Self::Iter> {
        let mut buf = index_value;
        let number = buf.read_u64_le()?;
        let file_size = buf.read_u64_le()?;
        let path_id = decode_u32_le(buf);
        let meta = FileMetaData {
            number,
            file_size,
            path_id,
            ..Default::default()
        };
        self.table_cache.iter(options, &self.cf_options, &meta)
    }
}

impl DBIterator for Box<dyn DBIterator> {
    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }

    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }

    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }

    fn next(&mut self) {
        (**self).next()
    }

    fn prev(&mut self) {
        (**self).prev()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }

    fn status(&mut self) -> Result<()> {
        (**self).status()
    }
}

/// Accumulates edits against a base Version and materializes the result.
pub struct VersionBuilder<E: Env> {
    base: Arc<Version<E>>,
    icmp: InternalKeyComparator,
    added: Vec<Vec<Arc<FileMetaData>>>,
    deleted: Vec<HashSet<u64>>,
}

impl<E: Env> VersionBuilder<E> {
    pub fn new(base: Arc<Version<E>>, icmp: InternalKeyComparator) -> Self {
        let levels = base.num_levels();
        VersionBuilder {
            base,
            icmp,
            added: vec![Vec::new(); levels],
            deleted: vec![HashSet::new(); levels],
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit, compact_pointers: &mut [Vec<u8>]) {
        for (level, key) in edit.compact_pointers.iter() {
            if *level < compact_pointers.len() {
                compact_pointers[*level] = key.encode().to_vec();
            }
        }

        for (level, number) in edit.deleted_files.iter() {
            if *level < self.deleted.len() {
                self.deleted[*level].insert(*number);
            }
        }

        for (level, meta) in edit.new_files.iter() {
            if *level < self.added.len() {
                self.deleted[*level].remove(&meta.number);
                self.added[*level].push(Arc::new(meta.clone()));
            }
        }
    }

    pub fn save_to(mut self, version: &mut Version<E>) -> Result<()> {
        let levels = version.num_levels().min(self.base.num_levels());
        for level in 0..levels {
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number))
                .cloned()
                .collect();
            files.append(&mut self.added[level]);
            if level == 0 {
                // L0 reads walk newest-first by number; keep them ordered.
                files.sort_by(|a, b| a.number.cmp(&b.number));
            } else {
                let icmp = self.icmp.clone();
                files.sort_by(|a, b| icmp.compare(a.smallest.encode(), b.smallest.encode()));
            }
            version.files[level] = files;
        }
        version.check_ordering()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;
    use crate::env::mem::MemEnv;
    use crate::types::ValueType;
    use std::path::PathBuf;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BitwiseComparator {}))
    }

    fn meta(number: u64, smallest: &str, largest: &str) -> FileMetaData {
        FileMetaData {
            number,
            file_size: 1000,
            path_id: 0,
            smallest: InternalKey::new(smallest.as_bytes(), 5, ValueType::Value),
            largest: InternalKey::new(largest.as_bytes(), 5, ValueType::Value),
            smallest_seq: 5,
            largest_seq: 5,
        }
    }

    fn empty_version() -> Version<MemEnv> {
        let mut options = Options::default();
        options.no_block_cache = true;
        options.sanitize();
        let options = Arc::new(options);
        let cf = Arc::new(ColumnFamilyOptions::default());
        let cache = TableCache::new(PathBuf::from("db"), options.clone(), MemEnv::new(), 10);
        Version::new(icmp(), options, cf, cache)
    }

    #[test]
    fn test_find_file_binary_search() {
        let files: Vec<Arc<FileMetaData>> = vec![
            Arc::new(meta(1, "a", "c")),
            Arc::new(meta(2, "e", "g")),
            Arc::new(meta(3, "i", "k")),
        ];
        let cmp = icmp();

        let probe = |key: &str| {
            let k = InternalKey::new(key.as_bytes(), 5, ValueType::Value);
            find_file(&cmp, &files, k.encode())
        };
        assert_eq!(probe("a"), 0);
        assert_eq!(probe("c"), 0);
        assert_eq!(probe("d"), 1);
        assert_eq!(probe("g"), 1);
        assert_eq!(probe("k"), 2);
        assert_eq!(probe("z"), 3);
    }

    #[test]
    fn test_builder_apply_and_ordering() {
        let base = Arc::new(empty_version());
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(10, "m", "p"));
        edit.add_file(1, meta(9, "a", "c"));

        let mut pointers = vec![Vec::new(); 7];
        let mut builder = VersionBuilder::new(base.clone(), icmp());
        builder.apply(&edit, &mut pointers);

        let mut version = empty_version();
        builder.save_to(&mut version).unwrap();
        assert_eq!(version.num_files(1), 2);
        assert_eq!(version.files[1][0].number, 9);
        assert_eq!(version.files[1][1].number, 10);

        // Delete one of them through a second edit.
        let mut edit2 = VersionEdit::new();
        edit2.delete_file(1, 9);
        let mut builder = VersionBuilder::new(Arc::new(version), icmp());
        builder.apply(&edit2, &mut pointers);
        let mut version2 = empty_version();
        builder.save_to(&mut version2).unwrap();
        assert_eq!(version2.num_files(1), 1);
        assert_eq!(version2.files[1][0].number, 10);
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let base = Arc::new(empty_version());
        let mut edit = VersionEdit::new();
        edit.add_file(1, meta(1, "a", "m"));
        edit.add_file(1, meta(2, "c", "z"));

        let mut pointers = vec![Vec::new(); 7];
        let mut builder = VersionBuilder::new(base, icmp());
        builder.apply(&edit, &mut pointers);
        let mut version = empty_version();
        assert!(builder.save_to(&mut version).is_err());
    }

    #[test]
    fn test_overlap_queries() {
        let mut version = empty_version();
        version.files[0] = vec![Arc::new(meta(1, "d", "f")), Arc::new(meta(2, "e", "j"))];
        version.files[1] = vec![Arc::new(meta(3, "a", "c")), Arc::new(meta(4, "m", "p"))];

        assert!(version.overlap_in_level(0, Some(b"e"), Some(b"e")));
        assert!(!version.overlap_in_level(0, Some(b"a"), Some(b"b")));
        assert!(version.overlap_in_level(1, Some(b"b"), Some(b"n")));
        assert!(!version.overlap_in_level(1, Some(b"g"), Some(b"h")));
    }

    #[test]
    fn test_l0_overlapping_inputs_widen() {
        let mut version = empty_version();
        version.files[0] = vec![
            Arc::new(meta(1, "a", "e")),
            Arc::new(meta(2, "d", "h")),
            Arc::new(meta(3, "x", "z")),
        ];

        let begin = InternalKey::new(b"e", 5, ValueType::Value);
        let end = InternalKey::new(b"e", 5, ValueType::Value);
        let inputs = version.overlapping_inputs(0, Some(&begin), Some(&end));
        // "e" hits file 1, whose range pulls in file 2 transitively.
        let nums: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(nums, vec![1, 2]);
    }
}
