use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::info;

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    compaction::Compaction,
    env::{read_file_to_string, Env},
    error::{Error, Result},
    filenames::{current_file_name, descriptor_file_name, set_current_file},
    format::InternalKey,
    iterator::DBIterator,
    log::{LogReader, LogWriter},
    merge::MergingIterator,
    options::{ColumnFamilyOptions, CompactionStyle, Options, ReadOptions},
    table_cache::TableCache,
    types::SequenceNumber,
    version::{
        max_bytes_for_level, total_file_size, FileMetaData, Version, VersionBuilder,
    },
    version_edit::VersionEdit,
};

pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// One column family's chain of versions plus its compaction bookkeeping.
pub struct FamilyVersions<E: Env> {
    pub id: u32,
    pub name: String,
    pub options: Arc<ColumnFamilyOptions>,
    pub icmp: InternalKeyComparator,
    /// Oldest first; the last entry is current. Superseded versions stay
    /// until their external references (iterators, compactions) drop.
    versions: Vec<Arc<Version<E>>>,
    pub compact_pointer: Vec<Vec<u8>>,
    /// WAL segments numbered below this hold no unflushed data of this
    /// family.
    pub log_number: u64,
}

impl<E: Env> FamilyVersions<E> {
    pub fn current(&self) -> Arc<Version<E>> {
        self.versions.last().cloned().expect("family has no version")
    }

    fn install(&mut self, version: Version<E>) {
        self.versions.push(Arc::new(version));
        self.prune();
    }

    /// Drops superseded versions nobody references anymore.
    fn prune(&mut self) {
        let len = self.versions.len();
        if len <= 1 {
            return;
        }
        let keep_from = len - 1;
        let mut retained = Vec::with_capacity(len);
        for (i, v) in self.versions.drain(..).enumerate() {
            if i >= keep_from || Arc::strong_count(&v) > 1 {
                retained.push(v);
            }
        }
        self.versions = retained;
    }
}

pub struct VersionSet<E: Env> {
    env: E,
    db_name: PathBuf,
    options: Arc<Options>,
    table_cache: TableCache<E>,

    last_sequence: SequenceNumber,
    next_file_number: u64,
    manifest_file_number: u64,
    log_number: u64,
    prev_log_number: u64,
    max_column_family: u32,

    families: BTreeMap<u32, FamilyVersions<E>>,

    descriptor_log: Option<LogWriter<E::WritableFile>>,
    descriptor_size: u64,

    /// Files being written by in-flight flushes/compactions; counted live.
    pub pending_outputs: HashSet<u64>,
}

impl<E: Env> VersionSet<E> {
    pub fn new(
        env: E,
        db_name: PathBuf,
        options: Arc<Options>,
        table_cache: TableCache<E>,
    ) -> Self {
        let mut set = VersionSet {
            env,
            db_name,
            options: options.clone(),
            table_cache,
            last_sequence: 0,
            next_file_number: 2,
            manifest_file_number: 0,
            log_number: 0,
            prev_log_number: 0,
            max_column_family: 0,
            families: BTreeMap::new(),
            descriptor_log: None,
            descriptor_size: 0,
            pending_outputs: HashSet::new(),
        };
        set.insert_family(0, DEFAULT_COLUMN_FAMILY_NAME.to_string(), Arc::new(options.cf.clone()));
        set
    }

    fn insert_family(&mut self, id: u32, name: String, cf_options: Arc<ColumnFamilyOptions>) {
        let icmp = InternalKeyComparator::new(cf_options.comparator.clone());
        let version = Version::new(
            icmp.clone(),
            self.options.clone(),
            cf_options.clone(),
            self.table_cache.clone(),
        );
        let family = FamilyVersions {
            id,
            name,
            options: cf_options,
            icmp,
            versions: vec![Arc::new(version)],
            compact_pointer: vec![Vec::new(); self.options.num_levels],
            log_number: 0,
        };
        self.families.insert(id, family);
        self.max_column_family = self.max_column_family.max(id);
    }

    pub fn family(&self, id: u32) -> Option<&FamilyVersions<E>> {
        self.families.get(&id)
    }

    pub fn family_mut(&mut self, id: u32) -> Option<&mut FamilyVersions<E>> {
        self.families.get_mut(&id)
    }

    pub fn families(&self) -> impl Iterator<Item = &FamilyVersions<E>> {
        self.families.values()
    }

    pub fn family_ids(&self) -> Vec<u32> {
        self.families.keys().copied().collect()
    }

    pub fn family_id_by_name(&self, name: &str) -> Option<u32> {
        self.families
            .values()
            .find(|f| f.name == name)
            .map(|f| f.id)
    }

    pub fn current(&self, cf: u32) -> Arc<Version<E>> {
        self.families[&cf].current()
    }

    pub fn max_column_family(&self) -> u32 {
        self.max_column_family
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, n: SequenceNumber) {
        assert!(n >= self.last_sequence);
        self.last_sequence = n;
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let ret = self.next_file_number;
        self.next_file_number += 1;
        ret
    }

    /// Returns an unused allocation so the number sequence stays dense.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn mark_file_number_used(&mut self, file_number: u64) {
        if self.next_file_number <= file_number {
            self.next_file_number = file_number + 1;
        }
    }

    pub fn live_files(&self, live: &mut HashSet<u64>) {
        live.extend(self.pending_outputs.iter().copied());
        for family in self.families.values() {
            for v in family.versions.iter() {
                for level in v.files.iter() {
                    for f in level.iter() {
                        live.insert(f.number);
                    }
                }
            }
        }
    }

    /// Reads CURRENT, replays the manifest, rebuilds every family's current
    /// version. `descriptors` supplies per-family options for families found
    /// in the manifest; unknown families fall back to the default options.
    pub fn recover(
        &mut self,
        descriptors: &HashMap<String, ColumnFamilyOptions>,
    ) -> Result<()> {
        let mut current = String::with_capacity(64);
        read_file_to_string(self.env.clone(), current_file_name(&self.db_name), &mut current)?;
        if current.is_empty() || !current.ends_with('\n') {
            return Err(Error::Corruption(
                "CURRENT file does not end with a newline".into(),
            ));
        }
        current.truncate(current.len() - 1);
        let descriptor_name = Path::new(&self.db_name).join(&current);

        let file = self.env.new_sequential_file(&descriptor_name)?;
        let mut reader = LogReader::new(file, true);
        reader.set_strict(true);

        let mut saw_log_number = false;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        struct FamilyRecovery {
            name: String,
            options: Arc<ColumnFamilyOptions>,
            icmp: InternalKeyComparator,
            added: Vec<VersionEdit>,
            compact_pointer: Vec<Vec<u8>>,
            log_number: u64,
        }
        let mut recovering: BTreeMap<u32, FamilyRecovery> = BTreeMap::new();
        let default_options = self
            .families
            .get(&0)
            .map(|f| f.options.clone())
            .expect("default family always exists");
        recovering.insert(
            0,
            FamilyRecovery {
                name: DEFAULT_COLUMN_FAMILY_NAME.to_string(),
                options: default_options.clone(),
                icmp: InternalKeyComparator::new(default_options.comparator.clone()),
                added: Vec::new(),
                compact_pointer: vec![Vec::new(); self.options.num_levels],
                log_number: 0,
            },
        );

        let mut record = Vec::new();
        while reader.read_record(&mut record)?.is_some() {
            let mut edit = VersionEdit::new();
            edit.decode(&record)?;

            if let Some(name) = &edit.column_family_add {
                let cf_options = descriptors
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| (*default_options).clone());
                let cf_options = Arc::new(cf_options);
                recovering.insert(
                    edit.column_family,
                    FamilyRecovery {
                        name: name.clone(),
                        icmp: InternalKeyComparator::new(cf_options.comparator.clone()),
                        options: cf_options,
                        added: Vec::new(),
                        compact_pointer: vec![Vec::new(); self.options.num_levels],
                        log_number: 0,
                    },
                );
                self.max_column_family = self.max_column_family.max(edit.column_family);
                continue;
            }
            if edit.column_family_drop {
                recovering.remove(&edit.column_family);
                continue;
            }

            let family = recovering.get_mut(&edit.column_family).ok_or_else(|| {
                Error::Corruption(format!(
                    "manifest edit references unknown column family {}",
                    edit.column_family
                ))
            })?;

            if let Some(name) = &edit.comparator {
                if name != family.icmp.user_comparator().name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: manifest has {}, options supply {}",
                        name,
                        family.icmp.user_comparator().name()
                    )));
                }
            }

            if let Some(n) = edit.log_number {
                family.log_number = n;
                saw_log_number = true;
            }
            if let Some(n) = edit.prev_log_number {
                prev_log_number = Some(n);
            }
            if let Some(n) = edit.next_file_number {
                next_file_number = Some(n);
            }
            if let Some(n) = edit.last_sequence {
                last_sequence = Some(n);
            }
            if let Some(n) = edit.max_column_family {
                self.max_column_family = self.max_column_family.max(n);
            }
            family.added.push(edit);
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("no next-file entry in manifest".into()))?;
        if !saw_log_number {
            return Err(Error::Corruption("no log-number entry in manifest".into()));
        }
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("no last-sequence entry in manifest".into()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);
        // The replay floor is the oldest WAL any family still needs.
        let log_number = recovering
            .values()
            .map(|r| r.log_number)
            .min()
            .unwrap_or(0);
        let max_family_log = recovering
            .values()
            .map(|r| r.log_number)
            .max()
            .unwrap_or(0);

        // Rebuild every family from scratch against an empty base.
        self.families.clear();
        for (id, rec) in recovering {
            self.insert_family(id, rec.name, rec.options.clone());
            let base = {
                let family = self.families.get_mut(&id).unwrap();
                family.log_number = rec.log_number;
                family.current()
            };

            let mut builder = VersionBuilder::new(base, rec.icmp.clone());
            let mut pointers = rec.compact_pointer;
            for edit in rec.added.iter() {
                builder.apply(edit, &mut pointers);
            }
            let mut version = Version::new(
                rec.icmp,
                self.options.clone(),
                rec.options,
                self.table_cache.clone(),
            );
            builder.save_to(&mut version)?;
            self.finalize_version(&mut version);

            let family = self.families.get_mut(&id).unwrap();
            family.compact_pointer = pointers;
            family.versions = vec![Arc::new(version)];
        }

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(max_family_log);
        self.mark_file_number_used(prev_log_number);

        info!(
            "recovered manifest {}: {} families, last_sequence {}, log {}",
            current,
            self.families.len(),
            last_sequence,
            log_number
        );
        Ok(())
    }

    /// Scores a freshly built version so the picker can find the neediest
    /// level with one comparison.
    fn finalize_version(&self, version: &mut Version<E>) {
        let mut best_level = -1i32;
        let mut best_score = -1f64;
        for level in 0..version.num_levels() - 1 {
            let score = if level == 0 {
                version.num_files(0) as f64
                    / self.options.level0_file_num_compaction_trigger as f64
            } else {
                version.level_total_file_size(level) as f64
                    / max_bytes_for_level(&self.options, level)
            };
            if score > best_score {
                best_level = level as i32;
                best_score = score;
            }
        }
        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /// Serialized manifest write: builds the family's next version, appends
    /// the edit (creating and snapshotting a fresh manifest when needed),
    /// fsyncs, publishes. On failure the previous version stays current.
    pub fn log_and_apply(&mut self, cf: u32, edit: &mut VersionEdit) -> Result<()> {
        edit.set_column_family(cf);

        if edit.column_family_add.is_some() {
            return self.apply_family_add(edit);
        }
        if edit.column_family_drop {
            return self.apply_family_drop(edit);
        }

        let family = self
            .families
            .get(&cf)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown column family {}", cf)))?;

        if let Some(n) = edit.log_number {
            assert!(n >= family.log_number);
            assert!(n < self.next_file_number);
        } else {
            edit.set_log_number(family.log_number);
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
        edit.set_max_column_family(self.max_column_family);

        let mut version = Version::new(
            family.icmp.clone(),
            self.options.clone(),
            family.options.clone(),
            self.table_cache.clone(),
        );
        {
            let family = self.families.get_mut(&cf).unwrap();
            let mut builder = VersionBuilder::new(family.current(), family.icmp.clone());
            builder.apply(edit, &mut family.compact_pointer);
            builder.save_to(&mut version)?;
        }
        self.finalize_version(&mut version);

        self.write_edit(edit)?;

        let new_log_number = edit.log_number.unwrap();
        let family = self.families.get_mut(&cf).unwrap();
        family.log_number = new_log_number;
        family.install(version);
        self.log_number = self
            .families
            .values()
            .map(|f| f.log_number)
            .min()
            .unwrap_or(new_log_number);
        self.prev_log_number = edit.prev_log_number.unwrap();

        Ok(())
    }

    fn apply_family_add(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let id = edit.column_family;
        assert!(!self.families.contains_key(&id));
        edit.set_max_column_family(self.max_column_family.max(id));
        self.write_edit(edit)?;
        // Family options were stashed by the caller via create_column_family.
        Ok(())
    }

    fn apply_family_drop(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let id = edit.column_family;
        assert!(id != 0, "cannot drop the default column family");
        self.write_edit(edit)?;
        self.families.remove(&id);
        Ok(())
    }

    /// Registers a new family after its add record is durable.
    pub fn create_column_family(
        &mut self,
        name: &str,
        cf_options: ColumnFamilyOptions,
    ) -> Result<u32> {
        if self.family_id_by_name(name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "column family {} already exists",
                name
            )));
        }
        let id = self.max_column_family + 1;
        let mut edit = VersionEdit::new();
        edit.set_column_family(id);
        edit.add_column_family(name);
        edit.set_comparator(cf_options.comparator.name());
        self.apply_family_add(&mut edit)?;
        self.insert_family(id, name.to_string(), Arc::new(cf_options));
        // New families start with the current WAL: older logs hold nothing
        // of theirs.
        self.families.get_mut(&id).unwrap().log_number = self.log_number;
        Ok(id)
    }

    pub fn drop_column_family_by_id(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidArgument(
                "cannot drop the default column family".into(),
            ));
        }
        if !self.families.contains_key(&id) {
            return Err(Error::InvalidArgument(format!(
                "unknown column family {}",
                id
            )));
        }
        let mut edit = VersionEdit::new();
        edit.set_column_family(id);
        edit.drop_column_family();
        self.apply_family_drop(&mut edit)
    }

    fn write_edit(&mut self, edit: &mut VersionEdit) -> Result<()> {
        // Roll the manifest once it grows past the configured bound.
        if self.descriptor_log.is_some() && self.descriptor_size > self.options.max_manifest_file_size
        {
            self.descriptor_log = None;
            self.manifest_file_number = self.new_file_number();
            self.descriptor_size = 0;
        }

        let mut created = false;
        if self.descriptor_log.is_none() {
            if self.manifest_file_number == 0 {
                self.manifest_file_number = self.new_file_number();
            }
            let manifest_name = descriptor_file_name(&self.db_name, self.manifest_file_number);
            let manifest_file = self.env.new_writable_file(&manifest_name)?;
            let mut writer = LogWriter::new(manifest_file);
            match self.write_snapshot(&mut writer) {
                Ok(bytes) => {
                    self.descriptor_log = Some(writer);
                    self.descriptor_size = bytes;
                    created = true;
                }
                Err(e) => {
                    let _ = self.env.delete_file(&manifest_name);
                    return Err(e);
                }
            }
        }

        // Rolling the manifest may have consumed a file number; make sure
        // the durable record reflects the final allocation state.
        if edit.next_file_number.is_some() {
            edit.set_next_file_number(self.next_file_number);
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        let writer = self.descriptor_log.as_mut().unwrap();
        writer.add_record(&record)?;
        writer.sync()?;
        self.descriptor_size += record.len() as u64;

        if created {
            set_current_file(self.env.clone(), &self.db_name, self.manifest_file_number)?;
            info!("switched to MANIFEST-{:06}", self.manifest_file_number);
        }
        Ok(())
    }

    /// Writes the full current state as the opening records of a fresh
    /// manifest. Returns the byte count written.
    fn write_snapshot(&self, writer: &mut LogWriter<E::WritableFile>) -> Result<u64> {
        let mut bytes = 0u64;
        for family in self.families.values() {
            if family.id != 0 {
                let mut add = VersionEdit::new();
                add.set_column_family(family.id);
                add.add_column_family(family.name.clone());
                let mut record = Vec::new();
                add.encode(&mut record);
                writer.add_record(&record)?;
                bytes += record.len() as u64;
            }

            let mut edit = VersionEdit::new();
            edit.set_column_family(family.id);
            edit.set_comparator(family.icmp.user_comparator().name());
            edit.set_log_number(family.log_number);

            for (level, pointer) in family.compact_pointer.iter().enumerate() {
                if !pointer.is_empty() {
                    let mut key = InternalKey::empty();
                    key.decode(pointer);
                    edit.add_compact_pointer(level, key);
                }
            }

            let current = family.current();
            for (level, files) in current.files.iter().enumerate() {
                for f in files.iter() {
                    edit.add_file(level, (**f).clone());
                }
            }

            if family.id == 0 {
                edit.set_next_file_number(self.next_file_number);
                edit.set_last_sequence(self.last_sequence);
                edit.set_max_column_family(self.max_column_family);
                edit.set_prev_log_number(self.prev_log_number);
            }

            let mut record = Vec::new();
            edit.encode(&mut record);
            writer.add_record(&record)?;
            bytes += record.len() as u64;
        }
        Ok(bytes)
    }

    pub fn need_compaction(&self) -> bool {
        for family in self.families.values() {
            match self.options.compaction_style {
                CompactionStyle::Level => {
                    if family.current().compaction_score >= 1.0 {
                        return true;
                    }
                }
                CompactionStyle::Universal => {
                    if family.current().num_files(0)
                        >= self.options.level0_file_num_compaction_trigger
                    {
                        return true;
                    }
                }
                CompactionStyle::Fifo => {
                    if family.current().level_total_file_size(0)
                        > self.options.compaction_options_fifo.max_table_files_size
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub fn pick_compaction(&mut self) -> Option<Compaction<E>> {
        match self.options.compaction_style {
            CompactionStyle::Level => self.pick_level_compaction(),
            CompactionStyle::Universal => self.pick_universal_compaction(),
            CompactionStyle::Fifo => self.pick_fifo_compaction(),
        }
    }

    fn pick_level_compaction(&mut self) -> Option<Compaction<E>> {
        // Highest-scoring family first; ties break toward lower family ids.
        let mut best: Option<(u32, f64)> = None;
        for family in self.families.values() {
            let score = family.current().compaction_score;
            if score >= 1.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((family.id, score));
            }
        }
        let (cf, _) = best?;

        let current = self.families[&cf].current();
        let level = current.compaction_level as usize;
        assert!(level + 1 < current.num_levels());

        let mut c = Compaction::new(&self.options, cf, level, level + 1, current.clone());

        // Start after the last compacted key at this level, wrapping.
        let pointer = &self.families[&cf].compact_pointer[level];
        let icmp = self.families[&cf].icmp.clone();
        for f in current.files[level].iter() {
            if pointer.is_empty()
                || icmp.compare(f.largest.encode(), pointer) == Ordering::Greater
            {
                c.inputs[0].push(f.clone());
                break;
            }
        }
        if c.inputs[0].is_empty() {
            if let Some(f) = current.files[level].first() {
                c.inputs[0].push(f.clone());
            }
        }
        if c.inputs[0].is_empty() {
            return None;
        }

        if level == 0 {
            let (smallest, largest) = key_range(&icmp, &c.inputs[0]);
            c.inputs[0] = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            assert!(!c.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Universal style: sorted runs live in level 0, newest first. Merges a
    /// window of similar-sized runs (or everything, under space
    /// amplification) back into level 0.
    fn pick_universal_compaction(&mut self) -> Option<Compaction<E>> {
        let uni = self.options.compaction_options_universal;
        for cf in self.family_ids() {
            let current = self.families[&cf].current();
            let runs = &current.files[0];
            if runs.len() < self.options.level0_file_num_compaction_trigger {
                continue;
            }

            // Oldest run last: runs are sorted ascending by file number.
            let newest_first: Vec<Arc<FileMetaData>> = runs.iter().rev().cloned().collect();

            // Space amplification check against the oldest run.
            let oldest = newest_first.last().unwrap();
            let younger: u64 = newest_first[..newest_first.len() - 1]
                .iter()
                .map(|f| f.file_size)
                .sum();
            if oldest.file_size > 0
                && younger * 100 / oldest.file_size >= uni.max_size_amplification_percent as u64
            {
                let mut c = Compaction::new(&self.options, cf, 0, 0, current.clone());
                c.inputs[0] = runs.clone();
                return Some(c);
            }

            // Size-ratio window starting from the newest run.
            let mut window = vec![newest_first[0].clone()];
            let mut window_bytes = newest_first[0].file_size;
            for candidate in newest_first[1..].iter() {
                if window.len() >= uni.max_merge_width {
                    break;
                }
                let threshold = window_bytes + window_bytes * uni.size_ratio as u64 / 100;
                if candidate.file_size <= threshold {
                    window_bytes += candidate.file_size;
                    window.push(candidate.clone());
                } else {
                    break;
                }
            }
            if window.len() >= uni.min_merge_width.max(2) {
                let mut c = Compaction::new(&self.options, cf, 0, 0, current.clone());
                c.inputs[0] = window;
                return Some(c);
            }
        }
        None
    }

    /// FIFO: when level 0 outgrows its budget, delete the oldest files.
    fn pick_fifo_compaction(&mut self) -> Option<Compaction<E>> {
        let cap = self.options.compaction_options_fifo.max_table_files_size;
        for cf in self.family_ids() {
            let current = self.families[&cf].current();
            let total = current.level_total_file_size(0);
            if total <= cap {
                continue;
            }
            let mut c = Compaction::new(&self.options, cf, 0, 0, current.clone());
            c.deletion_only = true;
            let mut remaining = total;
            // Ascending file number == oldest first.
            for f in current.files[0].iter() {
                if remaining <= cap {
                    break;
                }
                remaining -= f.file_size;
                c.inputs[0].push(f.clone());
            }
            if c.inputs[0].is_empty() {
                continue;
            }
            c.add_input_deletions();
            return Some(c);
        }
        None
    }

    /// Manual / range compaction for one level.
    pub fn compact_range(
        &mut self,
        cf: u32,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction<E>> {
        let current = self.families.get(&cf)?.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one huge manual compaction at levels > 0: trim to roughly
        // one target file's worth of source data.
        if level > 0 {
            let limit = self.options.source_compaction_factor.max(1) as u64
                * crate::version::max_file_size_for_level(&self.options, level);
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let output_level = (level + 1).min(current.num_levels() - 1);
        let mut c = Compaction::new(&self.options, cf, level, output_level, current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Completes a picked compaction: boundary expansion at the input level,
    /// output-level overlap, optional input re-expansion, grandparents, and
    /// the advancing compaction pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction<E>) {
        let cf = c.cf_id;
        let level = c.level();
        let output_level = c.output_level();
        let current = c.input_version().clone();
        let icmp = self.families[&cf].icmp.clone();

        add_boundary_inputs(&icmp, &current.files[level], &mut c.inputs[0]);
        let (smallest, largest) = key_range(&icmp, &c.inputs[0]);

        if output_level != level {
            c.inputs[1] = current.overlapping_inputs(output_level, Some(&smallest), Some(&largest));
            add_boundary_inputs(&icmp, &current.files[output_level], &mut c.inputs[1]);
        }

        let (mut all_start, mut all_limit) =
            key_range_2(&icmp, &c.inputs[0], &c.inputs[1]);

        // Try growing the input side while the output side stays fixed.
        if !c.inputs[1].is_empty() {
            let mut expanded0 =
                current.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&icmp, &current.files[level], &mut expanded0);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            let limit = self.options.expanded_compaction_factor as u64
                * self.options.target_file_size_base;
            if expanded0.len() > c.inputs[0].len() && inputs1_size + expanded0_size < limit {
                let (new_start, new_limit) = key_range(&icmp, &expanded0);
                let mut expanded1 = current.overlapping_inputs(
                    output_level,
                    Some(&new_start),
                    Some(&new_limit),
                );
                add_boundary_inputs(&icmp, &current.files[output_level], &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        "expanding compaction at level {}: {}+{} to {}+{} files",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        expanded0.len(),
                        expanded1.len()
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let ranges = key_range_2(&icmp, &c.inputs[0], &c.inputs[1]);
                    all_start = ranges.0;
                    all_limit = ranges.1;
                }
            }
        }

        if output_level + 1 < current.num_levels() {
            c.grandparents = current.overlapping_inputs(
                output_level + 1,
                Some(&all_start),
                Some(&all_limit),
            );
        }

        // Future automatic compactions at this level resume past this range.
        let (_, largest) = key_range(&icmp, &c.inputs[0]);
        let family = self.families.get_mut(&cf).unwrap();
        family.compact_pointer[level] = largest.encode().to_vec();
        c.edit.add_compact_pointer(level, largest);
    }
}

/// Merging iterator over every input file of a compaction. Free-standing so
/// the compaction driver can build it after releasing the DB mutex.
pub fn make_input_iterator<E: Env>(
    table_cache: &TableCache<E>,
    icmp: &InternalKeyComparator,
    cf_options: &Arc<ColumnFamilyOptions>,
    paranoid_checks: bool,
    c: &Compaction<E>,
) -> Result<MergingIterator<InternalKeyComparator>> {
    let read_options = ReadOptions {
        verify_checksums: paranoid_checks,
        fill_cache: false,
        ..Default::default()
    };

    let mut iters: Vec<Box<dyn DBIterator>> = Vec::new();
    for (which, level) in [(0usize, c.level()), (1usize, c.output_level())] {
        if c.inputs[which].is_empty() {
            continue;
        }
        if level == 0 {
            for f in c.inputs[which].iter() {
                iters.push(table_cache.iter(&read_options, cf_options, f)?);
            }
        } else {
            iters.push(Box::new(
                crate::sstable::two_level_iterator::TwoLevelIterator::new(
                    crate::version::LevelFileNumIterator::new(
                        icmp.clone(),
                        c.inputs[which].clone(),
                    ),
                    crate::version::LevelTableIterBuilder {
                        table_cache: table_cache.clone(),
                        cf_options: cf_options.clone(),
                    },
                    read_options.clone(),
                ),
            ));
        }
        if which == 0 && c.level() == c.output_level() {
            // Universal/FIFO style merges within one level.
            break;
        }
    }
    Ok(MergingIterator::new(icmp.clone(), iters))
}

fn key_range(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
) -> (InternalKey, InternalKey) {
    assert!(!files.is_empty());
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for f in files[1..].iter() {
        if icmp.compare(f.smallest.encode(), smallest.encode()) == Ordering::Less {
            smallest = f.smallest.clone();
        }
        if icmp.compare(f.largest.encode(), largest.encode()) == Ordering::Greater {
            largest = f.largest.clone();
        }
    }
    (smallest, largest)
}

fn key_range_2(
    icmp: &InternalKeyComparator,
    a: &[Arc<FileMetaData>],
    b: &[Arc<FileMetaData>],
) -> (InternalKey, InternalKey) {
    let mut all: Vec<Arc<FileMetaData>> = a.to_vec();
    all.extend_from_slice(b);
    key_range(icmp, &all)
}

/// Extends `compaction_files` with same-level files whose smallest key
/// continues the user key at the current upper boundary, so no user key is
/// split between two compactions.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    if compaction_files.is_empty() {
        return;
    }
    let ucmp = icmp.user_comparator();

    loop {
        let mut largest_key = compaction_files[0].largest.clone();
        for f in compaction_files[1..].iter() {
            if icmp.compare(f.largest.encode(), largest_key.encode()) == Ordering::Greater {
                largest_key = f.largest.clone();
            }
        }

        let mut boundary: Option<Arc<FileMetaData>> = None;
        for f in level_files.iter() {
            if icmp.compare(f.smallest.encode(), largest_key.encode()) == Ordering::Greater
                && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == Ordering::Equal
            {
                let better = boundary
                    .as_ref()
                    .map(|b| icmp.compare(f.smallest.encode(), b.smallest.encode()) == Ordering::Less)
                    .unwrap_or(true);
                if better {
                    boundary = Some(f.clone());
                }
            }
        }

        match boundary {
            Some(f) => {
                if compaction_files.iter().any(|c| c.number == f.number) {
                    break;
                }
                compaction_files.push(f);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::BitwiseComparator;
    use crate::types::ValueType;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BitwiseComparator {}))
    }

    fn meta_seq(number: u64, smallest: (&str, u64), largest: (&str, u64)) -> Arc<FileMetaData> {
        Arc::new(FileMetaData {
            number,
            file_size: 1000,
            path_id: 0,
            smallest: InternalKey::new(smallest.0.as_bytes(), smallest.1, ValueType::Value),
            largest: InternalKey::new(largest.0.as_bytes(), largest.1, ValueType::Value),
            smallest_seq: smallest.1,
            largest_seq: largest.1,
        })
    }

    #[test]
    fn test_add_boundary_inputs_pulls_continuation() {
        let cmp = icmp();
        // File 2 starts with the same user key that file 1 ends with, at a
        // lower sequence (so it sorts after).
        let f1 = meta_seq(1, ("a", 9), ("k", 5));
        let f2 = meta_seq(2, ("k", 3), ("p", 2));
        let f3 = meta_seq(3, ("q", 9), ("z", 8));
        let level_files = vec![f1.clone(), f2.clone(), f3];

        let mut inputs = vec![f1];
        add_boundary_inputs(&cmp, &level_files, &mut inputs);
        let nums: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(nums, vec![1, 2]);
    }

    #[test]
    fn test_add_boundary_inputs_no_boundary() {
        let cmp = icmp();
        let f1 = meta_seq(1, ("a", 9), ("k", 5));
        let f2 = meta_seq(2, ("l", 3), ("p", 2));
        let level_files = vec![f1.clone(), f2];

        let mut inputs = vec![f1];
        add_boundary_inputs(&cmp, &level_files, &mut inputs);
        assert_eq!(inputs.len(), 1);
    }
}
