use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

use crate::{
    builder::build_table,
    cmp::Comparator,
    column_family::{ColumnFamilyData, ColumnFamilyDescriptor, ColumnFamilyHandle},
    compaction::{Compaction, CompactionStats, FilterDecision, ManualCompaction},
    env::{read_file_to_string, write_string_to_file_sync, Env},
    error::{Error, Result},
    filenames::{
        archival_dir_name, archived_log_file_name, current_file_name, descriptor_file_name,
        identity_file_name, lock_file_name, log_file_name, parse_file_name, set_current_file,
        table_file_name, FileType,
    },
    format::{extract_tag, extract_user_key, InternalKey, LookupKey, ParsedInternalKey},
    iterator::DBIterator,
    log::{LogReader, LogWriter, Reporter},
    lookup::GetContext,
    memtable::MemTable,
    merge::MergingIterator,
    options::{CompactionStyle, FlushOptions, Options, ReadOptions, WriteOptions},
    snapshot::{Snapshot, SnapshotList},
    sstable::TableBuilder,
    table_cache::TableCache,
    transaction_log::{sorted_wal_files, TransactionLogIterator, WalFile},
    types::{SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER},
    version::FileMetaData,
    version_set::{make_input_iterator, VersionSet},
    write_batch::{Handler, MemTableTarget, WriteBatch},
};

const NUM_NON_TABLE_CACHE_FILES: u64 = 10;
// Group commit grows up to this many payload bytes behind one leader.
const MAX_GROUP_COMMIT_BYTES: usize = 1 << 20;
const SMALL_BATCH_BYTES: usize = 128 << 10;

enum BgTask {
    Work,
    Exit,
}

struct WriterCore {
    batch: Option<WriteBatch>,
    sync: bool,
    disable_wal: bool,
    ignore_missing_column_families: bool,
    done: bool,
    in_group: bool,
    result: Option<Result<()>>,
}

struct WriterHandle {
    id: u64,
    cv: Condvar,
    core: Mutex<WriterCore>,
}

struct DbState<E: Env> {
    families: BTreeMap<u32, ColumnFamilyData>,
    versions: VersionSet<E>,

    log: Option<LogWriter<E::WritableFile>>,
    log_file_number: u64,

    writers: VecDeque<Arc<WriterHandle>>,
    next_writer_id: u64,

    bg_error: Option<Error>,
    snapshots: SnapshotList,

    flushing: HashSet<u32>,
    compacting: bool,
    bg_scheduled: usize,
    manual_compaction: Option<ManualCompaction>,
    force_flush: HashSet<u32>,

    disable_deletions: u32,
    stats: Vec<CompactionStats>,
    identity: String,
    lock: Option<E::FileLock>,
}

struct DbInner<E: Env> {
    env: E,
    db_name: PathBuf,
    wal_dir: PathBuf,
    options: Arc<Options>,
    table_cache: TableCache<E>,

    state: Mutex<DbState<E>>,
    background_work_finished: Condvar,
    shutdown: AtomicBool,
    bg_sender: Sender<BgTask>,
}

/// The DB facade: orchestrates group-commit writes, snapshotted reads,
/// iterators, and background flush/compaction over the version set.
pub struct StrataDb<E: Env> {
    inner: Arc<DbInner<E>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<E: Env> StrataDb<E> {
    pub fn open(options: Options, path: impl AsRef<Path>, env: E) -> Result<Self> {
        let (db, _handles) = Self::open_with_column_families(options, path, env, Vec::new())?;
        Ok(db)
    }

    /// Opens with explicit families. Families present in the manifest but
    /// not requested stay available; requested-but-missing families are
    /// created when `create_missing_column_families` is set.
    pub fn open_with_column_families(
        mut options: Options,
        path: impl AsRef<Path>,
        env: E,
        descriptors: Vec<ColumnFamilyDescriptor>,
    ) -> Result<(Self, Vec<ColumnFamilyHandle>)> {
        options.sanitize();
        let options = Arc::new(options);
        let db_name = path.as_ref().to_path_buf();
        let wal_dir = options
            .wal_dir
            .clone()
            .unwrap_or_else(|| db_name.clone());

        env.create_dir(&db_name)?;
        if wal_dir != db_name {
            env.create_dir(&wal_dir)?;
        }

        let lock = match env.lock_file(&lock_file_name(&db_name)) {
            Ok(lock) => lock,
            Err(e) => {
                return Err(Error::Busy(format!(
                    "could not lock {}: {}",
                    db_name.display(),
                    e
                )))
            }
        };

        let current_exists = env.file_exists(&current_file_name(&db_name));
        if !current_exists {
            if !options.create_if_missing {
                let _ = env.unlock_file(lock);
                return Err(Error::InvalidArgument(format!(
                    "{} does not exist (create_if_missing is false)",
                    db_name.display()
                )));
            }
            Self::new_db(&env, &options, &db_name)?;
        } else if options.error_if_exists {
            let _ = env.unlock_file(lock);
            return Err(Error::InvalidArgument(format!(
                "{} exists (error_if_exists is true)",
                db_name.display()
            )));
        }

        let table_cache = TableCache::new(
            db_name.clone(),
            options.clone(),
            env.clone(),
            options.max_open_files - NUM_NON_TABLE_CACHE_FILES,
        );
        let mut versions = VersionSet::new(
            env.clone(),
            db_name.clone(),
            options.clone(),
            table_cache.clone(),
        );

        let descriptor_map: HashMap<String, crate::options::ColumnFamilyOptions> = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.options.clone()))
            .collect();
        versions.recover(&descriptor_map)?;

        // Requested families that the manifest does not know yet.
        for d in descriptors.iter() {
            if versions.family_id_by_name(&d.name).is_none() {
                if !options.create_missing_column_families {
                    let _ = env.unlock_file(lock);
                    return Err(Error::InvalidArgument(format!(
                        "column family {} does not exist",
                        d.name
                    )));
                }
                versions.create_column_family(&d.name, d.options.clone())?;
            }
        }

        let mut identity = String::new();
        let identity_path = identity_file_name(&db_name);
        if read_file_to_string(env.clone(), &identity_path, &mut identity).is_err()
            || identity.is_empty()
        {
            identity = random_identity();
            write_string_to_file_sync(env.clone(), identity.as_bytes(), &identity_path)?;
        }

        let mut families = BTreeMap::new();
        for family in versions.families() {
            families.insert(
                family.id,
                ColumnFamilyData {
                    id: family.id,
                    name: family.name.clone(),
                    options: family.options.clone(),
                    mem: Arc::new(ColumnFamilyData::new_memtable(&family.options)),
                    imm: Vec::new(),
                    mem_log_number: 0,
                    imm_log_numbers: Vec::new(),
                },
            );
        }

        let (bg_sender, bg_receiver) = unbounded();
        let num_levels = options.num_levels;
        let inner = Arc::new(DbInner {
            env: env.clone(),
            db_name,
            wal_dir,
            options: options.clone(),
            table_cache,
            state: Mutex::new(DbState {
                families,
                versions,
                log: None,
                log_file_number: 0,
                writers: VecDeque::new(),
                next_writer_id: 0,
                bg_error: None,
                snapshots: SnapshotList::new(),
                flushing: HashSet::new(),
                compacting: false,
                bg_scheduled: 0,
                manual_compaction: None,
                force_flush: HashSet::new(),
                disable_deletions: 0,
                stats: vec![CompactionStats::default(); num_levels],
                identity: identity.trim().to_string(),
                lock: Some(lock),
            }),
            background_work_finished: Condvar::new(),
            shutdown: AtomicBool::new(false),
            bg_sender,
        });

        inner.recover_wal()?;

        {
            let mut state = inner.state.lock().unwrap();
            inner.delete_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let worker_count = options.max_background_flushes + options.max_background_compactions;
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for i in 0..worker_count.max(1) {
            let worker_inner = inner.clone();
            let receiver: Receiver<BgTask> = bg_receiver.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("stratadb-bg-{}", i))
                    .spawn(move || loop {
                        match receiver.recv() {
                            Ok(BgTask::Work) => worker_inner.background_call(),
                            Ok(BgTask::Exit) | Err(_) => break,
                        }
                    })
                    .expect("spawn background worker"),
            );
        }

        let handles = {
            let state = inner.state.lock().unwrap();
            state
                .families
                .values()
                .map(|f| ColumnFamilyHandle::new(f.id, f.name.clone()))
                .collect()
        };

        Ok((
            StrataDb {
                inner,
                workers: Mutex::new(workers),
            },
            handles,
        ))
    }

    fn new_db(env: &E, options: &Arc<Options>, db_name: &Path) -> Result<()> {
        let mut edit = crate::version_edit::VersionEdit::new();
        edit.set_comparator(options.cf.comparator.name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(db_name, 1);
        let file = env.new_writable_file(&manifest)?;
        let mut log = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode(&mut record);

        match log.add_record(&record).and_then(|_| log.sync()) {
            Ok(()) => set_current_file(env.clone(), db_name, 1),
            Err(e) => {
                let _ = env.delete_file(&manifest);
                Err(e)
            }
        }
    }

    pub fn default_column_family(&self) -> ColumnFamilyHandle {
        ColumnFamilyHandle::default_family()
    }

    pub fn column_family(&self, name: &str) -> Option<ColumnFamilyHandle> {
        let state = self.inner.state.lock().unwrap();
        state
            .families
            .values()
            .find(|f| f.name == name)
            .map(|f| ColumnFamilyHandle::new(f.id, f.name.clone()))
    }

    pub fn create_column_family(
        &self,
        name: &str,
        cf_options: crate::options::ColumnFamilyOptions,
    ) -> Result<ColumnFamilyHandle> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(e) = &state.bg_error {
            return Err(e.clone_shallow());
        }
        let id = state.versions.create_column_family(name, cf_options)?;
        let family = state.versions.family(id).unwrap();
        let data = ColumnFamilyData {
            id,
            name: name.to_string(),
            options: family.options.clone(),
            mem: Arc::new(ColumnFamilyData::new_memtable(&family.options)),
            imm: Vec::new(),
            mem_log_number: state.log_file_number,
            imm_log_numbers: Vec::new(),
        };
        state.families.insert(id, data);
        info!("created column family {} (id {})", name, id);
        Ok(ColumnFamilyHandle::new(id, name))
    }

    pub fn drop_column_family(&self, handle: &ColumnFamilyHandle) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.versions.drop_column_family_by_id(handle.id)?;
        state.families.remove(&handle.id);
        state.force_flush.remove(&handle.id);
        info!("dropped column family {} (id {})", handle.name, handle.id);
        Ok(())
    }

    // ---- write path ----

    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn put_cf(
        &self,
        options: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf.id, key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    pub fn delete_cf(
        &self,
        options: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf.id, key);
        self.write(options, batch)
    }

    pub fn merge(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge(key, value);
        self.write(options, batch)
    }

    pub fn merge_cf(
        &self,
        options: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge_cf(cf.id, key, value);
        self.write(options, batch)
    }

    /// Group commit: writers queue FIFO; the front writer becomes leader,
    /// coalesces compatible neighbors, appends one WAL record, applies the
    /// memtable changes, and hands leadership to the next front.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress("db is closing".into()));
        }

        let deadline = options
            .timeout_hint_us
            .map(|us| Instant::now() + Duration::from_micros(us));

        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_writer_id;
        state.next_writer_id += 1;
        let handle = Arc::new(WriterHandle {
            id,
            cv: Condvar::new(),
            core: Mutex::new(WriterCore {
                batch: Some(batch),
                sync: options.sync,
                disable_wal: options.disable_wal,
                ignore_missing_column_families: options.ignore_missing_column_families,
                done: false,
                in_group: false,
                result: None,
            }),
        });
        state.writers.push_back(handle.clone());

        loop {
            {
                let mut core = handle.core.lock().unwrap();
                if core.done {
                    return core.result.take().unwrap_or(Ok(()));
                }
            }
            let is_front = state
                .writers
                .front()
                .map(|w| w.id == handle.id)
                .unwrap_or(false);
            if is_front {
                break;
            }

            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        let in_flight = {
                            let core = handle.core.lock().unwrap();
                            core.in_group || core.done
                        };
                        if in_flight {
                            // Too late to bail; the leader owns our batch.
                            state = handle.cv.wait(state).unwrap();
                            continue;
                        }
                        state.writers.retain(|w| w.id != handle.id);
                        return Err(Error::TimedOut(
                            "write waited past its timeout hint".into(),
                        ));
                    }
                    let (s, _) = handle.cv.wait_timeout(state, dl - now).unwrap();
                    state = s;
                }
                None => {
                    state = handle.cv.wait(state).unwrap();
                }
            }
        }

        self.inner.write_as_leader(state, &handle)
    }

    // ---- read path ----

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Vec<u8>> {
        self.get_cf(options, &self.default_column_family(), key)
    }

    pub fn get_cf(
        &self,
        options: &ReadOptions,
        cf: &ColumnFamilyHandle,
        key: &[u8],
    ) -> Result<Vec<u8>> {
        let (mem, imms, version, sequence, cf_options) = {
            let state = self.inner.state.lock().unwrap();
            let family = state.families.get(&cf.id).ok_or_else(|| {
                Error::InvalidArgument(format!("unknown column family {}", cf.name))
            })?;
            let sequence = options
                .snapshot
                .as_ref()
                .map(|s| s.sequence())
                .unwrap_or_else(|| state.versions.last_sequence());
            (
                family.mem.clone(),
                family.imm.clone(),
                state.versions.current(cf.id),
                sequence,
                family.options.clone(),
            )
        };

        let lookup = LookupKey::new(key, sequence);
        let ucmp = cf_options.comparator.clone();
        let mut ctx = GetContext::new(
            ucmp.as_ref(),
            cf_options.merge_operator.as_deref(),
            lookup.user_key(),
        );

        mem.get(&lookup, &mut ctx)?;
        if !ctx.done() {
            for imm in imms.iter().rev() {
                imm.get(&lookup, &mut ctx)?;
                if ctx.done() {
                    break;
                }
            }
        }
        if !ctx.done() {
            version.get(options, &lookup, &mut ctx)?;
        }

        match ctx.finalize()? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound(String::from_utf8_lossy(key).to_string())),
        }
    }

    /// All keys read against one sequence number, so the results form a
    /// consistent snapshot.
    pub fn multi_get(&self, options: &ReadOptions, keys: &[&[u8]]) -> Vec<Result<Vec<u8>>> {
        let snapshot = match options.snapshot.clone() {
            Some(s) => s,
            None => self.get_snapshot(),
        };
        let mut per_key_options = options.clone();
        per_key_options.snapshot = Some(snapshot.clone());

        let results = keys
            .iter()
            .map(|key| self.get(&per_key_options, key))
            .collect();
        if options.snapshot.is_none() {
            self.release_snapshot(snapshot);
        }
        results
    }

    pub fn new_iterator(&self, options: &ReadOptions) -> Result<crate::db_iter::DBIter<E>> {
        self.new_iterator_cf(options, &self.default_column_family())
    }

    pub fn new_iterator_cf(
        &self,
        options: &ReadOptions,
        cf: &ColumnFamilyHandle,
    ) -> Result<crate::db_iter::DBIter<E>> {
        let state = self.inner.state.lock().unwrap();
        let family = state
            .families
            .get(&cf.id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown column family {}", cf.name)))?;
        let sequence = options
            .snapshot
            .as_ref()
            .map(|s| s.sequence())
            .unwrap_or_else(|| state.versions.last_sequence());
        let version = state.versions.current(cf.id);
        let icmp = state.versions.family(cf.id).unwrap().icmp.clone();

        let mut pinned = vec![family.mem.clone()];
        pinned.extend(family.imm.iter().cloned());

        let mut children: Vec<Box<dyn DBIterator>> = vec![family.mem.iter()];
        for imm in family.imm.iter().rev() {
            children.push(imm.iter());
        }

        let merge_operator = family.options.merge_operator.clone();
        let ucmp = family.options.comparator.clone();
        // Table opens do I/O; never under the DB mutex.
        drop(state);
        children.extend(version.iters(options)?);

        Ok(crate::db_iter::DBIter::new(
            MergingIterator::new(icmp, children),
            ucmp,
            merge_operator,
            sequence,
            pinned,
            version,
        ))
    }

    // ---- snapshots ----

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        let mut state = self.inner.state.lock().unwrap();
        let seq = state.versions.last_sequence();
        state.snapshots.new_snapshot(seq)
    }

    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut state = self.inner.state.lock().unwrap();
        state.snapshots.release(&snapshot);
    }

    // ---- maintenance ----

    pub fn flush(&self, options: &FlushOptions) -> Result<()> {
        self.flush_cf(options, &self.default_column_family())
    }

    pub fn flush_cf(&self, options: &FlushOptions, cf: &ColumnFamilyHandle) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        {
            let family = state.families.get(&cf.id).ok_or_else(|| {
                Error::InvalidArgument(format!("unknown column family {}", cf.name))
            })?;
            if family.mem.is_empty() && family.imm.is_empty() {
                return Ok(());
            }
        }

        if !state.families[&cf.id].mem.is_empty() {
            state = self.inner.switch_memtable(state, cf.id)?;
        }
        state.force_flush.insert(cf.id);
        self.inner.maybe_schedule_compaction(&mut state);

        if options.wait {
            while state
                .families
                .get(&cf.id)
                .map(|f| !f.imm.is_empty())
                .unwrap_or(false)
                && state.bg_error.is_none()
            {
                state = self
                    .inner
                    .background_work_finished
                    .wait(state)
                    .unwrap();
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone_shallow());
            }
        }
        Ok(())
    }

    /// Compacts every level intersecting [begin, end] down the tree,
    /// starting with a flush so the memtable participates.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.compact_range_cf(&self.default_column_family(), begin, end)
    }

    pub fn compact_range_cf(
        &self,
        cf: &ColumnFamilyHandle,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        self.flush_cf(&FlushOptions { wait: true }, cf)?;

        let begin_key =
            begin.map(|b| InternalKey::new(b, MAX_SEQUENCE_NUMBER, crate::types::VALUE_TYPE_FOR_SEEK));
        let end_key = end.map(|e| InternalKey::new(e, 0, ValueType::Deletion));

        let max_level_with_files = {
            let state = self.inner.state.lock().unwrap();
            let version = state.versions.current(cf.id);
            let mut max_level = 1;
            for level in 1..version.num_levels() {
                if version.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        for level in 0..max_level_with_files {
            let mut state = self.inner.state.lock().unwrap();
            // One manual compaction at a time.
            while state.manual_compaction.is_some() {
                state = self.inner.background_work_finished.wait(state).unwrap();
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone_shallow());
            }
            state.manual_compaction = Some(ManualCompaction {
                cf_id: cf.id,
                level,
                done: false,
                begin: begin_key.clone(),
                end: end_key.clone(),
            });
            self.inner.maybe_schedule_compaction(&mut state);
            while state.manual_compaction.is_some() && state.bg_error.is_none() {
                state = self.inner.background_work_finished.wait(state).unwrap();
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone_shallow());
            }
        }
        Ok(())
    }

    pub fn get_property(&self, name: &str) -> Option<String> {
        self.get_property_cf(&self.default_column_family(), name)
    }

    pub fn get_property_cf(&self, cf: &ColumnFamilyHandle, name: &str) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        let family = state.families.get(&cf.id)?;
        let version = state.versions.current(cf.id);

        let rest = name.strip_prefix("stratadb.")?;
        if let Some(level) = rest.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= version.num_levels() {
                return None;
            }
            return Some(version.num_files(level).to_string());
        }
        match rest {
            "stats" => {
                let mut out = String::from(
                    "Level  Files  Size(MB)  Read(MB)  Write(MB)\n\
                     -------------------------------------------\n",
                );
                for level in 0..version.num_levels() {
                    let files = version.num_files(level);
                    let stats = &state.stats[level];
                    if files > 0 || stats.count > 0 {
                        out.push_str(&format!(
                            "{:>5}  {:>5}  {:>8.1}  {:>8.1}  {:>9.1}\n",
                            level,
                            files,
                            version.level_total_file_size(level) as f64 / 1048576.0,
                            stats.bytes_read as f64 / 1048576.0,
                            stats.bytes_written as f64 / 1048576.0,
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => {
                let mut out = String::new();
                for level in 0..version.num_levels() {
                    for f in version.files[level].iter() {
                        out.push_str(&format!(
                            "level {}: {:06}.sst {} bytes [{:?} .. {:?}]\n",
                            level, f.number, f.file_size, f.smallest, f.largest
                        ));
                    }
                }
                Some(out)
            }
            "num-immutable-mem-table" => Some(family.imm.len().to_string()),
            "cur-size-active-mem-table" => {
                Some(family.mem.approximate_memory_usage().to_string())
            }
            "approximate-memory-usage" => {
                let mut total = family.mem.approximate_memory_usage();
                for imm in family.imm.iter() {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            "background-errors" => Some(if state.bg_error.is_some() { "1" } else { "0" }.into()),
            _ => None,
        }
    }

    /// Approximate on-disk byte span of each user-key range.
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.get_approximate_sizes_cf(&self.default_column_family(), ranges)
    }

    pub fn get_approximate_sizes_cf(
        &self,
        cf: &ColumnFamilyHandle,
        ranges: &[(&[u8], &[u8])],
    ) -> Vec<u64> {
        let version = {
            let state = self.inner.state.lock().unwrap();
            state.versions.current(cf.id)
        };
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, MAX_SEQUENCE_NUMBER, crate::types::VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, MAX_SEQUENCE_NUMBER, crate::types::VALUE_TYPE_FOR_SEEK);
                let off1 = version.approximate_offset_of(&k1);
                let off2 = version.approximate_offset_of(&k2);
                off2.saturating_sub(off1)
            })
            .collect()
    }

    /// Names (relative to the DB dir) of every file a consistent backup
    /// needs, plus the current manifest size.
    pub fn get_live_files(&self, flush_memtable: bool) -> Result<(Vec<String>, u64)> {
        if flush_memtable {
            let cfs: Vec<ColumnFamilyHandle> = {
                let state = self.inner.state.lock().unwrap();
                state
                    .families
                    .values()
                    .map(|f| ColumnFamilyHandle::new(f.id, f.name.clone()))
                    .collect()
            };
            for cf in cfs {
                self.flush_cf(&FlushOptions { wait: true }, &cf)?;
            }
        }

        let state = self.inner.state.lock().unwrap();
        let mut live = HashSet::new();
        state.versions.live_files(&mut live);

        let mut names: Vec<String> = vec![
            "CURRENT".to_string(),
            format!("MANIFEST-{:06}", state.versions.manifest_file_number()),
        ];
        for number in live {
            names.push(format!("{:06}.sst", number));
        }
        let manifest_size = self
            .inner
            .env
            .file_size(&descriptor_file_name(
                &self.inner.db_name,
                state.versions.manifest_file_number(),
            ))
            .unwrap_or(0);
        Ok((names, manifest_size))
    }

    pub fn get_sorted_wal_files(&self) -> Result<Vec<WalFile>> {
        // Hold the GC off while listing.
        let _state = self.inner.state.lock().unwrap();
        sorted_wal_files(&self.inner.env, &self.inner.db_name, &self.inner.wal_dir)
    }

    /// Batches committed at or after `since`, streamed from archived and
    /// live WAL segments.
    pub fn get_updates_since(
        &self,
        since: SequenceNumber,
    ) -> Result<TransactionLogIterator<E>> {
        let files = self.get_sorted_wal_files()?;
        Ok(TransactionLogIterator::new(
            self.inner.env.clone(),
            self.inner.db_name.clone(),
            files,
            since,
        ))
    }

    pub fn disable_file_deletions(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.disable_deletions += 1;
    }

    pub fn enable_file_deletions(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.disable_deletions > 0 {
            state.disable_deletions -= 1;
        }
        if state.disable_deletions == 0 {
            self.inner.delete_obsolete_files(&mut state);
        }
    }

    /// Removes one table file by name, refusing when deeper levels hold
    /// older versions of its keys (deleting it would resurrect them).
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let (number, file_type) = parse_file_name(name)?;
        if file_type != FileType::Table {
            return Err(Error::InvalidArgument(format!(
                "{} is not a table file",
                name
            )));
        }

        let mut state = self.inner.state.lock().unwrap();
        let mut located: Option<(u32, usize, Arc<FileMetaData>)> = None;
        for id in state.versions.family_ids() {
            let version = state.versions.current(id);
            for (level, files) in version.files.iter().enumerate() {
                if let Some(f) = files.iter().find(|f| f.number == number) {
                    located = Some((id, level, f.clone()));
                    break;
                }
            }
        }
        let (cf, level, meta) = located.ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not live in any version", name))
        })?;

        let version = state.versions.current(cf);
        for deeper in level + 1..version.num_levels() {
            if version.overlap_in_level(
                deeper,
                Some(meta.smallest.user_key()),
                Some(meta.largest.user_key()),
            ) {
                return Err(Error::InvalidArgument(format!(
                    "{} overlaps older data at level {}",
                    name, deeper
                )));
            }
        }

        let mut edit = crate::version_edit::VersionEdit::new();
        edit.delete_file(level, number);
        state.versions.log_and_apply(cf, &mut edit)?;
        self.inner.delete_obsolete_files(&mut state);
        Ok(())
    }

    pub fn get_db_identity(&self) -> Result<String> {
        let state = self.inner.state.lock().unwrap();
        Ok(state.identity.clone())
    }

    /// Closes the DB: stops background work, joins the workers, releases the
    /// lock. Called automatically on drop.
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().unwrap();
        for _ in workers.iter() {
            let _ = self.inner.bg_sender.send(BgTask::Exit);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        let mut state = self.inner.state.lock().unwrap();
        if let Some(log) = state.log.as_mut() {
            let _ = log.sync();
        }
        if let Some(lock) = state.lock.take() {
            let _ = self.inner.env.unlock_file(lock);
        }
    }
}

impl<E: Env> Drop for StrataDb<E> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Checks a batch before it reaches the WAL: decodable, and every record
/// targets a known column family (unless the writer opted out).
fn validate_batch(
    batch: &WriteBatch,
    known_families: &HashSet<u32>,
    ignore_missing_column_families: bool,
) -> Option<Error> {
    struct Checker<'a> {
        known: &'a HashSet<u32>,
        unknown: Option<u32>,
    }
    impl Checker<'_> {
        fn check(&mut self, cf: u32) {
            if self.unknown.is_none() && !self.known.contains(&cf) {
                self.unknown = Some(cf);
            }
        }
    }
    impl Handler for Checker<'_> {
        fn put(&mut self, cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
            self.check(cf);
            Ok(())
        }
        fn delete(&mut self, cf: u32, _key: &[u8]) -> Result<()> {
            self.check(cf);
            Ok(())
        }
        fn merge(&mut self, cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
            self.check(cf);
            Ok(())
        }
    }

    let mut checker = Checker {
        known: known_families,
        unknown: None,
    };
    if let Err(e) = batch.iterate(&mut checker) {
        return Some(e);
    }
    match checker.unknown {
        Some(cf) if !ignore_missing_column_families => Some(Error::InvalidArgument(format!(
            "write batch references unknown column family {}",
            cf
        ))),
        _ => None,
    }
}

fn random_identity() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("stratadb-{}", suffix)
}

struct RecoveryReporter {
    dropped: usize,
}

impl Reporter for RecoveryReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!("wal corruption: {} bytes dropped ({})", bytes, reason);
        self.dropped += bytes;
    }
}

impl<E: Env> DbInner<E> {
    // ---- recovery ----

    /// Replays every WAL at or after the manifest's log number, flushing
    /// oversized recovery memtables along the way, then installs a fresh
    /// WAL and publishes the recovered sequence numbers.
    fn recover_wal(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();

        let mut children = Vec::new();
        self.env.get_children(&self.wal_dir, &mut children)?;
        if self.wal_dir != self.db_name {
            self.env.get_children(&self.db_name, &mut children)?;
        }

        let mut expected = HashSet::new();
        state.versions.live_files(&mut expected);
        let mut logs = Vec::new();
        for name in children.iter() {
            if let Ok((number, file_type)) = parse_file_name(name) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            return Err(Error::Corruption(format!(
                "{} table files are missing, e.g. {:06}.sst",
                expected.len(),
                expected.iter().next().unwrap()
            )));
        }

        logs.sort_unstable();
        logs.dedup();

        let mut max_sequence: SequenceNumber = 0;
        for number in logs.iter() {
            state = self.replay_wal_file(state, *number, &mut max_sequence)?;
            state.versions.mark_file_number_used(*number);
        }

        // Fresh WAL for new writes.
        state = self.install_new_wal(state)?;
        let new_log = state.log_file_number;

        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }

        // Flush whatever replay left in memory and advance every family past
        // the replayed logs.
        let ids: Vec<u32> = state.families.keys().copied().collect();
        for id in ids {
            if !state.families[&id].mem.is_empty() {
                let mem = {
                    let family = state.families.get_mut(&id).unwrap();
                    let full = std::mem::replace(
                        &mut family.mem,
                        Arc::new(ColumnFamilyData::new_memtable(&family.options)),
                    );
                    family.mem_log_number = new_log;
                    full
                };
                state = self.flush_memtables_to_level0(state, id, vec![mem], new_log)?;
            } else {
                let family = state.families.get_mut(&id).unwrap();
                family.mem_log_number = new_log;
                let mut edit = crate::version_edit::VersionEdit::new();
                edit.set_log_number(new_log);
                if id == 0 {
                    edit.set_prev_log_number(0);
                }
                state.versions.log_and_apply(id, &mut edit)?;
            }
        }

        // prev_log_number is vestigial once replay finishes; retire it.
        if state.versions.prev_log_number() != 0 {
            let mut edit = crate::version_edit::VersionEdit::new();
            edit.set_prev_log_number(0);
            state.versions.log_and_apply(0, &mut edit)?;
        }

        info!(
            "recovered {} wal file(s), last sequence {}",
            logs.len(),
            state.versions.last_sequence()
        );
        Ok(())
    }

    fn replay_wal_file<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        number: u64,
        max_sequence: &mut SequenceNumber,
    ) -> Result<MutexGuard<'a, DbState<E>>> {
        let path = if self.env.file_exists(&log_file_name(&self.wal_dir, number)) {
            log_file_name(&self.wal_dir, number)
        } else {
            log_file_name(&self.db_name, number)
        };
        let file = self.env.new_sequential_file(&path)?;
        let mut reader =
            LogReader::with_reporter(file, true, Box::new(RecoveryReporter { dropped: 0 }));
        // Under paranoid checks a torn record fails recovery; otherwise the
        // tail of this log is dropped and replay continues with the next.
        reader.set_strict(self.options.paranoid_checks);

        let mut record = Vec::new();
        loop {
            match reader.read_record(&mut record) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => return Err(e),
            }
            if record.len() < 12 {
                warn!("wal {:06}: dropping short record", number);
                continue;
            }
            let mut batch = WriteBatch::new();
            batch.set_content(std::mem::take(&mut record));
            record = Vec::new();

            let last_seq = batch.sequence() + batch.count() as u64 - 1;
            if last_seq > *max_sequence {
                *max_sequence = last_seq;
            }

            // Families that already flushed past this log skip it.
            let mut targets: HashMap<u32, (Arc<MemTable>, Option<Arc<dyn crate::merge_operator::MergeOperator>>)> =
                HashMap::new();
            for (id, family) in state.families.iter() {
                let flushed_past = state
                    .versions
                    .family(*id)
                    .map(|f| f.log_number > number)
                    .unwrap_or(true);
                if !flushed_past {
                    targets.insert(
                        *id,
                        (family.mem.clone(), family.options.merge_operator.clone()),
                    );
                }
            }
            batch.insert_into(
                |cf| {
                    targets.get(&cf).map(|(mem, op)| MemTableTarget {
                        mem: mem.clone(),
                        merge_operator: op.clone(),
                        max_successive_merges: 0,
                    })
                },
                true,
            )?;

            // Spill oversized recovery memtables to level 0.
            let heavy: Vec<u32> = state
                .families
                .iter()
                .filter(|(_, f)| {
                    f.mem.approximate_memory_usage() > f.options.write_buffer_size
                })
                .map(|(id, _)| *id)
                .collect();
            for id in heavy {
                let mem = {
                    let family = state.families.get_mut(&id).unwrap();
                    std::mem::replace(
                        &mut family.mem,
                        Arc::new(ColumnFamilyData::new_memtable(&family.options)),
                    )
                };
                state = self.flush_memtables_to_level0(state, id, vec![mem], number)?;
            }
        }
        Ok(state)
    }

    fn install_new_wal<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
    ) -> Result<MutexGuard<'a, DbState<E>>> {
        let number = state.versions.new_file_number();
        match self
            .env
            .new_writable_file(&log_file_name(&self.wal_dir, number))
        {
            Ok(file) => {
                state.log = Some(LogWriter::new(file));
                state.log_file_number = number;
                Ok(state)
            }
            Err(e) => {
                state.versions.reuse_file_number(number);
                Err(e.into())
            }
        }
    }

    // ---- write path internals ----

    fn write_as_leader<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        leader: &Arc<WriterHandle>,
    ) -> Result<()> {
        let (room_state, room) = self.make_room_for_write(state, false);
        state = room_state;

        let mut status = room;
        // Queue order of the group, with per-writer rejections for batches
        // that must not reach the WAL (bad column family, corrupt batch).
        let mut group: Vec<(u64, Option<Error>)> = vec![(leader.id, None)];
        let mut group_result: Result<()> = Ok(());

        if status.is_ok() {
            let known: HashSet<u32> = state.families.keys().copied().collect();

            let mut leader_core = leader.core.lock().unwrap();
            leader_core.in_group = true;
            let sync = leader_core.sync;
            let disable_wal = leader_core.disable_wal;
            let ignore_missing = leader_core.ignore_missing_column_families;
            let leader_batch = leader_core.batch.take().expect("leader lost its batch");
            drop(leader_core);

            if let Some(err) = validate_batch(&leader_batch, &known, ignore_missing) {
                // Reject before any state changes; the DB stays healthy.
                group[0].1 = Some(err);
            } else {
                let mut total = leader_batch.approximate_size();
                let limit = if total < SMALL_BATCH_BYTES {
                    total + SMALL_BATCH_BYTES
                } else {
                    MAX_GROUP_COMMIT_BYTES
                };

                let mut group_batch = leader_batch;
                for w in state.writers.iter().skip(1) {
                    let mut core = w.core.lock().unwrap();
                    if core.sync && !sync {
                        break;
                    }
                    if core.disable_wal != disable_wal
                        || core.ignore_missing_column_families != ignore_missing
                    {
                        break;
                    }
                    let size = core
                        .batch
                        .as_ref()
                        .map(|b| b.approximate_size())
                        .unwrap_or(0);
                    if total + size > limit {
                        break;
                    }
                    if let Some(b) = core.batch.take() {
                        if let Some(err) = validate_batch(&b, &known, ignore_missing) {
                            core.in_group = true;
                            group.push((w.id, Some(err)));
                            continue;
                        }
                        group_batch.append(&b);
                        total += size;
                    }
                    core.in_group = true;
                    group.push((w.id, None));
                }

                let sequence = state.versions.last_sequence() + 1;
                group_batch.set_sequence(sequence);
                let count = group_batch.count() as u64;

                // Memtable targets for every family, resolved under the lock.
                let mut targets: HashMap<
                    u32,
                    (
                        Arc<MemTable>,
                        Option<Arc<dyn crate::merge_operator::MergeOperator>>,
                        usize,
                    ),
                > = HashMap::new();
                for (id, family) in state.families.iter() {
                    targets.insert(
                        *id,
                        (
                            family.mem.clone(),
                            family.options.merge_operator.clone(),
                            family.options.max_successive_merges,
                        ),
                    );
                }

                let mut log = state.log.take();

                // WAL append, fsync, and memtable application run without the
                // DB mutex; the queue order already fixed the commit order and
                // only the leader touches the log and the memtables.
                drop(state);

                if !disable_wal {
                    if let Some(log_writer) = log.as_mut() {
                        group_result = log_writer
                            .add_record(group_batch.content())
                            .and_then(|_| if sync { log_writer.sync() } else { Ok(()) });
                    }
                }

                if group_result.is_ok() {
                    group_result = group_batch.insert_into(
                        |cf| {
                            targets.get(&cf).map(|(mem, op, max)| MemTableTarget {
                                mem: mem.clone(),
                                merge_operator: op.clone(),
                                max_successive_merges: *max,
                            })
                        },
                        true,
                    );
                }

                state = self.state.lock().unwrap();
                state.log = log;
                // A flush waiting to switch the WAL can proceed again.
                self.background_work_finished.notify_all();
                if group_result.is_ok() {
                    state.versions.set_last_sequence(sequence + count - 1);
                } else {
                    // A half-applied group poisons the DB for writes.
                    let err = group_result.as_ref().err().unwrap().clone_shallow();
                    self.record_background_error(&mut state, err);
                }
            }
        }

        if status.is_ok() {
            status = match &group_result {
                Ok(()) => Ok(()),
                Err(e) => Err(e.clone_shallow()),
            };
        }

        // Retire the whole group from the queue and wake the members.
        let mut leader_result = Ok(());
        for (id, rejection) in group.into_iter() {
            let front = state.writers.pop_front().expect("group member missing");
            assert_eq!(front.id, id);
            let writer_status: Result<()> = match rejection {
                Some(err) => Err(err),
                None => match &status {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.clone_shallow()),
                },
            };
            if id == leader.id {
                leader_result = writer_status;
            } else {
                let mut core = front.core.lock().unwrap();
                core.done = true;
                core.result = Some(writer_status);
                front.cv.notify_one();
            }
        }

        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }

        leader_result
    }

    /// Enforces write stalls and memtable switching before a group commit.
    fn make_room_for_write<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        force: bool,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let mut allow_delay = !force;
        loop {
            if let Some(e) = state.bg_error.as_ref().map(|e| e.clone_shallow()) {
                return (state, Err(e));
            }

            let l0_files = state
                .versions
                .family_ids()
                .into_iter()
                .map(|id| state.versions.current(id).num_files(0))
                .max()
                .unwrap_or(0);

            if allow_delay && l0_files >= self.options.level0_slowdown_writes_trigger {
                // Shed a millisecond to the compactor instead of stalling
                // hard later; done at most once per write.
                drop(state);
                self.env.sleep_for_micros(1000);
                allow_delay = false;
                state = self.state.lock().unwrap();
                continue;
            }

            let over_budget: Vec<u32> = state
                .families
                .iter()
                .filter(|(_, f)| {
                    f.mem.approximate_memory_usage() >= f.options.write_buffer_size
                })
                .map(|(id, _)| *id)
                .collect();

            if over_budget.is_empty() {
                return (state, Ok(()));
            }

            // A family whose frozen list is full forces the writer to wait.
            let must_wait = over_budget.iter().any(|id| {
                let f = &state.families[id];
                f.imm.len() + 1 >= f.options.max_write_buffer_number
            });
            if must_wait {
                info!("too many immutable memtables; waiting");
                self.maybe_schedule_compaction(&mut state);
                state = self.background_work_finished.wait(state).unwrap();
                continue;
            }

            if l0_files >= self.options.level0_stop_writes_trigger {
                info!("level-0 stop trigger reached; waiting for compaction");
                self.maybe_schedule_compaction(&mut state);
                state = self.background_work_finished.wait(state).unwrap();
                continue;
            }

            for id in over_budget {
                match self.switch_memtable(state, id) {
                    Ok(s) => state = s,
                    Err(e) => {
                        state = self.state.lock().unwrap();
                        return (state, Err(e));
                    }
                }
            }
            self.maybe_schedule_compaction(&mut state);
        }
    }

    /// Freezes the family's active memtable behind a fresh WAL.
    fn switch_memtable<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        cf: u32,
    ) -> Result<MutexGuard<'a, DbState<E>>> {
        // A group leader may have taken the log writer out for its
        // unlocked WAL append; switching now would clobber its handoff.
        while state.log.is_none() {
            state = self.background_work_finished.wait(state).unwrap();
        }
        state = self.install_new_wal(state)?;
        let new_log = state.log_file_number;

        let family = state.families.get_mut(&cf).unwrap();
        let old_mem = std::mem::replace(
            &mut family.mem,
            Arc::new(ColumnFamilyData::new_memtable(&family.options)),
        );
        family.imm.push(old_mem);
        family.imm_log_numbers.push(family.mem_log_number);
        family.mem_log_number = new_log;

        // WAL growth beyond the budget forces laggard families to flush so
        // old segments can retire.
        if self.options.max_total_wal_size > 0 {
            if let Ok(files) =
                sorted_wal_files(&self.env, &self.db_name, &self.wal_dir)
            {
                let total: u64 = files
                    .iter()
                    .filter(|f| f.file_type == crate::transaction_log::WalFileType::Alive)
                    .map(|f| f.size_bytes)
                    .sum();
                if total > self.options.max_total_wal_size {
                    let laggards: Vec<u32> = state
                        .families
                        .iter()
                        .filter(|(id, f)| {
                            **id != cf && !f.mem.is_empty() && f.mem_log_number < new_log
                        })
                        .map(|(id, _)| *id)
                        .collect();
                    for id in laggards {
                        let family = state.families.get_mut(&id).unwrap();
                        let old = std::mem::replace(
                            &mut family.mem,
                            Arc::new(ColumnFamilyData::new_memtable(&family.options)),
                        );
                        family.imm.push(old);
                        family.imm_log_numbers.push(family.mem_log_number);
                        family.mem_log_number = new_log;
                        state.force_flush.insert(id);
                    }
                }
            }
        }

        Ok(state)
    }

    fn record_background_error(&self, state: &mut DbState<E>, err: Error) {
        if state.bg_error.is_none() {
            error!("background error latched: {}", err);
            state.bg_error = Some(err);
        }
        self.background_work_finished.notify_all();
    }

    fn flush_candidate(&self, state: &DbState<E>) -> Option<u32> {
        for (id, family) in state.families.iter() {
            if state.flushing.contains(id) || family.imm.is_empty() {
                continue;
            }
            if family.imm.len() >= family.options.min_write_buffer_number_to_merge
                || state.force_flush.contains(id)
            {
                return Some(*id);
            }
        }
        None
    }

    fn maybe_schedule_compaction(&self, state: &mut DbState<E>) {
        if self.shutdown.load(Ordering::Acquire) || state.bg_error.is_some() {
            return;
        }
        let has_work = self.flush_candidate(state).is_some()
            || state.manual_compaction.is_some()
            || state.versions.need_compaction();
        let capacity =
            self.options.max_background_flushes + self.options.max_background_compactions;
        if has_work && state.bg_scheduled < capacity.max(1) {
            state.bg_scheduled += 1;
            let _ = self.bg_sender.send(BgTask::Work);
        }
    }

    // ---- background work ----

    fn background_call(&self) {
        let mut state = self.state.lock().unwrap();
        state.bg_scheduled = state.bg_scheduled.saturating_sub(1);

        if self.shutdown.load(Ordering::Acquire) || state.bg_error.is_some() {
            self.background_work_finished.notify_all();
            return;
        }

        if let Some(cf) = self.flush_candidate(&state) {
            state.flushing.insert(cf);
            let (mut s, result) = self.flush_family(state, cf);
            s.flushing.remove(&cf);
            s.force_flush.remove(&cf);
            if let Err(e) = result {
                self.record_background_error(&mut s, e);
            }
            state = s;
        } else if !state.compacting
            && (state.manual_compaction.is_some() || state.versions.need_compaction())
        {
            state.compacting = true;
            let (mut s, result) = self.background_compaction(state);
            s.compacting = false;
            match result {
                Ok(()) => {}
                Err(Error::ShutdownInProgress(_)) => {}
                Err(e) => self.record_background_error(&mut s, e),
            }
            state = s;
        }

        self.maybe_schedule_compaction(&mut state);
        self.background_work_finished.notify_all();
    }

    /// Flushes every frozen memtable of one family into a single L0 table.
    fn flush_family<'a>(
        &'a self,
        state: MutexGuard<'a, DbState<E>>,
        cf: u32,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let mems = state.families[&cf].imm.clone();
        assert!(!mems.is_empty());
        let taken = mems.len();
        let log_number = state.families[&cf].mem_log_number;

        let result = self.flush_memtables_to_level0(state, cf, mems, log_number);
        match result {
            Ok(mut s) => {
                let family = s.families.get_mut(&cf).unwrap();
                family.imm.drain(0..taken);
                family.imm_log_numbers.drain(0..taken.min(family.imm_log_numbers.len()));
                self.delete_obsolete_files(&mut s);
                (s, Ok(()))
            }
            Err(e) => {
                let state = self.state.lock().unwrap();
                (state, Err(e))
            }
        }
    }

    /// Builds one L0 table from the given memtables (merged) and applies the
    /// version edit with `log_number`. Consumes and returns the guard; on
    /// error the caller must re-lock.
    fn flush_memtables_to_level0<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        cf: u32,
        mems: Vec<Arc<MemTable>>,
        log_number: u64,
    ) -> Result<MutexGuard<'a, DbState<E>>> {
        let number = state.versions.new_file_number();
        state.versions.pending_outputs.insert(number);
        let base = state.versions.current(cf);
        let cf_options = state.families[&cf].options.clone();
        let icmp = state.versions.family(cf).unwrap().icmp.clone();
        drop(state);

        let start = self.env.now_micros();
        let mut meta = FileMetaData {
            number,
            ..Default::default()
        };

        let result = (|| -> Result<()> {
            let children: Vec<Box<dyn DBIterator>> = mems.iter().map(|m| m.iter()).collect();
            let merged: Box<dyn DBIterator> =
                Box::new(MergingIterator::new(icmp.clone(), children));
            build_table(
                &self.db_name,
                self.env.clone(),
                &self.options,
                &cf_options,
                &self.table_cache,
                merged,
                &mut meta,
                self.options.rate_limiter.as_deref(),
            )
        })();

        let mut state = self.state.lock().unwrap();
        state.versions.pending_outputs.remove(&number);
        result?;

        let mut edit = crate::version_edit::VersionEdit::new();
        if meta.file_size > 0 {
            // Universal and FIFO keep every run in level 0.
            let level = if self.options.compaction_style == CompactionStyle::Level {
                base.pick_level_for_memtable_output(
                    Some(meta.smallest.user_key()),
                    Some(meta.largest.user_key()),
                )
            } else {
                0
            };
            info!(
                "flushed memtable of family {} to level {} table {:06} ({} bytes)",
                cf, level, meta.number, meta.file_size
            );
            state.stats[level].add(CompactionStats {
                micros: self.env.now_micros().saturating_sub(start),
                bytes_read: 0,
                bytes_written: meta.file_size,
                count: 1,
            });
            edit.add_file(level, meta);
        } else {
            state.versions.reuse_file_number(number);
        }
        edit.set_log_number(log_number);
        state.versions.log_and_apply(cf, &mut edit)?;
        Ok(state)
    }

    fn background_compaction<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        // Manual compactions take priority and run one level slice at a
        // time.
        if let Some(mut manual) = state.manual_compaction.take() {
            let compaction = state.versions.compact_range(
                manual.cf_id,
                manual.level,
                manual.begin.as_ref(),
                manual.end.as_ref(),
            );
            match compaction {
                None => {
                    // Nothing left in range at this level.
                    self.background_work_finished.notify_all();
                    return (state, Ok(()));
                }
                Some(c) => {
                    // Resume after this slice's upper bound next round.
                    let largest = c.inputs[0]
                        .iter()
                        .map(|f| f.largest.clone())
                        .max_by(|a, b| {
                            state.versions.family(manual.cf_id).unwrap().icmp.compare(
                                a.encode(),
                                b.encode(),
                            )
                        })
                        .unwrap();
                    manual.begin = Some(largest);
                    state.manual_compaction = Some(manual);

                    let (mut s, result) = self.run_compaction(state, c);
                    if result.is_err() {
                        s.manual_compaction = None;
                    }
                    self.background_work_finished.notify_all();
                    return (s, result);
                }
            }
        }

        let compaction = state.versions.pick_compaction();
        match compaction {
            None => (state, Ok(())),
            Some(c) => self.run_compaction(state, c),
        }
    }

    fn run_compaction<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState<E>>,
        mut c: Compaction<E>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let cf = c.cf_id;

        if c.deletion_only {
            // FIFO: the picker already queued the deletions.
            let result = state.versions.log_and_apply(cf, &mut c.edit);
            c.release_input_version();
            if result.is_ok() {
                self.delete_obsolete_files(&mut state);
            }
            return (state, result);
        }

        if c.is_trivial_move() {
            let f = c.input(0, 0).clone();
            let level = c.level();
            let output_level = c.output_level();
            c.edit.delete_file(level, f.number);
            c.edit.add_file(output_level, (*f).clone());
            let result = state.versions.log_and_apply(cf, &mut c.edit);
            c.release_input_version();
            match result {
                Ok(()) => {
                    info!(
                        "moved table {:06} ({} bytes) from level {} to level {}",
                        f.number, f.file_size, level, output_level
                    );
                    self.delete_obsolete_files(&mut state);
                    (state, Ok(()))
                }
                Err(e) => (state, Err(e)),
            }
        } else {
            let (mut s, result) = self.do_compaction_work(state, &mut c);
            c.release_input_version();
            if result.is_ok() {
                self.delete_obsolete_files(&mut s);
            }
            (s, result)
        }
    }

    /// The compaction driver: walks the merged inputs, drops shadowed and
    /// dead entries under the live-snapshot set, folds merge runs, applies
    /// the compaction filter, and rotates output files.
    fn do_compaction_work<'a>(
        &'a self,
        state: MutexGuard<'a, DbState<E>>,
        c: &mut Compaction<E>,
    ) -> (MutexGuard<'a, DbState<E>>, Result<()>) {
        let cf = c.cf_id;
        let start = self.env.now_micros();
        info!(
            "compacting {}@{} + {}@{} files (family {})",
            c.num_input_files(0),
            c.level(),
            c.num_input_files(1),
            c.output_level(),
            cf
        );

        let snapshots = state.snapshots.sequences();
        let smallest_snapshot = snapshots
            .first()
            .copied()
            .unwrap_or_else(|| state.versions.last_sequence());
        let icmp = state.versions.family(cf).unwrap().icmp.clone();
        let cf_options = state.families[&cf].options.clone();
        let ucmp = cf_options.comparator.clone();
        let paranoid = self.options.paranoid_checks;

        drop(state);

        let mut job = CompactionJob {
            inner: self,
            icmp: icmp.clone(),
            cf_options: cf_options.clone(),
            outputs: Vec::new(),
            builder: None,
            current_output_number: 0,
            total_written: 0,
            total_read: c.total_input_bytes(),
        };

        let work = (|| -> Result<()> {
            let mut input = make_input_iterator(
                &self.table_cache,
                &icmp,
                &cf_options,
                paranoid,
                c,
            )?;
            input.seek_to_first();

            let mut current_user_key: Vec<u8> = Vec::new();
            let mut has_current_user_key = false;
            // Snapshot window of the newest surviving base (VALUE/DELETION)
            // for the current user key.
            let mut last_base_window: Option<u64> = None;
            // Buffered run of consecutive MERGE operands (same key, same
            // window), newest first.
            let mut merge_run: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
            let mut merge_run_window = 0u64;

            while input.valid() {
                if self.shutdown.load(Ordering::Acquire) {
                    return Err(Error::ShutdownInProgress(
                        "compaction cancelled by shutdown".into(),
                    ));
                }

                let key = input.key().to_vec();
                let parsed = match ParsedInternalKey::parse(&key) {
                    Ok(p) => p,
                    Err(_) => {
                        // Undecodable entries are carried through verbatim.
                        warn!("compaction: carrying unparsable key");
                        job.flush_merge_run(c, &mut merge_run)?;
                        job.emit(c, &key, input.value())?;
                        has_current_user_key = false;
                        last_base_window = None;
                        input.next();
                        continue;
                    }
                };

                if !has_current_user_key
                    || ucmp.compare(parsed.user_key, &current_user_key)
                        != std::cmp::Ordering::Equal
                {
                    job.flush_merge_run(c, &mut merge_run)?;
                    current_user_key.clear();
                    current_user_key.extend_from_slice(parsed.user_key);
                    has_current_user_key = true;
                    last_base_window = None;
                }

                let window = earliest_visible_snapshot(parsed.sequence, &snapshots);
                let mut drop_entry = false;

                if last_base_window == Some(window) {
                    // A newer base within the same snapshot window shadows
                    // this entry entirely.
                    drop_entry = true;
                } else if parsed.val_type == ValueType::Deletion
                    && parsed.sequence <= smallest_snapshot
                    && c.is_base_level_for(parsed.user_key)
                {
                    // Deletion with nothing older underneath; it served its
                    // purpose.
                    drop_entry = true;
                    last_base_window = Some(window);
                } else if parsed.val_type == ValueType::Merge {
                    if !merge_run.is_empty() && merge_run_window != window {
                        job.flush_merge_run(c, &mut merge_run)?;
                    }
                    merge_run_window = window;
                    merge_run.push((key.clone(), input.value().to_vec()));
                    input.next();
                    continue;
                } else {
                    last_base_window = Some(window);
                }

                if !drop_entry {
                    let mut value_override: Option<Vec<u8>> = None;
                    if parsed.val_type == ValueType::Value
                        && parsed.sequence <= smallest_snapshot
                    {
                        if let Some(filter) = &cf_options.compaction_filter {
                            match filter.filter(c.level(), parsed.user_key, input.value()) {
                                FilterDecision::Keep => {}
                                FilterDecision::Remove => {
                                    drop_entry = true;
                                }
                                FilterDecision::Change(v) => value_override = Some(v),
                            }
                        }
                    }
                    if !drop_entry {
                        job.flush_merge_run(c, &mut merge_run)?;
                        match value_override {
                            Some(v) => job.emit(c, &key, &v)?,
                            None => job.emit(c, &key, input.value())?,
                        }
                    }
                }

                input.next();
            }

            job.flush_merge_run(c, &mut merge_run)?;
            input.status()?;
            job.finish_current_output(c)?;
            Ok(())
        })();

        let mut state = self.state.lock().unwrap();
        for output in job.outputs.iter() {
            state.versions.pending_outputs.remove(&output.number);
        }
        if state.versions.pending_outputs.contains(&job.current_output_number) {
            state.versions.pending_outputs.remove(&job.current_output_number);
        }

        match work {
            Ok(()) => {
                c.add_input_deletions();
                for output in job.outputs.drain(..) {
                    c.edit.add_file(c.output_level(), output);
                }
                let result = state.versions.log_and_apply(cf, &mut c.edit);
                if result.is_ok() {
                    state.stats[c.output_level()].add(CompactionStats {
                        micros: self.env.now_micros().saturating_sub(start),
                        bytes_read: job.total_read,
                        bytes_written: job.total_written,
                        count: 1,
                    });
                    info!(
                        "compaction finished: {} bytes in, {} bytes out",
                        job.total_read, job.total_written
                    );
                }
                (state, result)
            }
            Err(e) => {
                // Abandon every output written so far, including the one
                // still open in the builder.
                warn!("compaction abandoned: {}", e);
                if let Some((builder, meta)) = job.builder.take() {
                    builder.abandon();
                    let _ = self
                        .env
                        .delete_file(&table_file_name(&self.db_name, meta.number));
                }
                for output in job.outputs.iter() {
                    let _ = self
                        .env
                        .delete_file(&table_file_name(&self.db_name, output.number));
                }
                (state, Err(e))
            }
        }
    }

    // ---- file GC ----

    fn delete_obsolete_files(&self, state: &mut DbState<E>) {
        if state.disable_deletions > 0 {
            return;
        }

        let mut live = HashSet::new();
        state.versions.live_files(&mut live);
        let log_floor = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let mut dirs = vec![self.db_name.clone()];
        if self.wal_dir != self.db_name {
            dirs.push(self.wal_dir.clone());
        }
        for p in self.options.db_paths.iter() {
            dirs.push(p.path.clone());
        }

        let archive_wal = self.options.wal_ttl_seconds > 0 || self.options.wal_size_limit_mb > 0;

        for dir in dirs {
            let mut children = Vec::new();
            if self.env.get_children(&dir, &mut children).is_err() {
                continue;
            }
            for name in children {
                let (number, file_type) = match parse_file_name(&name) {
                    Ok(parsed) => parsed,
                    Err(_) => continue,
                };
                let keep = match file_type {
                    FileType::Log => {
                        number >= log_floor || number == prev_log || number == state.log_file_number
                    }
                    FileType::Descriptor => number >= manifest_number,
                    FileType::Table => live.contains(&number),
                    FileType::Temp => live.contains(&number),
                    FileType::Current
                    | FileType::DBLock
                    | FileType::InfoLog
                    | FileType::Identity => true,
                };
                if keep {
                    continue;
                }

                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }

                let path = dir.join(&name);
                if file_type == FileType::Log && archive_wal {
                    let _ = self.env.create_dir(&archival_dir_name(&self.db_name));
                    let archived = archived_log_file_name(&self.db_name, number);
                    if let Err(e) = self.env.rename_file(&path, &archived) {
                        warn!("archiving {} failed: {}", path.display(), e);
                    }
                } else {
                    info!("deleting obsolete file {}", path.display());
                    if let Err(e) = self.env.delete_file(&path) {
                        warn!("deleting {} failed: {}", path.display(), e);
                    }
                }
            }
        }

        if archive_wal {
            self.purge_wal_archive();
        }
    }

    /// Applies the TTL and total-size caps to the archived WALs.
    fn purge_wal_archive(&self) {
        let archive = archival_dir_name(&self.db_name);
        let mut children = Vec::new();
        if self.env.get_children(&archive, &mut children).is_err() {
            return;
        }
        let mut logs: Vec<(u64, PathBuf)> = children
            .iter()
            .filter_map(|name| match parse_file_name(name) {
                Ok((number, FileType::Log)) => Some((number, archive.join(name))),
                _ => None,
            })
            .collect();
        logs.sort_by_key(|(n, _)| *n);

        if self.options.wal_ttl_seconds > 0 {
            let now = self.env.now_micros();
            let ttl_micros = self.options.wal_ttl_seconds * 1_000_000;
            logs.retain(|(_, path)| {
                let expired = self
                    .env
                    .file_modified_micros(path)
                    .map(|m| now.saturating_sub(m) > ttl_micros)
                    .unwrap_or(false);
                if expired {
                    let _ = self.env.delete_file(path);
                }
                !expired
            });
        }

        if self.options.wal_size_limit_mb > 0 {
            let limit = self.options.wal_size_limit_mb * 1024 * 1024;
            let mut total: u64 = logs
                .iter()
                .map(|(_, path)| self.env.file_size(path).unwrap_or(0))
                .sum();
            for (_, path) in logs.iter() {
                if total <= limit {
                    break;
                }
                let size = self.env.file_size(path).unwrap_or(0);
                let _ = self.env.delete_file(path);
                total = total.saturating_sub(size);
            }
        }
    }
}

/// Output-side state of one compaction: the open builder, finished outputs,
/// and byte accounting.
struct CompactionJob<'a, E: Env> {
    inner: &'a DbInner<E>,
    icmp: crate::cmp::InternalKeyComparator,
    cf_options: Arc<crate::options::ColumnFamilyOptions>,
    outputs: Vec<FileMetaData>,
    builder: Option<(TableBuilder<E::WritableFile>, FileMetaData)>,
    current_output_number: u64,
    total_written: u64,
    total_read: u64,
}

impl<'a, E: Env> CompactionJob<'a, E> {
    fn open_output(&mut self, c: &Compaction<E>) -> Result<()> {
        let number = {
            let mut state = self.inner.state.lock().unwrap();
            let number = state.versions.new_file_number();
            state.versions.pending_outputs.insert(number);
            number
        };
        self.current_output_number = number;

        let path = table_file_name(&self.inner.db_name, number);
        let file = self.inner.env.new_writable_file(&path)?;
        let builder = TableBuilder::new(
            self.inner.options.clone(),
            &self.cf_options,
            self.cf_options.compression_for_level(c.output_level()),
            file,
        );
        let meta = FileMetaData {
            number,
            smallest_seq: MAX_SEQUENCE_NUMBER,
            ..Default::default()
        };
        self.builder = Some((builder, meta));
        Ok(())
    }

    fn emit(&mut self, c: &mut Compaction<E>, key: &[u8], value: &[u8]) -> Result<()> {
        if self.builder.is_some() && c.should_stop_before(key, &self.icmp) {
            self.finish_current_output(c)?;
        }
        if self.builder.is_none() {
            self.open_output(c)?;
        }

        if let Some(limiter) = self.inner.options.rate_limiter.as_deref() {
            limiter.request((key.len() + value.len()) as u64);
        }

        let (builder, meta) = self.builder.as_mut().unwrap();
        if builder.num_entries() == 0 {
            meta.smallest.decode(key);
        }
        meta.largest.decode(key);
        let sequence = extract_tag(key) >> 8;
        meta.smallest_seq = meta.smallest_seq.min(sequence);
        meta.largest_seq = meta.largest_seq.max(sequence);
        builder.add(key, value)?;

        if builder.file_size_estimate() >= c.max_output_file_size() {
            self.finish_current_output(c)?;
        }
        Ok(())
    }

    /// Emits (folding when profitable) a buffered run of merge operands.
    fn flush_merge_run(
        &mut self,
        c: &mut Compaction<E>,
        run: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(run);

        if entries.len() >= self.cf_options.min_partial_merge_operands.max(2) {
            if let Some(op) = &self.cf_options.merge_operator {
                let user_key = extract_user_key(&entries[0].0).to_vec();
                // Operands are buffered newest first; fold oldest first.
                let operands: Vec<Vec<u8>> =
                    entries.iter().rev().map(|(_, v)| v.clone()).collect();
                if let Some(folded) = op.partial_merge_multi(&user_key, &operands) {
                    // The folded operand takes the newest entry's position.
                    let key = entries[0].0.clone();
                    return self.emit(c, &key, &folded);
                }
            }
        }

        for (key, value) in entries.iter() {
            self.emit(c, key, value)?;
        }
        Ok(())
    }

    fn finish_current_output(&mut self, _c: &Compaction<E>) -> Result<()> {
        let (builder, mut meta) = match self.builder.take() {
            Some(b) => b,
            None => return Ok(()),
        };
        if builder.num_entries() == 0 {
            builder.abandon();
            let path = table_file_name(&self.inner.db_name, meta.number);
            let _ = self.inner.env.delete_file(&path);
            return Ok(());
        }

        let sync = !self.inner.options.disable_data_sync;
        meta.file_size = builder.finish(sync)?;
        self.total_written += meta.file_size;

        // Sanity: the fresh table must open and read.
        let table = self.inner.table_cache.find_table(&self.cf_options, &meta)?;
        drop(table);

        self.outputs.push(meta);
        Ok(())
    }
}

/// Smallest live snapshot that can observe `sequence`; the sentinel
/// `u64::MAX` means only unsnapshotted (latest) reads see it. Entries of the
/// same key sharing a bound are indistinguishable to every reader, so the
/// newer one shadows the older.
fn earliest_visible_snapshot(sequence: SequenceNumber, snapshots: &[SequenceNumber]) -> u64 {
    for s in snapshots {
        if *s >= sequence {
            return *s;
        }
    }
    u64::MAX
}

/// Removes every file of the database. The DB must not be open.
pub fn destroy_db<E: Env>(env: E, _options: &Options, path: impl AsRef<Path>) -> Result<()> {
    let db_name = path.as_ref();
    let mut children = Vec::new();
    if env.get_children(db_name, &mut children).is_err() {
        // Missing directory counts as destroyed.
        return Ok(());
    }

    let lock_path = lock_file_name(db_name);
    let lock = env.lock_file(&lock_path)?;

    for name in children {
        if name == "LOCK" {
            continue;
        }
        if parse_file_name(&name).is_ok() {
            let _ = env.delete_file(&db_name.join(&name));
        }
    }

    let archive = archival_dir_name(db_name);
    let mut archived = Vec::new();
    if env.get_children(&archive, &mut archived).is_ok() {
        for name in archived {
            let _ = env.delete_file(&archive.join(&name));
        }
        let _ = env.delete_dir(&archive);
    }

    env.unlock_file(lock)?;
    let _ = env.delete_file(&lock_path);
    let _ = env.delete_dir(db_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::mem::MemEnv;

    fn test_options() -> Options {
        Options {
            create_if_missing: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_put_get_delete() {
        let env = MemEnv::new();
        let db = StrataDb::open(test_options(), "db", env).unwrap();

        let wo = WriteOptions::default();
        db.put(&wo, b"apple", b"red").unwrap();
        db.put(&wo, b"banana", b"yellow").unwrap();

        assert_eq!(db.get(&ReadOptions::default(), b"apple").unwrap(), b"red");
        db.delete(&wo, b"apple").unwrap();
        assert!(db
            .get(&ReadOptions::default(), b"apple")
            .unwrap_err()
            .is_not_found());

        let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
        iter.seek_to_first();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"banana");
        assert_eq!(iter.value(), b"yellow");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_write_batch_is_atomic_in_memtable() {
        let env = MemEnv::new();
        let db = StrataDb::open(test_options(), "db", env).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        db.write(&WriteOptions::default(), batch).unwrap();

        assert_eq!(db.get(&ReadOptions::default(), b"a").unwrap(), b"1");
        assert_eq!(db.get(&ReadOptions::default(), b"c").unwrap(), b"3");
    }

    #[test]
    fn test_snapshot_isolation() {
        let env = MemEnv::new();
        let db = StrataDb::open(test_options(), "db", env).unwrap();
        let wo = WriteOptions::default();

        db.put(&wo, b"x", b"1").unwrap();
        let snapshot = db.get_snapshot();
        db.put(&wo, b"x", b"2").unwrap();

        assert_eq!(db.get(&ReadOptions::default(), b"x").unwrap(), b"2");

        let mut old = ReadOptions::default();
        old.snapshot = Some(snapshot.clone());
        assert_eq!(db.get(&old, b"x").unwrap(), b"1");

        db.release_snapshot(snapshot);
        assert_eq!(db.get(&ReadOptions::default(), b"x").unwrap(), b"2");
    }

    #[test]
    fn test_reopen_replays_wal() {
        let env = MemEnv::new();
        {
            let db = StrataDb::open(test_options(), "db", env.clone()).unwrap();
            let wo = WriteOptions {
                sync: true,
                ..Default::default()
            };
            db.put(&wo, b"k1", b"v1").unwrap();
            db.put(&wo, b"k2", b"v2").unwrap();
            // No clean close path is exercised: drop joins workers but the
            // memtable is never flushed, so reopen must replay the WAL.
        }

        let db = StrataDb::open(test_options(), "db", env).unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"k1").unwrap(), b"v1");
        assert_eq!(db.get(&ReadOptions::default(), b"k2").unwrap(), b"v2");
    }

    #[test]
    fn test_merge_operator_round_trip() {
        let env = MemEnv::new();
        let mut options = test_options();
        options.cf.merge_operator = Some(Arc::new(crate::merge_operator::U64AddOperator {}));
        let db = StrataDb::open(options, "db", env).unwrap();
        let wo = WriteOptions::default();

        db.merge(&wo, b"counter", &1u64.to_le_bytes()).unwrap();
        db.merge(&wo, b"counter", &5u64.to_le_bytes()).unwrap();
        db.merge(&wo, b"counter", &4u64.to_le_bytes()).unwrap();

        let value = db.get(&ReadOptions::default(), b"counter").unwrap();
        assert_eq!(value, 10u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_column_families_are_disjoint() {
        let env = MemEnv::new();
        let db = StrataDb::open(test_options(), "db", env).unwrap();
        let wo = WriteOptions::default();

        let metrics = db
            .create_column_family("metrics", crate::options::ColumnFamilyOptions::default())
            .unwrap();

        db.put(&wo, b"key", b"default-value").unwrap();
        db.put_cf(&wo, &metrics, b"key", b"metrics-value").unwrap();

        assert_eq!(
            db.get(&ReadOptions::default(), b"key").unwrap(),
            b"default-value"
        );
        assert_eq!(
            db.get_cf(&ReadOptions::default(), &metrics, b"key").unwrap(),
            b"metrics-value"
        );

        db.drop_column_family(&metrics).unwrap();
        assert!(db
            .get_cf(&ReadOptions::default(), &metrics, b"key")
            .is_err());
    }

    #[test]
    fn test_flush_and_read_from_table() {
        let env = MemEnv::new();
        let db = StrataDb::open(test_options(), "db", env.clone()).unwrap();
        let wo = WriteOptions::default();

        for i in 0..100 {
            db.put(&wo, format!("key{:04}", i).as_bytes(), b"stored")
                .unwrap();
        }
        db.flush(&FlushOptions { wait: true }).unwrap();

        assert_eq!(db.get_property("stratadb.num-immutable-mem-table").unwrap(), "0");
        // One table file somewhere in the tree (an empty DB may flush below
        // level 0 when nothing overlaps).
        let mut total = 0;
        for level in 0..7 {
            total += db
                .get_property(&format!("stratadb.num-files-at-level{}", level))
                .unwrap()
                .parse::<usize>()
                .unwrap();
        }
        assert_eq!(total, 1);

        assert_eq!(db.get(&ReadOptions::default(), b"key0042").unwrap(), b"stored");
    }

    #[test]
    fn test_identity_is_stable_across_reopen() {
        let env = MemEnv::new();
        let first = {
            let db = StrataDb::open(test_options(), "db", env.clone()).unwrap();
            db.get_db_identity().unwrap()
        };
        let second = {
            let db = StrataDb::open(test_options(), "db", env).unwrap();
            db.get_db_identity().unwrap()
        };
        assert_eq!(first, second);
        assert!(first.starts_with("stratadb-"));
    }

    #[test]
    fn test_destroy_db_removes_files() {
        let env = MemEnv::new();
        {
            let db = StrataDb::open(test_options(), "db", env.clone()).unwrap();
            db.put(&WriteOptions::default(), b"k", b"v").unwrap();
        }
        destroy_db(env.clone(), &Options::default(), "db").unwrap();
        assert!(!env.file_exists(&current_file_name(Path::new("db"))));
        assert!(StrataDb::open(Options::default(), "db", env).is_err());
    }
}
