use std::{path::PathBuf, sync::Arc};

use crate::{
    cache::{Cache, ShardLruCache},
    cmp::{BitwiseComparator, Comparator, SliceTransform},
    compaction::CompactionFilter,
    filter::FilterPolicy,
    merge_operator::MergeOperator,
    rate_limiter::RateLimiter,
    snapshot::Snapshot,
    sstable::block::Block,
    sstable::format::{ChecksumType, CompressionType},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompactionStyle {
    Level,
    Universal,
    Fifo,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexType {
    BinarySearch,
    HashSearch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessHint {
    None,
    Normal,
    Sequential,
    WillNeed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UniversalStopStyle {
    SimilarSize,
    TotalSize,
}

#[derive(Clone, Copy, Debug)]
pub struct UniversalCompactionOptions {
    /// Runs within this percentage of each other count as similar in size.
    pub size_ratio: u32,
    pub min_merge_width: usize,
    pub max_merge_width: usize,
    /// Total-size over newest-run-size threshold that forces a full merge.
    pub max_size_amplification_percent: u32,
    pub compression_size_percent: i32,
    pub stop_style: UniversalStopStyle,
}

impl Default for UniversalCompactionOptions {
    fn default() -> Self {
        UniversalCompactionOptions {
            size_ratio: 1,
            min_merge_width: 2,
            max_merge_width: usize::MAX,
            max_size_amplification_percent: 200,
            compression_size_percent: -1,
            stop_style: UniversalStopStyle::TotalSize,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FifoCompactionOptions {
    pub max_table_files_size: u64,
}

impl Default for FifoCompactionOptions {
    fn default() -> Self {
        FifoCompactionOptions {
            max_table_files_size: 1 << 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DbPath {
    pub path: PathBuf,
    pub target_size: u64,
}

/// Per-family tuning: anything that can differ between column families.
#[derive(Clone)]
pub struct ColumnFamilyOptions {
    pub comparator: Arc<dyn Comparator>,
    pub merge_operator: Option<Arc<dyn MergeOperator>>,
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    pub prefix_extractor: Option<Arc<dyn SliceTransform>>,
    pub whole_key_filtering: bool,

    pub write_buffer_size: usize,
    pub max_write_buffer_number: usize,
    pub min_write_buffer_number_to_merge: usize,

    pub compression: CompressionType,
    /// When non-empty, indexed by output level (last entry reused beyond).
    pub compression_per_level: Vec<CompressionType>,

    pub max_successive_merges: usize,
    pub min_partial_merge_operands: usize,

    pub memtable_prefix_bloom_bits: u32,
    pub memtable_prefix_bloom_probes: u32,
    pub bloom_locality: u32,

    pub inplace_update_support: bool,
    pub inplace_update_num_locks: usize,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        ColumnFamilyOptions {
            comparator: Arc::new(BitwiseComparator {}),
            merge_operator: None,
            compaction_filter: None,
            filter_policy: None,
            prefix_extractor: None,
            whole_key_filtering: true,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            min_write_buffer_number_to_merge: 1,
            compression: CompressionType::Snappy,
            compression_per_level: Vec::new(),
            max_successive_merges: 0,
            min_partial_merge_operands: 2,
            memtable_prefix_bloom_bits: 0,
            memtable_prefix_bloom_probes: 6,
            bloom_locality: 0,
            inplace_update_support: false,
            inplace_update_num_locks: 10000,
        }
    }
}

impl ColumnFamilyOptions {
    /// Codec for one output level, honoring `compression_per_level`.
    pub fn compression_for_level(&self, level: usize) -> CompressionType {
        if self.compression_per_level.is_empty() {
            return self.compression;
        }
        let idx = level.min(self.compression_per_level.len() - 1);
        self.compression_per_level[idx]
    }
}

#[derive(Clone)]
pub struct Options {
    // open-time existence policy
    pub create_if_missing: bool,
    pub create_missing_column_families: bool,
    pub error_if_exists: bool,
    /// Strict WAL replay; first internal error poisons the DB for writes.
    pub paranoid_checks: bool,

    // table format
    pub block_size: usize,
    pub block_restart_interval: u32,
    /// Percentage slack below block_size at which a block is closed early.
    pub block_size_deviation: usize,
    pub checksum_type: ChecksumType,
    pub no_block_cache: bool,
    pub block_cache: Option<Arc<dyn Cache<Vec<u8>, Block>>>,
    pub block_cache_compressed: Option<Arc<dyn Cache<Vec<u8>, Vec<u8>>>>,
    pub cache_index_and_filter_blocks: bool,
    pub index_type: IndexType,

    // LSM shape
    pub num_levels: usize,
    pub level0_file_num_compaction_trigger: usize,
    pub level0_slowdown_writes_trigger: usize,
    pub level0_stop_writes_trigger: usize,
    pub max_mem_compaction_level: usize,
    pub target_file_size_base: u64,
    pub target_file_size_multiplier: u32,
    pub max_bytes_for_level_base: u64,
    pub max_bytes_for_level_multiplier: u32,
    pub max_bytes_for_level_multiplier_additional: Vec<u32>,
    pub expanded_compaction_factor: u32,
    pub source_compaction_factor: u32,
    pub max_grandparent_overlap_factor: u32,
    pub compaction_style: CompactionStyle,
    pub compaction_options_universal: UniversalCompactionOptions,
    pub compaction_options_fifo: FifoCompactionOptions,

    // throttles
    pub soft_rate_limit: f64,
    pub hard_rate_limit: f64,
    pub rate_limit_delay_max_milliseconds: u64,
    pub rate_limiter: Option<Arc<RateLimiter>>,

    // files and I/O
    pub max_open_files: u64,
    pub max_total_wal_size: u64,
    pub max_manifest_file_size: u64,
    pub disable_data_sync: bool,
    pub use_fsync: bool,
    pub allow_os_buffer: bool,
    pub allow_mmap_reads: bool,
    pub allow_mmap_writes: bool,
    pub advise_random_on_open: bool,
    pub bytes_per_sync: u64,
    pub access_hint_on_compaction_start: AccessHint,

    // background work
    pub max_background_compactions: usize,
    pub max_background_flushes: usize,

    // placement
    pub db_paths: Vec<DbPath>,
    pub wal_dir: Option<PathBuf>,
    pub wal_ttl_seconds: u64,
    pub wal_size_limit_mb: u64,

    /// Defaults for the default column family and any family created
    /// without explicit options.
    pub cf: ColumnFamilyOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            create_if_missing: false,
            create_missing_column_families: false,
            error_if_exists: false,
            paranoid_checks: false,

            block_size: 4 * 1024,
            block_restart_interval: 16,
            block_size_deviation: 10,
            checksum_type: ChecksumType::Crc32c,
            no_block_cache: false,
            block_cache: None,
            block_cache_compressed: None,
            cache_index_and_filter_blocks: false,
            index_type: IndexType::BinarySearch,

            num_levels: 7,
            level0_file_num_compaction_trigger: 4,
            level0_slowdown_writes_trigger: 8,
            level0_stop_writes_trigger: 12,
            max_mem_compaction_level: 2,
            target_file_size_base: 2 * 1024 * 1024,
            target_file_size_multiplier: 1,
            max_bytes_for_level_base: 10 * 1024 * 1024,
            max_bytes_for_level_multiplier: 10,
            max_bytes_for_level_multiplier_additional: Vec::new(),
            expanded_compaction_factor: 25,
            source_compaction_factor: 1,
            max_grandparent_overlap_factor: 10,
            compaction_style: CompactionStyle::Level,
            compaction_options_universal: UniversalCompactionOptions::default(),
            compaction_options_fifo: FifoCompactionOptions::default(),

            soft_rate_limit: 0.0,
            hard_rate_limit: 0.0,
            rate_limit_delay_max_milliseconds: 1000,
            rate_limiter: None,

            max_open_files: 1000,
            max_total_wal_size: 0,
            max_manifest_file_size: 1 << 30,
            disable_data_sync: false,
            use_fsync: false,
            allow_os_buffer: true,
            allow_mmap_reads: false,
            allow_mmap_writes: false,
            advise_random_on_open: true,
            bytes_per_sync: 0,
            access_hint_on_compaction_start: AccessHint::Normal,

            max_background_compactions: 1,
            max_background_flushes: 1,

            db_paths: Vec::new(),
            wal_dir: None,
            wal_ttl_seconds: 0,
            wal_size_limit_mb: 0,

            cf: ColumnFamilyOptions::default(),
        }
    }
}

impl Options {
    /// Fills in derived values and clamps inconsistent settings; called once
    /// at open.
    pub fn sanitize(&mut self) {
        if self.num_levels < 2 {
            self.num_levels = 2;
        }
        if self.level0_stop_writes_trigger < self.level0_slowdown_writes_trigger {
            self.level0_stop_writes_trigger = self.level0_slowdown_writes_trigger;
        }
        if self.level0_slowdown_writes_trigger < self.level0_file_num_compaction_trigger {
            self.level0_slowdown_writes_trigger = self.level0_file_num_compaction_trigger;
        }
        if self.max_mem_compaction_level >= self.num_levels {
            self.max_mem_compaction_level = self.num_levels - 1;
        }
        if self.cf.max_write_buffer_number < 2 {
            self.cf.max_write_buffer_number = 2;
        }
        // A merge threshold past the freeze limit would stall writers with
        // no flush ever becoming eligible.
        if self.cf.min_write_buffer_number_to_merge >= self.cf.max_write_buffer_number {
            self.cf.min_write_buffer_number_to_merge = self.cf.max_write_buffer_number - 1;
        }
        if self.cf.min_write_buffer_number_to_merge == 0 {
            self.cf.min_write_buffer_number_to_merge = 1;
        }
        if self.block_cache.is_none() && !self.no_block_cache {
            self.block_cache = Some(Arc::new(ShardLruCache::new(8 * 1024 * 1024)));
        }
        if self.no_block_cache {
            self.block_cache = None;
        }
        if self.max_open_files < 20 {
            self.max_open_files = 20;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadTier {
    /// Data from memtables, block cache, and disk.
    All,
    /// Only what is already in memory; disk reads yield Incomplete.
    BlockCacheOnly,
}

#[derive(Clone, Default)]
pub struct ReadOptions {
    pub verify_checksums: bool,
    pub fill_cache: bool,
    pub snapshot: Option<Arc<Snapshot>>,
    pub read_tier: Option<ReadTier>,
    pub tailing: bool,
    pub total_order_seek: bool,
}

impl ReadOptions {
    pub fn reads_allowed(&self) -> bool {
        !matches!(self.read_tier, Some(ReadTier::BlockCacheOnly))
    }
}

#[derive(Clone, Default)]
pub struct WriteOptions {
    pub sync: bool,
    pub disable_wal: bool,
    /// Fail the write with TimedOut if it has not been picked as a group
    /// leader within this many microseconds.
    pub timeout_hint_us: Option<u64>,
    pub ignore_missing_column_families: bool,
}

#[derive(Clone)]
pub struct FlushOptions {
    pub wait: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        FlushOptions { wait: true }
    }
}
