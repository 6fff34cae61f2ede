//! A persistent, ordered key/value storage engine built on the
//! log-structured merge-tree model: writes land in a write-ahead log and an
//! in-memory table, immutable sorted tables hold the bulk of the data across
//! levels, and background compaction keeps reads and space amplification
//! bounded.
//!
//! The convenient surface is re-exported at the crate root; the modules stay
//! public for embedders that need the individual building blocks (tables,
//! blocks, the WAL codec, caches).

pub mod builder;
pub mod cache;
pub mod cmp;
pub mod codec;
pub mod column_family;
pub mod compaction;
pub mod db_impl;
pub mod db_iter;
pub mod env;
pub mod error;
pub mod filenames;
pub mod filter;
pub mod format;
pub mod iterator;
pub mod log;
pub mod lookup;
pub mod memtable;
pub mod merge;
pub mod merge_operator;
pub mod options;
pub mod rate_limiter;
pub mod repair;
pub mod skiplist;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
pub mod transaction_log;
pub mod types;
pub mod version;
pub mod version_edit;
pub mod version_set;
pub mod write_batch;

pub use cmp::{BitwiseComparator, Comparator, FixedPrefixTransform, SliceTransform};
pub use column_family::{
    ColumnFamilyDescriptor, ColumnFamilyHandle, DEFAULT_COLUMN_FAMILY_NAME,
};
pub use compaction::{CompactionFilter, CompactionFilterFactory, FilterDecision};
pub use db_impl::{destroy_db, StrataDb};
pub use db_iter::DBIter;
pub use env::{mem::MemEnv, posix::PosixEnv, Env};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use format::LookupKey;
pub use iterator::DBIterator;
pub use log::{LogReader, LogWriter};
pub use memtable::MemTable;
pub use merge_operator::{MergeOperator, StringAppendOperator, U64AddOperator};
pub use options::{
    AccessHint, ColumnFamilyOptions, CompactionStyle, FifoCompactionOptions, FlushOptions,
    IndexType, Options, ReadOptions, ReadTier, UniversalCompactionOptions, WriteOptions,
};
pub use rate_limiter::RateLimiter;
pub use repair::repair_db;
pub use snapshot::Snapshot;
pub use sstable::format::{ChecksumType, CompressionType};
pub use transaction_log::{BatchResult, TransactionLogIterator, WalFile, WalFileType};
pub use types::{SequenceNumber, ValueType};
pub use write_batch::WriteBatch;
