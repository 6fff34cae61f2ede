use std::sync::Arc;

use crate::{memtable::MemTable, options::ColumnFamilyOptions};

pub use crate::version_set::DEFAULT_COLUMN_FAMILY_NAME;

/// Opaque handle identifying a column family to the public API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnFamilyHandle {
    pub(crate) id: u32,
    pub(crate) name: String,
}

impl ColumnFamilyHandle {
    pub(crate) fn new(id: u32, name: impl Into<String>) -> Self {
        ColumnFamilyHandle {
            id,
            name: name.into(),
        }
    }

    pub fn default_family() -> Self {
        ColumnFamilyHandle::new(0, DEFAULT_COLUMN_FAMILY_NAME)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Requested family when opening with explicit families.
#[derive(Clone)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub options: ColumnFamilyOptions,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        ColumnFamilyDescriptor {
            name: name.into(),
            options,
        }
    }
}

/// Mutable per-family state owned by the DB: the active memtable and the
/// frozen ones awaiting flush. The file sets live in the VersionSet.
pub(crate) struct ColumnFamilyData {
    pub id: u32,
    pub name: String,
    pub options: Arc<ColumnFamilyOptions>,
    pub mem: Arc<MemTable>,
    /// Oldest first.
    pub imm: Vec<Arc<MemTable>>,
    /// WAL that was live when `mem` was installed; recorded in the edit
    /// when the matching flush completes.
    pub mem_log_number: u64,
    /// Logs holding data for the frozen memtables, oldest first; drives the
    /// post-flush log_number edit.
    pub imm_log_numbers: Vec<u64>,
}

impl ColumnFamilyData {
    pub fn new_memtable(options: &ColumnFamilyOptions) -> MemTable {
        let icmp = crate::cmp::InternalKeyComparator::new(options.comparator.clone());
        MemTable::with_prefix_bloom(
            icmp,
            options.prefix_extractor.clone(),
            options.memtable_prefix_bloom_bits,
            options.memtable_prefix_bloom_probes,
        )
    }
}
