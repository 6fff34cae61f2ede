use std::{path::Path, sync::Arc};

use log::{info, warn};

use crate::{
    builder::build_table,
    cmp::InternalKeyComparator,
    env::Env,
    error::Result,
    filenames::{
        descriptor_file_name, lock_file_name, parse_file_name, set_current_file, table_file_name,
        FileType,
    },
    format::ParsedInternalKey,
    iterator::DBIterator,
    log::{LogReader, LogWriter},
    memtable::MemTable,
    options::Options,
    sstable::Table,
    table_cache::TableCache,
    types::SequenceNumber,
    version::FileMetaData,
    version_edit::VersionEdit,
    write_batch::{MemTableTarget, WriteBatch},
};

/// Best-effort salvage: every readable table is re-listed at level 0 and
/// every log is converted into a fresh level-0 table, then a new manifest
/// describing exactly that set replaces the old one. Compaction sorts the
/// result out after the next open.
pub fn repair_db<E: Env>(env: E, mut options: Options, path: impl AsRef<Path>) -> Result<()> {
    options.sanitize();
    options.create_if_missing = true;
    options.error_if_exists = false;
    let options = Arc::new(options);
    let db_name = path.as_ref().to_path_buf();

    let lock = env.lock_file(&lock_file_name(&db_name))?;

    let mut children = Vec::new();
    env.get_children(&db_name, &mut children)?;

    let mut tables = Vec::new();
    let mut logs = Vec::new();
    let mut manifests = Vec::new();
    let mut max_number = 1;
    for name in children.iter() {
        if let Ok((number, file_type)) = parse_file_name(name) {
            max_number = max_number.max(number);
            match file_type {
                FileType::Table => tables.push(number),
                FileType::Log => logs.push(number),
                FileType::Descriptor => manifests.push(name.clone()),
                _ => {}
            }
        }
    }
    logs.sort_unstable();

    let table_cache = TableCache::new(db_name.clone(), options.clone(), env.clone(), 100);
    let cf = Arc::new(options.cf.clone());
    let icmp = InternalKeyComparator::new(cf.comparator.clone());

    let mut metas: Vec<FileMetaData> = Vec::new();
    let mut max_sequence: SequenceNumber = 0;

    // Scan every table to recover its key range and sequence bounds.
    for number in tables {
        match scan_table(&env, &options, &cf, &db_name, number) {
            Ok(Some(meta)) => {
                max_sequence = max_sequence.max(meta.largest_seq);
                metas.push(meta);
            }
            Ok(None) => {
                warn!("repair: table {:06} is empty, dropping", number);
                let _ = env.delete_file(&table_file_name(&db_name, number));
            }
            Err(e) => {
                warn!("repair: table {:06} unreadable ({}), dropping", number, e);
                let _ = env.delete_file(&table_file_name(&db_name, number));
            }
        }
    }

    // Convert logs into tables.
    let mut next_number = max_number + 1;
    for number in logs {
        match convert_log(
            &env,
            &options,
            &cf,
            &icmp,
            &table_cache,
            &db_name,
            number,
            next_number,
        ) {
            Ok(Some(meta)) => {
                max_sequence = max_sequence.max(meta.largest_seq);
                next_number += 1;
                metas.push(meta);
            }
            Ok(None) => {}
            Err(e) => warn!("repair: log {:06} skipped ({})", number, e),
        }
        let _ = env.delete_file(&crate::filenames::log_file_name(&db_name, number));
    }

    // Fresh manifest listing everything at level 0.
    let manifest_number = next_number;
    let mut edit = VersionEdit::new();
    edit.set_comparator(cf.comparator.name());
    edit.set_log_number(0);
    edit.set_next_file_number(manifest_number + 1);
    edit.set_last_sequence(max_sequence);
    for meta in metas.iter() {
        edit.add_file(0, meta.clone());
    }

    let manifest_path = descriptor_file_name(&db_name, manifest_number);
    let file = env.new_writable_file(&manifest_path)?;
    let mut writer = LogWriter::new(file);
    let mut record = Vec::new();
    edit.encode(&mut record);
    writer.add_record(&record)?;
    writer.sync()?;
    set_current_file(env.clone(), &db_name, manifest_number)?;

    for name in manifests {
        let _ = env.delete_file(&db_name.join(name));
    }

    info!(
        "repair: recovered {} table(s), last sequence {}",
        metas.len(),
        max_sequence
    );
    env.unlock_file(lock)?;
    Ok(())
}

fn scan_table<E: Env>(
    env: &E,
    options: &Arc<Options>,
    cf: &Arc<crate::options::ColumnFamilyOptions>,
    db_name: &Path,
    number: u64,
) -> Result<Option<FileMetaData>> {
    let path = table_file_name(db_name, number);
    let size = env.file_size(&path)?;
    let file = env.new_random_access_file(&path)?;
    let table = Arc::new(Table::open(options.clone(), cf, file, size)?);

    let mut iter = Table::iter(table, crate::options::ReadOptions::default());
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let mut meta = FileMetaData {
        number,
        file_size: size,
        smallest_seq: crate::types::MAX_SEQUENCE_NUMBER,
        ..Default::default()
    };
    meta.smallest.decode(iter.key());
    let mut largest = Vec::new();
    while iter.valid() {
        largest.clear();
        largest.extend_from_slice(iter.key());
        if let Ok(parsed) = ParsedInternalKey::parse(iter.key()) {
            meta.smallest_seq = meta.smallest_seq.min(parsed.sequence);
            meta.largest_seq = meta.largest_seq.max(parsed.sequence);
        }
        iter.next();
    }
    iter.status()?;
    meta.largest.decode(&largest);
    Ok(Some(meta))
}

#[allow(clippy::too_many_arguments)]
fn convert_log<E: Env>(
    env: &E,
    options: &Arc<Options>,
    cf: &Arc<crate::options::ColumnFamilyOptions>,
    icmp: &InternalKeyComparator,
    table_cache: &TableCache<E>,
    db_name: &Path,
    log_number: u64,
    table_number: u64,
) -> Result<Option<FileMetaData>> {
    let path = crate::filenames::log_file_name(db_name, log_number);
    let file = env.new_sequential_file(&path)?;
    let mut reader = LogReader::new(file, true);

    let mem = Arc::new(MemTable::new(icmp.clone()));
    let mut record = Vec::new();
    let mut applied = 0usize;
    while let Ok(Some(_)) = reader.read_record(&mut record) {
        if record.len() < 12 {
            continue;
        }
        let mut batch = WriteBatch::new();
        batch.set_content(std::mem::take(&mut record));
        record = Vec::new();
        // All families funnel into one salvage table.
        let mem_for_batch = mem.clone();
        let cf_for_batch = cf.clone();
        if batch
            .insert_into(
                move |_| {
                    Some(MemTableTarget {
                        mem: mem_for_batch.clone(),
                        merge_operator: cf_for_batch.merge_operator.clone(),
                        max_successive_merges: 0,
                    })
                },
                true,
            )
            .is_ok()
        {
            applied += batch.count() as usize;
        }
    }

    if applied == 0 || mem.is_empty() {
        return Ok(None);
    }

    let mut meta = FileMetaData {
        number: table_number,
        ..Default::default()
    };
    let iter: Box<dyn DBIterator> = mem.iter();
    build_table(
        db_name, env.clone(), options, cf, table_cache, iter, &mut meta, None,
    )?;
    if meta.file_size == 0 {
        return Ok(None);
    }
    Ok(Some(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_impl::StrataDb;
    use crate::env::mem::MemEnv;
    use crate::filenames::current_file_name;
    use crate::options::{ReadOptions, WriteOptions};

    #[test]
    fn test_repair_rebuilds_manifest() {
        let env = MemEnv::new();
        let options = Options {
            create_if_missing: true,
            ..Default::default()
        };

        {
            let db = StrataDb::open(options.clone(), "db", env.clone()).unwrap();
            let wo = WriteOptions::default();
            db.put(&wo, b"alpha", b"1").unwrap();
            db.put(&wo, b"beta", b"2").unwrap();
            db.flush(&crate::options::FlushOptions { wait: true }).unwrap();
            db.put(&wo, b"gamma", b"3").unwrap();
        }

        // Lose the manifest pointer entirely.
        env.delete_file(&current_file_name(Path::new("db"))).unwrap();

        repair_db(env.clone(), options.clone(), "db").unwrap();

        let db = StrataDb::open(options, "db", env).unwrap();
        assert_eq!(db.get(&ReadOptions::default(), b"alpha").unwrap(), b"1");
        assert_eq!(db.get(&ReadOptions::default(), b"beta").unwrap(), b"2");
        assert_eq!(db.get(&ReadOptions::default(), b"gamma").unwrap(), b"3");
    }
}
