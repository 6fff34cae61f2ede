use std::{mem::forget, sync::Arc};

use crate::{
    env::Env,
    error::Result,
    filenames::table_file_name,
    format::ParsedInternalKey,
    iterator::DBIterator,
    options::{ColumnFamilyOptions, Options},
    rate_limiter::RateLimiter,
    sstable::TableBuilder,
    table_cache::TableCache,
    types::MAX_SEQUENCE_NUMBER,
    version::FileMetaData,
};

/// Runs a closure when dropped; `forget` it to cancel.
pub struct DropRelease<T: Fn()> {
    func: T,
}

impl<T: Fn()> Drop for DropRelease<T> {
    fn drop(&mut self) {
        (self.func)();
    }
}

impl<T: Fn()> DropRelease<T> {
    pub fn new(func: T) -> Self {
        DropRelease { func }
    }
}

/// Builds one table file from a sorted iterator (a memtable flush or a
/// recovery replay). Fills in `meta`; on any failure the partial file is
/// removed. The new table is read back through the cache as a sanity check.
pub fn build_table<E: Env>(
    db_name: &std::path::Path,
    env: E,
    options: &Arc<Options>,
    cf: &Arc<ColumnFamilyOptions>,
    table_cache: &TableCache<E>,
    mut iter: Box<dyn DBIterator>,
    meta: &mut FileMetaData,
    rate_limiter: Option<&RateLimiter>,
) -> Result<()> {
    meta.file_size = 0;
    meta.smallest_seq = MAX_SEQUENCE_NUMBER;
    meta.largest_seq = 0;
    iter.seek_to_first();

    let file_name = table_file_name(db_name, meta.number);
    let cleanup_env = env.clone();
    let cleanup_name = file_name.clone();
    let release_drop = DropRelease::new(move || {
        let _ = cleanup_env.delete_file(&cleanup_name);
    });

    if iter.valid() {
        let file = env.new_writable_file(&file_name)?;
        let mut builder = TableBuilder::new(
            options.clone(),
            cf,
            cf.compression_for_level(0),
            file,
        );

        meta.smallest.decode(iter.key());
        let mut largest = Vec::new();
        while iter.valid() {
            let key = iter.key();
            largest.clear();
            largest.extend_from_slice(key);
            if let Ok(parsed) = ParsedInternalKey::parse(key) {
                meta.smallest_seq = meta.smallest_seq.min(parsed.sequence);
                meta.largest_seq = meta.largest_seq.max(parsed.sequence);
            }
            if let Some(limiter) = rate_limiter {
                limiter.request((key.len() + iter.value().len()) as u64);
            }
            builder.add(key, iter.value())?;
            iter.next();
        }
        meta.largest.decode(&largest);

        meta.file_size = builder.finish(true)?;
        iter.status()?;

        // Verify the file is usable before publishing it.
        let table = table_cache.find_table(cf, meta)?;
        drop(table);
    }

    if meta.file_size > 0 {
        forget(release_drop);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        cmp::{BitwiseComparator, InternalKeyComparator},
        env::mem::MemEnv,
        lookup::GetContext,
        memtable::MemTable,
        options::ReadOptions,
        types::ValueType,
    };
    use std::path::PathBuf;

    #[test]
    fn test_build_table_from_memtable() {
        let env = MemEnv::new();
        env.create_dir(Path::new("db")).unwrap();
        let mut options = Options::default();
        options.sanitize();
        let options = Arc::new(options);
        let cf = Arc::new(crate::options::ColumnFamilyOptions::default());
        let cache = TableCache::new(PathBuf::from("db"), options.clone(), env.clone(), 100);

        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);
        for i in 0..100u64 {
            mem.add(i + 1, ValueType::Value, format!("key{:04}", i), "payload");
        }

        let mut meta = FileMetaData {
            number: 9,
            ..Default::default()
        };
        build_table(
            Path::new("db"),
            env.clone(),
            &options,
            &cf,
            &cache,
            mem.iter(),
            &mut meta,
            None,
        )
        .unwrap();

        assert!(meta.file_size > 0);
        assert_eq!(meta.smallest.user_key(), b"key0000");
        assert_eq!(meta.largest.user_key(), b"key0099");
        assert_eq!(meta.smallest_seq, 1);
        assert_eq!(meta.largest_seq, 100);
        assert!(env.file_exists(&table_file_name(Path::new("db"), 9)));

        let cmp = BitwiseComparator {};
        let lookup = crate::format::LookupKey::new("key0050", 1000);
        let mut ctx = GetContext::new(&cmp, None, lookup.user_key());
        cache
            .get(&ReadOptions::default(), &cf, &meta, lookup.internal_key(), &mut ctx)
            .unwrap();
        assert_eq!(ctx.finalize().unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_empty_iterator_builds_nothing() {
        let env = MemEnv::new();
        let mut options = Options::default();
        options.sanitize();
        let options = Arc::new(options);
        let cf = Arc::new(crate::options::ColumnFamilyOptions::default());
        let cache = TableCache::new(PathBuf::from("db"), options.clone(), env.clone(), 100);

        let icmp = InternalKeyComparator::new(Arc::new(BitwiseComparator {}));
        let mem = MemTable::new(icmp);

        let mut meta = FileMetaData {
            number: 10,
            ..Default::default()
        };
        build_table(
            Path::new("db"),
            env.clone(),
            &options,
            &cf,
            &cache,
            mem.iter(),
            &mut meta,
            None,
        )
        .unwrap();
        assert_eq!(meta.file_size, 0);
        assert!(!env.file_exists(&table_file_name(Path::new("db"), 10)));
    }
}
