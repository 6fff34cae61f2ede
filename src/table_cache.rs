use std::{path::PathBuf, sync::Arc};

use crate::{
    cache::{Cache, ShardLruCache},
    env::Env,
    error::Result,
    filenames::table_file_name,
    iterator::DBIterator,
    lookup::GetContext,
    options::{ColumnFamilyOptions, Options, ReadOptions},
    sstable::Table,
    version::FileMetaData,
};

/// Bounded cache of open table readers keyed by file number. Lookups hand
/// out `Arc<Table>` pins; eviction closes the file once the last pin drops.
pub struct TableCache<E: Env> {
    env: E,
    db_name: PathBuf,
    options: Arc<Options>,
    cache: Arc<ShardLruCache<u64, Table<E::RandomAccessFile>>>,
}

impl<E: Env> Clone for TableCache<E> {
    fn clone(&self) -> Self {
        TableCache {
            env: self.env.clone(),
            db_name: self.db_name.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<E: Env> TableCache<E> {
    pub fn new(db_name: PathBuf, options: Arc<Options>, env: E, entries: u64) -> Self {
        TableCache {
            env,
            db_name,
            options,
            cache: Arc::new(ShardLruCache::new(entries)),
        }
    }

    fn table_path(&self, file_number: u64, path_id: u32) -> PathBuf {
        if path_id == 0 || self.options.db_paths.len() < path_id as usize {
            table_file_name(&self.db_name, file_number)
        } else {
            table_file_name(&self.options.db_paths[path_id as usize - 1].path, file_number)
        }
    }

    pub fn find_table(
        &self,
        cf: &ColumnFamilyOptions,
        meta: &FileMetaData,
    ) -> Result<Arc<Table<E::RandomAccessFile>>> {
        if let Some(table) = self.cache.lookup(&meta.number) {
            return Ok(table);
        }

        let path = self.table_path(meta.number, meta.path_id);
        let file = self.env.new_random_access_file(&path)?;
        let table = Table::open(self.options.clone(), cf, file, meta.file_size)?;
        match self.cache.insert(meta.number, table, 1) {
            Some(table) => Ok(table),
            // A zero-capacity cache refuses inserts; reopen uncached.
            None => {
                let file = self.env.new_random_access_file(&path)?;
                Ok(Arc::new(Table::open(
                    self.options.clone(),
                    cf,
                    file,
                    meta.file_size,
                )?))
            }
        }
    }

    /// Point lookup within one table, feeding `ctx`.
    pub fn get(
        &self,
        read_options: &ReadOptions,
        cf: &ColumnFamilyOptions,
        meta: &FileMetaData,
        internal_key: &[u8],
        ctx: &mut GetContext<'_>,
    ) -> Result<()> {
        let table = self.find_table(cf, meta)?;
        Table::internal_get(&table, read_options, internal_key, ctx)
    }

    pub fn iter(
        &self,
        read_options: &ReadOptions,
        cf: &ColumnFamilyOptions,
        meta: &FileMetaData,
    ) -> Result<Box<dyn DBIterator>> {
        let table = self.find_table(cf, meta)?;
        Ok(Box::new(Table::iter(table, read_options.clone())))
    }

    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        cmp::BitwiseComparator,
        env::mem::MemEnv,
        format::InternalKey,
        sstable::format::CompressionType,
        sstable::TableBuilder,
        types::ValueType,
    };

    fn make_table(env: &MemEnv, options: &Arc<Options>, cf: &ColumnFamilyOptions, num: u64) -> FileMetaData {
        let path = table_file_name(Path::new("db"), num);
        let file = env.new_writable_file(&path).unwrap();
        let mut builder = TableBuilder::new(options.clone(), cf, CompressionType::None, file);
        let smallest = InternalKey::new(b"a", 1, ValueType::Value);
        let largest = InternalKey::new(b"b", 2, ValueType::Value);
        builder.add(smallest.encode(), b"va").unwrap();
        builder.add(largest.encode(), b"vb").unwrap();
        let size = builder.finish(true).unwrap();

        FileMetaData {
            number: num,
            file_size: size,
            path_id: 0,
            smallest,
            largest,
            smallest_seq: 1,
            largest_seq: 2,
        }
    }

    #[test]
    fn test_find_get_and_evict() {
        let env = MemEnv::new();
        let mut options = Options::default();
        options.sanitize();
        let options = Arc::new(options);
        let cf = ColumnFamilyOptions::default();

        let cache = TableCache::new(PathBuf::from("db"), options.clone(), env.clone(), 100);
        let meta = make_table(&env, &options, &cf, 5);

        let table = cache.find_table(&cf, &meta).unwrap();
        // Second lookup is served from cache (same Arc).
        let again = cache.find_table(&cf, &meta).unwrap();
        assert!(Arc::ptr_eq(&table, &again));

        let cmp = BitwiseComparator {};
        let target = InternalKey::new(b"a", 10, ValueType::Value);
        let mut ctx = GetContext::new(&cmp, None, b"a");
        cache
            .get(&ReadOptions::default(), &cf, &meta, target.encode(), &mut ctx)
            .unwrap();
        assert_eq!(ctx.finalize().unwrap(), Some(b"va".to_vec()));

        cache.evict(meta.number);
        let reopened = cache.find_table(&cf, &meta).unwrap();
        assert!(!Arc::ptr_eq(&table, &reopened));
    }
}
