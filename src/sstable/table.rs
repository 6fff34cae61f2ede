use std::{cmp::Ordering, io::Write, sync::Arc};

use byteorder::{BigEndian, WriteBytesExt};
use snap::write::FrameEncoder;

use crate::{
    cmp::{Comparator, InternalKeyComparator},
    env::{RandomAccessFile, WritableFile},
    error::{Error, Result},
    filter::{FilterPolicy, InternalFilterPolicy},
    format::extract_user_key,
    iterator::DBIterator,
    lookup::GetContext,
    options::{ColumnFamilyOptions, Options, ReadOptions, ReadTier},
    types::ValueType,
};

use super::{
    block::{Block, BlockIter},
    block_builder::BlockBuilder,
    filter_block::{FilterBlockBuilder, FilterBlockReader},
    format::{
        BlockContent, BlockHandle, ChecksumType, CompressionType, Footer, BLOCK_TRAILER_SIZE,
        FOOTER_LENGTH, LEGACY_FOOTER_LENGTH,
    },
    two_level_iterator::{BlockIterBuilder, TwoLevelIterator},
};

/// Immutable sorted table reader. Owns the open file; shared via the table
/// cache as `Arc<Table>` so evictions never invalidate live iterators.
pub struct Table<R: RandomAccessFile> {
    file: R,
    options: Arc<Options>,
    comparator: Arc<dyn Comparator>,
    footer: Footer,
    index_block: Block,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    filter_data: Option<BlockContent>,
    cache_id: u64,
}

impl<R: RandomAccessFile> Table<R> {
    pub fn open(
        options: Arc<Options>,
        cf: &ColumnFamilyOptions,
        file: R,
        size: u64,
    ) -> Result<Self> {
        if (size as usize) < LEGACY_FOOTER_LENGTH {
            return Err(Error::Corruption("file is too short to be a table".into()));
        }

        let footer_len = FOOTER_LENGTH.min(size as usize);
        let mut scratch = vec![0u8; footer_len];
        file.read_exact_at(&mut scratch, size - footer_len as u64)?;
        let footer = Footer::decode_from_end(&scratch)?;

        let index_content = BlockContent::read_block_from_file(
            &file,
            &footer.index_handle,
            true,
            footer.checksum,
        )?;
        let index_block = Block::from_raw(index_content)?;

        let filter_policy: Option<Arc<dyn FilterPolicy>> = cf
            .filter_policy
            .clone()
            .map(|p| Arc::new(InternalFilterPolicy::new(p)) as Arc<dyn FilterPolicy>);

        // A missing or unreadable filter only costs lookups, never
        // correctness.
        let filter_data = match &filter_policy {
            Some(policy) => {
                Self::read_filter(&file, &footer, policy.as_ref()).unwrap_or(None)
            }
            None => None,
        };

        let cache_id = options
            .block_cache
            .as_ref()
            .map(|c| c.new_id())
            .unwrap_or(0);

        let icmp = InternalKeyComparator::new(cf.comparator.clone());
        Ok(Table {
            file,
            options,
            comparator: Arc::new(icmp),
            footer,
            index_block,
            filter_policy,
            filter_data,
            cache_id,
        })
    }

    fn read_filter(
        file: &R,
        footer: &Footer,
        policy: &dyn FilterPolicy,
    ) -> Result<Option<BlockContent>> {
        if footer.meta_index_handle.size() == 0 {
            return Ok(None);
        }
        let meta_content = BlockContent::read_block_from_file(
            file,
            &footer.meta_index_handle,
            true,
            footer.checksum,
        )?;
        let meta_block = Block::from_raw(meta_content)?;
        let comparator = crate::cmp::BitwiseComparator {};
        let mut iter = meta_block.iter(Arc::new(comparator));

        let mut key = Vec::from("filter.");
        key.extend_from_slice(policy.name().as_bytes());
        iter.seek(&key);
        if iter.valid() && comparator.compare(&key, iter.key()) == Ordering::Equal {
            let handle = BlockHandle::from_raw(iter.value())?;
            let content =
                BlockContent::read_block_from_file(file, &handle, true, footer.checksum)?;
            return Ok(Some(content));
        }
        Ok(None)
    }

    fn cache_key(&self, offset: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        key.write_u64::<BigEndian>(self.cache_id).unwrap();
        key.write_u64::<BigEndian>(offset).unwrap();
        key
    }

    /// Loads (or fetches from the block cache) the data block at `handle`.
    fn read_data_block(&self, options: &ReadOptions, handle: &BlockHandle) -> Result<Arc<Block>> {
        if let Some(cache) = &self.options.block_cache {
            let key = self.cache_key(handle.offset());
            if let Some(block) = cache.lookup(&key) {
                return Ok(block);
            }
            if matches!(options.read_tier, Some(ReadTier::BlockCacheOnly)) {
                return Err(Error::Incomplete(
                    "block not cached and read tier forbids I/O".into(),
                ));
            }
            let content = BlockContent::read_block_from_file(
                &self.file,
                handle,
                options.verify_checksums,
                self.footer.checksum,
            )?;
            let block = Block::from_raw(content)?;
            if options.fill_cache {
                let charge = block.size() as u64;
                if let Some(cached) = cache.insert(key, block, charge) {
                    return Ok(cached);
                }
                // A zero-capacity cache refuses inserts; serve uncached.
                let content = BlockContent::read_block_from_file(
                    &self.file,
                    handle,
                    options.verify_checksums,
                    self.footer.checksum,
                )?;
                return Ok(Arc::new(Block::from_raw(content)?));
            }
            return Ok(Arc::new(block));
        }

        if matches!(options.read_tier, Some(ReadTier::BlockCacheOnly)) {
            return Err(Error::Incomplete(
                "no block cache configured for cache-only read".into(),
            ));
        }
        let content = BlockContent::read_block_from_file(
            &self.file,
            handle,
            options.verify_checksums,
            self.footer.checksum,
        )?;
        Ok(Arc::new(Block::from_raw(content)?))
    }

    fn block_iter_from_index(
        &self,
        options: &ReadOptions,
        index_value: &[u8],
    ) -> Result<BlockIter> {
        let handle = BlockHandle::from_raw(index_value)?;
        let block = self.read_data_block(options, &handle)?;
        Ok(block.iter(self.comparator.clone()))
    }

    pub fn iter(
        table: Arc<Table<R>>,
        options: ReadOptions,
    ) -> TwoLevelIterator<BlockIter, TableBlockIterBuilder<R>> {
        let index_iter = table.index_block.iter(table.comparator.clone());
        TwoLevelIterator::new(index_iter, TableBlockIterBuilder { table }, options)
    }

    /// Feeds all versions of the lookup key in this table into `ctx`,
    /// consulting the filter first.
    pub fn internal_get(
        table: &Arc<Table<R>>,
        options: &ReadOptions,
        internal_key: &[u8],
        ctx: &mut GetContext<'_>,
    ) -> Result<()> {
        let mut index_iter = table.index_block.iter(table.comparator.clone());
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            return index_iter.status();
        }

        if let (Some(policy), Some(filter_data)) = (&table.filter_policy, &table.filter_data) {
            let handle = BlockHandle::from_raw(index_iter.value())?;
            let reader = FilterBlockReader::new(policy.clone(), filter_data);
            if !reader.key_may_match(handle.offset() as usize, internal_key) {
                return Ok(());
            }
        }

        let mut iter = Table::iter(table.clone(), options.clone());
        iter.seek(internal_key);
        while iter.valid() {
            let key = iter.key();
            let user_key = extract_user_key(key);
            if !ctx.matches(user_key) {
                break;
            }
            let tag = crate::format::extract_tag(key);
            let t = ValueType::try_from((tag & 0xff) as u8)?;
            if ctx.sees(t, iter.value()) {
                break;
            }
            iter.next();
        }
        iter.status()
    }

    /// Byte offset within the file where the key's data would live; used by
    /// approximate-size queries.
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.comparator.clone());
        index_iter.seek(internal_key);
        if index_iter.valid() {
            if let Ok(handle) = BlockHandle::from_raw(index_iter.value()) {
                return handle.offset();
            }
        }
        // Past the last key: everything before the metaindex.
        self.footer.meta_index_handle.offset()
    }
}

pub struct TableBlockIterBuilder<R: RandomAccessFile> {
    table: Arc<Table<R>>,
}

impl<R: RandomAccessFile> BlockIterBuilder for TableBlockIterBuilder<R> {
    type Iter = BlockIter;

    fn build(&self, options: &ReadOptions, index_value: &[u8]) -> Result<Self::Iter> {
        self.table.block_iter_from_index(options, index_value)
    }
}

/// Streams strictly increasing internal keys into data blocks, emitting an
/// index entry per block and optionally a filter block.
pub struct TableBuilder<W: WritableFile> {
    options: Arc<Options>,
    comparator: Arc<dyn Comparator>,
    compression: CompressionType,
    file: W,

    offset: u64,
    data_block: Option<BlockBuilder>,
    index_block: Option<BlockBuilder>,

    last_key: Vec<u8>,
    num_entries: u64,

    filter_block: Option<FilterBlockBuilder>,
    filter_policy_name: Option<&'static str>,

    pending_index_entry: bool,
    pending_handle: BlockHandle,
    compress_out: Vec<u8>,
}

impl<W: WritableFile> TableBuilder<W> {
    pub fn new(
        options: Arc<Options>,
        cf: &ColumnFamilyOptions,
        compression: CompressionType,
        file: W,
    ) -> Self {
        let icmp = InternalKeyComparator::new(cf.comparator.clone());
        let comparator: Arc<dyn Comparator> = Arc::new(icmp);
        let data_block = BlockBuilder::new(comparator.clone(), options.block_restart_interval);
        let index_block = BlockBuilder::new(comparator.clone(), 1);
        let filter_policy_name = cf.filter_policy.as_ref().map(|p| p.name());
        let filter_block = cf.filter_policy.clone().map(|policy| {
            let internal: Arc<dyn FilterPolicy> = Arc::new(InternalFilterPolicy::new(policy));
            let mut builder = FilterBlockBuilder::with_prefix_extractor(
                internal,
                cf.prefix_extractor.clone(),
                cf.whole_key_filtering,
            );
            builder.start_block(0);
            builder
        });

        TableBuilder {
            options,
            comparator,
            compression,
            file,
            offset: 0,
            data_block: Some(data_block),
            index_block: Some(index_block),
            last_key: Vec::new(),
            num_entries: 0,
            filter_block,
            filter_policy_name,
            pending_index_entry: false,
            pending_handle: Default::default(),
            compress_out: Vec::new(),
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size_estimate(&self) -> u64 {
        self.offset
            + self
                .data_block
                .as_ref()
                .map(|b| b.current_size_estimate() as u64)
                .unwrap_or(0)
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(self.data_block.is_some());
        assert!(self.index_block.is_some());

        if self.num_entries > 0 {
            assert_eq!(
                self.comparator.compare(key, &self.last_key),
                Ordering::Greater,
                "keys added out of order"
            );
        }

        if self.pending_index_entry {
            assert!(self.data_block.as_ref().unwrap().is_empty());
            self.comparator.find_shortest_separator(&mut self.last_key, key);
            let handle_encoding = self.pending_handle.encoded();
            self.index_block
                .as_mut()
                .unwrap()
                .add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(ref mut filter) = self.filter_block {
            filter.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        let data_block = self.data_block.as_mut().unwrap();
        data_block.add(key, value);

        if data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        assert!(self.data_block.is_some());

        let data_block = self
            .data_block
            .replace(BlockBuilder::new(
                self.comparator.clone(),
                self.options.block_restart_interval,
            ))
            .unwrap();
        if data_block.is_empty() {
            return Ok(());
        }
        assert!(!self.pending_index_entry);

        self.offset = write_block(
            &mut self.file,
            data_block,
            &mut self.pending_handle,
            self.compression,
            self.options.checksum_type,
            &mut self.compress_out,
            self.offset,
        )?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(b) = self.filter_block.as_mut() {
            b.start_block(self.offset as usize)
        }

        Ok(())
    }

    pub fn finish(mut self, sync: bool) -> Result<u64> {
        self.flush()?;

        let mut meta_index_block = BlockBuilder::new(
            Arc::new(crate::cmp::BitwiseComparator {}),
            self.options.block_restart_interval,
        );
        let mut meta_index_block_handle = BlockHandle::default();
        if let Some(filter_builder) = self.filter_block.take() {
            let mut filter_name = Vec::from("filter.");
            filter_name.extend_from_slice(self.filter_policy_name.unwrap().as_bytes());
            let block_content = filter_builder.finish();
            let mut filter_block_handle = BlockHandle::default();
            self.offset = write_raw_block(
                &mut self.file,
                &block_content,
                CompressionType::None,
                self.options.checksum_type,
                &mut filter_block_handle,
                self.offset,
            )?;
            meta_index_block.add(&filter_name, &filter_block_handle.encoded());
        }

        self.offset = write_block(
            &mut self.file,
            meta_index_block,
            &mut meta_index_block_handle,
            self.compression,
            self.options.checksum_type,
            &mut self.compress_out,
            self.offset,
        )?;

        let mut index_block_handle = BlockHandle::default();
        let mut index_block = self.index_block.take().unwrap();
        if self.pending_index_entry {
            self.comparator.find_shortest_successor(&mut self.last_key);
            index_block.add(&self.last_key, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        self.offset = write_block(
            &mut self.file,
            index_block,
            &mut index_block_handle,
            self.compression,
            self.options.checksum_type,
            &mut self.compress_out,
            self.offset,
        )?;

        let footer = Footer::new(
            self.options.checksum_type,
            meta_index_block_handle,
            index_block_handle,
        );
        let mut buf = vec![0; FOOTER_LENGTH];
        footer.encode(&mut buf);

        self.file.append(&buf)?;
        self.offset += buf.len() as u64;

        if sync {
            self.file.sync()?;
        }

        Ok(self.offset)
    }

    /// Discards the partial table; the caller removes the file.
    pub fn abandon(self) {}
}

fn write_block<W: WritableFile>(
    file: &mut W,
    block: BlockBuilder,
    handle: &mut BlockHandle,
    compression: CompressionType,
    checksum: ChecksumType,
    compress_out: &mut Vec<u8>,
    offset: u64,
) -> Result<u64> {
    let raw = block.finish();
    let (tag, contents): (CompressionType, &[u8]) = match compression {
        CompressionType::Snappy => {
            compress_out.clear();
            {
                let mut encoder = FrameEncoder::new(&mut *compress_out);
                encoder.write_all(&raw)?;
            }
            // Keep the compressed form only when it saves at least 12.5%.
            if compress_out.len() < raw.len() - (raw.len() / 8) {
                (CompressionType::Snappy, compress_out.as_slice())
            } else {
                (CompressionType::None, raw.as_slice())
            }
        }
        // Codecs that are not linked in degrade to stored blocks.
        _ => (CompressionType::None, raw.as_slice()),
    };

    write_raw_block(file, contents, tag, checksum, handle, offset)
}

fn write_raw_block<W: WritableFile>(
    file: &mut W,
    contents: &[u8],
    compression: CompressionType,
    checksum: ChecksumType,
    handle: &mut BlockHandle,
    offset: u64,
) -> Result<u64> {
    handle.set_offset(offset);
    handle.set_size(contents.len() as u64);

    let crc = checksum.checksum(contents, compression.as_byte());

    let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
    trailer[0] = compression.as_byte();
    trailer[1..].copy_from_slice(&crc.to_le_bytes());

    file.append(contents)?;
    file.append(&trailer)?;

    Ok(offset + contents.len() as u64 + BLOCK_TRAILER_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        cmp::BitwiseComparator,
        env::{mem::MemEnv, Env},
        filter::BloomFilterPolicy,
        format::InternalKey,
        types::ValueType,
    };

    fn test_options(filter: bool) -> (Arc<Options>, ColumnFamilyOptions) {
        let mut options = Options {
            block_size: 1024,
            block_restart_interval: 3,
            ..Default::default()
        };
        options.sanitize();
        let mut cf = ColumnFamilyOptions::default();
        if filter {
            cf.filter_policy = Some(Arc::new(BloomFilterPolicy::new(10)));
        }
        (Arc::new(options), cf)
    }

    fn build_dataset(n: usize) -> Vec<(InternalKey, String)> {
        (0..n)
            .map(|i| {
                (
                    InternalKey::new(format!("user-key-{:06}", i).as_bytes(), 1, ValueType::Value),
                    format!("value:{:06}", i),
                )
            })
            .collect()
    }

    fn build_table(
        env: &MemEnv,
        path: &Path,
        options: Arc<Options>,
        cf: &ColumnFamilyOptions,
        data: &[(InternalKey, String)],
        compression: CompressionType,
    ) -> u64 {
        let file = env.new_writable_file(path).unwrap();
        let mut builder = TableBuilder::new(options, cf, compression, file);
        for (k, v) in data {
            builder.add(k.encode(), v.as_bytes()).unwrap();
        }
        builder.finish(true).unwrap()
    }

    #[test]
    fn test_build_then_scan() {
        let env = MemEnv::new();
        let path = Path::new("db/000001.sst");
        let (options, cf) = test_options(true);
        let data = build_dataset(2000);

        let size = build_table(&env, path, options.clone(), &cf, &data, CompressionType::None);
        assert_eq!(env.file_size(path).unwrap(), size);

        let file = env.new_random_access_file(path).unwrap();
        let table = Arc::new(Table::open(options, &cf, file, size).unwrap());

        let mut iter = Table::iter(table, ReadOptions::default());
        iter.seek_to_first();
        for (k, v) in &data {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.encode());
            assert_eq!(iter.value(), v.as_bytes());
            iter.next();
        }
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_snappy_round_trip() {
        let env = MemEnv::new();
        let path = Path::new("db/000002.sst");
        let (options, cf) = test_options(false);
        let data = build_dataset(500);

        let size = build_table(
            &env,
            path,
            options.clone(),
            &cf,
            &data,
            CompressionType::Snappy,
        );
        let file = env.new_random_access_file(path).unwrap();
        let table = Arc::new(Table::open(options, &cf, file, size).unwrap());

        let read_options = ReadOptions {
            verify_checksums: true,
            fill_cache: true,
            ..Default::default()
        };
        let mut iter = Table::iter(table, read_options);
        iter.seek(data[250].0.encode());
        assert!(iter.valid());
        assert_eq!(iter.key(), data[250].0.encode());
        assert_eq!(iter.value(), data[250].1.as_bytes());
    }

    #[test]
    fn test_internal_get_hits_and_misses() {
        let env = MemEnv::new();
        let path = Path::new("db/000003.sst");
        let (options, cf) = test_options(true);
        let data = build_dataset(100);
        let size = build_table(&env, path, options.clone(), &cf, &data, CompressionType::None);

        let file = env.new_random_access_file(path).unwrap();
        let table = Arc::new(Table::open(options, &cf, file, size).unwrap());

        let cmp = BitwiseComparator {};
        let read_options = ReadOptions::default();

        // present key
        let target = InternalKey::new(b"user-key-000042", u64::MAX >> 8, ValueType::Value);
        let mut ctx = GetContext::new(&cmp, None, b"user-key-000042");
        Table::internal_get(&table, &read_options, target.encode(), &mut ctx).unwrap();
        assert_eq!(ctx.finalize().unwrap(), Some(b"value:000042".to_vec()));

        // absent key
        let target = InternalKey::new(b"user-key-999999", u64::MAX >> 8, ValueType::Value);
        let mut ctx = GetContext::new(&cmp, None, b"user-key-999999");
        Table::internal_get(&table, &read_options, target.encode(), &mut ctx).unwrap();
        assert_eq!(ctx.finalize().unwrap(), None);
    }

    #[test]
    fn test_approximate_offsets_increase() {
        let env = MemEnv::new();
        let path = Path::new("db/000004.sst");
        let (options, cf) = test_options(false);
        let data = build_dataset(2000);
        let size = build_table(&env, path, options.clone(), &cf, &data, CompressionType::None);

        let file = env.new_random_access_file(path).unwrap();
        let table = Arc::new(Table::open(options, &cf, file, size).unwrap());

        let early = table.approximate_offset_of(data[10].0.encode());
        let late = table.approximate_offset_of(data[1900].0.encode());
        assert!(early < late);
        assert!(late <= size);
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let env = MemEnv::new();
        let path = Path::new("db/000005.sst");
        let (options, cf) = test_options(false);
        let data = build_dataset(10);
        build_table(&env, path, options.clone(), &cf, &data, CompressionType::None);

        // Truncate into the footer.
        let size = env.file_size(path).unwrap();
        let file = env.new_random_access_file(path).unwrap();
        assert!(Table::open(options, &cf, file, size - 4).is_err());
    }
}
