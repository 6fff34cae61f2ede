use std::{io::Read, ops::Deref};

use crc::{Crc, CRC_32_ISCSI};
use integer_encoding::VarInt;
use snap::read::FrameDecoder;

use crate::{
    codec::decode_u32_le,
    env::RandomAccessFile,
    error::{Error, Result},
};

// Handles are two varint64s, padded so footers have a fixed size.
pub const MAX_ENCODED_HANDLE_LENGTH: usize = 10 + 10;

/// Footer layout, current version:
///   checksum type (1) | padded handles (40) | format version (4) | magic (8)
pub const FOOTER_LENGTH: usize = 1 + 2 * MAX_ENCODED_HANDLE_LENGTH + 4 + 8;
/// Legacy footer: padded handles (40) | magic (8). Read-compatible only.
pub const LEGACY_FOOTER_LENGTH: usize = 2 * MAX_ENCODED_HANDLE_LENGTH + 8;

pub const FOOTER_MAGIC: [u8; 8] = [0x3a, 0xc6, 0x91, 0x5d, 0x0b, 0x74, 0xe2, 0x88];
pub const LEGACY_FOOTER_MAGIC: [u8; 8] = [0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb];

pub const FOOTER_FORMAT_VERSION: u32 = 1;

// 1-byte compression tag + 32-bit checksum of payload+tag.
pub const BLOCK_TRAILER_SIZE: usize = 5;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
    Zlib = 2,
    Bzip2 = 3,
    Lz4 = 4,
    Lz4hc = 5,
}

impl CompressionType {
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Bzip2),
            4 => Ok(Self::Lz4),
            5 => Ok(Self::Lz4hc),
            _ => Err(Error::Corruption("unknown compression tag".into())),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChecksumType {
    NoChecksum = 0,
    Crc32c = 1,
    Crc32 = 2,
}

impl ChecksumType {
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    pub fn checksum(&self, payload: &[u8], tag: u8) -> u32 {
        match self {
            ChecksumType::NoChecksum => 0,
            ChecksumType::Crc32c => {
                let crc = Crc::<u32>::new(&CRC_32_ISCSI);
                let mut digest = crc.digest();
                digest.update(payload);
                digest.update(&[tag]);
                digest.finalize()
            }
            ChecksumType::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(payload);
                hasher.update(&[tag]);
                hasher.finalize()
            }
        }
    }
}

impl TryFrom<u8> for ChecksumType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::NoChecksum),
            1 => Ok(Self::Crc32c),
            2 => Ok(Self::Crc32),
            _ => Err(Error::NotSupported("unknown checksum type".into())),
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn from_raw(data: &[u8]) -> Result<Self> {
        let mut handle = BlockHandle::default();
        handle
            .decode(data)
            .ok_or_else(|| Error::Corruption("bad block handle".into()))?;
        Ok(handle)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn encode(&self, dst: &mut [u8]) -> usize {
        assert!(dst.len() >= self.offset.required_space() + self.size.required_space());

        let offset = self.offset.encode_var(dst);
        self.size.encode_var(&mut dst[offset..]) + offset
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut buf = vec![0; MAX_ENCODED_HANDLE_LENGTH];
        let len = self.encode(&mut buf);
        buf.truncate(len);
        buf
    }

    pub fn decode(&mut self, data: &[u8]) -> Option<usize> {
        let (offset, offset_len) = u64::decode_var(data)?;
        let (size, size_len) = u64::decode_var(&data[offset_len..])?;
        self.offset = offset;
        self.size = size;

        Some(offset_len + size_len)
    }
}

#[derive(Clone, Copy)]
pub struct Footer {
    pub checksum: ChecksumType,
    pub meta_index_handle: BlockHandle,
    pub index_handle: BlockHandle,
    pub version: u32,
}

impl Footer {
    pub fn new(checksum: ChecksumType, meta: BlockHandle, index: BlockHandle) -> Footer {
        Footer {
            checksum,
            meta_index_handle: meta,
            index_handle: index,
            version: FOOTER_FORMAT_VERSION,
        }
    }

    pub fn encode(&self, to: &mut [u8]) {
        assert!(to.len() >= FOOTER_LENGTH);
        to[0] = self.checksum.as_byte();
        let s1 = self.meta_index_handle.encode(&mut to[1..]);
        let _ = self.index_handle.encode(&mut to[1 + s1..]);
        let version_at = 1 + 2 * MAX_ENCODED_HANDLE_LENGTH;
        to[version_at..version_at + 4].copy_from_slice(&self.version.to_le_bytes());
        to[version_at + 4..version_at + 12].copy_from_slice(&FOOTER_MAGIC);
    }

    /// Decodes from the trailing bytes of a table file. `data` must hold at
    /// least the last `LEGACY_FOOTER_LENGTH` bytes, at most the last
    /// `FOOTER_LENGTH`.
    pub fn decode_from_end(data: &[u8]) -> Result<Footer> {
        if data.len() >= FOOTER_LENGTH && data[data.len() - 8..] == FOOTER_MAGIC {
            let footer = &data[data.len() - FOOTER_LENGTH..];
            let checksum = ChecksumType::try_from(footer[0])?;
            let mut meta_index_handle = BlockHandle::default();
            let consumed = meta_index_handle
                .decode(&footer[1..])
                .ok_or_else(|| Error::Corruption("bad metaindex handle".into()))?;
            let mut index_handle = BlockHandle::default();
            index_handle
                .decode(&footer[1 + consumed..])
                .ok_or_else(|| Error::Corruption("bad index handle".into()))?;
            let version_at = 1 + 2 * MAX_ENCODED_HANDLE_LENGTH;
            let version = decode_u32_le(&footer[version_at..]);
            if version > FOOTER_FORMAT_VERSION {
                return Err(Error::NotSupported(format!(
                    "table format version {} not understood",
                    version
                )));
            }
            return Ok(Footer {
                checksum,
                meta_index_handle,
                index_handle,
                version,
            });
        }

        if data.len() >= LEGACY_FOOTER_LENGTH && data[data.len() - 8..] == LEGACY_FOOTER_MAGIC {
            let footer = &data[data.len() - LEGACY_FOOTER_LENGTH..];
            let mut meta_index_handle = BlockHandle::default();
            let consumed = meta_index_handle
                .decode(footer)
                .ok_or_else(|| Error::Corruption("bad metaindex handle".into()))?;
            let mut index_handle = BlockHandle::default();
            index_handle
                .decode(&footer[consumed..])
                .ok_or_else(|| Error::Corruption("bad index handle".into()))?;
            return Ok(Footer {
                checksum: ChecksumType::Crc32c,
                meta_index_handle,
                index_handle,
                version: 0,
            });
        }

        Err(Error::Corruption("not a table file (bad magic number)".into()))
    }
}

#[derive(Default)]
pub struct BlockContent {
    pub data: Vec<u8>,
}

impl BlockContent {
    pub fn new(data: Vec<u8>) -> Self {
        BlockContent { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_block_from_file<R: RandomAccessFile>(
        file: &R,
        handle: &BlockHandle,
        verify_checksum: bool,
        checksum_type: ChecksumType,
    ) -> Result<Self> {
        let n = handle.size as usize;
        let mut buf = vec![0; n + BLOCK_TRAILER_SIZE];
        file.read_exact_at(buf.as_mut(), handle.offset)
            .map_err(|_| Error::Corruption("truncated block read".into()))?;

        let data = buf.as_slice();
        let tag = data[n];
        if verify_checksum && checksum_type != ChecksumType::NoChecksum {
            let stored = decode_u32_le(&data[n + 1..]);
            if stored != checksum_type.checksum(&data[..n], tag) {
                return Err(Error::Corruption("block checksum mismatch".into()));
            }
        }

        match CompressionType::try_from(tag)? {
            CompressionType::None => {
                buf.truncate(n);
                Ok(BlockContent { data: buf })
            }
            CompressionType::Snappy => {
                let mut uncompressed = Vec::new();
                let mut reader = FrameDecoder::new(&data[..n]);
                reader
                    .read_to_end(&mut uncompressed)
                    .map_err(|_| Error::Corruption("corrupted compressed block".into()))?;
                Ok(BlockContent { data: uncompressed })
            }
            other => Err(Error::NotSupported(format!(
                "compression codec {:?} not linked in",
                other
            ))),
        }
    }
}

impl AsRef<[u8]> for BlockContent {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for BlockContent {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_round_trip() {
        let handle = BlockHandle::new(1 << 40, 12345);
        let encoded = handle.encoded();
        let decoded = BlockHandle::from_raw(&encoded).unwrap();
        assert_eq!(decoded.offset(), 1 << 40);
        assert_eq!(decoded.size(), 12345);
    }

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer::new(
            ChecksumType::Crc32c,
            BlockHandle::new(100, 200),
            BlockHandle::new(300, 400),
        );
        let mut buf = vec![0; FOOTER_LENGTH];
        footer.encode(&mut buf);

        let decoded = Footer::decode_from_end(&buf).unwrap();
        assert_eq!(decoded.meta_index_handle.offset(), 100);
        assert_eq!(decoded.meta_index_handle.size(), 200);
        assert_eq!(decoded.index_handle.offset(), 300);
        assert_eq!(decoded.index_handle.size(), 400);
        assert_eq!(decoded.version, FOOTER_FORMAT_VERSION);
        assert_eq!(decoded.checksum, ChecksumType::Crc32c);
    }

    #[test]
    fn test_legacy_footer_decodes() {
        let meta = BlockHandle::new(11, 22);
        let index = BlockHandle::new(33, 44);
        let mut buf = vec![0; LEGACY_FOOTER_LENGTH];
        let n = meta.encode(&mut buf);
        index.encode(&mut buf[n..]);
        let at = LEGACY_FOOTER_LENGTH - 8;
        buf[at..].copy_from_slice(&LEGACY_FOOTER_MAGIC);

        let decoded = Footer::decode_from_end(&buf).unwrap();
        assert_eq!(decoded.index_handle.offset(), 33);
        assert_eq!(decoded.version, 0);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let buf = vec![0xab; FOOTER_LENGTH];
        assert!(matches!(
            Footer::decode_from_end(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_checksum_types_differ() {
        let payload = b"some block payload";
        let c1 = ChecksumType::Crc32c.checksum(payload, 0);
        let c2 = ChecksumType::Crc32.checksum(payload, 0);
        assert_ne!(c1, c2);
        assert_ne!(c1, 0);
    }
}
