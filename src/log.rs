use crc::{Crc, CRC_32_ISCSI};
use std::io::Cursor;

use crate::codec::{NumberReader, NumberWriter};
use crate::env::{SequentialFile, WritableFile};
use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

const MASK_DELTA: u32 = 0xa282ead8;

/// The CRC of a record is masked so that a log composed of records that
/// themselves contain CRCs (or zero runs) never carries a raw CRC of zero.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

/// Callback for skipped bytes during lenient reads.
pub trait Reporter: Send {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

pub struct LogWriter<W: WritableFile> {
    writer: W,
    current_block_offset: usize,
    block_size: usize,
    digest: Crc<u32>,
}

impl<W: WritableFile> LogWriter<W> {
    pub fn new(writer: W) -> LogWriter<W> {
        Self::new_with_offset(writer, 0)
    }

    /// Resumes writing at `offset` into an existing log file.
    pub fn new_with_offset(writer: W, offset: u64) -> LogWriter<W> {
        LogWriter {
            writer,
            current_block_offset: offset as usize % BLOCK_SIZE,
            block_size: BLOCK_SIZE,
            digest: Crc::<u32>::new(&CRC_32_ISCSI),
        }
    }

    pub fn add_record<P: AsRef<[u8]>>(&mut self, record: P) -> Result<()> {
        let mut record = record.as_ref();
        let mut first_frag = true;
        // An empty record still emits a FULL header.
        loop {
            assert!(self.block_size > HEADER_SIZE);

            let left = self.block_size - self.current_block_offset;
            if left < HEADER_SIZE {
                self.writer.append(&vec![0; left])?;
                self.current_block_offset = 0;
            }

            let avail = self.block_size - self.current_block_offset - HEADER_SIZE;
            let frag_size = record.len().min(avail);

            let record_type = if first_frag && frag_size == record.len() {
                RecordType::Full
            } else if first_frag {
                RecordType::First
            } else if frag_size == record.len() {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_record(record_type, &record[..frag_size])?;

            record = &record[frag_size..];
            first_frag = false;
            if record.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn emit_record(&mut self, t: RecordType, data: &[u8]) -> Result<()> {
        let mut digest = self.digest.digest();
        digest.update(&[t as u8]);
        digest.update(data);
        let checksum = mask_crc(digest.finalize());

        let mut buf = Cursor::new([0u8; HEADER_SIZE]);
        buf.write_u32_le(checksum)?;
        buf.write_u16_le(data.len() as u16)?;
        buf.write_u8_le(t as u8)?;

        self.writer.append(buf.get_ref())?;
        self.writer.append(data)?;
        self.writer.flush()?;

        self.current_block_offset += HEADER_SIZE + data.len();

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync()?;
        Ok(())
    }
}

enum PhysicalRecord {
    // offsets into the reader's block buffer
    Data { rtype: u8, start: usize, end: usize },
    Bad,
    Eof,
}

pub struct LogReader<R: SequentialFile> {
    file: R,
    digest: Crc<u32>,
    verify_checksum: bool,
    strict: bool,
    reporter: Option<Box<dyn Reporter>>,

    buf: Vec<u8>,
    buf_len: usize,
    buf_pos: usize,
    eof: bool,
}

impl<R: SequentialFile> LogReader<R> {
    pub fn new(file: R, verify_checksum: bool) -> Self {
        LogReader {
            file,
            digest: Crc::<u32>::new(&CRC_32_ISCSI),
            verify_checksum,
            strict: false,
            reporter: None,
            buf: vec![0; BLOCK_SIZE],
            buf_len: 0,
            buf_pos: 0,
            eof: false,
        }
    }

    pub fn with_reporter(file: R, verify_checksum: bool, reporter: Box<dyn Reporter>) -> Self {
        let mut reader = Self::new(file, verify_checksum);
        reader.reporter = Some(reporter);
        reader
    }

    /// In strict mode the first corrupt record fails the read instead of
    /// being skipped. Used for recovery under `paranoid_checks`.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    fn report(&mut self, bytes: usize, reason: &str) -> Result<()> {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes, reason);
        }
        if self.strict {
            return Err(Error::Corruption(format!(
                "log record corrupt: {} ({} bytes dropped)",
                reason, bytes
            )));
        }
        Ok(())
    }

    fn read_physical_record(&mut self) -> Result<PhysicalRecord> {
        loop {
            if self.buf_len - self.buf_pos < HEADER_SIZE {
                if self.eof {
                    // A trailing partial header is an incomplete final write,
                    // not corruption.
                    return Ok(PhysicalRecord::Eof);
                }
                // The tail of a block too small for a header is zero padding.
                self.buf_pos = 0;
                self.buf_len = self.file.read(&mut self.buf)?;
                if self.buf_len < BLOCK_SIZE {
                    self.eof = true;
                }
                if self.buf_len == 0 {
                    return Ok(PhysicalRecord::Eof);
                }
                continue;
            }

            let mut header = &self.buf[self.buf_pos..self.buf_pos + HEADER_SIZE];
            let expected = header.read_u32_le()?;
            let length = header.read_u16_le()? as usize;
            let rtype = header.read_u8_le()?;

            if rtype == 0 && length == 0 {
                // Zero-filled region (preallocated space); resync at the
                // next block.
                self.buf_pos = self.buf_len;
                continue;
            }

            if HEADER_SIZE + length > self.buf_len - self.buf_pos {
                let dropped = self.buf_len - self.buf_pos;
                self.buf_pos = self.buf_len;
                if !self.eof {
                    self.report(dropped, "bad record length")?;
                    return Ok(PhysicalRecord::Bad);
                }
                // Truncated record at the very end of the log.
                return Ok(PhysicalRecord::Eof);
            }

            let start = self.buf_pos + HEADER_SIZE;
            let end = start + length;

            if self.verify_checksum {
                let mut digest = self.digest.digest();
                digest.update(&[rtype]);
                digest.update(&self.buf[start..end]);
                if digest.finalize() != unmask_crc(expected) {
                    // Skip to the next block boundary to resynchronize.
                    let dropped = self.buf_len - self.buf_pos;
                    self.buf_pos = self.buf_len;
                    self.report(dropped, "checksum mismatch")?;
                    return Ok(PhysicalRecord::Bad);
                }
            }

            self.buf_pos = end;
            return Ok(PhysicalRecord::Data { rtype, start, end });
        }
    }

    /// Reads the next logical record into `dst`. `Ok(None)` means a clean
    /// end of log.
    pub fn read_record(&mut self, dst: &mut Vec<u8>) -> Result<Option<usize>> {
        dst.clear();
        let mut in_fragmented_record = false;

        loop {
            let rec = self.read_physical_record()?;
            match rec {
                PhysicalRecord::Eof => {
                    if in_fragmented_record {
                        let len = dst.len();
                        dst.clear();
                        self.report(len, "partial record at end of log")?;
                    }
                    return Ok(None);
                }
                PhysicalRecord::Bad => {
                    if in_fragmented_record {
                        let len = dst.len();
                        dst.clear();
                        in_fragmented_record = false;
                        self.report(len, "record fragment lost to corruption")?;
                    }
                }
                PhysicalRecord::Data { rtype, start, end } => match rtype {
                    t if t == RecordType::Full as u8 => {
                        if in_fragmented_record {
                            let len = dst.len();
                            dst.clear();
                            self.report(len, "partial record without end")?;
                        }
                        dst.extend_from_slice(&self.buf[start..end]);
                        return Ok(Some(dst.len()));
                    }
                    t if t == RecordType::First as u8 => {
                        if in_fragmented_record {
                            let len = dst.len();
                            dst.clear();
                            self.report(len, "partial record without end")?;
                        }
                        dst.extend_from_slice(&self.buf[start..end]);
                        in_fragmented_record = true;
                    }
                    t if t == RecordType::Middle as u8 => {
                        if !in_fragmented_record {
                            self.report(end - start, "missing start of fragmented record")?;
                        } else {
                            dst.extend_from_slice(&self.buf[start..end]);
                        }
                    }
                    t if t == RecordType::Last as u8 => {
                        if !in_fragmented_record {
                            self.report(end - start, "missing start of fragmented record")?;
                        } else {
                            dst.extend_from_slice(&self.buf[start..end]);
                            return Ok(Some(dst.len()));
                        }
                    }
                    unknown => {
                        let len = (end - start) + dst.len();
                        dst.clear();
                        in_fragmented_record = false;
                        self.report(len, &format!("unknown record type {}", unknown))?;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::env::{mem::MemEnv, Env};

    fn write_records(env: &MemEnv, path: &Path, records: &[&[u8]]) {
        let file = env.new_writable_file(path).unwrap();
        let mut writer = LogWriter::new(file);
        for r in records {
            writer.add_record(r).unwrap();
        }
        writer.sync().unwrap();
    }

    #[test]
    fn test_read_write_round_trip() {
        let env = MemEnv::new();
        let path = Path::new("logs/000001.log");
        let big = vec![b'x'; BLOCK_SIZE * 2 + 20];
        let records: Vec<&[u8]> = vec![b"alpha", b"bravo charlie", big.as_slice(), b"tail"];
        write_records(&env, path, &records);

        let file = env.new_sequential_file(path).unwrap();
        let mut reader = LogReader::new(file, true);
        let mut dst = Vec::new();
        for expect in &records {
            let n = reader.read_record(&mut dst).unwrap().unwrap();
            assert_eq!(n, expect.len());
            assert_eq!(dst.as_slice(), *expect);
        }
        assert!(reader.read_record(&mut dst).unwrap().is_none());
    }

    #[test]
    fn test_mask_round_trip() {
        for v in [0u32, 1, 0xdeadbeef, u32::MAX] {
            assert_eq!(unmask_crc(mask_crc(v)), v);
        }
    }

    struct CountingReporter {
        dropped: Arc<Mutex<usize>>,
    }

    impl Reporter for CountingReporter {
        fn corruption(&mut self, bytes: usize, _reason: &str) {
            *self.dropped.lock().unwrap() += bytes;
        }
    }

    #[test]
    fn test_corrupt_record_is_skipped_and_reported() {
        let env = MemEnv::new();
        let path = Path::new("logs/000002.log");
        write_records(&env, path, &[b"first", b"second", b"third"]);

        // Flip a payload byte of the first record.
        {
            let mut raw = Vec::new();
            let mut f = env.new_sequential_file(path).unwrap();
            let mut chunk = [0u8; 4096];
            loop {
                let n = f.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
            }
            raw[HEADER_SIZE] ^= 0xff;
            let mut w = env.new_writable_file(path).unwrap();
            w.append(&raw).unwrap();
        }

        let dropped = Arc::new(Mutex::new(0));
        let file = env.new_sequential_file(path).unwrap();
        let mut reader = LogReader::with_reporter(
            file,
            true,
            Box::new(CountingReporter {
                dropped: dropped.clone(),
            }),
        );

        // Resync skips to the next block boundary, which here swallows the
        // whole (single-block) log; nothing survives but the reader ends
        // cleanly and the damage was reported.
        let mut dst = Vec::new();
        while reader.read_record(&mut dst).unwrap().is_some() {}
        assert!(*dropped.lock().unwrap() > 0);
    }

    #[test]
    fn test_strict_mode_fails_on_corruption() {
        let env = MemEnv::new();
        let path = Path::new("logs/000003.log");
        write_records(&env, path, &[b"only"]);

        {
            let mut raw = Vec::new();
            let mut f = env.new_sequential_file(path).unwrap();
            let mut chunk = [0u8; 4096];
            loop {
                let n = f.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
            }
            raw[HEADER_SIZE] ^= 0xff;
            let mut w = env.new_writable_file(path).unwrap();
            w.append(&raw).unwrap();
        }

        let file = env.new_sequential_file(path).unwrap();
        let mut reader = LogReader::new(file, true);
        reader.set_strict(true);
        let mut dst = Vec::new();
        assert!(matches!(
            reader.read_record(&mut dst),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_truncated_tail_is_clean_eof() {
        let env = MemEnv::new();
        let path = Path::new("logs/000004.log");
        write_records(&env, path, &[b"one", b"two"]);

        // Chop off the last few bytes to simulate a crash mid-append.
        {
            let mut raw = Vec::new();
            let mut f = env.new_sequential_file(path).unwrap();
            let mut chunk = [0u8; 4096];
            loop {
                let n = f.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
            }
            raw.truncate(raw.len() - 2);
            let mut w = env.new_writable_file(path).unwrap();
            w.append(&raw).unwrap();
        }

        let file = env.new_sequential_file(path).unwrap();
        let mut reader = LogReader::new(file, true);
        let mut dst = Vec::new();
        assert_eq!(reader.read_record(&mut dst).unwrap(), Some(3));
        assert_eq!(dst, b"one");
        assert!(reader.read_record(&mut dst).unwrap().is_none());
    }
}
