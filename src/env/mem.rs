use std::{
    collections::{HashMap, HashSet},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use super::{Env, IoError, IoResult, RandomAccessFile, SequentialFile, WritableFile};

/// Fully in-memory Env. Crash-free storage for format and recovery tests;
/// clones share the same file namespace.
#[derive(Clone, Default)]
pub struct MemEnv {
    inner: Arc<MemEnvInner>,
}

#[derive(Default)]
struct MemEnvInner {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
    dirs: Mutex<HashSet<PathBuf>>,
    locks: Mutex<HashSet<PathBuf>>,
    clock: AtomicU64,
}

impl MemEnv {
    pub fn new() -> Self {
        MemEnv::default()
    }

    fn file(&self, path: &Path) -> IoResult<Arc<Mutex<Vec<u8>>>> {
        self.inner
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| IoError::new(io::ErrorKind::NotFound, "no such file"))
    }
}

pub struct MemSequentialFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl SequentialFile for MemSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let data = self.data.lock().unwrap();
        let remain = data.len().saturating_sub(self.pos);
        let n = remain.min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
        let n = self.read(buf)?;
        if n < buf.len() {
            return Err(IoError::new(io::ErrorKind::UnexpectedEof, "unexpected EOF"));
        }
        Ok(())
    }

    fn read_to_string(&mut self, buf: &mut String) -> IoResult<()> {
        let data = self.data.lock().unwrap();
        let mut reader = &data[self.pos..];
        reader.read_to_string(buf)?;
        self.pos = data.len();
        Ok(())
    }
}

pub struct MemRandomAccessFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = (data.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
        let n = self.read_at(buf, offset)?;
        if n < buf.len() {
            return Err(IoError::new(io::ErrorKind::UnexpectedEof, "unexpected EOF"));
        }
        Ok(())
    }
}

pub struct MemWritableFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> IoResult<()> {
        Ok(())
    }
}

pub struct MemFileLock {
    path: PathBuf,
}

impl Env for MemEnv {
    type RandomAccessFile = MemRandomAccessFile;
    type WritableFile = MemWritableFile;
    type SequentialFile = MemSequentialFile;
    type FileLock = MemFileLock;

    fn new_random_access_file(&self, name: &Path) -> IoResult<Self::RandomAccessFile> {
        Ok(MemRandomAccessFile {
            data: self.file(name)?,
        })
    }

    fn new_writable_file(&self, name: &Path) -> IoResult<Self::WritableFile> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(name.to_path_buf(), data.clone());
        Ok(MemWritableFile { data })
    }

    fn new_appendable_file(&self, name: &Path) -> IoResult<Self::WritableFile> {
        let mut files = self.inner.files.lock().unwrap();
        let data = files
            .entry(name.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(MemWritableFile { data })
    }

    fn new_sequential_file(&self, name: &Path) -> IoResult<Self::SequentialFile> {
        Ok(MemSequentialFile {
            data: self.file(name)?,
            pos: 0,
        })
    }

    fn file_size(&self, path: &Path) -> IoResult<u64> {
        Ok(self.file(path)?.lock().unwrap().len() as u64)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.inner.files.lock().unwrap().contains_key(path)
    }

    fn file_modified_micros(&self, path: &Path) -> IoResult<u64> {
        let _ = self.file(path)?;
        Ok(self.inner.clock.load(Ordering::Relaxed))
    }

    fn delete_file(&self, path: &Path) -> IoResult<()> {
        self.inner
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| IoError::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn rename_file(&self, from: &Path, to: &Path) -> IoResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        let data = files
            .remove(from)
            .ok_or_else(|| IoError::new(io::ErrorKind::NotFound, "no such file"))?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> IoResult<()> {
        self.inner.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn delete_dir(&self, path: &Path) -> IoResult<()> {
        self.inner.dirs.lock().unwrap().remove(path);
        Ok(())
    }

    fn get_children(&self, path: &Path, files: &mut Vec<String>) -> IoResult<()> {
        let map = self.inner.files.lock().unwrap();
        for name in map.keys() {
            if name.parent() == Some(path) {
                if let Some(f) = name.file_name().and_then(|f| f.to_str()) {
                    files.push(f.to_string());
                }
            }
        }
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> IoResult<Self::FileLock> {
        let mut locks = self.inner.locks.lock().unwrap();
        if !locks.insert(path.to_path_buf()) {
            return Err(IoError::new(io::ErrorKind::WouldBlock, "lock held"));
        }
        Ok(MemFileLock {
            path: path.to_path_buf(),
        })
    }

    fn unlock_file(&self, lock: Self::FileLock) -> IoResult<()> {
        self.inner.locks.lock().unwrap().remove(&lock.path);
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        // Deterministic, monotone clock.
        self.inner.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn sleep_for_micros(&self, micros: u64) {
        thread::sleep(Duration::from_micros(micros.min(1000)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() {
        let env = MemEnv::new();
        let path = Path::new("dir/file");
        {
            let mut f = env.new_writable_file(path).unwrap();
            f.append(b"hello world").unwrap();
        }
        assert_eq!(env.file_size(path).unwrap(), 11);

        let mut buf = [0u8; 5];
        let f = env.new_random_access_file(path).unwrap();
        f.read_exact_at(&mut buf, 6).unwrap();
        assert_eq!(&buf, b"world");

        let mut seq = env.new_sequential_file(path).unwrap();
        let mut s = String::new();
        seq.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");
    }

    #[test]
    fn test_rename_and_children() {
        let env = MemEnv::new();
        env.new_writable_file(Path::new("db/000001.log")).unwrap();
        env.new_writable_file(Path::new("db/CURRENT.tmp")).unwrap();
        env.rename_file(Path::new("db/CURRENT.tmp"), Path::new("db/CURRENT"))
            .unwrap();

        let mut children = Vec::new();
        env.get_children(Path::new("db"), &mut children).unwrap();
        children.sort();
        assert_eq!(children, vec!["000001.log", "CURRENT"]);
    }

    #[test]
    fn test_lock_exclusion() {
        let env = MemEnv::new();
        let lock = env.lock_file(Path::new("db/LOCK")).unwrap();
        assert!(env.lock_file(Path::new("db/LOCK")).is_err());
        env.unlock_file(lock).unwrap();
        assert!(env.lock_file(Path::new("db/LOCK")).is_ok());
    }
}
