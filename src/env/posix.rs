use super::{Env, IoError, IoResult, RandomAccessFile, SequentialFile, WritableFile};
use fs4::fs_std::FileExt;
#[cfg(unix)]
use std::os::unix::fs::FileExt as UnixFileExt;
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub struct PosixFile(File);

#[cfg(unix)]
impl RandomAccessFile for PosixFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> IoResult<usize> {
        Ok(self.0.read_at(buf, offset)?)
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> IoResult<()> {
        Ok(self.0.read_exact_at(buf, offset)?)
    }
}

impl WritableFile for PosixFile {
    fn append(&mut self, data: &[u8]) -> IoResult<()> {
        Ok(self.0.write_all(data)?)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(self.0.flush()?)
    }

    fn sync(&mut self) -> IoResult<()> {
        Ok(self.0.sync_all()?)
    }
}

impl SequentialFile for PosixFile {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        Ok(self.0.read(buf)?)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
        Ok(self.0.read_exact(buf)?)
    }

    fn read_to_string(&mut self, buf: &mut String) -> IoResult<()> {
        Ok(self.0.read_to_string(buf).map(|_| ())?)
    }
}

pub struct PosixFileLock {
    file: File,
    path: PathBuf,
}

#[derive(Clone, Copy, Default)]
pub struct PosixEnv {}

impl Env for PosixEnv {
    type RandomAccessFile = PosixFile;
    type WritableFile = PosixFile;
    type SequentialFile = PosixFile;
    type FileLock = PosixFileLock;

    fn new_random_access_file(&self, name: &Path) -> IoResult<Self::RandomAccessFile> {
        Ok(PosixFile(fs::OpenOptions::new().read(true).open(name)?))
    }

    fn new_writable_file(&self, path: &Path) -> IoResult<Self::WritableFile> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(PosixFile(file))
    }

    fn new_appendable_file(&self, path: &Path) -> IoResult<Self::WritableFile> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(PosixFile(file))
    }

    fn new_sequential_file(&self, path: &Path) -> IoResult<Self::SequentialFile> {
        let file = fs::OpenOptions::new().read(true).open(path)?;
        Ok(PosixFile(file))
    }

    fn file_size(&self, path: &Path) -> IoResult<u64> {
        let meta = fs::metadata(path)?;
        Ok(meta.len())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_modified_micros(&self, path: &Path) -> IoResult<u64> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Ok(modified.as_micros() as u64)
    }

    fn delete_file(&self, path: &Path) -> IoResult<()> {
        Ok(fs::remove_file(path)?)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> IoResult<()> {
        Ok(fs::rename(from, to)?)
    }

    fn create_dir(&self, path: &Path) -> IoResult<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_dir(&self, path: &Path) -> IoResult<()> {
        Ok(fs::remove_dir(path)?)
    }

    fn get_children(&self, path: &Path, files: &mut Vec<String>) -> IoResult<()> {
        for file in fs::read_dir(path)? {
            let f = file?;
            if let Ok(name) = f.file_name().into_string() {
                files.push(name);
            }
        }
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> IoResult<Self::FileLock> {
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if !file.try_lock_exclusive()? {
            return Err(IoError::new(
                io::ErrorKind::WouldBlock,
                "lock held by another process",
            ));
        }
        Ok(PosixFileLock {
            file,
            path: path.to_path_buf(),
        })
    }

    fn unlock_file(&self, lock: Self::FileLock) -> IoResult<()> {
        FileExt::unlock(&lock.file)?;
        drop(lock.path);
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64
    }

    fn sleep_for_micros(&self, micros: u64) {
        thread::sleep(Duration::from_micros(micros));
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_create_get_children() {
        let env = PosixEnv {};
        let file_names = &mut ["alpha", "beta", "gamma"];
        file_names.sort();

        let tmp_dir = TempDir::new().unwrap();
        for file_name in file_names.iter() {
            let file_path = tmp_dir.path().join(file_name);
            let mut file = env.new_writable_file(&file_path).unwrap();
            file.append(file_name.as_bytes()).unwrap()
        }
        let mut files = Vec::new();
        env.get_children(tmp_dir.path(), &mut files).unwrap();
        files.sort();

        assert_eq!(files.len(), file_names.len());

        for file_name in file_names.iter() {
            let file_path = tmp_dir.path().join(file_name);
            assert!(env.file_exists(&file_path));

            let mut file = env.new_sequential_file(&file_path).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            assert_eq!(content, *file_name);
        }
    }

    #[test]
    fn test_lock_file_excludes() {
        let env = PosixEnv {};
        let tmp_dir = TempDir::new().unwrap();
        let lock_path = tmp_dir.path().join("LOCK");

        let lock = env.lock_file(&lock_path).unwrap();
        assert!(env.lock_file(&lock_path).is_err());
        env.unlock_file(lock).unwrap();
        let lock = env.lock_file(&lock_path).unwrap();
        env.unlock_file(lock).unwrap();
    }

    #[test]
    fn test_appendable_preserves_contents() {
        let env = PosixEnv {};
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("data");

        {
            let mut f = env.new_writable_file(&path).unwrap();
            f.append(b"one").unwrap();
        }
        {
            let mut f = env.new_appendable_file(&path).unwrap();
            f.append(b"two").unwrap();
        }
        let mut content = String::new();
        let mut f = env.new_sequential_file(&path).unwrap();
        f.read_to_string(&mut content).unwrap();
        assert_eq!(content, "onetwo");
    }
}
