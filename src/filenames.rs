use std::path::{Path, PathBuf};

use crate::{
    env::{write_string_to_file_sync, Env},
    error::{Error, Result},
};

pub type FileNum = u64;

const CURRENT: &str = "CURRENT";
const LOCK: &str = "LOCK";
const IDENTITY: &str = "IDENTITY";
pub const ARCHIVAL_DIR: &str = "archive";

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum FileType {
    Log,
    DBLock,
    Table,
    Descriptor,
    Current,
    Temp,
    InfoLog,
    Identity,
}

pub fn parse_file_name<P: AsRef<Path>>(f: P) -> Result<(FileNum, FileType)> {
    let f = f
        .as_ref()
        .to_str()
        .ok_or_else(|| Error::InvalidArgument("non-utf8 file name".into()))?;
    if f == CURRENT {
        Ok((0, FileType::Current))
    } else if f == LOCK {
        Ok((0, FileType::DBLock))
    } else if f == IDENTITY {
        Ok((0, FileType::Identity))
    } else if f == "LOG" || f.starts_with("LOG.old") {
        Ok((0, FileType::InfoLog))
    } else if let Some(rest) = f.strip_prefix("MANIFEST-") {
        FileNum::from_str_radix(rest, 10)
            .map(|num| (num, FileType::Descriptor))
            .map_err(|_| Error::InvalidArgument("bad manifest file number".into()))
    } else if let Some(ix) = f.find('.') {
        let num = FileNum::from_str_radix(&f[..ix], 10)
            .map_err(|_| Error::InvalidArgument("bad numbered file name".into()))?;
        match &f[ix + 1..] {
            "log" => Ok((num, FileType::Log)),
            "sst" => Ok((num, FileType::Table)),
            "dbtmp" => Ok((num, FileType::Temp)),
            _ => Err(Error::InvalidArgument("unknown file extension".into())),
        }
    } else {
        Err(Error::InvalidArgument("unknown file type".into()))
    }
}

pub fn table_file_name<P: AsRef<Path>>(db: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    db.as_ref().join(format!("{:06}.sst", num))
}

pub fn log_file_name<P: AsRef<Path>>(db: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    db.as_ref().join(format!("{:06}.log", num))
}

pub fn archived_log_file_name<P: AsRef<Path>>(db: P, num: FileNum) -> PathBuf {
    db.as_ref().join(ARCHIVAL_DIR).join(format!("{:06}.log", num))
}

pub fn archival_dir_name<P: AsRef<Path>>(db: P) -> PathBuf {
    db.as_ref().join(ARCHIVAL_DIR)
}

pub fn descriptor_file_name<P: AsRef<Path>>(db: P, num: FileNum) -> PathBuf {
    assert!(num > 0);
    db.as_ref().join(format!("MANIFEST-{:06}", num))
}

pub fn temp_file_name<P: AsRef<Path>>(db: P, num: FileNum) -> PathBuf {
    db.as_ref().join(format!("{:06}.dbtmp", num))
}

pub fn current_file_name<P: AsRef<Path>>(db: P) -> PathBuf {
    db.as_ref().join(CURRENT)
}

pub fn lock_file_name<P: AsRef<Path>>(db: P) -> PathBuf {
    db.as_ref().join(LOCK)
}

pub fn identity_file_name<P: AsRef<Path>>(db: P) -> PathBuf {
    db.as_ref().join(IDENTITY)
}

pub fn info_log_file_name<P: AsRef<Path>>(db: P) -> PathBuf {
    db.as_ref().join("LOG")
}

pub fn old_info_log_file_name<P: AsRef<Path>>(db: P, ts: u64) -> PathBuf {
    db.as_ref().join(format!("LOG.old.{}", ts))
}

/// Points CURRENT at MANIFEST-<num> via a temp file and an atomic rename.
pub fn set_current_file<E: Env>(env: E, db: &Path, descriptor_num: FileNum) -> Result<()> {
    let mut content = format!("MANIFEST-{:06}", descriptor_num);
    content.push('\n');
    let tmp = temp_file_name(db, descriptor_num);

    match write_string_to_file_sync(env.clone(), content.as_bytes(), &tmp) {
        Ok(()) => Ok(env.rename_file(&tmp, &current_file_name(db))?),
        Err(e) => {
            let _ = env.delete_file(&tmp);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let cases: Vec<(&str, FileNum, FileType)> = vec![
            ("CURRENT", 0, FileType::Current),
            ("LOCK", 0, FileType::DBLock),
            ("IDENTITY", 0, FileType::Identity),
            ("LOG", 0, FileType::InfoLog),
            ("LOG.old.12345", 0, FileType::InfoLog),
            ("MANIFEST-000004", 4, FileType::Descriptor),
            ("000123.log", 123, FileType::Log),
            ("000009.sst", 9, FileType::Table),
            ("000033.dbtmp", 33, FileType::Temp),
        ];
        for (name, num, typ) in cases {
            let (n, t) = parse_file_name(name).unwrap();
            assert_eq!(n, num, "{}", name);
            assert_eq!(t, typ, "{}", name);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for name in ["", "foo", "foo.bar", "abc.log", "MANIFEST-abc", "123"] {
            assert!(parse_file_name(name).is_err(), "{}", name);
        }
    }

    #[test]
    fn test_generated_names_parse_back() {
        let db = Path::new("testdb");
        for (path, typ) in [
            (table_file_name(db, 7), FileType::Table),
            (log_file_name(db, 8), FileType::Log),
            (descriptor_file_name(db, 9), FileType::Descriptor),
            (temp_file_name(db, 10), FileType::Temp),
        ] {
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            let (_, t) = parse_file_name(&name).unwrap();
            assert_eq!(t, typ);
        }
    }

    #[test]
    fn test_set_current_file() {
        use crate::env::mem::MemEnv;
        use crate::env::read_file_to_string;

        let env = MemEnv::new();
        let db = Path::new("db");
        set_current_file(env.clone(), db, 5).unwrap();

        let mut content = String::new();
        read_file_to_string(env, current_file_name(db), &mut content).unwrap();
        assert_eq!(content, "MANIFEST-000005\n");
    }
}
