//! Directory-backed backend.
//!
//! Each namespace is a directory under the root and each key a file inside it.
//! A commit writes every staged value to a temporary file, syncs it, renames
//! it over the previous one and syncs the directory. Readers never see a
//! half-written value and a failed commit leaves the previous one in place.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{KvBackend, KvError, KvHandle, OpenMode, check_name, check_value};

pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    /// Uses `root` as the partition, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl KvBackend for FileKvStore {
    fn open(&self, namespace: &str, mode: OpenMode) -> Result<Box<dyn KvHandle + '_>, KvError> {
        check_name(namespace)?;
        let dir = self.root.join(namespace);
        match mode {
            OpenMode::ReadOnly if !dir.is_dir() => return Err(KvError::NotFound),
            OpenMode::ReadOnly => {}
            OpenMode::ReadWrite => fs::create_dir_all(&dir)?,
        }
        Ok(Box::new(FileHandle {
            dir,
            mode,
            staged: Vec::new(),
        }))
    }
}

struct FileHandle {
    dir: PathBuf,
    mode: OpenMode,
    staged: Vec<(String, String)>,
}

impl FileHandle {
    fn write_atomic(&self, key: &str, value: &str) -> io::Result<()> {
        let target = self.dir.join(key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(value.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp, &target)) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        sync_dir(&self.dir)?;
        debug!("Committed {:?} ({} bytes)", target, value.len());
        Ok(())
    }
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl KvHandle for FileHandle {
    fn get_str(&self, key: &str) -> Result<String, KvError> {
        check_name(key)?;
        let bytes = match fs::read(self.dir.join(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(KvError::NotFound),
            Err(e) => return Err(e.into()),
        };
        String::from_utf8(bytes).map_err(|e| KvError::Corrupted(e.to_string()))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(KvError::ReadOnly);
        }
        check_name(key)?;
        check_value(value)?;
        self.staged.push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KvError> {
        for (key, value) in &self.staged {
            self.write_atomic(key, value)?;
        }
        self.staged.clear();
        Ok(())
    }
}
