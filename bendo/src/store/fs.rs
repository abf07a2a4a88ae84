use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::store::{ReadAt, Store, StoreWriter};

/// A store keeping one file per key inside a single directory. Takes out an
/// exclusive lock on a lock file for the lifetime of the store, so two
/// processes cannot serve the same directory at once.
///
/// Creates stage into a hidden temp file and rename into place on close, so
/// a key never becomes visible half-written. Keys starting with `.` are
/// reserved for the lock and staging files and are never listed.
pub struct FileSystem {
    root: PathBuf,
    _lock: File,
}

const LOCK_FILE: &str = ".lock";

impl FileSystem {
    /// Opens a store rooted at `root`, creating the directory if needed.
    /// Errors if another process holds the directory lock.
    pub fn new(root: impl Into<PathBuf>) -> CResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let lock = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|err| Error::Conflict(format!("store {} is locked: {}", root.display(), err)))?;
        Ok(FileSystem { root, _lock: lock })
    }

    fn path(&self, key: &str) -> CResult<PathBuf> {
        if key.is_empty() || key.starts_with('.') || key.contains('/') {
            return Err(Error::Malformed(format!("invalid store key {:?}", key)));
        }
        Ok(self.root.join(key))
    }
}

impl Store for FileSystem {
    fn create(&self, key: &str) -> CResult<Box<dyn StoreWriter>> {
        let path = self.path(key)?;
        if path.exists() {
            return Err(Error::Existing(format!("key {}", key)));
        }
        let tmp = tempfile::Builder::new()
            .prefix(".stage-")
            .tempfile_in(&self.root)?;
        Ok(Box::new(FileWriter { tmp: Some(tmp), path }))
    }

    fn open(&self, key: &str) -> CResult<(Arc<dyn ReadAt>, u64)> {
        let path = self.path(key)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NoKey(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        Ok((Arc::new(FileReadAt(Mutex::new(file))), size))
    }

    fn delete(&self, key: &str) -> CResult<()> {
        let path = self.path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoKey(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> CResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue; // lock and staging files
            }
            keys.push(name);
        }
        Ok(keys)
    }
}

struct FileWriter {
    tmp: Option<tempfile::NamedTempFile>,
    path: PathBuf,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.tmp.as_mut() {
            Some(tmp) => tmp.write(buf),
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "writer closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.tmp.as_mut() {
            Some(tmp) => tmp.flush(),
            None => Ok(()),
        }
    }
}

impl StoreWriter for FileWriter {
    fn close(mut self: Box<Self>) -> CResult<()> {
        let tmp = match self.tmp.take() {
            Some(tmp) => tmp,
            None => return Err(Error::Internal("store writer closed twice".to_string())),
        };
        tmp.as_file().sync_all()?;
        // Refuses to clobber a key created since our existence check.
        tmp.persist_noclobber(&self.path)
            .map_err(|err| Error::Existing(format!("key {}: {}", self.path.display(), err)))?;
        Ok(())
    }
    // An unclosed NamedTempFile removes itself on drop.
}

/// Positioned reads over the key's file. The handle is shared by every
/// section reader, so seeks are serialized behind a mutex.
struct FileReadAt(Mutex<File>);

impl ReadAt for FileReadAt {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> CResult<usize> {
        let mut file = self.0.lock()?;
        file.seek(SeekFrom::Start(pos))?;
        let n = file.read(buf)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;

    fn setup() -> FileSystem {
        let dir = tempdir::TempDir::new("fsstore").unwrap();
        let store = FileSystem::new(dir.path().join("store")).unwrap();
        // Leak the tempdir so it outlives the store during the test run.
        std::mem::forget(dir);
        store
    }

    super::super::tests::test_store!(setup());

    #[test]
    fn directory_is_locked() {
        let dir = tempdir::TempDir::new("fsstore").unwrap();
        let root = dir.path().join("store");
        let first = FileSystem::new(&root).unwrap();
        assert!(matches!(FileSystem::new(&root), Err(Error::Conflict(_))));
        drop(first);
        assert!(FileSystem::new(&root).is_ok());
    }

    #[test]
    fn rejects_bad_keys() {
        let dir = tempdir::TempDir::new("fsstore").unwrap();
        let store = FileSystem::new(dir.path().join("store")).unwrap();
        assert!(store.create("").is_err());
        assert!(store.create(".hidden").is_err());
        assert!(store.create("a/b").is_err());
    }
}
