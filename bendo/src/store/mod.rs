pub mod fs;
pub mod memory;
pub mod prefix;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{CResult, Error};

/// A flat namespace of opaque byte blobs keyed by string. This is the
/// contract every archival backend (filesystem, S3, in-memory) must obey;
/// the rest of the crate is written against it and never against a concrete
/// implementation.
///
/// Keys are created exactly once: `create` must refuse to overwrite, and
/// content only becomes visible when the returned writer is closed. `open`
/// and `delete` distinguish a missing key (`Error::NoKey`) from an I/O
/// failure (`Error::IO`).
pub trait Store: Send + Sync {
    /// Begins an exclusive write of a new key. The key appears in the store
    /// only when the writer's `close` succeeds; a dropped writer discards
    /// the partial content.
    fn create(&self, key: &str) -> CResult<Box<dyn StoreWriter>>;

    /// Opens a key for random-access reads, returning the handle and the
    /// total size in bytes.
    fn open(&self, key: &str) -> CResult<(Arc<dyn ReadAt>, u64)>;

    /// Removes a key and its content.
    fn delete(&self, key: &str) -> CResult<()>;

    /// Every key in the store, in unspecified order.
    fn list(&self) -> CResult<Vec<String>>;

    /// Every key beginning with the given prefix.
    fn list_prefix(&self, prefix: &str) -> CResult<Vec<String>> {
        let mut keys = self.list()?;
        keys.retain(|k| k.starts_with(prefix));
        Ok(keys)
    }
}

/// The write half handed out by `Store::create`. Closing commits the key;
/// dropping without closing aborts it.
pub trait StoreWriter: Write + Send {
    fn close(self: Box<Self>) -> CResult<()>;
}

/// Positioned reads into an opened key.
pub trait ReadAt: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `pos`, returning the number
    /// of bytes read. Zero means end of content.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> CResult<usize>;
}

/// Convenience: opens a key as a sequential reader over its full content.
pub fn open_read(store: &dyn Store, key: &str) -> CResult<SectionReader> {
    let (src, size) = store.open(key)?;
    Ok(SectionReader::new(src, 0, size))
}

/// A `Read + Seek` window over a region of a `ReadAt` source. Several
/// sections over one handle may be read independently; the zip codec and
/// the content paths rely on that.
pub struct SectionReader {
    src: Arc<dyn ReadAt>,
    off: u64,
    len: u64,
    pos: u64,
}

impl SectionReader {
    pub fn new(src: Arc<dyn ReadAt>, off: u64, len: u64) -> Self {
        SectionReader { src, off, len, pos: 0 }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Clone for SectionReader {
    fn clone(&self) -> Self {
        SectionReader { src: self.src.clone(), off: self.off, len: self.len, pos: 0 }
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remain = (self.len - self.pos) as usize;
        let want = buf.len().min(remain);
        let n = self
            .src
            .read_at(self.off + self.pos, &mut buf[..want])
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of section",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Writes all of `value` under `key` and closes the writer. Small-record
/// helper used by the metadata stores.
pub fn put_bytes(store: &dyn Store, key: &str, value: &[u8]) -> CResult<()> {
    let mut w = store.create(key)?;
    w.write_all(value).map_err(Error::from)?;
    w.close()
}

/// Replaces `key` with `value`, deleting any previous content first.
pub fn replace_bytes(store: &dyn Store, key: &str, value: &[u8]) -> CResult<()> {
    match store.delete(key) {
        Ok(()) | Err(Error::NoKey(_)) => {}
        Err(err) => return Err(err),
    }
    put_bytes(store, key, value)
}

/// Reads the full content of `key` into memory.
pub fn get_bytes(store: &dyn Store, key: &str) -> CResult<Vec<u8>> {
    let mut r = open_read(store, key)?;
    let mut buf = Vec::with_capacity(r.len() as usize);
    r.read_to_end(&mut buf).map_err(Error::from)?;
    Ok(buf)
}
