use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{CResult, Error};
use crate::store::{ReadAt, Store, StoreWriter};

/// An in-memory store keeping every key in a BTreeMap. Nothing is
/// persisted; used for tests and as the default cache backend.
pub struct Memory {
    data: Arc<RwLock<BTreeMap<String, Arc<Vec<u8>>>>>,
    /// Keys with an open, uncommitted writer. Reserved so two concurrent
    /// `create` calls for one key cannot both succeed.
    pending: Arc<Mutex<HashSet<String>>>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn create(&self, key: &str) -> CResult<Box<dyn StoreWriter>> {
        let mut pending = self.pending.lock()?;
        if self.data.read()?.contains_key(key) || pending.contains(key) {
            return Err(Error::Existing(format!("key {}", key)));
        }
        pending.insert(key.to_string());
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            data: self.data.clone(),
            pending: self.pending.clone(),
        }))
    }

    fn open(&self, key: &str) -> CResult<(Arc<dyn ReadAt>, u64)> {
        let data = self.data.read()?;
        match data.get(key) {
            Some(value) => {
                let size = value.len() as u64;
                Ok((Arc::new(MemoryReadAt(value.clone())), size))
            }
            None => Err(Error::NoKey(key.to_string())),
        }
    }

    fn delete(&self, key: &str) -> CResult<()> {
        let mut data = self.data.write()?;
        match data.remove(key) {
            Some(_) => Ok(()),
            None => Err(Error::NoKey(key.to_string())),
        }
    }

    fn list(&self) -> CResult<Vec<String>> {
        let data = self.data.read()?;
        Ok(data.keys().cloned().collect())
    }

    fn list_prefix(&self, prefix: &str) -> CResult<Vec<String>> {
        let data = self.data.read()?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    data: Arc<RwLock<BTreeMap<String, Arc<Vec<u8>>>>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StoreWriter for MemoryWriter {
    fn close(mut self: Box<Self>) -> CResult<()> {
        let buf = std::mem::take(&mut self.buf);
        let mut data = self.data.write()?;
        data.insert(self.key.clone(), Arc::new(buf));
        Ok(())
        // Drop clears the pending reservation.
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

struct MemoryReadAt(Arc<Vec<u8>>);

impl ReadAt for MemoryReadAt {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> CResult<usize> {
        let data = &self.0;
        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let start = pos as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;

    super::super::tests::test_store!(Memory::new());
}
