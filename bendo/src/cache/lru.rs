use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::cache::BlobCache;
use crate::error::{CResult, Error};
use crate::store::{SectionReader, Store, StoreWriter};

/// A byte-budget LRU cache over a store. The index orders keys by recency
/// and tracks their sizes; when a put pushes the total over the budget,
/// least recently used entries are evicted until it fits again. The index
/// is rebuilt from the backing store by `scan`, so a filesystem-backed
/// cache keeps its contents across restarts.
pub struct StoreLru {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    max_size: u64,
    state: Mutex<State>,
}

struct State {
    index: LruCache<String, u64>,
    total: u64,
    pending: HashSet<String>,
}

impl StoreLru {
    /// A cache over `store` bounded by `max_size` bytes; 0 is unbounded.
    pub fn new(store: Arc<dyn Store>, max_size: u64) -> Self {
        StoreLru {
            inner: Arc::new(Inner {
                store,
                max_size,
                state: Mutex::new(State {
                    index: LruCache::unbounded(),
                    total: 0,
                    pending: HashSet::new(),
                }),
            }),
        }
    }
}

impl Inner {
    fn evict(&self, state: &mut State) {
        while self.max_size > 0 && state.total > self.max_size {
            let (key, size) = match state.index.pop_lru() {
                Some(entry) => entry,
                None => return,
            };
            state.total -= size;
            match self.store.delete(&key) {
                Ok(()) | Err(Error::NoKey(_)) => log::debug!("evicted cached blob {}", key),
                Err(err) => log::warn!("cannot evict cached blob {}: {}", key, err),
            }
        }
    }
}

impl BlobCache for StoreLru {
    fn get(&self, key: &str) -> CResult<Option<(SectionReader, u64)>> {
        let mut state = self.inner.state.lock()?;
        if state.pending.contains(key) || state.index.get(key).is_none() {
            return Ok(None);
        }
        match self.inner.store.open(key) {
            Ok((src, size)) => Ok(Some((SectionReader::new(src, 0, size), size))),
            Err(Error::NoKey(_)) => {
                // The backing entry vanished underneath the index.
                if let Some(size) = state.index.pop(key) {
                    state.total -= size;
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn put(&self, key: &str) -> CResult<Box<dyn StoreWriter>> {
        let mut state = self.inner.state.lock()?;
        if state.pending.contains(key) {
            return Err(Error::PutPending(key.to_string()));
        }
        // Replace any committed entry.
        if let Some(size) = state.index.pop(key) {
            state.total -= size;
            match self.inner.store.delete(key) {
                Ok(()) | Err(Error::NoKey(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let w = self.inner.store.create(key)?;
        state.pending.insert(key.to_string());
        Ok(Box::new(LruWriter {
            inner: self.inner.clone(),
            key: key.to_string(),
            w: Some(w),
            count: 0,
        }))
    }

    fn delete(&self, key: &str) -> CResult<()> {
        let mut state = self.inner.state.lock()?;
        if let Some(size) = state.index.pop(key) {
            state.total -= size;
        }
        match self.inner.store.delete(key) {
            Ok(()) | Err(Error::NoKey(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Adopts keys that exist in the backing store but not the index (a
    /// cold start on a persistent store), drops index entries whose
    /// backing key is gone, and evicts any overflow.
    fn scan(&self) -> CResult<()> {
        let keys = self.inner.store.list()?;
        let mut state = self.inner.state.lock()?;
        let live: HashSet<String> = keys.into_iter().collect();

        let stale: Vec<String> = state
            .index
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| !live.contains(k))
            .collect();
        for key in stale {
            if let Some(size) = state.index.pop(&key) {
                state.total -= size;
            }
        }

        for key in live {
            if state.index.contains(&key) || state.pending.contains(&key) {
                continue;
            }
            let (_, size) = self.inner.store.open(&key)?;
            state.index.put(key, size);
            state.total += size;
        }

        self.inner.evict(&mut state);
        Ok(())
    }
}

struct LruWriter {
    inner: Arc<Inner>,
    key: String,
    w: Option<Box<dyn StoreWriter>>,
    count: u64,
}

impl Write for LruWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let w = self
            .w
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "cache writer closed"))?;
        let n = w.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.w.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl StoreWriter for LruWriter {
    fn close(mut self: Box<Self>) -> CResult<()> {
        let w = match self.w.take() {
            Some(w) => w,
            None => return Err(Error::Internal("cache writer closed twice".to_string())),
        };
        w.close()?;
        let mut state = self.inner.state.lock()?;
        state.pending.remove(&self.key);
        state.index.put(self.key.clone(), self.count);
        state.total += self.count;
        self.inner.evict(&mut state);
        Ok(())
    }
}

impl Drop for LruWriter {
    fn drop(&mut self) {
        // An unclosed writer leaves no entry behind; just release the
        // reservation. The inner store writer aborts on its own drop.
        if self.w.is_some() {
            if let Ok(mut state) = self.inner.state.lock() {
                state.pending.remove(&self.key);
            }
        }
    }
}
