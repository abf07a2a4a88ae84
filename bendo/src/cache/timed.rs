use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::BlobCache;
use crate::error::{CResult, Error};
use crate::store::{SectionReader, Store, StoreWriter};

/// A cache whose entries expire after a fixed age instead of competing for
/// a byte budget. Expiry is lazy: an expired entry stops answering `get`
/// immediately, and `scan` (driven by the background scanner) removes the
/// backing keys.
pub struct TimedCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    max_age: Duration,
    state: Mutex<State>,
}

struct State {
    entries: HashMap<String, Instant>,
    pending: HashSet<String>,
}

impl TimedCache {
    pub fn new(store: Arc<dyn Store>, max_age: Duration) -> Self {
        TimedCache {
            inner: Arc::new(Inner {
                store,
                max_age,
                state: Mutex::new(State { entries: HashMap::new(), pending: HashSet::new() }),
            }),
        }
    }
}

impl BlobCache for TimedCache {
    fn get(&self, key: &str) -> CResult<Option<(SectionReader, u64)>> {
        let mut state = self.inner.state.lock()?;
        if state.pending.contains(key) {
            return Ok(None);
        }
        match state.entries.get(key) {
            None => return Ok(None),
            Some(added) if added.elapsed() >= self.inner.max_age => return Ok(None),
            Some(_) => {}
        }
        match self.inner.store.open(key) {
            Ok((src, size)) => Ok(Some((SectionReader::new(src, 0, size), size))),
            Err(Error::NoKey(_)) => {
                state.entries.remove(key);
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
        if state.entries.remove(key).is_some() {
            match self.inner.store.delete(key) {
                Ok(()) | Err(Error::NoKey(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let w = self.inner.store.create(key)?;
        state.pending.insert(key.to_string());
        Ok(Box::new(TimedWriter { inner: self.inner.clone(), key: key.to_string(), w: Some(w) }))
    }

    fn delete(&self, key: &str) -> CResult<()> {
        let mut state = self.inner.state.lock()?;
        state.entries.remove(key);
        match self.inner.store.delete(key) {
            Ok(()) | Err(Error::NoKey(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Age-based caches carry no byte budget.
    fn max_size(&self) -> u64 {
        0
    }

    /// Purges expired entries and adopts unindexed backing keys (fresh as
    /// of now, so a restart restarts their clocks).
    fn scan(&self) -> CResult<()> {
        let keys = self.inner.store.list()?;
        let mut state = self.inner.state.lock()?;

        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, added)| added.elapsed() >= self.inner.max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            state.entries.remove(&key);
            match self.inner.store.delete(&key) {
                Ok(()) | Err(Error::NoKey(_)) => log::debug!("expired cached blob {}", key),
                Err(err) => log::warn!("cannot expire cached blob {}: {}", key, err),
            }
        }

        let now = Instant::now();
        for key in keys {
            if !state.entries.contains_key(&key) && !state.pending.contains(&key) {
                state.entries.insert(key, now);
            }
        }
        Ok(())
    }
}

struct TimedWriter {
    inner: Arc<Inner>,
    key: String,
    w: Option<Box<dyn StoreWriter>>,
}

impl Write for TimedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let w = self
            .w
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "cache writer closed"))?;
        w.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.w.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl StoreWriter for TimedWriter {
    fn close(mut self: Box<Self>) -> CResult<()> {
        let w = match self.w.take() {
            Some(w) => w,
            None => return Err(Error::Internal("cache writer closed twice".to_string())),
        };
        w.close()?;
        let mut state = self.inner.state.lock()?;
        state.pending.remove(&self.key);
        state.entries.insert(self.key.clone(), Instant::now());
        Ok(())
    }
}

impl Drop for TimedWriter {
    fn drop(&mut self) {
        if self.w.is_some() {
            if let Ok(mut state) = self.inner.state.lock() {
                state.pending.remove(&self.key);
            }
        }
    }
}
