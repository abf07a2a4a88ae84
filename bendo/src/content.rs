//! The content resolver: given an item and blob, produce a reader from
//! the fastest source available. Small blobs are copied tape-to-cache by
//! a single-flight copier per key; large blobs bypass the cache and
//! stream straight off tape; copy failures are remembered briefly so a
//! burst of readers for a broken blob does not stampede the archive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{cache_key, BlobCache};
use crate::error::{CResult, Error};
use crate::item::{BlobId, ItemRegistry};
use crate::store::SectionReader;

/// How long a failed copy poisons its key.
const COPY_ERROR_TTL: Duration = Duration::from_secs(30);

/// How long a read request may wait on an in-flight copy.
pub const CONTENT_WAIT: Duration = Duration::from_secs(60);

/// Where a blob's bytes are coming from.
pub enum Content {
    /// Served out of the cache.
    Cached { reader: SectionReader, size: u64 },
    /// Too large to cache; streaming straight off tape.
    Large { reader: SectionReader, size: u64 },
    /// A copy into the cache is (or may soon be) in flight; retry after
    /// waiting.
    Waiting,
}

pub struct ContentResolver {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ItemRegistry>,
    cache: Arc<dyn BlobCache>,
    tape: Arc<AtomicBool>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
    errors: Mutex<HashMap<String, (Instant, Error)>>,
}

struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Flight {
    fn new() -> Self {
        Flight { done: Mutex::new(false), cv: Condvar::new() }
    }

    fn release(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.cv.notify_all();
        }
    }

    /// True when the flight completed before the deadline.
    fn wait_until(&self, deadline: Instant) -> bool {
        let Ok(mut done) = self.done.lock() else { return false };
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.cv.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => done = guard,
                Err(_) => return false,
            }
        }
        true
    }
}

impl ContentResolver {
    pub fn new(registry: Arc<ItemRegistry>, cache: Arc<dyn BlobCache>, tape: Arc<AtomicBool>) -> Self {
        ContentResolver {
            inner: Arc::new(Inner {
                registry,
                cache,
                tape,
                flights: Mutex::new(HashMap::new()),
                errors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// One step of resolution:
    ///
    /// 1. a cache hit is served immediately;
    /// 2. with tape disabled, `NoStore`;
    /// 3. with `allow_load` false (a HEAD), `Waiting` without starting
    ///    anything;
    /// 4. a recent copy failure for this key is returned as its error;
    /// 5. a cacheable blob starts (or joins) the single-flight copy and
    ///    reports `Waiting`;
    /// 6. anything larger streams directly off tape.
    pub fn find_content(&self, item: &str, bid: BlobId, allow_load: bool) -> CResult<Content> {
        let key = cache_key(item, bid);
        if let Some((reader, size)) = self.inner.cache.get(&key)? {
            return Ok(Content::Cached { reader, size });
        }
        if !self.inner.tape.load(Ordering::SeqCst) {
            return Err(Error::NoStore);
        }
        let blob = self.inner.registry.blob_info(item, bid)?;
        if !allow_load {
            return Ok(Content::Waiting);
        }
        if let Some(err) = self.recent_error(&key)? {
            return Err(err);
        }

        let max = self.inner.cache.max_size();
        if max == 0 || blob.size <= max / 8 {
            self.start_copy(&key, item, bid, blob.size)?;
            return Ok(Content::Waiting);
        }

        let reader = self.inner.registry.blob(item, bid)?;
        Ok(Content::Large { reader, size: blob.size })
    }

    /// Resolves with waiting: retries `find_content` until it yields a
    /// reader or `timeout` passes. HEAD requests use `find_content`
    /// directly and never wait.
    pub fn fetch(&self, item: &str, bid: BlobId, timeout: Duration) -> CResult<Content> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_content(item, bid, true)? {
                Content::Waiting => {
                    if !self.wait_for_copy(item, bid, deadline) {
                        return Err(Error::Timeout);
                    }
                }
                content => return Ok(content),
            }
        }
    }

    /// Blocks until any in-flight copy for the key completes. True unless
    /// the deadline passed first.
    pub fn wait_for_copy(&self, item: &str, bid: BlobId, deadline: Instant) -> bool {
        let key = cache_key(item, bid);
        let flight = match self.inner.flights.lock() {
            Ok(flights) => flights.get(&key).cloned(),
            Err(_) => None,
        };
        match flight {
            Some(flight) => flight.wait_until(deadline),
            None => true,
        }
    }

    /// A copy failure for this key within the ledger TTL, if any. Expired
    /// entries are dropped on the way.
    fn recent_error(&self, key: &str) -> CResult<Option<Error>> {
        let mut errors = self.inner.errors.lock()?;
        match errors.get(key) {
            Some((at, err)) if at.elapsed() < COPY_ERROR_TTL => Ok(Some(err.clone())),
            Some(_) => {
                errors.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Starts the tape-to-cache copy for a key unless one is already in
    /// flight.
    fn start_copy(&self, key: &str, item: &str, bid: BlobId, size: u64) -> CResult<()> {
        let mut flights = self.inner.flights.lock()?;
        if flights.contains_key(key) {
            return Ok(());
        }
        flights.insert(key.to_string(), Arc::new(Flight::new()));
        drop(flights);

        let inner = self.inner.clone();
        let owned_key = key.to_string();
        let item = item.to_string();
        let spawned = std::thread::Builder::new().name("cache-copy".to_string()).spawn(move || {
            let key = owned_key;
            if let Err(err) = copy_blob(&inner, &key, &item, bid, size) {
                log::warn!("cannot stage blob {} into the cache: {}", key, err);
                if let Err(err) = inner.cache.delete(&key) {
                    log::debug!("no partial cache entry {} to remove: {}", key, err);
                }
                if let Ok(mut errors) = inner.errors.lock() {
                    errors.insert(key.clone(), (Instant::now(), err));
                }
            }
            let flight = match inner.flights.lock() {
                Ok(mut flights) => flights.remove(&key),
                Err(_) => None,
            };
            if let Some(flight) = flight {
                flight.release();
            }
        });
        if let Err(err) = spawned {
            // Roll the reservation back so later requests can retry.
            if let Ok(mut flights) = self.inner.flights.lock() {
                if let Some(flight) = flights.remove(key) {
                    flight.release();
                }
            }
            return Err(err.into());
        }
        Ok(())
    }
}

/// The single-flight copier body: tape reader to cache writer, with a
/// byte-count check against the blob record.
fn copy_blob(inner: &Inner, key: &str, item: &str, bid: BlobId, size: u64) -> CResult<()> {
    let mut src = inner.registry.blob(item, bid)?;
    let mut w = inner.cache.put(key)?;
    let copied = std::io::copy(&mut src, &mut w).map_err(Error::from)?;
    if copied != size {
        // Dropping the writer discards the partial entry.
        return Err(Error::Validation(vec![format!(
            "cached {} of {} bytes for blob {}",
            copied, size, key
        )]));
    }
    w.close()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::cache::StoreLru;
    use crate::item::ItemWriter;
    use crate::store::memory::Memory;
    use crate::store::Store;

    struct Fixture {
        store: Arc<dyn Store>,
        registry: Arc<ItemRegistry>,
        cache: Arc<dyn BlobCache>,
        tape: Arc<AtomicBool>,
        resolver: ContentResolver,
    }

    fn fixture(cache_size: u64) -> CResult<Fixture> {
        let store: Arc<dyn Store> = Arc::new(Memory::new());
        let registry = Arc::new(ItemRegistry::new(store.clone(), None));
        let mut w = ItemWriter::open(&registry, "itm", "tester")?;
        let bid = w.write_blob(&mut &b"hello world"[..], None, None, None)?;
        w.set_slot("greeting", bid)?;
        w.close()?;

        let cache: Arc<dyn BlobCache> = Arc::new(StoreLru::new(Arc::new(Memory::new()), cache_size));
        let tape = Arc::new(AtomicBool::new(true));
        let resolver = ContentResolver::new(registry.clone(), cache.clone(), tape.clone());
        Ok(Fixture { store, registry, cache, tape, resolver })
    }

    fn read_all(mut r: SectionReader) -> CResult<Vec<u8>> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).map_err(Error::from)?;
        Ok(out)
    }

    #[test]
    fn fetch_populates_then_hits() -> CResult<()> {
        let fx = fixture(0)?;

        // The first resolution step reports a miss in progress.
        assert!(matches!(fx.resolver.find_content("itm", 1, true)?, Content::Waiting));

        match fx.resolver.fetch("itm", 1, Duration::from_secs(10))? {
            Content::Cached { reader, size } => {
                assert_eq!(size, 11);
                assert_eq!(read_all(reader)?, b"hello world");
            }
            _ => panic!("expected cached content"),
        }

        // Now a plain get hits without any flight.
        assert!(matches!(fx.resolver.find_content("itm", 1, true)?, Content::Cached { .. }));
        Ok(())
    }

    #[test]
    fn head_never_populates() -> CResult<()> {
        let fx = fixture(0)?;
        assert!(matches!(fx.resolver.find_content("itm", 1, false)?, Content::Waiting));
        assert!(matches!(fx.resolver.find_content("itm", 1, false)?, Content::Waiting));
        assert!(fx.cache.get(&cache_key("itm", 1))?.is_none());
        Ok(())
    }

    #[test]
    fn large_blobs_bypass_the_cache() -> CResult<()> {
        // Budget 80 means anything over 10 bytes bypasses; the blob is 11.
        let fx = fixture(80)?;
        match fx.resolver.find_content("itm", 1, true)? {
            Content::Large { reader, size } => {
                assert_eq!(size, 11);
                assert_eq!(read_all(reader)?, b"hello world");
            }
            _ => panic!("expected a tape bypass"),
        }
        assert!(fx.cache.get(&cache_key("itm", 1))?.is_none());
        Ok(())
    }

    #[test]
    fn tape_disabled() -> CResult<()> {
        let fx = fixture(0)?;
        fx.tape.store(false, Ordering::SeqCst);
        assert_eq!(fx.resolver.find_content("itm", 1, true).err(), Some(Error::NoStore));
        Ok(())
    }

    #[test]
    fn missing_and_deleted_blobs() -> CResult<()> {
        let fx = fixture(0)?;
        assert!(matches!(
            fx.resolver.find_content("itm", 9, true),
            Err(Error::NoBlob(_, 9))
        ));

        let mut w = ItemWriter::open(&fx.registry, "itm", "tester")?;
        w.delete_blob(1)?;
        w.close()?;
        assert_eq!(
            fx.resolver.find_content("itm", 1, true).err(),
            Some(Error::Deleted("itm".into(), 1))
        );
        Ok(())
    }

    #[test]
    fn copy_failures_are_remembered() -> CResult<()> {
        let fx = fixture(0)?;
        // Warm the registry, then pull the bundle out from underneath it.
        fx.registry.item("itm")?;
        fx.store.delete("itm-0001")?;

        let err = fx.resolver.fetch("itm", 1, Duration::from_secs(10));
        assert!(err.is_err());

        // The ledger answers instead of another tape attempt.
        let again = fx.resolver.find_content("itm", 1, true);
        assert!(again.is_err());
        Ok(())
    }
}
