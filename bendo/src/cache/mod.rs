//! The read-through blob cache. Cached payloads live in an ordinary
//! store (memory, filesystem); only the bookkeeping differs between the
//! byte-budget LRU and the fixed-age strategies. Keys pair the item id
//! with the zero-padded blob id.

pub mod lru;
pub mod timed;

pub use self::lru::StoreLru;
pub use self::timed::TimedCache;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::CResult;
use crate::item::BlobId;
use crate::store::{SectionReader, StoreWriter};
use crate::task::Stopper;

/// The cache key for a blob.
pub fn cache_key(item: &str, bid: BlobId) -> String {
    format!("{}+{:04}", item, bid)
}

/// An associative store of blob payloads.
pub trait BlobCache: Send + Sync {
    /// Looks a key up, refreshing its recency. None on a miss.
    fn get(&self, key: &str) -> CResult<Option<(SectionReader, u64)>>;

    /// Begins populating a key. The entry appears when the writer closes;
    /// a second put for the same key while one is open fails with
    /// `PutPending`.
    fn put(&self, key: &str) -> CResult<Box<dyn StoreWriter>>;

    /// Drops a key.
    fn delete(&self, key: &str) -> CResult<()>;

    /// The byte budget; 0 means unbounded.
    fn max_size(&self) -> u64;

    /// Housekeeping: reconcile the index with the backing store, evict
    /// overflow, expire stale entries.
    fn scan(&self) -> CResult<()>;
}

/// Runs `scan` every `interval` until stopped.
pub fn spawn_scanner(
    cache: Arc<dyn BlobCache>,
    interval: Duration,
    stopper: Arc<Stopper>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("cache-scan".to_string()).spawn(move || loop {
        if stopper.wait_for(interval) {
            return;
        }
        if let Err(err) = cache.scan() {
            log::warn!("cache scan failed: {}", err);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_pad_the_blob_id() {
        assert_eq!(cache_key("zxcv", 1), "zxcv+0001");
        assert_eq!(cache_key("zxcv", 12345), "zxcv+12345");
    }
}
