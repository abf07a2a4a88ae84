use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::fixity::checker::NEXT_FIXITY_DURATION;
use crate::item::writer::IDEAL_BUNDLE_SIZE;
use crate::store::{fs::FileSystem, memory::Memory, Store};

/// Options consumed by the storage core. Loaded by the (external) server
/// binary and passed to `Server::new`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Where cached blobs live: empty for in-memory, `file:/path` for a
    /// directory.
    pub cache_dir: String,

    /// Cache byte budget; 0 is unbounded.
    pub cache_size: u64,

    /// Nonzero switches the cache to the fixed-age strategy, with this
    /// many seconds per entry.
    pub cache_timeout: u64,

    /// Size of the commit worker pool.
    pub max_concurrent_commits: usize,

    /// Bundle rotation threshold in bytes.
    pub ideal_bundle_size: u64,

    /// Seconds between fixity checks of one item.
    pub next_fixity_duration: u64,

    /// Path of the embedded fixity database; empty keeps it in memory.
    /// (An external MySQL driver would replace this.)
    pub fixity_db: String,

    /// Whether the archival store starts enabled.
    pub tape: bool,

    /// Delete staged uploads once their transaction finishes cleanly.
    pub delete_uploads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: "".to_string(),
            cache_size: 0,
            cache_timeout: 0,
            max_concurrent_commits: 2,
            ideal_bundle_size: IDEAL_BUNDLE_SIZE,
            next_fixity_duration: NEXT_FIXITY_DURATION.as_secs(),
            fixity_db: "".to_string(),
            tape: true,
            delete_uploads: false,
        }
    }
}

impl Config {
    pub fn cache_timeout(&self) -> Option<Duration> {
        (self.cache_timeout > 0).then(|| Duration::from_secs(self.cache_timeout))
    }

    pub fn next_fixity_duration(&self) -> Duration {
        Duration::from_secs(self.next_fixity_duration.max(1))
    }
}

/// Opens a store described by a location string: empty for a fresh
/// in-memory store, `file:/path` (or `file://path`) for a directory.
/// Other schemes (s3 and friends) belong to external drivers and are
/// rejected here.
pub fn open_location(location: &str) -> CResult<Arc<dyn Store>> {
    if location.is_empty() {
        return Ok(Arc::new(Memory::new()));
    }
    if let Some(path) = location.strip_prefix("file:") {
        let path = path.strip_prefix("//").unwrap_or(path);
        if path.is_empty() {
            return Err(Error::Malformed(format!("bad store location {:?}", location)));
        }
        return Ok(Arc::new(FileSystem::new(path)?));
    }
    Err(Error::Malformed(format!("unsupported store location {:?}", location)))
}
