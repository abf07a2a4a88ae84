//! The composition root. `Server` owns every subsystem of the storage
//! core: the bundle store and item registry, the upload staging area, the
//! transaction store and its commit pool, the blob cache and content
//! resolver, and the fixity machinery. An HTTP layer sits on top of this
//! and maps the error kinds to status codes; nothing here knows about
//! routes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bundle::{parse_bundle_key, BundleReader};
use crate::cache::{spawn_scanner, BlobCache, StoreLru, TimedCache};
use crate::config::{open_location, Config};
use crate::content::{Content, ContentResolver, CONTENT_WAIT};
use crate::error::{CResult, Error};
use crate::fixity::{Fixity, FixityDb, FixityStatus, FixityTask, SqliteFixity};
use crate::item::{BlobId, Item, ItemRegistry, SlotPath, StoreItemCache};
use crate::store::{prefix::Prefix, Store};
use crate::task::Stopper;
use crate::tx::{commit, Command, CommitEnv, CommitPool, TxRecord, TxStatus, TxStore};
use crate::upload::{FragmentStore, UploadFile};

/// How often the cache scanner runs housekeeping.
const CACHE_SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct Server {
    config: Config,
    store: Arc<dyn Store>,
    registry: Arc<ItemRegistry>,
    uploads: Arc<FragmentStore>,
    txs: Arc<TxStore>,
    cache: Arc<dyn BlobCache>,
    resolver: ContentResolver,
    fixity_db: Arc<dyn FixityDb>,
    fixity: FixityTask,
    tape: Arc<AtomicBool>,
    pool: Mutex<Option<CommitPool>>,
    scan_stopper: Arc<Stopper>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Wires the subsystems together over `store` (the archival backend).
    /// Nothing runs until `start`.
    pub fn new(config: Config, store: Arc<dyn Store>) -> CResult<Server> {
        let tape = Arc::new(AtomicBool::new(config.tape));

        // The cache location backs both the blob cache and the persistent
        // item-record cache, segregated by key prefix.
        let cache_store = open_location(&config.cache_dir)?;
        let item_cache = StoreItemCache::new(Arc::new(Prefix::new(cache_store.clone(), "item:")));
        let blob_store: Arc<dyn Store> = Arc::new(Prefix::new(cache_store, "blob:"));
        let cache: Arc<dyn BlobCache> = match config.cache_timeout() {
            Some(age) => Arc::new(TimedCache::new(blob_store, age)),
            None => Arc::new(StoreLru::new(blob_store, config.cache_size)),
        };

        let registry = Arc::new(ItemRegistry::new(store.clone(), Some(Box::new(item_cache))));
        let uploads = Arc::new(FragmentStore::new(store.clone()));
        let txs = Arc::new(TxStore::new(store.clone()));
        let resolver = ContentResolver::new(registry.clone(), cache.clone(), tape.clone());

        let fixity_db: Arc<dyn FixityDb> = if config.fixity_db.is_empty() {
            Arc::new(SqliteFixity::open(None)?)
        } else {
            Arc::new(SqliteFixity::open(Some(Path::new(&config.fixity_db)))?)
        };
        let fixity = FixityTask::new(
            fixity_db.clone(),
            registry.clone(),
            tape.clone(),
            config.next_fixity_duration(),
        )?;

        Ok(Server {
            config,
            store,
            registry,
            uploads,
            txs,
            cache,
            resolver,
            fixity_db,
            fixity,
            tape,
            pool: Mutex::new(None),
            scan_stopper: Arc::new(Stopper::new()),
            scanner: Mutex::new(None),
        })
    }

    /// Reloads persistent state and spawns the background machinery:
    /// commit workers (requeueing restartable transactions), the fixity
    /// loops, and the cache scanner.
    pub fn start(&self) -> CResult<()> {
        self.uploads.load()?;
        self.txs.load()?;
        self.cache.scan()?;

        let env = CommitEnv {
            txs: self.txs.clone(),
            uploads: self.uploads.clone(),
            registry: self.registry.clone(),
            ideal_bundle_size: self.config.ideal_bundle_size,
            delete_uploads: self.config.delete_uploads,
        };
        let pool = CommitPool::start(self.config.max_concurrent_commits, env.clone())?;
        commit::requeue(&env, &pool)?;
        *self.pool.lock()? = Some(pool);

        self.fixity.start()?;
        let scanner = spawn_scanner(self.cache.clone(), CACHE_SCAN_INTERVAL, self.scan_stopper.clone())?;
        *self.scanner.lock()? = Some(scanner);
        Ok(())
    }

    /// Drains the commit queue and stops every background loop.
    pub fn stop(&self) {
        let pool = self.pool.lock().ok().and_then(|mut p| p.take());
        if let Some(pool) = pool {
            pool.stop();
        }
        self.fixity.stop();
        self.scan_stopper.stop();
        let scanner = self.scanner.lock().ok().and_then(|mut s| s.take());
        if let Some(scanner) = scanner {
            if scanner.join().is_err() {
                log::error!("cache scanner panicked");
            }
        }
    }

    /// Flips the archival store on or off. Readers get `NoStore` while it
    /// is off; the fixity loops back off until it returns.
    pub fn set_tape(&self, enabled: bool) {
        self.tape.store(enabled, Ordering::SeqCst);
    }

    pub fn tape_enabled(&self) -> bool {
        self.tape.load(Ordering::SeqCst)
    }

    // ---- items and content ----

    pub fn item(&self, id: &str) -> CResult<Arc<Item>> {
        if !self.tape_enabled() {
            return Err(Error::NoStore);
        }
        self.registry.item(id)
    }

    pub fn items(&self) -> CResult<Vec<String>> {
        self.registry.list()
    }

    /// Blob content for a GET: waits on an in-flight cache populate up to
    /// the content wait bound.
    pub fn blob_content(&self, id: &str, bid: BlobId) -> CResult<Content> {
        self.resolver.fetch(id, bid, CONTENT_WAIT)
    }

    /// Blob metadata for a HEAD: never waits, never populates the cache.
    pub fn blob_head(&self, id: &str, bid: BlobId) -> CResult<Content> {
        self.resolver.find_content(id, bid, false)
    }

    /// Resolves a slot path (`name`, `@N/name`, `@blob/K`) and returns the
    /// blob id alongside the content.
    pub fn slot_content(&self, id: &str, path: &str) -> CResult<(BlobId, Content)> {
        let path = SlotPath::parse(path)?;
        let bid = self.item(id)?.blob_for_path(&path)?;
        Ok((bid, self.blob_content(id, bid)?))
    }

    pub fn slot_head(&self, id: &str, path: &str) -> CResult<(BlobId, Content)> {
        let path = SlotPath::parse(path)?;
        let bid = self.item(id)?.blob_for_path(&path)?;
        Ok((bid, self.blob_head(id, bid)?))
    }

    pub fn registry(&self) -> &Arc<ItemRegistry> {
        &self.registry
    }

    // ---- uploads ----

    /// Creates an upload under a server-assigned name.
    pub fn new_upload(&self, creator: &str) -> CResult<Arc<UploadFile>> {
        loop {
            let id = format!("u{:08x}", rand::random::<u32>());
            if let Some(file) = self.uploads.create(&id, creator)? {
                return Ok(file);
            }
        }
    }

    pub fn uploads(&self) -> &Arc<FragmentStore> {
        &self.uploads
    }

    pub fn upload(&self, id: &str) -> Option<Arc<UploadFile>> {
        self.uploads.lookup(id)
    }

    // ---- transactions ----

    /// Creates a transaction for `item`, attaches the command list, and
    /// queues it for the commit workers. Blocks briefly when the queue is
    /// at capacity.
    pub fn create_transaction(
        &self,
        item: &str,
        creator: &str,
        commands: Vec<Command>,
    ) -> CResult<String> {
        let tx = self.txs.create(item, creator)?;
        tx.modify(|r| {
            r.commands = commands;
            r.status = TxStatus::Waiting;
        })?;
        let id = tx.id().to_string();
        let pool = self.pool.lock()?;
        match pool.as_ref() {
            Some(pool) => pool.enqueue(&id)?,
            None => return Err(Error::Internal("server is not started".to_string())),
        }
        Ok(id)
    }

    pub fn transaction(&self, id: &str) -> CResult<Option<TxRecord>> {
        match self.txs.get(id) {
            Some(tx) => Ok(Some(tx.record()?)),
            None => Ok(None),
        }
    }

    pub fn transactions(&self) -> CResult<Vec<String>> {
        self.txs.list()
    }

    /// Best-effort cancellation; a transaction already running finishes.
    pub fn cancel_transaction(&self, id: &str) -> CResult<()> {
        self.txs.delete(id)
    }

    // ---- fixity ----

    pub fn fixity_db(&self) -> &Arc<dyn FixityDb> {
        &self.fixity_db
    }

    /// Books an immediate fixity check for an item.
    pub fn schedule_fixity(&self, item: &str) -> CResult<i64> {
        self.fixity_db.update_fixity(&Fixity {
            id: 0,
            item: item.to_string(),
            scheduled_time: chrono::Utc::now(),
            status: FixityStatus::Scheduled,
            notes: String::new(),
        })
    }

    // ---- raw bundle access ----

    pub fn bundles(&self, prefix: &str) -> CResult<Vec<String>> {
        if !self.tape_enabled() {
            return Err(Error::NoStore);
        }
        let mut keys: Vec<String> = self
            .store
            .list_prefix(prefix)?
            .into_iter()
            .filter(|k| parse_bundle_key(k).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn open_bundle(&self, key: &str) -> CResult<BundleReader> {
        if !self.tape_enabled() {
            return Err(Error::NoStore);
        }
        BundleReader::open(self.store.as_ref(), key)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
