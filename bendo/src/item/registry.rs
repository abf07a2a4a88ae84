use std::collections::{BTreeSet, HashMap};
use std::io::BufReader;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::bundle::{blob_entry, bundle_key, parse_bundle_key, BundleReader, ITEM_INFO};
use crate::error::{CResult, Error};
use crate::item::{Blob, BlobId, Item, ItemCache};
use crate::store::{SectionReader, Store};

/// The in-process view of all items. Resolution order is the in-memory
/// map, then the optional persistent cache, then a tape load that lists
/// the item's bundle keys and reads `item-info.json` out of the newest
/// one. Tape loads are single-flight per item id: concurrent readers of
/// one id share a single load, readers of distinct ids are independent.
pub struct ItemRegistry {
    store: Arc<dyn Store>,
    mem: RwLock<HashMap<String, Arc<Item>>>,
    cache: Option<Box<dyn ItemCache>>,
    loading: Mutex<HashMap<String, Arc<LoadGate>>>,
}

struct LoadGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl LoadGate {
    fn new() -> Self {
        LoadGate { done: Mutex::new(false), cv: Condvar::new() }
    }

    fn wait(&self) -> CResult<()> {
        let mut done = self.done.lock()?;
        while !*done {
            done = self.cv.wait(done)?;
        }
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut done) = self.done.lock() {
            *done = true;
            self.cv.notify_all();
        }
    }
}

impl ItemRegistry {
    pub fn new(store: Arc<dyn Store>, cache: Option<Box<dyn ItemCache>>) -> Self {
        ItemRegistry {
            store,
            mem: RwLock::new(HashMap::new()),
            cache,
            loading: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying bundle store.
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Returns the current record for `id`, loading it from the newest
    /// bundle if it is not cached. `NoItem` if no bundles exist for it.
    pub fn item(&self, id: &str) -> CResult<Arc<Item>> {
        loop {
            if let Some(item) = self.mem.read()?.get(id) {
                return Ok(item.clone());
            }
            if let Some(cache) = &self.cache {
                if let Some(item) = cache.lookup(id) {
                    let item = Arc::new(item);
                    self.mem.write()?.insert(id.to_string(), item.clone());
                    return Ok(item);
                }
            }

            let (gate, leader) = {
                let mut loading = self.loading.lock()?;
                match loading.get(id) {
                    Some(gate) => (gate.clone(), false),
                    None => {
                        let gate = Arc::new(LoadGate::new());
                        loading.insert(id.to_string(), gate.clone());
                        (gate, true)
                    }
                }
            };
            if !leader {
                // Wait for the in-flight load, then retry from the caches.
                gate.wait()?;
                continue;
            }

            let result: CResult<Arc<Item>> = (|| {
                let item = Arc::new(self.load(id)?);
                self.mem.write()?.insert(id.to_string(), item.clone());
                if let Some(cache) = &self.cache {
                    cache.set(item.as_ref());
                }
                Ok(item)
            })();
            if let Ok(mut loading) = self.loading.lock() {
                loading.remove(id);
            }
            gate.release();
            return result;
        }
    }

    /// Reads the authoritative record off tape.
    fn load(&self, id: &str) -> CResult<Item> {
        let max = self.max_sequence(id)?;
        if max == 0 {
            return Err(Error::NoItem(id.to_string()));
        }
        let reader = BundleReader::open(self.store.as_ref(), &bundle_key(id, max))?;
        let entry = reader.open_entry(ITEM_INFO)?;
        let mut item: Item = serde_json::from_reader(BufReader::new(entry))?;
        if item.id != id {
            log::warn!("bundle {} holds item record for {:?}", bundle_key(id, max), item.id);
            item.id = id.to_string();
        }
        item.max_bundle = max;
        Ok(item)
    }

    /// The largest bundle sequence in the store for `id`, 0 if none.
    pub fn max_sequence(&self, id: &str) -> CResult<u32> {
        let prefix = format!("{}-", id);
        let mut max = 0;
        for key in self.store.list_prefix(&prefix)? {
            if let Some((item, seq)) = parse_bundle_key(&key) {
                if item == id && seq > max {
                    max = seq;
                }
            }
        }
        Ok(max)
    }

    /// Every distinct item id with at least one bundle in the store.
    pub fn list(&self) -> CResult<Vec<String>> {
        let mut ids = BTreeSet::new();
        for key in self.store.list()? {
            if let Some((item, _)) = parse_bundle_key(&key) {
                ids.insert(item.to_string());
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// The blob record for `(id, bid)`. `NoBlob` when the id was never
    /// assigned, `Deleted` when the record exists but the payload has been
    /// tombstoned.
    pub fn blob_info(&self, id: &str, bid: BlobId) -> CResult<Blob> {
        let item = self.item(id)?;
        let blob = item.blob(bid)?;
        if blob.deleted() {
            return Err(Error::Deleted(id.to_string(), bid));
        }
        Ok(blob.clone())
    }

    /// Opens the payload of `(id, bid)` from its bundle.
    pub fn blob(&self, id: &str, bid: BlobId) -> CResult<SectionReader> {
        let blob = self.blob_info(id, bid)?;
        let reader = BundleReader::open(self.store.as_ref(), &bundle_key(id, blob.bundle))?;
        reader.open_entry(&blob_entry(bid))
    }

    /// Installs a freshly written record in the caches. Called by the item
    /// writer after a successful close.
    pub fn set(&self, item: Item) -> CResult<Arc<Item>> {
        if let Some(cache) = &self.cache {
            cache.set(&item);
        }
        let item = Arc::new(item);
        self.mem.write()?.insert(item.id.clone(), item.clone());
        Ok(item)
    }

    /// Drops any cached record for `id`; the next `item` call reloads from
    /// tape.
    pub fn forget(&self, id: &str) -> CResult<()> {
        self.mem.write()?.remove(id);
        if let Some(cache) = &self.cache {
            cache.forget(id);
        }
        Ok(())
    }
}
