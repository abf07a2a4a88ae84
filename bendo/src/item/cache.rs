use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CResult, Error};
use crate::item::Item;
use crate::store::{get_bytes, replace_bytes, Store};

/// A cache of item records, consulted by the registry before falling back
/// to a tape load. Implementations must tolerate concurrent use; a miss is
/// never an error.
pub trait ItemCache: Send + Sync {
    fn lookup(&self, id: &str) -> Option<Item>;
    fn set(&self, item: &Item);
    fn forget(&self, id: &str);
}

/// A process-local item cache.
pub struct MemoryItemCache {
    items: RwLock<HashMap<String, Item>>,
}

impl MemoryItemCache {
    pub fn new() -> Self {
        MemoryItemCache { items: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryItemCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemCache for MemoryItemCache {
    fn lookup(&self, id: &str) -> Option<Item> {
        self.items.read().ok()?.get(id).cloned()
    }

    fn set(&self, item: &Item) {
        if let Ok(mut items) = self.items.write() {
            items.insert(item.id.clone(), item.clone());
        }
    }

    fn forget(&self, id: &str) {
        if let Ok(mut items) = self.items.write() {
            items.remove(id);
        }
    }
}

/// An item cache persisted as JSON rows in a store, one key per item.
/// Survives restarts, so a warm process never touches tape to answer
/// metadata requests. Decode failures are treated as misses; the registry
/// falls through to the bundles, which stay authoritative.
pub struct StoreItemCache {
    store: Arc<dyn Store>,
}

impl StoreItemCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        StoreItemCache { store }
    }

    fn try_lookup(&self, id: &str) -> CResult<Item> {
        let raw = get_bytes(self.store.as_ref(), id)?;
        let item: Item = serde_json::from_slice(&raw)?;
        Ok(item)
    }
}

impl ItemCache for StoreItemCache {
    fn lookup(&self, id: &str) -> Option<Item> {
        match self.try_lookup(id) {
            Ok(item) => Some(item),
            Err(Error::NoKey(_)) => None,
            Err(err) => {
                log::warn!("item cache entry {} unreadable: {}", id, err);
                None
            }
        }
    }

    fn set(&self, item: &Item) {
        let raw = match serde_json::to_vec(item) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("cannot encode item {} for cache: {}", item.id, err);
                return;
            }
        };
        if let Err(err) = replace_bytes(self.store.as_ref(), &item.id, &raw) {
            log::warn!("cannot cache item {}: {}", item.id, err);
        }
    }

    fn forget(&self, id: &str) {
        match self.store.delete(id) {
            Ok(()) | Err(Error::NoKey(_)) => {}
            Err(err) => log::warn!("cannot drop cached item {}: {}", id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Memory;
    use crate::store::put_bytes;

    #[test]
    fn memory_cache() {
        let cache = MemoryItemCache::new();
        assert!(cache.lookup("a").is_none());
        let item = Item::new("a");
        cache.set(&item);
        assert_eq!(cache.lookup("a"), Some(item));
        cache.forget("a");
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn store_cache_round_trip() {
        let cache = StoreItemCache::new(Arc::new(Memory::new()));
        let mut item = Item::new("a");
        item.max_bundle = 3;
        cache.set(&item);
        assert_eq!(cache.lookup("a"), Some(item));
        cache.forget("a");
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn store_cache_treats_garbage_as_miss() -> CResult<()> {
        let store: Arc<dyn Store> = Arc::new(Memory::new());
        put_bytes(store.as_ref(), "a", b"not json")?;
        let cache = StoreItemCache::new(store);
        assert!(cache.lookup("a").is_none());
        Ok(())
    }
}
