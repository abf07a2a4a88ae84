use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::Utc;

use crate::bundle::{blob_entry, bundle_key, BundleReader, BundleWriter, ITEM_INFO};
use crate::error::{CResult, Error};
use crate::item::{Blob, BlobId, Item, ItemRegistry, Version};
use crate::store::Store;

/// Default rotation threshold for bundle payloads, 500 MB (base 10).
pub const IDEAL_BUNDLE_SIZE: u64 = 500_000_000;

/// Opens an item for one new version. The writer buffers the version
/// (starting from the previous version's slot map) and a deferred deletion
/// list, and streams new blob payloads into a chain of bundles, rotating
/// whenever the active bundle passes the ideal size. Everything becomes
/// visible atomically at `close`; until then the old bundles stay
/// authoritative.
///
/// A writer is not safe for concurrent use, and there must be at most one
/// open writer per item: commits for one item are serialized upstream by
/// the transaction store.
pub struct ItemWriter<'a> {
    registry: &'a ItemRegistry,
    store: Arc<dyn Store>,
    item: Item,
    version: Version,
    deletions: BTreeSet<BlobId>,
    bw: Option<BundleWriter>,
    next_blob: BlobId,
    next_seq: u32,
    ideal_size: u64,
}

impl<'a> ItemWriter<'a> {
    /// Opens `id` for a new version by `creator`. The item is created on
    /// the spot if this is its first commit.
    pub fn open(registry: &'a ItemRegistry, id: &str, creator: &str) -> CResult<Self> {
        crate::item::valid_item_id(id)?;
        let item = match registry.item(id) {
            Ok(item) => (*item).clone(),
            Err(Error::NoItem(_)) => Item::new(id),
            Err(err) => return Err(err),
        };
        let slots = item.versions.last().map(|v| v.slots.clone()).unwrap_or_default();
        let version = Version {
            id: item.versions.len() as u32 + 1,
            save_date: Utc::now(),
            creator: creator.to_string(),
            note: String::new(),
            slots,
        };
        let next_blob = item.blobs.last().map(|b| b.id + 1).unwrap_or(1);
        // Skip past any dangling bundles a previously failed close left
        // behind, not just the referenced ones.
        let next_seq = item.max_bundle.max(registry.max_sequence(id)?) + 1;
        Ok(ItemWriter {
            registry,
            store: registry.store(),
            item,
            version,
            deletions: BTreeSet::new(),
            bw: None,
            next_blob,
            next_seq,
            ideal_size: IDEAL_BUNDLE_SIZE,
        })
    }

    /// Overrides the bundle rotation threshold.
    pub fn set_ideal_size(&mut self, size: u64) {
        self.ideal_size = size.max(1);
    }

    /// The active bundle writer, rotating or opening one as needed.
    fn bundle(&mut self) -> CResult<&mut BundleWriter> {
        if self.bw.as_ref().map_or(false, |bw| bw.size() >= self.ideal_size) {
            self.finish_bundle()?;
        }
        if self.bw.is_none() {
            let bw = BundleWriter::new(self.store.clone(), &self.item.id, self.next_seq)?;
            self.next_seq += 1;
            self.bw = Some(bw);
        }
        match self.bw.as_mut() {
            Some(bw) => Ok(bw),
            None => Err(Error::Internal("bundle writer vanished".to_string())),
        }
    }

    /// Finishes the active bundle: serializes the current item record as
    /// its last stream and commits it to the store.
    fn finish_bundle(&mut self) -> CResult<()> {
        let mut bw = match self.bw.take() {
            Some(bw) => bw,
            None => return Ok(()),
        };
        self.item.max_bundle = bw.sequence();
        self.item.update_byte_count();
        let raw = serde_json::to_vec(&self.item)?;
        bw.make_stream(ITEM_INFO)?;
        bw.write_all(&raw).map_err(Error::from)?;
        bw.end_stream()?;
        bw.close()
    }

    /// Streams a new blob into the item and returns its id.
    ///
    /// When the size and at least one digest are supplied and a live blob
    /// of this item already matches them, that blob's id is returned and
    /// `r` is never read. Otherwise the content is streamed into the
    /// active bundle with online hashing, and any supplied expectation
    /// that disagrees with what was observed fails the write with
    /// `HashMismatch`. A failed write burns its blob id: the id is
    /// recorded as tombstoned so ids stay contiguous, and is never reused,
    /// since the entry name may already exist in the bundle.
    pub fn write_blob(
        &mut self,
        r: &mut dyn Read,
        size: Option<u64>,
        md5: Option<Vec<u8>>,
        sha256: Option<Vec<u8>>,
    ) -> CResult<BlobId> {
        if let Some(size) = size {
            if let Some(blob) = self.item.blob_by_hash(size, md5.as_deref(), sha256.as_deref()) {
                return Ok(blob.id);
            }
        }

        let bid = self.next_blob;
        self.next_blob += 1;

        let bw = self.bundle()?;
        bw.make_stream(&blob_entry(bid))?;
        std::io::copy(r, bw).map_err(Error::from)?;
        let (count, observed_md5, observed_sha256) = bw.end_stream()?;
        let sequence = bw.sequence();

        let mut mismatch = None;
        if let Some(expect) = size {
            if expect != count {
                mismatch = Some(format!("blob {}: expected {} bytes, wrote {}", bid, expect, count));
            }
        }
        if let Some(expect) = &md5 {
            if *expect != observed_md5 {
                mismatch = Some(format!("blob {}: MD5 does not match the supplied digest", bid));
            }
        }
        if let Some(expect) = &sha256 {
            if *expect != observed_sha256 {
                mismatch = Some(format!("blob {}: SHA-256 does not match the supplied digest", bid));
            }
        }
        if let Some(msg) = mismatch {
            self.item.blobs.push(Blob {
                id: bid,
                bundle: 0,
                size: 0,
                md5: Vec::new(),
                sha256: Vec::new(),
                mime_type: String::new(),
                save_date: Utc::now(),
                creator: self.version.creator.clone(),
                delete_date: Some(Utc::now()),
                deleter: self.version.creator.clone(),
                delete_note: "write failed verification".to_string(),
            });
            return Err(Error::HashMismatch(msg));
        }

        self.item.blobs.push(Blob {
            id: bid,
            bundle: sequence,
            size: count,
            md5: observed_md5,
            sha256: observed_sha256,
            mime_type: String::new(),
            save_date: Utc::now(),
            creator: self.version.creator.clone(),
            delete_date: None,
            deleter: String::new(),
            delete_note: String::new(),
        });
        Ok(bid)
    }

    /// Binds `name` to `bid` in the new version; 0 removes the binding.
    pub fn set_slot(&mut self, name: &str, bid: BlobId) -> CResult<()> {
        if bid == 0 {
            self.version.slots.remove(name);
            return Ok(());
        }
        let blob = self.item.blob(bid)?;
        if blob.deleted() {
            return Err(Error::Deleted(self.item.id.clone(), bid));
        }
        self.version.slots.insert(name.to_string(), bid);
        Ok(())
    }

    /// Empties the new version's slot map.
    pub fn clear_slots(&mut self) {
        self.version.slots.clear();
    }

    pub fn set_note(&mut self, note: &str) {
        self.version.note = note.to_string();
    }

    pub fn set_creator(&mut self, creator: &str) {
        self.version.creator = creator.to_string();
    }

    /// Updates a blob's mime type; silently ignored for deleted blobs.
    pub fn set_mime_type(&mut self, bid: BlobId, mime_type: &str) -> CResult<()> {
        let blob = self.item.blob_mut(bid)?;
        if !blob.deleted() {
            blob.mime_type = mime_type.to_string();
        }
        Ok(())
    }

    /// Schedules a blob for deletion; applied at close.
    pub fn delete_blob(&mut self, bid: BlobId) -> CResult<()> {
        if !self.item.blob(bid)?.deleted() {
            self.deletions.insert(bid);
        }
        Ok(())
    }

    /// Commits the new version. Appends the version, repacks the bundles
    /// affected by deletions (copying every surviving blob into the active
    /// bundle and validating it against its recorded digests), tombstones
    /// the deleted blobs, writes the final item record, deletes the
    /// repacked source bundles, and refreshes the registry caches.
    ///
    /// On error the store may hold unreferenced new bundles, but the old
    /// bundles remain authoritative and nothing is deleted.
    pub fn close(mut self) -> CResult<Arc<Item>> {
        self.version.save_date = Utc::now();
        self.item.versions.push(self.version.clone());

        // Bundles to rewrite. A blob sitting in the still-open bundle
        // cannot be repacked; it is tombstoned in place and its payload
        // stays behind as an unreferenced entry.
        let open_sequence = self.bw.as_ref().map(|bw| bw.sequence());
        let mut affected = BTreeSet::new();
        for &bid in &self.deletions {
            let bundle = self.item.blob(bid)?.bundle;
            if bundle > 0 && Some(bundle) != open_sequence {
                affected.insert(bundle);
            }
        }

        for &sequence in &affected {
            let source = BundleReader::open(self.store.as_ref(), &bundle_key(&self.item.id, sequence))?;
            let survivors: Vec<BlobId> = self
                .item
                .blobs
                .iter()
                .filter(|b| b.bundle == sequence && !self.deletions.contains(&b.id))
                .map(|b| b.id)
                .collect();
            for bid in survivors {
                let mut entry = source.open_entry(&blob_entry(bid))?;
                let bw = self.bundle()?;
                bw.make_stream(&blob_entry(bid))?;
                std::io::copy(&mut entry, bw).map_err(Error::from)?;
                let (count, md5, sha256) = bw.end_stream()?;
                let new_sequence = bw.sequence();

                let item_id = self.item.id.clone();
                let blob = self.item.blob_mut(bid)?;
                if count != blob.size || md5 != blob.md5 || sha256 != blob.sha256 {
                    return Err(Error::HashMismatch(format!(
                        "blob {} of item {} does not match its recorded digests",
                        bid, item_id
                    )));
                }
                blob.bundle = new_sequence;
            }
        }

        let now = Utc::now();
        let deletions = std::mem::take(&mut self.deletions);
        for &bid in &deletions {
            let deleter = self.version.creator.clone();
            let note = self.version.note.clone();
            let blob = self.item.blob_mut(bid)?;
            blob.bundle = 0;
            blob.size = 0;
            blob.md5.clear();
            blob.sha256.clear();
            blob.delete_date = Some(now);
            blob.deleter = deleter;
            blob.delete_note = note;
        }

        // Every commit produces at least one bundle so the new version's
        // item record lands on tape.
        if self.bw.is_none() {
            self.bundle()?;
        }
        self.finish_bundle()?;

        for sequence in affected {
            let key = bundle_key(&self.item.id, sequence);
            if let Err(err) = self.store.delete(&key) {
                log::warn!("cannot delete repacked bundle {}: {}", key, err);
            }
        }

        self.registry.set(self.item)
    }
}
