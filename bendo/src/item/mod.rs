//! The item model: blobs, versions, slots. An item is a versioned
//! directory; each version is an immutable snapshot of slot names bound to
//! blob ids, and each blob is an immutable byte sequence deduplicated by
//! hash within its item. The serialized form here is the `item-info.json`
//! entry embedded in every bundle.

pub mod cache;
pub mod registry;
pub mod writer;

pub use cache::{ItemCache, MemoryItemCache, StoreItemCache};
pub use registry::ItemRegistry;
pub use writer::ItemWriter;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::hash::hexbytes;

/// Blob ids are positive and contiguous from 1 within an item; a deleted
/// blob keeps its id forever, so ids are never reused.
pub type BlobId = u32;

/// Version ids are positive and strictly increasing from 1 within an item.
pub type VersionId = u32;

/// One immutable byte sequence belonging to an item. A tombstoned blob has
/// `size == 0`, `bundle == 0`, empty digests, and the delete fields set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "BlobID")]
    pub id: BlobId,

    /// The sequence number of the bundle holding the payload; 0 iff the
    /// blob has been deleted.
    #[serde(rename = "Bundle")]
    pub bundle: u32,

    #[serde(rename = "ByteCount")]
    pub size: u64,

    #[serde(rename = "MD5", with = "hexbytes", default, skip_serializing_if = "Vec::is_empty")]
    pub md5: Vec<u8>,

    #[serde(rename = "SHA256", with = "hexbytes", default, skip_serializing_if = "Vec::is_empty")]
    pub sha256: Vec<u8>,

    #[serde(rename = "MimeType", default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,

    #[serde(rename = "SaveDate")]
    pub save_date: DateTime<Utc>,

    #[serde(rename = "Creator")]
    pub creator: String,

    #[serde(rename = "DeleteDate", default, skip_serializing_if = "Option::is_none")]
    pub delete_date: Option<DateTime<Utc>>,

    #[serde(rename = "Deleter", default, skip_serializing_if = "String::is_empty")]
    pub deleter: String,

    #[serde(rename = "DeleteNote", default, skip_serializing_if = "String::is_empty")]
    pub delete_note: String,
}

impl Blob {
    /// Whether the payload has been tombstoned.
    pub fn deleted(&self) -> bool {
        self.bundle == 0
    }
}

/// One immutable snapshot of slot bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    #[serde(rename = "VersionID")]
    pub id: VersionId,

    #[serde(rename = "SaveDate")]
    pub save_date: DateTime<Utc>,

    #[serde(rename = "Creator")]
    pub creator: String,

    #[serde(rename = "Note", default, skip_serializing_if = "String::is_empty")]
    pub note: String,

    #[serde(rename = "Slots", default)]
    pub slots: std::collections::BTreeMap<String, BlobId>,
}

/// The complete record of one item: its blobs and versions in id order.
/// The copy inside an item's newest bundle is authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "ItemID")]
    pub id: String,

    /// Total size of all live (non-deleted) blobs.
    #[serde(rename = "ByteCount")]
    pub byte_count: u64,

    /// The largest bundle sequence number in the store for this item.
    #[serde(rename = "MaxBundle")]
    pub max_bundle: u32,

    #[serde(rename = "Versions", default)]
    pub versions: Vec<Version>,

    #[serde(rename = "Blobs", default)]
    pub blobs: Vec<Blob>,
}

impl Item {
    pub fn new(id: impl Into<String>) -> Self {
        Item { id: id.into(), byte_count: 0, max_bundle: 0, versions: Vec::new(), blobs: Vec::new() }
    }

    /// The blob record for `bid`, deleted or not. Blobs are kept sorted by
    /// id, so this is a binary search.
    pub fn blob(&self, bid: BlobId) -> CResult<&Blob> {
        self.blobs
            .binary_search_by_key(&bid, |b| b.id)
            .map(|i| &self.blobs[i])
            .map_err(|_| Error::NoBlob(self.id.clone(), bid))
    }

    pub fn blob_mut(&mut self, bid: BlobId) -> CResult<&mut Blob> {
        match self.blobs.binary_search_by_key(&bid, |b| b.id) {
            Ok(i) => Ok(&mut self.blobs[i]),
            Err(_) => Err(Error::NoBlob(self.id.clone(), bid)),
        }
    }

    /// Finds a live blob matching the given size and digests, the dedup
    /// path of `write_blob`. At least one digest must be provided; a blob
    /// matches when the size and every provided digest agree.
    pub fn blob_by_hash(&self, size: u64, md5: Option<&[u8]>, sha256: Option<&[u8]>) -> Option<&Blob> {
        if md5.is_none() && sha256.is_none() {
            return None;
        }
        self.blobs.iter().find(|b| {
            !b.deleted()
                && b.size == size
                && md5.map_or(true, |h| b.md5 == h)
                && sha256.map_or(true, |h| b.sha256 == h)
        })
    }

    /// The version record for `vid`; 0 means the newest version.
    pub fn version(&self, vid: VersionId) -> CResult<&Version> {
        let vid = if vid == 0 { self.versions.len() as VersionId } else { vid };
        if vid == 0 || vid as usize > self.versions.len() {
            return Err(Error::NoItem(format!("{}/@{}", self.id, vid)));
        }
        Ok(&self.versions[vid as usize - 1])
    }

    /// Resolves a slot path to a blob id.
    pub fn blob_for_path(&self, path: &SlotPath) -> CResult<BlobId> {
        match path {
            SlotPath::Blob(bid) => {
                self.blob(*bid)?;
                Ok(*bid)
            }
            SlotPath::Slot(vid, name) => {
                let version = self.version(*vid)?;
                version
                    .slots
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::NoSlot(format!("{}/{}", self.id, name)))
            }
        }
    }

    /// Recomputes the live byte total.
    pub fn update_byte_count(&mut self) {
        self.byte_count = self.blobs.iter().filter(|b| !b.deleted()).map(|b| b.size).sum();
    }
}

/// Validates an item id: non-empty, and free of `-` so bundle keys parse
/// unambiguously.
pub fn valid_item_id(id: &str) -> CResult<()> {
    if id.is_empty() || id.contains('-') {
        return Err(Error::Malformed(format!("invalid item id {:?}", id)));
    }
    Ok(())
}

/// An address inside an item, parsed from a request path.
///
/// * `name`      is slot `name` in the newest version
/// * `@N/name`   is slot `name` in version `N` (0 means newest)
/// * `@blob/K`   is blob `K` directly
#[derive(Clone, Debug, PartialEq)]
pub enum SlotPath {
    Blob(BlobId),
    Slot(VersionId, String),
}

impl SlotPath {
    pub fn parse(path: &str) -> CResult<SlotPath> {
        let Some(rest) = path.strip_prefix('@') else {
            if path.is_empty() {
                return Err(Error::Malformed("empty slot path".to_string()));
            }
            return Ok(SlotPath::Slot(0, path.to_string()));
        };
        if let Some(bid) = rest.strip_prefix("blob/") {
            let bid: BlobId = bid
                .parse()
                .map_err(|_| Error::Malformed(format!("bad blob id in path @{}", rest)))?;
            return Ok(SlotPath::Blob(bid));
        }
        match rest.split_once('/') {
            Some((version, name)) if !name.is_empty() => {
                let vid: VersionId = version
                    .parse()
                    .map_err(|_| Error::Malformed(format!("bad version in path @{}", rest)))?;
                Ok(SlotPath::Slot(vid, name.to_string()))
            }
            _ => Err(Error::Malformed(format!("bad slot path @{}", rest))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> Item {
        let date = "2026-03-01T12:00:00Z".parse().unwrap();
        let mut item = Item::new("zxcv");
        item.blobs.push(Blob {
            id: 1,
            bundle: 1,
            size: 11,
            md5: hex::decode("5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap(),
            sha256: hex::decode("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                .unwrap(),
            mime_type: "text/plain".into(),
            save_date: date,
            creator: "tester".into(),
            delete_date: None,
            deleter: String::new(),
            delete_note: String::new(),
        });
        item.versions.push(Version {
            id: 1,
            save_date: date,
            creator: "tester".into(),
            note: String::new(),
            slots: [("greeting".to_string(), 1)].into_iter().collect(),
        });
        item.max_bundle = 1;
        item.update_byte_count();
        item
    }

    #[test]
    fn json_round_trip() -> CResult<()> {
        let item = fixture();
        let json = serde_json::to_string(&item)?;
        // Digests serialize as hex under the canonical field names.
        assert!(json.contains("\"MD5\":\"5eb63bbbe01eeed093cb22bb8f5acdc3\""));
        assert!(json.contains("\"ItemID\":\"zxcv\""));
        let back: Item = serde_json::from_str(&json)?;
        assert_eq!(back, item);
        Ok(())
    }

    #[test]
    fn deleted_blob_omits_digests() -> CResult<()> {
        let mut item = fixture();
        let blob = item.blob_mut(1)?;
        blob.bundle = 0;
        blob.size = 0;
        blob.md5.clear();
        blob.sha256.clear();
        blob.delete_date = Some(Utc::now());
        blob.deleter = "tester".into();

        let json = serde_json::to_string(&item)?;
        assert!(!json.contains("\"MD5\""));
        let back: Item = serde_json::from_str(&json)?;
        assert!(back.blob(1)?.deleted());
        Ok(())
    }

    #[test]
    fn blob_lookup() -> CResult<()> {
        let item = fixture();
        assert_eq!(item.blob(1)?.id, 1);
        assert_eq!(item.blob(0).err(), Some(Error::NoBlob("zxcv".into(), 0)));
        assert_eq!(item.blob(2).err(), Some(Error::NoBlob("zxcv".into(), 2)));
        Ok(())
    }

    #[test]
    fn blob_by_hash_matches_live_blobs_only() -> CResult<()> {
        let mut item = fixture();
        let md5 = item.blob(1)?.md5.clone();

        assert_eq!(item.blob_by_hash(11, Some(&md5), None).map(|b| b.id), Some(1));
        // Wrong size, no match.
        assert_eq!(item.blob_by_hash(12, Some(&md5), None), None);
        // No digest given, no match even if the size agrees.
        assert_eq!(item.blob_by_hash(11, None, None), None);

        let blob = item.blob_mut(1)?;
        blob.bundle = 0;
        blob.size = 0;
        assert_eq!(item.blob_by_hash(11, Some(&md5), None), None);
        Ok(())
    }

    #[test]
    fn slot_paths() -> CResult<()> {
        assert_eq!(SlotPath::parse("a/b.txt")?, SlotPath::Slot(0, "a/b.txt".into()));
        assert_eq!(SlotPath::parse("@3/a/b.txt")?, SlotPath::Slot(3, "a/b.txt".into()));
        assert_eq!(SlotPath::parse("@0/x")?, SlotPath::Slot(0, "x".into()));
        assert_eq!(SlotPath::parse("@blob/12")?, SlotPath::Blob(12));
        assert!(SlotPath::parse("").is_err());
        assert!(SlotPath::parse("@x/name").is_err());
        assert!(SlotPath::parse("@2/").is_err());
        assert!(SlotPath::parse("@blob/abc").is_err());
        Ok(())
    }

    #[test]
    fn path_resolution() -> CResult<()> {
        let item = fixture();
        assert_eq!(item.blob_for_path(&SlotPath::parse("greeting")?)?, 1);
        assert_eq!(item.blob_for_path(&SlotPath::parse("@1/greeting")?)?, 1);
        assert_eq!(item.blob_for_path(&SlotPath::parse("@blob/1")?)?, 1);
        assert!(matches!(
            item.blob_for_path(&SlotPath::parse("missing")?),
            Err(Error::NoSlot(_))
        ));
        Ok(())
    }

    #[test]
    fn item_ids() {
        assert!(valid_item_id("zxcv").is_ok());
        assert!(valid_item_id("").is_err());
        assert!(valid_item_id("a-b").is_err());
    }
}
