//! The bundle codec. A bundle is the immutable on-disk unit of an item:
//! a zip archive holding the item's serialized metadata and a subset of its
//! blob payloads, laid out as a bag with per-entry MD5 and SHA-256
//! manifests. Bundles are written once and never modified; deletions are
//! realized by rewriting survivors into a bundle with a higher sequence.

pub mod reader;
pub mod writer;

pub use reader::BundleReader;
pub use writer::BundleWriter;

/// The entry holding the item's serialized metadata. The newest bundle's
/// copy is authoritative for the whole item.
pub const ITEM_INFO: &str = "item-info.json";

/// Payload entries live under this directory inside the archive; manifest
/// and bag declaration files sit beside it at the root.
pub(crate) const DATA_PREFIX: &str = "data/";

/// Digests recorded in a bundle's manifests for one entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Checksum {
    pub md5: Vec<u8>,
    pub sha256: Vec<u8>,
}

/// The store key of a bundle: the item id followed by the zero-padded
/// sequence number, e.g. `abc-0004`.
pub fn bundle_key(item: &str, sequence: u32) -> String {
    format!("{}-{:04}", item, sequence)
}

/// Splits a store key into item id and bundle sequence. The split is on the
/// last `-`; keys whose suffix is not exactly four decimal digits are not
/// bundles (item ids themselves never contain `-`).
pub fn parse_bundle_key(key: &str) -> Option<(&str, u32)> {
    let (item, suffix) = key.rsplit_once('-')?;
    if item.is_empty() || suffix.len() != 4 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().map(|seq| (item, seq))
}

/// The name of a blob payload entry within a bundle.
pub fn blob_entry(id: u32) -> String {
    format!("blob/{}", id)
}
