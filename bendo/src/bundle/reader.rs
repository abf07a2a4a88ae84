use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use zip::CompressionMethod;

use crate::bundle::{Checksum, DATA_PREFIX};
use crate::error::{CResult, Error};
use crate::hash::hash_stream;
use crate::store::{ReadAt, SectionReader, Store};

/// Read access to one bundle. The archive index and the bag manifests are
/// parsed once at open; after that `checksum` is a map lookup and
/// `open_entry` hands out an independent byte-range reader, so any number
/// of entries can be streamed concurrently off one open.
pub struct BundleReader {
    key: String,
    src: Arc<dyn ReadAt>,
    entries: BTreeMap<String, Entry>,
    checksums: BTreeMap<String, Checksum>,
}

struct Entry {
    size: u64,
    offset: u64,
    stored: bool,
}

impl BundleReader {
    /// Opens the bundle stored under `key` and parses its index.
    pub fn open(store: &dyn Store, key: &str) -> CResult<Self> {
        let (src, size) = store.open(key)?;
        let mut zip = zip::ZipArchive::new(SectionReader::new(src.clone(), 0, size))?;

        let mut entries = BTreeMap::new();
        let mut md5s: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut sha256s: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let name = file.name().to_string();
            if let Some(logical) = name.strip_prefix(DATA_PREFIX) {
                entries.insert(
                    logical.to_string(),
                    Entry {
                        size: file.size(),
                        offset: file.data_start(),
                        stored: file.compression() == CompressionMethod::Stored,
                    },
                );
            } else if name == "manifest-md5.txt" {
                parse_manifest(&mut file, &mut md5s)?;
            } else if name == "manifest-sha256.txt" {
                parse_manifest(&mut file, &mut sha256s)?;
            }
            // bagit.txt and any other tag files carry no per-entry state.
        }

        let mut checksums: BTreeMap<String, Checksum> = BTreeMap::new();
        for (name, md5) in md5s {
            checksums.entry(name).or_default().md5 = md5;
        }
        for (name, sha256) in sha256s {
            checksums.entry(name).or_default().sha256 = sha256;
        }

        Ok(BundleReader { key: key.to_string(), src, entries, checksums })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The logical entry names in the bundle (`item-info.json`, `blob/<id>`).
    pub fn files(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// The recorded digests for an entry. O(1) after open.
    pub fn checksum(&self, name: &str) -> Option<&Checksum> {
        self.checksums.get(name)
    }

    /// The size in bytes of an entry.
    pub fn entry_size(&self, name: &str) -> Option<u64> {
        self.entries.get(name).map(|e| e.size)
    }

    /// Opens an entry for reading. The reader is independent of this
    /// `BundleReader` and of any other open entry.
    pub fn open_entry(&self, name: &str) -> CResult<SectionReader> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::NoKey(format!("{}/{}", self.key, name)))?;
        if !entry.stored {
            // Bundles are always written with stored entries; anything else
            // is foreign or corrupt.
            return Err(Error::Validation(vec![format!(
                "entry {} in {} uses an unsupported compression method",
                name, self.key
            )]));
        }
        Ok(SectionReader::new(self.src.clone(), entry.offset, entry.size))
    }

    /// Streams every entry and compares the observed digests against the
    /// manifests. Returns `Validation` carrying one message per problem:
    /// mismatched digests, entries missing a manifest line, and manifest
    /// lines naming missing entries.
    pub fn verify(&self) -> CResult<()> {
        let mut problems = Vec::new();
        for (name, entry) in &self.entries {
            let reader = self.open_entry(name)?;
            let (count, md5, sha256) = hash_stream(reader)?;
            if count != entry.size {
                problems.push(format!("entry {} read {} of {} bytes", name, count, entry.size));
                continue;
            }
            match self.checksums.get(name) {
                None => problems.push(format!("entry {} has no manifest entry", name)),
                Some(expect) => {
                    if !expect.md5.is_empty() && expect.md5 != md5 {
                        problems.push(format!("entry {} failed its MD5 check", name));
                    }
                    if !expect.sha256.is_empty() && expect.sha256 != sha256 {
                        problems.push(format!("entry {} failed its SHA-256 check", name));
                    }
                }
            }
        }
        for name in self.checksums.keys() {
            if !self.entries.contains_key(name) {
                problems.push(format!("manifest names missing entry {}", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(problems))
        }
    }
}

/// Parses a BagIt manifest: one `<hex-digest> <path>` pair per line. Only
/// payload paths (under `data/`) are kept, recorded by logical name.
fn parse_manifest<R: Read>(r: &mut R, out: &mut BTreeMap<String, Vec<u8>>) -> CResult<()> {
    let mut text = String::new();
    r.read_to_string(&mut text)?;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (digest, path) = match (fields.next(), fields.next()) {
            (Some(digest), Some(path)) => (digest, path),
            _ => continue,
        };
        if let Some(logical) = path.strip_prefix(DATA_PREFIX) {
            let digest = hex::decode(digest)
                .map_err(|err| Error::Parse(format!("bad manifest digest: {}", err)))?;
            out.insert(logical.to_string(), digest);
        }
    }
    Ok(())
}
