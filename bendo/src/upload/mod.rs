//! Staged uploads. Clients deliver a file as a sequence of appended
//! fragments; each fragment is its own key in the store and the aggregate
//! state lives in a metadata record that is persisted before any mutation
//! returns, so the set of uploads survives a restart. An upload holds the
//! client's digest expectations; `verify` replays the content against them
//! before a commit is allowed to ingest it.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::hash::{hash_stream, hexbytes, MD5_LEN, SHA256_LEN};
use crate::store::{get_bytes, open_read, prefix::Prefix, replace_bytes, SectionReader, Store, StoreWriter};

/// Aggregate state of one upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Size")]
    pub size: u64,

    #[serde(rename = "NFragments")]
    pub n_fragments: u32,

    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,

    #[serde(rename = "Modified")]
    pub modified: DateTime<Utc>,

    #[serde(rename = "Creator", default, skip_serializing_if = "String::is_empty")]
    pub creator: String,

    /// The digests the client claims for the complete content; either may
    /// be unset, and unset digests are skipped by `verify`.
    #[serde(rename = "MD5", with = "hexbytes", default, skip_serializing_if = "Vec::is_empty")]
    pub md5: Vec<u8>,

    #[serde(rename = "SHA256", with = "hexbytes", default, skip_serializing_if = "Vec::is_empty")]
    pub sha256: Vec<u8>,

    #[serde(rename = "MimeType", default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,

    #[serde(rename = "Extra", default, skip_serializing_if = "String::is_empty")]
    pub extra: String,

    #[serde(rename = "Labels", default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FragmentInfo {
    #[serde(rename = "Sequence")]
    seq: u32,

    #[serde(rename = "Size")]
    size: u64,
}

/// The persisted metadata record: the aggregate state plus the ordered
/// fragment list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct FileRecord {
    #[serde(flatten)]
    stat: Stat,

    #[serde(rename = "Fragments", default)]
    fragments: Vec<FragmentInfo>,
}

/// The staging area for uploads. Fragments and metadata are segregated in
/// a shared store behind the `f` and `md` key prefixes.
pub struct FragmentStore {
    meta: Arc<dyn Store>,
    frag: Arc<dyn Store>,
    files: RwLock<HashMap<String, Arc<UploadFile>>>,
}

impl FragmentStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        FragmentStore {
            meta: Arc::new(Prefix::new(store.clone(), "md")),
            frag: Arc::new(Prefix::new(store, "f")),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the in-memory index from the metadata records. Called once
    /// at startup; records that fail to decode are skipped with a warning.
    pub fn load(&self) -> CResult<()> {
        let mut files = self.files.write()?;
        for id in self.meta.list()? {
            let record: FileRecord = match get_bytes(self.meta.as_ref(), &id)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(Error::from))
            {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping unreadable upload record {}: {}", id, err);
                    continue;
                }
            };
            files.insert(
                id.clone(),
                Arc::new(UploadFile {
                    id,
                    meta: self.meta.clone(),
                    frag: self.frag.clone(),
                    state: Mutex::new(record),
                }),
            );
        }
        Ok(())
    }

    /// Registers a new upload, or returns None if the id is taken. Ids
    /// share the store namespace with bundle keys, so the characters that
    /// would make a metadata key parse as something else are refused.
    pub fn create(&self, id: &str, creator: &str) -> CResult<Option<Arc<UploadFile>>> {
        if id.is_empty() || id.contains(['-', '+', '/']) {
            return Err(Error::Malformed(format!("invalid upload id {:?}", id)));
        }
        let mut files = self.files.write()?;
        if files.contains_key(id) {
            return Ok(None);
        }
        let now = Utc::now();
        let record = FileRecord {
            stat: Stat {
                id: id.to_string(),
                size: 0,
                n_fragments: 0,
                created: now,
                modified: now,
                creator: creator.to_string(),
                md5: Vec::new(),
                sha256: Vec::new(),
                mime_type: String::new(),
                extra: String::new(),
                labels: Vec::new(),
            },
            fragments: Vec::new(),
        };
        let file = Arc::new(UploadFile {
            id: id.to_string(),
            meta: self.meta.clone(),
            frag: self.frag.clone(),
            state: Mutex::new(record.clone()),
        });
        file.save(&record)?;
        files.insert(id.to_string(), file.clone());
        Ok(Some(file))
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<UploadFile>> {
        self.files.read().ok()?.get(id).cloned()
    }

    /// Removes an upload: the metadata record and every fragment.
    pub fn delete(&self, id: &str) -> CResult<()> {
        let file = {
            let mut files = self.files.write()?;
            files.remove(id)
        };
        let fragments = match file {
            Some(file) => file.state.lock()?.fragments.clone(),
            None => Vec::new(),
        };
        for fragment in fragments {
            match self.frag.delete(&fragment_key(id, fragment.seq)) {
                Ok(()) | Err(Error::NoKey(_)) => {}
                Err(err) => return Err(err),
            }
        }
        match self.meta.delete(id) {
            Ok(()) | Err(Error::NoKey(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Every upload id, sorted.
    pub fn list(&self) -> CResult<Vec<String>> {
        let files = self.files.read()?;
        let mut ids: Vec<String> = files.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// The ids of uploads carrying every one of the required labels.
    pub fn list_filtered(&self, required: &[String]) -> CResult<Vec<String>> {
        let files = self.files.read()?;
        let mut ids: Vec<String> = files
            .iter()
            .filter(|(_, file)| file.has_labels(required))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn fragment_key(id: &str, seq: u32) -> String {
    format!("{}+{:04}", id, seq)
}

/// One staged upload. All mutation persists the metadata record before
/// returning.
pub struct UploadFile {
    id: String,
    meta: Arc<dyn Store>,
    frag: Arc<dyn Store>,
    state: Mutex<FileRecord>,
}

impl UploadFile {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stat(&self) -> CResult<Stat> {
        Ok(self.state.lock()?.stat.clone())
    }

    fn save(&self, record: &FileRecord) -> CResult<()> {
        let raw = serde_json::to_vec(record)?;
        replace_bytes(self.meta.as_ref(), &self.id, &raw)
    }

    fn has_labels(&self, required: &[String]) -> bool {
        match self.state.lock() {
            Ok(state) => required.iter().all(|l| state.stat.labels.contains(l)),
            Err(_) => false,
        }
    }

    /// Begins a new fragment at the end of the file. The fragment joins
    /// the upload when the returned writer is closed; dropping it without
    /// closing discards the bytes.
    pub fn append(self: &Arc<Self>) -> CResult<FragmentWriter> {
        let seq = {
            let state = self.state.lock()?;
            state.fragments.last().map(|f| f.seq + 1).unwrap_or(1)
        };
        let w = self.frag.create(&fragment_key(&self.id, seq))?;
        Ok(FragmentWriter { file: self.clone(), seq, w: Some(w), count: 0 })
    }

    /// A reader over the concatenated fragments, in order. At most one
    /// fragment is open underneath at a time.
    pub fn open(&self) -> CResult<UploadReader> {
        let keys = {
            let state = self.state.lock()?;
            state.fragments.iter().map(|f| fragment_key(&self.id, f.seq)).collect()
        };
        Ok(UploadReader { frag: self.frag.clone(), keys, current: None })
    }

    /// Removes the most recent fragment. Repeated calls peel earlier
    /// fragments; a rollback on an empty upload is a no-op.
    pub fn rollback(&self) -> CResult<()> {
        let mut state = self.state.lock()?;
        let fragment = match state.fragments.pop() {
            Some(fragment) => fragment,
            None => return Ok(()),
        };
        match self.frag.delete(&fragment_key(&self.id, fragment.seq)) {
            Ok(()) | Err(Error::NoKey(_)) => {}
            Err(err) => {
                state.fragments.push(fragment);
                return Err(err);
            }
        }
        state.stat.size -= fragment.size;
        state.stat.n_fragments -= 1;
        state.stat.modified = Utc::now();
        self.save(&state)
    }

    /// Streams the content and compares it against the recorded digests.
    /// Unset digests are skipped; with neither set the upload passes.
    pub fn verify(&self) -> CResult<bool> {
        let (md5, sha256) = {
            let state = self.state.lock()?;
            (state.stat.md5.clone(), state.stat.sha256.clone())
        };
        if md5.is_empty() && sha256.is_empty() {
            return Ok(true);
        }
        let (_, observed_md5, observed_sha256) = hash_stream(self.open()?)?;
        Ok((md5.is_empty() || md5 == observed_md5)
            && (sha256.is_empty() || sha256 == observed_sha256))
    }

    pub fn set_md5(&self, md5: Vec<u8>) -> CResult<()> {
        if md5.len() != MD5_LEN {
            return Err(Error::Malformed(format!("MD5 digest of {} bytes", md5.len())));
        }
        self.mutate(|stat| stat.md5 = md5)
    }

    pub fn set_sha256(&self, sha256: Vec<u8>) -> CResult<()> {
        if sha256.len() != SHA256_LEN {
            return Err(Error::Malformed(format!("SHA-256 digest of {} bytes", sha256.len())));
        }
        self.mutate(|stat| stat.sha256 = sha256)
    }

    pub fn set_creator(&self, creator: &str) -> CResult<()> {
        let creator = creator.to_string();
        self.mutate(|stat| stat.creator = creator)
    }

    pub fn set_mime_type(&self, mime_type: &str) -> CResult<()> {
        let mime_type = mime_type.to_string();
        self.mutate(|stat| stat.mime_type = mime_type)
    }

    pub fn set_extra(&self, extra: &str) -> CResult<()> {
        let extra = extra.to_string();
        self.mutate(|stat| stat.extra = extra)
    }

    /// Replaces the label set; labels are stored sorted and deduplicated.
    pub fn set_labels(&self, mut labels: Vec<String>) -> CResult<()> {
        labels.sort();
        labels.dedup();
        self.mutate(|stat| stat.labels = labels)
    }

    fn mutate(&self, apply: impl FnOnce(&mut Stat)) -> CResult<()> {
        let mut state = self.state.lock()?;
        apply(&mut state.stat);
        state.stat.modified = Utc::now();
        self.save(&state)
    }
}

/// The write half of `append`.
pub struct FragmentWriter {
    file: Arc<UploadFile>,
    seq: u32,
    w: Option<Box<dyn StoreWriter>>,
    count: u64,
}

impl FragmentWriter {
    /// Commits the fragment and folds it into the upload's aggregate
    /// state.
    pub fn close(mut self) -> CResult<()> {
        let w = match self.w.take() {
            Some(w) => w,
            None => return Err(Error::Internal("fragment writer closed twice".to_string())),
        };
        w.close()?;
        let mut state = self.file.state.lock()?;
        state.fragments.push(FragmentInfo { seq: self.seq, size: self.count });
        state.stat.size += self.count;
        state.stat.n_fragments += 1;
        state.stat.modified = Utc::now();
        self.file.save(&state)
    }
}

impl Write for FragmentWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let w = self.w.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "fragment writer closed")
        })?;
        let n = w.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.w.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Sequential reader over an upload's fragments.
pub struct UploadReader {
    frag: Arc<dyn Store>,
    keys: VecDeque<String>,
    current: Option<SectionReader>,
}

impl Read for UploadReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(current) = &mut self.current {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.keys.pop_front() {
                Some(key) => {
                    let reader = open_read(self.frag.as_ref(), &key).map_err(|err| {
                        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
                    })?;
                    self.current = Some(reader);
                }
                None => return Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::Memory;

    fn fixture() -> (Arc<dyn Store>, FragmentStore) {
        let store: Arc<dyn Store> = Arc::new(Memory::new());
        let uploads = FragmentStore::new(store.clone());
        (store, uploads)
    }

    fn append(file: &Arc<UploadFile>, content: &[u8]) -> CResult<()> {
        let mut w = file.append()?;
        w.write_all(content).map_err(Error::from)?;
        w.close()
    }

    fn content(file: &Arc<UploadFile>) -> CResult<Vec<u8>> {
        let mut out = Vec::new();
        file.open()?.read_to_end(&mut out).map_err(Error::from)?;
        Ok(out)
    }

    #[test]
    fn create_lookup_delete() -> CResult<()> {
        let (_, uploads) = fixture();
        let file = uploads.create("u1", "nobody")?.expect("fresh id");
        assert!(uploads.create("u1", "nobody")?.is_none());
        assert!(uploads.create("", "nobody").is_err());
        assert!(uploads.create("u-1", "nobody").is_err());
        assert!(uploads.lookup("u1").is_some());
        assert!(uploads.lookup("u2").is_none());

        append(&file, b"data")?;
        uploads.delete("u1")?;
        assert!(uploads.lookup("u1").is_none());
        // Deleting again is harmless.
        uploads.delete("u1")?;
        Ok(())
    }

    #[test]
    fn append_then_read_concatenates() -> CResult<()> {
        let (_, uploads) = fixture();
        let file = uploads.create("u1", "nobody")?.expect("fresh id");
        append(&file, b"hello world")?;
        append(&file, b" and hello sun")?;

        assert_eq!(content(&file)?, b"hello world and hello sun");
        let stat = file.stat()?;
        assert_eq!(stat.size, 25);
        assert_eq!(stat.n_fragments, 2);
        Ok(())
    }

    #[test]
    fn rollback_peels_fragments() -> CResult<()> {
        let (_, uploads) = fixture();
        let file = uploads.create("u1", "nobody")?.expect("fresh id");
        append(&file, b"one")?;
        append(&file, b"two")?;
        append(&file, b"three")?;

        file.rollback()?;
        assert_eq!(content(&file)?, b"onetwo");
        file.rollback()?;
        file.rollback()?;
        assert_eq!(content(&file)?, b"");
        assert_eq!(file.stat()?.size, 0);

        // Rollback on an empty upload is a no-op.
        file.rollback()?;
        assert_eq!(file.stat()?.n_fragments, 0);
        Ok(())
    }

    #[test]
    fn unclosed_fragment_is_discarded() -> CResult<()> {
        let (_, uploads) = fixture();
        let file = uploads.create("u1", "nobody")?.expect("fresh id");
        {
            let mut w = file.append()?;
            w.write_all(b"lost").map_err(Error::from)?;
            // dropped without close
        }
        assert_eq!(file.stat()?.n_fragments, 0);
        append(&file, b"kept")?;
        assert_eq!(content(&file)?, b"kept");
        Ok(())
    }

    #[test]
    fn verify_against_digests() -> CResult<()> {
        let (_, uploads) = fixture();
        let file = uploads.create("u1", "nobody")?.expect("fresh id");
        append(&file, b"hello world")?;

        // No digest recorded: trivially passes.
        assert!(file.verify()?);

        file.set_md5(hex::decode("5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap())?;
        assert!(file.verify()?);

        file.set_sha256(vec![0; 32])?;
        assert!(!file.verify()?);
        Ok(())
    }

    #[test]
    fn labels_filter() -> CResult<()> {
        let (_, uploads) = fixture();
        let a = uploads.create("a", "nobody")?.expect("fresh id");
        let b = uploads.create("b", "nobody")?.expect("fresh id");
        a.set_labels(vec!["red".into(), "blue".into(), "red".into()])?;
        b.set_labels(vec!["red".into()])?;

        assert_eq!(a.stat()?.labels, vec!["blue".to_string(), "red".to_string()]);
        assert_eq!(uploads.list()?, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(uploads.list_filtered(&["red".to_string()])?, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(uploads.list_filtered(&["red".to_string(), "blue".to_string()])?, vec!["a".to_string()]);
        assert_eq!(uploads.list_filtered(&["green".to_string()])?, Vec::<String>::new());
        Ok(())
    }

    #[test]
    fn survives_restart() -> CResult<()> {
        let (store, uploads) = fixture();
        let file = uploads.create("u1", "someone")?.expect("fresh id");
        append(&file, b"hello ")?;
        append(&file, b"world")?;
        file.set_mime_type("text/plain")?;

        // A second store over the same backing keys sees everything.
        let reloaded = FragmentStore::new(store);
        reloaded.load()?;
        let file = reloaded.lookup("u1").expect("loaded from metadata");
        assert_eq!(file.stat()?.creator, "someone");
        assert_eq!(file.stat()?.mime_type, "text/plain");
        assert_eq!(content(&file)?, b"hello world");
        Ok(())
    }
}
