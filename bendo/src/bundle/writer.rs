use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use zip::write::FileOptions;
use zip::CompressionMethod;

use crate::bundle::{bundle_key, Checksum, DATA_PREFIX};
use crate::error::{CResult, Error};
use crate::store::Store;

/// Streams one bundle into the store. Entries are opened one at a time
/// with `make_stream` and written through the `Write` impl; the digests of
/// each entry are computed online and recorded in the bag manifests that
/// `close` appends. Not safe for concurrent use.
///
/// The archive is spooled to an unlinked temp file (the zip format needs a
/// seekable sink) and copied into the store under its key only when `close`
/// succeeds, so a failed write never leaves a half-bundle behind.
pub struct BundleWriter {
    store: Arc<dyn Store>,
    key: String,
    sequence: u32,
    zip: zip::ZipWriter<File>,
    current: Option<OpenStream>,
    manifest: BTreeMap<String, Checksum>,
    written: u64,
}

struct OpenStream {
    name: String,
    md5: md5::Context,
    sha256: Sha256,
    count: u64,
}

const BAG_DECLARATION: &str = "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n";

impl BundleWriter {
    /// Begins bundle `sequence` of `item`. Errors with `Existing` if the
    /// bundle key is already present in the store.
    pub fn new(store: Arc<dyn Store>, item: &str, sequence: u32) -> CResult<Self> {
        let key = bundle_key(item, sequence);
        if store.open(&key).is_ok() {
            return Err(Error::Existing(format!("bundle {}", key)));
        }
        let spool = tempfile::tempfile()?;
        Ok(BundleWriter {
            store,
            key,
            sequence,
            zip: zip::ZipWriter::new(spool),
            current: None,
            manifest: BTreeMap::new(),
            written: 0,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Payload bytes streamed so far, across all entries. Drives the ideal
    /// bundle size rotation in the item writer.
    pub fn size(&self) -> u64 {
        self.written
    }

    fn entry_options() -> FileOptions {
        // Stored, not compressed: entries must be readable as raw byte
        // ranges so blobs can be served straight off the archive.
        FileOptions::default().compression_method(CompressionMethod::Stored).large_file(true)
    }

    /// Opens the entry `name` for writing, finishing any open entry first.
    pub fn make_stream(&mut self, name: &str) -> CResult<()> {
        self.finish_stream();
        self.zip.start_file(format!("{}{}", DATA_PREFIX, name), Self::entry_options())?;
        self.current = Some(OpenStream {
            name: name.to_string(),
            md5: md5::Context::new(),
            sha256: Sha256::new(),
            count: 0,
        });
        Ok(())
    }

    /// Finishes the open entry, recording its digests in the manifests, and
    /// returns `(size, md5, sha256)`.
    pub fn end_stream(&mut self) -> CResult<(u64, Vec<u8>, Vec<u8>)> {
        match self.finish_stream() {
            Some((size, cs)) => Ok((size, cs.md5, cs.sha256)),
            None => Err(Error::Internal("no open bundle stream".to_string())),
        }
    }

    fn finish_stream(&mut self) -> Option<(u64, Checksum)> {
        let stream = self.current.take()?;
        let checksum = Checksum {
            md5: stream.md5.compute().0.to_vec(),
            sha256: stream.sha256.finalize().to_vec(),
        };
        self.manifest.insert(stream.name, checksum.clone());
        Some((stream.count, checksum))
    }

    /// Finalizes the archive: writes the bag declaration and the MD5 and
    /// SHA-256 manifests, then copies the spool into the store under the
    /// bundle key. Consumes the writer.
    pub fn close(mut self) -> CResult<()> {
        self.finish_stream();

        self.zip.start_file("bagit.txt", Self::entry_options())?;
        self.zip.write_all(BAG_DECLARATION.as_bytes())?;

        self.zip.start_file("manifest-md5.txt", Self::entry_options())?;
        for (name, checksum) in &self.manifest {
            let line = format!("{} {}{}\n", hex::encode(&checksum.md5), DATA_PREFIX, name);
            self.zip.write_all(line.as_bytes())?;
        }

        self.zip.start_file("manifest-sha256.txt", Self::entry_options())?;
        for (name, checksum) in &self.manifest {
            let line = format!("{} {}{}\n", hex::encode(&checksum.sha256), DATA_PREFIX, name);
            self.zip.write_all(line.as_bytes())?;
        }

        let mut spool = self.zip.finish()?;
        spool.seek(SeekFrom::Start(0))?;
        let mut out = self.store.create(&self.key)?;
        std::io::copy(&mut spool, &mut out)?;
        out.close()
    }
}

impl Write for BundleWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stream = self.current.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no open bundle stream")
        })?;
        let n = self.zip.write(buf)?;
        stream.md5.consume(&buf[..n]);
        stream.sha256.update(&buf[..n]);
        stream.count += n as u64;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.zip.flush()
    }
}
