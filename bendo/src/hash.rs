use std::io::{Read, Write};

use sha2::{Digest, Sha256};

/// Byte lengths of the digests recorded for every stored stream.
pub const MD5_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;

/// A Write adapter that feeds everything written through it into MD5 and
/// SHA-256 contexts while counting bytes. Content is never buffered to be
/// hashed; all digests in the crate are computed online.
pub struct HashWriter<W: Write> {
    inner: W,
    md5: md5::Context,
    sha256: Sha256,
    count: u64,
}

impl<W: Write> HashWriter<W> {
    pub fn new(inner: W) -> Self {
        HashWriter { inner, md5: md5::Context::new(), sha256: Sha256::new(), count: 0 }
    }

    /// Consumes the writer, returning the byte count and both digests.
    pub fn sums(self) -> (u64, Vec<u8>, Vec<u8>) {
        let md5 = self.md5.compute().0.to_vec();
        let sha256 = self.sha256.finalize().to_vec();
        (self.count, md5, sha256)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.md5.consume(&buf[..n]);
        self.sha256.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// The Read counterpart of HashWriter, used when verifying content that is
/// streamed out of a bundle or an upload.
pub struct HashReader<R: Read> {
    inner: R,
    md5: md5::Context,
    sha256: Sha256,
    count: u64,
}

impl<R: Read> HashReader<R> {
    pub fn new(inner: R) -> Self {
        HashReader { inner, md5: md5::Context::new(), sha256: Sha256::new(), count: 0 }
    }

    pub fn sums(self) -> (u64, Vec<u8>, Vec<u8>) {
        let md5 = self.md5.compute().0.to_vec();
        let sha256 = self.sha256.finalize().to_vec();
        (self.count, md5, sha256)
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.md5.consume(&buf[..n]);
        self.sha256.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Reads the stream to its end and returns `(count, md5, sha256)`.
pub fn hash_stream<R: Read>(r: R) -> std::io::Result<(u64, Vec<u8>, Vec<u8>)> {
    let mut hr = HashReader::new(r);
    std::io::copy(&mut hr, &mut std::io::sink())?;
    Ok(hr.sums())
}

/// Serde helper for digest fields: bytes in memory, lowercase hex in JSON.
/// An absent or empty string round-trips to an empty Vec (a deleted blob).
pub mod hexbytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(de::Error::custom)
    }
}
