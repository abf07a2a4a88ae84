use std::fmt::{self, Display};

/// Crate-wide result type, threaded through every module.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the storage core. Variants are kinds rather than
/// per-module types so callers (e.g. an HTTP layer) can map them to a
/// response without knowing which subsystem produced them.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The item does not exist in the store.
    NoItem(String),

    /// The blob id is not present in the item.
    NoBlob(String, u32),

    /// No version of the item binds the slot name.
    NoSlot(String),

    /// The store key (bundle, fragment, cache entry) does not exist.
    NoKey(String),

    /// The blob record exists but its payload has been tombstoned.
    Deleted(String, u32),

    /// The archival store is administratively disabled.
    NoStore,

    /// Cannot create because a predecessor entity already exists.
    Existing(String),

    /// Input is structurally invalid: command shape, hash string, slot
    /// path, fixity status, configuration value.
    Malformed(String),

    /// An observed checksum or size differs from the expected value.
    HashMismatch(String),

    /// Bundle verification failed; one message per mismatched entry.
    Validation(Vec<String>),

    /// A store or database operation failed.
    IO(String),

    /// The caller waited beyond the bound for cached content.
    Timeout,

    /// A concurrent write attempt on a single-writer resource.
    Conflict(String),

    /// A cache populate for this key is already in progress.
    PutPending(String),

    /// A persistent record failed to decode.
    Parse(String),

    /// A broken invariant; should never surface to clients.
    Internal(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoItem(id) => write!(f, "no item {}", id),
            Error::NoBlob(id, bid) => write!(f, "no blob {} in item {}", bid, id),
            Error::NoSlot(path) => write!(f, "no slot {}", path),
            Error::NoKey(key) => write!(f, "no such key {}", key),
            Error::Deleted(id, bid) => write!(f, "blob {} in item {} has been deleted", bid, id),
            Error::NoStore => write!(f, "tape store is disabled"),
            Error::Existing(what) => write!(f, "{} already exists", what),
            Error::Malformed(msg) => write!(f, "malformed input: {}", msg),
            Error::HashMismatch(msg) => write!(f, "hash mismatch: {}", msg),
            Error::Validation(msgs) => write!(f, "validation failed: {}", msgs.join("; ")),
            Error::IO(msg) => write!(f, "io error: {}", msg),
            Error::Timeout => write!(f, "timed out waiting for content"),
            Error::Conflict(msg) => write!(f, "conflicting write: {}", msg),
            Error::PutPending(key) => write!(f, "cache put already pending for {}", key),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Internal("lock poisoned".to_string())
    }
}

impl Error {
    /// True for the "does not exist" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NoItem(_) | Error::NoBlob(_, _) | Error::NoSlot(_) | Error::NoKey(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Error::NoItem("abc".into()).to_string(), "no item abc");
        assert_eq!(Error::NoBlob("abc".into(), 4).to_string(), "no blob 4 in item abc");
        assert_eq!(
            Error::Validation(vec!["a".into(), "b".into()]).to_string(),
            "validation failed: a; b"
        );
    }

    #[test]
    fn not_found() {
        assert!(Error::NoKey("k".into()).is_not_found());
        assert!(!Error::Timeout.is_not_found());
        assert!(!Error::Deleted("x".into(), 1).is_not_found());
    }
}
