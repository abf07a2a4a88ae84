use std::sync::Arc;

use crate::error::{CResult, Error};
use crate::store::{ReadAt, Store, StoreWriter};

/// An adapter presenting a namespaced view of another store: every key is
/// prepended with a fixed prefix on the way in and stripped on the way out.
/// Used to segregate upload fragments, upload metadata, and transaction
/// records within one shared store.
pub struct Prefix {
    inner: Arc<dyn Store>,
    prefix: String,
}

impl Prefix {
    pub fn new(inner: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Prefix { inner, prefix: prefix.into() }
    }

    fn wrap(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip_err(&self, err: Error) -> Error {
        // Keep reported keys in the caller's namespace.
        match err {
            Error::NoKey(key) => {
                Error::NoKey(key.strip_prefix(&self.prefix).unwrap_or(&key).to_string())
            }
            other => other,
        }
    }
}

impl Store for Prefix {
    fn create(&self, key: &str) -> CResult<Box<dyn StoreWriter>> {
        self.inner.create(&self.wrap(key)).map_err(|err| self.strip_err(err))
    }

    fn open(&self, key: &str) -> CResult<(Arc<dyn ReadAt>, u64)> {
        self.inner.open(&self.wrap(key)).map_err(|err| self.strip_err(err))
    }

    fn delete(&self, key: &str) -> CResult<()> {
        self.inner.delete(&self.wrap(key)).map_err(|err| self.strip_err(err))
    }

    fn list(&self) -> CResult<Vec<String>> {
        Ok(self
            .inner
            .list_prefix(&self.prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    fn list_prefix(&self, prefix: &str) -> CResult<Vec<String>> {
        Ok(self
            .inner
            .list_prefix(&self.wrap(prefix))?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CResult;
    use crate::store::memory::Memory;

    super::super::tests::test_store!(Prefix::new(Arc::new(Memory::new()), "p:"));

    #[test]
    fn namespaces_are_disjoint() -> CResult<()> {
        use crate::store::{get_bytes, put_bytes};

        let shared: Arc<dyn Store> = Arc::new(Memory::new());
        let md = Prefix::new(shared.clone(), "md");
        let frag = Prefix::new(shared.clone(), "f");

        put_bytes(&md, "0001", b"metadata")?;
        put_bytes(&frag, "0001+0001", b"fragment")?;

        assert_eq!(md.list()?, vec!["0001"]);
        assert_eq!(frag.list()?, vec!["0001+0001"]);
        assert_eq!(get_bytes(&md, "0001")?, b"metadata");

        let mut all = shared.list()?;
        all.sort();
        assert_eq!(all, vec!["f0001+0001", "md0001"]);

        // Errors report the caller's key, not the wrapped one.
        assert_eq!(md.open("0002").err(), Some(Error::NoKey("0002".into())));
        Ok(())
    }
}
