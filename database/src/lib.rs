//! Ordered key-value storage behind the chain and sync services.
//!
//! The production backend is provided externally. The in-memory variant backs
//! tests and the `--in-memory` mode and implements the same ordered-map
//! semantics, including the prefix operations pruning relies on.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use log::debug;

pub struct Database(Backend);

enum Backend {
    InMemory {
        map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    },
}

impl Database {
    #[must_use]
    pub fn in_memory() -> Self {
        Self(Backend::InMemory {
            map: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.map()?.insert(key.as_ref().to_vec(), value.into());
        Ok(())
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.map()?.get(key.as_ref()).cloned())
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.map()?.remove(key.as_ref());
        Ok(())
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.map()?.contains_key(key.as_ref()))
    }

    /// Removes all entries whose keys start with `prefix`.
    /// Returns the number of entries removed.
    pub fn delete_by_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<usize> {
        let prefix = prefix.as_ref();
        let mut map = self.map()?;

        let keys = map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in &keys {
            map.remove(key);
        }

        Ok(keys.len())
    }

    pub fn keys_with_prefix(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<Vec<u8>>> {
        let prefix = prefix.as_ref();

        Ok(self
            .map()?
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Flushes the write-ahead log of the backing store.
    pub fn checkpoint(&self) -> Result<()> {
        match &self.0 {
            Backend::InMemory { .. } => {
                debug!("checkpoint requested on in-memory database");
                Ok(())
            }
        }
    }

    fn map(&self) -> Result<MutexGuard<BTreeMap<Vec<u8>, Vec<u8>>>> {
        match &self.0 {
            Backend::InMemory { map } => map
                .lock()
                .map_err(|_| anyhow::anyhow!("database mutex was poisoned")),
        }
    }
}
