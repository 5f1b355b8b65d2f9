//! In-process secret store.

use std::collections::HashMap;

use parking_lot::RwLock;
use zeroize::Zeroizing;

use super::SecretStore;

/// Secret store backed by a single map behind one reader/writer lock.
///
/// Values are zeroized when overwritten, deleted or when the store is dropped.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Zeroizing<String>>>,
}

impl MemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with the given entries.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), Zeroizing::new(v.into())))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SecretStore for MemorySecretStore {
    fn lookup(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|v| v.as_str().to_owned())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .insert(key.to_owned(), Zeroizing::new(value.to_owned()));
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
