//! Key/value secret storage.
//!
//! The relay only needs three operations from a secret backend. The trait is
//! synchronous: lookups are in-memory and infrequent relative to relayed traffic.

mod memory;

pub use memory::MemorySecretStore;

/// A concurrency-safe mapping from opaque string keys to opaque string values.
///
/// `get`, `set` and `delete` are linearizable with respect to each other.
pub trait SecretStore: Send + Sync {
    /// Look up a key, distinguishing an absent key from an empty value.
    fn lookup(&self, key: &str) -> Option<String>;

    /// Store a value, overwriting any previous one.
    fn set(&self, key: &str, value: &str);

    /// Remove a key. Removing an absent key is a no-op.
    fn delete(&self, key: &str);

    /// Look up a key, returning an empty string when it is absent.
    ///
    /// Callers that must tell "absent" from "empty" use [`SecretStore::lookup`].
    fn get(&self, key: &str) -> String {
        self.lookup(key).unwrap_or_default()
    }
}
