//! Credential provider backed by a [`SecretStore`].
//!
//! A client alias is stored directly as a key whose value is the password the
//! client must present. Existence is "the stored value is non-empty": an alias
//! registered with an empty password is indistinguishable from an unknown one.
//! Keys belonging to backend records are never treated as client aliases.

use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use super::resolver::is_backend_record_key;
use super::CredentialProvider;
use crate::error::Result;
use crate::secret::SecretStore;

/// Adapts a secret store to the handshake engine's authentication contract.
#[derive(Clone)]
pub struct VaultProvider {
    store: Arc<dyn SecretStore>,
}

impl VaultProvider {
    /// Create a provider reading from `store`.
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Register or overwrite a client alias.
    ///
    /// No validation is performed; the alias is not checked against any
    /// backend record.
    pub fn add_user(&self, username: &str, password: &str) {
        debug!(user = username, "Registering client alias");
        self.store.set(username, password);
    }

    /// Revoke a client alias.
    pub fn remove_user(&self, username: &str) {
        debug!(user = username, "Removing client alias");
        self.store.delete(username);
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }
}

#[async_trait]
impl CredentialProvider for VaultProvider {
    async fn check_username(&self, username: &str) -> Result<bool> {
        if is_backend_record_key(username) {
            return Ok(false);
        }
        Ok(!self.store.get(username).is_empty())
    }

    async fn get_credential(&self, username: &str) -> Result<(Zeroizing<String>, bool)> {
        if is_backend_record_key(username) {
            return Ok((Zeroizing::new(String::new()), false));
        }
        let password = Zeroizing::new(self.store.get(username));
        let found = !password.is_empty();
        Ok((password, found))
    }
}

impl std::fmt::Debug for VaultProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{BackendRecord, SecretStoreResolver};
    use crate::secret::MemorySecretStore;

    static_assertions::assert_impl_all!(VaultProvider: Send, Sync);

    fn provider() -> VaultProvider {
        VaultProvider::new(Arc::new(MemorySecretStore::new()))
    }

    #[tokio::test]
    async fn test_add_user_then_get_credential() {
        let provider = provider();
        provider.add_user("alice", "secret");

        assert!(provider.check_username("alice").await.unwrap());
        let (password, found) = provider.get_credential("alice").await.unwrap();
        assert_eq!(password.as_str(), "secret");
        assert!(found);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let provider = provider();
        assert!(!provider.check_username("bob").await.unwrap());
        let (password, found) = provider.get_credential("bob").await.unwrap();
        assert!(password.is_empty());
        assert!(!found);
    }

    #[tokio::test]
    async fn test_add_user_overwrites() {
        let provider = provider();
        provider.add_user("alice", "one");
        provider.add_user("alice", "two");
        let (password, _) = provider.get_credential("alice").await.unwrap();
        assert_eq!(password.as_str(), "two");
    }

    #[tokio::test]
    async fn test_empty_password_reads_as_unknown() {
        let provider = provider();
        provider.add_user("ghost", "");

        // The store knows the key, the provider does not.
        assert_eq!(provider.store().lookup("ghost"), Some(String::new()));
        assert!(!provider.check_username("ghost").await.unwrap());
        let (_, found) = provider.get_credential("ghost").await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_backend_record_fields_are_not_aliases() {
        let provider = provider();
        let resolver = SecretStoreResolver::new(Arc::clone(provider.store()));
        resolver.register(
            "alice",
            &BackendRecord {
                host: "db.internal".into(),
                port: 3306,
                username: "app".into(),
                password: "app-secret".into(),
                database: None,
            },
        );
        provider.add_user("mysql_reporting", "pw");

        for key in ["mysql_alice.HOST", "mysql_alice.PASSWORD", "mysql_alice.USERNAME"] {
            assert!(!provider.check_username(key).await.unwrap(), "{}", key);
            let (password, found) = provider.get_credential(key).await.unwrap();
            assert!(password.is_empty());
            assert!(!found);
        }
        assert!(provider.check_username("mysql_reporting").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_user() {
        let provider = provider();
        provider.add_user("alice", "secret");
        provider.remove_user("alice");
        assert!(!provider.check_username("alice").await.unwrap());
    }
}
