//! Backend identity resolution.
//!
//! The relay never hard-codes how a client alias maps to a backend; it asks a
//! [`BackendResolver`]. [`SecretStoreResolver`] keeps one record per alias in
//! the secret store, flattened as `mysql_<alias>.<FIELD>` keys.

use std::sync::Arc;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::{RelayError, Result};
use crate::secret::SecretStore;

/// Key prefix for backend records.
pub const VAULT_MYSQL_KEY_PREFIX: &str = "mysql_";
/// Backend host field.
pub const VAULT_MYSQL_HOST: &str = "HOST";
/// Backend port field.
pub const VAULT_MYSQL_PORT: &str = "PORT";
/// Backend username field.
pub const VAULT_MYSQL_USERNAME: &str = "USERNAME";
/// Backend password field.
pub const VAULT_MYSQL_PASSWORD: &str = "PASSWORD";
/// Backend default database field.
pub const VAULT_MYSQL_DBNAME: &str = "NAME";

const VAULT_MYSQL_FIELDS: [&str; 5] = [
    VAULT_MYSQL_HOST,
    VAULT_MYSQL_PORT,
    VAULT_MYSQL_USERNAME,
    VAULT_MYSQL_PASSWORD,
    VAULT_MYSQL_DBNAME,
];

/// True if `key` names a backend record field (`mysql_<alias>.<FIELD>`).
///
/// Client aliases share the store with backend records, so anything that
/// authenticates clients against the store must refuse these keys.
pub fn is_backend_record_key(key: &str) -> bool {
    key.strip_prefix(VAULT_MYSQL_KEY_PREFIX)
        .and_then(|rest| rest.rsplit_once('.'))
        .map_or(false, |(_, field)| VAULT_MYSQL_FIELDS.contains(&field))
}

/// `host:port`, with IPv6 literals bracketed.
fn join_host_port(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Everything needed to dial and authenticate against a backend.
#[derive(Clone)]
pub struct BackendParams {
    /// `host:port`
    pub address: String,
    /// Backend username
    pub user: String,
    /// Backend password (zeroized on drop)
    pub password: Zeroizing<String>,
    /// Default database, if any
    pub database: Option<String>,
}

impl std::fmt::Debug for BackendParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendParams")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Maps a client alias to backend connection parameters.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    /// Resolve `alias`, or fail with a descriptive error.
    async fn resolve(&self, alias: &str) -> Result<BackendParams>;
}

/// A backend record as written by [`SecretStoreResolver::register`].
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

/// Resolver reading per-alias backend records from a secret store.
#[derive(Clone)]
pub struct SecretStoreResolver {
    store: Arc<dyn SecretStore>,
}

impl SecretStoreResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    fn key(alias: &str, field: &str) -> String {
        format!("{}{}.{}", VAULT_MYSQL_KEY_PREFIX, alias, field)
    }

    /// Write (or overwrite) the backend record for `alias`.
    pub fn register(&self, alias: &str, record: &BackendRecord) {
        self.store.set(&Self::key(alias, VAULT_MYSQL_HOST), &record.host);
        self.store
            .set(&Self::key(alias, VAULT_MYSQL_PORT), &record.port.to_string());
        self.store
            .set(&Self::key(alias, VAULT_MYSQL_USERNAME), &record.username);
        self.store
            .set(&Self::key(alias, VAULT_MYSQL_PASSWORD), &record.password);
        self.store.set(
            &Self::key(alias, VAULT_MYSQL_DBNAME),
            record.database.as_deref().unwrap_or(""),
        );
        debug!(alias, host = %record.host, port = record.port, "Registered backend record");
    }

    /// Remove the backend record for `alias`.
    pub fn unregister(&self, alias: &str) {
        for field in VAULT_MYSQL_FIELDS {
            self.store.delete(&Self::key(alias, field));
        }
    }

    fn required(&self, alias: &str, field: &str) -> Result<String> {
        match self.store.lookup(&Self::key(alias, field)) {
            Some(value) if field == VAULT_MYSQL_PASSWORD || !value.is_empty() => Ok(value),
            _ => Err(RelayError::BackendResolution(format!(
                "no {} recorded for alias '{}'",
                field, alias
            ))),
        }
    }
}

#[async_trait]
impl BackendResolver for SecretStoreResolver {
    async fn resolve(&self, alias: &str) -> Result<BackendParams> {
        let host = self.required(alias, VAULT_MYSQL_HOST)?;
        let port = self.required(alias, VAULT_MYSQL_PORT)?;
        let port: u16 = port.parse().map_err(|_| {
            RelayError::BackendResolution(format!("invalid PORT '{}' for alias '{}'", port, alias))
        })?;
        let user = self.required(alias, VAULT_MYSQL_USERNAME)?;
        let password = Zeroizing::new(self.required(alias, VAULT_MYSQL_PASSWORD)?);
        let database = Some(self.store.get(&Self::key(alias, VAULT_MYSQL_DBNAME)))
            .filter(|db| !db.is_empty());

        Ok(BackendParams {
            address: join_host_port(&host, port),
            user,
            password,
            database,
        })
    }
}
