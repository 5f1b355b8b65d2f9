//! Client authentication and backend identity resolution.
//!
//! - [`CredentialProvider`]: answers the handshake engine's "does this user
//!   exist / what is its password" questions
//! - [`BackendResolver`]: maps a client alias to the backend it should reach
//!
//! Both are object-safe so the relay can hold them as `Arc<dyn ...>`.

mod provider;
mod resolver;
mod vault;

pub use provider::CredentialProvider;
pub use resolver::{
    is_backend_record_key, BackendParams, BackendRecord, BackendResolver, SecretStoreResolver,
    VAULT_MYSQL_DBNAME,
    VAULT_MYSQL_HOST, VAULT_MYSQL_KEY_PREFIX, VAULT_MYSQL_PASSWORD, VAULT_MYSQL_PORT,
    VAULT_MYSQL_USERNAME,
};
pub use vault::VaultProvider;
