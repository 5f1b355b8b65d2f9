//! vaultdb-relay - MySQL relay with secret-store backed credential injection
//!
//! This library provides the building blocks for a relay that:
//! - Authenticates MySQL clients against aliases held in a [`secret::SecretStore`]
//! - Resolves each alias to a backend identity and dials it with the real credentials
//! - Mirrors the client's negotiated charset and multi-statement/multi-result
//!   capabilities onto the backend connection
//! - Splices raw bytes in both directions once both handshakes complete

#[macro_use]
mod logging;

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod secret;
pub mod server;

pub use auth::{BackendParams, BackendResolver, CredentialProvider, SecretStoreResolver, VaultProvider};
pub use config::Config;
pub use error::{RelayError, Result};
pub use secret::{MemorySecretStore, SecretStore};
pub use server::{MetricsSnapshot, Relay, RelayMetrics};
