//! Configuration module for vaultdb-relay
//!
//! ```yaml
//! server:
//!   listen_port: 3307
//!
//! users:
//!   alice: "${ALICE_PASSWORD}"
//!
//! backends:
//!   alice:
//!     host: db.internal
//!     port: 3306
//!     username: app
//!     password: "${APP_DB_PASSWORD}"
//!     database: appdb
//! ```
//!
//! `users` seeds the credential provider (alias -> password the client must
//! present); `backends` seeds the resolver (alias -> real backend identity).

mod loader;
mod types;

pub use loader::{apply_env_overrides, load_config, load_config_from_str};
pub use types::*;
