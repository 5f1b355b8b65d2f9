//! CredentialProvider trait definition.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::Result;

/// Authentication contract consumed by the handshake engine.
///
/// Implementations must be `Send + Sync`; one provider is shared by every
/// session.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Whether `username` is known.
    ///
    /// Returning `Ok(false)` makes the handshake fail with "access denied"
    /// before any backend work happens.
    async fn check_username(&self, username: &str) -> Result<bool>;

    /// The password registered for `username` and whether it was found.
    async fn get_credential(&self, username: &str) -> Result<(Zeroizing<String>, bool)>;
}
