//! Error types for vaultdb-relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener could not be bound; fatal at startup
    #[error("Failed to bind listener: {0}")]
    Bind(String),

    /// Unexpected accept failure; the listener stops
    #[error("Accept failed: {0}")]
    Accept(String),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Client authentication rejected or backend rejected our credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unsupported authentication method
    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuthMethod(String),

    /// Credential lookup failure in the provider
    #[error("Failed to retrieve credentials: {0}")]
    CredentialRetrieval(String),

    /// Alias could not be resolved to backend parameters
    #[error("Backend resolution failed: {0}")]
    BackendResolution(String),

    /// Handshake setup callback failed; no relay was started
    #[error("Session setup failed: {0}")]
    Setup(String),
}

impl RelayError {
    /// True when the error is a rejected client login.
    pub fn is_auth(&self) -> bool {
        matches!(self, RelayError::Auth(_))
    }

    /// True when the handshake setup callback failed.
    pub fn is_setup(&self) -> bool {
        matches!(self, RelayError::Setup(_))
    }
}

/// Result type alias for RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}
