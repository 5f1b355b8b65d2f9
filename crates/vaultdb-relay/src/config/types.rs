//! Configuration types

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{is_backend_record_key, BackendRecord};
use crate::protocol::mysql::DEFAULT_SERVER_VERSION;

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Listener and handshake settings
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Client aliases and the passwords they log in with
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Backend identity per alias
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.connect_timeout_secs == 0 {
            return Err("server.connect_timeout_secs must be greater than zero".into());
        }
        if self.server.handshake_timeout_secs == 0 {
            return Err("server.handshake_timeout_secs must be greater than zero".into());
        }
        if self.server.server_version.is_empty() {
            return Err("server.server_version must not be empty".into());
        }
        for user in self.users.keys() {
            if is_backend_record_key(user) {
                return Err(format!(
                    "user '{}' collides with a backend record key",
                    user
                ));
            }
        }
        for (alias, backend) in &self.backends {
            if backend.host.is_empty() {
                return Err(format!("backend '{}' has an empty host", alias));
            }
            if backend.port == 0 {
                return Err(format!("backend '{}' has port 0", alias));
            }
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (must resolve to IPv4)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Port to listen on; 0 lets the OS pick one
    pub listen_port: u16,
    /// Backend connect and handshake timeout
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on each client read during the handshake
    #[serde(default = "default_timeout")]
    pub handshake_timeout_secs: u64,
    /// Version string in the greeting sent to clients
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// Interval for logging a metrics snapshot (0 = disabled)
    #[serde(default)]
    pub metrics_log_interval_secs: u64,
    /// Prometheus textfile refreshed on every metrics interval and at shutdown
    #[serde(default)]
    pub metrics_textfile: Option<PathBuf>,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Backend identity for one alias
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Default database (optional)
    #[serde(default)]
    pub database: Option<String>,
}

impl From<&BackendConfig> for BackendRecord {
    fn from(backend: &BackendConfig) -> Self {
        BackendRecord {
            host: backend.host.clone(),
            port: backend.port,
            username: backend.username.clone(),
            password: backend.password.clone(),
            database: backend.database.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_server_version() -> String {
    DEFAULT_SERVER_VERSION.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
