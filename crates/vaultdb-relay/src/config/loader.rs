//! Configuration loader

use super::Config;
use crate::error::{RelayError, Result};
use std::path::Path;

/// Load configuration from a YAML file
///
/// Also applies VAULTDB_RELAY_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
///
/// Also applies VAULTDB_RELAY_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    resolve_config_env_vars(&mut config);
    apply_env_overrides(&mut config);
    config.validate().map_err(RelayError::Config)?;
    Ok(config)
}

/// Apply VAULTDB_RELAY_* environment variable overrides to a config.
///
/// Supported env vars:
/// - `VAULTDB_RELAY_LISTEN_ADDRESS` - Override listen address
/// - `VAULTDB_RELAY_LISTEN_PORT` - Override listen port
/// - `VAULTDB_RELAY_LOG_LEVEL` - Override log level
/// - `VAULTDB_RELAY_CONNECT_TIMEOUT_SECS` - Override backend connect timeout
/// - `VAULTDB_RELAY_HANDSHAKE_TIMEOUT_SECS` - Override client handshake timeout
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("VAULTDB_RELAY_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from VAULTDB_RELAY_LISTEN_ADDRESS");
        config.server.listen_address = val;
    }
    if let Ok(val) = std::env::var("VAULTDB_RELAY_LISTEN_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding listen_port from VAULTDB_RELAY_LISTEN_PORT");
            config.server.listen_port = port;
        }
    }
    if let Ok(val) = std::env::var("VAULTDB_RELAY_LOG_LEVEL") {
        debug!("Overriding log level from VAULTDB_RELAY_LOG_LEVEL");
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var("VAULTDB_RELAY_CONNECT_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding connect_timeout from VAULTDB_RELAY_CONNECT_TIMEOUT_SECS");
            config.server.connect_timeout_secs = secs;
        }
    }
    if let Ok(val) = std::env::var("VAULTDB_RELAY_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(secs) = val.parse::<u64>() {
            debug!("Overriding handshake_timeout from VAULTDB_RELAY_HANDSHAKE_TIMEOUT_SECS");
            config.server.handshake_timeout_secs = secs;
        }
    }
}

/// Resolve an environment variable reference in a string value
///
/// Supports two syntaxes, each covering the whole value:
/// - `${VAR_NAME}`
/// - `$VAR_NAME`
///
/// If the environment variable is not set, the original value is preserved.
fn resolve_env_var(value: &str) -> String {
    let var_name = if let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        name
    } else if let Some(name) = value.strip_prefix('$').filter(|n| !n.is_empty() && !n.contains(' ')) {
        name
    } else {
        return value.to_string();
    };

    match std::env::var(var_name) {
        Ok(env_value) => {
            debug!("Resolved env var {} from config", var_name);
            env_value
        }
        Err(_) => {
            debug!("Env var {} not set, keeping original value", var_name);
            value.to_string()
        }
    }
}

/// Resolve environment variables in all config fields that support it
fn resolve_config_env_vars(config: &mut Config) {
    for password in config.users.values_mut() {
        *password = resolve_env_var(password);
    }

    for backend in config.backends.values_mut() {
        backend.host = resolve_env_var(&backend.host);
        backend.username = resolve_env_var(&backend.username);
        backend.password = resolve_env_var(&backend.password);
        if let Some(ref db) = backend.database {
            backend.database = Some(resolve_env_var(db));
        }
    }
}
