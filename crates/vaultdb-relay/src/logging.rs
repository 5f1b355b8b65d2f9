//! Logging macros that set target to "vaultdb_relay" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g. "vaultdb_relay::protocol::mysql::server") for every call site.
//! These macros keep all logs from this crate under one target so a single
//! `RUST_LOG=vaultdb_relay=debug` directive selects them.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "vaultdb_relay", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "vaultdb_relay", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "vaultdb_relay", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "vaultdb_relay", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "vaultdb_relay", $($arg)*) };
}
