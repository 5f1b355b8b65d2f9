//! Relay metrics for observability.
//!
//! A single [`RelayMetrics`] instance is created by the owner of the relay and
//! injected into it; nothing here is process-global. All counters are plain
//! atomics so recording is lock-free on the session path.
//!
//! # Metric Categories
//!
//! ## Connection Metrics
//! - `connections_accepted`: Total connections accepted (never decremented)
//! - `connections_active`: Sessions between accept and cleanup
//! - `accept_errors`: Unexpected accept failures (each one stops the listener)
//!
//! ## Session Metrics
//! - `auth_failures`: Clients rejected during the handshake
//! - `setup_failures`: Backend resolution or dial failures
//! - `sessions_relayed`: Sessions that reached the byte splice
//! - `session_panics`: Sessions torn down by a recovered panic
//!
//! ## Traffic Metrics
//! - `bytes_client_to_backend` / `bytes_backend_to_client`

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic ordering used for metrics (Relaxed is sufficient for counters).
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// Snapshot key for the live session count.
pub const ACTIVE_CONN_COUNT: &str = "active_conn_count";
/// Snapshot key for the cumulative session count.
pub const TOTAL_CONN_COUNT: &str = "total_conn_count";

/// Counters shared by the listener and every session.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // ========================================================================
    // Connection Metrics
    // ========================================================================
    /// Total connections accepted since startup
    pub connections_accepted: AtomicU64,
    /// Currently active sessions
    pub connections_active: AtomicU64,
    /// Accept failures that were not a shutdown
    pub accept_errors: AtomicU64,

    // ========================================================================
    // Session Metrics
    // ========================================================================
    /// Clients rejected by the credential check
    pub auth_failures: AtomicU64,
    /// Sessions aborted because the backend could not be prepared
    pub setup_failures: AtomicU64,
    /// Sessions that started relaying bytes
    pub sessions_relayed: AtomicU64,
    /// Sessions ended by a recovered panic
    pub session_panics: AtomicU64,

    // ========================================================================
    // Traffic Metrics
    // ========================================================================
    pub bytes_client_to_backend: AtomicU64,
    pub bytes_backend_to_client: AtomicU64,
}

/// Keeps a session counted as active until dropped.
///
/// Created by [`RelayMetrics::session_started`]. Dropping it is the only way
/// the active count goes down, so every exit path of a session (including
/// unwinding) decrements exactly once.
#[derive(Debug)]
pub struct ActiveSessionGuard {
    metrics: Arc<RelayMetrics>,
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.metrics
            .connections_active
            .fetch_sub(1, METRIC_ORDERING);
    }
}

impl RelayMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared metrics instance.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // ========================================================================
    // Recording Methods
    // ========================================================================

    /// Count an accepted connection and mark it active.
    pub fn session_started(self: &Arc<Self>) -> ActiveSessionGuard {
        self.connections_accepted.fetch_add(1, METRIC_ORDERING);
        self.connections_active.fetch_add(1, METRIC_ORDERING);
        ActiveSessionGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, METRIC_ORDERING);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn setup_failure(&self) {
        self.setup_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn session_relayed(&self) {
        self.sessions_relayed.fetch_add(1, METRIC_ORDERING);
    }

    pub fn session_panicked(&self) {
        self.session_panics.fetch_add(1, METRIC_ORDERING);
    }

    pub fn record_client_to_backend(&self, bytes: u64) {
        self.bytes_client_to_backend
            .fetch_add(bytes, METRIC_ORDERING);
    }

    pub fn record_backend_to_client(&self, bytes: u64) {
        self.bytes_backend_to_client
            .fetch_add(bytes, METRIC_ORDERING);
    }

    // ========================================================================
    // Snapshot Methods
    // ========================================================================

    /// Get a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conn_count: self.connections_active.load(METRIC_ORDERING),
            total_conn_count: self.connections_accepted.load(METRIC_ORDERING),
            accept_errors: self.accept_errors.load(METRIC_ORDERING),
            auth_failures: self.auth_failures.load(METRIC_ORDERING),
            setup_failures: self.setup_failures.load(METRIC_ORDERING),
            sessions_relayed: self.sessions_relayed.load(METRIC_ORDERING),
            session_panics: self.session_panics.load(METRIC_ORDERING),
            bytes_client_to_backend: self.bytes_client_to_backend.load(METRIC_ORDERING),
            bytes_backend_to_client: self.bytes_backend_to_client.load(METRIC_ORDERING),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        self.snapshot().to_prometheus()
    }
}

/// Point-in-time snapshot of all metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conn_count: u64,
    pub total_conn_count: u64,
    pub accept_errors: u64,
    pub auth_failures: u64,
    pub setup_failures: u64,
    pub sessions_relayed: u64,
    pub session_panics: u64,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
}

impl MetricsSnapshot {
    /// The two connection counters keyed by their published names.
    pub fn to_map(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            (ACTIVE_CONN_COUNT, self.active_conn_count),
            (TOTAL_CONN_COUNT, self.total_conn_count),
        ])
    }

    /// Write the Prometheus exposition to `path` for a textfile collector.
    ///
    /// The text goes to `<path>.tmp` first and is renamed into place, so a
    /// scraper never reads a partial file.
    pub async fn write_prometheus_textfile(&self, path: &Path) -> io::Result<()> {
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, self.to_prometheus()).await?;
        tokio::fs::rename(&staging, path).await
    }

    /// Render in Prometheus exposition format.
    ///
    /// ```text
    /// # HELP vaultdb_relay_connections_total Total connections accepted
    /// # TYPE vaultdb_relay_connections_total counter
    /// vaultdb_relay_connections_total 12
    /// ```
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);
        let mut metric = |name: &str, kind: &str, help: &str, lines: &[(&str, u64)]| {
            output.push_str(&format!("# HELP vaultdb_relay_{} {}\n", name, help));
            output.push_str(&format!("# TYPE vaultdb_relay_{} {}\n", name, kind));
            for (labels, value) in lines {
                output.push_str(&format!("vaultdb_relay_{}{} {}\n", name, labels, value));
            }
        };

        metric(
            "connections_total",
            "counter",
            "Total connections accepted",
            &[("", self.total_conn_count)],
        );
        metric(
            "connections_active",
            "gauge",
            "Sessions currently open",
            &[("", self.active_conn_count)],
        );
        metric(
            "accept_errors_total",
            "counter",
            "Unexpected accept failures",
            &[("", self.accept_errors)],
        );
        metric(
            "session_failures_total",
            "counter",
            "Sessions that ended before relaying",
            &[
                ("{reason=\"auth\"}", self.auth_failures),
                ("{reason=\"setup\"}", self.setup_failures),
                ("{reason=\"panic\"}", self.session_panics),
            ],
        );
        metric(
            "sessions_relayed_total",
            "counter",
            "Sessions that reached the byte splice",
            &[("", self.sessions_relayed)],
        );
        metric(
            "bytes_total",
            "counter",
            "Bytes relayed",
            &[
                ("{direction=\"client_to_backend\"}", self.bytes_client_to_backend),
                ("{direction=\"backend_to_client\"}", self.bytes_backend_to_client),
            ],
        );

        output
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Relay Metrics ===")?;
        writeln!(f)?;
        writeln!(f, "Connections:")?;
        writeln!(f, "  Total:         {}", self.total_conn_count)?;
        writeln!(f, "  Active:        {}", self.active_conn_count)?;
        writeln!(f, "  Accept errors: {}", self.accept_errors)?;
        writeln!(f)?;
        writeln!(f, "Sessions:")?;
        writeln!(f, "  Relayed:        {}", self.sessions_relayed)?;
        writeln!(f, "  Auth failures:  {}", self.auth_failures)?;
        writeln!(f, "  Setup failures: {}", self.setup_failures)?;
        writeln!(f, "  Panics:         {}", self.session_panics)?;
        writeln!(f)?;
        writeln!(f, "Traffic:")?;
        writeln!(f, "  Client -> backend: {}", self.bytes_client_to_backend)?;
        writeln!(f, "  Backend -> client: {}", self.bytes_backend_to_client)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(RelayMetrics: Send, Sync);
    static_assertions::assert_impl_all!(ActiveSessionGuard: Send);

    #[test]
    fn test_metrics_default() {
        let snapshot = RelayMetrics::new().snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
    }

    #[test]
    fn test_session_guard_lifecycle() {
        let metrics = RelayMetrics::shared();

        let first = metrics.session_started();
        let second = metrics.session_started();
        assert_eq!(metrics.snapshot().active_conn_count, 2);
        assert_eq!(metrics.snapshot().total_conn_count, 2);

        drop(first);
        assert_eq!(metrics.snapshot().active_conn_count, 1);
        drop(second);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_conn_count, 0);
        assert_eq!(snapshot.total_conn_count, 2);
    }

    #[test]
    fn test_guard_released_on_unwind() {
        let metrics = RelayMetrics::shared();
        let shared = Arc::clone(&metrics);
        let result = std::panic::catch_unwind(move || {
            let _guard = shared.session_started();
            panic!("session blew up");
        });
        assert!(result.is_err());
        assert_eq!(metrics.snapshot().active_conn_count, 0);
        assert_eq!(metrics.snapshot().total_conn_count, 1);
    }

    #[test]
    fn test_concurrent_sessions_pair_up() {
        let metrics = RelayMetrics::shared();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let _guard = metrics.session_started();
                        metrics.record_client_to_backend(2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_conn_count, 0);
        assert_eq!(snapshot.total_conn_count, 4000);
        assert_eq!(snapshot.bytes_client_to_backend, 8000);
    }

    #[test]
    fn test_to_map_keys() {
        let metrics = RelayMetrics::shared();
        let _guard = metrics.session_started();
        metrics.session_started();

        let map = metrics.snapshot().to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map[ACTIVE_CONN_COUNT], 1);
        assert_eq!(map[TOTAL_CONN_COUNT], 2);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = RelayMetrics::shared();
        let _guard = metrics.session_started();
        metrics.auth_failure();
        metrics.record_backend_to_client(42);

        let prom = metrics.to_prometheus();
        assert!(prom.contains("vaultdb_relay_connections_total 1"));
        assert!(prom.contains("vaultdb_relay_connections_active 1"));
        assert!(prom.contains("vaultdb_relay_session_failures_total{reason=\"auth\"} 1"));
        assert!(prom.contains("vaultdb_relay_bytes_total{direction=\"backend_to_client\"} 42"));
        assert!(prom.contains("# TYPE vaultdb_relay_connections_active gauge"));
    }

    #[tokio::test]
    async fn test_write_prometheus_textfile() {
        let path = std::env::temp_dir().join(format!(
            "vaultdb-relay-metrics-{}.prom",
            std::process::id()
        ));
        let metrics = RelayMetrics::shared();
        metrics.session_relayed();

        metrics.snapshot().write_prometheus_textfile(&path).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, metrics.to_prometheus());
        assert!(written.contains("vaultdb_relay_sessions_relayed_total 1"));

        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        assert!(!PathBuf::from(staging).exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = RelayMetrics::shared();
        metrics.session_relayed();

        let display = format!("{}", metrics.snapshot());
        assert!(display.contains("Relayed:        1"));
    }
}
