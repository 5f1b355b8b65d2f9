//! vaultdb-relay - MySQL relay with secret-store backed credential injection
//!
//! Clients log in to the relay with an alias and its relay password; the relay
//! dials the backend registered for that alias with the real credentials and
//! then splices bytes between the two connections.

use clap::Parser;
use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vaultdb_relay::auth::BackendRecord;
use vaultdb_relay::{
    config, MemorySecretStore, MetricsSnapshot, Relay, RelayError, RelayMetrics, Result,
    SecretStore, SecretStoreResolver, VaultProvider,
};

#[derive(Parser)]
#[command(name = "vaultdb-relay")]
#[command(version)]
#[command(about = "MySQL relay with secret-store backed credential injection")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override listen address
    #[arg(long)]
    listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config)?;
    if let Some(addr) = cli.listen_address {
        config.server.listen_address = addr;
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }

    // Priority: --verbose flag, then RUST_LOG, then the configured level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();
    std::panic::set_hook(Box::new(|panic| {
        let backtrace = Backtrace::force_capture();
        error!(%panic, %backtrace, "Panic");
    }));

    info!("Starting vaultdb-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", cli.config);

    let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let provider = VaultProvider::new(Arc::clone(&store));
    for (alias, password) in &config.users {
        provider.add_user(alias, password);
    }
    let resolver = SecretStoreResolver::new(Arc::clone(&store));
    for (alias, backend) in &config.backends {
        resolver.register(alias, &BackendRecord::from(backend));
        info!("  {} -> {}:{}", alias, backend.host, backend.port);
    }
    for alias in config.users.keys() {
        if !config.backends.contains_key(alias) {
            warn!("User '{}' has no backend; its logins will fail setup", alias);
        }
    }

    let metrics = RelayMetrics::shared();
    let shutdown = CancellationToken::new();
    let relay = Relay::bind(
        &config,
        Arc::new(provider),
        Arc::new(resolver),
        Arc::clone(&metrics),
        shutdown.clone(),
    )
    .await?;
    info!(
        "Relay ready: listening on {} ({} users, {} backends)",
        relay.local_addr()?,
        config.users.len(),
        config.backends.len()
    );

    let mut relay_task = tokio::spawn(relay.run());

    let textfile = config.server.metrics_textfile.clone();
    if config.server.metrics_log_interval_secs > 0 {
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();
        let textfile = textfile.clone();
        let period = Duration::from_secs(config.server.metrics_log_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = metrics.snapshot();
                        info!(
                            active = snapshot.active_conn_count,
                            total = snapshot.total_conn_count,
                            relayed = snapshot.sessions_relayed,
                            auth_failures = snapshot.auth_failures,
                            setup_failures = snapshot.setup_failures,
                            "Metrics"
                        );
                        if let Some(path) = &textfile {
                            write_textfile(&snapshot, path).await;
                        }
                    }
                }
            }
        });
    }

    let finished = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
            None
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, initiating shutdown...");
            None
        }
        joined = &mut relay_task => Some(joined),
    };

    shutdown.cancel();
    let joined = match finished {
        Some(joined) => joined,
        None => relay_task.await,
    };
    let result = joined
        .map_err(|e| RelayError::Accept(format!("listener task failed: {}", e)))
        .and_then(|result| result);

    let snapshot = metrics.snapshot();
    if let Some(path) = &textfile {
        write_textfile(&snapshot, path).await;
    }
    info!("Shutdown complete\n{}", snapshot);
    if let Err(ref e) = result {
        error!("Relay stopped: {}", e);
    }
    result
}

async fn write_textfile(snapshot: &MetricsSnapshot, path: &Path) {
    if let Err(e) = snapshot.write_prometheus_textfile(path).await {
        warn!("Failed to write metrics to {}: {}", path.display(), e);
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
