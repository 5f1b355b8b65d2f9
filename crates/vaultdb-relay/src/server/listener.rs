//! TCP listener accepting MySQL clients

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, TcpListener};
use tokio_util::sync::CancellationToken;

use super::buffer_pool::BufferPool;
use super::metrics::RelayMetrics;
use super::session::{handle_session, SessionContext};
use crate::auth::{BackendResolver, CredentialProvider};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::protocol::mysql::ServerSettings;

/// A bound relay, ready to accept clients.
///
/// Every accepted connection runs in its own task. Shutdown is driven by the
/// [`CancellationToken`] passed to [`Relay::bind`]: cancelling it closes the
/// listener and ends every live session.
pub struct Relay {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    next_connection_id: u32,
}

impl Relay {
    /// Bind the configured listen address.
    ///
    /// The address must resolve to an IPv4 socket address. Any failure here is
    /// fatal and reported as [`RelayError::Bind`].
    pub async fn bind(
        config: &Config,
        provider: Arc<dyn CredentialProvider>,
        resolver: Arc<dyn BackendResolver>,
        metrics: Arc<RelayMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            config.server.listen_address, config.server.listen_port
        );
        let ipv4 = lookup_host(&addr)
            .await
            .map_err(|e| RelayError::Bind(format!("cannot resolve {}: {}", addr, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| RelayError::Bind(format!("{} has no IPv4 address", addr)))?;

        let listener = TcpListener::bind(ipv4)
            .await
            .map_err(|e| RelayError::Bind(format!("{}: {}", ipv4, e)))?;
        info!(address = %listener.local_addr()?, "Listening for MySQL clients");

        let settings = ServerSettings {
            server_version: config.server.server_version.clone(),
            handshake_timeout: config.server.handshake_timeout(),
            ..ServerSettings::default()
        };

        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                provider,
                resolver,
                settings,
                connect_timeout: config.server.connect_timeout(),
                metrics,
                pool: BufferPool::default(),
                shutdown,
            }),
            next_connection_id: 1,
        })
    }

    /// Get the local address the listener is bound to.
    ///
    /// This is useful when binding to port 0 to get an OS-assigned port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.ctx.metrics)
    }

    /// Run the accept loop until shutdown.
    ///
    /// Returns `Ok` on shutdown or end of stream. Any other accept error stops
    /// the listener and is returned as [`RelayError::Accept`]; there is no retry.
    pub async fn run(self) -> Result<()> {
        let Relay {
            listener,
            ctx,
            mut next_connection_id,
        } = self;

        let result = loop {
            tokio::select! {
                biased;

                _ = ctx.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping listener");
                    break Ok(());
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection_id = next_connection_id;
                        next_connection_id = next_connection_id.wrapping_add(1);

                        let active = ctx.metrics.session_started();
                        debug!(%peer, connection_id, "Accepted connection");
                        tokio::spawn(handle_session(
                            Arc::clone(&ctx),
                            stream,
                            peer,
                            connection_id,
                            active,
                        ));
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        info!("Listener reached end of stream");
                        break Ok(());
                    }
                    Err(e) => {
                        ctx.metrics.accept_error();
                        error!(error = %e, "Accept failed, stopping listener");
                        break Err(RelayError::Accept(e.to_string()));
                    }
                },
            }
        };
        drop(listener);

        let snapshot = ctx.metrics.snapshot();
        info!(
            total = snapshot.total_conn_count,
            active = snapshot.active_conn_count,
            "Listener stopped"
        );
        result
    }
}
