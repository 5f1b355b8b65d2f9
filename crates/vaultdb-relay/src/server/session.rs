//! Per-connection handling: handshake, backend setup, splice.

use std::any::Any;
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::buffer_pool::BufferPool;
use super::metrics::{ActiveSessionGuard, RelayMetrics};
use super::relay::Splice;
use crate::auth::{BackendResolver, CredentialProvider};
use crate::error::{RelayError, Result};
use crate::protocol::mysql::{
    self, BackendConn, ClientHandshake, HandshakeSetup, ServerSettings, MIRRORED_CAPABILITIES,
};

/// Everything a session needs, shared by all sessions of one relay.
pub(crate) struct SessionContext {
    pub provider: Arc<dyn CredentialProvider>,
    pub resolver: Arc<dyn BackendResolver>,
    pub settings: ServerSettings,
    pub connect_timeout: Duration,
    pub metrics: Arc<RelayMetrics>,
    pub pool: BufferPool,
    pub shutdown: CancellationToken,
}

/// Run one session to completion.
///
/// Nothing escapes this function: handshake and setup errors are logged and
/// counted, and a panic anywhere in the session is recovered. `active` is held
/// until the very end so the active count drops exactly once.
pub(crate) async fn handle_session(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: u32,
    active: ActiveSessionGuard,
) {
    let session = AssertUnwindSafe(run_session(&ctx, stream, peer, connection_id));
    match session.catch_unwind().await {
        Ok(Ok(())) => {
            debug!(%peer, connection_id, "Connection closed");
        }
        Ok(Err(e)) if e.is_auth() => {
            ctx.metrics.auth_failure();
            info!(%peer, connection_id, error = %e, "Client authentication failed");
        }
        Ok(Err(e)) if e.is_setup() => {
            ctx.metrics.setup_failure();
            warn!(%peer, connection_id, error = %e, "Session setup failed");
        }
        Ok(Err(e)) => {
            debug!(%peer, connection_id, error = %e, "Connection ended during handshake");
        }
        Err(payload) => {
            ctx.metrics.session_panicked();
            error!(
                %peer,
                connection_id,
                panic = panic_message(payload.as_ref()),
                backtrace = %Backtrace::force_capture(),
                "Session panicked, connection closed"
            );
        }
    }
    drop(active);
}

async fn run_session(
    ctx: &SessionContext,
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: u32,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY on client socket");
    }

    let dial = DialBackend {
        resolver: Arc::clone(&ctx.resolver),
        connect_timeout: ctx.connect_timeout,
    };
    let peer_host = peer.ip().to_string();
    let (client, backend) = mysql::server::accept(
        stream,
        &ctx.settings,
        connection_id,
        &peer_host,
        ctx.provider.as_ref(),
        &dial,
    )
    .await?;

    info!(
        %peer,
        connection_id,
        user = client.user(),
        backend_version = backend.server_version(),
        backend_thread = backend.connection_id(),
        "Session established, relaying"
    );
    ctx.metrics.session_relayed();

    let outcome = Splice::new(
        client.into_stream(),
        backend.into_stream(),
        ctx.pool.clone(),
        Arc::clone(&ctx.metrics),
    )
    .run(&ctx.shutdown)
    .await;

    debug!(
        %peer,
        connection_id,
        client_to_backend = outcome.client_to_backend,
        backend_to_client = outcome.backend_to_client,
        shutdown = outcome.shutdown,
        "Relay finished"
    );
    Ok(())
}

/// Setup capability: resolve the alias and log in to its backend.
///
/// The client's collation (when set) and its multi-statement and
/// multi-result capability bits are requested on the backend connection.
struct DialBackend {
    resolver: Arc<dyn BackendResolver>,
    connect_timeout: Duration,
}

#[async_trait]
impl HandshakeSetup for DialBackend {
    type Backend = BackendConn;

    async fn setup(&self, client: &ClientHandshake) -> Result<BackendConn> {
        let params = self
            .resolver
            .resolve(client.user())
            .await
            .map_err(|e| RelayError::Setup(format!("failed to get secret-store mysql info: {}", e)))?;

        let charset = client.charset();
        let capability = client.capability();
        debug!(
            user = client.user(),
            address = %params.address,
            charset,
            "Dialing backend"
        );

        BackendConn::connect(
            &params.address,
            &params.user,
            &params.password,
            params.database.as_deref(),
            self.connect_timeout,
            |options| {
                if charset > 0 {
                    options.set_collation_id(charset);
                }
                for flag in MIRRORED_CAPABILITIES {
                    if capability & flag != 0 {
                        options.set_capability(flag);
                    }
                }
            },
        )
        .await
        .map_err(|e| RelayError::Setup(format!("failed to connect remote mysql: {}", e)))
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
