//! Server side of the MySQL connection phase.
//!
//! [`accept`] greets a raw client socket, authenticates it through a
//! [`CredentialProvider`] and, once the client is known to be legitimate,
//! hands control to a [`HandshakeSetup`] capability exactly once before
//! answering the client with OK. The setup output (typically a backend
//! connection) is returned alongside the negotiated client connection.
//!
//! Only `mysql_native_password` is spoken to clients; clients that start with
//! another plugin are switched to it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use super::auth::{generate_scramble, verify_native_response};
use super::packets::*;
use super::parser::*;
use crate::auth::CredentialProvider;
use crate::error::{RelayError, Result};

/// Greeting and negotiation parameters.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Version string shown to clients
    pub server_version: String,
    /// Capabilities advertised to clients
    pub capabilities: u32,
    /// Default collation advertised in the greeting
    pub character_set: u8,
    /// Bound on each client read during the handshake
    pub handshake_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            capabilities: DEFAULT_SERVER_CAPABILITIES,
            character_set: DEFAULT_COLLATION_ID,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

/// What the client negotiated, as seen by the setup capability.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    response: HandshakeResponse41,
    capabilities: u32,
    connection_id: u32,
}

impl ClientHandshake {
    /// Username (alias) the client logged in with.
    pub fn user(&self) -> &str {
        &self.response.username
    }

    /// Collation id the client requested; 0 means none.
    pub fn charset(&self) -> u8 {
        self.response.character_set
    }

    /// Capabilities both sides agreed on.
    pub fn capability(&self) -> u32 {
        self.capabilities
    }

    /// Whether the client negotiated `flag`.
    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    pub fn database(&self) -> Option<&str> {
        self.response.database.as_deref()
    }

    /// Plugin the client first authenticated with.
    pub fn auth_plugin(&self) -> &str {
        self.response
            .auth_plugin_name
            .as_deref()
            .unwrap_or(MYSQL_NATIVE_PASSWORD)
    }

    pub fn program_name(&self) -> Option<&str> {
        self.response.program_name()
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(user: &str, charset: u8, capabilities: u32) -> Self {
        Self {
            response: HandshakeResponse41 {
                capability_flags: capabilities,
                character_set: charset,
                username: user.to_string(),
                ..HandshakeResponse41::default()
            },
            capabilities,
            connection_id: 1,
        }
    }
}

/// Prepares whatever the session needs once the client is authenticated.
///
/// Invoked exactly once per successful login, after the credential check and
/// before the client receives OK. On error nothing it created may stay open;
/// the client receives an ERR carrying the error message.
#[async_trait]
pub trait HandshakeSetup: Send + Sync {
    type Backend: Send;

    async fn setup(&self, client: &ClientHandshake) -> Result<Self::Backend>;
}

/// A client connection whose handshake completed.
pub struct ServerConn<S> {
    stream: S,
    client: ClientHandshake,
}

impl<S> ServerConn<S> {
    pub fn user(&self) -> &str {
        self.client.user()
    }

    pub fn charset(&self) -> u8 {
        self.client.charset()
    }

    pub fn capability(&self) -> u32 {
        self.client.capability()
    }

    pub fn client(&self) -> &ClientHandshake {
        &self.client
    }

    /// Give up protocol handling and return the raw stream.
    pub fn into_stream(self) -> S {
        self.stream
    }
}

/// Sequence-tracking packet I/O for one handshake.
struct Negotiation<'a, S> {
    stream: &'a mut S,
    seq: u8,
    read_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Negotiation<'_, S> {
    async fn read(&mut self) -> Result<Vec<u8>> {
        let (header, payload) = timeout(self.read_timeout, read_packet(self.stream))
            .await
            .map_err(|_| RelayError::Timeout("waiting for client handshake packet".into()))??;
        self.seq = header.sequence_id.wrapping_add(1);
        Ok(payload)
    }

    async fn write(&mut self, payload: &[u8]) -> Result<()> {
        write_packet(self.stream, self.seq, payload).await?;
        self.seq = self.seq.wrapping_add(1);
        Ok(())
    }

    /// Send `packet` to the client and hand back `err` for the caller to return.
    async fn reject(&mut self, packet: ErrPacket, err: RelayError) -> RelayError {
        debug!(code = packet.error_code, message = %packet.error_message, "Rejecting client handshake");
        if let Err(e) = self.write(&build_err_packet(&packet)).await {
            debug!(error = %e, "Failed to deliver ERR packet to client");
        }
        err
    }
}

/// Run the server side of the handshake on `stream`.
///
/// `peer_host` only appears in "access denied" messages.
pub async fn accept<S, P, H>(
    mut stream: S,
    settings: &ServerSettings,
    connection_id: u32,
    peer_host: &str,
    provider: &P,
    setup: &H,
) -> Result<(ServerConn<S>, H::Backend)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    P: CredentialProvider + ?Sized,
    H: HandshakeSetup + ?Sized,
{
    let scramble = generate_scramble();
    let mut n = Negotiation {
        stream: &mut stream,
        seq: 0,
        read_timeout: settings.handshake_timeout,
    };

    let greeting = HandshakeV10 {
        server_version: settings.server_version.clone(),
        connection_id,
        auth_plugin_data: scramble.to_vec(),
        capability_flags: settings.capabilities,
        character_set: settings.character_set,
        ..HandshakeV10::default()
    };
    n.write(&build_handshake_v10(&greeting)).await?;

    let payload = n.read().await?;
    if is_ssl_request(&payload) {
        warn!(connection_id, "Client requested TLS, which the relay does not terminate");
        return Err(n
            .reject(
                ErrPacket::new(ER_ACCESS_DENIED_ERROR, b"28000", "SSL connections are not supported"),
                RelayError::Protocol("client requested TLS".into()),
            )
            .await);
    }
    let response = match parse_handshake_response41(&payload) {
        Ok(response) => response,
        Err(e) => return Err(n.reject(ErrPacket::bad_handshake(), e).await),
    };

    let client = ClientHandshake {
        capabilities: response.capability_flags & settings.capabilities,
        response,
        connection_id,
    };
    debug!(
        connection_id,
        user = client.user(),
        charset = client.charset(),
        capabilities = format_args!("0x{:08X}", client.capability()),
        plugin = client.auth_plugin(),
        program = ?client.program_name(),
        "Client handshake received"
    );

    let mut auth_response = client.response.auth_response.clone();
    if client.auth_plugin() != MYSQL_NATIVE_PASSWORD {
        if !client.has_capability(CLIENT_PLUGIN_AUTH) {
            return Err(n
                .reject(
                    ErrPacket::not_supported_auth_mode(),
                    RelayError::UnsupportedAuthMethod(client.auth_plugin().to_string()),
                )
                .await);
        }
        debug!(
            from = client.auth_plugin(),
            "Switching client to mysql_native_password"
        );
        n.write(&build_auth_switch_request(MYSQL_NATIVE_PASSWORD, &scramble))
            .await?;
        auth_response = n.read().await?;
    }

    let user = client.user();
    let using_password = !auth_response.is_empty();
    let denied = || ErrPacket::access_denied(user, peer_host, using_password);

    let known = match provider.check_username(user).await {
        Ok(known) => known,
        Err(e) => {
            let message = e.to_string();
            return Err(n
                .reject(
                    ErrPacket::unknown(message.clone()),
                    RelayError::CredentialRetrieval(message),
                )
                .await);
        }
    };
    if !known {
        return Err(n
            .reject(denied(), RelayError::Auth(format!("unknown user '{}'", user)))
            .await);
    }

    let (password, found) = match provider.get_credential(user).await {
        Ok(credential) => credential,
        Err(e) => {
            let message = e.to_string();
            return Err(n
                .reject(
                    ErrPacket::unknown(message.clone()),
                    RelayError::CredentialRetrieval(message),
                )
                .await);
        }
    };
    if !found || !verify_native_response(&password, &scramble, &auth_response) {
        return Err(n
            .reject(
                denied(),
                RelayError::Auth(format!("password mismatch for user '{}'", user)),
            )
            .await);
    }
    drop(password);

    let backend = match setup.setup(&client).await {
        Ok(backend) => backend,
        Err(e) => {
            let packet = ErrPacket::unknown(e.to_string());
            return Err(n.reject(packet, e).await);
        }
    };

    n.write(&build_ok_packet(&OkPacket::default())).await?;
    debug!(connection_id, user = client.user(), "Client handshake complete");

    Ok((ServerConn { stream, client }, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use zeroize::Zeroizing;

    use crate::protocol::mysql::auth::compute_native_response;
    use crate::secret::MemorySecretStore;
    use crate::VaultProvider;

    static_assertions::assert_impl_all!(ClientHandshake: Send, Sync);

    struct CountingSetup {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl HandshakeSetup for CountingSetup {
        type Backend = (String, u8, u32);

        async fn setup(&self, client: &ClientHandshake) -> Result<Self::Backend> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RelayError::Setup("backend unavailable".into()));
            }
            Ok((client.user().to_string(), client.charset(), client.capability()))
        }
    }

    fn setup(fail: bool) -> CountingSetup {
        CountingSetup {
            calls: AtomicUsize::new(0),
            fail,
        }
    }

    fn provider() -> VaultProvider {
        let provider = VaultProvider::new(Arc::new(MemorySecretStore::new()));
        provider.add_user("alice", "secret");
        provider
    }

    /// Minimal client: read the greeting, answer with `password` using the
    /// plugin named in `plugin`, follow one auth switch, return the final packet.
    async fn client_login(
        mut stream: DuplexStream,
        user: &str,
        password: &str,
        plugin: &str,
    ) -> Vec<u8> {
        let (_, greeting) = read_packet(&mut stream).await.unwrap();
        let greeting = parse_handshake_v10(&greeting).unwrap();
        let auth_response = if plugin == MYSQL_NATIVE_PASSWORD {
            compute_native_response(password, greeting.scramble())
        } else {
            vec![0xAA; 32]
        };
        let response = HandshakeResponse41 {
            capability_flags: BASE_CLIENT_CAPABILITIES | CLIENT_MULTI_STATEMENTS,
            character_set: 45,
            username: user.to_string(),
            auth_response,
            auth_plugin_name: Some(plugin.to_string()),
            ..HandshakeResponse41::default()
        };
        write_packet(&mut stream, 1, &build_handshake_response41(&response))
            .await
            .unwrap();

        let (header, reply) = read_packet(&mut stream).await.unwrap();
        if reply.first() == Some(&AUTH_SWITCH_REQUEST) {
            let (switched, data) = parse_auth_switch_request(&reply).unwrap();
            assert_eq!(switched, MYSQL_NATIVE_PASSWORD);
            let answer = compute_native_response(password, &data);
            write_packet(&mut stream, header.sequence_id + 1, &answer)
                .await
                .unwrap();
            let (_, reply) = read_packet(&mut stream).await.unwrap();
            return reply;
        }
        reply
    }

    #[tokio::test]
    async fn test_successful_login_runs_setup_once() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "alice", "secret", MYSQL_NATIVE_PASSWORD));

        let setup = setup(false);
        let (conn, backend) = accept(
            server_side,
            &ServerSettings::default(),
            7,
            "127.0.0.1",
            &provider(),
            &setup,
        )
        .await
        .unwrap();

        assert!(is_ok_packet(&client.await.unwrap()));
        assert_eq!(setup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.user(), "alice");
        assert_eq!(conn.charset(), 45);
        assert_eq!(conn.client().connection_id(), 7);
        assert_eq!(backend.0, "alice");
        assert_eq!(backend.1, 45);
        assert_ne!(backend.2 & CLIENT_MULTI_STATEMENTS, 0);
        assert_eq!(backend.2 & CLIENT_PS_MULTI_RESULTS, 0);
    }

    #[tokio::test]
    async fn test_unknown_user_never_reaches_setup() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "bob", "whatever", MYSQL_NATIVE_PASSWORD));

        let setup = setup(false);
        let err = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "10.1.2.3",
            &provider(),
            &setup,
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_auth());
        assert_eq!(setup.calls.load(Ordering::SeqCst), 0);
        let reply = client.await.unwrap();
        let packet = parse_err_packet(&reply).unwrap();
        assert_eq!(packet.error_code, ER_ACCESS_DENIED_ERROR);
        assert!(packet.error_message.contains("'bob'@'10.1.2.3'"));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "alice", "wrong", MYSQL_NATIVE_PASSWORD));

        let setup = setup(false);
        let err = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "h",
            &provider(),
            &setup,
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_auth());
        assert_eq!(setup.calls.load(Ordering::SeqCst), 0);
        assert!(is_err_packet(&client.await.unwrap()));
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported_to_client() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "alice", "secret", MYSQL_NATIVE_PASSWORD));

        let setup = setup(true);
        let err = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "h",
            &provider(),
            &setup,
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_setup());
        let packet = parse_err_packet(&client.await.unwrap()).unwrap();
        assert_eq!(packet.error_code, ER_UNKNOWN_ERROR);
        assert!(packet.error_message.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn test_other_plugin_is_switched_to_native() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "alice", "secret", CACHING_SHA2_PASSWORD));

        let setup = setup(false);
        let (conn, _) = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "h",
            &provider(),
            &setup,
        )
        .await
        .unwrap();

        assert!(is_ok_packet(&client.await.unwrap()));
        assert_eq!(conn.client().auth_plugin(), CACHING_SHA2_PASSWORD);
    }

    #[tokio::test]
    async fn test_ssl_request_refused() {
        let (server_side, mut client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(async move {
            read_packet(&mut client_side).await.unwrap();
            let mut ssl_request = vec![0u8; 32];
            ssl_request[..4].copy_from_slice(&(CLIENT_PROTOCOL_41 | CLIENT_SSL).to_le_bytes());
            write_packet(&mut client_side, 1, &ssl_request).await.unwrap();
            read_packet(&mut client_side).await.unwrap()
        });

        let setup = setup(false);
        let result = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "h",
            &provider(),
            &setup,
        )
        .await;

        assert!(matches!(result, Err(RelayError::Protocol(_))));
        let (header, reply) = client.await.unwrap();
        assert_eq!(header.sequence_id, 2);
        assert!(is_err_packet(&reply));
    }

    #[tokio::test]
    async fn test_provider_error_surfaces_as_credential_retrieval() {
        struct BrokenProvider;

        #[async_trait]
        impl CredentialProvider for BrokenProvider {
            async fn check_username(&self, _: &str) -> Result<bool> {
                Err(RelayError::Connection("vault offline".into()))
            }

            async fn get_credential(&self, _: &str) -> Result<(Zeroizing<String>, bool)> {
                unreachable!()
            }
        }

        let (server_side, client_side) = tokio::io::duplex(4096);
        let client = tokio::spawn(client_login(client_side, "alice", "secret", MYSQL_NATIVE_PASSWORD));

        let setup = setup(false);
        let err = accept(
            server_side,
            &ServerSettings::default(),
            1,
            "h",
            &BrokenProvider,
            &setup,
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, RelayError::CredentialRetrieval(_)));
        assert!(is_err_packet(&client.await.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let (server_side, _client_side) = tokio::io::duplex(4096);
        let settings = ServerSettings {
            handshake_timeout: Duration::from_secs(5),
            ..ServerSettings::default()
        };
        let setup = setup(false);
        let result = accept(server_side, &settings, 1, "h", &provider(), &setup).await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));
    }
}
