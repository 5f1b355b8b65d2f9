//! Client side of the MySQL connection phase, used to dial backends.
//!
//! [`BackendConn::connect`] opens a TCP connection, answers the greeting with
//! the configured credentials and follows auth switches and the
//! `caching_sha2_password` continuation until the server says OK. Backends
//! are reached over plain TCP, so full authentication always goes through
//! the server's RSA public key; the password is never sent in cleartext. The
//! authenticated stream is then handed to the relay untouched.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::auth::{compute_auth_for_plugin, encrypt_password_rsa};
use super::packets::*;
use super::parser::*;
use crate::error::{RelayError, Result};

/// Per-connection overrides applied before the handshake response is built.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    collation_id: Option<u8>,
    capability_flags: u32,
}

impl ConnectOptions {
    /// Request `collation_id` instead of the server default.
    pub fn set_collation_id(&mut self, collation_id: u8) {
        self.collation_id = Some(collation_id);
    }

    /// Ask for an additional capability bit.
    pub fn set_capability(&mut self, flag: u32) {
        self.capability_flags |= flag;
    }

    pub fn collation_id(&self) -> Option<u8> {
        self.collation_id
    }

    pub fn capability(&self) -> u32 {
        self.capability_flags
    }
}

/// An authenticated connection to a MySQL server.
#[derive(Debug)]
pub struct BackendConn<S = TcpStream> {
    stream: S,
    server_version: String,
    connection_id: u32,
    capability_flags: u32,
    collation_id: u8,
}

impl BackendConn<TcpStream> {
    /// Dial `address` and log in as `user`.
    ///
    /// `connect_timeout` bounds the TCP connect and, separately, each packet
    /// read during authentication. `configure` may adjust the collation and
    /// capabilities requested from the server.
    pub async fn connect(
        address: &str,
        user: &str,
        password: &str,
        database: Option<&str>,
        connect_timeout: Duration,
        configure: impl FnOnce(&mut ConnectOptions),
    ) -> Result<Self> {
        debug!(address, user, "Connecting to backend");
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RelayError::Connection(format!(
                    "failed to connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(RelayError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    address, connect_timeout
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend socket");
        }

        let mut options = ConnectOptions::default();
        configure(&mut options);
        Self::handshake(stream, user, password, database, connect_timeout, &options).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BackendConn<S> {
    /// Authenticate over an already connected stream.
    pub async fn handshake(
        mut stream: S,
        user: &str,
        password: &str,
        database: Option<&str>,
        read_timeout: Duration,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let (_, payload) = read_with_timeout(&mut stream, read_timeout).await?;
        if is_err_packet(&payload) {
            let err = parse_err_packet(&payload)?;
            return Err(RelayError::Connection(format!("server refused connection: {}", err)));
        }
        let greeting = parse_handshake_v10(&payload)?;
        if greeting.capability_flags & CLIENT_PROTOCOL_41 == 0 {
            return Err(RelayError::Protocol(
                "server does not support protocol 4.1".into(),
            ));
        }
        debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = greeting.auth_plugin(),
            "Backend greeting received"
        );

        let mut requested = BASE_CLIENT_CAPABILITIES | options.capability();
        if database.is_some() {
            requested |= CLIENT_CONNECT_WITH_DB;
        }
        let capability_flags = requested & (greeting.capability_flags | BASE_CLIENT_CAPABILITIES);
        let collation_id = options.collation_id().unwrap_or(greeting.character_set);

        let mut plugin = greeting.auth_plugin().to_string();
        let mut scramble = greeting.scramble().to_vec();
        let mut awaiting_public_key = false;
        let response = HandshakeResponse41 {
            capability_flags,
            character_set: collation_id,
            username: user.to_string(),
            auth_response: compute_auth_for_plugin(&plugin, password, greeting.scramble())?,
            database: database.map(str::to_string),
            auth_plugin_name: Some(plugin.clone()),
            ..HandshakeResponse41::default()
        };
        let mut seq: u8 = 1;
        write_packet(&mut stream, seq, &build_handshake_response41(&response)).await?;

        loop {
            let (header, payload) = read_with_timeout(&mut stream, read_timeout).await?;
            seq = header.sequence_id.wrapping_add(1);

            match payload.first().copied() {
                Some(OK_HEADER) => break,
                Some(ERR_HEADER) => {
                    let err = parse_err_packet(&payload)?;
                    return Err(RelayError::Auth(format!("backend rejected login: {}", err)));
                }
                Some(AUTH_SWITCH_REQUEST) if payload.len() > 1 => {
                    let (next_plugin, data) = parse_auth_switch_request(&payload)?;
                    debug!(from = %plugin, to = %next_plugin, "Backend requested auth switch");
                    let answer = compute_auth_for_plugin(&next_plugin, password, &data)?;
                    write_packet(&mut stream, seq, &answer).await?;
                    plugin = next_plugin;
                    scramble = data;
                    awaiting_public_key = false;
                }
                Some(AUTH_MORE_DATA) if awaiting_public_key => {
                    debug!("Received backend public key");
                    awaiting_public_key = false;
                    let encrypted = encrypt_password_rsa(password, &scramble, &payload[1..])?;
                    write_packet(&mut stream, seq, &encrypted).await?;
                }
                Some(AUTH_MORE_DATA) if payload.get(1) == Some(&CACHING_SHA2_FAST_AUTH_SUCCESS) => {
                    trace!("caching_sha2_password fast auth success");
                }
                Some(AUTH_MORE_DATA) if payload.get(1) == Some(&CACHING_SHA2_FULL_AUTH_REQUIRED) => {
                    debug!("caching_sha2_password full auth requested, asking for public key");
                    write_packet(&mut stream, seq, &[CACHING_SHA2_REQUEST_PUBLIC_KEY]).await?;
                    awaiting_public_key = true;
                }
                _ => {
                    warn!(
                        "Unexpected packet during backend auth: {:02X?}",
                        &payload[..payload.len().min(16)]
                    );
                    return Err(RelayError::Protocol(format!(
                        "unexpected packet during backend auth: 0x{:02X}",
                        payload.first().copied().unwrap_or_default()
                    )));
                }
            }
        }
        debug!(user, plugin = %plugin, "Backend authentication complete");
        Ok(Self {
            stream,
            server_version: greeting.server_version,
            connection_id: greeting.connection_id,
            capability_flags,
            collation_id,
        })
    }
}

impl<S> BackendConn<S> {
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Thread id the server assigned to this connection.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Capabilities sent in the handshake response.
    pub fn capability(&self) -> u32 {
        self.capability_flags
    }

    pub fn collation_id(&self) -> u8 {
        self.collation_id
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

async fn read_with_timeout<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_timeout: Duration,
) -> Result<(PacketHeader, Vec<u8>)> {
    timeout(read_timeout, read_packet(stream))
        .await
        .map_err(|_| RelayError::Timeout("waiting for backend handshake packet".into()))?
}
