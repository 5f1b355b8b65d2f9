//! End-to-end tests for vaultdb-relay
//!
//! Each test runs a relay on loopback in front of an in-process fake MySQL
//! backend. The backend speaks the server side of the handshake with the
//! crate's own engine, records what the relay negotiated, and then echoes a
//! fixed reply for every chunk it receives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use vaultdb_relay::auth::{BackendParams, BackendRecord};
use vaultdb_relay::config::load_config_from_str;
use vaultdb_relay::protocol::mysql::{
    server, BackendConn, ClientHandshake, HandshakeSetup, ServerSettings, CLIENT_MULTI_RESULTS,
    CLIENT_MULTI_STATEMENTS, CLIENT_PS_MULTI_RESULTS,
};
use vaultdb_relay::{
    BackendResolver, MemorySecretStore, Relay, RelayMetrics, Result, SecretStore,
    SecretStoreResolver, VaultProvider,
};

/// Default test timeout
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const BACKEND_USER: &str = "app";
const BACKEND_PASSWORD: &str = "app-secret";
const REPLY: &[u8] = b"\x07\x00\x00\x01\x00\x00\x00\x02\x00\x00\x00";

/// What the fake backend saw in a relay's handshake response.
#[derive(Debug, Clone)]
struct SeenHandshake {
    user: String,
    charset: u8,
    capability: u32,
    database: Option<String>,
}

struct RecordHandshake {
    seen: mpsc::UnboundedSender<SeenHandshake>,
}

#[async_trait]
impl HandshakeSetup for RecordHandshake {
    type Backend = ();

    async fn setup(&self, client: &ClientHandshake) -> Result<()> {
        let _ = self.seen.send(SeenHandshake {
            user: client.user().to_string(),
            charset: client.charset(),
            capability: client.capability(),
            database: client.database().map(str::to_string),
        });
        Ok(())
    }
}

struct FakeBackend {
    addr: SocketAddr,
    handshakes: mpsc::UnboundedReceiver<SeenHandshake>,
    received: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn start_backend() -> FakeBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, handshakes) = mpsc::unbounded_channel();
    let (data_tx, received) = mpsc::unbounded_channel();

    let provider = VaultProvider::new(Arc::new(MemorySecretStore::new()));
    provider.add_user(BACKEND_USER, BACKEND_PASSWORD);

    tokio::spawn(async move {
        let mut connection_id = 100;
        while let Ok((stream, _)) = listener.accept().await {
            connection_id += 1;
            let provider = provider.clone();
            let setup = RecordHandshake {
                seen: seen_tx.clone(),
            };
            let data_tx = data_tx.clone();
            tokio::spawn(async move {
                let Ok((conn, ())) = server::accept(
                    stream,
                    &ServerSettings::default(),
                    connection_id,
                    "relay",
                    &provider,
                    &setup,
                )
                .await
                else {
                    return;
                };
                let mut stream = conn.into_stream();
                let mut buf = [0u8; 1024];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let _ = data_tx.send(buf[..n].to_vec());
                    if stream.write_all(REPLY).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    FakeBackend {
        addr,
        handshakes,
        received,
    }
}

/// Delegates to the secret-store resolver, counting calls. Panics for "boom".
struct TestResolver {
    inner: SecretStoreResolver,
    calls: AtomicUsize,
}

#[async_trait]
impl BackendResolver for TestResolver {
    async fn resolve(&self, alias: &str) -> Result<BackendParams> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if alias == "boom" {
            panic!("resolver exploded for {}", alias);
        }
        self.inner.resolve(alias).await
    }
}

struct Harness {
    relay_addr: SocketAddr,
    metrics: Arc<RelayMetrics>,
    resolver: Arc<TestResolver>,
    shutdown: CancellationToken,
    relay_task: JoinHandle<Result<()>>,
    backend: FakeBackend,
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> Harness {
    let backend = start_backend().await;

    let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let provider = VaultProvider::new(Arc::clone(&store));
    provider.add_user("alice", "secret");
    provider.add_user("carol", "carol-pw");
    provider.add_user("boom", "boom-pw");

    let resolver = SecretStoreResolver::new(Arc::clone(&store));
    resolver.register(
        "alice",
        &BackendRecord {
            host: "127.0.0.1".to_string(),
            port: backend.addr.port(),
            username: BACKEND_USER.to_string(),
            password: BACKEND_PASSWORD.to_string(),
            database: Some("appdb".to_string()),
        },
    );
    resolver.register(
        "carol",
        &BackendRecord {
            host: "127.0.0.1".to_string(),
            port: closed_port(),
            username: BACKEND_USER.to_string(),
            password: BACKEND_PASSWORD.to_string(),
            database: None,
        },
    );
    let resolver = Arc::new(TestResolver {
        inner: resolver,
        calls: AtomicUsize::new(0),
    });

    let config = load_config_from_str(
        r#"
server:
  listen_address: "127.0.0.1"
  listen_port: 0
  connect_timeout_secs: 5
  handshake_timeout_secs: 5
"#,
    )
    .unwrap();

    let metrics = RelayMetrics::shared();
    let shutdown = CancellationToken::new();
    let relay = Relay::bind(
        &config,
        Arc::new(provider),
        resolver.clone(),
        Arc::clone(&metrics),
        shutdown.clone(),
    )
    .await
    .unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let relay_task = tokio::spawn(relay.run());

    Harness {
        relay_addr,
        metrics,
        resolver,
        shutdown,
        relay_task,
        backend,
    }
}

async fn login(
    relay_addr: SocketAddr,
    user: &str,
    password: &str,
) -> vaultdb_relay::Result<BackendConn> {
    timeout(
        TEST_TIMEOUT,
        BackendConn::connect(
            &relay_addr.to_string(),
            user,
            password,
            None,
            TEST_TIMEOUT,
            |options| {
                options.set_collation_id(45);
                options.set_capability(CLIENT_MULTI_STATEMENTS);
            },
        ),
    )
    .await
    .expect("login timed out")
}

/// Poll until `check` holds or the test timeout elapses.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

async fn receive_exactly(received: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let chunk = timeout(TEST_TIMEOUT, received.recv())
            .await
            .expect("backend received nothing")
            .unwrap();
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_known_user_is_relayed_to_backend() {
    let mut h = start_relay().await;

    let conn = login(h.relay_addr, "alice", "secret").await.unwrap();

    let seen = timeout(TEST_TIMEOUT, h.backend.handshakes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.user, BACKEND_USER);
    assert_eq!(seen.database.as_deref(), Some("appdb"));
    assert_eq!(seen.charset, 45);
    assert_ne!(seen.capability & CLIENT_MULTI_STATEMENTS, 0);
    assert_eq!(seen.capability & CLIENT_MULTI_RESULTS, 0);
    assert_eq!(seen.capability & CLIENT_PS_MULTI_RESULTS, 0);

    let mut client = conn.into_stream();
    let query = b"\x09\x00\x00\x00\x03SELECT 1";
    client.write_all(query).await.unwrap();
    assert_eq!(receive_exactly(&mut h.backend.received, query.len()).await, query);
    assert_eq!(read_exactly(&mut client, REPLY.len()).await, REPLY);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.active_conn_count, 1);
    assert_eq!(snapshot.total_conn_count, 1);
    assert_eq!(snapshot.sessions_relayed, 1);

    drop(client);
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.total_conn_count, 1);
    assert_eq!(snapshot.bytes_client_to_backend, query.len() as u64);
    assert_eq!(snapshot.bytes_backend_to_client, REPLY.len() as u64);

    h.shutdown.cancel();
    timeout(TEST_TIMEOUT, h.relay_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_user_never_dials() {
    let mut h = start_relay().await;

    let err = login(h.relay_addr, "bob", "whatever").await.unwrap_err();
    assert!(err.is_auth());
    assert!(err.to_string().contains("Access denied for user 'bob'"));

    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.total_conn_count, 1);
    assert_eq!(snapshot.auth_failures, 1);
    assert_eq!(snapshot.sessions_relayed, 0);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    assert!(h.backend.handshakes.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_password_never_dials() {
    let h = start_relay().await;

    let err = login(h.relay_addr, "alice", "not-the-secret").await.unwrap_err();
    assert!(err.is_auth());

    assert!(eventually(|| h.metrics.snapshot().auth_failures == 1).await);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backend_record_keys_cannot_log_in() {
    let mut h = start_relay().await;

    let attempts = [
        ("mysql_alice.HOST", "127.0.0.1"),
        ("mysql_alice.PASSWORD", BACKEND_PASSWORD),
        ("mysql_alice.PASSWORD", "guess"),
        ("mysql_alice.USERNAME", BACKEND_USER),
    ];
    for (user, password) in attempts {
        let err = login(h.relay_addr, user, password).await.unwrap_err();
        assert!(err.is_auth(), "{}: {}", user, err);
        assert!(
            err.to_string().contains(&format!("Access denied for user '{}'", user)),
            "{}: {}",
            user,
            err
        );
    }

    assert!(eventually(|| h.metrics.snapshot().auth_failures == attempts.len() as u64).await);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.setup_failures, 0);
    assert_eq!(snapshot.sessions_relayed, 0);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    assert!(h.backend.handshakes.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dial_failure_aborts_before_relay() {
    let h = start_relay().await;

    let err = login(h.relay_addr, "carol", "carol-pw").await.unwrap_err();
    assert!(err.to_string().contains("failed to connect remote mysql"));

    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.total_conn_count, 1);
    assert_eq!(snapshot.setup_failures, 1);
    assert_eq!(snapshot.sessions_relayed, 0);
    assert_eq!(snapshot.bytes_client_to_backend, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_backend_record_aborts_setup() {
    let h = start_relay().await;

    // alice can still log in to the relay, but the backend record is gone.
    h.resolver.inner.unregister("alice");
    let err = login(h.relay_addr, "alice", "secret").await.unwrap_err();
    assert!(err.to_string().contains("failed to get secret-store mysql info"));
    assert!(eventually(|| h.metrics.snapshot().setup_failures == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_ends_active_session() {
    let mut h = start_relay().await;

    let conn = login(h.relay_addr, "alice", "secret").await.unwrap();
    let mut client = conn.into_stream();
    client.write_all(b"\x01\x00\x00\x00\x0e").await.unwrap();
    receive_exactly(&mut h.backend.received, 5).await;
    read_exactly(&mut client, REPLY.len()).await;

    h.shutdown.cancel();

    // The relay closes the client side promptly.
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("session was not torn down on shutdown")
        .unwrap();
    assert!(rest.is_empty());

    timeout(TEST_TIMEOUT, h.relay_task).await.unwrap().unwrap().unwrap();
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);
    assert!(TcpStream::connect(h.relay_addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_panic_is_contained() {
    let h = start_relay().await;

    let result = login(h.relay_addr, "boom", "boom-pw").await;
    assert!(result.is_err());

    assert!(eventually(|| h.metrics.snapshot().session_panics == 1).await);
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);
    assert_eq!(h.metrics.snapshot().total_conn_count, 1);

    // The relay keeps serving other clients.
    let conn = login(h.relay_addr, "alice", "secret").await.unwrap();
    assert_eq!(h.metrics.snapshot().total_conn_count, 2);
    drop(conn);
    assert!(!h.relay_task.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_are_counted() {
    let h = start_relay().await;

    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(login(h.relay_addr, "alice", "secret").await.unwrap());
    }
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 5).await);

    sessions.truncate(2);
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 2).await);
    drop(sessions);
    assert!(eventually(|| h.metrics.snapshot().active_conn_count == 0).await);

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.total_conn_count, 5);
    assert_eq!(snapshot.to_map()["total_conn_count"], 5);
}
