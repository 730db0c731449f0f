/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file wire_tests.rs
 * @brief End-to-end tests over real sockets
 */

mod common;

use anyhow::{anyhow, Result};
use bson::{doc, Document};
use common::{cursor_id, first_batch, MemoryExecutor};
use fauxgate::backend::{BackendExecutor, CallContext};
use fauxgate::config::{Config, DispatchMode, ReferenceTlsConfig, TlsConfig};
use fauxgate::dispatcher::Dispatcher;
use fauxgate::error::FauxGateError;
use fauxgate::proxy::ProxyExecutor;
use fauxgate::ssl;
use fauxgate::server::FauxGateServer;
use fauxgate::wire_protocol::{self, WireMessage, MSG_FLAG_MORE_TO_COME};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SERVER_CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/tls/server.pem");
const SERVER_KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/tls/server.key");
const TEST_CA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/tls/ca.pem");

struct Running {
    addr: Option<SocketAddr>,
    tls_addr: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    handle: JoinHandle<fauxgate::Result<()>>,
}

impl Running {
    fn addr(&self) -> Result<SocketAddr> {
        self.addr.ok_or_else(|| anyhow!("server has no TCP listener"))
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle).await???;
        Ok(())
    }
}

async fn start(config: Config, backend: Arc<MemoryExecutor>) -> Result<Running> {
    let server = FauxGateServer::new(config, backend).await?;
    let addr = server.tcp_addr();
    let tls_addr = server.tls_addr();
    let dispatcher = Arc::clone(server.dispatcher());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));
    Ok(Running {
        addr,
        tls_addr,
        dispatcher,
        shutdown,
        handle,
    })
}

fn tls_config() -> Config {
    let mut config = Config::default();
    config.server.tcp_addr = String::new();
    config.server.tls_addr = "127.0.0.1:0".to_string();
    config.tls = TlsConfig {
        cert_file: Some(SERVER_CERT.to_string()),
        key_file: Some(SERVER_KEY.to_string()),
        ca_file: None,
    };
    config
}

fn reference_tls() -> ReferenceTlsConfig {
    ReferenceTlsConfig {
        enabled: true,
        ca_file: Some(TEST_CA.to_string()),
        server_name: Some("localhost".to_string()),
        ..ReferenceTlsConfig::default()
    }
}

async fn wait_for_connections(dispatcher: &Dispatcher, count: usize, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if dispatcher.services().connections.get_connection_count() == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn store() -> Arc<MemoryExecutor> {
    let backend = Arc::new(MemoryExecutor::new());
    backend.seed("db.items", 5);
    backend
}

async fn command<S>(stream: &mut S, request_id: i32, document: &Document) -> Result<Document>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = wire_protocol::encode_op_msg(request_id, 0, 0, document)?;
    stream.write_all(&frame).await?;

    match wire_protocol::read_message(stream).await? {
        Some(WireMessage::Msg {
            header, document, ..
        }) => {
            assert_eq!(header.response_to, request_id);
            Ok(document)
        }
        other => Err(anyhow!("unexpected reply {:?}", other)),
    }
}

#[tokio::test]
async fn test_op_msg_round_trip() -> Result<()> {
    let server = start(common::config(), store()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    let hello = command(&mut stream, 1, &doc! { "hello": 1, "$db": "admin" }).await?;
    assert!(hello.get_bool("isWritablePrimary")?);
    assert_eq!(hello.get_f64("ok")?, 1.0);

    let reply = command(
        &mut stream,
        2,
        &doc! { "find": "items", "batchSize": 3, "$db": "db" },
    )
    .await?;
    assert_eq!(first_batch(&reply).len(), 3);
    let id = cursor_id(&reply);
    assert_ne!(id, 0);

    let reply = command(
        &mut stream,
        3,
        &doc! { "getMore": id, "collection": "items", "$db": "db" },
    )
    .await?;
    assert_eq!(cursor_id(&reply), 0);

    // Command errors come back as ok: 0 on a connection that stays open.
    let reply = command(&mut stream, 4, &doc! { "frobnicate": 1, "$db": "db" }).await?;
    assert_eq!(reply.get_f64("ok")?, 0.0);
    assert_eq!(reply.get_i32("code")?, 59);
    let reply = command(&mut stream, 5, &doc! { "ping": 1, "$db": "admin" }).await?;
    assert_eq!(reply.get_f64("ok")?, 1.0);

    drop(stream);
    server.stop().await
}

#[tokio::test]
async fn test_legacy_is_master() -> Result<()> {
    let server = start(common::config(), store()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    let frame = wire_protocol::encode_op_query(11, "admin.$cmd", &doc! { "isMaster": 1 })?;
    stream.write_all(&frame).await?;

    match wire_protocol::read_message(&mut stream).await? {
        Some(WireMessage::Reply {
            header, documents, ..
        }) => {
            assert_eq!(header.response_to, 11);
            assert_eq!(documents.len(), 1);
            assert!(documents[0].get_bool("ismaster")?);
        }
        other => return Err(anyhow!("expected OP_REPLY, got {:?}", other)),
    }

    let frame = wire_protocol::encode_op_query(12, "db.items", &doc! { "x": 1 })?;
    stream.write_all(&frame).await?;
    match wire_protocol::read_message(&mut stream).await? {
        Some(WireMessage::Reply { documents, .. }) => {
            assert_eq!(documents[0].get_i32("code")?, 352);
        }
        other => return Err(anyhow!("expected OP_REPLY, got {:?}", other)),
    }

    drop(stream);
    server.stop().await
}

#[tokio::test]
async fn test_more_to_come_gets_no_reply() -> Result<()> {
    let backend = store();
    let server = start(common::config(), Arc::clone(&backend)).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    let frame = wire_protocol::encode_op_msg(
        20,
        0,
        MSG_FLAG_MORE_TO_COME,
        &doc! { "insert": "items", "documents": [{ "_id": 99 }], "$db": "db" },
    )?;
    stream.write_all(&frame).await?;

    let reply = command(&mut stream, 21, &doc! { "count": "items", "$db": "db" }).await?;
    assert_eq!(reply.get_i32("n")?, 6);

    drop(stream);
    server.stop().await
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() -> Result<()> {
    let server = start(common::config(), store()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    let mut frame = Vec::new();
    frame.extend_from_slice(&4i32.to_le_bytes());
    frame.extend_from_slice(&[0u8; 12]);
    stream.write_all(&frame).await?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        wire_protocol::read_message(&mut stream),
    )
    .await?;
    assert!(!matches!(outcome, Ok(Some(_))));

    // The listener keeps serving other clients.
    let mut other = TcpStream::connect(server.addr()?).await?;
    let reply = command(&mut other, 1, &doc! { "ping": 1, "$db": "admin" }).await?;
    assert_eq!(reply.get_f64("ok")?, 1.0);

    drop(other);
    server.stop().await
}

#[tokio::test]
async fn test_shutdown_closes_idle_clients() -> Result<()> {
    let server = start(common::config(), store()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;
    command(&mut stream, 1, &doc! { "ping": 1, "$db": "admin" }).await?;

    let dispatcher = Arc::clone(&server.dispatcher);
    server.stop().await?;

    let outcome = wire_protocol::read_message(&mut stream).await;
    assert!(!matches!(outcome, Ok(Some(_))));
    assert_eq!(dispatcher.services().connections.get_connection_count(), 0);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_listener() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fauxgate.sock");

    let mut config = Config::default();
    config.server.tcp_addr = String::new();
    config.server.unix_addr = path.to_string_lossy().into_owned();

    let server = start(config, store()).await?;
    assert!(server.addr.is_none());

    let mut stream = tokio::net::UnixStream::connect(&path).await?;
    let reply = command(&mut stream, 1, &doc! { "listCollections": 1, "$db": "db" }).await?;
    assert_eq!(first_batch(&reply).len(), 1);

    drop(stream);
    server.stop().await?;
    assert!(!path.exists());
    Ok(())
}

#[tokio::test]
async fn test_proxy_executor_against_server() -> Result<()> {
    let server = start(common::config(), store()).await?;
    let proxy = ProxyExecutor::new(server.addr()?.to_string(), Duration::from_secs(2));
    let ctx = CallContext::detached();

    let reply = proxy
        .execute(&ctx, "db", &doc! { "find": "items", "batchSize": 2 })
        .await?;
    assert_eq!(first_batch(&reply).len(), 2);
    assert_eq!(proxy.idle_connections(), 1);

    // Error replies surface as the remote server's error.
    let err = proxy
        .execute(&ctx, "db", &doc! { "frobnicate": 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), 59);
    assert_eq!(proxy.idle_connections(), 1);

    server.stop().await
}

#[tokio::test]
async fn test_proxy_unreachable_reference() -> Result<()> {
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    let proxy = ProxyExecutor::new(addr.to_string(), Duration::from_millis(500));

    let err = proxy
        .execute(&CallContext::detached(), "admin", &doc! { "ping": 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), 6);
    Ok(())
}

#[tokio::test]
async fn test_diff_mode_through_proxy() -> Result<()> {
    let reference = start(common::config(), store()).await?;

    let mut config = common::config();
    config.diff.mode = DispatchMode::Diff;
    config.diff.reference_addr = reference.addr()?.to_string();
    let primary = start(config, store()).await?;

    let mut stream = TcpStream::connect(primary.addr()?).await?;
    let reply = command(
        &mut stream,
        1,
        &doc! { "find": "items", "batchSize": 2, "$db": "db" },
    )
    .await?;
    let id = cursor_id(&reply);
    command(
        &mut stream,
        2,
        &doc! { "getMore": id, "collection": "items", "batchSize": 10, "$db": "db" },
    )
    .await?;

    let comparator = Arc::clone(
        primary
            .dispatcher
            .comparator()
            .ok_or_else(|| anyhow!("diff mode has no comparator"))?,
    );
    let mut stats = comparator.stats();
    for _ in 0..300 {
        if stats.matches + stats.mismatches >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = comparator.stats();
    }
    assert_eq!(stats.matches, 2, "{:?}", comparator.recent_mismatches());

    drop(stream);
    primary.stop().await?;
    reference.stop().await
}

#[tokio::test]
async fn test_backend_error_leaves_connection_usable() -> Result<()> {
    let backend = store();
    let server = start(common::config(), backend.clone()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    backend.fail_next(FauxGateError::Backend {
        code: 11000,
        code_name: "DuplicateKey".to_string(),
        message: "E11000 duplicate key error".to_string(),
    });
    let reply = command(
        &mut stream,
        1,
        &doc! { "insert": "items", "documents": [{ "_id": 1 }], "$db": "db" },
    )
    .await?;
    assert_eq!(reply.get_f64("ok")?, 0.0);
    assert_eq!(reply.get_i32("code")?, 11000);
    assert_eq!(reply.get_str("codeName")?, "DuplicateKey");

    let reply = command(&mut stream, 2, &doc! { "find": "items", "$db": "db" }).await?;
    assert_eq!(first_batch(&reply).len(), 5);

    drop(stream);
    server.stop().await
}

#[tokio::test]
async fn test_client_hangup_cancels_request() -> Result<()> {
    let backend = store();
    let server = start(common::config(), backend.clone()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;
    command(&mut stream, 1, &doc! { "ping": 1, "$db": "admin" }).await?;

    backend.set_delay(Some(Duration::from_secs(3)));
    let frame = wire_protocol::encode_op_msg(2, 0, 0, &doc! { "find": "items", "$db": "db" })?;
    stream.write_all(&frame).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.dispatcher.services().connections.get_connection_count(), 1);

    let started = std::time::Instant::now();
    drop(stream);
    assert!(wait_for_connections(&server.dispatcher, 0, Duration::from_secs(1)).await);
    assert!(started.elapsed() < Duration::from_secs(2));

    backend.set_delay(None);
    server.stop().await
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_request_finish() -> Result<()> {
    let backend = store();
    let server = start(common::config(), backend.clone()).await?;
    let mut stream = TcpStream::connect(server.addr()?).await?;

    backend.set_delay(Some(Duration::from_millis(300)));
    let frame = wire_protocol::encode_op_msg(7, 0, 0, &doc! { "find": "items", "$db": "db" })?;
    stream.write_all(&frame).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown.cancel();

    match wire_protocol::read_message(&mut stream).await? {
        Some(WireMessage::Msg { header, document, .. }) => {
            assert_eq!(header.response_to, 7);
            assert_eq!(document.get_f64("ok")?, 1.0);
            assert_eq!(first_batch(&document).len(), 5);
        }
        other => return Err(anyhow!("unexpected reply {:?}", other)),
    }

    // Closed once the reply is out.
    let outcome = wire_protocol::read_message(&mut stream).await;
    assert!(!matches!(outcome, Ok(Some(_))));
    server.stop().await
}

#[tokio::test]
async fn test_tls_listener_round_trip() -> Result<()> {
    let server = start(tls_config(), store()).await?;
    assert!(server.addr.is_none());
    let addr = server.tls_addr.ok_or_else(|| anyhow!("server has no TLS listener"))?;

    let (connector, server_name) = ssl::build_connector(&reference_tls(), &addr.to_string())?;
    let tcp = TcpStream::connect(addr).await?;
    let mut stream = connector.connect(server_name, tcp).await?;

    let hello = command(&mut stream, 1, &doc! { "hello": 1, "$db": "admin" }).await?;
    assert_eq!(hello.get_f64("ok")?, 1.0);
    let reply = command(
        &mut stream,
        2,
        &doc! { "find": "items", "batchSize": 2, "$db": "db" },
    )
    .await?;
    assert_eq!(first_batch(&reply).len(), 2);

    let info = server.dispatcher.services().connections.list_connections();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].transport, fauxgate::connection::Transport::Tls);

    // A plaintext client gets no reply.
    let mut plain = TcpStream::connect(addr).await?;
    let frame = wire_protocol::encode_op_msg(3, 0, 0, &doc! { "ping": 1, "$db": "admin" })?;
    plain.write_all(&frame).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), wire_protocol::read_message(&mut plain)).await?;
    assert!(!matches!(outcome, Ok(Some(_))));

    drop(stream);
    server.stop().await
}

#[tokio::test]
async fn test_proxy_executor_over_tls() -> Result<()> {
    let server = start(tls_config(), store()).await?;
    let addr = server.tls_addr.ok_or_else(|| anyhow!("server has no TLS listener"))?;

    let (connector, server_name) = ssl::build_connector(&reference_tls(), &addr.to_string())?;
    let proxy = ProxyExecutor::new(addr.to_string(), Duration::from_secs(2)).with_tls(connector, server_name);
    assert!(proxy.is_tls());

    let ctx = CallContext::detached();
    let reply = proxy
        .execute(&ctx, "db", &doc! { "find": "items", "batchSize": 3 })
        .await?;
    assert_eq!(first_batch(&reply).len(), 3);
    let reply = proxy.execute(&ctx, "admin", &doc! { "ping": 1 }).await?;
    assert_eq!(reply.get_f64("ok")?, 1.0);
    assert_eq!(proxy.idle_connections(), 1);

    // Without TLS the handshake never completes.
    let plain = ProxyExecutor::new(addr.to_string(), Duration::from_millis(500));
    let err = plain
        .execute(&CallContext::detached().with_timeout(Duration::from_secs(2)), "admin", &doc! { "ping": 1 })
        .await
        .unwrap_err();
    assert!(err.code() == 6 || err.code() == 50, "{:?}", err);

    server.stop().await
}
