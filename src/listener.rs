/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file listener.rs
 * @brief TCP, Unix socket and TLS accept loops with graceful drain
 */

use crate::config::ServerConfig;
use crate::connection::{serve_connection, Transport};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A client stream accepted by a listener, or a stream towards the
/// reference server in diff mode.
pub enum AnyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AnyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_flush(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AnyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            AnyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub struct Listener {
    tcp: Option<TcpListener>,
    unix: Option<(UnixListener, PathBuf)>,
    tls: Option<(TcpListener, TlsAcceptor)>,
    dispatcher: Arc<Dispatcher>,
    drain_timeout: Duration,
}

impl Listener {
    /// Binds every configured transport. Port 0 picks a free port; read it
    /// back with `tcp_addr()` / `tls_addr()`.
    pub async fn bind(
        config: &ServerConfig,
        acceptor: Option<TlsAcceptor>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let tcp = if config.tcp_addr.is_empty() {
            None
        } else {
            let listener = TcpListener::bind(&config.tcp_addr).await.map_err(|e| {
                error!(addr = %config.tcp_addr, error = %e, "failed to bind TCP listener");
                e
            })?;
            info!(addr = %listener.local_addr()?, "listening on TCP");
            Some(listener)
        };

        let unix = if config.unix_addr.is_empty() {
            None
        } else {
            let path = PathBuf::from(&config.unix_addr);
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "removed stale socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to bind Unix listener");
                e
            })?;
            info!(path = %path.display(), "listening on Unix socket");
            Some((listener, path))
        };

        let tls = match (config.tls_addr.is_empty(), acceptor) {
            (true, _) => None,
            (false, Some(acceptor)) => {
                let listener = TcpListener::bind(&config.tls_addr).await.map_err(|e| {
                    error!(addr = %config.tls_addr, error = %e, "failed to bind TLS listener");
                    e
                })?;
                info!(addr = %listener.local_addr()?, "listening on TLS");
                Some((listener, acceptor))
            }
            (false, None) => {
                return Err(crate::error::FauxGateError::Config(
                    "tls_addr is set but no TLS acceptor was provided".to_string(),
                ))
            }
        };

        Ok(Self {
            tcp,
            unix,
            tls,
            dispatcher,
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn unix_addr(&self) -> Option<&Path> {
        self.unix.as_ref().map(|(_, path)| path.as_path())
    }

    /// Accepts until `shutdown` fires, then drains. Connections still open
    /// after the drain timeout have their scopes cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Listener {
            tcp,
            unix,
            tls,
            dispatcher,
            drain_timeout,
        } = self;

        let force = CancellationToken::new();
        let mut client_tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }

                res = accept_tcp(tcp.as_ref()) => match res {
                    Ok((socket, addr)) => {
                        let _ = socket.set_nodelay(true);
                        spawn_client(&mut client_tasks, &dispatcher, AnyStream::Tcp(socket),
                            addr.to_string(), Transport::Tcp, &shutdown, &force);
                    }
                    Err(e) => error!(error = %e, "failed to accept TCP connection"),
                },

                res = accept_unix(unix.as_ref().map(|(l, _)| l)) => match res {
                    Ok(socket) => {
                        spawn_client(&mut client_tasks, &dispatcher, AnyStream::Unix(socket),
                            "unix".to_string(), Transport::Unix, &shutdown, &force);
                    }
                    Err(e) => error!(error = %e, "failed to accept Unix connection"),
                },

                res = accept_tcp(tls.as_ref().map(|(l, _)| l)) => match res {
                    Ok((socket, addr)) => {
                        if let Some((_, acceptor)) = &tls {
                            let acceptor = acceptor.clone();
                            let dispatcher = Arc::clone(&dispatcher);
                            let shutdown = shutdown.clone();
                            let force = force.clone();
                            client_tasks.spawn(async move {
                                let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await;
                                match handshake {
                                    Ok(Ok(stream)) => {
                                        let stream = AnyStream::Tls(Box::new(stream.into()));
                                        match dispatcher.open_connection(addr.to_string(), Transport::Tls, &force) {
                                            Ok(connection) => {
                                                serve_connection(stream, Arc::clone(&dispatcher), connection, shutdown).await;
                                            }
                                            Err(e) => warn!(peer = %addr, error = %e, "rejecting connection"),
                                        }
                                    }
                                    Ok(Err(e)) => warn!(peer = %addr, error = %e, "TLS handshake failed"),
                                    Err(_) => warn!(peer = %addr, "TLS handshake timed out"),
                                }
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "failed to accept TLS connection"),
                },

                Some(res) = client_tasks.join_next() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!("a connection worker panicked: {e:?}");
                        }
                    }
                }
            }
        }

        drop(tcp);
        drop(tls);
        let unix_path = unix.map(|(listener, path)| {
            drop(listener);
            path
        });

        let drained = tokio::time::timeout(drain_timeout, async {
            while client_tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = client_tasks.len(),
                "drain timeout passed, cancelling in-flight requests"
            );
            force.cancel();
            while client_tasks.join_next().await.is_some() {}
        }
        force.cancel();

        if let Some(path) = unix_path {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove socket file");
            }
        }

        info!("all client connections closed");
        Ok(())
    }
}

fn spawn_client(
    client_tasks: &mut JoinSet<()>,
    dispatcher: &Arc<Dispatcher>,
    stream: AnyStream,
    peer: String,
    transport: Transport,
    shutdown: &CancellationToken,
    force: &CancellationToken,
) {
    match dispatcher.open_connection(peer.clone(), transport, force) {
        Ok(connection) => {
            client_tasks.spawn(serve_connection(
                stream,
                Arc::clone(dispatcher),
                connection,
                shutdown.clone(),
            ));
        }
        Err(e) => warn!(peer = %peer, error = %e, "rejecting connection"),
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}
