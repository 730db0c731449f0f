/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file proxy.rs
 * @brief Backend executor that forwards commands to a native wire server
 */

use crate::backend::{check_reply, BackendExecutor, CallContext};
use crate::error::{FauxGateError, Result};
use crate::listener::AnyStream;
use crate::wire_protocol::{self, WireMessage};
use async_trait::async_trait;
use bson::Document;
use parking_lot::Mutex;
use rustls::ServerName;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const MAX_IDLE: usize = 8;

/// Speaks OP_MSG to a reference server. Connections are reused through a
/// small idle list; a connection that saw an error is discarded.
pub struct ProxyExecutor {
    addr: String,
    connect_timeout: Duration,
    tls: Option<(TlsConnector, ServerName)>,
    idle: Mutex<Vec<AnyStream>>,
}

impl ProxyExecutor {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            tls: None,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Wraps every new connection in TLS, checking the certificate against
    /// `server_name`.
    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    async fn connect(&self) -> Result<AnyStream> {
        if let Some(stream) = self.idle.lock().pop() {
            return Ok(stream);
        }
        tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| {
                FauxGateError::BackendUnavailable(format!("connect to {} timed out", self.addr))
            })?
    }

    async fn open(&self) -> Result<AnyStream> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            FauxGateError::BackendUnavailable(format!("connect to {} failed: {}", self.addr, e))
        })?;
        let _ = stream.set_nodelay(true);

        let stream = match &self.tls {
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| {
                        FauxGateError::BackendUnavailable(format!(
                            "TLS handshake with {} failed: {}",
                            self.addr, e
                        ))
                    })?;
                AnyStream::Tls(Box::new(stream.into()))
            }
            None => AnyStream::Tcp(stream),
        };
        debug!(addr = %self.addr, tls = self.tls.is_some(), "opened reference connection");
        Ok(stream)
    }

    fn release(&self, stream: AnyStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(stream);
        }
    }

    async fn round_trip(&self, stream: &mut AnyStream, request: &Document) -> Result<Document> {
        let request_id = wire_protocol::next_request_id();
        let frame = wire_protocol::encode_op_msg(request_id, 0, 0, request)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        match wire_protocol::read_message(stream).await? {
            Some(WireMessage::Msg { header, document, .. }) if header.response_to == request_id => {
                Ok(document)
            }
            Some(other) => Err(FauxGateError::WireProtocol(format!(
                "unexpected reply to request {}: op code {} responding to {}",
                request_id,
                other.header().op_code,
                other.header().response_to
            ))),
            None => Err(FauxGateError::BackendUnavailable(format!(
                "{} closed the connection",
                self.addr
            ))),
        }
    }
}

#[async_trait]
impl BackendExecutor for ProxyExecutor {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn execute(&self, ctx: &CallContext, database: &str, command: &Document) -> Result<Document> {
        let mut request = command.clone();
        request.insert("$db", database);

        ctx.run(async {
            let mut stream = self.connect().await?;
            match self.round_trip(&mut stream, &request).await {
                Ok(reply) => {
                    self.release(stream);
                    check_reply(reply)
                }
                Err(FauxGateError::Network(e)) => Err(FauxGateError::BackendUnavailable(format!(
                    "{}: {}",
                    self.addr, e
                ))),
                Err(e) => Err(e),
            }
        })
        .await
    }
}
