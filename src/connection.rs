/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file connection.rs
 * @brief Per-connection read/dispatch/write loop and connection tracking
 */

use crate::diff::DiffSession;
use crate::dispatcher::Dispatcher;
use crate::error::{FauxGateError, Result};
use crate::wire_protocol::{self, WireMessage};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
    Tls,
    /// In-process callers such as an HTTP gateway.
    Embedded,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Unix => write!(f, "unix"),
            Transport::Tls => write!(f, "tls"),
            Transport::Embedded => write!(f, "embedded"),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionContext {
    pub id: u64,
    pub peer: String,
    pub transport: Transport,
    pub created_at: DateTime<Utc>,
    /// Cancelled when the connection closes or the drain timeout passes.
    pub cancel: CancellationToken,
    pub diff: Option<DiffSession>,
}

impl ConnectionContext {
    pub fn new(
        id: u64,
        peer: String,
        transport: Transport,
        cancel: CancellationToken,
        diff: Option<DiffSession>,
    ) -> Self {
        Self {
            id,
            peer,
            transport,
            created_at: Utc::now(),
            cancel,
            diff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub client_addr: String,
    pub transport: Transport,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub commands_executed: u64,
}

pub struct ConnectionTracker {
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_id: AtomicU64,
    max_connections: u32,
}

impl ConnectionTracker {
    pub fn new(max_connections: u32) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    pub fn add_connection(&self, client_addr: &str, transport: Transport) -> Result<u64> {
        let mut connections = self.connections.lock();

        if connections.len() >= self.max_connections as usize {
            return Err(FauxGateError::Internal(format!(
                "Maximum connections ({}) reached",
                self.max_connections
            )));
        }

        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        connections.insert(
            connection_id,
            ConnectionInfo {
                connection_id,
                client_addr: client_addr.to_string(),
                transport,
                connected_at: now,
                last_activity: now,
                commands_executed: 0,
            },
        );

        counter!("fauxgate_connections_total").increment(1);
        gauge!("fauxgate_active_connections").set(connections.len() as f64);
        Ok(connection_id)
    }

    pub fn remove_connection(&self, connection_id: u64) {
        let mut connections = self.connections.lock();
        if connections.remove(&connection_id).is_some() {
            gauge!("fauxgate_active_connections").set(connections.len() as f64);
        }
    }

    pub fn increment_commands(&self, connection_id: u64) {
        if let Some(info) = self.connections.lock().get_mut(&connection_id) {
            info.commands_executed += 1;
            info.last_activity = Utc::now();
        }
    }

    pub fn get_connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn get_connection_info(&self, connection_id: u64) -> Option<ConnectionInfo> {
        self.connections.lock().get(&connection_id).cloned()
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().values().cloned().collect()
    }
}

/// Serves one client until it disconnects, sends a malformed frame, or
/// `shutdown` fires. A request already being dispatched runs to completion
/// unless the client hangs up first, which cancels it.
pub async fn serve_connection<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
    connection: ConnectionContext,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(
        connection_id = connection.id,
        peer = %connection.peer,
        transport = %connection.transport,
        "client connected"
    );

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = connection.cancel.cancelled() => break,
            message = wire_protocol::read_message(&mut reader) => message,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(connection_id = connection.id, error = %e, "closing connection");
                break;
            }
        };

        let dispatch = respond(&dispatcher, &connection, message);
        tokio::pin!(dispatch);
        let mut watching = true;
        let mut hung_up = false;
        let result = loop {
            tokio::select! {
                result = &mut dispatch => break result,
                peeked = reader.fill_buf(), if watching => {
                    watching = false;
                    // Pipelined bytes stay buffered for the next read.
                    if !matches!(peeked, Ok(bytes) if !bytes.is_empty()) {
                        debug!(connection_id = connection.id, "client hung up mid-request");
                        hung_up = true;
                        connection.cancel.cancel();
                    }
                }
            }
        };
        if hung_up {
            break;
        }

        let frame = match result {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!(connection_id = connection.id, error = %e, "closing connection");
                break;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            debug!(connection_id = connection.id, error = %e, "write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(connection_id = connection.id, error = %e, "flush failed");
            break;
        }
    }

    dispatcher.close_connection(&connection);
    info!(connection_id = connection.id, "client disconnected");
}

/// Dispatches one message and encodes the reply frame. `Ok(None)` means no
/// reply is expected; `Err` means the connection must close.
async fn respond(
    dispatcher: &Dispatcher,
    connection: &ConnectionContext,
    message: WireMessage,
) -> Result<Option<Vec<u8>>> {
    match message {
        WireMessage::Msg {
            header,
            flags,
            document,
        } => {
            let more_to_come = flags & wire_protocol::MSG_FLAG_MORE_TO_COME != 0;
            let reply = outcome(dispatcher.handle(connection, header.request_id, document).await)?;
            if more_to_come {
                return Ok(None);
            }
            wire_protocol::encode_op_msg(wire_protocol::next_request_id(), header.request_id, 0, &reply)
                .map(Some)
        }
        WireMessage::Query {
            header,
            full_collection_name,
            query,
            ..
        } => {
            let reply = match full_collection_name.strip_suffix(".$cmd") {
                Some(database) if !database.is_empty() => {
                    let document = legacy_command(query, database);
                    outcome(dispatcher.handle(connection, header.request_id, document).await)?
                }
                _ => doc! {
                    "ok": 0.0,
                    "errmsg": format!(
                        "OP_QUERY is only supported for commands, not for namespace {}",
                        full_collection_name
                    ),
                    "code": 352,
                    "codeName": "UnsupportedOpQueryCommand",
                },
            };
            wire_protocol::encode_op_reply(wire_protocol::next_request_id(), header.request_id, &reply)
                .map(Some)
        }
        WireMessage::Reply { .. } => Err(FauxGateError::WireProtocol(
            "clients must not send OP_REPLY".to_string(),
        )),
    }
}

fn outcome(result: Result<Document>) -> Result<Document> {
    match result {
        Ok(reply) => Ok(reply),
        Err(e) if e.is_connection_fatal() => Err(e),
        Err(e) => Ok(e.to_document()),
    }
}

/// Unwraps `{$query: {...}}` and stamps the target database.
fn legacy_command(query: Document, database: &str) -> Document {
    let mut document = match query.get("$query") {
        Some(Bson::Document(inner)) => inner.clone(),
        _ => query,
    };
    if !document.contains_key("$db") {
        document.insert("$db", database);
    }
    document
}
