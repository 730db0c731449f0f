/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file dispatcher.rs
 * @brief Command dispatch: lookup, auth, session touch, deadline, retry, diff
 */

use crate::backend::{BackendExecutor, CallContext};
use crate::commands::{CommandContext, CommandRegistry};
use crate::config::Config;
use crate::connection::{ConnectionContext, ConnectionTracker, Transport};
use crate::cursor::CursorManager;
use crate::diff::{Comparator, DiffJob};
use crate::error::{FauxGateError, Result};
use crate::params;
use crate::session::{SessionId, SessionManager};
use bson::Document;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared state every handler sees.
pub struct Services {
    pub config: Arc<Config>,
    pub backend: Arc<dyn BackendExecutor>,
    pub sessions: Arc<SessionManager>,
    pub cursors: Arc<CursorManager>,
    pub connections: Arc<ConnectionTracker>,
    pub started_at: std::time::Instant,
}

impl Services {
    pub fn new(config: Arc<Config>, backend: Arc<dyn BackendExecutor>) -> Self {
        let cursors = Arc::new(CursorManager::new(&config.cursors, Arc::clone(&backend)));
        let sessions = Arc::new(SessionManager::new(&config.sessions, Arc::clone(&cursors)));
        let connections = Arc::new(ConnectionTracker::new(config.server.max_connections));
        Self {
            config,
            backend,
            sessions,
            cursors,
            connections,
            started_at: std::time::Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: i32,
    pub database: String,
    pub command: String,
    pub document: Document,
    pub session: Option<SessionId>,
    pub max_time: Option<Duration>,
}

impl Request {
    pub fn parse(request_id: i32, command: &str, document: Document) -> Result<Self> {
        let database = match document.get_str("$db") {
            Ok(db) if !db.is_empty() => db.to_string(),
            _ => {
                return Err(FauxGateError::BadValue(
                    "request is missing the required $db field".to_string(),
                ))
            }
        };
        let session = SessionId::from_command(&document)?;
        let max_time = params::max_time_ms(&document)?;

        Ok(Self {
            request_id,
            database,
            command: command.to_string(),
            document,
            session,
            max_time,
        })
    }
}

/// Privilege check hook; credential verification lives elsewhere.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, connection: &ConnectionContext, request: &Request) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _connection: &ConnectionContext, _request: &Request) -> Result<()> {
        Ok(())
    }
}

pub struct Dispatcher {
    registry: CommandRegistry,
    services: Arc<Services>,
    authorizer: Arc<dyn Authorizer>,
    comparator: Option<Arc<Comparator>>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            registry: CommandRegistry::new(),
            services,
            authorizer: Arc::new(AllowAll),
            comparator: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_comparator(mut self, comparator: Arc<Comparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn comparator(&self) -> Option<&Arc<Comparator>> {
        self.comparator.as_ref()
    }

    /// Registers a client connection. Its scope is a child of `parent`.
    pub fn open_connection(
        &self,
        peer: impl Into<String>,
        transport: Transport,
        parent: &CancellationToken,
    ) -> Result<ConnectionContext> {
        let peer = peer.into();
        let id = self.services.connections.add_connection(&peer, transport)?;
        let diff = self
            .comparator
            .as_ref()
            .map(|comparator| {
                comparator.session(id, parent.clone(), Arc::clone(&self.services.cursors))
            });
        Ok(ConnectionContext::new(id, peer, transport, parent.child_token(), diff))
    }

    pub fn close_connection(&self, connection: &ConnectionContext) {
        connection.cancel.cancel();
        self.services.connections.remove_connection(connection.id);
    }

    /// Handles one decoded command document. Errors are client-visible
    /// unless `is_connection_fatal()`.
    pub async fn handle(
        &self,
        connection: &ConnectionContext,
        request_id: i32,
        document: Document,
    ) -> Result<Document> {
        let started = Instant::now();
        let command = document.keys().next().cloned().unwrap_or_default();
        let database = document.get_str("$db").unwrap_or("admin").to_string();
        let mirror = connection.diff.as_ref().map(|_| document.clone());

        let known = self.registry.contains(&command);
        let label = if known { command.clone() } else { "unknown".to_string() };

        let result = self.dispatch(connection, request_id, &command, document).await;

        counter!("fauxgate_commands_total", "command" => label.clone()).increment(1);
        histogram!("fauxgate_command_duration_seconds", "command" => label.clone())
            .record(started.elapsed().as_secs_f64());
        self.services.connections.increment_commands(connection.id);

        if let Err(e) = &result {
            counter!(
                "fauxgate_command_errors_total",
                "command" => label,
                "code" => e.code_name().to_string()
            )
            .increment(1);
            debug!(
                connection_id = connection.id,
                request_id,
                command = %command,
                code = e.code(),
                error = %e,
                "command failed"
            );
        }

        if let (Some(diff), Some(request)) = (&connection.diff, mirror) {
            let primary = match &result {
                Ok(reply) => reply.clone(),
                Err(e) => e.to_document(),
            };
            diff.submit(DiffJob {
                command,
                database,
                request,
                primary,
            });
        }

        result
    }

    async fn dispatch(
        &self,
        connection: &ConnectionContext,
        request_id: i32,
        command: &str,
        document: Document,
    ) -> Result<Document> {
        let entry = self
            .registry
            .get(command)
            .ok_or_else(|| FauxGateError::command_not_found(command))?;

        let request = Request::parse(request_id, command, document)?;

        if entry.requires_auth {
            self.authorizer.authorize(connection, &request)?;
        }

        if let Some(session) = request.session {
            self.services.sessions.touch(session);
        }

        let timeout = request.max_time.or_else(|| {
            let default_ms = self.services.config.database.command_timeout_ms;
            (default_ms > 0).then(|| Duration::from_millis(default_ms))
        });
        let call = CallContext::new(connection.cancel.clone())
            .with_deadline(timeout.map(|t| Instant::now() + t));

        debug!(
            connection_id = connection.id,
            request_id,
            command = %command,
            database = %request.database,
            "dispatching command"
        );

        let ctx = CommandContext {
            services: &self.services,
            connection,
            request: &request,
            call,
        };

        match (entry.handler)(&ctx).await {
            Err(e) if entry.read_only && e.is_retryable() && !ctx.call.is_expired() => {
                warn!(
                    command = %command,
                    error = %e,
                    "transient backend failure, retrying once"
                );
                counter!("fauxgate_command_retries_total", "command" => entry.name).increment(1);
                (entry.handler)(&ctx).await
            }
            other => other,
        }
    }
}
