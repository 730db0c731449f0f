/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file lib.rs
 * @brief FauxGate library entry point
 */

pub mod backend;
pub mod commands;
pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod cursor;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod logger;
pub mod params;
pub mod proxy;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod ssl;
pub mod wire_protocol;

pub use backend::{BackendExecutor, CallContext, Continuation, CursorPage};
pub use commands::CommandRegistry;
pub use config::Config;
pub use connection::{ConnectionContext, ConnectionTracker, Transport};
pub use connection_pool::PostgresExecutor;
pub use cursor::{Batch, CursorId, CursorManager, Namespace};
pub use diff::{Comparator, DiffStatsSnapshot, MismatchReport};
pub use dispatcher::{Authorizer, Dispatcher, Request, Services};
pub use error::{FauxGateError, Result};
pub use logger::{init_tracing_logger, LogLevel};
pub use proxy::ProxyExecutor;
pub use server::FauxGateServer;
pub use session::{SessionId, SessionManager};
pub use shutdown::{ShutdownManager, ShutdownReason};
