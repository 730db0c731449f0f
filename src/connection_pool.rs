/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file connection_pool.rs
 * @brief Pooled PostgreSQL executor over the DocumentDB SQL API
 */

use crate::backend::{BackendExecutor, CallContext};
use crate::config::DatabaseConfig;
use crate::error::{FauxGateError, Result};
use crate::params;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime, Timeouts};
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, NoTls, Row};
use tracing::{debug, info, warn};

/// How a command maps onto a `documentdb_api` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlCall {
    /// `(cursorPage, continuation)` of a cursor-producing function.
    CursorPage { sql: &'static str, spec: Document },
    GetMore {
        spec: Document,
        continuation: Document,
    },
    /// A single `bson` result document.
    Document { sql: &'static str, spec: Document },
    /// Same, for functions that take no database argument.
    Global { sql: &'static str, spec: Document },
    /// `(p_result, p_success)` of a write function.
    Write { sql: &'static str, spec: Document },
    Create { spec: Document },
    DropCollection { collection: String },
    DropDatabase,
    /// Answered without a round trip.
    Local(Document),
}

const FIND_SQL: &str = "SELECT cursorpage::bytea, continuation::bytea \
     FROM documentdb_api.find_cursor_first_page($1, $2::bytea::documentdb_core.bson)";
const AGGREGATE_SQL: &str = "SELECT cursorpage::bytea, continuation::bytea \
     FROM documentdb_api.aggregate_cursor_first_page($1, $2::bytea::documentdb_core.bson)";
const LIST_COLLECTIONS_SQL: &str = "SELECT cursorpage::bytea, continuation::bytea \
     FROM documentdb_api.list_collections_cursor_first_page($1, $2::bytea::documentdb_core.bson)";
const GET_MORE_SQL: &str = "SELECT cursorpage::bytea, continuation::bytea \
     FROM documentdb_api.cursor_get_more($1, $2::bytea::documentdb_core.bson, $3::bytea::documentdb_core.bson)";
const CURRENT_OP_SQL: &str =
    "SELECT document::bytea FROM documentdb_api.current_op_command($1::bytea::documentdb_core.bson)";
const COUNT_SQL: &str =
    "SELECT document::bytea FROM documentdb_api.count_query($1, $2::bytea::documentdb_core.bson)";
const LIST_DATABASES_SQL: &str =
    "SELECT document::bytea FROM documentdb_api.list_databases($1::bytea::documentdb_core.bson)";
const INSERT_SQL: &str = "SELECT p_result::bytea, p_success \
     FROM documentdb_api.insert($1, $2::bytea::documentdb_core.bson)";
const UPDATE_SQL: &str = "SELECT p_result::bytea, p_success \
     FROM documentdb_api.update($1, $2::bytea::documentdb_core.bson)";
const DELETE_SQL: &str = "SELECT p_result::bytea, p_success \
     FROM documentdb_api.delete($1, $2::bytea::documentdb_core.bson)";
const CREATE_SQL: &str =
    "SELECT documentdb_api.create_collection_view($1, $2::bytea::documentdb_core.bson)::bytea";
const DROP_COLLECTION_SQL: &str = "SELECT documentdb_api.drop_collection($1, $2)";
const DROP_DATABASE_SQL: &str = "SELECT documentdb_api.drop_database($1)";

impl SqlCall {
    pub fn plan(command: &Document) -> Result<Self> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| FauxGateError::BadValue("empty command document".to_string()))?;
        let spec = command.clone();

        let call = match name.as_str() {
            "find" => SqlCall::CursorPage { sql: FIND_SQL, spec },
            "aggregate" => SqlCall::CursorPage { sql: AGGREGATE_SQL, spec },
            "listCollections" => SqlCall::CursorPage {
                sql: LIST_COLLECTIONS_SQL,
                spec,
            },
            "getMore" => {
                let mut spec = spec;
                let continuation = match spec.remove("continuation") {
                    Some(Bson::Document(state)) => state,
                    _ => Document::new(),
                };
                SqlCall::GetMore { spec, continuation }
            }
            // Continuations are stateless, nothing is held server side.
            "killCursors" => {
                let ids = command.get_array("cursors").cloned().unwrap_or_default();
                SqlCall::Local(doc! {
                    "cursorsKilled": ids,
                    "cursorsNotFound": [],
                    "cursorsAlive": [],
                    "cursorsUnknown": [],
                    "ok": 1.0,
                })
            }
            "currentOp" => SqlCall::Global { sql: CURRENT_OP_SQL, spec },
            "count" => SqlCall::Document { sql: COUNT_SQL, spec },
            "listDatabases" => SqlCall::Global {
                sql: LIST_DATABASES_SQL,
                spec,
            },
            "insert" => SqlCall::Write { sql: INSERT_SQL, spec },
            "update" => SqlCall::Write { sql: UPDATE_SQL, spec },
            "delete" => SqlCall::Write { sql: DELETE_SQL, spec },
            "create" => SqlCall::Create { spec },
            "drop" => match command.get("drop") {
                Some(Bson::String(collection)) => SqlCall::DropCollection {
                    collection: collection.clone(),
                },
                other => {
                    return Err(FauxGateError::InvalidNamespace(format!(
                        "collection name has invalid type {}",
                        other.map_or("missing", params::bson_type_alias)
                    )))
                }
            },
            "dropDatabase" => SqlCall::DropDatabase,
            "ping" => SqlCall::Local(doc! { "ok": 1.0 }),
            other => return Err(FauxGateError::command_not_found(other)),
        };
        Ok(call)
    }
}

/// Issues a server-side cancel if the query future is dropped before it
/// finished.
struct CancelOnDrop {
    token: Option<CancelToken>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                counter!("fauxgate_pg_cancellations_total").increment(1);
                handle.spawn(async move {
                    if let Err(e) = token.cancel_query(NoTls).await {
                        warn!(error = %e, "failed to cancel abandoned query");
                    }
                });
            }
        }
    }
}

pub struct PostgresExecutor {
    pool: Pool,
    config: DatabaseConfig,
}

impl PostgresExecutor {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(
            max_connections = config.max_connections,
            "initializing PostgreSQL connection pool"
        );

        let mut pg_config = Config::new();
        pg_config.url = Some(config.uri.clone());

        let mut pool_config = PoolConfig::new(config.max_connections as usize);
        let wait = Duration::from_millis(config.connection_timeout_ms);
        pool_config.timeouts = Timeouts {
            wait: Some(wait),
            create: Some(wait),
            recycle: Some(wait),
        };
        pg_config.pool = Some(pool_config);

        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| FauxGateError::Config(format!("Failed to create connection pool: {}", e)))?;

        let executor = Self {
            pool,
            config: config.clone(),
        };
        executor.health_check().await?;

        info!("connection pool initialized");
        Ok(executor)
    }

    pub async fn health_check(&self) -> Result<()> {
        let client = self.checkout().await?;
        client.execute("SELECT 1", &[]).await.map_err(map_pg_error)?;
        Ok(())
    }

    pub fn pool_status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }

    async fn checkout(&self) -> Result<deadpool_postgres::Object> {
        let started = Instant::now();
        let client = self.pool.get().await.map_err(|e| {
            counter!("fauxgate_pool_connection_errors_total").increment(1);
            FauxGateError::BackendUnavailable(format!("Failed to get connection from pool: {}", e))
        })?;
        histogram!("fauxgate_pool_checkout_seconds").record(started.elapsed().as_secs_f64());

        let status = self.pool.status();
        gauge!("fauxgate_pool_size").set(status.size as f64);
        gauge!("fauxgate_pool_available").set(status.available as f64);
        Ok(client)
    }

    async fn query(
        &self,
        client: &deadpool_postgres::Object,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row> {
        let started = Instant::now();
        let mut guard = CancelOnDrop {
            token: Some(client.cancel_token()),
        };

        let result = client.query_one(sql, params).await;
        guard.disarm();

        histogram!("fauxgate_pg_query_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!("fauxgate_pg_queries_total").increment(1);
        result.map_err(map_pg_error)
    }

    async fn run_call(&self, database: &str, call: SqlCall) -> Result<Document> {
        if let SqlCall::Local(reply) = call {
            return Ok(reply);
        }

        let client = self.checkout().await?;
        let database = database.to_string();

        match call {
            SqlCall::CursorPage { sql, spec } => {
                let spec = to_bytes(&spec)?;
                let row = self.query(&client, sql, &[&database, &spec]).await?;
                cursor_reply(&row)
            }
            SqlCall::GetMore { spec, continuation } => {
                let spec = to_bytes(&spec)?;
                let continuation = to_bytes(&continuation)?;
                let row = self
                    .query(&client, GET_MORE_SQL, &[&database, &spec, &continuation])
                    .await?;
                cursor_reply(&row)
            }
            SqlCall::Document { sql, spec } => {
                let spec = to_bytes(&spec)?;
                let row = self.query(&client, sql, &[&database, &spec]).await?;
                from_column(&row, 0)
            }
            SqlCall::Global { sql, spec } => {
                let spec = to_bytes(&spec)?;
                let row = self.query(&client, sql, &[&spec]).await?;
                from_column(&row, 0)
            }
            SqlCall::Write { sql, spec } => {
                let spec = to_bytes(&spec)?;
                let row = self.query(&client, sql, &[&database, &spec]).await?;
                let mut reply = from_column(&row, 0)?;
                let success: bool = row.try_get(1).map_err(map_pg_error)?;
                if !success && !reply.contains_key("writeErrors") {
                    debug!("write reported failure without writeErrors");
                }
                if !reply.contains_key("ok") {
                    reply.insert("ok", 1.0);
                }
                Ok(reply)
            }
            SqlCall::Create { spec } => {
                let spec = to_bytes(&spec)?;
                let row = self.query(&client, CREATE_SQL, &[&database, &spec]).await?;
                from_column(&row, 0)
            }
            SqlCall::DropCollection { collection } => {
                let row = self
                    .query(&client, DROP_COLLECTION_SQL, &[&database, &collection])
                    .await?;
                let dropped: bool = row.try_get(0).map_err(map_pg_error)?;
                if dropped {
                    Ok(doc! { "ns": format!("{}.{}", database, collection), "ok": 1.0 })
                } else {
                    Err(FauxGateError::Backend {
                        code: 26,
                        code_name: "NamespaceNotFound".to_string(),
                        message: "ns not found".to_string(),
                    })
                }
            }
            SqlCall::DropDatabase => {
                self.query(&client, DROP_DATABASE_SQL, &[&database]).await?;
                Ok(doc! { "dropped": database, "ok": 1.0 })
            }
            SqlCall::Local(reply) => Ok(reply),
        }
    }
}

#[async_trait]
impl BackendExecutor for PostgresExecutor {
    fn name(&self) -> &str {
        "postgresql"
    }

    async fn execute(&self, ctx: &CallContext, database: &str, command: &Document) -> Result<Document> {
        let call = SqlCall::plan(command)?;
        let ctx = match (ctx.deadline, self.config.command_timeout_ms) {
            (None, ms) if ms > 0 => ctx.clone().with_timeout(Duration::from_millis(ms)),
            _ => ctx.clone(),
        };
        ctx.run(self.run_call(database, call)).await
    }
}

fn to_bytes(document: &Document) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    Ok(bytes)
}

fn from_column(row: &Row, index: usize) -> Result<Document> {
    let bytes: Vec<u8> = row.try_get(index).map_err(map_pg_error)?;
    Ok(Document::from_reader(&mut bytes.as_slice())?)
}

/// Merges the continuation column into `cursor.continuation`.
fn cursor_reply(row: &Row) -> Result<Document> {
    let mut page = from_column(row, 0)?;
    let continuation: Option<Vec<u8>> = row.try_get(1).map_err(map_pg_error)?;
    if let Some(bytes) = continuation {
        let state = Document::from_reader(&mut bytes.as_slice())?;
        if let Ok(cursor) = page.get_document_mut("cursor") {
            cursor.insert("continuation", state);
        }
    }
    if !page.contains_key("ok") {
        page.insert("ok", 1.0);
    }
    Ok(page)
}

fn map_pg_error(e: tokio_postgres::Error) -> FauxGateError {
    if e.is_closed() {
        return FauxGateError::BackendUnavailable(format!("PostgreSQL connection closed: {}", e));
    }
    match e.code() {
        Some(state) => {
            let message = e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string());
            map_sql_state(state, message)
        }
        None => FauxGateError::BackendUnavailable(e.to_string()),
    }
}

fn map_sql_state(state: &SqlState, message: String) -> FauxGateError {
    if *state == SqlState::QUERY_CANCELED {
        return FauxGateError::time_limit_exceeded();
    }
    if *state == SqlState::CONNECTION_EXCEPTION
        || *state == SqlState::CONNECTION_FAILURE
        || *state == SqlState::ADMIN_SHUTDOWN
        || *state == SqlState::CANNOT_CONNECT_NOW
    {
        return FauxGateError::BackendUnavailable(message);
    }
    match protocol_code(state.code()) {
        Some(50) => FauxGateError::Timeout(message),
        Some(code) => FauxGateError::backend(code, message),
        None => FauxGateError::backend(1, message),
    }
}

/// DocumentDB raises protocol errors in SQLSTATE class `M`, the protocol code
/// written base 36 in the remaining four characters. Plain PostgreSQL states
/// map to their closest protocol equivalent.
fn protocol_code(state: &str) -> Option<i32> {
    if let Some(digits) = state.strip_prefix('M') {
        return i32::from_str_radix(digits, 36).ok().filter(|code| *code > 0);
    }
    let code = match state {
        // unique_violation
        "23505" => 11000,
        // undefined_table, invalid_schema_name
        "42P01" | "3F000" => 26,
        // duplicate_table
        "42P07" => 48,
        // invalid_parameter_value, invalid_regular_expression
        "22023" | "2201B" => 2,
        // invalid_text_representation, datatype_mismatch
        "22P02" | "42804" => 14,
        // insufficient_privilege
        "42501" => 13,
        // serialization_failure, deadlock_detected, lock_not_available
        "40001" | "40P01" | "55P03" => 112,
        // out_of_memory
        "53200" => 146,
        // program_limit_exceeded
        "54000" => 10334,
        _ => return None,
    };
    Some(code)
}
