/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file handlers.rs
 * @brief Command handlers
 */

use crate::backend::{check_reply, Continuation, CursorPage};
use crate::commands::{CommandContext, HandlerFuture};
use crate::cursor::{take_batch, CursorId, Namespace};
use crate::error::{FauxGateError, Result};
use crate::params;
use crate::session::SessionId;
use crate::wire_protocol::{MAX_BSON_OBJECT_SIZE, MAX_MESSAGE_SIZE};
use bson::{doc, Bson, Document};
use tracing::debug;

pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
pub const MIN_WIRE_VERSION: i32 = 0;
pub const MAX_WIRE_VERSION: i32 = 21;
pub const COMPATIBLE_VERSION: &str = "7.0.77";

/// Request fields that belong to the front end, not the store.
const GENERIC_FIELDS: &[&str] = &["$db", "lsid", "$clusterTime", "$readPreference", "apiVersion"];

/// Namespace the store reports for a missing collection.
const NAMESPACE_NOT_FOUND: i32 = 26;

fn backend_command(document: &Document) -> Document {
    let mut command = document.clone();
    for field in GENERIC_FIELDS {
        command.remove(*field);
    }
    command
}

fn cursor_reply(batch_field: &str, documents: Vec<Document>, id: CursorId, ns: &Namespace) -> Document {
    let mut cursor = Document::new();
    cursor.insert(
        batch_field,
        Bson::Array(documents.into_iter().map(Bson::Document).collect()),
    );
    cursor.insert("id", id);
    cursor.insert("ns", ns.to_string());
    doc! { "cursor": cursor, "ok": 1.0 }
}

pub fn hello<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let primary_field = if request.command == "hello" {
            "isWritablePrimary"
        } else {
            "ismaster"
        };

        if let Ok(client) = request.document.get_document("client") {
            debug!(
                connection_id = ctx.connection.id,
                client = %client,
                "client handshake"
            );
        }

        let mut reply = Document::new();
        reply.insert(primary_field, true);
        reply.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
        reply.insert("maxMessageSizeBytes", MAX_MESSAGE_SIZE as i32);
        reply.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
        reply.insert("localTime", bson::DateTime::now());
        reply.insert(
            "logicalSessionTimeoutMinutes",
            ctx.services.config.sessions.timeout_minutes(),
        );
        reply.insert(
            "connectionId",
            i32::try_from(ctx.connection.id).unwrap_or(i32::MAX),
        );
        reply.insert("minWireVersion", MIN_WIRE_VERSION);
        reply.insert("maxWireVersion", MAX_WIRE_VERSION);
        reply.insert("readOnly", false);
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

pub fn ping<'a>(_ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(doc! { "ok": 1.0 }) })
}

pub fn build_info<'a>(_ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(doc! {
            "version": COMPATIBLE_VERSION,
            "gitVersion": "",
            "modules": [],
            "sysInfo": "deprecated",
            "versionArray": [7, 0, 77, 0],
            "bits": 64,
            "debug": false,
            "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
            "buildEnvironment": {},
            "fauxgate": { "version": env!("CARGO_PKG_VERSION") },
            "ok": 1.0,
        })
    })
}

pub fn find<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let document = &request.document;
        let name = "find";

        let collection = params::collection_name(document, name, &request.database)?;
        params::optional_document(document, name, "filter")?;
        params::optional_document(document, name, "sort")?;
        params::optional_document(document, name, "projection")?;
        params::optional_bool(document, name, "showRecordId")?;
        params::optional_bool(document, name, "tailable")?;
        params::optional_bool(document, name, "awaitData")?;
        let single_batch = params::optional_bool(document, name, "singleBatch")?.unwrap_or(false);

        for field in ["skip", "limit"] {
            if let Some(value) = params::optional_integer(document, name, field)? {
                if value < 0 {
                    return Err(FauxGateError::BadValue(format!(
                        "BSON field '{}' value must be >= 0, actual value '{}'",
                        field, value
                    )));
                }
            }
        }

        let batch_size = ctx
            .services
            .cursors
            .policy()
            .resolve(params::optional_integer(document, name, "batchSize")?)?;

        let mut command = backend_command(document);
        command.insert("batchSize", i64::from(batch_size));

        let namespace = Namespace::new(request.database.clone(), collection);
        open_cursor(ctx, namespace, &command, batch_size, single_batch).await
    })
}

pub fn aggregate<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let document = &request.document;
        let name = "aggregate";

        let collection = match document.get(name) {
            Some(Bson::Int32(1)) | Some(Bson::Int64(1)) => "$cmd.aggregate".to_string(),
            _ => params::collection_name(document, name, &request.database)?,
        };
        params::required_array(document, name, "pipeline")?;
        let cursor = params::optional_document(document, name, "cursor")?.ok_or_else(|| {
            FauxGateError::BadValue(
                "The 'cursor' option is required, except for aggregate with the explain argument"
                    .to_string(),
            )
        })?;
        let batch_size = ctx
            .services
            .cursors
            .policy()
            .resolve(params::optional_integer(cursor, "aggregate.cursor", "batchSize")?)?;

        let mut command = backend_command(document);
        command.insert("cursor", doc! { "batchSize": i64::from(batch_size) });

        let namespace = Namespace::new(request.database.clone(), collection);
        open_cursor(ctx, namespace, &command, batch_size, false).await
    })
}

pub fn list_collections<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let document = &request.document;
        let name = "listCollections";

        params::optional_document(document, name, "filter")?;
        params::optional_bool(document, name, "nameOnly")?;
        params::optional_bool(document, name, "authorizedCollections")?;
        let cursor = params::optional_document(document, name, "cursor")?;
        let requested = match cursor {
            Some(cursor) => params::optional_integer(cursor, "listCollections.cursor", "batchSize")?,
            None => None,
        };
        let batch_size = ctx.services.cursors.policy().resolve(requested)?;

        let mut command = backend_command(document);
        command.insert("cursor", doc! { "batchSize": i64::from(batch_size) });

        let namespace = Namespace::new(request.database.clone(), "$cmd.listCollections");
        open_cursor(ctx, namespace, &command, batch_size, false).await
    })
}

/// Runs a cursor-producing command and registers whatever the first batch
/// does not cover.
async fn open_cursor(
    ctx: &CommandContext<'_>,
    namespace: Namespace,
    command: &Document,
    batch_size: u32,
    single_batch: bool,
) -> Result<Document> {
    let services = ctx.services;
    let reply = ctx
        .call
        .run(services.backend.execute(&ctx.call, &namespace.database, command))
        .await;

    let page = match reply.and_then(CursorPage::from_response) {
        Ok(page) => page,
        Err(FauxGateError::Backend { code, .. }) if code == NAMESPACE_NOT_FOUND => {
            return Ok(cursor_reply("firstBatch", Vec::new(), 0, &namespace));
        }
        Err(e) => return Err(e),
    };

    if single_batch {
        let mut held = page.documents.into();
        let documents = take_batch(&mut held, batch_size);
        if page.backend_cursor_id != 0 {
            services.cursors.release(
                &namespace.database,
                Continuation {
                    backend_cursor_id: page.backend_cursor_id,
                    collection: namespace.collection.clone(),
                    state: page.continuation,
                },
            );
        }
        return Ok(cursor_reply("firstBatch", documents, 0, &namespace));
    }

    let owner = ctx.request.session;
    let (first, id) = services
        .cursors
        .open(&ctx.call, namespace.clone(), page, batch_size, owner)
        .await?;

    if id != 0 {
        if let Some(session) = owner {
            services.sessions.attach_cursor(session, id);
        }
    }

    Ok(cursor_reply("firstBatch", first, id, &namespace))
}

pub fn get_more<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let document = &request.document;
        let name = "getMore";

        let id = params::required_long(document, name, name)?;
        let collection = params::required_string(document, name, "collection")?;
        let batch_size = match params::optional_integer(document, name, "batchSize")? {
            Some(requested) => Some(ctx.services.cursors.policy().resolve(Some(requested))?),
            None => None,
        };

        let info = ctx
            .services
            .cursors
            .get_info(id)
            .ok_or_else(|| FauxGateError::cursor_not_found(id))?;

        let namespace = Namespace::new(request.database.clone(), collection);
        if info.namespace != namespace {
            return Err(FauxGateError::Unauthorized(format!(
                "Requested getMore on namespace '{}', but cursor belongs to a different namespace {}",
                namespace, info.namespace
            )));
        }

        if let (Some(owner), Some(session)) = (info.owner, request.session) {
            if owner != session {
                return Err(FauxGateError::Unauthorized(format!(
                    "Cursor session id ({}) is not the same as the operation context's session id ({})",
                    owner, session
                )));
            }
        }

        let batch = ctx.services.cursors.advance(&ctx.call, id, batch_size).await?;
        if batch.exhausted {
            if let Some(owner) = info.owner {
                ctx.services.sessions.detach_cursor(&owner, id);
            }
        }
        let reply_id = if batch.exhausted { 0 } else { id };
        Ok(cursor_reply("nextBatch", batch.documents, reply_id, &namespace))
    })
}

pub fn kill_cursors<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let request = ctx.request;
        let document = &request.document;
        let name = "killCursors";

        let collection = params::collection_name(document, name, &request.database)?;
        let namespace = Namespace::new(request.database.clone(), collection);

        let mut requested = Vec::new();
        for (index, value) in params::required_array(document, name, "cursors")?
            .iter()
            .enumerate()
        {
            match value {
                Bson::Int64(id) => requested.push(*id),
                other => {
                    return Err(params::wrong_type(
                        name,
                        &format!("cursors.{}", index),
                        other,
                        "long",
                    ))
                }
            }
        }

        let cursors = &ctx.services.cursors;
        let mut owners = Vec::new();
        let in_namespace: Vec<CursorId> = requested
            .iter()
            .copied()
            .filter(|id| match cursors.get_info(*id) {
                Some(info) if info.namespace == namespace => {
                    if let Some(owner) = info.owner {
                        owners.push((owner, *id));
                    }
                    true
                }
                _ => false,
            })
            .collect();

        let killed = cursors.kill(&in_namespace);
        for (owner, id) in owners {
            ctx.services.sessions.detach_cursor(&owner, id);
        }
        let not_found: Vec<CursorId> = requested
            .iter()
            .copied()
            .filter(|id| !killed.contains(id))
            .collect();

        Ok(doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": not_found,
            "cursorsAlive": [],
            "cursorsUnknown": [],
            "ok": 1.0,
        })
    })
}

pub fn current_op<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move { forward(ctx).await })
}

pub fn passthrough<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move { forward(ctx).await })
}

async fn forward(ctx: &CommandContext<'_>) -> Result<Document> {
    let request = ctx.request;
    let command = backend_command(&request.document);
    let reply = ctx
        .call
        .run(
            ctx.services
                .backend
                .execute(&ctx.call, &request.database, &command),
        )
        .await?;
    check_reply(reply)
}

fn session_ids(document: &Document, name: &str) -> Result<Vec<SessionId>> {
    let mut ids = Vec::new();
    for (index, value) in params::required_array(document, name, name)?.iter().enumerate() {
        match value {
            Bson::Document(lsid) => ids.push(SessionId::from_lsid(lsid)?),
            other => {
                return Err(params::wrong_type(
                    name,
                    &format!("{}.{}", name, index),
                    other,
                    "object",
                ))
            }
        }
    }
    Ok(ids)
}

pub fn end_sessions<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        for id in session_ids(&ctx.request.document, "endSessions")? {
            ctx.services.sessions.end(&id);
        }
        Ok(doc! { "ok": 1.0 })
    })
}

pub fn refresh_sessions<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        for id in session_ids(&ctx.request.document, "refreshSessions")? {
            ctx.services.sessions.touch(id);
        }
        Ok(doc! { "ok": 1.0 })
    })
}

pub fn kill_sessions<'a>(ctx: &'a CommandContext<'a>) -> HandlerFuture<'a> {
    Box::pin(async move {
        let ids = session_ids(&ctx.request.document, "killSessions")?;
        let killed = ctx.services.sessions.kill_sessions(&ids);
        debug!(sessions = ids.len(), cursors = killed.len(), "killed sessions");
        Ok(doc! { "ok": 1.0 })
    })
}
