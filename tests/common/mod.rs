/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file common/mod.rs
 * @brief Shared fixtures: in-memory document store and dispatcher setup
 */

#![allow(dead_code)]

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fauxgate::backend::{BackendExecutor, CallContext};
use fauxgate::config::Config;
use fauxgate::connection::{ConnectionContext, Transport};
use fauxgate::dispatcher::{Dispatcher, Services};
use fauxgate::error::{FauxGateError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct OpenCursor {
    documents: Vec<Document>,
    offset: i64,
}

/// Document store that pages like a real server: cursors hold their
/// remaining documents until drained or killed.
#[derive(Default)]
pub struct MemoryExecutor {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    cursors: Mutex<HashMap<i64, OpenCursor>>,
    next_cursor: AtomicI64,
    failures: Mutex<VecDeque<FauxGateError>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<Document>>,
    killed: Mutex<Vec<i64>>,
    continuations: bool,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            next_cursor: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    /// Echoes `cursor.continuation: {offset}` and checks it on `getMore`.
    pub fn with_continuations() -> Self {
        Self {
            continuations: true,
            ..Self::new()
        }
    }

    pub fn insert(&self, namespace: &str, documents: Vec<Document>) {
        self.collections
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .extend(documents);
    }

    pub fn seed(&self, namespace: &str, count: i32) {
        self.insert(namespace, (0..count).map(|i| doc! { "_id": i }).collect());
    }

    pub fn fail_next(&self, error: FauxGateError) {
        self.failures.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<Document> {
        self.calls.lock().clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.keys().next().map(String::as_str) == Some(name))
            .count()
    }

    pub fn killed(&self) -> Vec<i64> {
        self.killed.lock().clone()
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().len()
    }

    fn first_page(&self, namespace: String, documents: Vec<Document>, batch_size: i64) -> Document {
        let take = documents.len().min(batch_size.max(0) as usize);
        let batch: Vec<Bson> = documents[..take].iter().cloned().map(Bson::Document).collect();

        let offset = take as i64;
        let id = if take == documents.len() {
            0
        } else {
            let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
            self.cursors.lock().insert(id, OpenCursor { documents, offset });
            id
        };

        let mut cursor = doc! { "firstBatch": batch, "id": id, "ns": namespace };
        if self.continuations && id != 0 {
            cursor.insert("continuation", doc! { "offset": offset });
        }
        doc! { "cursor": cursor, "ok": 1.0 }
    }

    fn answer(&self, database: &str, command: &Document) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        match name.as_str() {
            "find" | "aggregate" => {
                let collection = command.get_str(&name).unwrap_or("").to_string();
                let namespace = format!("{}.{}", database, collection);
                let documents = self
                    .collections
                    .lock()
                    .get(&namespace)
                    .cloned()
                    .ok_or_else(|| FauxGateError::Backend {
                        code: 26,
                        code_name: "NamespaceNotFound".to_string(),
                        message: format!("ns {} does not exist", namespace),
                    })?;
                let batch_size = match name.as_str() {
                    "find" => integer(command, "batchSize"),
                    _ => command.get_document("cursor").ok().and_then(|c| integer(c, "batchSize")),
                }
                .unwrap_or(101);
                Ok(self.first_page(namespace, documents, batch_size))
            }
            "listCollections" => {
                let prefix = format!("{}.", database);
                let mut names: Vec<String> = self
                    .collections
                    .lock()
                    .keys()
                    .filter_map(|ns| ns.strip_prefix(&prefix).map(str::to_string))
                    .collect();
                names.sort();
                let documents = names
                    .into_iter()
                    .map(|name| doc! { "name": name, "type": "collection" })
                    .collect();
                let batch_size = command
                    .get_document("cursor")
                    .ok()
                    .and_then(|c| integer(c, "batchSize"))
                    .unwrap_or(101);
                Ok(self.first_page(format!("{}.$cmd.listCollections", database), documents, batch_size))
            }
            "getMore" => {
                let id = command.get_i64("getMore").unwrap_or(0);
                let batch_size = integer(command, "batchSize").unwrap_or(101).max(1) as usize;
                let collection = command.get_str("collection").unwrap_or("").to_string();

                let mut cursors = self.cursors.lock();
                let cursor = cursors
                    .get_mut(&id)
                    .ok_or_else(|| FauxGateError::cursor_not_found(id))?;

                // With continuations the position travels with the request,
                // so a repeated getMore returns the same page.
                let position = if self.continuations {
                    command
                        .get_document("continuation")
                        .ok()
                        .and_then(|c| c.get_i64("offset").ok())
                        .ok_or_else(|| FauxGateError::BadValue("missing continuation".to_string()))?
                } else {
                    cursor.offset
                };

                let start = (position.max(0) as usize).min(cursor.documents.len());
                let end = (start + batch_size).min(cursor.documents.len());
                let batch: Vec<Bson> = cursor.documents[start..end]
                    .iter()
                    .cloned()
                    .map(Bson::Document)
                    .collect();
                cursor.offset = end as i64;
                let offset = cursor.offset;
                let done = end >= cursor.documents.len();
                if done {
                    cursors.remove(&id);
                }

                let reply_id = if done { 0 } else { id };
                let mut reply_cursor = doc! {
                    "nextBatch": batch,
                    "id": reply_id,
                    "ns": format!("{}.{}", database, collection),
                };
                if self.continuations && !done {
                    reply_cursor.insert("continuation", doc! { "offset": offset });
                }
                Ok(doc! { "cursor": reply_cursor, "ok": 1.0 })
            }
            "killCursors" => {
                let mut killed = Vec::new();
                if let Ok(ids) = command.get_array("cursors") {
                    let mut cursors = self.cursors.lock();
                    for id in ids {
                        if let Bson::Int64(id) = id {
                            if cursors.remove(id).is_some() {
                                killed.push(*id);
                            }
                        }
                    }
                }
                self.killed.lock().extend(killed.iter().copied());
                Ok(doc! {
                    "cursorsKilled": killed,
                    "cursorsNotFound": [],
                    "cursorsAlive": [],
                    "cursorsUnknown": [],
                    "ok": 1.0,
                })
            }
            "count" => {
                let collection = command.get_str("count").unwrap_or("");
                let n = self
                    .collections
                    .lock()
                    .get(&format!("{}.{}", database, collection))
                    .map_or(0, Vec::len);
                Ok(doc! { "n": n as i32, "ok": 1.0 })
            }
            "insert" => {
                let collection = command.get_str("insert").unwrap_or("");
                let documents: Vec<Document> = command
                    .get_array("documents")
                    .map(|docs| docs.iter().filter_map(|d| d.as_document().cloned()).collect())
                    .unwrap_or_default();
                let n = documents.len() as i32;
                self.insert(&format!("{}.{}", database, collection), documents);
                Ok(doc! { "n": n, "ok": 1.0 })
            }
            "currentOp" => Ok(doc! { "inprog": [], "ok": 1.0 }),
            "ping" => Ok(doc! { "ok": 1.0 }),
            other => Err(FauxGateError::command_not_found(other)),
        }
    }
}

#[async_trait]
impl BackendExecutor for MemoryExecutor {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, _ctx: &CallContext, database: &str, command: &Document) -> Result<Document> {
        self.calls.lock().push(command.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        // Store errors travel as error documents, like a real server's.
        self.answer(database, command)
            .map_err(|e| FauxGateError::from_error_document(&e.to_document()))
    }
}

fn integer(document: &Document, field: &str) -> Option<i64> {
    match document.get(field)? {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.server.tcp_addr = "127.0.0.1:0".to_string();
    config
}

pub fn dispatcher_with(config: Config, backend: Arc<MemoryExecutor>) -> Arc<Dispatcher> {
    let services = Arc::new(Services::new(Arc::new(config), backend));
    Arc::new(Dispatcher::new(services))
}

pub fn dispatcher(backend: Arc<MemoryExecutor>) -> Arc<Dispatcher> {
    dispatcher_with(config(), backend)
}

pub fn connect(dispatcher: &Dispatcher) -> ConnectionContext {
    dispatcher
        .open_connection("test", Transport::Embedded, &CancellationToken::new())
        .expect("connection slot")
}

pub fn lsid(uuid: Uuid) -> Document {
    let id = Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    };
    doc! { "id": id }
}

pub fn first_batch(reply: &Document) -> Vec<Document> {
    batch(reply, "firstBatch")
}

pub fn next_batch(reply: &Document) -> Vec<Document> {
    batch(reply, "nextBatch")
}

fn batch(reply: &Document, field: &str) -> Vec<Document> {
    reply
        .get_document("cursor")
        .and_then(|c| c.get_array(field))
        .map(|docs| docs.iter().filter_map(|d| d.as_document().cloned()).collect())
        .unwrap_or_default()
}

pub fn cursor_id(reply: &Document) -> i64 {
    reply
        .get_document("cursor")
        .and_then(|c| c.get_i64("id"))
        .unwrap_or(-1)
}

pub fn ids(documents: &[Document]) -> Vec<i32> {
    documents.iter().filter_map(|d| d.get_i32("_id").ok()).collect()
}
