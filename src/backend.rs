/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file backend.rs
 * @brief Backend executor seam and per-call cancellation context
 */

use crate::error::{FauxGateError, Result};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation scope and deadline every backend call runs under.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// A context nobody cancels; used by background sweeps and tests.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Some(Instant::now() + timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Drives `fut` until it completes, the scope is cancelled, or the
    /// deadline passes. The future is dropped in the latter two cases.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(FauxGateError::Interrupted("operation was interrupted".to_string()))
            }
            _ = expiry => Err(FauxGateError::time_limit_exceeded()),
            result = fut => result,
        }
    }
}

/// Executes one command document against a document store.
///
/// Cursor-producing commands answer with `cursor.{firstBatch|nextBatch}`,
/// `cursor.id` (the store's own cursor, 0 when done) and optionally an opaque
/// `cursor.continuation` document that must be echoed on the next `getMore`.
/// Error replies (`ok: 0`) are surfaced as `Err`.
#[async_trait]
pub trait BackendExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &CallContext, database: &str, command: &Document)
        -> Result<Document>;
}

pub fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Turns an `ok: 0` reply into the backend's own error.
pub fn check_reply(reply: Document) -> Result<Document> {
    if reply_ok(&reply) {
        Ok(reply)
    } else {
        Err(FauxGateError::from_error_document(&reply))
    }
}

/// One page of a backend cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorPage {
    pub documents: Vec<Document>,
    pub backend_cursor_id: i64,
    pub continuation: Option<Document>,
    pub namespace: Option<String>,
}

impl CursorPage {
    pub fn from_response(reply: Document) -> Result<Self> {
        let reply = check_reply(reply)?;
        let cursor = reply.get_document("cursor").map_err(|_| {
            FauxGateError::Internal("backend reply has no cursor document".to_string())
        })?;

        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| FauxGateError::Internal("backend cursor has no batch".to_string()))?;

        let mut documents = Vec::with_capacity(batch.len());
        for item in batch {
            match item {
                Bson::Document(d) => documents.push(d.clone()),
                other => {
                    return Err(FauxGateError::Internal(format!(
                        "backend batch holds a non-document value {}",
                        other
                    )))
                }
            }
        }

        let backend_cursor_id = match cursor.get("id") {
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Int32(v)) => i64::from(*v),
            _ => 0,
        };

        Ok(Self {
            documents,
            backend_cursor_id,
            continuation: cursor.get_document("continuation").ok().cloned(),
            namespace: cursor.get_str("ns").ok().map(str::to_string),
        })
    }

    pub fn has_more(&self) -> bool {
        self.backend_cursor_id != 0
    }
}

/// Where a registered cursor resumes on the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub backend_cursor_id: i64,
    pub collection: String,
    pub state: Option<Document>,
}

impl Continuation {
    pub fn get_more_command(&self, batch_size: u32) -> Document {
        let mut command = doc! {
            "getMore": self.backend_cursor_id,
            "collection": self.collection.clone(),
            "batchSize": i64::from(batch_size),
        };
        if let Some(state) = &self.state {
            command.insert("continuation", state.clone());
        }
        command
    }

    pub fn kill_command(&self) -> Document {
        doc! {
            "killCursors": self.collection.clone(),
            "cursors": [self.backend_cursor_id],
        }
    }
}
