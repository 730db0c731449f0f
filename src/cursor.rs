/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file cursor.rs
 * @brief Server-side cursor registry, paging and idle expiry
 */

use crate::backend::{BackendExecutor, CallContext, Continuation, CursorPage};
use crate::config::CursorConfig;
use crate::error::{FauxGateError, Result};
use crate::session::SessionId;
use crate::wire_protocol::MAX_BSON_OBJECT_SIZE;
use bson::Document;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type CursorId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSizePolicy {
    pub default: u32,
    pub max: u32,
}

impl BatchSizePolicy {
    pub fn from_config(config: &CursorConfig) -> Self {
        Self {
            default: config.default_batch_size,
            max: config.max_batch_size,
        }
    }

    /// Missing or zero means the default; oversized requests are capped.
    pub fn resolve(&self, requested: Option<i64>) -> Result<u32> {
        match requested {
            None | Some(0) => Ok(self.default),
            Some(n) if n < 0 => Err(FauxGateError::BadValue(format!(
                "BatchSize value must be non-negative, but received: {}",
                n
            ))),
            Some(n) => Ok(u32::try_from(n).unwrap_or(u32::MAX).min(self.max)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub documents: Vec<Document>,
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
pub struct CursorInfo {
    pub id: CursorId,
    pub namespace: Namespace,
    pub owner: Option<SessionId>,
    pub batch_size: u32,
    pub consumed: u64,
    pub buffered: usize,
    pub idle: Duration,
    pub in_use: bool,
}

#[derive(Debug)]
struct CursorMeta {
    last_access: Instant,
    batch_size: u32,
    consumed: u64,
    buffered: usize,
    killed: bool,
    in_flight: bool,
}

/// Clears the in-flight mark on drop. Declared before the state guard so the
/// mark outlives the lock.
struct InFlight<'a> {
    meta: &'a Mutex<CursorMeta>,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.meta.lock().in_flight = false;
        }
    }
}

#[derive(Debug)]
struct CursorState {
    buffer: VecDeque<Document>,
    continuation: Option<Continuation>,
}

#[derive(Debug)]
struct CursorEntry {
    namespace: Namespace,
    owner: Option<SessionId>,
    meta: Mutex<CursorMeta>,
    /// Held for the whole of an advance, across backend awaits.
    state: tokio::sync::Mutex<CursorState>,
}

pub struct CursorManager {
    cursors: RwLock<HashMap<CursorId, Arc<CursorEntry>>>,
    next_id: AtomicI64,
    policy: BatchSizePolicy,
    idle_timeout: Duration,
    backend: Arc<dyn BackendExecutor>,
}

impl CursorManager {
    pub fn new(config: &CursorConfig, backend: Arc<dyn BackendExecutor>) -> Self {
        // Positive for the life of the process: the seed leaves 2^62 ids of headroom.
        let seed = rand::thread_rng().gen_range(1..i64::MAX / 2);
        Self {
            cursors: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(seed),
            policy: BatchSizePolicy::from_config(config),
            idle_timeout: config.idle_timeout(),
            backend,
        }
    }

    pub fn policy(&self) -> BatchSizePolicy {
        self.policy
    }

    pub fn backend(&self) -> &Arc<dyn BackendExecutor> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.cursors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.read().is_empty()
    }

    pub fn create(
        &self,
        namespace: Namespace,
        continuation: Option<Continuation>,
        buffered: Vec<Document>,
        batch_size: u32,
        owner: Option<SessionId>,
    ) -> CursorId {
        self.register(namespace, continuation, buffered, batch_size, owner, 0)
    }

    fn register(
        &self,
        namespace: Namespace,
        continuation: Option<Continuation>,
        buffered: Vec<Document>,
        batch_size: u32,
        owner: Option<SessionId>,
        consumed: u64,
    ) -> CursorId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CursorEntry {
            namespace,
            owner,
            meta: Mutex::new(CursorMeta {
                last_access: Instant::now(),
                batch_size,
                consumed,
                buffered: buffered.len(),
                killed: false,
                in_flight: false,
            }),
            state: tokio::sync::Mutex::new(CursorState {
                buffer: buffered.into(),
                continuation,
            }),
        });

        let open = {
            let mut cursors = self.cursors.write();
            cursors.insert(id, entry);
            cursors.len()
        };
        counter!("fauxgate_cursors_opened_total").increment(1);
        gauge!("fauxgate_open_cursors").set(open as f64);
        debug!(cursor_id = id, "cursor created");
        id
    }

    /// Splits a backend first page into the client's first batch and, when
    /// anything remains, a registered cursor. Returns id 0 otherwise.
    pub async fn open(
        &self,
        ctx: &CallContext,
        namespace: Namespace,
        page: CursorPage,
        batch_size: u32,
        owner: Option<SessionId>,
    ) -> Result<(Vec<Document>, CursorId)> {
        let continuation = continuation_of(&namespace, &page);
        let mut buffer: VecDeque<Document> = page.documents.into();

        let (fetched, continuation) = match self
            .fill(ctx, &namespace, buffer.len(), continuation.clone(), batch_size)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                if let Some(continuation) = continuation {
                    self.release(&namespace.database, continuation);
                }
                return Err(e);
            }
        };
        buffer.extend(fetched);

        let first = take_batch(&mut buffer, batch_size);

        if buffer.is_empty() && continuation.is_none() {
            return Ok((first, 0));
        }

        let consumed = first.len() as u64;
        let id = self.register(
            namespace,
            continuation,
            buffer.into(),
            batch_size,
            owner,
            consumed,
        );
        Ok((first, id))
    }

    /// Returns the next batch. `batch_size` of `None` reuses the size the
    /// cursor was opened with. On any error the cursor is left untouched.
    pub async fn advance(
        &self,
        ctx: &CallContext,
        id: CursorId,
        batch_size: Option<u32>,
    ) -> Result<Batch> {
        let entry = self
            .cursors
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FauxGateError::cursor_not_found(id))?;

        let mut in_flight = InFlight {
            meta: &entry.meta,
            armed: false,
        };
        let mut state = match entry.state.try_lock() {
            Ok(state) => state,
            // A kill holds the state only briefly, after marking the cursor.
            Err(_) if entry.meta.lock().killed => return Err(FauxGateError::cursor_not_found(id)),
            Err(_) => return Err(FauxGateError::cursor_in_use(id)),
        };

        let want = {
            let mut meta = entry.meta.lock();
            if meta.killed {
                return Err(FauxGateError::cursor_not_found(id));
            }
            meta.in_flight = true;
            in_flight.armed = true;
            batch_size.unwrap_or(meta.batch_size)
        };

        let filled = self
            .fill(
                ctx,
                &entry.namespace,
                state.buffer.len(),
                state.continuation.clone(),
                want,
            )
            .await;

        // A kill that raced this advance left the backend cursor to us.
        if entry.meta.lock().killed {
            state.buffer.clear();
            let orphan = match filled {
                Ok((_, continuation)) => continuation,
                Err(_) => state.continuation.take(),
            };
            if let Some(continuation) = orphan {
                self.release(&entry.namespace.database, continuation);
            }
            return Err(FauxGateError::cursor_not_found(id));
        }
        let (fetched, continuation) = filled?;

        state.buffer.extend(fetched);
        state.continuation = continuation;

        let documents = take_batch(&mut state.buffer, want);
        let exhausted = state.buffer.is_empty() && state.continuation.is_none();

        {
            let mut meta = entry.meta.lock();
            meta.last_access = Instant::now();
            meta.consumed += documents.len() as u64;
            meta.buffered = state.buffer.len();
            if exhausted {
                meta.killed = true;
            }
        }

        if exhausted {
            let open = {
                let mut cursors = self.cursors.write();
                cursors.remove(&id);
                cursors.len()
            };
            gauge!("fauxgate_open_cursors").set(open as f64);
            debug!(cursor_id = id, "cursor exhausted");
        }

        Ok(Batch {
            documents,
            exhausted,
        })
    }

    /// Pulls continuation pages until more than `want` documents are held or
    /// the backend reports the end. Nothing is committed here.
    async fn fill(
        &self,
        ctx: &CallContext,
        namespace: &Namespace,
        held: usize,
        mut continuation: Option<Continuation>,
        want: u32,
    ) -> Result<(Vec<Document>, Option<Continuation>)> {
        let mut fetched = Vec::new();

        while held + fetched.len() <= want as usize {
            let Some(current) = continuation.take() else {
                break;
            };

            let command = current.get_more_command(want.max(1));
            let reply = ctx
                .run(self.backend.execute(ctx, &namespace.database, &command))
                .await?;
            let page = CursorPage::from_response(reply)?;

            let empty = page.documents.is_empty();
            continuation = continuation_of(namespace, &page);
            fetched.extend(page.documents);

            if empty {
                // An empty page that still claims more would loop forever.
                break;
            }
        }

        Ok((fetched, continuation))
    }

    /// Destroys the given cursors; unknown ids are left out of the result.
    pub fn kill(&self, ids: &[CursorId]) -> Vec<CursorId> {
        let removed: Vec<(CursorId, Arc<CursorEntry>)> = {
            let mut cursors = self.cursors.write();
            ids.iter()
                .filter_map(|id| cursors.remove(id).map(|entry| (*id, entry)))
                .collect()
        };

        let killed: Vec<CursorId> = removed
            .into_iter()
            .map(|(id, entry)| {
                self.retire(&entry);
                id
            })
            .collect();

        if !killed.is_empty() {
            counter!("fauxgate_cursors_killed_total").increment(killed.len() as u64);
            gauge!("fauxgate_open_cursors").set(self.len() as f64);
        }
        killed
    }

    /// Destroys every open cursor, releasing backend state.
    pub fn kill_all(&self) -> Vec<CursorId> {
        let ids: Vec<CursorId> = self.cursors.read().keys().copied().collect();
        self.kill(&ids)
    }

    pub fn kill_owned_by(&self, session: &SessionId) -> Vec<CursorId> {
        let owned: Vec<CursorId> = self
            .cursors
            .read()
            .iter()
            .filter(|(_, entry)| entry.owner.as_ref() == Some(session))
            .map(|(id, _)| *id)
            .collect();
        self.kill(&owned)
    }

    /// Destroys cursors idle longer than the configured timeout. Cursors with
    /// an advance in flight are skipped.
    pub fn sweep(&self) -> Vec<CursorId> {
        let cutoff = match Instant::now().checked_sub(self.idle_timeout) {
            Some(cutoff) => cutoff,
            None => return Vec::new(),
        };

        let candidates: Vec<CursorId> = self
            .cursors
            .read()
            .iter()
            .filter(|(_, entry)| entry.meta.lock().last_access < cutoff)
            .map(|(id, _)| *id)
            .collect();

        if candidates.is_empty() {
            return candidates;
        }

        let mut removed: Vec<(CursorId, Arc<CursorEntry>)> = Vec::new();
        {
            let mut cursors = self.cursors.write();
            for id in candidates {
                let still_idle = cursors.get(&id).map_or(false, |entry| {
                    let meta = entry.meta.lock();
                    !meta.in_flight && meta.last_access < cutoff
                });
                if still_idle {
                    if let Some(entry) = cursors.remove(&id) {
                        removed.push((id, entry));
                    }
                }
            }
        }

        let expired: Vec<CursorId> = removed
            .into_iter()
            .map(|(id, entry)| {
                self.retire(&entry);
                id
            })
            .collect();

        if !expired.is_empty() {
            counter!("fauxgate_cursors_expired_total").increment(expired.len() as u64);
            gauge!("fauxgate_open_cursors").set(self.len() as f64);
            info!(count = expired.len(), "expired idle cursors");
        }
        expired
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                _ = shutdown.cancelled() => {
                    debug!("cursor sweeper stopping");
                    return;
                }
            }
        }
    }

    pub fn contains(&self, id: CursorId) -> bool {
        self.cursors.read().contains_key(&id)
    }

    pub fn get_info(&self, id: CursorId) -> Option<CursorInfo> {
        let entry = self.cursors.read().get(&id).cloned()?;
        let meta = entry.meta.lock();
        Some(CursorInfo {
            id,
            namespace: entry.namespace.clone(),
            owner: entry.owner,
            batch_size: meta.batch_size,
            consumed: meta.consumed,
            buffered: meta.buffered,
            idle: meta.last_access.elapsed(),
            in_use: meta.in_flight,
        })
    }

    fn retire(&self, entry: &CursorEntry) {
        entry.meta.lock().killed = true;
        // An in-flight advance owns the state and releases it on its own.
        if let Ok(mut state) = entry.state.try_lock() {
            state.buffer.clear();
            if let Some(continuation) = state.continuation.take() {
                self.release(&entry.namespace.database, continuation);
            }
        }
    }

    /// Best-effort close of the backend cursor behind a continuation.
    pub fn release(&self, database: &str, continuation: Continuation) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        let database = database.to_string();
        handle.spawn(async move {
            let ctx = CallContext::detached().with_timeout(Duration::from_secs(5));
            let command = continuation.kill_command();
            if let Err(e) = ctx.run(backend.execute(&ctx, &database, &command)).await {
                warn!(error = %e, "failed to release backend cursor");
            }
        });
    }
}

/// Removes up to `want` documents from the front of `buffer`, stopping before
/// the batch outgrows one BSON object. The first document is always taken.
pub fn take_batch(buffer: &mut VecDeque<Document>, want: u32) -> Vec<Document> {
    let limit = MAX_BSON_OBJECT_SIZE as usize;
    let mut batch = Vec::new();
    let mut bytes = 0;

    while batch.len() < want as usize {
        let Some(next) = buffer.front() else {
            break;
        };
        let size = encoded_len(next);
        if !batch.is_empty() && bytes + size > limit {
            break;
        }
        bytes += size;
        batch.extend(buffer.pop_front());
    }
    batch
}

fn encoded_len(document: &Document) -> usize {
    let mut counter = ByteCounter(0);
    match document.to_writer(&mut counter) {
        Ok(()) => counter.0,
        Err(_) => 0,
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn continuation_of(namespace: &Namespace, page: &CursorPage) -> Option<Continuation> {
    page.has_more().then(|| Continuation {
        backend_cursor_id: page.backend_cursor_id,
        collection: namespace.collection.clone(),
        state: page.continuation.clone(),
    })
}
