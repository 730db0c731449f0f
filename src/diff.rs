/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file diff.rs
 * @brief Differential execution against a reference server
 */

use crate::backend::{BackendExecutor, CallContext};
use crate::config::DiffConfig;
use crate::cursor::CursorManager;
use crate::error::FauxGateError;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cursor pairs held per connection before pairs whose primary cursor is
/// gone are dropped.
const CURSOR_PAIRS_BEFORE_PRUNE: usize = 64;

/// Primary error code for an unknown cursor.
const CURSOR_NOT_FOUND: i32 = 43;

/// Removed at any depth before comparing.
const VOLATILE_FIELDS: &[&str] = &[
    "$clusterTime",
    "operationTime",
    "localTime",
    "connectionId",
    "electionId",
    "topologyVersion",
    "lastWrite",
];

/// Request fields the reference server would reject or misread.
const PRIMARY_ONLY_FIELDS: &[&str] = &["$clusterTime", "$readPreference"];

const CURSOR_PLACEHOLDER: &str = "<cursor>";

#[derive(Debug, Default)]
pub struct DiffStats {
    attempts: AtomicU64,
    matches: AtomicU64,
    mismatches: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStatsSnapshot {
    pub attempts: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl DiffStats {
    pub fn snapshot(&self) -> DiffStatsSnapshot {
        DiffStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Difference {
    pub path: String,
    pub primary: Option<Bson>,
    pub reference: Option<Bson>,
}

impl std::fmt::Display for Difference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Bson>| v.as_ref().map_or("<missing>".to_string(), |v| v.to_string());
        write!(
            f,
            "{}: primary={} reference={}",
            self.path,
            show(&self.primary),
            show(&self.reference)
        )
    }
}

#[derive(Debug, Clone)]
pub struct MismatchReport {
    pub timestamp: DateTime<Utc>,
    pub connection_id: u64,
    pub command: String,
    pub database: String,
    pub request: Document,
    pub differences: Vec<Difference>,
}

/// One command and the response the client received for it.
#[derive(Debug, Clone)]
pub struct DiffJob {
    pub command: String,
    pub database: String,
    pub request: Document,
    pub primary: Document,
}

pub struct Comparator {
    reference: Arc<dyn BackendExecutor>,
    config: DiffConfig,
    stats: DiffStats,
    reports: Mutex<VecDeque<MismatchReport>>,
}

impl Comparator {
    pub fn new(reference: Arc<dyn BackendExecutor>, config: DiffConfig) -> Self {
        Self {
            reference,
            config,
            stats: DiffStats::default(),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn stats(&self) -> DiffStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn recent_mismatches(&self) -> Vec<MismatchReport> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Starts the reference worker for one client connection. The worker
    /// drains its queue after the session is dropped and stops early on
    /// `shutdown`. `live` is the primary's cursor registry, used to forget
    /// cursor pairs whose primary side expired.
    pub fn session(
        self: &Arc<Self>,
        connection_id: u64,
        shutdown: CancellationToken,
        live: Arc<CursorManager>,
    ) -> DiffSession {
        let (tx, mut rx) = mpsc::channel::<DiffJob>(self.config.queue_capacity.max(1));
        let comparator = Arc::clone(self);

        tokio::spawn(async move {
            let mut cursor_ids: HashMap<i64, i64> = HashMap::new();
            loop {
                let job = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                comparator
                    .process(connection_id, &mut cursor_ids, job, &shutdown)
                    .await;

                if cursor_ids.len() > CURSOR_PAIRS_BEFORE_PRUNE {
                    let before = cursor_ids.len();
                    cursor_ids.retain(|primary, _| live.contains(*primary));
                    debug!(connection_id, pruned = before - cursor_ids.len(), "pruned cursor pairs");
                }
            }
            debug!(connection_id, "differential worker stopped");
        });

        DiffSession {
            tx,
            comparator: Arc::clone(self),
        }
    }

    async fn process(
        &self,
        connection_id: u64,
        cursor_ids: &mut HashMap<i64, i64>,
        job: DiffJob,
        shutdown: &CancellationToken,
    ) {
        let Some(command) = rewrite_request(&job, cursor_ids) else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            counter!("fauxgate_diff_skipped_total").increment(1);
            debug!(command = %job.command, "no reference cursor for request, skipping");
            return;
        };

        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        counter!("fauxgate_diff_attempts_total").increment(1);

        let ctx = CallContext::new(shutdown.child_token())
            .with_timeout(Duration::from_millis(self.config.timeout_ms));
        let outcome = ctx
            .run(self.reference.execute(&ctx, &job.database, &command))
            .await;

        let mut reference = match outcome {
            Ok(reply) => reply,
            Err(e @ FauxGateError::Backend { .. }) => e.to_document(),
            Err(FauxGateError::Timeout(_)) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                counter!("fauxgate_diff_timeouts_total").increment(1);
                warn!(command = %job.command, database = %job.database, "reference call timed out");
                return;
            }
            Err(FauxGateError::Interrupted(_)) => return,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                counter!("fauxgate_diff_errors_total").increment(1);
                warn!(command = %job.command, error = %e, "reference call failed");
                return;
            }
        };

        track_cursor_ids(&job, &mut reference, cursor_ids);

        let differences = compare(&self.normalize(&job.primary), &self.normalize(&reference));
        if differences.is_empty() {
            self.stats.matches.fetch_add(1, Ordering::Relaxed);
            counter!("fauxgate_diff_matches_total").increment(1);
            return;
        }

        self.stats.mismatches.fetch_add(1, Ordering::Relaxed);
        counter!("fauxgate_diff_mismatches_total", "command" => job.command.clone()).increment(1);

        let summary: Vec<String> = differences.iter().map(ToString::to_string).collect();
        warn!(
            connection_id,
            command = %job.command,
            database = %job.database,
            differences = %summary.join("; "),
            "differential mismatch"
        );

        let mut reports = self.reports.lock();
        reports.push_back(MismatchReport {
            timestamp: Utc::now(),
            connection_id,
            command: job.command,
            database: job.database,
            request: job.request,
            differences,
        });
        while reports.len() > self.config.retained_reports {
            reports.pop_front();
        }
    }

    /// Strips fields that legitimately differ between servers.
    pub fn normalize(&self, response: &Document) -> Document {
        let mut normalized = normalize_document(response);

        if let Ok(cursor) = normalized.get_document_mut("cursor") {
            let live = match cursor.get("id") {
                Some(Bson::Int64(id)) => *id != 0,
                Some(Bson::Int32(id)) => *id != 0,
                Some(Bson::Double(id)) => *id != 0.0,
                _ => false,
            };
            if live {
                cursor.insert("id", CURSOR_PLACEHOLDER);
            }
        }

        let failed = matches!(normalized.get("ok"), Some(Bson::Double(v)) if *v == 0.0);
        if failed && self.config.ignore_error_messages {
            normalized.remove("errmsg");
        }

        for path in &self.config.volatile_fields {
            remove_path(&mut normalized, path);
        }
        normalized
    }
}

/// Per-connection handle; submitting never waits.
pub struct DiffSession {
    tx: mpsc::Sender<DiffJob>,
    comparator: Arc<Comparator>,
}

impl DiffSession {
    pub fn submit(&self, job: DiffJob) {
        if self.tx.try_send(job).is_err() {
            self.comparator.stats.skipped.fetch_add(1, Ordering::Relaxed);
            counter!("fauxgate_diff_skipped_total").increment(1);
        }
    }
}

impl std::fmt::Debug for DiffSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffSession")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

fn cursor_id_of(response: &Document) -> Option<i64> {
    match response.get_document("cursor").ok()?.get("id")? {
        Bson::Int64(id) => Some(*id),
        Bson::Int32(id) => Some(i64::from(*id)),
        _ => None,
    }
}

/// Builds the reference request, translating primary cursor ids. `None`
/// when a `getMore` targets a cursor the reference never opened.
fn rewrite_request(job: &DiffJob, cursor_ids: &HashMap<i64, i64>) -> Option<Document> {
    let mut command = job.request.clone();
    for field in PRIMARY_ONLY_FIELDS {
        command.remove(*field);
    }

    match job.command.as_str() {
        "getMore" => {
            let primary = match command.get("getMore") {
                Some(Bson::Int64(id)) => *id,
                _ => return Some(command),
            };
            let reference = cursor_ids.get(&primary)?;
            command.insert("getMore", *reference);
        }
        "killCursors" => {
            if let Ok(ids) = command.get_array_mut("cursors") {
                for id in ids.iter_mut() {
                    if let Bson::Int64(primary) = id {
                        if let Some(reference) = cursor_ids.get(primary) {
                            *id = Bson::Int64(*reference);
                        }
                    }
                }
            }
        }
        _ => {}
    }
    Some(command)
}

fn track_cursor_ids(job: &DiffJob, reference: &mut Document, cursor_ids: &mut HashMap<i64, i64>) {
    match job.command.as_str() {
        "find" | "aggregate" | "listCollections" => {
            if let (Some(primary), Some(other)) = (cursor_id_of(&job.primary), cursor_id_of(reference)) {
                if primary != 0 && other != 0 {
                    cursor_ids.insert(primary, other);
                }
            }
        }
        "getMore" => {
            if let Some(Bson::Int64(primary)) = job.request.get("getMore") {
                let primary_done = cursor_id_of(&job.primary) == Some(0)
                    || job.primary.get_i32("code").ok() == Some(CURSOR_NOT_FOUND);
                let reference_done = cursor_id_of(reference) == Some(0);
                if primary_done || reference_done {
                    cursor_ids.remove(primary);
                }
            }
        }
        "killCursors" => {
            let back: HashMap<i64, i64> = cursor_ids.iter().map(|(p, r)| (*r, *p)).collect();
            for field in ["cursorsKilled", "cursorsNotFound", "cursorsAlive", "cursorsUnknown"] {
                if let Ok(ids) = reference.get_array_mut(field) {
                    for id in ids.iter_mut() {
                        if let Bson::Int64(value) = id {
                            if let Some(primary) = back.get(value) {
                                *id = Bson::Int64(*primary);
                            }
                        }
                    }
                }
            }
            if let Ok(ids) = job.primary.get_array("cursorsKilled") {
                for id in ids {
                    if let Bson::Int64(primary) = id {
                        cursor_ids.remove(primary);
                    }
                }
            }
        }
        _ => {}
    }
}

fn normalize_value(value: &Bson) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(normalize_document(doc)),
        Bson::Array(items) => Bson::Array(items.iter().map(normalize_value).collect()),
        Bson::Int32(v) => Bson::Double(f64::from(*v)),
        // Above 2^53 a double would round; compare those as integers.
        Bson::Int64(v) if v.unsigned_abs() <= (1u64 << 53) => Bson::Double(*v as f64),
        other => other.clone(),
    }
}

fn normalize_document(doc: &Document) -> Document {
    doc.iter()
        .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), normalize_value(value)))
        .collect()
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Ok(child) = doc.get_document_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

/// Structural comparison: document keys in any order, arrays in order.
pub fn compare(primary: &Document, reference: &Document) -> Vec<Difference> {
    let mut differences = Vec::new();
    compare_documents("", primary, reference, &mut differences);
    differences
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn compare_documents(path: &str, primary: &Document, reference: &Document, out: &mut Vec<Difference>) {
    for (key, value) in primary {
        let field = join(path, key);
        match reference.get(key) {
            Some(other) => compare_values(&field, value, other, out),
            None => out.push(Difference {
                path: field,
                primary: Some(value.clone()),
                reference: None,
            }),
        }
    }
    for (key, value) in reference {
        if !primary.contains_key(key) {
            out.push(Difference {
                path: join(path, key),
                primary: None,
                reference: Some(value.clone()),
            });
        }
    }
}

fn compare_values(path: &str, primary: &Bson, reference: &Bson, out: &mut Vec<Difference>) {
    match (primary, reference) {
        (Bson::Document(a), Bson::Document(b)) => compare_documents(path, a, b, out),
        (Bson::Array(a), Bson::Array(b)) => {
            for index in 0..a.len().max(b.len()) {
                let field = join(path, &index.to_string());
                match (a.get(index), b.get(index)) {
                    (Some(x), Some(y)) => compare_values(&field, x, y, out),
                    (x, y) => out.push(Difference {
                        path: field,
                        primary: x.cloned(),
                        reference: y.cloned(),
                    }),
                }
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(Difference {
            path: path.to_string(),
            primary: Some(a.clone()),
            reference: Some(b.clone()),
        }),
    }
}
