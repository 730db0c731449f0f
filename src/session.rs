/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file session.rs
 * @brief Logical session tracking and idle expiry
 */

use crate::config::SessionConfig;
use crate::cursor::{CursorId, CursorManager};
use crate::error::{FauxGateError, Result};
use crate::params::bson_type_alias;
use bson::spec::BinarySubtype;
use bson::{Bson, Document};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Reads the `id` field of an `lsid` document.
    pub fn from_lsid(lsid: &Document) -> Result<Self> {
        match lsid.get("id") {
            Some(Bson::Binary(binary))
                if matches!(binary.subtype, BinarySubtype::Uuid | BinarySubtype::UuidOld) =>
            {
                Uuid::from_slice(&binary.bytes).map(SessionId).map_err(|_| {
                    FauxGateError::BadValue(format!(
                        "lsid.id must be a 16-byte UUID, got {} bytes",
                        binary.bytes.len()
                    ))
                })
            }
            Some(Bson::Binary(binary)) => Err(FauxGateError::BadValue(format!(
                "lsid.id must be a UUID, got binary subtype {:?}",
                binary.subtype
            ))),
            Some(other) => Err(FauxGateError::TypeMismatch(format!(
                "BSON field 'lsid.id' is the wrong type '{}', expected type 'binData'",
                bson_type_alias(other)
            ))),
            None => Err(FauxGateError::BadValue(
                "BSON field 'lsid.id' is missing but a required field".to_string(),
            )),
        }
    }

    /// The session a command runs under, if it declares one.
    pub fn from_command(command: &Document) -> Result<Option<Self>> {
        match command.get("lsid") {
            None => Ok(None),
            Some(Bson::Document(lsid)) => Self::from_lsid(lsid).map(Some),
            Some(other) => Err(FauxGateError::TypeMismatch(format!(
                "BSON field 'lsid' is the wrong type '{}', expected type 'object'",
                bson_type_alias(other)
            ))),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Session {
    last_used: Instant,
    cursors: HashSet<CursorId>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub idle: Duration,
    pub cursors: Vec<CursorId>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    cursors: Arc<CursorManager>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(config: &SessionConfig, cursors: Arc<CursorManager>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cursors,
            idle_timeout: config.idle_timeout(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Creates the session or refreshes its last use.
    pub fn touch(&self, id: SessionId) {
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(&id) {
                session.lock().last_used = Instant::now();
                return;
            }
        }

        let count = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Session {
                        last_used: Instant::now(),
                        cursors: HashSet::new(),
                    }))
                })
                .lock()
                .last_used = Instant::now();
            sessions.len()
        };
        gauge!("fauxgate_active_sessions").set(count as f64);
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        let sessions = self.sessions.read();
        let session = sessions.get(id)?.lock();
        let mut cursors: Vec<CursorId> = session
            .cursors
            .iter()
            .copied()
            .filter(|cursor| self.cursors.contains(*cursor))
            .collect();
        cursors.sort_unstable();
        Some(SessionInfo {
            id: *id,
            idle: session.last_used.elapsed(),
            cursors,
        })
    }

    /// Records a cursor as owned by the session, creating the session if a
    /// sweep removed it in the meantime. Ids of cursors that have since
    /// expired are dropped.
    pub fn attach_cursor(&self, id: SessionId, cursor: CursorId) {
        self.touch(id);
        if let Some(session) = self.sessions.read().get(&id) {
            let mut session = session.lock();
            session.cursors.retain(|owned| self.cursors.contains(*owned));
            session.cursors.insert(cursor);
        }
    }

    /// Forgets a cursor that was exhausted or killed.
    pub fn detach_cursor(&self, id: &SessionId, cursor: CursorId) {
        if let Some(session) = self.sessions.read().get(id) {
            session.lock().cursors.remove(&cursor);
        }
    }

    /// Removes the session and kills the cursors it owns.
    pub fn end(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                self.destroy(id, &session);
                gauge!("fauxgate_active_sessions").set(self.len() as f64);
                true
            }
            None => false,
        }
    }

    /// `killSessions`: ends each session and also kills cursors still
    /// registered under ids the manager no longer tracks.
    pub fn kill_sessions(&self, ids: &[SessionId]) -> Vec<CursorId> {
        let mut killed = Vec::new();
        for id in ids {
            let removed = self.sessions.write().remove(id);
            if let Some(session) = removed {
                killed.extend(self.destroy(id, &session));
            }
            killed.extend(self.cursors.kill_owned_by(id));
        }
        gauge!("fauxgate_active_sessions").set(self.len() as f64);
        killed
    }

    fn destroy(&self, id: &SessionId, session: &Mutex<Session>) -> Vec<CursorId> {
        let owned: Vec<CursorId> = session.lock().cursors.drain().collect();
        let killed = self.cursors.kill(&owned);
        debug!(session = %id, cursors = killed.len(), "session ended");
        killed
    }

    /// Removes sessions idle longer than the configured timeout.
    pub fn sweep(&self) -> Vec<SessionId> {
        match Instant::now().checked_sub(self.idle_timeout) {
            Some(cutoff) => self.expire_unused_since(cutoff),
            None => Vec::new(),
        }
    }

    /// Removes sessions last used before `cutoff`. A session touched after
    /// the cutoff is kept, even while the removal runs.
    pub fn expire_unused_since(&self, cutoff: Instant) -> Vec<SessionId> {
        let candidates: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.lock().last_used < cutoff)
            .map(|(id, _)| *id)
            .collect();

        if candidates.is_empty() {
            return candidates;
        }

        let mut removed = Vec::new();
        {
            let mut sessions = self.sessions.write();
            for id in candidates {
                let still_idle = sessions
                    .get(&id)
                    .map_or(false, |session| session.lock().last_used < cutoff);
                if still_idle {
                    if let Some(session) = sessions.remove(&id) {
                        removed.push((id, session));
                    }
                }
            }
        }

        for (id, session) in &removed {
            self.destroy(id, session);
        }

        if !removed.is_empty() {
            counter!("fauxgate_sessions_expired_total").increment(removed.len() as u64);
            gauge!("fauxgate_active_sessions").set(self.len() as f64);
            info!(count = removed.len(), "expired idle sessions");
        }
        removed.into_iter().map(|(id, _)| id).collect()
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
                    debug!("session sweeper stopping");
                    return;
                }
            }
        }
    }
}
