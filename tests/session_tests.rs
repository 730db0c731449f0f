/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file session_tests.rs
 * @brief Session lifecycle, cursor ownership and idle expiry
 */

mod common;

use anyhow::Result;
use bson::doc;
use common::MemoryExecutor;
use fauxgate::config::{CursorConfig, SessionConfig};
use fauxgate::cursor::{CursorManager, Namespace};
use fauxgate::session::{SessionId, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn managers(idle_timeout_secs: u64) -> (Arc<SessionManager>, Arc<CursorManager>) {
    let cursors = Arc::new(CursorManager::new(
        &CursorConfig::default(),
        Arc::new(MemoryExecutor::new()),
    ));
    let config = SessionConfig {
        idle_timeout_secs,
        sweep_interval_secs: 1,
    };
    let sessions = Arc::new(SessionManager::new(&config, Arc::clone(&cursors)));
    (sessions, cursors)
}

fn owned_cursor(cursors: &CursorManager, owner: SessionId) -> i64 {
    cursors.create(Namespace::new("db", "items"), None, vec![doc! {}], 1, Some(owner))
}

#[tokio::test]
async fn test_touch_creates_and_refreshes() -> Result<()> {
    let (sessions, _) = managers(60);
    let id = SessionId(Uuid::new_v4());

    assert!(sessions.get(&id).is_none());
    sessions.touch(id);
    sessions.touch(id);

    assert_eq!(sessions.len(), 1);
    let info = sessions.get(&id).expect("session");
    assert_eq!(info.id, id);
    assert!(info.cursors.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_end_kills_owned_cursors() -> Result<()> {
    let (sessions, cursors) = managers(60);
    let id = SessionId(Uuid::new_v4());
    let other = SessionId(Uuid::new_v4());

    let mine = owned_cursor(&cursors, id);
    sessions.attach_cursor(id, mine);
    let theirs = owned_cursor(&cursors, other);
    sessions.attach_cursor(other, theirs);

    assert_eq!(sessions.get(&id).expect("session").cursors, vec![mine]);
    assert!(sessions.end(&id));
    assert!(!sessions.end(&id));

    assert!(cursors.get_info(mine).is_none());
    assert!(cursors.get_info(theirs).is_some());
    assert_eq!(sessions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_kill_sessions_covers_untracked_owner() -> Result<()> {
    let (sessions, cursors) = managers(60);
    let tracked = SessionId(Uuid::new_v4());
    let untracked = SessionId(Uuid::new_v4());

    let a = owned_cursor(&cursors, tracked);
    sessions.attach_cursor(tracked, a);
    // Registered with an owner the session manager never saw.
    let b = owned_cursor(&cursors, untracked);

    let mut killed = sessions.kill_sessions(&[tracked, untracked]);
    killed.sort_unstable();
    let mut expected = vec![a, b];
    expected.sort_unstable();

    assert_eq!(killed, expected);
    assert!(sessions.is_empty());
    assert!(cursors.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expires_idle_sessions_and_cursors() -> Result<()> {
    let (sessions, cursors) = managers(30);
    let stale = SessionId(Uuid::new_v4());
    let active = SessionId(Uuid::new_v4());

    let cursor = owned_cursor(&cursors, stale);
    sessions.attach_cursor(stale, cursor);
    sessions.touch(active);

    tokio::time::advance(Duration::from_secs(20)).await;
    sessions.touch(active);
    assert!(sessions.sweep().is_empty());

    tokio::time::advance(Duration::from_secs(15)).await;
    assert_eq!(sessions.sweep(), vec![stale]);
    assert!(sessions.get(&active).is_some());
    assert!(cursors.get_info(cursor).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_stops_on_cancel() -> Result<()> {
    let (sessions, _) = managers(5);
    let id = SessionId(Uuid::new_v4());
    sessions.touch(id);

    let token = CancellationToken::new();
    let sweeper = tokio::spawn(Arc::clone(&sessions).run_sweeper(Duration::from_secs(1), token.clone()));

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(sessions.get(&id).is_none());

    token.cancel();
    sweeper.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_touched_after_cutoff_survives() -> Result<()> {
    let (sessions, cursors) = managers(30);
    let late = SessionId(Uuid::new_v4());
    let stale = SessionId(Uuid::new_v4());
    sessions.touch(late);
    sessions.touch(stale);
    let cursor = owned_cursor(&cursors, late);
    sessions.attach_cursor(late, cursor);

    tokio::time::advance(Duration::from_secs(40)).await;
    let cutoff = tokio::time::Instant::now();

    // Both were idle at the cutoff; one is used again before removal runs.
    tokio::time::advance(Duration::from_millis(1)).await;
    sessions.touch(late);

    assert_eq!(sessions.expire_unused_since(cutoff), vec![stale]);
    assert!(sessions.get(&late).is_some());
    assert!(cursors.get_info(cursor).is_some());
    Ok(())
}

#[tokio::test]
async fn test_expired_cursor_ids_are_dropped_from_session() -> Result<()> {
    let (sessions, cursors) = managers(60);
    let id = SessionId(Uuid::new_v4());

    let gone = owned_cursor(&cursors, id);
    sessions.attach_cursor(id, gone);
    let kept = owned_cursor(&cursors, id);
    sessions.attach_cursor(id, kept);

    // Killed behind the session's back, as an idle sweep would.
    assert_eq!(cursors.kill(&[gone]), vec![gone]);
    assert_eq!(sessions.get(&id).expect("session").cursors, vec![kept]);

    let next = owned_cursor(&cursors, id);
    sessions.attach_cursor(id, next);
    let mut expected = vec![kept, next];
    expected.sort_unstable();
    assert_eq!(sessions.get(&id).expect("session").cursors, expected);

    sessions.detach_cursor(&id, kept);
    assert_eq!(sessions.get(&id).expect("session").cursors, vec![next]);
    Ok(())
}
