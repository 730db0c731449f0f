/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file shutdown.rs
 * @brief Graceful shutdown and signal handling
 */

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    Request,
    Error(String),
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Request => "request",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Default)]
struct ShutdownState {
    reason: Option<ShutdownReason>,
    started: Option<Instant>,
}

/// Owns the root cancellation token of the process. Every accept loop,
/// sweeper and connection scope derives from `token()`.
#[derive(Debug, Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    state: Arc<Mutex<ShutdownState>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(ShutdownState::default())),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Installs SIGTERM and SIGINT handlers that trigger the shutdown.
    pub fn start_signal_handling(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                        manager.initiate_shutdown(ShutdownReason::Signal(15));
                    }
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => {
                            info!("Received SIGINT, initiating graceful shutdown");
                            manager.initiate_shutdown(ShutdownReason::Signal(2));
                        }
                        Err(e) => error!("Failed to wait for SIGINT: {}", e),
                    },
                    _ = manager.token.cancelled() => {}
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => manager.initiate_shutdown(ShutdownReason::Signal(2)),
                        Err(e) => error!("Failed to wait for SIGINT: {}", e),
                    },
                    _ = manager.token.cancelled() => {}
                }
            }
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.state.lock().reason.clone()
    }

    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.state.lock().started.map(|started| started.elapsed())
    }

    /// Records the first reason and cancels the root token. Later calls are
    /// ignored.
    pub fn initiate_shutdown(&self, reason: ShutdownReason) {
        {
            let mut state = self.state.lock();
            if state.reason.is_some() {
                debug!("Shutdown already in progress");
                return;
            }
            state.reason = Some(reason.clone());
            state.started = Some(Instant::now());
        }

        info!(reason = reason.as_str(), "Initiating graceful shutdown: {:?}", reason);
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.shutdown_reason().unwrap_or(ShutdownReason::Request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_manager() {
        let manager = ShutdownManager::new();

        assert!(!manager.is_shutting_down());
        assert!(manager.shutdown_reason().is_none());

        manager.initiate_shutdown(ShutdownReason::Request);

        assert!(manager.is_shutting_down());
        assert_eq!(manager.shutdown_reason(), Some(ShutdownReason::Request));
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();

        manager.initiate_shutdown(ShutdownReason::Signal(15));
        manager.initiate_shutdown(ShutdownReason::Error("late".to_string()));

        token.cancelled().await;
        assert_eq!(manager.wait_for_shutdown().await, ShutdownReason::Signal(15));
    }
}
