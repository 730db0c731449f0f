/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file server.rs
 * @brief FauxGate server assembly: services, dispatcher, listeners, sweepers
 */

use crate::backend::BackendExecutor;
use crate::config::{Config, DispatchMode};
use crate::diff::Comparator;
use crate::dispatcher::{Authorizer, Dispatcher, Services};
use crate::error::Result;
use crate::listener::Listener;
use crate::proxy::ProxyExecutor;
use crate::ssl::{self, SslManager};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct FauxGateServer {
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
}

impl FauxGateServer {
    /// Binds all listeners. In diff mode a reference executor is attached.
    pub async fn new(config: Config, backend: Arc<dyn BackendExecutor>) -> Result<Self> {
        Self::with_authorizer(config, backend, None).await
    }

    pub async fn with_authorizer(
        config: Config,
        backend: Arc<dyn BackendExecutor>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let services = Arc::new(Services::new(Arc::clone(&config), backend));
        let mut dispatcher = Dispatcher::new(services);

        if let Some(authorizer) = authorizer {
            dispatcher = dispatcher.with_authorizer(authorizer);
        }

        if config.diff.mode == DispatchMode::Diff {
            let mut reference = ProxyExecutor::new(
                config.diff.reference_addr.clone(),
                Duration::from_millis(config.diff.timeout_ms),
            );
            if config.diff.reference_tls.enabled {
                let (connector, server_name) =
                    ssl::build_connector(&config.diff.reference_tls, &config.diff.reference_addr)?;
                reference = reference.with_tls(connector, server_name);
            }
            info!(
                reference = %config.diff.reference_addr,
                tls = reference.is_tls(),
                "differential mode enabled"
            );
            let reference = Arc::new(reference);
            dispatcher =
                dispatcher.with_comparator(Arc::new(Comparator::new(reference, config.diff.clone())));
        }

        let acceptor = if config.server.tls_addr.is_empty() {
            None
        } else {
            Some(SslManager::new(config.tls.clone()).build_acceptor()?)
        };

        let dispatcher = Arc::new(dispatcher);
        let listener = Listener::bind(&config.server, acceptor, Arc::clone(&dispatcher)).await?;

        Ok(Self {
            dispatcher,
            listener,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listener.tcp_addr()
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.listener.tls_addr()
    }

    pub fn unix_addr(&self) -> Option<&Path> {
        self.listener.unix_addr()
    }

    /// Serves until `shutdown` is cancelled and every connection has drained.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let services = Arc::clone(self.dispatcher.services());
        let sweepers = CancellationToken::new();

        let cursor_sweeper = tokio::spawn(Arc::clone(&services.cursors).run_sweeper(
            services.config.cursors.sweep_interval(),
            sweepers.clone(),
        ));
        let session_sweeper = tokio::spawn(Arc::clone(&services.sessions).run_sweeper(
            services.config.sessions.sweep_interval(),
            sweepers.clone(),
        ));

        info!(
            commands = self.dispatcher.registry().len(),
            "FauxGate server started"
        );
        let result = self.listener.run(shutdown).await;

        sweepers.cancel();
        let _ = tokio::join!(cursor_sweeper, session_sweeper);

        let released = services.cursors.kill_all();
        info!(cursors = released.len(), "FauxGate server stopped");
        result
    }
}
