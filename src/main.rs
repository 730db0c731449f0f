/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file main.rs
 * @brief FauxGate server entry point
 */

use anyhow::{Context, Result};
use fauxgate::connection_pool::PostgresExecutor;
use fauxgate::logger::init_tracing_logger;
use fauxgate::server::FauxGateServer;
use fauxgate::shutdown::ShutdownManager;
use fauxgate::Config;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config/fauxgate.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("loading configuration from {}", config_path))?;

    init_tracing_logger(&config.logging).context("initializing logging")?;
    info!(path = %config_path, "configuration loaded");

    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "Prometheus metrics exporter listening");
    }

    let backend = Arc::new(
        PostgresExecutor::new(&config.database)
            .await
            .context("connecting to PostgreSQL")?,
    );

    let shutdown = ShutdownManager::new();
    shutdown.start_signal_handling();

    let server = FauxGateServer::new(config, backend)
        .await
        .context("starting server")?;

    if let Err(e) = server.run(shutdown.token()).await {
        error!(error = %e, "server stopped with an error");
        return Err(e.into());
    }

    if let Some(reason) = shutdown.shutdown_reason() {
        info!(
            reason = reason.as_str(),
            elapsed_ms = shutdown.elapsed().map_or(0, |d| d.as_millis() as u64),
            "shutdown complete"
        );
    }
    Ok(())
}
