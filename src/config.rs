/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file config.rs
 * @brief FauxGate configuration management
 */

use crate::error::{FauxGateError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sessions: SessionConfig,
    pub cursors: CursorConfig,
    pub diff: DiffConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain TCP listen address; empty disables the transport.
    pub tcp_addr: String,
    /// Unix domain socket path; empty disables the transport.
    pub unix_addr: String,
    /// TLS listen address; requires the `tls` section.
    pub tls_addr: String,
    pub max_connections: u32,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
    pub connection_timeout_ms: u64,
    /// Applied to every backend call that does not declare `maxTimeMS`; zero disables it.
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Single backend.
    Direct,
    /// Primary plus reference backend, responses compared.
    Diff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub mode: DispatchMode,
    /// Address of the reference MongoDB-compatible server.
    pub reference_addr: String,
    pub timeout_ms: u64,
    pub queue_capacity: usize,
    pub ignore_error_messages: bool,
    /// Extra dotted field paths removed from both responses before comparing.
    pub volatile_fields: Vec<String>,
    pub retained_reports: usize,
    pub reference_tls: ReferenceTlsConfig,
}

/// TLS towards the reference server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceTlsConfig {
    pub enabled: bool,
    /// Trust anchors for the reference server's certificate.
    pub ca_file: Option<String>,
    /// Client certificate presented to the reference server.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Name checked against the certificate; defaults to the host part of
    /// `reference_addr`.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `compact` or `detailed`.
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// When set, clients must present a certificate signed by this CA.
    pub ca_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: "127.0.0.1:27017".to_string(),
            unix_addr: String::new(),
            tls_addr: String::new(),
            max_connections: 1000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: "postgresql://localhost:5432/postgres".to_string(),
            max_connections: 20,
            connection_timeout_ms: 5000,
            command_timeout_ms: 0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 101,
            max_batch_size: 100_000,
            idle_timeout_secs: 10 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Direct,
            reference_addr: String::new(),
            timeout_ms: 2000,
            queue_capacity: 64,
            ignore_error_messages: true,
            volatile_fields: Vec::new(),
            retained_reports: 100,
            reference_tls: ReferenceTlsConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9216,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Value advertised to drivers as `logicalSessionTimeoutMinutes`.
    pub fn timeout_minutes(&self) -> i32 {
        i32::try_from(self.idle_timeout_secs / 60).unwrap_or(i32::MAX)
    }
}

impl CursorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            FauxGateError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FauxGateError::Config(format!("Invalid JSON config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| FauxGateError::Config(format!("Invalid YAML config: {}", e)))?,
            _ => toml::from_str(&content)
                .map_err(|e| FauxGateError::Config(format!("Invalid TOML config: {}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|e| FauxGateError::Config(e.to_string()))?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).map_err(|e| FauxGateError::Config(e.to_string()))?
            }
            _ => toml::to_string_pretty(self).map_err(|e| FauxGateError::Config(e.to_string()))?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FauxGateError::Config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        tokio::fs::write(path, content).await.map_err(|e| {
            FauxGateError::Config(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.tcp_addr.is_empty()
            && self.server.unix_addr.is_empty()
            && self.server.tls_addr.is_empty()
        {
            return Err(FauxGateError::Config(
                "at least one of tcp_addr, unix_addr or tls_addr must be set".to_string(),
            ));
        }

        if !self.server.tls_addr.is_empty()
            && (self.tls.cert_file.is_none() || self.tls.key_file.is_none())
        {
            return Err(FauxGateError::Config(
                "tls_addr requires tls.cert_file and tls.key_file".to_string(),
            ));
        }

        if self.cursors.default_batch_size == 0 {
            return Err(FauxGateError::Config(
                "cursors.default_batch_size must be positive".to_string(),
            ));
        }

        if self.cursors.max_batch_size < self.cursors.default_batch_size {
            return Err(FauxGateError::Config(format!(
                "cursors.max_batch_size ({}) is below default_batch_size ({})",
                self.cursors.max_batch_size, self.cursors.default_batch_size
            )));
        }

        if self.sessions.sweep_interval_secs == 0 || self.cursors.sweep_interval_secs == 0 {
            return Err(FauxGateError::Config(
                "sweep intervals must be positive".to_string(),
            ));
        }

        if self.diff.mode == DispatchMode::Diff && self.diff.reference_addr.is_empty() {
            return Err(FauxGateError::Config(
                "diff mode requires diff.reference_addr".to_string(),
            ));
        }

        let reference_tls = &self.diff.reference_tls;
        if reference_tls.enabled {
            if reference_tls.ca_file.is_none() {
                return Err(FauxGateError::Config(
                    "diff.reference_tls requires ca_file".to_string(),
                ));
            }
            if reference_tls.cert_file.is_some() != reference_tls.key_file.is_some() {
                return Err(FauxGateError::Config(
                    "diff.reference_tls needs both cert_file and key_file for a client certificate"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sessions.timeout_minutes(), 30);
        assert_eq!(config.diff.mode, DispatchMode::Direct);
    }

    #[test]
    fn test_diff_mode_requires_reference() {
        let mut config = Config::default();
        config.diff.mode = DispatchMode::Diff;
        assert!(config.validate().is_err());

        config.diff.reference_addr = "127.0.0.1:27018".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reference_tls_needs_ca_and_key_pairs() {
        let mut config = Config::default();
        config.diff.reference_tls.enabled = true;
        assert!(config.validate().is_err());

        config.diff.reference_tls.ca_file = Some("/etc/fauxgate/ca.pem".to_string());
        assert!(config.validate().is_ok());

        config.diff.reference_tls.cert_file = Some("/etc/fauxgate/client.pem".to_string());
        assert!(config.validate().is_err());
        config.diff.reference_tls.key_file = Some("/etc/fauxgate/client.key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut config = Config::default();
        config.cursors.max_batch_size = 10;
        assert!(config.validate().is_err());
    }
}
