/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FauxGate - MongoDB wire-compatible front end for DocumentDB on PostgreSQL
 *
 * @file ssl.rs
 * @brief TLS acceptor and reference connector construction from PEM files
 */

use crate::config::{ReferenceTlsConfig, TlsConfig};
use crate::error::{FauxGateError, Result};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

pub struct SslManager {
    config: TlsConfig,
}

impl SslManager {
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.cert_file.is_some() && self.config.key_file.is_some()
    }

    pub fn is_client_cert_required(&self) -> bool {
        self.config.ca_file.is_some()
    }

    pub fn validate_config(&self) -> Result<()> {
        let files = [
            ("Certificate", &self.config.cert_file),
            ("Private key", &self.config.key_file),
            ("CA", &self.config.ca_file),
        ];
        for (kind, file) in files {
            if let Some(file) = file {
                if !Path::new(file).exists() {
                    return Err(FauxGateError::Config(format!("{} file not found: {}", kind, file)));
                }
            }
        }
        Ok(())
    }

    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        self.validate_config()?;

        let (cert_file, key_file) = match (&self.config.cert_file, &self.config.key_file) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(FauxGateError::Config(
                    "TLS requires both cert_file and key_file".to_string(),
                ))
            }
        };

        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;

        let builder = ServerConfig::builder().with_safe_defaults();
        let server_config = match &self.config.ca_file {
            Some(ca_file) => {
                let roots = load_roots(ca_file)?;
                builder
                    .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| FauxGateError::Config(format!("Invalid TLS certificate or key: {}", e)))?;

        info!(
            cert_file = %cert_file,
            client_auth = self.is_client_cert_required(),
            "TLS acceptor ready"
        );
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

/// Builds the connector for diff mode's reference connections. Returns the
/// name the reference certificate is checked against.
pub fn build_connector(
    config: &ReferenceTlsConfig,
    reference_addr: &str,
) -> Result<(TlsConnector, ServerName)> {
    let ca_file = config.ca_file.as_deref().ok_or_else(|| {
        FauxGateError::Config("diff.reference_tls requires ca_file".to_string())
    })?;
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(load_roots(ca_file)?);

    let client_config = match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| FauxGateError::Config(format!("Invalid client certificate or key: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(FauxGateError::Config(
                "diff.reference_tls needs both cert_file and key_file for a client certificate"
                    .to_string(),
            ))
        }
    };

    let name = match &config.server_name {
        Some(name) => name.as_str(),
        None => host_of(reference_addr),
    };
    let server_name = ServerName::try_from(name)
        .map_err(|_| FauxGateError::Config(format!("Invalid TLS server name: {}", name)))?;

    info!(ca_file = %ca_file, server_name = %name, "reference TLS connector ready");
    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

/// `host:port`, `[v6]:port` or a bare host.
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}

fn load_roots(ca_file: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(&cert).map_err(|e| {
            FauxGateError::Config(format!("Invalid CA certificate in {}: {}", ca_file, e))
        })?;
    }
    Ok(roots)
}

fn open(path: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| FauxGateError::Config(format!("Failed to open {}: {}", path, e)))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|e| FauxGateError::Config(format!("Failed to parse certificates in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(FauxGateError::Config(format!("No certificates found in {}", path)));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let parse_error =
        |e: std::io::Error| FauxGateError::Config(format!("Failed to parse private key in {}: {}", path, e));

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(path)?).map_err(parse_error)?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open(path)?).map_err(parse_error)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| FauxGateError::Config(format!("No private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_rejected() {
        let manager = SslManager::new(TlsConfig {
            cert_file: Some("/nonexistent/server.pem".to_string()),
            key_file: Some("/nonexistent/server.key".to_string()),
            ca_file: None,
        });
        assert!(manager.is_enabled());
        assert!(manager.validate_config().is_err());
        assert!(manager.build_acceptor().is_err());
    }

    #[test]
    fn test_host_of_reference_addr() {
        assert_eq!(host_of("mongo.internal:27017"), "mongo.internal");
        assert_eq!(host_of("[::1]:27017"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_connector_requires_ca() {
        let config = ReferenceTlsConfig {
            enabled: true,
            ..ReferenceTlsConfig::default()
        };
        assert!(build_connector(&config, "localhost:27017").is_err());
    }

    #[test]
    fn test_disabled_without_files() {
        let manager = SslManager::new(TlsConfig::default());
        assert!(!manager.is_enabled());
        assert!(manager.build_acceptor().is_err());
    }
}
