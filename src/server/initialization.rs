// src/server/initialization.rs

//! Start-up: TLS engine configuration, the `Proxy`, and the listeners.

use super::context::ServerContext;
use super::listener;
use crate::config::{Config, TlsConfig};
use crate::core::proxy::Proxy;
use crate::core::secure::{EngineFactory, RustlsFactory};
use crate::http::Servlet;
use anyhow::{Result, anyhow};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Initializes every component the accept loop needs.
pub fn setup(config: Config, servlets: Vec<Arc<dyn Servlet>>) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let secure = setup_tls(&config.tls)?;
    let listeners = listener::bind_all(&config)?;

    let mut proxy = Proxy::new(Arc::new(config), secure);
    for servlet in servlets {
        proxy.register_servlet(servlet);
    }
    info!("{} HTTP servlets registered.", proxy.servlets().len());

    Ok(ServerContext {
        proxy: Arc::new(proxy),
        listeners,
        shutdown_tx,
    })
}

/// Builds the TLS engine factory if TLS is enabled.
fn setup_tls(tls: &TlsConfig) -> Result<Option<Arc<dyn EngineFactory>>> {
    if !tls.enabled {
        info!("TLS is disabled; secure connections will be refused.");
        return Ok(None);
    }
    info!("TLS is enabled. Loading certificate and key.");
    let server_config = build_server_config(tls)?;
    Ok(Some(Arc::new(RustlsFactory::new(Arc::new(server_config)))))
}

/// Builds the rustls server configuration from the TLS settings.
pub fn build_server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;
    let provider = Arc::new(crypto_provider(tls.cipher_suites.as_deref())?);

    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match &tls.ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            // Client certificates are verified when offered but not required.
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .allow_unauthenticated()
                    .build()?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    Ok(builder.with_single_cert(certs, key)?)
}

/// The default crypto provider, restricted to the named cipher suites.
fn crypto_provider(cipher_suites: Option<&str>) -> Result<CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    let Some(list) = cipher_suites else {
        return Ok(provider);
    };

    let wanted: Vec<String> = list
        .split([':', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_uppercase)
        .collect();
    let available = std::mem::take(&mut provider.cipher_suites);
    for name in &wanted {
        if !available
            .iter()
            .any(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
        {
            warn!("Unknown TLS cipher suite '{}' ignored", name);
        }
    }
    provider.cipher_suites = available
        .into_iter()
        .filter(|s| wanted.contains(&format!("{:?}", s.suite()).to_ascii_uppercase()))
        .collect();
    if provider.cipher_suites.is_empty() {
        return Err(anyhow!("no usable TLS cipher suites in '{}'", list));
    }
    Ok(provider)
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

fn log_startup_info(config: &Config) {
    info!(
        "Protocols: pcp={} redis={} http=true tls={}",
        config.pcp.enabled, config.redis.enabled, config.tls.enabled
    );
    if config.redis.enabled {
        info!("Redis passthrough upstream: {}", config.redis.upstream);
    }
}
