// src/config.rs

//! Proxy configuration: loading, resolving listen addresses, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// The wildcard keyword, expanding to every IPv4 and IPv6 interface.
pub const INADDR_ANY: &str = "INADDR_ANY";
/// The loopback keyword, expanding to both loopback addresses.
pub const INADDR_LOOPBACK: &str = "INADDR_LOOPBACK";

/// Listening surface configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenConfig {
    /// Addresses to bind. Empty means the wildcard.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional unix-domain socket path.
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// When false, IPv6 addresses are skipped.
    #[serde(default = "default_true")]
    pub ipv6: bool,
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            port: default_port(),
            local_path: None,
            backlog: default_backlog(),
            ipv6: true,
            keepalive: default_keepalive(),
        }
    }
}

fn default_port() -> u16 {
    44322
}
fn default_backlog() -> u32 {
    128
}
fn default_keepalive() -> Duration {
    Duration::from_secs(50)
}
fn default_true() -> bool {
    true
}

/// TLS files and cipher preferences. Loading happens once, at start-up.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// Trusted authorities for optional client certificates.
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Colon or comma separated cipher suite names, e.g.
    /// `TLS13_AES_256_GCM_SHA384:TLS13_CHACHA20_POLY1305_SHA256`.
    #[serde(default)]
    pub cipher_suites: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: None,
            cipher_suites: None,
        }
    }
}

fn default_cert_path() -> String {
    "pmproxy.crt".to_string()
}
fn default_key_path() -> String {
    "pmproxy.key".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PcpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default = "default_max_hostspec_bytes")]
    pub max_hostspec_bytes: usize,
}

impl Default for PcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout: default_connect_timeout(),
            max_hostspec_bytes: default_max_hostspec_bytes(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_hostspec_bytes() -> usize {
    1024
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `host:port` of the Redis-compatible backend.
    #[serde(default = "default_redis_upstream")]
    pub upstream: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upstream: default_redis_upstream(),
        }
    }
}

fn default_redis_upstream() -> String {
    "localhost:6379".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Serve Prometheus metrics at `/metrics`.
    #[serde(default = "default_true")]
    pub metrics_servlet: bool,
    /// Buffered response bytes at which a response switches to chunked
    /// transfer encoding.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            metrics_servlet: true,
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_max_header_bytes() -> usize {
    64 * 1024
}
/// One memory page.
fn default_chunk_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The config file as written, before listen addresses are resolved.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    pcp: PcpConfig,
    #[serde(default)]
    redis: RedisConfig,
    #[serde(default)]
    http: HttpConfig,
}

/// The resolved, validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub listen: ListenConfig,
    /// TCP socket addresses derived from `listen.addresses` and `listen.port`.
    pub addresses: Vec<SocketAddr>,
    pub tls: TlsConfig,
    pub pcp: PcpConfig,
    pub redis: RedisConfig,
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        let listen = ListenConfig::default();
        let addresses = resolve_addresses(&listen).unwrap_or_default();
        Self {
            log_level: default_log_level(),
            listen,
            addresses,
            tls: TlsConfig::default(),
            pcp: PcpConfig::default(),
            redis: RedisConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// Reads, resolves and validates a TOML config file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses, resolves and validates configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        let addresses = resolve_addresses(&raw.listen)?;

        let config = Config {
            log_level: raw.log_level,
            listen: raw.listen,
            addresses,
            tls: raw.tls,
            pcp: raw.pcp,
            redis: raw.redis,
            http: raw.http,
        };
        config.validate()?;
        Ok(config)
    }

    /// Replaces the listening port and re-resolves addresses.
    pub fn with_port(mut self, port: u16) -> Result<Self> {
        self.listen.port = port;
        self.addresses = resolve_addresses(&self.listen)?;
        self.validate()?;
        Ok(self)
    }

    /// Splits `redis.upstream` into host and port.
    pub fn redis_upstream(&self) -> Result<(String, u16)> {
        split_host_port(&self.redis.upstream)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.port == 0 {
            return Err(anyhow!("listen.port cannot be 0"));
        }
        if self.listen.backlog == 0 {
            return Err(anyhow!("listen.backlog cannot be 0"));
        }
        if self.addresses.is_empty() && self.listen.local_path.is_none() {
            return Err(anyhow!(
                "no listen address resolved and no listen.local_path configured"
            ));
        }
        if let Some(path) = &self.listen.local_path
            && path.trim().is_empty()
        {
            return Err(anyhow!("listen.local_path cannot be empty"));
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.pcp.enabled && self.pcp.max_hostspec_bytes == 0 {
            return Err(anyhow!("pcp.max_hostspec_bytes cannot be 0"));
        }

        if self.redis.enabled {
            if self.redis.upstream.trim().is_empty() {
                return Err(anyhow!(
                    "redis.upstream cannot be empty when redis is enabled"
                ));
            }
            self.redis_upstream()?;
        }

        if self.http.chunk_size == 0 {
            return Err(anyhow!("http.chunk_size cannot be 0"));
        }
        if self.http.max_header_bytes < 1024 {
            warn!(
                "http.max_header_bytes is very small ({} bytes); most browsers will be refused.",
                self.http.max_header_bytes
            );
        }
        Ok(())
    }
}

/// Expands the configured listen addresses into socket addresses.
pub fn resolve_addresses(listen: &ListenConfig) -> Result<Vec<SocketAddr>> {
    let keywords = [INADDR_ANY.to_string()];
    let names: &[String] = if listen.addresses.is_empty() {
        &keywords
    } else {
        &listen.addresses
    };

    let mut out: Vec<SocketAddr> = Vec::new();
    for name in names {
        let ips: Vec<IpAddr> = match name.trim() {
            INADDR_ANY => vec![Ipv4Addr::UNSPECIFIED.into(), Ipv6Addr::UNSPECIFIED.into()],
            INADDR_LOOPBACK => vec![Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()],
            literal => vec![
                literal
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid listen address '{literal}'"))?,
            ],
        };
        for ip in ips {
            if ip.is_ipv6() && !listen.ipv6 {
                continue;
            }
            let addr = SocketAddr::new(ip, listen.port);
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    Ok(out)
}

fn split_host_port(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("'{target}' is not of the form host:port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(anyhow!("'{target}' has an empty host"));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("'{target}' has an invalid port"))?;
    Ok((host.to_string(), port))
}
