use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!(
                "Invalid LOG_FORMAT '{}': expected 'pretty' or 'json'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    // Archive
    pub database_path: String,

    // Root CA files (generated on first run when both are missing)
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,

    // Extra trust anchors for origins, PEM
    pub upstream_ca_path: Option<PathBuf>,

    // Plain relay
    pub upstream_timeout_secs: u64,
    pub max_request_body_size: usize,

    // Tunnels
    pub max_capture_bytes: usize,
    pub tunnel_idle_timeout_secs: u64,
    pub max_tunnels: usize,

    // Leaf certificate cache
    pub cert_cache_size: usize,
    pub cert_cache_ttl_secs: u64,

    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_var("PROXY_PORT", "8080")?;
        if port == 0 {
            return Err(anyhow::anyhow!("PROXY_PORT must be between 1 and 65535"));
        }

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "data/requests.db".to_string());
        if database_path.trim().is_empty() {
            return Err(anyhow::anyhow!("DATABASE_PATH cannot be empty"));
        }

        let ca_cert_path =
            PathBuf::from(env::var("CA_CERT_PATH").unwrap_or_else(|_| "ca/ca.crt".to_string()));
        let ca_key_path =
            PathBuf::from(env::var("CA_KEY_PATH").unwrap_or_else(|_| "ca/ca.key".to_string()));

        let upstream_ca_path = env::var("UPSTREAM_CA_PATH")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let upstream_timeout_secs: u64 = parse_var("UPSTREAM_TIMEOUT_SECS", "5")?;
        if upstream_timeout_secs == 0 {
            return Err(anyhow::anyhow!("UPSTREAM_TIMEOUT_SECS must be greater than 0"));
        }

        let max_request_body_size = parse_var("MAX_REQUEST_BODY_SIZE", "104857600")?; // 100 MiB
        let max_capture_bytes = parse_var("MAX_CAPTURE_BYTES", "16777216")?; // 16 MiB
        let tunnel_idle_timeout_secs = parse_var("TUNNEL_IDLE_TIMEOUT_SECS", "0")?;
        let max_tunnels = parse_var("MAX_TUNNELS", "0")?;
        let cert_cache_size = parse_var("CERT_CACHE_SIZE", "0")?;
        let cert_cache_ttl_secs = parse_var("CERT_CACHE_TTL_SECS", "86400")?;

        let log_format = env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .parse()?;

        Ok(Config {
            host,
            port,
            database_path,
            ca_cert_path,
            ca_key_path,
            upstream_ca_path,
            upstream_timeout_secs,
            max_request_body_size,
            max_capture_bytes,
            tunnel_idle_timeout_secs,
            max_tunnels,
            cert_cache_size,
            cert_cache_ttl_secs,
            log_format,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        addr.parse()
            .with_context(|| format!("Invalid listen address '{}'", addr))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// None when idle timeouts are disabled
    pub fn tunnel_idle_timeout(&self) -> Option<Duration> {
        (self.tunnel_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.tunnel_idle_timeout_secs))
    }

    pub fn cert_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cert_cache_ttl_secs)
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}", name))
}
