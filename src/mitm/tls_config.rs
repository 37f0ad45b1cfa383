//! TLS Configuration for both legs of an intercepted tunnel
//!
//! - Client-facing TLS (proxy ← client) presents a leaf signed by our root
//! - Upstream TLS (proxy → origin) verifies the origin and offers the same
//!   leaf as a client certificate
//!
//! Both legs pin TLS 1.2/1.3, the ring provider and `http/1.1` ALPN so the
//! decrypted stream is always HTTP/1.x bytes.

use super::certificate_authority::{CertificateAuthority, LeafCertificate};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// The only application protocol offered on either leg
pub const HTTP1_ALPN: &[u8] = b"http/1.1";

static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS12, &TLS13];

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

impl From<rustls::Error> for TlsConfigError {
    fn from(e: rustls::Error) -> Self {
        TlsConfigError::ConfigError(e.to_string())
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Picks the certificate presented to the client
///
/// No SNI, or SNI naming the CONNECT target, gets the leaf already issued
/// for the tunnel. Any other SNI gets a leaf issued on the spot.
#[derive(Debug)]
pub struct TunnelCertResolver {
    ca: Arc<CertificateAuthority>,
    target_host: String,
    target_key: Arc<CertifiedKey>,
}

impl TunnelCertResolver {
    pub fn new(ca: Arc<CertificateAuthority>, leaf: &LeafCertificate) -> Self {
        Self {
            ca,
            target_host: leaf.host().to_string(),
            target_key: leaf.certified_key(),
        }
    }
}

impl ResolvesServerCert for TunnelCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) if !name.eq_ignore_ascii_case(&self.target_host) => {
                debug!(sni = %name, target = %self.target_host, "SNI differs from CONNECT target");
                match self.ca.issue(name) {
                    Ok(leaf) => Some(leaf.certified_key()),
                    Err(e) => {
                        warn!(sni = %name, error = %e, "No certificate for SNI");
                        None
                    }
                }
            }
            _ => Some(Arc::clone(&self.target_key)),
        }
    }
}

/// Client-facing TLS config (proxy acts as server with a forged leaf)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    pub fn for_leaf(
        ca: Arc<CertificateAuthority>,
        leaf: &LeafCertificate,
    ) -> Result<Self, TlsConfigError> {
        let resolver = Arc::new(TunnelCertResolver::new(ca, leaf));

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Upstream TLS settings (proxy acts as client toward the origin)
///
/// Holds the trust anchors; a per-tunnel [`ClientConfig`] is derived with
/// [`UpstreamTlsConfig::client_config`] because the client certificate is
/// the tunnel's leaf.
pub struct UpstreamTlsConfig {
    roots: Arc<RootCertStore>,
}

impl UpstreamTlsConfig {
    /// Trust the bundled Mozilla roots
    pub fn new() -> Self {
        Self::with_extra_roots(&[])
    }

    /// Trust the bundled roots plus `extra` anchors
    pub fn with_extra_roots(extra: &[CertificateDer<'static>]) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

        let (added, ignored) = root_store.add_parsable_certificates(extra.iter().cloned());
        if ignored > 0 {
            warn!(ignored = ignored, "Some extra upstream roots could not be parsed");
        }

        info!(
            bundled = TLS_SERVER_ROOTS.len(),
            extra = added,
            "Upstream TLS roots loaded"
        );

        Self {
            roots: Arc::new(root_store),
        }
    }

    /// Client config for one tunnel, authenticating with `leaf`
    pub fn client_config(&self, leaf: &LeafCertificate) -> Result<Arc<ClientConfig>, TlsConfigError> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_auth_cert(leaf.cert_chain(), leaf.private_key())?;

        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

        Ok(Arc::new(config))
    }
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Read every certificate from a PEM file
pub fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let io_error = |e: std::io::Error| TlsConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    let file = File::open(path).map_err(io_error)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;

    if certs.is_empty() {
        return Err(TlsConfigError::InvalidCertificate(format!(
            "no certificates in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// SNI helpers
pub struct SniUtils;

impl SniUtils {
    /// Parse a host (DNS name or IP literal) into a rustls server name
    pub fn parse_server_name(host: &str) -> Result<ServerName<'static>, TlsConfigError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(host.to_string())
            .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", host, e)))
    }
}
