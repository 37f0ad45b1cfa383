//! Certificate Authority - root CA handling and per-host leaf issuance
//!
//! The root certificate is what clients install and trust. For every
//! intercepted host a leaf certificate is signed by that root, presented to
//! the client during the decrypting handshake and reused as the proxy's
//! client certificate toward the origin.
//!
//! Leaves are minted fresh per tunnel unless a cache is configured with
//! [`CertificateAuthority::with_cache`].

use super::error::{MitmError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Root validity in days
const CA_VALIDITY_DAYS: i64 = 3650;

/// Leaf validity in days
const LEAF_VALIDITY_DAYS: i64 = 90;

const CA_COMMON_NAME: &str = "Interceptor Root CA";
const ORGANIZATION: &str = "Interceptor";

/// A leaf certificate and its private key, ready for rustls
pub struct LeafCertificate {
    host: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    certified: Arc<CertifiedKey>,
}

impl LeafCertificate {
    /// Host the leaf was issued for
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Chain presented on the wire (the leaf alone; clients hold the root)
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    /// Signing material for a rustls certificate resolver
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Cached leaf with TTL
struct CachedLeaf {
    leaf: Arc<LeafCertificate>,
    created_at: Instant,
}

impl CachedLeaf {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Certificate Authority for MITM interception
pub struct CertificateAuthority {
    /// Signing handle for the root (re-derived from params when loaded)
    ca_cert: Certificate,

    ca_key: KeyPair,

    /// Root certificate exactly as clients received it
    root_der: CertificateDer<'static>,
    root_pem: String,

    /// Optional leaf cache (host -> leaf)
    cache: Option<Mutex<LruCache<String, CachedLeaf>>>,
    cert_ttl: Duration,
}

impl CertificateAuthority {
    /// Generate a fresh in-memory root
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
        distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = distinguished_name;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let ca_cert = params.self_signed(&ca_key).map_err(|e| {
            MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e))
        })?;

        let root_der = ca_cert.der().clone();
        let root_pem = ca_cert.pem();

        Ok(Self::assemble(ca_cert, ca_key, root_der, root_pem))
    }

    /// Rebuild the CA from PEM-encoded root certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;
        let ca_cert = params.self_signed(&ca_key).map_err(|e| {
            MitmError::ca_load(format!("Failed to reconstruct certificate: {}", e))
        })?;

        let root_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| MitmError::ca_load("No certificate found in PEM"))?
            .map_err(|e| MitmError::ca_load(format!("Failed to decode certificate: {}", e)))?;

        Ok(Self::assemble(ca_cert, ca_key, root_der, cert_pem.to_string()))
    }

    /// Load the root from disk, or create and persist one if neither file exists
    ///
    /// Exactly one of the two files being present is an error: silently
    /// replacing half a CA would invalidate every installed root.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                info!(cert = %cert_path.display(), key = %key_path.display(), "Loading CA from disk");

                let cert_pem = fs::read_to_string(cert_path)
                    .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
                let key_pem = fs::read_to_string(key_path)
                    .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

                Self::from_pem(&cert_pem, &key_pem)
            }
            (false, false) => {
                info!(cert = %cert_path.display(), "Generating new CA certificate");

                let ca = Self::generate()?;
                ca.save(cert_path, key_path)?;
                Ok(ca)
            }
            (cert_exists, _) => {
                let missing = if cert_exists { key_path } else { cert_path };
                Err(MitmError::ca_load(format!(
                    "CA is incomplete, missing {}",
                    missing.display()
                )))
            }
        }
    }

    fn assemble(
        ca_cert: Certificate,
        ca_key: KeyPair,
        root_der: CertificateDer<'static>,
        root_pem: String,
    ) -> Self {
        Self {
            ca_cert,
            ca_key,
            root_der,
            root_pem,
            cache: None,
            cert_ttl: Duration::from_secs(86400),
        }
    }

    fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| {
                        MitmError::ca_generation(format!("Failed to create CA directory: {}", e))
                    })?;
                }
            }
        }

        fs::write(cert_path, &self.root_pem)
            .map_err(|e| MitmError::ca_generation(format!("Failed to save certificate: {}", e)))?;
        fs::write(key_path, self.ca_key.serialize_pem())
            .map_err(|e| MitmError::ca_generation(format!("Failed to save private key: {}", e)))?;

        info!("CA certificate and key saved");
        Ok(())
    }

    /// Enable leaf reuse; a capacity of 0 keeps per-tunnel minting
    pub fn with_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        self.cert_ttl = ttl;
        self
    }

    /// Root certificate in DER form, for trust stores
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Root certificate in PEM form, for client installation
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Issue (or reuse from cache) a leaf for `host`
    pub fn issue(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(MitmError::InvalidHost("empty host".to_string()));
        }

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let expired = match cache.get(&host) {
                Some(cached) if !cached.is_expired(self.cert_ttl) => {
                    debug!(host = %host, "Certificate cache hit");
                    return Ok(Arc::clone(&cached.leaf));
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                debug!(host = %host, "Cached certificate expired, regenerating");
                cache.pop(&host);
            }
        }

        let leaf = Arc::new(self.sign_leaf(&host)?);

        if let Some(cache) = &self.cache {
            cache.lock().put(
                host.clone(),
                CachedLeaf {
                    leaf: Arc::clone(&leaf),
                    created_at: Instant::now(),
                },
            );
        }

        Ok(leaf)
    }

    fn sign_leaf(&self, host: &str) -> Result<LeafCertificate> {
        debug!(host = %host, "Generating leaf certificate");

        // DNS names and IP literals both become the right SAN type here
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| MitmError::cert_generation(host, e.to_string()))?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(SerialNumber::from(generate_serial_number()));

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let leaf_key =
            KeyPair::generate().map_err(|e| MitmError::cert_generation(host, e.to_string()))?;
        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| {
                MitmError::cert_generation(host, format!("Failed to sign certificate: {}", e))
            })?;

        let cert_der = cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(key_der.clone_key()))
                .map_err(|e| MitmError::cert_generation(host, e.to_string()))?;
        let certified = Arc::new(CertifiedKey::new(vec![cert_der.clone()], signing_key));

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_der,
            key_der,
            certified,
        })
    }

    /// Number of cached leaves (0 when caching is off)
    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map(|c| c.lock().len()).unwrap_or(0)
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cache_enabled", &self.cache.is_some())
            .field("cert_ttl", &self.cert_ttl)
            .finish_non_exhaustive()
    }
}

/// Lowercase and strip IPv6 brackets
fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// Unique serial: timestamp in the high half, crypto RNG in the low half
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;

    ((timestamp_part as u64) << 32) | (random_part as u64)
}
