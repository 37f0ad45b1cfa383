//! MITM error types

use http::StatusCode;
use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// MITM-specific errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf certificate generation failed
    #[error("Failed to generate certificate for {host}: {reason}")]
    CertGenerationFailed { host: String, reason: String },

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// CONNECT target could not be parsed
    #[error("Invalid CONNECT target: {0}")]
    InvalidHost(String),

    /// Origin could not be reached or refused TLS
    #[error("Upstream connection failed for {host}: {reason}")]
    UpstreamConnectionFailed { host: String, reason: String },

    /// Client-side TLS handshake failed after the tunnel was acknowledged
    #[error("TLS handshake failed for {host}: {reason}")]
    TlsHandshakeFailed { host: String, reason: String },

    /// The serving layer cannot hand over the raw connection
    #[error("Connection takeover not supported")]
    TakeoverUnsupported,

    /// Configured tunnel ceiling reached
    #[error("Too many active tunnels")]
    TunnelLimitReached,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create an upstream connection error
    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Create a TLS handshake error
    pub fn tls_handshake(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            reason: msg.into(),
        }
    }

    /// Status reported to the client when the tunnel fails before the ack
    pub fn status_code(&self) -> StatusCode {
        match self {
            MitmError::InvalidHost(_) => StatusCode::BAD_REQUEST,
            MitmError::TakeoverUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            MitmError::CaGenerationFailed(_)
            | MitmError::CaLoadFailed(_)
            | MitmError::CertGenerationFailed { .. }
            | MitmError::TlsConfigFailed(_)
            | MitmError::UpstreamConnectionFailed { .. }
            | MitmError::TlsHandshakeFailed { .. }
            | MitmError::TunnelLimitReached
            | MitmError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
