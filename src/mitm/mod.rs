//! MITM (Man-in-the-Middle) interception module
//!
//! This module turns CONNECT requests into decrypting tunnels:
//! - Root CA handling and per-host leaf issuance
//! - TLS configuration for the client-facing and origin-facing legs
//! - Tunnel establishment with the literal `200 OK` acknowledgement
//! - Directional relays that tee decrypted client bytes into capture

pub mod certificate_authority;
pub mod error;
pub mod interceptor;
pub mod relay;
pub mod tls_config;

// Re-export main types
pub use certificate_authority::{CertificateAuthority, LeafCertificate};
pub use error::MitmError;
pub use interceptor::{
    parse_authority, MitmInterceptor, RawConnection, TunnelHandle, TunnelResponder, TunnelState,
    TUNNEL_ACK,
};
pub use relay::{relay, CaptureSink, RelayDirection, RelayOptions, RelayOutcome};
pub use tls_config::{
    load_pem_certificates, ClientTlsConfig, SniUtils, TlsConfigError, TunnelCertResolver,
    UpstreamTlsConfig, HTTP1_ALPN,
};
