//! Interceptor - TLS-capable intercepting forward proxy
//!
//! Interceptor sits between HTTP clients and origin servers and archives
//! every request it sees, including requests inside HTTPS tunnels.
//!
//! ## Features
//!
//! - **Plain HTTP relay**: absolute-form proxy requests are forwarded and
//!   the origin's response streamed back unchanged
//! - **CONNECT interception**: each tunnel is terminated with a leaf
//!   certificate signed by a local root CA, re-encrypted toward the origin
//!   and relayed byte-for-byte
//! - **Request archive**: captured requests land in SQLite and can be
//!   listed, fetched and replayed
//!
//! ## Usage
//!
//! ```rust,no_run
//! use interceptor::CertificateAuthority;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = CertificateAuthority::generate()?;
//!     let leaf = ca.issue("example.com")?;
//!     println!("issued leaf for {}", leaf.host());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `server` - front door, request classification and dispatch
//! - `http_client` - plain HTTP relay
//! - `mitm` - certificates, TLS configuration, tunnels and relays
//! - `capture` - conversion of observed requests into audit records
//! - `storage` - SQLite archive behind the `RequestSink` trait
//! - `replay` - re-sending archived requests

// Core proxy modules
pub mod config;
pub mod http_client;
pub mod rewind;
pub mod server;

// Request bodies
pub mod body_limiter;

// MITM
pub mod mitm;

// Capture and archive
pub mod capture;
pub mod replay;
pub mod storage;

/// Configuration types
pub use config::{Config, LogFormat};

/// Body size limiting
pub use body_limiter::{read_body_with_limit, BodyLimitError};

/// Capture
pub use capture::{AuditRecord, ConversionError, Transport};

/// Archive
pub use storage::{RequestSink, RequestStore, StorageError, StoredRequest};

/// Plain relay and replay
pub use http_client::{ForwardError, ProxyBody, UpstreamClient};
pub use replay::{replay_record, ReplayResponse};

/// Server
pub use server::{ProxyServer, RequestKind};

/// MITM types and functionality
pub use mitm::{
    CertificateAuthority, ClientTlsConfig, LeafCertificate, MitmError, MitmInterceptor,
    RawConnection, RelayOptions, TunnelResponder, TunnelState, UpstreamTlsConfig, TUNNEL_ACK,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
