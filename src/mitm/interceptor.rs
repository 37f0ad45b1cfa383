//! MITM Interceptor - turns a CONNECT request into a decrypting tunnel
//!
//! Flow for one tunnel:
//! 1. Issue a leaf certificate for the CONNECT host
//! 2. Dial the origin over TLS, offering the leaf as client certificate
//! 3. Take over the raw client connection and write the literal ack
//! 4. Run a TLS server handshake on it with the leaf
//! 5. Relay both directions, capturing the client → origin bytes
//!
//! Failures before step 3 are answered with an HTTP error status. After the
//! ack the connection is just closed.

use super::certificate_authority::{CertificateAuthority, LeafCertificate};
use super::error::MitmError;
use super::relay::{relay, CaptureSink, RelayDirection, RelayOptions, RelayOutcome};
use super::tls_config::{ClientTlsConfig, SniUtils, UpstreamTlsConfig};
use crate::storage::RequestSink;
use async_trait::async_trait;
use http::StatusCode;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Acknowledgement written on the raw connection once the origin is up
pub const TUNNEL_ACK: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

const DEFAULT_TLS_PORT: u16 = 443;

/// Progress of a tunnel, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Requested,
    CertIssued,
    OriginDialed,
    Hijacked,
    AckSent,
    ClientHandshaked,
    Relaying,
}

impl TunnelState {
    fn advance(self, next: TunnelState, target: &str) -> TunnelState {
        debug!(target = %target, from = ?self, to = ?next, "Tunnel state");
        next
    }
}

/// The connection a CONNECT request arrived on
///
/// `take_over` hands out the raw byte stream; it returns `None` when the
/// serving layer cannot give up the socket. `respond_error` writes an HTTP
/// error and is only meaningful before takeover.
#[async_trait]
pub trait TunnelResponder: Send {
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn take_over(&mut self) -> Option<Self::Transport>;

    async fn respond_error(&mut self, status: StatusCode, message: &str) -> io::Result<()>;
}

/// A raw stream owned by the proxy; always supports takeover
pub struct RawConnection<S> {
    stream: Option<S>,
}

impl<S> RawConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl<S> TunnelResponder for RawConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Transport = S;

    fn take_over(&mut self) -> Option<S> {
        self.stream.take()
    }

    async fn respond_error(&mut self, status: StatusCode, message: &str) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection already taken over")
        })?;

        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            message.len(),
            message
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    }
}

/// Handles to the two relays of a live tunnel
///
/// Dropping the handle detaches the relays; they keep running.
pub struct TunnelHandle {
    pub target: String,
    pub client_to_origin: JoinHandle<RelayOutcome>,
    pub origin_to_client: JoinHandle<RelayOutcome>,
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// Certificate authority for leaf certificates
    ca: Arc<CertificateAuthority>,

    /// Trust anchors for origin verification
    upstream_tls: Arc<UpstreamTlsConfig>,

    /// Where captured requests go
    sink: Arc<dyn RequestSink>,

    relay_options: RelayOptions,

    /// Bound on origin dial and origin handshake
    connect_timeout: Duration,

    /// Optional ceiling on concurrent tunnels
    tunnel_limit: Option<Arc<Semaphore>>,
}

impl MitmInterceptor {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        upstream_tls: Arc<UpstreamTlsConfig>,
        sink: Arc<dyn RequestSink>,
    ) -> Self {
        Self {
            ca,
            upstream_tls,
            sink,
            relay_options: RelayOptions::default(),
            connect_timeout: Duration::from_secs(5),
            tunnel_limit: None,
        }
    }

    pub fn with_relay_options(mut self, options: RelayOptions) -> Self {
        self.relay_options = options;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Cap concurrent tunnels; 0 means unlimited
    pub fn with_tunnel_limit(mut self, max_tunnels: usize) -> Self {
        self.tunnel_limit = (max_tunnels > 0).then(|| Arc::new(Semaphore::new(max_tunnels)));
        self
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Establish a decrypting tunnel to `target` (`host[:port]`)
    ///
    /// On success the relays are already running in the background.
    pub async fn establish<R>(
        &self,
        target: &str,
        responder: &mut R,
    ) -> Result<TunnelHandle, MitmError>
    where
        R: TunnelResponder,
    {
        let mut state = TunnelState::Requested;
        info!(target = %target, "CONNECT received");

        let permit = match &self.tunnel_limit {
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return Err(self
                        .refuse(responder, target, state, MitmError::TunnelLimitReached)
                        .await)
                }
            },
            None => None,
        };

        let (host, port) = match parse_authority(target) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.refuse(responder, target, state, e).await),
        };

        let leaf = match self.ca.issue(&host) {
            Ok(leaf) => leaf,
            Err(e) => return Err(self.refuse(responder, target, state, e).await),
        };
        let acceptor = match ClientTlsConfig::for_leaf(Arc::clone(&self.ca), &leaf) {
            Ok(config) => TlsAcceptor::from(config.server_config()),
            Err(e) => {
                let err = MitmError::TlsConfigFailed(e.to_string());
                return Err(self.refuse(responder, target, state, err).await);
            }
        };
        state = state.advance(TunnelState::CertIssued, target);

        let origin = match self.dial_origin(&host, port, &leaf).await {
            Ok(origin) => origin,
            Err(e) => return Err(self.refuse(responder, target, state, e).await),
        };
        state = state.advance(TunnelState::OriginDialed, target);

        let mut raw = match responder.take_over() {
            Some(raw) => raw,
            None => {
                return Err(self
                    .refuse(responder, target, state, MitmError::TakeoverUnsupported)
                    .await)
            }
        };
        state = state.advance(TunnelState::Hijacked, target);

        let ack = async {
            raw.write_all(TUNNEL_ACK).await?;
            raw.flush().await
        };
        if let Err(e) = ack.await {
            warn!(target = %target, error = %e, "Failed to acknowledge tunnel");
            return Err(MitmError::Io(e));
        }
        state = state.advance(TunnelState::AckSent, target);

        let client_tls = match acceptor.accept(raw).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, state = ?state, error = %e, "Client TLS handshake failed");
                return Err(MitmError::tls_handshake(&host, e.to_string()));
            }
        };
        state = state.advance(TunnelState::ClientHandshaked, target);

        let (client_read, client_write) = tokio::io::split(client_tls);
        let (origin_read, origin_write) = tokio::io::split(origin);

        let capture = CaptureSink::new(Arc::clone(&self.sink), target);
        let options = self.relay_options;

        // Both relays share the permit; it is released when the last one ends
        let up_permit = permit.map(Arc::new);
        let down_permit = up_permit.clone();

        let client_to_origin = tokio::spawn(async move {
            let _permit = up_permit;
            relay(
                Some(origin_write),
                Some(client_read),
                Some(capture),
                RelayDirection::ClientToOrigin,
                options,
            )
            .await
        });
        let origin_to_client = tokio::spawn(async move {
            let _permit = down_permit;
            relay(
                Some(client_write),
                Some(origin_read),
                None,
                RelayDirection::OriginToClient,
                options,
            )
            .await
        });

        state.advance(TunnelState::Relaying, target);
        info!(target = %target, "Tunnel established");

        Ok(TunnelHandle {
            target: target.to_string(),
            client_to_origin,
            origin_to_client,
        })
    }

    /// Log the failure and report it on the still-unhijacked connection
    async fn refuse<R: TunnelResponder>(
        &self,
        responder: &mut R,
        target: &str,
        state: TunnelState,
        error: MitmError,
    ) -> MitmError {
        let status = error.status_code();
        warn!(target = %target, state = ?state, status = status.as_u16(), error = %error, "Tunnel refused");

        if let Err(e) = responder.respond_error(status, &error.to_string()).await {
            debug!(target = %target, error = %e, "Failed to write error response");
        }
        error
    }

    async fn dial_origin(
        &self,
        host: &str,
        port: u16,
        leaf: &LeafCertificate,
    ) -> Result<TlsStream<TcpStream>, MitmError> {
        let server_name =
            SniUtils::parse_server_name(host).map_err(|e| MitmError::upstream(host, e.to_string()))?;
        let config = self
            .upstream_tls
            .client_config(leaf)
            .map_err(|e| MitmError::TlsConfigFailed(e.to_string()))?;

        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(MitmError::upstream(host, e.to_string())),
            Err(_) => return Err(MitmError::upstream(host, "connect timed out")),
        };

        let connector = TlsConnector::from(config);
        match tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => {
                debug!(host = %host, port = port, "Upstream TLS handshake successful");
                Ok(stream)
            }
            Ok(Err(e)) => Err(MitmError::upstream(host, format!("TLS: {}", e))),
            Err(_) => Err(MitmError::upstream(host, "TLS handshake timed out")),
        }
    }
}

/// Split a CONNECT target into host and port (default 443)
///
/// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6 literals.
pub fn parse_authority(authority: &str) -> Result<(String, u16), MitmError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(MitmError::InvalidHost("empty target".to_string()));
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| MitmError::InvalidHost(format!("unterminated IPv6 literal '{}'", authority)))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(MitmError::InvalidHost(authority.to_string())),
            },
        }
    } else if authority.matches(':').count() > 1 {
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(MitmError::InvalidHost("host cannot be empty".to_string()));
    }

    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(0) | Err(_) => {
                return Err(MitmError::InvalidHost(format!(
                    "invalid port '{}' in '{}'",
                    port, authority
                )))
            }
            Ok(port) => port,
        },
        None => DEFAULT_TLS_PORT,
    };

    Ok((host.to_string(), port))
}
