//! Shared harness for integration tests: local origins, an in-memory sink
//! and a proxy bound to an ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use interceptor::mitm::{CertificateAuthority, MitmInterceptor, UpstreamTlsConfig};
use interceptor::{AuditRecord, ProxyServer, RequestSink, StorageError, UpstreamClient};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

// ============================================================================
// In-memory sink
// ============================================================================

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Poll until at least `count` records arrived
    pub async fn wait_for(&self, count: usize) -> Vec<AuditRecord> {
        for _ in 0..200 {
            if self.records.lock().len() >= count {
                return self.records();
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "expected {} captured records, got {}",
            count,
            self.records.lock().len()
        );
    }
}

#[async_trait]
impl RequestSink for MemorySink {
    async fn save_request(&self, record: &AuditRecord) -> Result<i64, StorageError> {
        let mut records = self.records.lock();
        records.push(record.clone());
        Ok(records.len() as i64)
    }
}

// ============================================================================
// TLS origin
// ============================================================================

/// A TLS origin on 127.0.0.1 with its own test CA
pub struct TlsOrigin {
    pub addr: SocketAddr,
    pub root: CertificateDer<'static>,
}

/// Start a TLS origin that answers one request per connection with
/// `origin saw: <request line>` and closes
pub async fn spawn_tls_origin() -> TlsOrigin {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Test Origin CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_params =
        CertificateParams::new(vec!["127.0.0.1".to_string(), "localhost".to_string()]).unwrap();
    let leaf_key = KeyPair::generate().unwrap();
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![leaf_cert.der().clone()], key)
    .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let head = read_until_head_end(&mut tls).await;
                let request_line = head.lines().next().unwrap_or_default().to_string();
                let body = format!("origin saw: {}", request_line);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    TlsOrigin {
        addr,
        root: ca_cert.der().clone(),
    }
}

async fn read_until_head_end<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => buf.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ============================================================================
// Plain HTTP origin
// ============================================================================

/// Start a plain HTTP origin
///
/// - `/fail` answers 500 with two `x-multi` values
/// - `/echo` answers 200 with the request body
/// - anything else answers 200 `hello from origin`
pub async fn spawn_plain_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(plain_origin))
                    .await;
            });
        }
    });

    addr
}

async fn plain_origin(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let response = match path.as_str() {
        "/fail" => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header("x-multi", "a")
            .header("x-multi", "b")
            .body(Full::new(Bytes::from_static(b"origin says no")))
            .unwrap(),
        "/echo" => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::new(Full::new(body))
        }
        _ => Response::new(Full::new(Bytes::from_static(b"hello from origin"))),
    };
    Ok(response)
}

/// Start an origin that accepts connections and never answers
pub async fn spawn_silent_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    addr
}

// ============================================================================
// Proxy
// ============================================================================

pub struct TestProxy {
    pub addr: SocketAddr,
    pub ca: Arc<CertificateAuthority>,
}

pub struct ProxyOptions {
    pub origin_roots: Vec<CertificateDer<'static>>,
    pub max_tunnels: usize,
    pub max_request_body_size: usize,
    pub upstream_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            origin_roots: Vec::new(),
            max_tunnels: 0,
            max_request_body_size: 1024 * 1024,
            upstream_timeout: Duration::from_secs(5),
        }
    }
}

pub async fn spawn_proxy(sink: Arc<dyn RequestSink>, options: ProxyOptions) -> TestProxy {
    let ca = Arc::new(CertificateAuthority::generate().unwrap());

    let interceptor = MitmInterceptor::new(
        Arc::clone(&ca),
        Arc::new(UpstreamTlsConfig::with_extra_roots(&options.origin_roots)),
        Arc::clone(&sink),
    )
    .with_connect_timeout(Duration::from_secs(3))
    .with_tunnel_limit(options.max_tunnels);

    let upstream = UpstreamClient::new(options.upstream_timeout, &options.origin_roots).unwrap();
    let server = Arc::new(ProxyServer::new(
        interceptor,
        upstream,
        sink,
        options.max_request_body_size,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));

    TestProxy { addr, ca }
}

// ============================================================================
// Client helpers
// ============================================================================

/// Send CONNECT and return the stream plus the bytes the proxy answered
/// with (exactly `ack_len` bytes)
pub async fn send_connect(proxy: SocketAddr, target: &str, ack_len: usize) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut ack = vec![0u8; ack_len];
    stream.read_exact(&mut ack).await.unwrap();
    (stream, ack)
}

/// Read whatever the proxy answers until it closes
pub async fn connect_and_read_all(proxy: SocketAddr, target: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// TLS connector trusting only `root`
pub fn tls_connector(root: &CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();

    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(Arc::new(config))
}

pub fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_string()).unwrap()
}
