//! Proxy server - accepts client connections and dispatches each request
//!
//! Every connection starts at the front door: the first request head is
//! read and parsed here. A CONNECT keeps the raw socket and goes to the
//! MITM interceptor, which needs to write its acknowledgement byte-for-byte.
//! Anything else is replayed into hyper and served as a plain proxy request.
//!
//! Panics inside a request handler are caught, logged and answered with a
//! 500 on that connection only.

use crate::http_client::{forward_http_request, text_response, ProxyBody, UpstreamClient};
use crate::mitm::{MitmInterceptor, RawConnection, TunnelResponder};
use crate::rewind::Rewind;
use crate::storage::RequestSink;
use bytes::BytesMut;
use futures_util::FutureExt;
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Largest request head accepted at the front door
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEAD_HEADERS: usize = 128;
const READ_CHUNK_SIZE: usize = 4096;

/// How a request is handled, decided once from its method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// CONNECT: decrypting tunnel
    Tunnel,
    /// Everything else: plain relay
    Direct,
}

impl RequestKind {
    pub fn of(method: &Method) -> Self {
        if method == Method::CONNECT {
            RequestKind::Tunnel
        } else {
            RequestKind::Direct
        }
    }
}

/// Method and target of the first request on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    /// Bytes occupied by the head
    pub len: usize,
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("connection closed before a request arrived")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("failed to read request head: {0}")]
    Io(#[from] io::Error),
}

impl HeadError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HeadError::TooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            HeadError::Closed | HeadError::Malformed(_) | HeadError::Io(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

/// Read from `stream` into `buf` until one full request head is buffered
///
/// Bytes past the head stay in `buf`.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<RequestHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEAD_HEADERS];
            let mut request = httparse::Request::new(&mut headers);

            match request.parse(&buf[..]) {
                Ok(httparse::Status::Complete(len)) => {
                    let method = request
                        .method
                        .ok_or_else(|| HeadError::Malformed("missing method".to_string()))?;
                    let method = Method::from_bytes(method.as_bytes())
                        .map_err(|e| HeadError::Malformed(e.to_string()))?;
                    let target = request
                        .path
                        .ok_or_else(|| HeadError::Malformed("missing target".to_string()))?
                        .to_string();

                    return Ok(RequestHead {
                        method,
                        target,
                        len,
                    });
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => return Err(HeadError::Malformed(e.to_string())),
            }
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge(MAX_HEAD_SIZE));
        }

        buf.reserve(READ_CHUNK_SIZE);
        if stream.read_buf(buf).await? == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed("connection closed mid-head".to_string())
            });
        }
    }
}

/// The proxy: front door, dispatcher and shared handler state
pub struct ProxyServer {
    interceptor: MitmInterceptor,
    upstream: UpstreamClient,
    sink: Arc<dyn RequestSink>,
    max_request_body_size: usize,
}

impl ProxyServer {
    pub fn new(
        interceptor: MitmInterceptor,
        upstream: UpstreamClient,
        sink: Arc<dyn RequestSink>,
        max_request_body_size: usize,
    ) -> Self {
        Self {
            interceptor,
            upstream,
            sink,
            max_request_body_size,
        }
    }

    /// Accept connections forever, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "Proxy listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Front door for one client connection
    pub async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        let head = match read_head(&mut stream, &mut buf).await {
            Ok(head) => head,
            Err(HeadError::Closed) => {
                debug!(peer = %peer, "Connection closed before a request");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting unreadable request");
                let mut connection = RawConnection::new(stream);
                if let Err(e) = connection.respond_error(e.status_code(), &e.to_string()).await {
                    debug!(peer = %peer, error = %e, "Failed to write error response");
                }
                return;
            }
        };

        match RequestKind::of(&head.method) {
            RequestKind::Tunnel => {
                info!(peer = %peer, method = %head.method, target = %head.target, "Inbound request");

                // Anything the client sent after the head belongs to the tunnel
                let early = buf.split_off(head.len).freeze();
                let mut connection = RawConnection::new(Rewind::new(stream, early));

                let outcome = AssertUnwindSafe(
                    self.interceptor.establish(&head.target, &mut connection),
                )
                .catch_unwind()
                .await;

                match outcome {
                    Ok(Ok(tunnel)) => debug!(target = %tunnel.target, "Tunnel relays running"),
                    Ok(Err(e)) => debug!(target = %head.target, error = %e, "Tunnel not established"),
                    Err(panic) => {
                        error!(
                            peer = %peer,
                            target = %head.target,
                            panic = %panic_message(panic.as_ref()),
                            "Tunnel handler panicked"
                        );
                        let _ = connection
                            .respond_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error")
                            .await;
                    }
                }
            }
            RequestKind::Direct => {
                let io = TokioIo::new(Rewind::new(stream, buf.freeze()));
                let server = Arc::clone(&self);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.dispatch(req).await) }
                });

                // One request per connection: a later CONNECT must come
                // through the front door again
                let mut builder = http1::Builder::new();
                builder.keep_alive(false);
                if let Err(e) = builder.serve_connection(io, service).await {
                    debug!(peer = %peer, error = %e, "HTTP/1.1 connection ended with error");
                }
            }
        }
    }

    /// Handle one request parsed by hyper
    ///
    /// Only the first head of a connection reaches hyper and the front door
    /// already sent CONNECT elsewhere, so this is always a plain relay.
    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        info!(method = %method, target = %uri, "Inbound request");

        let forward = forward_http_request(
            req,
            &self.upstream,
            &self.sink,
            self.max_request_body_size,
        );
        guard_panics(forward, &method, &uri).await
    }
}

/// Await a request handler; a panic becomes a logged 500
pub async fn guard_panics<F>(handler: F, method: &Method, uri: &Uri) -> Response<ProxyBody>
where
    F: Future<Output = Response<ProxyBody>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(
                method = %method,
                target = %uri,
                panic = %panic_message(panic.as_ref()),
                "Request handler panicked"
            );
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal proxy error")
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_request_kind() {
        assert_eq!(RequestKind::of(&Method::CONNECT), RequestKind::Tunnel);
        assert_eq!(RequestKind::of(&Method::GET), RequestKind::Direct);
        assert_eq!(RequestKind::of(&Method::POST), RequestKind::Direct);
        assert_eq!(
            RequestKind::of(&Method::from_bytes(b"PURGE").unwrap()),
            RequestKind::Direct
        );
    }

    #[tokio::test]
    async fn test_read_head_connect_keeps_early_bytes() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01")
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let head = read_head(&mut server, &mut buf).await.unwrap();

        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.target, "example.com:443");
        assert_eq!(&buf[head.len..], b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_read_head_across_reads() {
        let (mut client, mut server) = duplex(1024);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            read_head(&mut server, &mut buf).await
        });

        client.write_all(b"GET http://origin.test/ HT").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.write_all(b"TP/1.1\r\nHost: origin.test\r\n\r\n").await.unwrap();

        let head = reader.await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://origin.test/");
    }

    #[tokio::test]
    async fn test_read_head_closed() {
        let (client, mut server) = duplex(64);
        drop(client);

        let mut buf = BytesMut::new();
        let err = read_head(&mut server, &mut buf).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed));
    }

    #[tokio::test]
    async fn test_read_head_malformed() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"\x16\x03\x01\x02\x00\r\n\r\n").await.unwrap();

        let mut buf = BytesMut::new();
        let err = read_head(&mut server, &mut buf).await.unwrap_err();
        assert!(matches!(err, HeadError::Malformed(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_read_head_too_large() {
        let (mut client, mut server) = duplex(64 * 1024);
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend_from_slice(b"X-Padding: ");
        request.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 10));
        client.write_all(&request).await.unwrap();

        let mut buf = BytesMut::new();
        let err = read_head(&mut server, &mut buf).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge(_)));
        assert_eq!(err.status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    fn request_target() -> (Method, Uri) {
        (Method::GET, "http://origin.test/".parse().unwrap())
    }

    #[tokio::test]
    async fn test_guard_panics_turns_panic_into_500() {
        let (method, uri) = request_target();
        let fail = true;

        let response = guard_panics(
            async {
                if fail {
                    panic!("handler blew up");
                }
                text_response(StatusCode::OK, "unreachable")
            },
            &method,
            &uri,
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"Internal proxy error");
    }

    #[tokio::test]
    async fn test_guard_panics_keeps_serving_after_a_panic() {
        let (method, uri) = request_target();

        let fail = true;
        let first = guard_panics(
            async {
                if fail {
                    panic!("first request");
                }
                text_response(StatusCode::OK, "unreachable")
            },
            &method,
            &uri,
        )
        .await;
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let second = guard_panics(
            async { text_response(StatusCode::OK, "fine") },
            &method,
            &uri,
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(panic.as_ref()), "bang");
        let panic: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(panic.as_ref()), "unknown panic");
    }
}
