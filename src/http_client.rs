//! Plain HTTP relay - forwards non-CONNECT proxy requests to their origin
//!
//! The request is buffered (under the body limit), captured for the
//! archive, sent upstream through a shared reqwest client and the origin's
//! response is streamed back unchanged: status, every header value and the
//! body bytes as they arrive.

use crate::capture::{AuditRecord, Transport};
use crate::body_limiter::read_body_with_limit;
use crate::storage::RequestSink;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type for everything the proxy answers with
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Invalid proxy target: {0}")]
    InvalidTarget(String),

    #[error("{0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Shared upstream HTTP client
///
/// Redirects are not followed, bodies are not decompressed and no
/// environment proxy is used, so the origin's response passes through as-is.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(
        timeout: Duration,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self, ForwardError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();

        for root in extra_roots {
            let certificate = reqwest::Certificate::from_der(root.as_ref())
                .map_err(|e| ForwardError::Client(e.to_string()))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    /// Send one request; framing headers are recomputed by the client
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, ForwardError> {
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        Ok(response)
    }
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Absolute URL for a proxy request
///
/// Absolute-form URIs are used as given; origin-form falls back to the
/// `Host` header over plain HTTP.
pub fn target_url(parts: &Parts) -> Result<String, ForwardError> {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return Ok(parts.uri.to_string());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ForwardError::InvalidTarget(format!("no host for '{}'", parts.uri)))?;

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(format!("http://{}{}", host, path))
}

/// Relay a plain HTTP proxy request and stream the origin's answer back
pub async fn forward_http_request(
    req: Request<Incoming>,
    upstream: &UpstreamClient,
    sink: &Arc<dyn RequestSink>,
    max_body_size: usize,
) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();

    let body = match read_body_with_limit(body, max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Rejected request body");
            return text_response(e.status_code(), e.to_response_message());
        }
    };

    capture_request(&parts, body.clone(), sink);

    let url = match target_url(&parts) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "Cannot determine upstream URL");
            return text_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let upstream_response = match upstream
        .send(parts.method.clone(), &url, parts.headers.clone(), body)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "Upstream request failed");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let status = upstream_response.status();
    info!(method = %parts.method, url = %url, status = status.as_u16(), "Upstream responded");

    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    {
        let headers = response.headers_mut();
        for (name, value) in upstream_response.headers() {
            headers.append(name.clone(), value.clone());
        }
    }

    let stream_url = url.clone();
    let frames = upstream_response.bytes_stream().map(move |chunk| match chunk {
        Ok(data) => Ok(Frame::data(data)),
        Err(e) => {
            // The status line is already out; the connection gets cut
            warn!(url = %stream_url, error = %e, "Upstream body stream failed");
            Err(Box::new(e) as BoxError)
        }
    });
    *response.body_mut() = StreamBody::new(frames).boxed_unsync();

    response
}

/// Archive the request in the background; failures are only logged
fn capture_request(parts: &Parts, body: Bytes, sink: &Arc<dyn RequestSink>) {
    let record = match AuditRecord::from_parts(parts, body, Transport::Plain) {
        Ok(record) => record,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Request not captured");
            return;
        }
    };

    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        match sink.save_request(&record).await {
            Ok(id) => debug!(id = id, path = %record.path(), "Plain request saved"),
            Err(e) => warn!(path = %record.path(), error = %e, "Request wasn't saved"),
        }
    });
}
