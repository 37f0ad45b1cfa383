//! Request capture - normalizes observed requests into audit records
//!
//! Two entry points feed the same record type:
//! - structured requests already parsed by the HTTP server (plain proxy path)
//! - raw bytes teed off a decrypted tunnel (intercepted TLS path)
//!
//! Callers treat [`ConversionError`] as non-fatal: the capture attempt is
//! logged and dropped, the data path it was attached to carries on.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::request::Parts;
use http::Uri;
use thiserror::Error;

/// Maximum number of headers accepted in a captured request
const MAX_HEADERS: usize = 64;

/// Capture conversion errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("request has no host")]
    MissingHost,

    #[error("malformed HTTP request: {0}")]
    Malformed(String),

    #[error("truncated HTTP request: {0}")]
    Truncated(String),

    #[error("failed to read request body: {0}")]
    Body(String),
}

/// How the captured request reached the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Plain HTTP proxy request
    Plain,

    /// Request decrypted from an intercepted TLS tunnel
    InterceptedTls,
}

impl Transport {
    pub fn is_https(self) -> bool {
        matches!(self, Transport::InterceptedTls)
    }

    pub fn from_https(is_https: bool) -> Self {
        if is_https {
            Transport::InterceptedTls
        } else {
            Transport::Plain
        }
    }

    /// URL scheme used to reach the origin again
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::InterceptedTls => "https",
        }
    }
}

/// One observed request, as archived for later inspection
///
/// Records are immutable once built. `path` is derived from `host` and
/// `url` and cannot be set on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    method: String,
    host: String,
    url: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    transport: Transport,
    timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record stamped with the current time
    pub fn new(
        method: impl Into<String>,
        host: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
        transport: Transport,
    ) -> Self {
        Self::with_timestamp(method, host, url, headers, body, transport, Utc::now())
    }

    pub(crate) fn with_timestamp(
        method: impl Into<String>,
        host: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
        transport: Transport,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let host = host.into();
        let url = url.into();
        let path = format!("{}{}", host, url);

        Self {
            method: method.into(),
            host,
            url,
            path,
            headers,
            body,
            transport,
            timestamp,
        }
    }

    /// Convert a request parsed by the HTTP server
    ///
    /// The host comes from the URI authority (absolute-form proxy requests)
    /// and falls back to the `Host` header.
    pub fn from_parts(
        parts: &Parts,
        body: Bytes,
        transport: Transport,
    ) -> Result<Self, ConversionError> {
        let host = match parts.uri.authority() {
            Some(authority) => strip_userinfo(authority.as_str()).to_string(),
            None => parts
                .headers
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or(ConversionError::MissingHost)?
                .to_string(),
        };

        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Ok(Self::new(
            parts.method.as_str(),
            host,
            url,
            headers,
            body,
            transport,
        ))
    }

    /// Convert raw bytes captured off the decrypted wire
    ///
    /// Only the first request in the buffer is converted. Header names keep
    /// the case they had on the wire.
    pub fn from_raw(data: &[u8], transport: Transport) -> Result<Self, ConversionError> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_buf);

        let head_len = match request.parse(data) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(ConversionError::Truncated(
                    "request head is incomplete".to_string(),
                ))
            }
            Err(e) => return Err(ConversionError::Malformed(e.to_string())),
        };

        let method = request
            .method
            .ok_or_else(|| ConversionError::Malformed("missing method".to_string()))?
            .to_string();
        let target = request
            .path
            .ok_or_else(|| ConversionError::Malformed("missing request target".to_string()))?;

        let headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        let (host, url) = resolve_target(target, &headers)?;
        let body = read_body(&headers, &data[head_len..])?;

        Ok(Self::new(method, host, url, headers, body, transport))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Request target in origin form (`/path?query`)
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host + url`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn strip_userinfo(authority: &str) -> &str {
    authority.rsplit('@').next().unwrap_or(authority)
}

/// Split a request target into (host, origin-form url)
fn resolve_target(
    target: &str,
    headers: &[(String, String)],
) -> Result<(String, String), ConversionError> {
    // Absolute-form targets carry their own authority
    if target.contains("://") {
        let uri: Uri = target
            .parse()
            .map_err(|e: http::uri::InvalidUri| ConversionError::Malformed(e.to_string()))?;
        let host = uri
            .authority()
            .map(|a| strip_userinfo(a.as_str()).to_string())
            .ok_or(ConversionError::MissingHost)?;
        let url = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        return Ok((host, url));
    }

    let host = find_header(headers, "host")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ConversionError::MissingHost)?;

    Ok((host.to_string(), target.to_string()))
}

fn read_body(headers: &[(String, String)], rest: &[u8]) -> Result<Bytes, ConversionError> {
    let chunked = find_header(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if chunked {
        return decode_chunked(rest);
    }

    match find_header(headers, "content-length") {
        Some(value) => {
            let length: usize = value.trim().parse().map_err(|_| {
                ConversionError::Malformed(format!("invalid Content-Length '{}'", value))
            })?;
            if rest.len() < length {
                return Err(ConversionError::Truncated(format!(
                    "body has {} of {} bytes",
                    rest.len(),
                    length
                )));
            }
            Ok(Bytes::copy_from_slice(&rest[..length]))
        }
        None => Ok(Bytes::new()),
    }
}

fn decode_chunked(mut data: &[u8]) -> Result<Bytes, ConversionError> {
    let mut body = Vec::new();

    loop {
        let (offset, size) = match httparse::parse_chunk_size(data) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => {
                return Err(ConversionError::Truncated(
                    "chunk size line is incomplete".to_string(),
                ))
            }
            Err(_) => {
                return Err(ConversionError::Malformed("invalid chunk size".to_string()))
            }
        };
        data = &data[offset..];

        if size == 0 {
            // Trailers are not part of the captured body
            return Ok(Bytes::from(body));
        }

        let size = usize::try_from(size)
            .map_err(|_| ConversionError::Malformed("chunk too large".to_string()))?;
        let end = size
            .checked_add(2)
            .ok_or_else(|| ConversionError::Malformed("chunk too large".to_string()))?;
        if data.len() < end {
            return Err(ConversionError::Truncated("chunk data is incomplete".to_string()));
        }
        if &data[size..end] != b"\r\n" {
            return Err(ConversionError::Malformed(
                "chunk is not terminated by CRLF".to_string(),
            ));
        }

        body.extend_from_slice(&data[..size]);
        data = &data[end..];
    }
}
