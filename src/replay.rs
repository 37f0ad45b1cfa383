//! Replay archived requests against their origin
//!
//! The scheme comes from how the request was originally seen: intercepted
//! TLS requests go back over https, plain ones over http.

use crate::capture::AuditRecord;
use crate::http_client::{ForwardError, UpstreamClient};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::{debug, info};

/// Origin's answer to a replayed request
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// URL a record is sent to on replay
pub fn replay_url(record: &AuditRecord) -> String {
    format!(
        "{}://{}{}",
        record.transport().scheme(),
        record.host(),
        record.url()
    )
}

/// Re-send `record` and collect the full response
pub async fn replay_record(
    client: &UpstreamClient,
    record: &AuditRecord,
) -> Result<ReplayResponse, ForwardError> {
    let method = Method::from_bytes(record.method().as_bytes())
        .map_err(|e| ForwardError::InvalidTarget(format!("method '{}': {}", record.method(), e)))?;
    let url = replay_url(record);

    let mut headers = HeaderMap::new();
    for (name, value) in record.headers() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = %name, "Skipping header that cannot be replayed"),
        }
    }

    let response = client
        .send(method, &url, headers, record.body().clone())
        .await?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    info!(url = %url, status = status.as_u16(), bytes = body.len(), "Request replayed");

    Ok(ReplayResponse {
        status,
        headers,
        body,
    })
}
