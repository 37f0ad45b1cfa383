// Body Size Limiter - buffers a request body while enforcing a ceiling

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Body;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BodyLimitError {
    #[error("Request body too large: {current} bytes exceeds limit of {limit} bytes")]
    TooLarge { current: usize, limit: usize },

    #[error("Failed to read request body: {0}")]
    ReadError(String),
}

/// Collect a body frame by frame, failing as soon as `max_size` is crossed
pub async fn read_body_with_limit<B>(mut body: B, max_size: usize) -> Result<Bytes, BodyLimitError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut collected = BytesMut::new();
    let mut total_size = 0;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BodyLimitError::ReadError(e.to_string()))?;

        // Trailers are not part of the captured body
        if let Ok(data) = frame.into_data() {
            total_size += data.len();

            if total_size > max_size {
                warn!(
                    "[Body Limiter] Request body exceeded limit: {} bytes (limit: {})",
                    total_size, max_size
                );
                return Err(BodyLimitError::TooLarge {
                    current: total_size,
                    limit: max_size,
                });
            }

            collected.extend_from_slice(&data);
        }
    }

    Ok(collected.freeze())
}

impl BodyLimitError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BodyLimitError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BodyLimitError::ReadError(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            BodyLimitError::TooLarge { current, limit } => {
                format!(
                    "Request body too large: {} bytes (limit: {})",
                    current, limit
                )
            }
            BodyLimitError::ReadError(_) => "Failed to read request body".to_string(),
        }
    }
}
