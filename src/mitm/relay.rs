//! One-way byte relay between the two halves of a tunnel
//!
//! Each tunnel runs two relays, one per direction. A relay copies until its
//! source ends or fails, then releases its source and closes its
//! destination. The opposite direction is never touched, so a half-closed
//! tunnel keeps flowing the other way.
//!
//! The client → origin relay may also tee the decrypted bytes into a
//! [`CaptureSink`]; the buffer is converted and saved once the relay ends.

use crate::capture::{AuditRecord, Transport};
use crate::storage::RequestSink;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Direction of a relay, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ClientToOrigin,
    OriginToClient,
}

/// Per-relay limits
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// Stop after this long without reading anything (None = wait forever)
    pub idle_timeout: Option<Duration>,

    /// Bytes retained for capture; later bytes are relayed but not kept
    pub max_capture_bytes: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            max_capture_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Where captured tunnel bytes go
#[derive(Clone)]
pub struct CaptureSink {
    sink: Arc<dyn RequestSink>,
    target: String,
}

impl CaptureSink {
    pub fn new(sink: Arc<dyn RequestSink>, target: impl Into<String>) -> Self {
        Self {
            sink,
            target: target.into(),
        }
    }

    /// Convert the captured buffer and save it; failures are logged only
    pub async fn persist(&self, raw: Bytes) -> Option<i64> {
        let record = match AuditRecord::from_raw(&raw, Transport::InterceptedTls) {
            Ok(record) => record,
            Err(e) => {
                warn!(target = %self.target, bytes = raw.len(), error = %e, "Captured tunnel data is not a request");
                return None;
            }
        };

        match self.sink.save_request(&record).await {
            Ok(id) => {
                info!(id = id, method = %record.method(), path = %record.path(), "Intercepted request saved");
                Some(id)
            }
            Err(e) => {
                warn!(target = %self.target, error = %e, "Request wasn't saved");
                None
            }
        }
    }
}

/// What a finished relay did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Bytes delivered to the destination
    pub bytes: u64,

    /// Id of the saved record, when capture was on and succeeded
    pub saved_id: Option<i64>,
}

/// Copy `src` into `dst` until `src` ends, then close both
///
/// A missing endpoint makes the relay a no-op. I/O errors end the relay and
/// are logged, never returned.
pub async fn relay<W, R>(
    dst: Option<W>,
    src: Option<R>,
    capture: Option<CaptureSink>,
    direction: RelayDirection,
    options: RelayOptions,
) -> RelayOutcome
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let (mut dst, mut src) = match (dst, src) {
        (Some(dst), Some(src)) => (dst, src),
        _ => {
            debug!(direction = ?direction, "Relay endpoint missing, nothing to copy");
            return RelayOutcome::default();
        }
    };

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut captured = capture.as_ref().map(|_| BytesMut::new());
    let mut total: u64 = 0;

    loop {
        let read = match options.idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, src.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    debug!(direction = ?direction, idle = ?idle, "Relay idle timeout");
                    break;
                }
            },
            None => src.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction = ?direction, error = %e, "Relay read ended");
                break;
            }
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(direction = ?direction, error = %e, "Relay write failed");
            break;
        }
        if let Err(e) = dst.flush().await {
            debug!(direction = ?direction, error = %e, "Relay flush failed");
            break;
        }
        total += n as u64;

        if let Some(buffer) = captured.as_mut() {
            let room = options.max_capture_bytes.saturating_sub(buffer.len());
            buffer.extend_from_slice(&buf[..n.min(room)]);
        }
    }

    drop(src);
    if let Err(e) = dst.shutdown().await {
        debug!(direction = ?direction, error = %e, "Relay shutdown failed");
    }
    drop(dst);

    debug!(direction = ?direction, bytes = total, "Relay finished");

    let saved_id = match (capture, captured) {
        (Some(capture), Some(buffer)) if !buffer.is_empty() => capture.persist(buffer.freeze()).await,
        _ => None,
    };

    RelayOutcome {
        bytes: total,
        saved_id,
    }
}
