//! Async HTTP transport used for the capability fetch/upload paths.
//!
//! Thin wrapper over `reqwest` that streams response bodies, reports
//! progress per chunk and honors a [`CancellationToken`] between chunks.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Called with `(bytes_received, total_bytes)` after every body chunk.
/// Total is `None` when the server sends no Content-Length.
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Errors from the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request error for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request cancelled: {0}")]
    Cancelled(String),
}

/// Streaming HTTP client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Request {
                url: String::new(),
                source: e,
            })?;
        Ok(Self { client })
    }

    /// GETs `url`, streaming the body.
    ///
    /// Progress is reported after every chunk; the cancellation token is
    /// checked between chunks and aborts the download mid-body.
    pub async fn get(
        &self,
        url: &str,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpError::Request {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "HTTP fetch failed");
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut body = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(HttpError::Cancelled(url.to_string()));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| HttpError::Request {
                url: url.to_string(),
                source: e,
            })?;
            body.extend_from_slice(&chunk);
            if let Some(progress) = progress {
                progress(body.len() as u64, total);
            }
        }

        debug!(url, bytes = body.len(), "HTTP fetch complete");
        Ok(body)
    }

    /// POSTs `body` to `url` and returns the response bytes.
    pub async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, HttpError> {
        let request = self
            .client
            .post(url)
            .header("content-type", content_type)
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(HttpError::Cancelled(url.to_string()));
            }
            r = request => r.map_err(|e| HttpError::Request {
                url: url.to_string(),
                source: e,
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "HTTP post failed");
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| HttpError::Request {
                url: url.to_string(),
                source: e,
            })
    }
}
