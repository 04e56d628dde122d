//! Downstream ingestion seam.

use aperture_core::IngestFrame;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("ingest request failed: {0}")]
    Transport(String),
    #[error("ingest rejected frame with status {0}")]
    Rejected(u16),
}

/// Consumer of accepted frames. Implementations must not touch the socket
/// or connection state; they see only the denormalized frame.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn ingest(&self, frame: IngestFrame) -> Result<(), SinkError>;
}

/// POSTs frames to the feature extractor's ingest endpoint.
pub struct HttpFrameSink {
    client: reqwest::Client,
    url: String,
}

impl HttpFrameSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl FrameSink for HttpFrameSink {
    async fn ingest(&self, frame: IngestFrame) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&frame)
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Logs and drops frames; the dev default when no ingest URL is configured.
#[derive(Default)]
pub struct TracingFrameSink;

#[async_trait]
impl FrameSink for TracingFrameSink {
    async fn ingest(&self, frame: IngestFrame) -> Result<(), SinkError> {
        debug!(
            frame_id = %frame.frame_id,
            session_id = %frame.session_id,
            bytes = frame.frame_data.len(),
            "dropping forwarded frame (no ingest sink configured)"
        );
        Ok(())
    }
}
