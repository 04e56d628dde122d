//! Accepted frames on their way downstream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// One accepted frame queued for forwarding.
///
/// Carries denormalized capture context so the forwarder never has to read
/// connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardItem {
    pub capture_id: String,
    pub seq: u64,
    pub frame_ts: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub byte_length: u64,

    pub encoding: String,
    pub width: u32,
    pub height: u32,
    pub user_id: String,
    pub session_id: String,
}

impl ForwardItem {
    /// Structural invariants, checked before the item enters the buffer.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.capture_id.is_empty() || self.user_id.is_empty() || self.session_id.is_empty() {
            return Err(CaptureError::ProtocolViolation(
                "forward item with empty identity field".into(),
            ));
        }
        if self.seq == 0 {
            return Err(CaptureError::ProtocolViolation(
                "forward item seq must be >= 1".into(),
            ));
        }
        if self.byte_length != self.payload.len() as u64 {
            return Err(CaptureError::ProtocolViolation(
                "forward item byte_length does not match payload".into(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::ProtocolViolation(
                "forward item with zero dimension".into(),
            ));
        }
        Ok(())
    }
}

/// Input shape of the downstream feature extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFrame {
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub modality: String,
    pub source: String,
    /// Base64 of the raw frame payload.
    pub frame_data: String,
}

impl From<&ForwardItem> for IngestFrame {
    fn from(item: &ForwardItem) -> Self {
        IngestFrame {
            frame_id: format!("{}:{}", item.capture_id, item.seq),
            timestamp: item.frame_ts,
            session_id: item.session_id.clone(),
            user_id: item.user_id.clone(),
            modality: "vision".to_owned(),
            source: "aperture-gate".to_owned(),
            frame_data: STANDARD.encode(&item.payload),
        }
    }
}
