//! Wire-level control messages.
//!
//! Control frames are JSON with a session envelope flattened alongside an
//! `event`-tagged body; binary frames carry raw payload bytes with no
//! envelope and are valid only while the orchestrator's binary gate is
//! armed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session envelope carried by every client control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: String,
    pub record_id: String,
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub modality: String,
    pub source: String,
}

/// The event body of a client control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum CaptureRequest {
    #[serde(rename = "capture.open")]
    Open {
        capture_id: String,
        timestamp_start: DateTime<Utc>,
        fps_target: u32,
        width: u32,
        height: u32,
        #[serde(default = "default_encoding")]
        encoding: String,
    },
    #[serde(rename = "capture.frame_meta")]
    FrameMeta {
        capture_id: String,
        seq: u64,
        timestamp_frame: DateTime<Utc>,
        byte_length: u64,
    },
    #[serde(rename = "capture.close")]
    Close {
        capture_id: String,
        timestamp_end: DateTime<Utc>,
    },
}

fn default_encoding() -> String {
    "jpeg".to_owned()
}

impl CaptureRequest {
    pub fn capture_id(&self) -> &str {
        match self {
            CaptureRequest::Open { capture_id, .. }
            | CaptureRequest::FrameMeta { capture_id, .. }
            | CaptureRequest::Close { capture_id, .. } => capture_id,
        }
    }

    /// Wire name of the event, for logging.
    pub fn label(&self) -> &'static str {
        match self {
            CaptureRequest::Open { .. } => "capture.open",
            CaptureRequest::FrameMeta { .. } => "capture.frame_meta",
            CaptureRequest::Close { .. } => "capture.close",
        }
    }
}

/// A full client control message: envelope plus event body, both at the top
/// level of the JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub request: CaptureRequest,
}

/// Server-to-client messages. `capture.abort` is the only application-level
/// output; everything else the server says is a close code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    #[serde(rename = "capture.abort")]
    Abort {
        capture_id: String,
        error_code: String,
    },
}
