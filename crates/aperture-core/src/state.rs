use std::time::Instant;

use chrono::{DateTime, Utc};

/// A frame declared by `capture.frame_meta`, awaiting its binary payload.
///
/// Exists iff the orchestrator's binary gate is armed for `byte_length`
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMeta {
    pub seq: u64,
    /// Client-supplied event time of the frame.
    pub frame_ts: DateTime<Utc>,
    pub byte_length: u64,
    /// Server ingest time the declaration arrived.
    pub meta_at: Instant,
}

/// Mutable state of one in-flight capture.
///
/// Event-time fields (`start`, `last_frame`) come from the client and are
/// never used for timeout math; ingest-time stamps are server-authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCapture {
    pub record_id: String,
    pub capture_id: String,
    pub user_id: String,
    pub session_id: String,

    pub start: DateTime<Utc>,
    pub last_frame: Option<DateTime<Utc>>,
    pub opened_at: Instant,

    pub fps_target: u32,
    pub width: u32,
    pub height: u32,
    pub encoding: String,

    pub frame_count: u64,
    pub total_bytes: u64,
    pub expected_next_seq: u64,

    pub pending_meta: Option<PendingMeta>,

    pub last_meta_at: Instant,
    pub last_session_check_at: Instant,
}

/// Per-connection capture lifecycle state.
///
/// A sum type rather than a flag-plus-optional-fields record: no
/// active-shaped field can exist while idle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Active(Box<ActiveCapture>),
}

impl CaptureState {
    pub fn is_active(&self) -> bool {
        matches!(self, CaptureState::Active(_))
    }

    pub fn capture_id(&self) -> Option<&str> {
        match self {
            CaptureState::Idle => None,
            CaptureState::Active(active) => Some(active.capture_id.as_str()),
        }
    }

    pub fn as_active(&self) -> Option<&ActiveCapture> {
        match self {
            CaptureState::Idle => None,
            CaptureState::Active(active) => Some(active),
        }
    }
}
