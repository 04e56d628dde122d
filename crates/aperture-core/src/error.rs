use thiserror::Error;

use crate::limits;

/// Domain errors for a capture session.
///
/// Every variant maps to the stable `error_code` string carried by a
/// `capture.abort` message; [`CaptureError::error_code`] is the only place
/// those strings are defined.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("capture duration exceeds {} seconds", limits::MAX_DURATION_SECS)]
    LimitDurationExceeded,

    #[error("frame count would exceed {}", limits::MAX_FRAMES)]
    LimitFrameCountExceeded,

    #[error("resolution {width}x{height} exceeds {}x{} or {} pixels", limits::MAX_WIDTH, limits::MAX_HEIGHT, limits::MAX_PIXELS)]
    LimitResolutionExceeded { width: u32, height: u32 },

    #[error("fps_target {fps_target} exceeds {}", limits::MAX_FPS)]
    LimitFpsExceeded { fps_target: u32 },

    #[error("frame of {byte_length} bytes exceeds {}", limits::MAX_FRAME_BYTES)]
    LimitFrameBytesExceeded { byte_length: u64 },

    #[error("total bytes would exceed {}", limits::MAX_TOTAL_BYTES)]
    LimitTotalBytesExceeded,

    #[error("forward buffer is full")]
    LimitForwardBufferExceeded,

    #[error("background forwarding failed")]
    ForwardFailed,

    #[error("session is not valid for this user")]
    SessionInvalid,

    #[error("session has been closed")]
    SessionClosed,
}

impl CaptureError {
    /// Stable wire code reported to the client in `capture.abort`.
    pub fn error_code(&self) -> &'static str {
        match self {
            CaptureError::ProtocolViolation(_) => "protocol_violation",
            CaptureError::LimitDurationExceeded => "limit_duration_exceeded",
            CaptureError::LimitFrameCountExceeded => "limit_frame_count_exceeded",
            CaptureError::LimitResolutionExceeded { .. } => "limit_resolution_exceeded",
            CaptureError::LimitFpsExceeded { .. } => "limit_fps_exceeded",
            CaptureError::LimitFrameBytesExceeded { .. } => "limit_frame_bytes_exceeded",
            CaptureError::LimitTotalBytesExceeded => "limit_total_bytes_exceeded",
            CaptureError::LimitForwardBufferExceeded => "limit_forward_buffer_exceeded",
            CaptureError::ForwardFailed => "forward_failed",
            CaptureError::SessionInvalid => "session_invalid",
            CaptureError::SessionClosed => "session_closed",
        }
    }

    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        CaptureError::ProtocolViolation(detail.into())
    }
}
