//! The capture state machine.
//!
//! [`dispatch`] is a pure transition function: it reads nothing but its
//! arguments and performs no I/O. The caller owns the clock (ingest time is
//! passed in) and executes the emitted [`Action`]s.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::CaptureError;
use crate::limits;
use crate::state::{ActiveCapture, CaptureState, PendingMeta};

/// Parameters of a validated `capture.open` control message.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub record_id: String,
    pub capture_id: String,
    pub user_id: String,
    pub session_id: String,
    pub start: DateTime<Utc>,
    pub fps_target: u32,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
}

/// One semantic event against a connection's capture state.
#[derive(Debug, Clone)]
pub enum Event {
    Open(OpenParams),
    FrameMeta {
        seq: u64,
        frame_ts: DateTime<Utc>,
        byte_length: u64,
    },
    /// The binary payload that was gated on. Carries only the received
    /// length; the machine never sees frame bytes.
    FrameBytes { byte_length: u64 },
    Close { end: DateTime<Utc> },
    /// Periodic ingest-time check, injected by the connection loop.
    Tick,
}

/// Side effects requested by a transition. The machine never executes these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AbortCapture {
        error_code: &'static str,
        capture_id: String,
    },
    ForwardFrame {
        capture_id: String,
        seq: u64,
        frame_ts: DateTime<Utc>,
        byte_length: u64,
    },
    RequestSessionValidation {
        user_id: String,
        session_id: String,
    },
    RequestSessionRecheck {
        user_id: String,
        session_id: String,
    },
    CleanupCapture { capture_id: String },
}

/// Apply one event to the capture state.
///
/// Abort semantics: a domain error raised while a capture is active is
/// converted here into `(Idle, [AbortCapture, CleanupCapture])` so the
/// client always receives a terminal abort for a capture that existed. The
/// same error while idle is returned as `Err`: a protocol violation with
/// no capture to report against, left to the caller to turn into a hard
/// close.
pub fn dispatch(
    state: CaptureState,
    event: Event,
    now: Instant,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    let capture_id = state.capture_id().map(str::to_owned);
    match apply(state, event, now) {
        Ok(next) => Ok(next),
        Err(err) => match capture_id {
            Some(capture_id) => Ok((
                CaptureState::Idle,
                vec![
                    Action::AbortCapture {
                        error_code: err.error_code(),
                        capture_id: capture_id.clone(),
                    },
                    Action::CleanupCapture { capture_id },
                ],
            )),
            None => Err(err),
        },
    }
}

fn apply(
    state: CaptureState,
    event: Event,
    now: Instant,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    match event {
        Event::Open(params) => handle_open(state, params, now),
        Event::FrameMeta {
            seq,
            frame_ts,
            byte_length,
        } => handle_frame_meta(state, seq, frame_ts, byte_length, now),
        Event::FrameBytes { byte_length } => handle_frame_bytes(state, byte_length),
        Event::Close { end } => handle_close(state, end),
        Event::Tick => handle_tick(state, now),
    }
}

fn require_active(state: CaptureState) -> Result<Box<ActiveCapture>, CaptureError> {
    match state {
        CaptureState::Active(active) => Ok(active),
        CaptureState::Idle => Err(CaptureError::protocol("expected an active capture")),
    }
}

fn handle_open(
    state: CaptureState,
    params: OpenParams,
    now: Instant,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    if state.is_active() {
        return Err(CaptureError::protocol(
            "capture.open while a capture is already active",
        ));
    }

    if params.fps_target > limits::MAX_FPS {
        return Err(CaptureError::LimitFpsExceeded {
            fps_target: params.fps_target,
        });
    }
    if params.width > limits::MAX_WIDTH
        || params.height > limits::MAX_HEIGHT
        || u64::from(params.width) * u64::from(params.height) > limits::MAX_PIXELS
    {
        return Err(CaptureError::LimitResolutionExceeded {
            width: params.width,
            height: params.height,
        });
    }

    let actions = vec![Action::RequestSessionValidation {
        user_id: params.user_id.clone(),
        session_id: params.session_id.clone(),
    }];

    let active = ActiveCapture {
        record_id: params.record_id,
        capture_id: params.capture_id,
        user_id: params.user_id,
        session_id: params.session_id,
        start: params.start,
        last_frame: None,
        opened_at: now,
        fps_target: params.fps_target,
        width: params.width,
        height: params.height,
        encoding: params.encoding,
        frame_count: 0,
        total_bytes: 0,
        expected_next_seq: 1,
        pending_meta: None,
        last_meta_at: now,
        last_session_check_at: now,
    };

    Ok((CaptureState::Active(Box::new(active)), actions))
}

fn handle_frame_meta(
    state: CaptureState,
    seq: u64,
    frame_ts: DateTime<Utc>,
    byte_length: u64,
    now: Instant,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    let mut active = require_active(state)?;

    if active.pending_meta.is_some() {
        return Err(CaptureError::protocol(
            "frame_meta while a declared frame is still awaiting bytes",
        ));
    }
    if seq != active.expected_next_seq {
        return Err(CaptureError::protocol(format!(
            "seq {seq} != expected_next_seq {}",
            active.expected_next_seq
        )));
    }
    if let Some(last_frame) = active.last_frame {
        if frame_ts < last_frame {
            return Err(CaptureError::protocol(
                "timestamp_frame must not precede the last accepted frame",
            ));
        }
    }

    active.pending_meta = Some(PendingMeta {
        seq,
        frame_ts,
        byte_length,
        meta_at: now,
    });
    active.last_meta_at = now;

    Ok((CaptureState::Active(active), Vec::new()))
}

fn handle_frame_bytes(
    state: CaptureState,
    byte_length: u64,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    let mut active = require_active(state)?;

    let pending = active
        .pending_meta
        .take()
        .ok_or_else(|| CaptureError::protocol("frame bytes received without a declared frame"))?;

    if byte_length != pending.byte_length {
        return Err(CaptureError::protocol(format!(
            "received {byte_length} bytes, declared {}",
            pending.byte_length
        )));
    }
    if pending.byte_length > limits::MAX_FRAME_BYTES {
        return Err(CaptureError::LimitFrameBytesExceeded {
            byte_length: pending.byte_length,
        });
    }
    if active.total_bytes + pending.byte_length > limits::MAX_TOTAL_BYTES {
        return Err(CaptureError::LimitTotalBytesExceeded);
    }
    if active.frame_count + 1 > limits::MAX_FRAMES {
        return Err(CaptureError::LimitFrameCountExceeded);
    }

    active.frame_count += 1;
    active.total_bytes += pending.byte_length;
    active.last_frame = Some(pending.frame_ts);
    active.expected_next_seq += 1;

    let actions = vec![Action::ForwardFrame {
        capture_id: active.capture_id.clone(),
        seq: pending.seq,
        frame_ts: pending.frame_ts,
        byte_length: pending.byte_length,
    }];

    Ok((CaptureState::Active(active), actions))
}

fn handle_close(
    state: CaptureState,
    end: DateTime<Utc>,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    let active = require_active(state)?;

    if active.pending_meta.is_some() {
        return Err(CaptureError::protocol(
            "capture.close while a declared frame is still awaiting bytes",
        ));
    }
    if end < active.start {
        return Err(CaptureError::protocol(
            "timestamp_end must not precede timestamp_start",
        ));
    }
    if let Some(last_frame) = active.last_frame {
        if end < last_frame {
            return Err(CaptureError::protocol(
                "timestamp_end must not precede the last accepted frame",
            ));
        }
    }
    if (end - active.start) > chrono::Duration::seconds(limits::MAX_DURATION_SECS as i64) {
        return Err(CaptureError::LimitDurationExceeded);
    }

    Ok((
        CaptureState::Idle,
        vec![Action::CleanupCapture {
            capture_id: active.capture_id,
        }],
    ))
}

fn handle_tick(
    state: CaptureState,
    now: Instant,
) -> Result<(CaptureState, Vec<Action>), CaptureError> {
    let mut active = match state {
        CaptureState::Idle => return Ok((CaptureState::Idle, Vec::new())),
        CaptureState::Active(active) => active,
    };

    if now.duration_since(active.opened_at) > limits::MAX_DURATION {
        return Err(CaptureError::LimitDurationExceeded);
    }
    if let Some(pending) = &active.pending_meta {
        if now.duration_since(pending.meta_at) > limits::META_TO_BYTES_TIMEOUT {
            return Err(CaptureError::protocol(
                "declared frame bytes not received in time",
            ));
        }
    }
    if now.duration_since(active.last_meta_at) > limits::IDLE_TIMEOUT {
        return Err(CaptureError::protocol("no frame_meta within idle timeout"));
    }

    let mut actions = Vec::new();
    if now.duration_since(active.last_session_check_at) >= limits::SESSION_RECHECK_INTERVAL {
        actions.push(Action::RequestSessionRecheck {
            user_id: active.user_id.clone(),
            session_id: active.session_id.clone(),
        });
        active.last_session_check_at = now;
    }

    Ok((CaptureState::Active(active), actions))
}
