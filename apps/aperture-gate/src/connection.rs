//! Per-connection protocol orchestrator.
//!
//! One loop per accepted socket. The loop ticks the state machine on a
//! fixed receive timeout, enforces identity and framing rules, executes the
//! actions the machine emits, and owns the binary gate ("the next inbound
//! frame must be N payload bytes").

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aperture_core::machine::{self, Action, Event, OpenParams};
use aperture_core::protocol::{CaptureRequest, ClientMessage, ServerMessage};
use aperture_core::{CaptureState, ForwardItem};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use metrics::counter;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::forwarder;
use crate::repository::{ConnectionRepository, ForwardCaps, RepositoryError};
use crate::sessions::{SessionAuthority, SessionStatus};
use crate::sink::FrameSink;

/// Shared collaborators handed to every connection loop.
#[derive(Clone)]
pub struct GateState {
    pub repo: Arc<ConnectionRepository>,
    pub authority: Arc<dyn SessionAuthority>,
    pub sink: Arc<dyn FrameSink>,
    pub receive_timeout: Duration,
    pub forward_caps: ForwardCaps,
}

/// How a connection ends. For any single failure the client gets exactly
/// one `capture.abort` before close, or a bare close code, never both.
enum Closure {
    /// Clean end of capture: 1000.
    Normal,
    /// Send one `capture.abort`, then close 1000.
    Abort {
        capture_id: String,
        error_code: &'static str,
    },
    /// Protocol or identity violation with no capture context: 1008.
    Policy(&'static str),
    /// Unparseable control payload: 1003.
    Unparseable(&'static str),
    /// Defensive internal failure: 1011.
    Internal,
    /// Peer is gone; nothing left to say.
    Disconnected,
}

pub async fn capture_ws_handler(State(state): State<GateState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GateState) {
    let connection_id = Uuid::new_v4();
    counter!("aperture_connections_total", 1);
    debug!(%connection_id, "capture connection accepted");

    let closure = run_connection(&mut socket, &state, connection_id).await;

    // No capture state or background task survives the connection, on any
    // exit path.
    state.repo.stop_forwarding(connection_id);
    state.repo.clear(connection_id);

    finish(socket, connection_id, closure).await;
    debug!(%connection_id, "capture connection closed");
}

async fn run_connection(
    socket: &mut WebSocket,
    state: &GateState,
    connection_id: Uuid,
) -> Closure {
    // Armed iff the active capture holds a pending frame declaration.
    let mut expected_bytes: Option<u64> = None;

    loop {
        // Time-driven checks run first so a silent client cannot dodge them.
        if let Some(closure) = run_tick(state, connection_id).await {
            return closure;
        }

        // Surface a forwarder death recorded since the last iteration.
        if state.repo.raise_if_forward_failed(connection_id).is_err() {
            let current = state.repo.state(connection_id);
            match current.capture_id() {
                Some(capture_id) => {
                    let capture_id = capture_id.to_owned();
                    state.repo.reset_state(connection_id);
                    return Closure::Abort {
                        capture_id,
                        error_code: "forward_failed",
                    };
                }
                None => return Closure::Internal,
            }
        }

        let message = match timeout(state.receive_timeout, socket.recv()).await {
            Err(_) => continue, // receive timeout: loop back into the tick
            Ok(None) => return Closure::Disconnected,
            Ok(Some(Err(err))) => {
                debug!(%connection_id, error = %err, "socket receive error");
                return Closure::Disconnected;
            }
            Ok(Some(Ok(message))) => message,
        };

        // Binary gate armed: only the declared payload is acceptable.
        if let Some(expected) = expected_bytes {
            match message {
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Closure::Disconnected,
                Message::Binary(payload) => {
                    expected_bytes = None;
                    if payload.len() as u64 != expected {
                        return Closure::Policy("binary frame length mismatch");
                    }
                    match accept_frame_bytes(state, connection_id, payload, &mut expected_bytes)
                        .await
                    {
                        Some(closure) => return closure,
                        None => continue,
                    }
                }
                Message::Text(_) => {
                    return Closure::Policy("expected binary frame bytes");
                }
            }
        }

        // Control plane: a structured text message.
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(_) => return Closure::Policy("unexpected binary frame"),
            Message::Close(_) => return Closure::Disconnected,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match handle_control(state, connection_id, &text, &mut expected_bytes).await {
            Some(closure) => return closure,
            None => continue,
        }
    }
}

/// Dispatch a tick and execute what it asks for. `Some` ends the connection.
async fn run_tick(state: &GateState, connection_id: Uuid) -> Option<Closure> {
    let current = state.repo.state(connection_id);
    let identity = current
        .as_active()
        .map(|active| (active.user_id.clone(), active.session_id.clone()));

    let (next, actions) = match machine::dispatch(current, Event::Tick, Instant::now()) {
        Ok(result) => result,
        // Ticks never fail while idle; treat a failure as internal.
        Err(err) => {
            warn!(%connection_id, error = %err, "tick dispatch failed");
            return Some(Closure::Internal);
        }
    };
    state.repo.set_state(connection_id, next);

    for action in actions {
        match action {
            Action::RequestSessionRecheck {
                user_id,
                session_id,
            } => match state.authority.validate(&user_id, &session_id).await {
                SessionStatus::Active => {}
                status => {
                    let capture_id = state
                        .repo
                        .state(connection_id)
                        .capture_id()
                        .map(str::to_owned);
                    state.repo.reset_state(connection_id);
                    return Some(match capture_id {
                        Some(capture_id) => Closure::Abort {
                            capture_id,
                            error_code: session_error_code(status),
                        },
                        None => Closure::Internal,
                    });
                }
            },
            Action::AbortCapture {
                error_code,
                capture_id,
            } => {
                // A session that died this tick outranks the domain error.
                let error_code = match &identity {
                    Some((user_id, session_id)) => {
                        match state.authority.validate(user_id, session_id).await {
                            SessionStatus::Active => error_code,
                            status => session_error_code(status),
                        }
                    }
                    None => error_code,
                };
                return Some(Closure::Abort {
                    capture_id,
                    error_code,
                });
            }
            Action::CleanupCapture { .. }
            | Action::ForwardFrame { .. }
            | Action::RequestSessionValidation { .. } => {}
        }
    }
    None
}

/// The gated binary payload arrived with the right length.
async fn accept_frame_bytes(
    state: &GateState,
    connection_id: Uuid,
    payload: Vec<u8>,
    gate: &mut Option<u64>,
) -> Option<Closure> {
    let current = state.repo.state(connection_id);
    let context = match current.as_active() {
        Some(active) => FrameContext {
            capture_id: active.capture_id.clone(),
            encoding: active.encoding.clone(),
            width: active.width,
            height: active.height,
            user_id: active.user_id.clone(),
            session_id: active.session_id.clone(),
        },
        // The gate is only armed while a capture holds a pending frame.
        None => return Some(Closure::Internal),
    };

    let byte_length = payload.len() as u64;
    let (next, actions) =
        match machine::dispatch(current, Event::FrameBytes { byte_length }, Instant::now()) {
            Ok(result) => result,
            Err(err) => {
                warn!(%connection_id, error = %err, "frame bytes dispatch failed");
                return Some(Closure::Internal);
            }
        };
    *gate = pending_length(&next);
    state.repo.set_state(connection_id, next);

    let mut payload = Some(payload);
    for action in actions {
        match action {
            Action::AbortCapture {
                error_code,
                capture_id,
            } => {
                return Some(Closure::Abort {
                    capture_id,
                    error_code,
                });
            }
            Action::ForwardFrame {
                capture_id,
                seq,
                frame_ts,
                byte_length,
            } => {
                let item = ForwardItem {
                    capture_id,
                    seq,
                    frame_ts,
                    payload: payload.take().unwrap_or_default(),
                    byte_length,
                    encoding: context.encoding.clone(),
                    width: context.width,
                    height: context.height,
                    user_id: context.user_id.clone(),
                    session_id: context.session_id.clone(),
                };
                if let Err(err) = state.repo.enqueue_frame(connection_id, item) {
                    // Fail-fast backpressure: a full buffer aborts the
                    // capture instead of growing memory.
                    let error_code = match err {
                        RepositoryError::Capture(err) => err.error_code(),
                        RepositoryError::ForwardNotInitialized => {
                            warn!(%connection_id, "frame accepted without forwarding state");
                            return Some(Closure::Internal);
                        }
                    };
                    state.repo.reset_state(connection_id);
                    return Some(Closure::Abort {
                        capture_id: context.capture_id.clone(),
                        error_code,
                    });
                }
                counter!("aperture_frames_accepted_total", 1);
            }
            Action::CleanupCapture { .. }
            | Action::RequestSessionValidation { .. }
            | Action::RequestSessionRecheck { .. } => {}
        }
    }
    None
}

struct FrameContext {
    capture_id: String,
    encoding: String,
    width: u32,
    height: u32,
    user_id: String,
    session_id: String,
}

/// Parse, identity-check and dispatch one control message.
async fn handle_control(
    state: &GateState,
    connection_id: Uuid,
    text: &str,
    gate: &mut Option<u64>,
) -> Option<Closure> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(%connection_id, error = %err, "unparseable control message");
            return Some(Closure::Unparseable("malformed control message"));
        }
    };

    if let Some(closure) = check_identity(state, connection_id, &message) {
        return Some(closure);
    }
    state.repo.mark_seen(connection_id, &message.envelope.record_id);

    let event = match &message.request {
        CaptureRequest::Open {
            capture_id,
            timestamp_start,
            fps_target,
            width,
            height,
            encoding,
        } => Event::Open(OpenParams {
            record_id: message.envelope.record_id.clone(),
            capture_id: capture_id.clone(),
            user_id: message.envelope.user_id.clone(),
            session_id: message.envelope.session_id.clone(),
            start: *timestamp_start,
            fps_target: *fps_target,
            width: *width,
            height: *height,
            encoding: encoding.clone(),
        }),
        CaptureRequest::FrameMeta {
            seq,
            timestamp_frame,
            byte_length,
            ..
        } => Event::FrameMeta {
            seq: *seq,
            frame_ts: *timestamp_frame,
            byte_length: *byte_length,
        },
        CaptureRequest::Close { timestamp_end, .. } => Event::Close {
            end: *timestamp_end,
        },
    };

    let current = state.repo.state(connection_id);
    let (next, actions) = match machine::dispatch(current, event, Instant::now()) {
        Ok(result) => result,
        Err(err) => {
            // No capture context to abort against: hard close.
            debug!(
                %connection_id,
                event = message.request.label(),
                error = %err,
                "rejected control message while idle"
            );
            return Some(Closure::Policy("protocol violation outside an active capture"));
        }
    };
    *gate = pending_length(&next);
    state.repo.set_state(connection_id, next);

    for action in actions {
        match action {
            Action::AbortCapture {
                error_code,
                capture_id,
            } => {
                return Some(Closure::Abort {
                    capture_id,
                    error_code,
                });
            }
            Action::RequestSessionValidation {
                user_id,
                session_id,
            } => match state.authority.validate(&user_id, &session_id).await {
                SessionStatus::Active => {
                    state.repo.init_forwarding(connection_id, state.forward_caps);
                    let task = forwarder::spawn(
                        Arc::clone(&state.repo),
                        connection_id,
                        Arc::clone(&state.sink),
                    );
                    state.repo.start_forwarding_task(connection_id, task);
                    counter!("aperture_captures_opened_total", 1);
                    info!(
                        %connection_id,
                        capture_id = message.request.capture_id(),
                        %session_id,
                        "capture opened"
                    );
                }
                status => {
                    let capture_id = state
                        .repo
                        .state(connection_id)
                        .capture_id()
                        .map(str::to_owned);
                    state.repo.reset_state(connection_id);
                    return Some(match capture_id {
                        Some(capture_id) => Closure::Abort {
                            capture_id,
                            error_code: session_error_code(status),
                        },
                        None => Closure::Internal,
                    });
                }
            },
            Action::CleanupCapture { capture_id } => {
                info!(%connection_id, %capture_id, "capture closed cleanly");
                return Some(Closure::Normal);
            }
            Action::ForwardFrame { .. } | Action::RequestSessionRecheck { .. } => {}
        }
    }
    None
}

/// Identity and correlation rules, enforced before any dispatch.
fn check_identity(
    state: &GateState,
    connection_id: Uuid,
    message: &ClientMessage,
) -> Option<Closure> {
    let envelope = &message.envelope;
    if envelope.record_id.trim().is_empty() {
        return Some(Closure::Policy("empty record_id"));
    }
    if state.repo.has_seen(connection_id, &envelope.record_id) {
        return Some(Closure::Policy("record_id replayed on this connection"));
    }
    if message.request.capture_id().trim().is_empty() {
        return Some(Closure::Policy("empty capture_id"));
    }
    if matches!(message.request, CaptureRequest::Open { .. })
        && (envelope.user_id.trim().is_empty() || envelope.session_id.trim().is_empty())
    {
        return Some(Closure::Policy("capture.open requires user_id and session_id"));
    }
    let current = state.repo.state(connection_id);
    if let Some(active_id) = current.capture_id() {
        if message.request.capture_id() != active_id {
            return Some(Closure::Policy("capture_id does not match the active capture"));
        }
    }
    None
}

fn pending_length(state: &CaptureState) -> Option<u64> {
    state
        .as_active()
        .and_then(|active| active.pending_meta.as_ref())
        .map(|pending| pending.byte_length)
}

fn session_error_code(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Closed => "session_closed",
        _ => "session_invalid",
    }
}

async fn finish(mut socket: WebSocket, connection_id: Uuid, closure: Closure) {
    match closure {
        Closure::Normal => close(&mut socket, close_code::NORMAL, "closed").await,
        Closure::Abort {
            capture_id,
            error_code,
        } => {
            counter!("aperture_captures_aborted_total", 1, "error_code" => error_code);
            info!(%connection_id, %capture_id, error_code, "aborting capture");
            let abort = ServerMessage::Abort {
                capture_id,
                error_code: error_code.to_owned(),
            };
            match serde_json::to_string(&abort) {
                Ok(json) => {
                    let _ = socket.send(Message::Text(json)).await;
                }
                Err(err) => {
                    warn!(%connection_id, error = %err, "failed to encode abort message");
                }
            }
            close(&mut socket, close_code::NORMAL, "capture aborted").await;
        }
        Closure::Policy(reason) => {
            counter!("aperture_protocol_closes_total", 1);
            debug!(%connection_id, reason, "closing for protocol violation");
            close(&mut socket, close_code::POLICY, reason).await;
        }
        Closure::Unparseable(reason) => {
            close(&mut socket, close_code::UNSUPPORTED, reason).await;
        }
        Closure::Internal => {
            close(&mut socket, close_code::ERROR, "internal error").await;
        }
        Closure::Disconnected => {}
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
