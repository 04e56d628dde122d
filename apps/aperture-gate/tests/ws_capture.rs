//! End-to-end protocol tests: a real server on an ephemeral port, driven by
//! a raw WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use aperture_core::IngestFrame;
use aperture_gate::connection::GateState;
use aperture_gate::repository::{ConnectionRepository, ForwardCaps};
use aperture_gate::sessions::StaticSessionAuthority;
use aperture_gate::sink::{FrameSink, SinkError};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<IngestFrame>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn ingest(&self, frame: IngestFrame) -> Result<(), SinkError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl FrameSink for FailingSink {
    async fn ingest(&self, _frame: IngestFrame) -> Result<(), SinkError> {
        Err(SinkError::Rejected(503))
    }
}

/// Accepts a frame and never finishes ingesting it.
struct StallingSink;

#[async_trait]
impl FrameSink for StallingSink {
    async fn ingest(&self, _frame: IngestFrame) -> Result<(), SinkError> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

struct Harness {
    authority: Arc<StaticSessionAuthority>,
    addr: SocketAddr,
}

async fn spawn_gate(sink: Arc<dyn FrameSink>, caps: ForwardCaps) -> Harness {
    let authority = Arc::new(StaticSessionAuthority::new());
    let gate = GateState {
        repo: Arc::new(ConnectionRepository::new()),
        authority: authority.clone(),
        sink,
        receive_timeout: Duration::from_millis(200),
        forward_caps: caps,
    };
    let router = aperture_gate::capture_routes(gate);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Harness { authority, addr }
}

fn default_caps() -> ForwardCaps {
    ForwardCaps {
        max_frames: 64,
        max_bytes: 16_000_000,
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws/capture"))
        .await
        .expect("failed to connect");
    ws
}

fn open_msg(capture_id: &str, user_id: &str, session_id: &str) -> String {
    serde_json::json!({
        "schema_version": "1.0.1",
        "record_id": Uuid::new_v4().to_string(),
        "user_id": user_id,
        "session_id": session_id,
        "timestamp": Utc::now().to_rfc3339(),
        "modality": "image",
        "source": "browser",
        "event": "capture.open",
        "capture_id": capture_id,
        "timestamp_start": Utc::now().to_rfc3339(),
        "fps_target": 15,
        "width": 640,
        "height": 480,
        "encoding": "jpeg",
    })
    .to_string()
}

fn meta_msg(capture_id: &str, user_id: &str, session_id: &str, seq: u64, byte_length: u64) -> String {
    serde_json::json!({
        "schema_version": "1.0.1",
        "record_id": Uuid::new_v4().to_string(),
        "user_id": user_id,
        "session_id": session_id,
        "timestamp": Utc::now().to_rfc3339(),
        "modality": "image",
        "source": "browser",
        "event": "capture.frame_meta",
        "capture_id": capture_id,
        "seq": seq,
        "timestamp_frame": Utc::now().to_rfc3339(),
        "byte_length": byte_length,
    })
    .to_string()
}

fn close_msg(capture_id: &str, user_id: &str, session_id: &str) -> String {
    serde_json::json!({
        "schema_version": "1.0.1",
        "record_id": Uuid::new_v4().to_string(),
        "user_id": user_id,
        "session_id": session_id,
        "timestamp": Utc::now().to_rfc3339(),
        "modality": "image",
        "source": "browser",
        "event": "capture.close",
        "capture_id": capture_id,
        "timestamp_end": Utc::now().to_rfc3339(),
    })
    .to_string()
}

async fn next_message(ws: &mut Ws) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(15), ws.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("connection ended without a close frame")
            .expect("websocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn expect_abort(ws: &mut Ws, expected_code: &str) {
    match next_message(ws).await {
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["event"], "capture.abort");
            assert_eq!(value["error_code"], expected_code);
        }
        other => panic!("expected capture.abort, got {other:?}"),
    }
}

async fn expect_close(ws: &mut Ws, expected: CloseCode) {
    match next_message(ws).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, expected),
        other => panic!("expected close frame, got {other:?}"),
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn happy_path_two_frames_closes_normally() {
    let sink = Arc::new(RecordingSink::default());
    let harness = spawn_gate(sink.clone(), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;

    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    for seq in 1..=2u64 {
        ws.send(Message::Text(
            meta_msg(&capture_id, "user-1", "sess-1", seq, 5).into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Binary(vec![seq as u8; 5].into()))
            .await
            .unwrap();
    }
    // Closing cancels the forwarder and drains whatever is still queued, so
    // let both frames reach the sink before asking for the close.
    wait_until(|| sink.frames.lock().len() == 2).await;

    ws.send(Message::Text(close_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();

    expect_close(&mut ws, CloseCode::Normal).await;

    let ids: Vec<String> = sink
        .frames
        .lock()
        .iter()
        .map(|frame| frame.frame_id.clone())
        .collect();
    assert_eq!(ids, vec![format!("{capture_id}:1"), format!("{capture_id}:2")]);
}

#[tokio::test]
async fn second_open_aborts_with_protocol_violation() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;

    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();

    expect_abort(&mut ws, "protocol_violation").await;
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn text_while_gate_is_armed_closes_1008_without_abort() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;

    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        meta_msg(&capture_id, "user-1", "sess-1", 1, 10).into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text("{\"oops\": \"text instead of bytes\"}".into()))
        .await
        .unwrap();

    expect_close(&mut ws, CloseCode::Policy).await;
}

#[tokio::test]
async fn binary_length_mismatch_closes_1008() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;

    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        meta_msg(&capture_id, "user-1", "sess-1", 1, 10).into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Binary(vec![0u8; 5].into())).await.unwrap();

    expect_close(&mut ws, CloseCode::Policy).await;
}

#[tokio::test]
async fn unparseable_payload_closes_1003() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    let mut ws = connect(harness.addr).await;

    ws.send(Message::Text("this is not json".into())).await.unwrap();

    expect_close(&mut ws, CloseCode::Unsupported).await;
}

#[tokio::test]
async fn replayed_record_id_closes_1008() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let record_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;

    let mut open: serde_json::Value =
        serde_json::from_str(&open_msg(&capture_id, "user-1", "sess-1")).unwrap();
    open["record_id"] = serde_json::json!(record_id);
    ws.send(Message::Text(open.to_string().into())).await.unwrap();

    let mut meta: serde_json::Value =
        serde_json::from_str(&meta_msg(&capture_id, "user-1", "sess-1", 1, 5)).unwrap();
    meta["record_id"] = serde_json::json!(record_id);
    ws.send(Message::Text(meta.to_string().into())).await.unwrap();

    expect_close(&mut ws, CloseCode::Policy).await;
}

#[tokio::test]
async fn open_over_fps_cap_closes_1008_without_abort() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let mut open: serde_json::Value =
        serde_json::from_str(&open_msg("cap-1", "user-1", "sess-1")).unwrap();
    open["fps_target"] = serde_json::json!(16);

    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open.to_string().into())).await.unwrap();

    // no capture exists, so no abort body: just the policy close
    expect_close(&mut ws, CloseCode::Policy).await;
}

#[tokio::test]
async fn unknown_session_aborts_on_open() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    // nothing registered with the authority

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();

    expect_abort(&mut ws, "session_invalid").await;
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn session_closed_mid_capture_aborts_on_recheck() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();

    harness.authority.close("sess-1");

    // Keep frames flowing so only the session recheck can fire.
    let mut seq = 1u64;
    let abort = loop {
        assert!(seq < 15, "no abort before the recheck interval elapsed");
        let _ = ws
            .send(Message::Text(
                meta_msg(&capture_id, "user-1", "sess-1", seq, 3).into(),
            ))
            .await;
        let _ = ws.send(Message::Binary(vec![0u8; 3].into())).await;
        seq += 1;

        match tokio::time::timeout(Duration::from_millis(800), ws.next()).await {
            Err(_) => continue,
            Ok(Some(Ok(Message::Text(text)))) => break text,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected capture.abort, got {other:?}"),
        }
    };
    let value: serde_json::Value = serde_json::from_str(&abort).unwrap();
    assert_eq!(value["event"], "capture.abort");
    assert_eq!(value["error_code"], "session_closed");
}

#[tokio::test]
async fn dead_session_outranks_domain_timeout_on_the_same_tick() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    // Declare a frame and never send its bytes: the declared-frame timeout
    // will fire. With the session closed underneath, the abort must report
    // the session, not the timeout.
    ws.send(Message::Text(
        meta_msg(&capture_id, "user-1", "sess-1", 1, 10).into(),
    ))
    .await
    .unwrap();
    harness.authority.close("sess-1");

    expect_abort(&mut ws, "session_closed").await;
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn sink_failure_aborts_with_forward_failed() {
    let harness = spawn_gate(Arc::new(FailingSink), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        meta_msg(&capture_id, "user-1", "sess-1", 1, 5).into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Binary(vec![0u8; 5].into())).await.unwrap();

    expect_abort(&mut ws, "forward_failed").await;
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn forward_buffer_overflow_aborts_the_capture() {
    let caps = ForwardCaps {
        max_frames: 1,
        max_bytes: 10_000,
    };
    let harness = spawn_gate(Arc::new(StallingSink), caps).await;
    harness.authority.insert_active("user-1", "sess-1");

    let capture_id = Uuid::new_v4().to_string();
    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg(&capture_id, "user-1", "sess-1").into()))
        .await
        .unwrap();

    // With the sink stalled, at most one frame is in flight and one can sit
    // in the buffer; the next one must overflow.
    for seq in 1..=3u64 {
        let _ = ws
            .send(Message::Text(
                meta_msg(&capture_id, "user-1", "sess-1", seq, 4).into(),
            ))
            .await;
        let _ = ws.send(Message::Binary(vec![0u8; 4].into())).await;
    }

    expect_abort(&mut ws, "limit_forward_buffer_exceeded").await;
    expect_close(&mut ws, CloseCode::Normal).await;
}

#[tokio::test]
async fn capture_id_mismatch_closes_1008() {
    let harness = spawn_gate(Arc::new(RecordingSink::default()), default_caps()).await;
    harness.authority.insert_active("user-1", "sess-1");

    let mut ws = connect(harness.addr).await;
    ws.send(Message::Text(open_msg("cap-a", "user-1", "sess-1").into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        meta_msg("cap-b", "user-1", "sess-1", 1, 5).into(),
    ))
    .await
    .unwrap();

    expect_close(&mut ws, CloseCode::Policy).await;
}
