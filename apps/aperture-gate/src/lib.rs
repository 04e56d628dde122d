//! Aperture gate: the per-connection capture protocol engine.
//!
//! Library surface exists so the integration tests can assemble a real
//! server around test collaborators; the binary lives in `main.rs`.

pub mod config;
pub mod connection;
pub mod forwarder;
pub mod repository;
pub mod sessions;
pub mod sink;

use axum::routing::get;
use axum::Router;

use crate::connection::{capture_ws_handler, GateState};

/// Routes owned by the gateway: health plus the capture socket.
pub fn capture_routes(gate: GateState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/capture", get(capture_ws_handler))
        .with_state(gate)
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}
