use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aperture_gate::capture_routes;
use aperture_gate::config::{Cli, ServerConfig};
use aperture_gate::connection::GateState;
use aperture_gate::repository::ConnectionRepository;
use aperture_gate::sessions::{HttpSessionAuthority, SessionAuthority, StaticSessionAuthority};
use aperture_gate::sink::{FrameSink, HttpFrameSink, TracingFrameSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        receive_timeout_ms = config.receive_timeout.as_millis() as u64,
        "starting aperture-gate"
    );

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let authority: Arc<dyn SessionAuthority> = match &config.session_authority_url {
        Some(url) => {
            info!(url = %url, "using HTTP session authority");
            Arc::new(HttpSessionAuthority::new(url.clone()))
        }
        None => {
            info!("no session authority configured; accepting all sessions");
            Arc::new(StaticSessionAuthority::permissive())
        }
    };

    let sink: Arc<dyn FrameSink> = match &config.ingest_url {
        Some(url) => {
            info!(url = %url, "forwarding frames to ingest endpoint");
            Arc::new(HttpFrameSink::new(url.clone()))
        }
        None => {
            info!("no ingest endpoint configured; forwarded frames are logged and dropped");
            Arc::new(TracingFrameSink)
        }
    };

    let gate = GateState {
        repo: Arc::new(ConnectionRepository::new()),
        authority,
        sink,
        receive_timeout: config.receive_timeout,
        forward_caps: config.forward_caps,
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .merge(capture_routes(gate));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("aperture-gate listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("aperture-gate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    metrics.render()
}
