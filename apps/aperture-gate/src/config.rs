use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::repository::ForwardCaps;

#[derive(Debug, Parser)]
#[command(
    name = "aperture-gate",
    author,
    version,
    about = "Real-time capture gateway (WebSocket ingest)"
)]
pub struct Cli {
    /// Address to bind the listener to.
    #[arg(long, env = "APERTURE_LISTEN_ADDR", default_value = "127.0.0.1:8089")]
    pub listen_addr: String,

    /// Socket receive timeout in milliseconds; also the tick cadence.
    #[arg(long, env = "APERTURE_RECEIVE_TIMEOUT_MS", default_value_t = 1000)]
    pub receive_timeout_ms: u64,

    /// Maximum frames buffered per connection awaiting forwarding.
    #[arg(long, env = "APERTURE_FORWARD_MAX_FRAMES", default_value_t = 64)]
    pub forward_max_frames: usize,

    /// Maximum bytes buffered per connection awaiting forwarding.
    #[arg(long, env = "APERTURE_FORWARD_MAX_BYTES", default_value_t = 16_000_000)]
    pub forward_max_bytes: u64,

    /// Base URL of the session authority. Unset runs the in-memory dev
    /// authority, which accepts every session.
    #[arg(long, env = "APERTURE_SESSION_AUTHORITY_URL")]
    pub session_authority_url: Option<String>,

    /// Ingest URL of the downstream feature extractor. Unset logs and drops
    /// forwarded frames.
    #[arg(long, env = "APERTURE_INGEST_URL")]
    pub ingest_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub receive_timeout: Duration,
    pub forward_caps: ForwardCaps,
    pub session_authority_url: Option<String>,
    pub ingest_url: Option<String>,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.receive_timeout_ms == 0 {
            anyhow::bail!("receive timeout must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            receive_timeout: Duration::from_millis(cli.receive_timeout_ms),
            forward_caps: ForwardCaps {
                max_frames: cli.forward_max_frames,
                max_bytes: cli.forward_max_bytes,
            },
            session_authority_url: cli.session_authority_url,
            ingest_url: cli.ingest_url,
        })
    }
}
