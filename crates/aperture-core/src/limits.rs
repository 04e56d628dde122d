//! Locked capture protocol limits.
//!
//! These are protocol constants, not deployment tunables; changing them is a
//! wire-contract change for every client.

use std::time::Duration;

/// Longest a single capture may run, in both event time and ingest time.
pub const MAX_DURATION_SECS: u64 = 15;
pub const MAX_DURATION: Duration = Duration::from_secs(MAX_DURATION_SECS);

pub const MAX_FPS: u32 = 15;
pub const MAX_WIDTH: u32 = 640;
pub const MAX_HEIGHT: u32 = 480;
pub const MAX_PIXELS: u64 = 307_200;

pub const MAX_FRAMES: u64 = 225;
pub const MAX_FRAME_BYTES: u64 = 300_000;
pub const MAX_TOTAL_BYTES: u64 = 50_000_000;

/// A declared frame must be followed by its binary payload within this window.
pub const META_TO_BYTES_TIMEOUT: Duration = Duration::from_secs(2);

/// An active capture with no `frame_meta` for this long is considered stalled.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often an active capture's session must be re-validated.
pub const SESSION_RECHECK_INTERVAL: Duration = Duration::from_secs(5);
