//! Background forwarder: drains one connection's forward buffer into the
//! downstream sink.
//!
//! The forwarder never sends on the socket, never closes it and never
//! clears the repository; its only interaction with connection state is the
//! buffer and the failure cell.

use std::sync::Arc;

use aperture_core::IngestFrame;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::repository::ConnectionRepository;
use crate::sink::{FrameSink, SinkError};

/// Spawn the forwarder for one connection. A terminal sink failure is
/// stashed in the repository for the connection loop to surface; the task
/// itself ends quietly.
pub fn spawn(
    repo: Arc<ConnectionRepository>,
    connection_id: Uuid,
    sink: Arc<dyn FrameSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = run(&repo, connection_id, sink.as_ref()).await {
            warn!(%connection_id, %error, "forwarder terminated");
            repo.record_forward_failure(connection_id, error);
        }
        debug!(%connection_id, "forwarder finished");
    })
}

async fn run(
    repo: &ConnectionRepository,
    connection_id: Uuid,
    sink: &dyn FrameSink,
) -> Result<(), SinkError> {
    loop {
        // A dequeue error means forwarding was torn down under us: done.
        let item = match repo.dequeue_frame(connection_id).await {
            Ok(item) => item,
            Err(_) => return Ok(()),
        };
        sink.ingest(IngestFrame::from(&item)).await?;
        counter!("aperture_frames_forwarded_total", 1);
    }
}
