//! Per-connection mutable state.
//!
//! One record per live connection: capture state, the record-id dedupe set,
//! and the forwarding buffer with its background task. Records never
//! outlive their connection; every terminal path calls [`ConnectionRepository::clear`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use aperture_core::{CaptureError, CaptureState, ForwardItem};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::sink::SinkError;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("forwarding is not initialized for this connection")]
    ForwardNotInitialized,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Forward-buffer caps, set per deployment (not protocol constants).
#[derive(Debug, Clone, Copy)]
pub struct ForwardCaps {
    pub max_frames: usize,
    pub max_bytes: u64,
}

#[derive(Default)]
pub struct ConnectionRepository {
    connections: DashMap<Uuid, ConnectionRecord>,
}

#[derive(Default)]
struct ConnectionRecord {
    state: CaptureState,
    seen_records: HashSet<String>,
    forwarding: Option<Forwarding>,
}

struct Forwarding {
    buffer: Arc<ForwardBuffer>,
    task: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<SinkError>>>,
}

impl ConnectionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, connection_id: Uuid) -> CaptureState {
        self.connections
            .get(&connection_id)
            .map(|record| record.state.clone())
            .unwrap_or_default()
    }

    pub fn set_state(&self, connection_id: Uuid, state: CaptureState) {
        self.connections.entry(connection_id).or_default().state = state;
    }

    pub fn reset_state(&self, connection_id: Uuid) {
        self.set_state(connection_id, CaptureState::Idle);
    }

    /// Replay rejection: has this record id been seen on this connection?
    pub fn has_seen(&self, connection_id: Uuid, record_id: &str) -> bool {
        self.connections
            .get(&connection_id)
            .map(|record| record.seen_records.contains(record_id))
            .unwrap_or(false)
    }

    pub fn mark_seen(&self, connection_id: Uuid, record_id: &str) {
        self.connections
            .entry(connection_id)
            .or_default()
            .seen_records
            .insert(record_id.to_owned());
    }

    /// Allocate an empty bounded buffer for a freshly validated capture.
    /// Replaces any previous forwarding state for the connection.
    pub fn init_forwarding(&self, connection_id: Uuid, caps: ForwardCaps) {
        let mut record = self.connections.entry(connection_id).or_default();
        if let Some(previous) = record.forwarding.take() {
            previous.teardown();
        }
        record.forwarding = Some(Forwarding {
            buffer: Arc::new(ForwardBuffer::new(caps)),
            task: None,
            failure: Arc::new(Mutex::new(None)),
        });
    }

    /// Validate and enqueue an accepted frame. Never blocks: both caps are
    /// checked under one lock and a violation leaves the buffer unchanged.
    pub fn enqueue_frame(
        &self,
        connection_id: Uuid,
        item: ForwardItem,
    ) -> Result<(), RepositoryError> {
        item.validate()?;
        let buffer = self.buffer(connection_id)?;
        buffer.push(item)?;
        Ok(())
    }

    /// Wait for the next queued frame, removing it and decrementing the
    /// counters. Errors if forwarding is not (or no longer) initialized.
    pub async fn dequeue_frame(&self, connection_id: Uuid) -> Result<ForwardItem, RepositoryError> {
        // Clone the buffer handle out of the map; never await while holding
        // a DashMap guard.
        let buffer = self.buffer(connection_id)?;
        Ok(buffer.pop().await)
    }

    pub fn start_forwarding_task(&self, connection_id: Uuid, task: JoinHandle<()>) {
        if let Some(mut record) = self.connections.get_mut(&connection_id) {
            if let Some(forwarding) = record.forwarding.as_mut() {
                forwarding.task = Some(task);
                return;
            }
        }
        // No forwarding state to attach to: the capture raced a teardown.
        task.abort();
    }

    /// Stash a terminal forwarder failure for the connection loop to pick up.
    pub fn record_forward_failure(&self, connection_id: Uuid, error: SinkError) {
        if let Some(record) = self.connections.get(&connection_id) {
            if let Some(forwarding) = &record.forwarding {
                *forwarding.failure.lock() = Some(error);
            }
        }
    }

    /// Surface (and clear) a forwarder failure, if one happened.
    pub fn raise_if_forward_failed(&self, connection_id: Uuid) -> Result<(), RepositoryError> {
        let failed = self
            .connections
            .get(&connection_id)
            .and_then(|record| {
                record
                    .forwarding
                    .as_ref()
                    .map(|forwarding| forwarding.failure.lock().take())
            })
            .flatten();
        match failed {
            Some(_) => Err(CaptureError::ForwardFailed.into()),
            None => Ok(()),
        }
    }

    /// Current (frames, bytes) of the forward buffer; zeros when forwarding
    /// is not initialized.
    pub fn forward_stats(&self, connection_id: Uuid) -> (usize, u64) {
        self.connections
            .get(&connection_id)
            .and_then(|record| {
                record
                    .forwarding
                    .as_ref()
                    .map(|forwarding| forwarding.buffer.stats())
            })
            .unwrap_or((0, 0))
    }

    /// Cancel the forwarder, drain the queue and drop all forwarding state.
    /// Idempotent.
    pub fn stop_forwarding(&self, connection_id: Uuid) {
        let forwarding = self
            .connections
            .get_mut(&connection_id)
            .and_then(|mut record| record.forwarding.take());
        if let Some(forwarding) = forwarding {
            forwarding.teardown();
        }
    }

    /// Remove the whole connection record. Called on every terminal path.
    pub fn clear(&self, connection_id: Uuid) {
        if let Some((_, record)) = self.connections.remove(&connection_id) {
            if let Some(forwarding) = record.forwarding {
                forwarding.teardown();
            }
        }
    }

    fn buffer(&self, connection_id: Uuid) -> Result<Arc<ForwardBuffer>, RepositoryError> {
        self.connections
            .get(&connection_id)
            .and_then(|record| {
                record
                    .forwarding
                    .as_ref()
                    .map(|forwarding| Arc::clone(&forwarding.buffer))
            })
            .ok_or(RepositoryError::ForwardNotInitialized)
    }
}

impl Forwarding {
    fn teardown(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        self.buffer.drain();
    }
}

/// Bounded FIFO of accepted frames, capped independently by frame count and
/// total bytes. Producers fail fast; the single consumer suspends.
struct ForwardBuffer {
    caps: ForwardCaps,
    inner: Mutex<BufferInner>,
    notify: Notify,
}

#[derive(Default)]
struct BufferInner {
    queue: VecDeque<ForwardItem>,
    frames: usize,
    bytes: u64,
}

impl ForwardBuffer {
    fn new(caps: ForwardCaps) -> Self {
        Self {
            caps,
            inner: Mutex::new(BufferInner::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, item: ForwardItem) -> Result<(), CaptureError> {
        let byte_length = item.byte_length;
        {
            let mut inner = self.inner.lock();
            if inner.frames + 1 > self.caps.max_frames
                || inner.bytes + byte_length > self.caps.max_bytes
            {
                return Err(CaptureError::LimitForwardBufferExceeded);
            }
            inner.queue.push_back(item);
            inner.frames += 1;
            inner.bytes += byte_length;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> ForwardItem {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.queue.pop_front() {
                    inner.frames -= 1;
                    inner.bytes -= item.byte_length;
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.frames = 0;
        inner.bytes = 0;
    }

    fn stats(&self) -> (usize, u64) {
        let inner = self.inner.lock();
        (inner.frames, inner.bytes)
    }
}
