//! Session authority seam.
//!
//! The gateway's only authorization question is "is this session currently
//! active for this user"; everything else belongs to the authority service.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closed,
    Invalid,
}

#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn validate(&self, user_id: &str, session_id: &str) -> SessionStatus;
}

/// In-memory authority for development and tests.
#[derive(Default)]
pub struct StaticSessionAuthority {
    sessions: DashMap<String, SessionRecord>,
    /// Accept unknown sessions instead of rejecting them (dev mode).
    permissive: bool,
}

struct SessionRecord {
    user_id: String,
    closed: bool,
}

impl StaticSessionAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// An authority that treats every session as active. Used when the gate
    /// runs without a configured authority service.
    pub fn permissive() -> Self {
        Self {
            sessions: DashMap::new(),
            permissive: true,
        }
    }

    pub fn insert_active(&self, user_id: &str, session_id: &str) {
        self.sessions.insert(
            session_id.to_owned(),
            SessionRecord {
                user_id: user_id.to_owned(),
                closed: false,
            },
        );
    }

    pub fn close(&self, session_id: &str) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.closed = true;
        }
    }
}

#[async_trait]
impl SessionAuthority for StaticSessionAuthority {
    async fn validate(&self, user_id: &str, session_id: &str) -> SessionStatus {
        match self.sessions.get(session_id) {
            None => {
                if self.permissive {
                    SessionStatus::Active
                } else {
                    SessionStatus::Invalid
                }
            }
            Some(record) if record.user_id != user_id => SessionStatus::Invalid,
            Some(record) if record.closed => SessionStatus::Closed,
            Some(_) => SessionStatus::Active,
        }
    }
}

/// Authority backed by the session service's HTTP status endpoint.
pub struct HttpSessionAuthority {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionStatusResponse {
    status: String,
}

impl HttpSessionAuthority {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl SessionAuthority for HttpSessionAuthority {
    async fn validate(&self, user_id: &str, session_id: &str) -> SessionStatus {
        let url = format!("{}/sessions/{session_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("user_id", user_id)])
            .send()
            .await;

        // Transport or decode failures fail closed: the capture aborts
        // rather than running against an unverifiable session.
        let body = match response {
            Ok(response) if response.status().is_success() => {
                response.json::<SessionStatusResponse>().await
            }
            Ok(response) => {
                warn!(%session_id, status = %response.status(), "session authority rejected lookup");
                return SessionStatus::Invalid;
            }
            Err(err) => {
                warn!(%session_id, error = %err, "session authority unreachable");
                return SessionStatus::Invalid;
            }
        };

        match body {
            Ok(status) => match status.status.as_str() {
                "active" => SessionStatus::Active,
                "closed" => SessionStatus::Closed,
                _ => SessionStatus::Invalid,
            },
            Err(err) => {
                warn!(%session_id, error = %err, "session authority returned malformed status");
                SessionStatus::Invalid
            }
        }
    }
}
