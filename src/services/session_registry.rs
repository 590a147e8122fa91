use actix::prelude::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DuplicateSessionPolicy;

/// Asks a live session to close its connection
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct CloseConnection {
    pub reason: String,
}

#[derive(Clone)]
struct SessionEntry {
    connection_id: Uuid,
    closer: Recipient<CloseConnection>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub device_sn: String,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No other live session held the identity
    Claimed,
    /// Another session held it; this one now owns the entry
    Replaced { previous: Uuid },
    /// Another session holds it and keeps it
    Rejected { holder: Uuid },
}

/// Process-wide map from device serial number to its live session
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `connection_id` as the live session for `device_sn`, applying the duplicate policy.
    pub fn claim(
        &self,
        device_sn: &str,
        connection_id: Uuid,
        closer: Recipient<CloseConnection>,
        policy: DuplicateSessionPolicy,
    ) -> ClaimOutcome {
        let now = Utc::now();
        let fresh = SessionEntry {
            connection_id,
            closer,
            connected_at: now,
            last_seen: now,
        };

        let mut slot = self.sessions.entry(device_sn.to_string()).or_insert_with(|| fresh.clone());
        if slot.connection_id == connection_id {
            info!(device_sn = %device_sn, connection_id = %connection_id, "Terminal session registered");
            return ClaimOutcome::Claimed;
        }

        let previous = slot.connection_id;
        match policy {
            DuplicateSessionPolicy::Reject => {
                warn!(
                    device_sn = %device_sn,
                    connection_id = %connection_id,
                    holder = %previous,
                    "Duplicate terminal session rejected"
                );
                ClaimOutcome::Rejected { holder: previous }
            }
            DuplicateSessionPolicy::Evict => {
                slot.closer.do_send(CloseConnection {
                    reason: format!("superseded by connection {}", connection_id),
                });
                *slot = fresh;
                warn!(
                    device_sn = %device_sn,
                    connection_id = %connection_id,
                    previous = %previous,
                    "Older terminal session evicted"
                );
                ClaimOutcome::Replaced { previous }
            }
            DuplicateSessionPolicy::Allow => {
                *slot = fresh;
                warn!(
                    device_sn = %device_sn,
                    connection_id = %connection_id,
                    previous = %previous,
                    "Second live session for terminal; both stay connected"
                );
                ClaimOutcome::Replaced { previous }
            }
        }
    }

    /// Removes the entry if `connection_id` still owns it.
    pub fn release(&self, device_sn: &str, connection_id: Uuid) {
        if self
            .sessions
            .remove_if(device_sn, |_, entry| entry.connection_id == connection_id)
            .is_some()
        {
            info!(device_sn = %device_sn, connection_id = %connection_id, "Terminal session released");
        } else {
            debug!(device_sn = %device_sn, connection_id = %connection_id, "Session no longer owned the registry entry");
        }
    }

    pub fn touch(&self, device_sn: &str, connection_id: Uuid) {
        if let Some(mut entry) = self.sessions.get_mut(device_sn) {
            if entry.connection_id == connection_id {
                entry.last_seen = Utc::now();
            }
        }
    }

    pub fn is_connected(&self, device_sn: &str) -> bool {
        self.sessions.contains_key(device_sn)
    }

    pub fn owner(&self, device_sn: &str) -> Option<Uuid> {
        self.sessions.get(device_sn).map(|entry| entry.connection_id)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                device_sn: entry.key().clone(),
                connection_id: entry.connection_id,
                connected_at: entry.connected_at,
                last_seen: entry.last_seen,
            })
            .collect();
        sessions.sort_by(|a, b| a.device_sn.cmp(&b.device_sn));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
