//! Per-credential connection state machine.
//!
//! ```text
//! Requested ─▶ Generated ─▶ Verified ─▶ Connected ─▶ Disconnected
//!     │            │           │  ▲          │             │
//!     └──▶ Denied ◀┴───────────┘  └──────────┴─────────────┘ (reconnect)
//!                  Revoked ◀── any state before Connected
//! ```
//!
//! `Denied` ends one attempt; a later Verify starts a new one. `Revoked` is
//! absorbing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// State of a credential's connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Generate requested, nothing minted yet.
    Requested,
    /// Credential minted.
    Generated,
    /// A node verified the credential.
    Verified,
    /// Client connected and rules were handed out.
    Connected,
    /// Client disconnected.
    Disconnected,
    /// Last attempt was denied.
    Denied,
    /// Credential revoked.
    Revoked,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        use ConnectionState::{
            Connected, Denied, Disconnected, Generated, Requested, Revoked, Verified,
        };
        matches!(
            (self, next),
            (Requested, Generated | Denied)
                | (Generated | Verified | Disconnected | Denied, Verified | Denied | Revoked)
                | (Verified, Connected)
                | (Connected, Disconnected | Verified | Denied)
        )
    }
}

/// Session record for one generated config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Config id.
    pub config_id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Certificate subject (user email).
    pub subject: String,
    /// Bound node.
    pub node_id: String,
    /// Current state.
    pub state: ConnectionState,
    /// Time of the last state change.
    pub updated_at: DateTime<Utc>,
    /// Start of the current connection.
    pub connected_at: Option<DateTime<Utc>>,
    /// Client address of the current or last connection.
    pub client_ip: Option<String>,
    /// Completed connections.
    pub connections: u32,
    /// Cumulative bytes received from the client.
    pub bytes_received: u64,
    /// Cumulative bytes sent to the client.
    pub bytes_sent: u64,
    /// Cumulative connected time.
    pub connected_secs: u64,
}

/// Usage counters reported at Disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Bytes received from the client.
    pub bytes_received: u64,
    /// Bytes sent to the client.
    pub bytes_sent: u64,
    /// Session length.
    pub duration_secs: u64,
}

/// Session records keyed by config id. No global lock: each credential's
/// record is updated under its own shard entry.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly generated credential.
    pub fn open(&self, config_id: Uuid, user_id: &str, subject: &str, node_id: &str) {
        let now = Utc::now();
        self.sessions.insert(
            config_id,
            Session {
                config_id,
                user_id: user_id.to_string(),
                subject: subject.to_string(),
                node_id: node_id.to_string(),
                state: ConnectionState::Generated,
                updated_at: now,
                connected_at: None,
                client_ip: None,
                connections: 0,
                bytes_received: 0,
                bytes_sent: 0,
                connected_secs: 0,
            },
        );
    }

    /// Current state of a credential's session.
    #[must_use]
    pub fn state(&self, config_id: Uuid) -> Option<ConnectionState> {
        self.sessions.get(&config_id).map(|s| s.state)
    }

    /// Snapshot of a session.
    #[must_use]
    pub fn get(&self, config_id: Uuid) -> Option<Session> {
        self.sessions.get(&config_id).map(|s| s.clone())
    }

    /// Move a session to `next`. Returns `false` (and leaves the record
    /// unchanged) for unknown sessions and illegal transitions.
    pub fn advance(&self, config_id: Uuid, next: ConnectionState) -> bool {
        let Some(mut session) = self.sessions.get_mut(&config_id) else {
            return false;
        };
        if !session.state.can_transition(next) {
            warn!(
                config_id = %config_id,
                from = ?session.state,
                to = ?next,
                "Rejected illegal session transition"
            );
            return false;
        }
        debug!(config_id = %config_id, from = ?session.state, to = ?next, "Session transition");
        session.state = next;
        session.updated_at = Utc::now();
        true
    }

    /// Verified → Connected, remembering the client address.
    pub fn connect(&self, config_id: Uuid, client_ip: Option<&str>) -> bool {
        if !self.advance(config_id, ConnectionState::Connected) {
            return false;
        }
        if let Some(mut session) = self.sessions.get_mut(&config_id) {
            let at = session.updated_at;
            session.connected_at = Some(at);
            session.client_ip = client_ip.map(str::to_string);
        }
        true
    }

    /// Connected → Disconnected, accumulating usage.
    pub fn disconnect(&self, config_id: Uuid, usage: Usage) -> bool {
        if !self.advance(config_id, ConnectionState::Disconnected) {
            return false;
        }
        if let Some(mut session) = self.sessions.get_mut(&config_id) {
            session.connected_at = None;
            session.connections = session.connections.saturating_add(1);
            session.bytes_received = session.bytes_received.saturating_add(usage.bytes_received);
            session.bytes_sent = session.bytes_sent.saturating_add(usage.bytes_sent);
            session.connected_secs = session.connected_secs.saturating_add(usage.duration_secs);
        }
        true
    }

    /// The connected session of `subject` on `node_id`, most recent first.
    #[must_use]
    pub fn find_connected(&self, node_id: &str, subject: &str) -> Option<Uuid> {
        self.sessions
            .iter()
            .filter(|s| {
                s.state == ConnectionState::Connected
                    && s.node_id == node_id
                    && s.subject.eq_ignore_ascii_case(subject)
            })
            .max_by_key(|s| s.connected_at)
            .map(|s| s.config_id)
    }

    /// Forget sessions that are not connected and have not changed since
    /// `cutoff`. Returns how many were dropped.
    pub fn prune_idle(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.state == ConnectionState::Connected || s.updated_at >= cutoff);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
