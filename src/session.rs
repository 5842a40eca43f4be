//! Session state
//!
//! A session moves through a fixed set of connection states. Transitions
//! outside the edge table are rejected so that late events (a reconnect
//! notification landing after the caller hung up, say) cannot resurrect a
//! finished session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::transcript::TranscriptLog;

/// Connection state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No connection attempt has been made yet
    Idle,
    /// Credential fetch and media negotiation in progress
    Connecting,
    /// Media and event channel established
    Connected,
    /// Transport dropped, recovery in progress
    Reconnecting,
    /// Terminal: setup or transport failed
    Error,
    /// Terminal: the session finished
    Ended,
}

impl ConnectionStatus {
    /// Whether `next` is a legal transition from this state.
    pub fn admits(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Ended)
                | (Connected, Reconnecting)
                | (Connected, Ended)
                | (Connected, Error)
                | (Reconnecting, Connected)
                | (Reconnecting, Error)
                | (Reconnecting, Ended)
        )
    }

    /// States in which a new `start()` call must be refused.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Reconnecting
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Error | ConnectionStatus::Ended)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Ended => "ended",
        };
        write!(f, "{}", name)
    }
}

/// One voice session: identity, connection state, and accumulated transcript.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub transcript: TranscriptLog,
    /// Relay room name, set once the credential arrives (room strategy only)
    pub room: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            status: ConnectionStatus::Idle,
            transcript: TranscriptLog::new(),
            room: None,
        }
    }

    /// Wall-clock seconds since the session started.
    pub fn duration_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
