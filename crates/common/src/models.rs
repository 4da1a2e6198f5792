//! Connection models shared by the client and its subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normal closure, only sent by an explicit client disconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// No close frame was received (reserved, never sent on the wire).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Closed with a frame that carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Application code used when the heartbeat monitor gives up on the peer.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of the connection published with every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionState,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl ConnectionInfo {
    pub fn is_open(&self) -> bool {
        self.status == ConnectionState::Open
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_NORMAL, reason, true)
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason, false)
    }

    /// A close frame from the peer; only code 1000 counts as clean.
    pub fn from_peer(code: u16, reason: impl Into<String>) -> Self {
        Self::new(code, reason, code == CLOSE_NORMAL)
    }
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "{} (code {})", self.reason, self.code)
        }
    }
}
