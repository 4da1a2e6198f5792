//! Client error taxonomy

use chatlink_common::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failed to open or closed abnormally
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Heartbeat timeout: {missed} probes unanswered")]
    HeartbeatTimeout { missed: u32 },
    #[error("Outbound queue full ({capacity} frames), frame dropped")]
    QueueOverflow { capacity: usize },
    #[error("Stream {message_id} failed: {error}")]
    Stream { message_id: String, error: String },
    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Connection task is not running")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl ClientError {
    /// Whether the reconnect loop can still recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::HeartbeatTimeout { .. }
        )
    }
}
