//! chatlink client
//!
//! Resilient WebSocket transport for a single chat session: outbound frames
//! are queued while the connection is down, liveness is probed with
//! heartbeats, dropped connections are re-established with exponential
//! backoff, and streamed replies are reassembled token by token. Everything
//! the connection observes is published on an [`EventBus`].

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod queue;
pub mod reconnect;
pub mod stream;

pub use config::ClientConfig;
pub use connection::ConnectionManager;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, ErrorEvent, EventBus, EventKind, HandlerId};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus};
pub use queue::{MessageQueue, QueuedFrame};
pub use reconnect::{backoff_delay, Reconnector};
pub use stream::{StreamAggregator, StreamBuffer};

pub use chatlink_common::{CloseInfo, ConnectionInfo, ConnectionState};
