//! Synchronous publish/subscribe for connection and message events
//!
//! Handlers run on the emitting task, in subscription order, before
//! [`EventBus::emit`] returns. Nothing is buffered: a handler registered
//! after an event was emitted never sees it.
//!
//! ```rust,no_run
//! use chatlink_client::{EventBus, EventKind, ClientEvent};
//!
//! let bus = EventBus::new();
//! let id = bus.on(EventKind::StreamToken, |event| {
//!     if let ClientEvent::StreamToken { full_text, .. } = event {
//!         println!("{}", full_text);
//!     }
//! });
//! bus.off(EventKind::StreamToken, id);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use chatlink_common::{CloseInfo, ConnectionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    Connected,
    Disconnected,
    ConnectionEstablished,
    MessageAck,
    StreamStart,
    StreamToken,
    StreamEnd,
    StreamError,
    Error,
    Broadcast,
    /// Catch-all for frame types the client does not interpret
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChange => "state_change",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::MessageAck => "message_ack",
            EventKind::StreamStart => "stream_start",
            EventKind::StreamToken => "stream_token",
            EventKind::StreamEnd => "stream_end",
            EventKind::StreamError => "stream_error",
            EventKind::Error => "error",
            EventKind::Broadcast => "broadcast",
            EventKind::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    /// `error` frame sent by the service, verbatim
    Server(Value),
    /// Failure detected on the client side of the connection
    Client { message: String, recoverable: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChange(ConnectionInfo),
    Connected(ConnectionInfo),
    Disconnected(CloseInfo),
    ConnectionEstablished(Value),
    MessageAck(Value),
    StreamStart {
        message_id: String,
    },
    StreamToken {
        message_id: String,
        token: String,
        /// Everything received for this message so far
        full_text: String,
    },
    StreamEnd {
        message_id: String,
        full_response: String,
    },
    StreamError {
        message_id: String,
        error: Value,
    },
    Error(ErrorEvent),
    Broadcast(Value),
    Message {
        kind: String,
        payload: Value,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::StateChange(_) => EventKind::StateChange,
            ClientEvent::Connected(_) => EventKind::Connected,
            ClientEvent::Disconnected(_) => EventKind::Disconnected,
            ClientEvent::ConnectionEstablished(_) => EventKind::ConnectionEstablished,
            ClientEvent::MessageAck(_) => EventKind::MessageAck,
            ClientEvent::StreamStart { .. } => EventKind::StreamStart,
            ClientEvent::StreamToken { .. } => EventKind::StreamToken,
            ClientEvent::StreamEnd { .. } => EventKind::StreamEnd,
            ClientEvent::StreamError { .. } => EventKind::StreamError,
            ClientEvent::Error(_) => EventKind::Error,
            ClientEvent::Broadcast(_) => EventKind::Broadcast,
            ClientEvent::Message { .. } => EventKind::Message,
        }
    }
}

pub type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Returned by [`EventBus::on`]; pass it to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Subscriber {
    id: HandlerId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read();
        let counts: HashMap<&str, usize> = subscribers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.subscribe(kind, Arc::new(handler), false)
    }

    /// Like [`on`](Self::on), but the handler is removed after its first call.
    pub fn once(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        self.subscribe(kind, Arc::new(handler), true)
    }

    /// Returns `false` if no such handler was registered.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        before != list.len()
    }

    pub fn emit(&self, event: &ClientEvent) {
        // Snapshot first so handlers may call on/off without deadlocking.
        let snapshot = {
            let mut subscribers = self.subscribers.write();
            match subscribers.get_mut(&event.kind()) {
                Some(list) if !list.is_empty() => {
                    let snapshot = list.clone();
                    list.retain(|s| !s.once);
                    snapshot
                }
                _ => return,
            }
        };

        for subscriber in &snapshot {
            (subscriber.handler)(event);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }

    fn subscribe(&self, kind: EventKind, handler: Handler, once: bool) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, handler, once });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn broadcast(n: u64) -> ClientEvent {
        ClientEvent::Broadcast(json!({ "type": "broadcast", "n": n }))
    }

    #[test]
    fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::Broadcast, move |_| seen.lock().push(tag));
        }

        bus.emit(&broadcast(1));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_events_only_reach_their_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        bus.on(EventKind::StreamEnd, move |_| *counter.lock() += 1);

        bus.emit(&broadcast(1));
        assert_eq!(*hits.lock(), 0);

        bus.emit(&ClientEvent::StreamEnd {
            message_id: "m1".to_string(),
            full_response: "done".to_string(),
        });
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_off_removes_only_that_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen);
        let id = bus.on(EventKind::Broadcast, move |_| a.lock().push("a"));
        let b = Arc::clone(&seen);
        bus.on(EventKind::Broadcast, move |_| b.lock().push("b"));

        assert!(bus.off(EventKind::Broadcast, id));
        assert!(!bus.off(EventKind::Broadcast, id));
        assert!(!bus.off(EventKind::Error, id));

        bus.emit(&broadcast(1));
        assert_eq!(*seen.lock(), vec!["b"]);
        assert_eq!(bus.handler_count(EventKind::Broadcast), 1);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        bus.once(EventKind::Broadcast, move |_| *counter.lock() += 1);

        bus.emit(&broadcast(1));
        bus.emit(&broadcast(2));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(bus.handler_count(EventKind::Broadcast), 0);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.emit(&broadcast(1));

        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        bus.on(EventKind::Broadcast, move |_| *counter.lock() += 1);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_handler_can_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.on(EventKind::Broadcast, move |_| {
            inner.on(EventKind::Broadcast, |_| {});
        });

        bus.emit(&broadcast(1));
        assert_eq!(bus.handler_count(EventKind::Broadcast), 2);
    }
}
