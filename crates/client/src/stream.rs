//! Reassembly of token-by-token streamed responses

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::events::ClientEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pub message_id: String,
    pub accumulated_text: String,
}

impl StreamBuffer {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            accumulated_text: String::new(),
        }
    }
}

/// In-flight streams keyed by the service-assigned message id. Each method
/// returns the event to publish.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    buffers: HashMap<String, StreamBuffer>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repeated start for the same id replaces the buffer.
    pub fn start(&mut self, message_id: String) -> ClientEvent {
        if self
            .buffers
            .insert(message_id.clone(), StreamBuffer::new(&message_id))
            .is_some()
        {
            debug!(%message_id, "Stream restarted, discarding partial text");
        }
        ClientEvent::StreamStart { message_id }
    }

    /// A token for an unknown id starts the stream implicitly.
    pub fn token(&mut self, message_id: String, token: String) -> ClientEvent {
        let buffer = self
            .buffers
            .entry(message_id.clone())
            .or_insert_with(|| {
                debug!(%message_id, "Token without stream_start, starting stream");
                StreamBuffer::new(&message_id)
            });
        buffer.accumulated_text.push_str(&token);

        ClientEvent::StreamToken {
            full_text: buffer.accumulated_text.clone(),
            message_id,
            token,
        }
    }

    /// The service's `full_response` wins over the local concatenation; the
    /// local text is only used when the service sent none.
    pub fn end(&mut self, message_id: String, full_response: Option<String>) -> ClientEvent {
        let local = self.buffers.remove(&message_id).map(|b| b.accumulated_text);
        let full_response = match (full_response, local) {
            (Some(declared), Some(local)) => {
                if declared != local {
                    debug!(
                        %message_id,
                        local_len = local.len(),
                        declared_len = declared.len(),
                        "Final text differs from streamed tokens"
                    );
                }
                declared
            }
            (Some(declared), None) => declared,
            (None, local) => local.unwrap_or_default(),
        };

        ClientEvent::StreamEnd { message_id, full_response }
    }

    pub fn fail(&mut self, message_id: String, error: Value) -> ClientEvent {
        self.buffers.remove(&message_id);
        ClientEvent::StreamError { message_id, error }
    }

    pub fn buffer(&self, message_id: &str) -> Option<&StreamBuffer> {
        self.buffers.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop every unfinished stream, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.buffers.len();
        self.buffers.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_text(event: &ClientEvent) -> &str {
        match event {
            ClientEvent::StreamToken { full_text, .. } => full_text,
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_server_final_text_wins() {
        let mut streams = StreamAggregator::new();
        assert_eq!(
            streams.start("m1".to_string()),
            ClientEvent::StreamStart { message_id: "m1".to_string() }
        );

        let first = streams.token("m1".to_string(), "Hel".to_string());
        let second = streams.token("m1".to_string(), "lo".to_string());
        assert_eq!(full_text(&first), "Hel");
        assert_eq!(full_text(&second), "Hello");

        let end = streams.end("m1".to_string(), Some("Hello!".to_string()));
        assert_eq!(end, ClientEvent::StreamEnd {
            message_id: "m1".to_string(),
            full_response: "Hello!".to_string(),
        });
        assert!(streams.buffer("m1").is_none());
    }

    #[test]
    fn test_token_without_start_starts_stream() {
        let mut streams = StreamAggregator::new();
        let event = streams.token("m2".to_string(), "Hi".to_string());

        assert_eq!(event, ClientEvent::StreamToken {
            message_id: "m2".to_string(),
            token: "Hi".to_string(),
            full_text: "Hi".to_string(),
        });
        assert_eq!(streams.buffer("m2").map(|b| b.accumulated_text.as_str()), Some("Hi"));
    }

    #[test]
    fn test_restart_replaces_buffer() {
        let mut streams = StreamAggregator::new();
        streams.start("m1".to_string());
        streams.token("m1".to_string(), "stale".to_string());
        streams.start("m1".to_string());

        let event = streams.token("m1".to_string(), "fresh".to_string());
        assert_eq!(full_text(&event), "fresh");
        assert_eq!(streams.len(), 1);
    }

    #[test]
    fn test_error_discards_buffer() {
        let mut streams = StreamAggregator::new();
        streams.start("m1".to_string());
        streams.token("m1".to_string(), "partial".to_string());

        let event = streams.fail("m1".to_string(), json!("model overloaded"));
        assert_eq!(event, ClientEvent::StreamError {
            message_id: "m1".to_string(),
            error: json!("model overloaded"),
        });
        assert!(streams.is_empty());
    }

    #[test]
    fn test_end_without_declared_text_uses_tokens() {
        let mut streams = StreamAggregator::new();
        streams.token("m1".to_string(), "abc".to_string());
        let event = streams.end("m1".to_string(), None);
        assert_eq!(event, ClientEvent::StreamEnd {
            message_id: "m1".to_string(),
            full_response: "abc".to_string(),
        });
    }

    #[test]
    fn test_streams_are_independent() {
        let mut streams = StreamAggregator::new();
        streams.start("a".to_string());
        streams.start("b".to_string());
        streams.token("a".to_string(), "1".to_string());
        let b = streams.token("b".to_string(), "2".to_string());
        assert_eq!(full_text(&b), "2");
        assert_eq!(streams.clear(), 2);
    }
}
