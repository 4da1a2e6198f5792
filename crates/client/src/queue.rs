//! Bounded store-and-forward buffer for frames produced while offline

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::warn;

use chatlink_common::OutboundFrame;

use crate::error::{ClientError, Result};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFrame {
    /// Enqueue order, unique for the life of the queue
    pub seq: u64,
    pub frame: OutboundFrame,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO with a drop-newest overflow policy.
#[derive(Debug)]
pub struct MessageQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
            capacity,
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Append a frame, returning its sequence number. When the queue is full
    /// the new frame is dropped and `QueueOverflow` is returned.
    pub fn enqueue(&mut self, frame: OutboundFrame) -> Result<u64> {
        if self.frames.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                kind = frame.kind(),
                capacity = self.capacity,
                dropped = self.dropped,
                "Outbound queue full, dropping frame"
            );
            return Err(ClientError::QueueOverflow { capacity: self.capacity });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.frames.push_back(QueuedFrame {
            seq,
            frame,
            enqueued_at: Utc::now(),
        });
        Ok(seq)
    }

    /// Take every buffered frame in insertion order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<QueuedFrame> {
        self.frames.drain(..).collect()
    }

    /// Put frames that could not be sent back ahead of anything queued since,
    /// keeping their original order.
    pub fn requeue_front(&mut self, frames: Vec<QueuedFrame>) {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames rejected because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(n: usize) -> OutboundFrame {
        OutboundFrame::Message {
            content: format!("message {}", n),
            message_id: format!("m-{}", n),
            timestamp: Utc::now(),
        }
    }

    fn contents(frames: &[QueuedFrame]) -> Vec<String> {
        frames
            .iter()
            .map(|q| match &q.frame {
                OutboundFrame::Message { content, .. } => content.clone(),
                other => other.kind().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_drain_preserves_insertion_order() {
        let mut queue = MessageQueue::default();
        queue.enqueue(message(1)).unwrap();
        queue.enqueue(OutboundFrame::Typing { is_typing: true }).unwrap();
        queue.enqueue(message(2)).unwrap();

        let drained = queue.drain();
        assert_eq!(contents(&drained), vec!["message 1", "typing", "message 2"]);
        assert_eq!(drained.iter().map(|q| q.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_newest() {
        let mut queue = MessageQueue::new(100);
        let mut overflows = 0;
        for n in 1..=101 {
            if let Err(ClientError::QueueOverflow { capacity }) = queue.enqueue(message(n)) {
                assert_eq!(capacity, 100);
                overflows += 1;
            }
        }

        assert_eq!(queue.len(), 100);
        assert_eq!(overflows, 1);
        assert_eq!(queue.dropped_count(), 1);

        let drained = queue.drain();
        assert_eq!(contents(&drained).first().map(String::as_str), Some("message 1"));
        assert_eq!(contents(&drained).last().map(String::as_str), Some("message 100"));
    }

    #[test]
    fn test_requeue_front_keeps_order_ahead_of_new_frames() {
        let mut queue = MessageQueue::default();
        for n in 1..=3 {
            queue.enqueue(message(n)).unwrap();
        }

        let mut drained = queue.drain();
        let unsent = drained.split_off(1);
        queue.enqueue(message(4)).unwrap();
        queue.requeue_front(unsent);

        assert_eq!(
            contents(&queue.drain()),
            vec!["message 2", "message 3", "message 4"]
        );
    }

    #[test]
    fn test_zero_capacity_accepts_nothing() {
        let mut queue = MessageQueue::new(0);
        assert!(queue.enqueue(OutboundFrame::Heartbeat).is_err());
        assert!(queue.is_empty());
    }
}
