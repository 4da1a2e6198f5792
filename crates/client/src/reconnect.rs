//! Exponential backoff scheduling for reconnection attempts

use std::future::pending;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// `min(base * 2^attempts, max)`, without jitter.
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[derive(Debug)]
pub struct Reconnector {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
    deadline: Option<Instant>,
}

impl Reconnector {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            attempts: 0,
            deadline: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&self) -> Duration {
        backoff_delay(self.base_delay, self.max_delay, self.attempts)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    /// Arm the one-shot timer for the next attempt and return its delay.
    pub fn schedule(&mut self) -> Duration {
        let delay = self.next_delay();
        self.deadline = Some(Instant::now() + delay);
        delay
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm the timer. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Resolves when the armed timer expires; never resolves while disarmed.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => pending().await,
        }
    }

    /// The timer fired: disarm it and count the attempt about to be made.
    pub fn fire(&mut self) -> u32 {
        self.deadline = None;
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Called once a connection is confirmed open.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.deadline = None;
    }
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut reconnector = Reconnector::default();
        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(reconnector.next_delay().as_millis());
            reconnector.fire();
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let delay = backoff_delay(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, 200);
        assert_eq!(delay, DEFAULT_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut reconnector = Reconnector::default();
        assert!(!reconnector.cancel());

        reconnector.schedule();
        assert!(reconnector.is_pending());
        assert!(reconnector.cancel());
        assert!(!reconnector.cancel());
        assert!(!reconnector.is_pending());
        assert_eq!(reconnector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_after_delay() {
        let mut reconnector = Reconnector::default();
        reconnector.fire();
        let start = Instant::now();
        let delay = reconnector.schedule();
        reconnector.wait().await;

        assert_eq!(delay, Duration::from_millis(2000));
        assert!(start.elapsed() >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let mut reconnector = Reconnector::default();
        reconnector.schedule();
        reconnector.cancel();

        let waited = tokio::time::timeout(Duration::from_secs(60), reconnector.wait()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_reset_and_exhaustion() {
        let mut reconnector = Reconnector::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, Some(2));
        assert!(!reconnector.is_exhausted());
        reconnector.fire();
        reconnector.fire();
        assert!(reconnector.is_exhausted());

        reconnector.reset();
        assert_eq!(reconnector.attempts(), 0);
        assert!(!reconnector.is_exhausted());
    }
}
