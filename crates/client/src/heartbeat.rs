//! Liveness probing for an open connection

use std::future::pending;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MISSED: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Alive { missed: u32 },
    TimedOut { missed: u32 },
}

/// Counts probes sent without a `heartbeat_ack`.
///
/// The count goes up as soon as a probe is sent, not after a per-probe
/// deadline, so a slow acknowledgment still counts as missed until it lands.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    max_missed: u32,
    missed: u32,
    ticker: Option<Interval>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed,
            missed: 0,
            ticker: None,
        }
    }

    /// (Re)start probing with a fresh counter. The first tick is one full
    /// interval away.
    pub fn start(&mut self) {
        self.missed = 0;
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Resolves on the next probe tick; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => pending().await,
        }
    }

    /// Record that a probe was just sent.
    pub fn record_probe(&mut self) -> HeartbeatStatus {
        self.missed = self.missed.saturating_add(1);
        if self.missed > self.max_missed {
            HeartbeatStatus::TimedOut { missed: self.missed }
        } else {
            HeartbeatStatus::Alive { missed: self.missed }
        }
    }

    pub fn acknowledge(&mut self) {
        self.missed = 0;
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_MISSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_out_on_fourth_unanswered_probe() {
        let mut monitor = HeartbeatMonitor::default();
        let statuses: Vec<_> = (0..4).map(|_| monitor.record_probe()).collect();
        assert_eq!(statuses, vec![
            HeartbeatStatus::Alive { missed: 1 },
            HeartbeatStatus::Alive { missed: 2 },
            HeartbeatStatus::Alive { missed: 3 },
            HeartbeatStatus::TimedOut { missed: 4 },
        ]);
    }

    #[test]
    fn test_ack_resets_counter() {
        let mut monitor = HeartbeatMonitor::default();
        for _ in 0..3 {
            monitor.record_probe();
        }
        monitor.acknowledge();
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.record_probe(), HeartbeatStatus::Alive { missed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_and_stop_is_idempotent() {
        let mut monitor = HeartbeatMonitor::default();
        monitor.record_probe();
        monitor.record_probe();

        monitor.start();
        assert!(monitor.is_running());
        assert_eq!(monitor.missed(), 0);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5), DEFAULT_MAX_MISSED);
        monitor.start();

        let start = Instant::now();
        monitor.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        monitor.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_monitor_never_ticks() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(5), DEFAULT_MAX_MISSED);
        monitor.start();
        monitor.stop();

        let ticked = tokio::time::timeout(Duration::from_secs(60), monitor.tick()).await;
        assert!(ticked.is_err());
    }
}
