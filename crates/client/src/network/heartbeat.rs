//! Liveness tracking for an open connection.
//!
//! The transport can stay "open" long after the peer stopped answering. The
//! monitor records when anything last arrived and tells the connection task
//! when the silence has lasted longer than the reset interval.

use std::time::{Duration, Instant};

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Traffic arrived recently enough.
    Alive,
    /// Silent for too long; the connection must be reset.
    Reset,
    /// Still silent, but a reset was already requested for this connection.
    AlreadyReset,
}

/// Silence detector for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    reset_interval: Duration,
    last_activity: Instant,
    reset_fired: bool,
}

impl HeartbeatMonitor {
    pub fn new(ping_interval: Duration, reset_interval: Duration, now: Instant) -> Self {
        Self {
            ping_interval,
            reset_interval,
            last_activity: now,
            reset_fired: false,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn reset_interval(&self) -> Duration {
        self.reset_interval
    }

    /// Any inbound frame counts, control frames included.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn check(&mut self, now: Instant) -> HeartbeatVerdict {
        if self.silence(now) <= self.reset_interval {
            return HeartbeatVerdict::Alive;
        }
        if self.reset_fired {
            return HeartbeatVerdict::AlreadyReset;
        }
        self.reset_fired = true;
        HeartbeatVerdict::Reset
    }

    /// Fresh state for a newly opened connection.
    pub fn restart(&mut self, now: Instant) {
        self.last_activity = now;
        self.reset_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(10), Duration::from_secs(60), now)
    }

    #[test]
    fn test_alive_within_reset_interval() {
        let start = Instant::now();
        let mut hb = monitor(start);
        assert_eq!(hb.check(start + Duration::from_secs(59)), HeartbeatVerdict::Alive);
        assert_eq!(hb.check(start + Duration::from_secs(60)), HeartbeatVerdict::Alive);
    }

    #[test]
    fn test_reset_fires_once_per_stale_period() {
        let start = Instant::now();
        let mut hb = monitor(start);

        assert_eq!(hb.check(start + Duration::from_secs(61)), HeartbeatVerdict::Reset);
        assert_eq!(
            hb.check(start + Duration::from_secs(121)),
            HeartbeatVerdict::AlreadyReset
        );
        assert_eq!(
            hb.check(start + Duration::from_secs(500)),
            HeartbeatVerdict::AlreadyReset
        );
    }

    #[test]
    fn test_activity_postpones_reset() {
        let start = Instant::now();
        let mut hb = monitor(start);

        hb.record_activity(start + Duration::from_secs(50));
        assert_eq!(hb.check(start + Duration::from_secs(100)), HeartbeatVerdict::Alive);
        assert_eq!(hb.silence(start + Duration::from_secs(100)), Duration::from_secs(50));
    }

    #[test]
    fn test_restart_rearms_latch() {
        let start = Instant::now();
        let mut hb = monitor(start);
        assert_eq!(hb.check(start + Duration::from_secs(61)), HeartbeatVerdict::Reset);

        let reopened = start + Duration::from_secs(70);
        hb.restart(reopened);
        assert_eq!(hb.check(reopened + Duration::from_secs(1)), HeartbeatVerdict::Alive);
        assert_eq!(
            hb.check(reopened + Duration::from_secs(61)),
            HeartbeatVerdict::Reset
        );
    }

    #[test]
    fn test_silence_never_negative() {
        let start = Instant::now();
        let hb = monitor(start + Duration::from_secs(5));
        assert_eq!(hb.silence(start), Duration::ZERO);
    }
}
