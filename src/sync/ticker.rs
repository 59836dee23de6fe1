//! Host-driven periodic scheduling
//!
//! The core owns no timers. A host calls [`Ticker::due`] from whatever loop
//! it already runs (an interval task, a UI frame, a test) and acts when it
//! returns true.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True on the first call and then once per elapsed interval
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Time until the next tick is due
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Make the next call to [`Ticker::due`] fire immediately
    pub fn trigger(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_interval() {
        let mut ticker = Ticker::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(ticker.due(t0));
        assert!(!ticker.due(t0 + Duration::from_secs(3)));
        assert_eq!(ticker.remaining(t0 + Duration::from_secs(3)), Duration::from_secs(7));
        assert!(ticker.due(t0 + Duration::from_secs(10)));
        assert!(!ticker.due(t0 + Duration::from_secs(15)));
    }

    #[test]
    fn test_trigger() {
        let mut ticker = Ticker::new(Duration::from_secs(10));
        let t0 = Instant::now();
        ticker.due(t0);
        ticker.trigger();
        assert_eq!(ticker.remaining(t0), Duration::ZERO);
        assert!(ticker.due(t0 + Duration::from_millis(1)));
    }
}
