//! Rolling statistics and rate-limited logging helpers.
//!
//! `AvgStat` keeps a sliding window of samples and reports averages and
//! rates over it. `LogLimiter` throttles noisy data-plane warnings so a
//! broken stream does not flood the log.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window statistic over timestamped samples.
#[derive(Debug, Clone)]
pub struct AvgStat {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_sum: u64,
    total: u64,
}

impl AvgStat {
    /// Create a statistic averaging over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_sum: 0,
            total: 0,
        }
    }

    /// Add a sample taken now.
    pub fn add(&mut self, value: u64) {
        self.add_at(Instant::now(), value);
    }

    /// Add a sample taken at `now`.
    pub fn add_at(&mut self, now: Instant, value: u64) {
        self.samples.push_back((now, value));
        self.window_sum += value;
        self.total += value;
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        let cutoff = match now.checked_sub(self.window) {
            Some(c) => c,
            None => return,
        };
        while let Some(&(t, v)) = self.samples.front() {
            if t >= cutoff {
                break;
            }
            self.window_sum -= v;
            self.samples.pop_front();
        }
    }

    /// Sum of the samples within the window ending at `now`, per second.
    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.trim(now);
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.window_sum as f64 / secs
    }

    /// Rate per second over the window ending now.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    /// Mean sample value within the window.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.window_sum as f64 / self.samples.len() as f64
    }

    /// Sum of all samples ever added.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.window_sum = 0;
        self.total = 0;
    }
}

/// Rate limiter for repetitive log messages.
///
/// `allow` returns `Some(suppressed)` when a message may be emitted, where
/// `suppressed` is how many events were swallowed since the last one.
#[derive(Debug, Clone)]
pub struct LogLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
    events: u64,
}

impl LogLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
            events: 0,
        }
    }

    pub fn allow(&mut self) -> Option<u64> {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> Option<u64> {
        self.events += 1;
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }

    /// Total events seen, logged or not.
    pub fn events(&self) -> u64 {
        self.events
    }
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avgstat_window() {
        let start = Instant::now();
        let mut stat = AvgStat::new(Duration::from_secs(2));
        stat.add_at(start, 100);
        stat.add_at(start + Duration::from_secs(1), 300);
        assert_eq!(stat.rate_at(start + Duration::from_secs(1)), 200.0);
        assert_eq!(stat.average(), 200.0);

        // First sample falls out of the window.
        assert_eq!(stat.rate_at(start + Duration::from_millis(2500)), 150.0);
        assert_eq!(stat.total(), 400);
    }

    #[test]
    fn test_log_limiter_counts_suppressed() {
        let start = Instant::now();
        let mut limiter = LogLimiter::new(Duration::from_secs(5));
        assert_eq!(limiter.allow_at(start), Some(0));
        assert_eq!(limiter.allow_at(start + Duration::from_secs(1)), None);
        assert_eq!(limiter.allow_at(start + Duration::from_secs(2)), None);
        assert_eq!(limiter.allow_at(start + Duration::from_secs(6)), Some(2));
        assert_eq!(limiter.events(), 4);
    }
}
