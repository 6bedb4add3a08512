//! Continuity counter and PCR drift tracking per elementary stream.

use std::time::{Duration, Instant};

/// PCR clock frequency of the 33-bit base.
pub const PCR_HZ: u64 = 90_000;
/// Largest tolerated divergence between wall clock and PCR progress, in
/// 90 kHz ticks.
pub const PCR_DRIFT_TOLERANCE: i64 = 90_000;
/// Failed samples tolerated before a timing error is reported.
pub const PCR_MAX_FAILURES: u32 = 10;
/// PCR samples arriving further apart than this count as failures.
pub const PCR_MAX_INTERVAL: Duration = Duration::from_secs(1);

const PCR_WRAP: u64 = 1 << 33;

/// 4-bit continuity counter tracking.
#[derive(Debug, Clone, Default)]
pub struct ContinuityTracker {
    last: Option<u8>,
    errors: u64,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one packet. Returns false when the counter did not follow on
    /// from the previous payload-carrying packet.
    pub fn check(&mut self, cc: u8, has_payload: bool, discontinuity: bool) -> bool {
        if discontinuity {
            self.last = has_payload.then_some(cc);
            return true;
        }
        if !has_payload {
            return true;
        }
        let ok = match self.last {
            Some(prev) => cc == (prev + 1) & 0x0F,
            None => true,
        };
        if !ok {
            self.errors += 1;
        }
        self.last = Some(cc);
        ok
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Outcome of feeding one PCR sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcrSample {
    /// First sample after a reset; only establishes the baseline.
    Baseline,
    Ok,
    /// Divergence or interval exceeded, still within the failure budget.
    Failed,
    /// Failure budget exhausted; the baseline was reset.
    TimingError,
}

/// Tracks divergence between wall-clock arrival and PCR progress.
#[derive(Debug, Clone, Default)]
pub struct PcrTracker {
    last: Option<(Instant, u64)>,
    drift: i64,
    failures: u32,
    timing_errors: u64,
}

impl PcrTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a PCR base (90 kHz) that arrived at `now`.
    pub fn sample(&mut self, now: Instant, pcr: u64) -> PcrSample {
        let (last_wall, last_pcr) = match self.last {
            Some(prev) => prev,
            None => {
                self.last = Some((now, pcr));
                return PcrSample::Baseline;
            }
        };

        let elapsed_wall = now.saturating_duration_since(last_wall);
        let wall_ticks = (elapsed_wall.as_micros() as u64 * PCR_HZ / 1_000_000) as i64;
        let pcr_ticks = ((pcr + PCR_WRAP - last_pcr) % PCR_WRAP) as i64;
        let divergence = pcr_ticks - wall_ticks;
        self.drift += divergence;
        self.last = Some((now, pcr));

        if divergence.abs() <= PCR_DRIFT_TOLERANCE && elapsed_wall <= PCR_MAX_INTERVAL {
            return PcrSample::Ok;
        }

        self.failures += 1;
        if self.failures > PCR_MAX_FAILURES {
            self.timing_errors += 1;
            self.reset();
            return PcrSample::TimingError;
        }
        PcrSample::Failed
    }

    /// Accumulated divergence since the last reset, in 90 kHz ticks.
    pub fn drift(&self) -> i64 {
        self.drift
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn timing_errors(&self) -> u64 {
        self.timing_errors
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.drift = 0;
        self.failures = 0;
    }
}
