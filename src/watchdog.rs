//! Freshness of the published register image.

use log::*;
use std::time::{Duration, Instant};

/// How long published values stay valid after a missed refresh.
pub const VALIDITY: Duration = Duration::from_secs(30);
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
pub const MIN_PERIOD: Duration = Duration::from_secs(10);
/// A refresh is started this long before the period runs out.
const REFRESH_MARGIN: Duration = Duration::from_secs(5);

/// Tracks the last completed read cycle.
///
/// When no cycle completes within `period + VALIDITY`, the caller is expected
/// to invalidate everything it published and reopen the line.
#[derive(Debug, Clone)]
pub struct SynchroWatchdog {
    period: Duration,
    last_success: Instant,
}

impl SynchroWatchdog {
    pub fn new(period: Duration, now: Instant) -> Self {
        let period = if period < MIN_PERIOD {
            warn!("Refresh period {period:?} is below {MIN_PERIOD:?}. Using minimum.");
            MIN_PERIOD
        } else {
            period
        };
        Self {
            period,
            last_success: now,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn last_success(&self) -> Instant {
        self.last_success
    }

    pub fn record_success(&mut self, now: Instant) {
        self.last_success = now;
    }

    /// The periodic refresh should run in the next master window.
    pub fn refresh_due(&self, now: Instant) -> bool {
        self.elapsed(now) > self.period.saturating_sub(REFRESH_MARGIN)
    }

    /// Returns `true` once per violation of the validity window and restarts
    /// the window.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.elapsed(now) > self.period + VALIDITY {
            warn!("Synchro timeout after {:?}", self.elapsed(now));
            self.last_success = now;
            true
        } else {
            false
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_success)
    }
}
