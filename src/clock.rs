//! Time source of the worker.
//!
//! Arbitration and the watchdog only ever ask a [`Clock`] for the time, so
//! tests can drive them with a manual clock instead of waiting for real
//! seconds to pass.

use std::time::{Duration, Instant};

pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant::now`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
