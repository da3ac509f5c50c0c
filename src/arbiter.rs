//! Decides when the bridge may transmit on the shared line.

use log::*;
use std::fmt;
use std::time::{Duration, Instant};

/// Who currently owns the line, as far as we can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Nothing heard yet.
    Init,
    /// The foreign master is active.
    Slave { since: Instant },
    /// The line is idle and ours.
    Master { since: Instant },
}

impl BusState {
    /// When the current state was entered.
    pub fn since(&self) -> Option<Instant> {
        match self {
            BusState::Init => None,
            BusState::Slave { since } | BusState::Master { since } => Some(*since),
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusState::Init => write!(f, "INIT"),
            BusState::Slave { .. } => write!(f, "SLAVE"),
            BusState::Master { .. } => write!(f, "MASTER"),
        }
    }
}

/// Bus-sharing state machine.
///
/// We only transmit after hearing the foreign master at least once and then
/// observing a quiet period, so a cold start never collides with a transfer
/// already in progress.
#[derive(Debug, Clone)]
pub struct BusArbiter {
    state: BusState,
    quiescence: Duration,
}

impl BusArbiter {
    pub fn new(quiescence: Duration) -> Self {
        Self {
            state: BusState::Init,
            quiescence,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// Feeds the outcome of one receive period.
    ///
    /// Returns `true` exactly when the line has just been handed to us; the
    /// caller then runs one master turn.
    pub fn observe(&mut self, frame_seen: bool, now: Instant) -> bool {
        match self.state {
            BusState::Slave { .. } if frame_seen => false,
            _ if frame_seen => {
                self.enter(BusState::Slave { since: now });
                false
            }
            BusState::Slave { since } if now.saturating_duration_since(since) > self.quiescence => {
                self.enter(BusState::Master { since: now });
                true
            }
            BusState::Init | BusState::Slave { .. } | BusState::Master { .. } => false,
        }
    }

    fn enter(&mut self, state: BusState) {
        debug!("Bus state {} -> {}", self.state, state);
        self.state = state;
    }
}
