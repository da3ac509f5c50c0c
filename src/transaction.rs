//! Blocking register exchanges with the regulator.
//!
//! A [`Master`] owns the line. Failed transactions are never retried here:
//! they are logged and reported as `None`/`false` so the caller can try again
//! in the next master window.

use crate::clock::Clock;
use crate::error::Result;
use crate::frame::{self, FrameError};
use crate::protocol::{Register, ZoneMode};
use crate::transport::Transport;
use log::*;
use std::collections::BTreeMap;
use std::time::Duration;

/// Timeouts and pauses of the bus-sharing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Timings {
    /// Silence that ends line cleaning.
    pub idle_clean: Duration,
    /// Receive timeout while passively listening.
    pub listen: Duration,
    /// Receive timeout for the answer to one of our requests.
    pub transaction: Duration,
    /// Budget for draining queued writes in one master window.
    pub write_budget: Duration,
    /// Pause inside the mode-update sequence.
    pub mode_pause: Duration,
    /// Silence after entering slave state before the line is considered free.
    pub quiescence: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            idle_clean: Duration::from_millis(100),
            listen: Duration::from_millis(500),
            transaction: Duration::from_millis(2500),
            write_budget: Duration::from_secs(2),
            mode_pause: Duration::from_millis(500),
            quiescence: Duration::from_secs(5),
        }
    }
}

/// Issues our own requests on the shared line.
pub struct Master<T> {
    line: T,
    slave: u8,
    timings: Timings,
    receive_failing: bool,
}

impl<T: Transport> Master<T> {
    pub fn new(line: T, slave: u8, timings: Timings) -> Self {
        Self {
            line,
            slave,
            timings,
            receive_failing: false,
        }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn line(&self) -> &T {
        &self.line
    }

    /// Drops whatever is left in the receive buffer.
    pub fn clean(&mut self) -> Result<()> {
        self.line.clean(self.timings.idle_clean)?;
        Ok(())
    }

    /// Reopens the line. A failure here is not recoverable by the worker.
    pub fn reconnect(&mut self) -> Result<()> {
        self.line.reconnect()?;
        self.clean()
    }

    /// Listens for foreign traffic for one receive period.
    ///
    /// Returns the raw bytes heard, empty when the line stayed silent or the
    /// receive failed. A failed receive still takes the whole period.
    /// Decoded requests are only logged, never answered.
    pub fn listen(&mut self, clock: &dyn Clock) -> Vec<u8> {
        let started = clock.now();
        let data = match self.line.receive(self.timings.listen) {
            Ok(data) => data,
            Err(error) => {
                if !self.receive_failing {
                    warn!("Receive failed: {error}");
                    self.receive_failing = true;
                }
                let elapsed = clock.now().saturating_duration_since(started);
                clock.sleep(self.timings.listen.saturating_sub(elapsed));
                return Vec::new();
            }
        };
        if self.receive_failing {
            info!("Receive recovered");
            self.receive_failing = false;
        }
        if data.is_empty() {
            return data;
        }
        debug!("Frame received hex: {:02X?} len: {}", data, data.len());
        match frame::parse_slave_request(&data) {
            Ok(request) => debug!("Foreign request: {request}"),
            Err(error @ FrameError::RegisterCount { .. }) => trace!("Dropped frame: {error}"),
            Err(error) => warn!("Received frame error: {error}"),
        }
        data
    }

    /// Reads `count` registers starting at `start`.
    pub fn read_registers(&mut self, start: u16, count: u16) -> Option<BTreeMap<u16, u16>> {
        let request = frame::build_read_request(self.slave, start, count);
        debug!("Send read request: {:02X?}", request);
        let answer = self.exchange(&request)?;
        debug!("Answer received: {:02X?}", answer);
        match frame::parse_answer(
            &answer,
            self.slave,
            frame::READ_HOLDING_REGISTERS,
            start,
            count,
        ) {
            Ok(values) => Some(values),
            Err(error) => {
                warn!("Invalid answer to read of {count} register(s) at {start}: {error}");
                None
            }
        }
    }

    pub fn read_register(&mut self, register: Register) -> Option<u16> {
        self.read_registers(register.address(), 1)?
            .get(&register.address())
            .copied()
    }

    /// Writes `values` starting at `start` and waits for the acknowledgement.
    pub fn write_registers(&mut self, start: u16, values: &[u16]) -> bool {
        let request = match frame::build_write_request(self.slave, start, values) {
            Ok(request) => request,
            Err(error) => {
                warn!("Cannot build write request at {start}: {error}");
                return false;
            }
        };
        info!("Send write request: {:02X?}", request);
        let Some(answer) = self.exchange(&request) else {
            return false;
        };
        debug!("Ack received: {:02X?}", answer);
        let expected = frame::build_write_ack(self.slave, start, values.len() as u16);
        if answer.starts_with(&expected) {
            info!("Ack OK");
            true
        } else {
            warn!("Ack KO. Expected ack was: {:02X?}", expected);
            false
        }
    }

    pub fn write_register(&mut self, register: Register, value: u16) -> bool {
        self.write_registers(register.address(), &[value])
    }

    /// Writes a merged mode register value.
    ///
    /// The regulator only re-evaluates its antifreeze schedule right after the
    /// antifreeze day count changes, and its room unit misses single mode
    /// writes, so both cases use a fixed write sequence. The antifreeze one is
    /// only used when no hot-water bits are set. Returns `true` when every
    /// write was acknowledged.
    pub fn write_mode(&mut self, clock: &dyn Clock, register: Register, value: u16) -> bool {
        let pause = self.timings.mode_pause;
        let days = Register::AntifreezeDays;
        if value == ZoneMode::Antifreeze.code() {
            debug!("Antifreeze sequence for {register}: 0x{value:04X}");
            let mut ok = self.write_register(days, 1);
            clock.sleep(pause);
            ok &= self.write_register(days, 0);
            ok &= self.write_register(register, value);
            ok
        } else {
            debug!("Mode sequence for {register}: 0x{value:04X}");
            let mut ok = self.write_register(register, value);
            ok &= self.write_register(days, 1);
            ok &= self.write_register(register, value);
            clock.sleep(pause);
            ok &= self.write_register(register, value);
            ok &= self.write_register(days, 0);
            ok
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if let Err(error) = self.line.send(request) {
            warn!("Cannot send request: {error}");
            return None;
        }
        match self.line.receive(self.timings.transaction) {
            Ok(answer) if answer.is_empty() => {
                warn!("No answer to request");
                None
            }
            Ok(answer) => Some(answer),
            Err(error) => {
                warn!("Receive failed: {error}");
                None
            }
        }
    }
}
