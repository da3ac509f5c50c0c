//! Access to the shared RS-485 line.
//!
//! The line carries both the room unit's traffic and our own, so there is no
//! request/response client here: a [`Transport`] only sends raw frames and
//! hands back whatever bytes arrive before a deadline.

use crate::error::{Error, Result};
use crate::frame::MAX_FRAME_LEN;
use log::*;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// The regulator's fixed line speed.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Byte-level access to the bus.
pub trait Transport: Send {
    /// Writes one complete frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Waits up to `timeout` for a frame. An empty buffer means the line stayed silent.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Closes and reopens the underlying connection.
    fn reconnect(&mut self) -> Result<()>;

    /// Drains stale input until a whole `idle` period passes without data.
    fn clean(&mut self, idle: Duration) -> Result<usize> {
        let mut drained = 0;
        loop {
            let data = self.receive(idle)?;
            if data.is_empty() {
                return Ok(drained);
            }
            debug!("Cleaning of: {} byte(s)", data.len());
            drained += data.len();
        }
    }
}

/// Creates a `tokio_serial::SerialPortBuilder` for the line.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}

/// Calculates the minimum silence that separates two RTU frames.
/// This is 3.5 character times.
pub fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    // Modbus assumes 11 bits per character (start + 8 data + parity/stop + stop).
    let bits_per_char = 11.0;
    if baud_rate == 0 {
        return Duration::from_millis(16);
    }
    let char_time_secs = bits_per_char / f64::from(baud_rate);
    let delay_micros = (3.5 * char_time_secs * 1_000_000.0) as u64;

    // Modbus RTU fixes 1.75ms for rates above 19200.
    const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the configured frame gap is long enough; if not, uses the calculated minimum.
pub fn check_rtu_delay(user_delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        warn!(
            "Frame gap of {user_delay:?} is below the minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineSettings {
    pub device: String,
    pub baud_rate: u32,
    /// Silence that terminates a received frame.
    pub frame_gap: Duration,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            device: String::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
            frame_gap: Duration::from_millis(20),
        }
    }
}

/// The RS-485 adapter, opened 8N1 without flow control.
pub struct SerialLine {
    settings: LineSettings,
    port: Option<Box<dyn tokio_serial::SerialPort>>,
}

impl SerialLine {
    pub fn open(mut settings: LineSettings) -> Result<Self> {
        settings.frame_gap = check_rtu_delay(settings.frame_gap, settings.baud_rate);
        let mut line = Self {
            settings,
            port: None,
        };
        line.reconnect()?;
        Ok(line)
    }

    pub fn settings(&self) -> &LineSettings {
        &self.settings
    }

    fn port(&mut self) -> Result<&mut Box<dyn tokio_serial::SerialPort>> {
        match self.port.as_mut() {
            Some(port) => Ok(port),
            None => Err(Error::NotConnected(self.settings.device.clone())),
        }
    }

    /// Reads whatever arrives within `timeout`, `None` when nothing did.
    fn read_chunk(
        port: &mut Box<dyn tokio_serial::SerialPort>,
        timeout: Duration,
        buffer: &mut [u8],
    ) -> Result<Option<usize>> {
        port.set_timeout(timeout)?;
        match port.read(buffer) {
            Ok(0) => Ok(None),
            Ok(len) => Ok(Some(len)),
            Err(error) if error.kind() == ErrorKind::TimedOut => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

impl Transport for SerialLine {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(frame)?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let frame_gap = self.settings.frame_gap;
        let deadline = Instant::now() + timeout;
        let port = self.port()?;
        let mut buffer = [0u8; MAX_FRAME_LEN];
        let mut frame = Vec::new();

        match Self::read_chunk(port, timeout, &mut buffer)? {
            Some(len) => frame.extend_from_slice(&buffer[..len]),
            None => return Ok(frame),
        }
        while frame.len() < MAX_FRAME_LEN {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match Self::read_chunk(port, frame_gap.min(remaining), &mut buffer)? {
                Some(len) => frame.extend_from_slice(&buffer[..len]),
                None => break,
            }
        }
        frame.truncate(MAX_FRAME_LEN);
        trace!("Received {} byte(s): {:02X?}", frame.len(), frame);
        Ok(frame)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.port = None;
        info!(
            "Opening serial line {} at {} baud",
            self.settings.device, self.settings.baud_rate
        );
        let port = serial_port_builder(&self.settings.device, self.settings.baud_rate)
            .timeout(self.settings.frame_gap)
            .open()?;
        port.clear(tokio_serial::ClearBuffer::All)?;
        self.port = Some(port);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use scripted::ScriptedLine;

#[cfg(test)]
mod scripted {
    use super::Transport;
    use crate::clock::ManualClock;
    use crate::error::Result;
    use crate::frame::{self, ParsedRequest};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Time a scripted frame takes to arrive.
    const FRAME_TIME: Duration = Duration::from_millis(20);

    #[derive(Debug, Default)]
    pub(crate) struct LineState {
        /// Foreign traffic heard while listening, `None` is a silent timeout.
        pub heard: VecDeque<Option<Vec<u8>>>,
        /// Register image of the simulated regulator.
        pub registers: BTreeMap<u16, u16>,
        /// Slave address the simulated regulator answers to.
        pub slave: u8,
        /// Number of upcoming requests the regulator ignores.
        pub ignore_requests: usize,
        /// Every frame we transmitted.
        pub sent: Vec<Vec<u8>>,
        pub reconnects: usize,
        /// Every receive fails, as with an unplugged adapter.
        pub fail_receive: bool,
        pending: Option<Vec<u8>>,
    }

    /// In-memory bus with a simulated regulator. Clones share the same line.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedLine {
        clock: ManualClock,
        state: Arc<Mutex<LineState>>,
    }

    impl ScriptedLine {
        pub(crate) fn new(clock: ManualClock, slave: u8) -> Self {
            let state = LineState {
                slave,
                ..LineState::default()
            };
            Self {
                clock,
                state: Arc::new(Mutex::new(state)),
            }
        }

        pub(crate) fn with<R>(&self, f: impl FnOnce(&mut LineState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        pub(crate) fn hear(&self, frame: Vec<u8>) {
            self.with(|state| state.heard.push_back(Some(frame)));
        }

        pub(crate) fn silence(&self, count: usize) {
            self.with(|state| state.heard.extend(std::iter::repeat_n(None, count)));
        }

        pub(crate) fn set_registers(&self, start: u16, values: &[u16]) {
            self.with(|state| {
                for (offset, value) in values.iter().enumerate() {
                    state.registers.insert(start + offset as u16, *value);
                }
            });
        }

        pub(crate) fn register(&self, address: u16) -> Option<u16> {
            self.with(|state| state.registers.get(&address).copied())
        }

        pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
            self.with(|state| state.sent.clone())
        }

        /// Decoded write requests we transmitted, in order.
        pub(crate) fn writes(&self) -> Vec<(u16, Vec<u16>)> {
            self.sent()
                .iter()
                .filter_map(|frame| match frame::parse_slave_request(frame) {
                    Ok(ParsedRequest::Write { start, values, .. }) => {
                        Some((start, values.into_values().collect()))
                    }
                    _ => None,
                })
                .collect()
        }

        /// Start addresses of the read requests we transmitted, in order.
        pub(crate) fn reads(&self) -> Vec<u16> {
            self.sent()
                .iter()
                .filter_map(|frame| match frame::parse_slave_request(frame) {
                    Ok(ParsedRequest::Read { start, .. }) => Some(start),
                    _ => None,
                })
                .collect()
        }
    }

    fn answer(state: &mut LineState, request: &[u8]) -> Option<Vec<u8>> {
        match frame::parse_slave_request(request).ok()? {
            ParsedRequest::Read {
                slave,
                start,
                count,
            } if slave == state.slave => {
                let values: Vec<u16> = (start..start + count)
                    .map(|address| state.registers.get(&address).copied().unwrap_or(0))
                    .collect();
                Some(frame::build_read_answer(slave, &values))
            }
            ParsedRequest::Write {
                slave,
                start,
                values,
            } if slave == state.slave => {
                let count = values.len() as u16;
                state.registers.extend(values);
                Some(frame::build_write_ack(slave, start, count))
            }
            _ => None,
        }
    }

    impl Transport for ScriptedLine {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.with(|state| {
                state.sent.push(data.to_vec());
                if state.ignore_requests > 0 {
                    state.ignore_requests -= 1;
                    state.pending = None;
                } else {
                    state.pending = answer(state, data);
                }
            });
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
            if self.with(|state| state.fail_receive) {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            }
            let received = self.with(|state| {
                state
                    .pending
                    .take()
                    .or_else(|| state.heard.pop_front().flatten())
            });
            match received {
                Some(data) => {
                    self.clock.advance(FRAME_TIME.min(timeout));
                    Ok(data)
                }
                None => {
                    self.clock.advance(timeout);
                    Ok(Vec::new())
                }
            }
        }

        fn reconnect(&mut self) -> Result<()> {
            self.with(|state| state.reconnects += 1);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn test_minimum_rtu_delay_calculation() {
        // 3.5 char times = 3.5 * 11 / baud = 38.5 / baud
        assert_eq!(minimum_rtu_delay(1200).as_micros(), 32083);
        assert_eq!(minimum_rtu_delay(4800).as_micros(), 8020);
        assert_eq!(minimum_rtu_delay(9600).as_micros(), 4010);
        assert_eq!(minimum_rtu_delay(19200).as_micros(), 2005);
        // 38.5 / 38400 * 1e6 = 1002us, clamped
        assert_eq!(minimum_rtu_delay(38400).as_micros(), 1750);
    }

    #[test]
    fn test_check_rtu_delay() {
        let min_delay_9600 = minimum_rtu_delay(9600);
        assert_eq!(check_rtu_delay(Duration::from_millis(3), 9600), min_delay_9600);
        assert_eq!(
            check_rtu_delay(Duration::from_millis(20), 9600),
            Duration::from_millis(20)
        );
        assert_eq!(check_rtu_delay(min_delay_9600, 9600), min_delay_9600);
    }

    #[test]
    fn clean_drains_until_silence() {
        let clock = ManualClock::new();
        let mut line = ScriptedLine::new(clock.clone(), 0x0A);
        line.hear(vec![1, 2, 3]);
        line.hear(vec![4, 5]);
        let before = clock.now();
        assert_eq!(line.clean(Duration::from_millis(100)).unwrap(), 5);
        assert!(line.with(|state| state.heard.is_empty()));
        assert!(clock.now() - before >= Duration::from_millis(100));
    }

    #[test]
    fn silent_receive_consumes_the_timeout() {
        let clock = ManualClock::new();
        let mut line = ScriptedLine::new(clock.clone(), 0x0A);
        let before = clock.now();
        assert!(line.receive(Duration::from_millis(500)).unwrap().is_empty());
        assert_eq!(clock.now() - before, Duration::from_millis(500));
    }
}
