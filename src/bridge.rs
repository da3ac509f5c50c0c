//! The worker loop sharing the line with the room unit.
//!
//! Each [`Bridge::step`] listens for one receive period and feeds the result
//! to the [`BusArbiter`]. When the arbiter hands the line over, the bridge runs
//! one master turn:
//!
//! 1. pending mode changes (zone C register, then zone B register),
//! 2. queued register writes, within the write budget,
//! 3. the pending partitions of the read cycle, when a refresh is due.
//!
//! The [`SynchroWatchdog`] is checked on every step regardless of bus state.

use crate::arbiter::{BusArbiter, BusState};
use crate::attributes::{self, Attribute};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::protocol::{Limits, Zone};
use crate::queue::{WriteHandle, WriteQueue};
use crate::store::RegisterStore;
use crate::transaction::{Master, Timings};
use crate::transport::Transport;
use crate::watchdog::{self, SynchroWatchdog};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default Modbus address of the regulator.
pub const DEFAULT_SLAVE: u8 = 0x0A;

/// Receives the full attribute set after every completed read cycle.
///
/// Called on the worker thread; it must not block for long.
pub trait Publisher: Send {
    fn publish(&mut self, attributes: &[Attribute]);
}

impl<F> Publisher for F
where
    F: FnMut(&[Attribute]) + Send,
{
    fn publish(&mut self, attributes: &[Attribute]) {
        self(attributes)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BridgeSettings {
    /// Modbus address of the regulator.
    pub slave: u8,
    /// Refresh period of the published attributes.
    pub period: Duration,
    pub limits: Limits,
    pub timings: Timings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            slave: DEFAULT_SLAVE,
            period: watchdog::DEFAULT_PERIOD,
            limits: Limits::default(),
            timings: Timings::default(),
        }
    }
}

pub struct Bridge<T, P, C = SystemClock> {
    master: Master<T>,
    arbiter: BusArbiter,
    store: RegisterStore,
    watchdog: SynchroWatchdog,
    queue: WriteQueue,
    handle: WriteHandle,
    publisher: P,
    clock: C,
    synchro: bool,
    refresh_requested: bool,
    attributes: Vec<Attribute>,
}

impl<T: Transport, P: Publisher> Bridge<T, P, SystemClock> {
    pub fn new(line: T, settings: BridgeSettings, publisher: P) -> Self {
        Self::with_clock(line, settings, publisher, SystemClock)
    }
}

impl<T: Transport, P: Publisher, C: Clock> Bridge<T, P, C> {
    pub fn with_clock(line: T, settings: BridgeSettings, publisher: P, clock: C) -> Self {
        let queue = WriteQueue::new();
        let handle = queue.handle(settings.limits);
        let now = clock.now();
        Self {
            master: Master::new(line, settings.slave, settings.timings),
            arbiter: BusArbiter::new(settings.timings.quiescence),
            store: RegisterStore::default(),
            watchdog: SynchroWatchdog::new(settings.period, now),
            queue,
            handle,
            publisher,
            clock,
            synchro: false,
            // Nothing is known yet.
            refresh_requested: true,
            attributes: attributes::invalidated(),
        }
    }

    /// A handle for submitting write intents from other threads.
    pub fn write_handle(&self) -> WriteHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> BusState {
        self.arbiter.state()
    }

    /// The attributes last published.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    /// Runs one loop iteration. Only a failure to reopen the line is an error.
    pub fn step(&mut self) -> Result<()> {
        let frame = self.master.listen(&self.clock);
        let now = self.clock.now();
        if self.arbiter.observe(!frame.is_empty(), now) {
            self.master_turn(now);
        }
        if self.watchdog.check(self.clock.now()) {
            self.resynchronize()?;
        }
        Ok(())
    }

    /// Loops until `stop` is set or the line fails, then publishes the
    /// invalidated attribute set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        info!("Bridge worker started");
        let mut result = self.master.clean();
        while result.is_ok() && !stop.load(Ordering::SeqCst) {
            result = self.step();
        }
        match &result {
            Ok(()) => info!("Bridge worker stopped"),
            Err(error) => error!("Bridge worker terminated: {error}"),
        }
        self.invalidate();
        result
    }

    fn master_turn(&mut self, started: Instant) {
        if !self.synchro {
            info!("ModBus master slave synchro OK");
            self.synchro = true;
        }

        let hot_water_zone = self.store.hot_water_zone();
        for zone in [Zone::C, Zone::B] {
            self.update_mode(zone, hot_water_zone);
        }

        self.drain_writes(started);

        if self.refresh_requested || self.watchdog.refresh_due(self.clock.now()) {
            self.read_cycle();
        }
    }

    /// Read-modify-write of one mode register, leaving the request queued
    /// when the current value cannot be read.
    fn update_mode(&mut self, zone: Zone, hot_water_zone: Zone) {
        if self.queue.peek_mode(zone, hot_water_zone).is_empty() {
            return;
        }
        let register = zone.mode_register();
        let Some(current) = self.master.read_register(register) else {
            self.synchro_error();
            return;
        };
        let request = self.queue.take_mode(zone, hot_water_zone);
        let value = request.apply(current);
        info!("{register} current value: 0x{current:04X}, next value: 0x{value:04X}");
        if self.master.write_mode(&self.clock, register, value) {
            self.store.update(register.address(), &[value]);
        } else {
            self.synchro_error();
        }
        self.refresh_requested = true;
    }

    /// Sends queued writes until the queue is empty or the budget, counted
    /// from the start of the master turn, is spent. Each set is attempted
    /// once; a failed one is dropped and the next read cycle shows what the
    /// regulator actually holds.
    fn drain_writes(&mut self, started: Instant) {
        let budget = self.master.timings().write_budget;
        while self.clock.now().saturating_duration_since(started) < budget {
            let Some(set) = self.queue.pop() else {
                break;
            };
            debug!("Write request: {set}");
            self.refresh_requested = true;
            if self.master.write_registers(set.start, &set.values) {
                self.store.update(set.start, &set.values);
            } else {
                warn!("Dropped write request: {set}");
                self.synchro_error();
            }
        }
    }

    fn read_cycle(&mut self) {
        for partition in self.store.pending() {
            match self.master.read_registers(partition.start, partition.count) {
                Some(values) => self.store.complete(partition, values),
                None => {
                    debug!("Read of {partition} failed");
                    self.synchro_error();
                    return;
                }
            }
        }
        if self.store.cycle_complete() {
            self.watchdog.record_success(self.clock.now());
            self.store.start_cycle();
            self.refresh_requested = false;
            self.attributes = attributes::derive(&self.store);
            self.publisher.publish(&self.attributes);
        }
    }

    fn synchro_error(&mut self) {
        warn!("ModBus master slave synchro error");
        self.synchro = false;
    }

    fn invalidate(&mut self) {
        self.store.invalidate();
        self.attributes = attributes::invalidated();
        self.publisher.publish(&self.attributes);
    }

    fn resynchronize(&mut self) -> Result<()> {
        self.invalidate();
        warn!("Init link with regulator");
        self.master.reconnect()?;
        self.refresh_requested = true;
        Ok(())
    }
}

impl<T, P, C> Bridge<T, P, C>
where
    T: Transport + 'static,
    P: Publisher + 'static,
    C: Clock + 'static,
{
    /// Starts the worker on its own thread.
    pub fn spawn(mut self) -> Result<BridgeHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(String::from("diematic-bridge"))
            .spawn(move || self.run(&flag))?;
        Ok(BridgeHandle { stop, thread })
    }
}

/// Controls a worker started with [`Bridge::spawn`].
pub struct BridgeHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<()>>,
}

impl BridgeHandle {
    /// The flag that ends the worker loop, e.g. for a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the worker to end on its own or through the stop flag.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("bridge worker panicked")))?
    }

    /// Requests the worker to stop and waits for it. An exchange in progress
    /// runs to its own timeout first.
    pub fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeValue, Group, OFFLINE, ONLINE};
    use crate::clock::ManualClock;
    use crate::frame;
    use crate::protocol::{HotWaterMode, Register, RegisterSet, ZoneMode};
    use crate::transport::ScriptedLine;
    use std::sync::Mutex;

    const SLAVE: u8 = 0x0A;

    type Published = Arc<Mutex<Vec<Vec<Attribute>>>>;
    type Sink = Box<dyn FnMut(&[Attribute]) + Send>;

    struct Fixture {
        bridge: Bridge<ScriptedLine, Sink, ManualClock>,
        line: ScriptedLine,
        clock: ManualClock,
        published: Published,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new();
            let line = ScriptedLine::new(clock.clone(), SLAVE);
            line.set_registers(7, &[105]);
            line.set_registers(27, &[0xFFFF]);
            line.set_registers(39, &[213]);
            line.set_registers(75, &[612]);
            let published: Published = Arc::default();
            let sink = published.clone();
            let publisher: Sink = Box::new(move |attributes: &[Attribute]| {
                sink.lock().unwrap().push(attributes.to_vec())
            });
            let settings = BridgeSettings::default();
            let bridge = Bridge::with_clock(line.clone(), settings, publisher, clock.clone());
            Self {
                bridge,
                line,
                clock,
                published,
            }
        }

        /// One foreign frame followed by enough silence for one master turn.
        fn window(&mut self) {
            self.line.hear(frame::build_read_request(0x10, 0, 1));
            self.steps(12);
        }

        fn steps(&mut self, count: usize) {
            for _ in 0..count {
                self.bridge.step().unwrap();
            }
        }

        fn status(&self) -> Vec<String> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|set| set[0].value.as_ref().unwrap().to_string())
                .collect()
        }
    }

    fn value<'a>(
        attributes: &'a [Attribute],
        group: Group,
        name: &str,
    ) -> Option<&'a AttributeValue> {
        attributes
            .iter()
            .find(|a| a.group == group && a.name == name)
            .and_then(|a| a.value.as_ref())
    }

    #[test]
    fn never_transmits_on_a_silent_line() {
        let mut fixture = Fixture::new();
        fixture.line.silence(150);
        fixture.steps(150);
        assert!(fixture.line.with(|state| state.heard.is_empty()));
        assert_eq!(fixture.bridge.state(), BusState::Init);
        assert!(fixture.line.sent().is_empty());
    }

    #[test]
    fn failing_line_does_not_spin() {
        let mut fixture = Fixture::new();
        fixture.line.with(|state| state.fail_receive = true);
        let before = fixture.clock.now();
        fixture.steps(20);
        assert!(fixture.clock.now() - before >= Timings::default().listen * 20);
        assert!(fixture.line.sent().is_empty());
    }

    #[test]
    fn read_cycle_publishes_attributes() {
        let mut fixture = Fixture::new();
        fixture.window();
        assert_eq!(fixture.line.reads(), [307, 451, 1, 64]);
        assert_eq!(fixture.status(), [ONLINE]);
        let attributes = fixture.bridge.attributes();
        assert_eq!(
            value(attributes, Group::Boiler, "ext_temp"),
            Some(&AttributeValue::Float(10.5))
        );
        assert_eq!(
            value(attributes, Group::Boiler, "temp"),
            Some(&AttributeValue::Float(61.2))
        );
    }

    #[test]
    fn master_window_waits_for_quiet_line() {
        let mut fixture = Fixture::new();
        fixture.line.hear(frame::build_read_request(0x10, 0, 1));
        fixture.steps(10);
        assert!(fixture.line.sent().is_empty());
        fixture.steps(2);
        assert_matches::assert_matches!(fixture.bridge.state(), BusState::Master { .. });
        assert_eq!(fixture.line.reads().len(), 4);
    }

    #[test]
    fn no_refresh_before_the_period() {
        let mut fixture = Fixture::new();
        fixture.window();
        fixture.window();
        // The second window came 6s later.
        assert_eq!(fixture.line.reads().len(), 4);
        assert_eq!(fixture.status().len(), 1);
    }

    #[test]
    fn writes_go_first_and_force_a_refresh() {
        let mut fixture = Fixture::new();
        fixture.window();
        let handle = fixture.bridge.write_handle();
        handle.set_target(Register::HotWaterDayTarget, 52.0).unwrap();
        fixture.window();
        assert_eq!(fixture.line.register(59), Some(500));
        let sent = fixture.line.sent();
        let tail = &sent[4..];
        assert_eq!(tail[0], frame::build_write_request(SLAVE, 59, &[500]).unwrap());
        assert_eq!(fixture.line.reads().len(), 8);
        assert_eq!(fixture.status().len(), 2);
    }

    #[test]
    fn failed_write_is_dropped() {
        let mut fixture = Fixture::new();
        let handle = fixture.bridge.write_handle();
        handle.set_target(Register::ZoneCDayTarget, 21.0).unwrap();
        handle.set_target(Register::HotWaterDayTarget, 52.0).unwrap();
        fixture.line.with(|state| state.ignore_requests = 1);
        fixture.window();
        // The lost ack used up the write budget.
        assert_eq!(fixture.bridge.pending_writes(), 1);
        assert_eq!(fixture.line.register(35), None);
        fixture.window();
        assert_eq!(fixture.bridge.pending_writes(), 0);
        assert_eq!(fixture.line.register(35), None);
        assert_eq!(fixture.line.register(59), Some(500));
        let writes = fixture.line.writes();
        assert_eq!(writes, [(35, vec![210]), (59, vec![500])]);
    }

    #[test]
    fn writes_beyond_the_budget_wait_for_the_next_window() {
        let mut fixture = Fixture::new();
        let handle = fixture.bridge.write_handle();
        for _ in 0..150 {
            handle.write(RegisterSet::single(Register::HotWaterDayTarget, 500));
        }
        fixture.window();
        let pending = fixture.bridge.pending_writes();
        assert!(pending > 0 && pending < 150, "{pending} write(s) pending");
        assert_eq!(fixture.line.writes().len(), 150 - pending);
        fixture.window();
        assert_eq!(fixture.bridge.pending_writes(), 0);
        assert_eq!(fixture.line.writes().len(), 150);
    }

    #[test]
    fn failed_partition_is_retried_next_window() {
        let mut fixture = Fixture::new();
        fixture.line.with(|state| state.ignore_requests = 1);
        fixture.window();
        assert!(fixture.status().is_empty());
        fixture.window();
        assert_eq!(fixture.line.reads(), [307, 307, 451, 1, 64]);
        assert_eq!(fixture.status(), [ONLINE]);
    }

    #[test]
    fn zone_mode_keeps_hot_water_bits() {
        let mut fixture = Fixture::new();
        fixture
            .line
            .set_registers(38, &[ZoneMode::Auto.merge_into(HotWaterMode::Temp.code())]);
        let handle = fixture.bridge.write_handle();
        handle.set_zone_mode(Zone::C, ZoneMode::PermNight);
        fixture.window();
        assert_eq!(fixture.line.register(38), Some(0x50 | 2));
        assert_eq!(fixture.line.register(13), Some(0));
        let writes = fixture.line.writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[1], (13, vec![1]));
        let attributes = fixture.bridge.attributes();
        assert_eq!(
            value(attributes, Group::Zone(Zone::C), "mode"),
            Some(&AttributeValue::Text("PERM NIGHT".into()))
        );
        assert_eq!(
            value(attributes, Group::HotWater, "mode"),
            Some(&AttributeValue::Text("TEMP".into()))
        );
    }

    #[test]
    fn hot_water_mode_goes_to_zone_b_when_in_use() {
        let mut fixture = Fixture::new();
        fixture.line.set_registers(27, &[198]);
        fixture.line.set_registers(26, &[ZoneMode::Auto.code()]);
        fixture.line.set_registers(38, &[ZoneMode::PermDay.code()]);
        fixture.window();
        let handle = fixture.bridge.write_handle();
        handle.set_hot_water_mode(HotWaterMode::Perm);
        fixture.window();
        assert_eq!(fixture.line.register(26), Some(ZoneMode::Auto.code() | 0x10));
        assert_eq!(fixture.line.register(38), Some(ZoneMode::PermDay.code()));
    }

    #[test]
    fn mode_request_survives_a_failed_read() {
        let mut fixture = Fixture::new();
        let handle = fixture.bridge.write_handle();
        handle.set_zone_mode(Zone::C, ZoneMode::Antifreeze);
        fixture.line.with(|state| state.ignore_requests = 1);
        fixture.window();
        assert!(fixture.line.writes().is_empty());
        fixture.window();
        assert_eq!(
            fixture.line.writes(),
            [(13, vec![1]), (13, vec![0]), (38, vec![1])]
        );
    }

    #[test]
    fn watchdog_invalidates_and_reconnects() {
        let mut fixture = Fixture::new();
        fixture.window();
        // 6s elapsed; the watchdog fires 90s after the last cycle.
        fixture.steps(170);
        assert_eq!(fixture.status(), [ONLINE]);
        fixture.steps(12);
        assert_eq!(fixture.status(), [ONLINE, OFFLINE]);
        assert_eq!(fixture.line.with(|state| state.reconnects), 1);
        let last = fixture.published.lock().unwrap().last().unwrap().clone();
        assert!(last[1..].iter().all(|a| a.value.is_none()));
        // Once per violation.
        fixture.steps(100);
        assert_eq!(fixture.status().len(), 2);
    }

    #[test]
    fn stop_publishes_offline() {
        let fixture = Fixture::new();
        let published = fixture.published.clone();
        let handle = fixture.bridge.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());
        handle.stop().unwrap();
        let statuses: Vec<String> = published
            .lock()
            .unwrap()
            .iter()
            .map(|set| set[0].value.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(statuses.last().map(String::as_str), Some(OFFLINE));
    }
}
