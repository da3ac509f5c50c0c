//! Write intents waiting for a master window.
//!
//! External actors hold a [`WriteHandle`]; the worker drains the matching
//! [`WriteQueue`]. Register writes are kept in submission order. Mode changes
//! go to one slot per target where the latest request replaces the previous
//! one, since only the final mode matters.

use crate::protocol::{
    Domain, Error, HotWaterMode, Limits, Register, RegisterSet, Zone, ZoneMode,
};
use chrono::{Datelike, NaiveDateTime, Timelike};
use log::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ModeSlots {
    zone_b: Option<ZoneMode>,
    zone_c: Option<ZoneMode>,
    hot_water: Option<HotWaterMode>,
}

impl ModeSlots {
    fn zone(&mut self, zone: Zone) -> &mut Option<ZoneMode> {
        match zone {
            Zone::B => &mut self.zone_b,
            Zone::C => &mut self.zone_c,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    writes: Mutex<VecDeque<RegisterSet>>,
    modes: Mutex<ModeSlots>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded data stays consistent even if a producer panicked.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending changes for one mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeRequest {
    pub zone: Option<ZoneMode>,
    pub hot_water: Option<HotWaterMode>,
}

impl ModeRequest {
    pub fn is_empty(&self) -> bool {
        self.zone.is_none() && self.hot_water.is_none()
    }

    /// Merges the requested sub-fields into the current register value.
    pub fn apply(&self, current: u16) -> u16 {
        let value = match self.zone {
            Some(mode) => mode.merge_into(current),
            None => current,
        };
        match self.hot_water {
            Some(mode) => mode.merge_into(value),
            None => value,
        }
    }
}

/// Consumer side, owned by the worker.
#[derive(Debug, Default)]
pub struct WriteQueue {
    shared: Arc<Shared>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a producer handle. Target temperatures are clamped to `limits`.
    pub fn handle(&self, limits: Limits) -> WriteHandle {
        WriteHandle {
            shared: self.shared.clone(),
            limits,
        }
    }

    pub fn pop(&self) -> Option<RegisterSet> {
        lock(&self.shared.writes).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.writes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What is pending for `zone`'s mode register. Hot-water requests belong
    /// to the register of `hot_water_zone`.
    pub fn peek_mode(&self, zone: Zone, hot_water_zone: Zone) -> ModeRequest {
        let mut slots = lock(&self.shared.modes);
        ModeRequest {
            zone: *slots.zone(zone),
            hot_water: slots.hot_water.filter(|_| zone == hot_water_zone),
        }
    }

    /// Like [`WriteQueue::peek_mode`] but empties the slots.
    pub fn take_mode(&self, zone: Zone, hot_water_zone: Zone) -> ModeRequest {
        let mut slots = lock(&self.shared.modes);
        ModeRequest {
            zone: slots.zone(zone).take(),
            hot_water: if zone == hot_water_zone {
                slots.hot_water.take()
            } else {
                None
            },
        }
    }
}

/// Producer side of the write queue. Cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    shared: Arc<Shared>,
    limits: Limits,
}

impl WriteHandle {
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Queues a raw register write.
    pub fn write(&self, set: RegisterSet) {
        debug!("Write request: {set}");
        lock(&self.shared.writes).push_back(set);
    }

    /// Requests a physical value for the register at `address`.
    ///
    /// Target temperatures are given in °C, mode registers take the numeric
    /// code of a zone or hot-water mode.
    pub fn submit(&self, address: u16, value: f32) -> Result<(), Error> {
        let register = Register::from_address(address).ok_or(Error::UnknownRegister(address))?;
        match register.domain() {
            Domain::ReadOnly => Err(Error::ReadOnly(register)),
            Domain::Mode(zone) => {
                if !value.is_finite() {
                    return Err(Error::NotFinite(value));
                }
                let code = value.round() as u16;
                if let Ok(mode) = ZoneMode::try_from(code) {
                    self.set_zone_mode(zone, mode);
                    Ok(())
                } else {
                    self.set_hot_water_mode(HotWaterMode::try_from(code)?);
                    Ok(())
                }
            }
            Domain::HotWaterTarget | Domain::ZoneTarget | Domain::AntifreezeTarget => {
                self.set_target(register, value)
            }
        }
    }

    /// Requests a new target temperature in °C.
    pub fn set_target(&self, register: Register, celsius: f32) -> Result<(), Error> {
        let raw = self
            .limits
            .encode_target(register, celsius)
            .ok_or(Error::ReadOnly(register))??;
        debug!("{} target requested: {celsius} -> {raw}", register.name());
        self.write(RegisterSet::single(register, raw));
        Ok(())
    }

    pub fn set_zone_mode(&self, zone: Zone, mode: ZoneMode) {
        debug!("{zone} mode requested: {mode}");
        *lock(&self.shared.modes).zone(zone) = Some(mode);
    }

    pub fn set_hot_water_mode(&self, mode: HotWaterMode) {
        debug!("hot water mode requested: {mode}");
        lock(&self.shared.modes).hot_water = Some(mode);
    }

    /// Sets the regulator clock. The time must already be in the regulator's
    /// time zone.
    pub fn set_datetime(&self, datetime: NaiveDateTime) {
        debug!("datetime requested: {datetime}");
        self.write(RegisterSet {
            start: Register::Hour.address(),
            values: vec![
                datetime.hour() as u16,
                datetime.minute() as u16,
                datetime.weekday().number_from_monday() as u16,
            ],
        });
        self.write(RegisterSet {
            start: Register::Day.address(),
            values: vec![
                datetime.day() as u16,
                datetime.month() as u16,
                (datetime.year() % 100) as u16,
            ],
        });
    }
}
