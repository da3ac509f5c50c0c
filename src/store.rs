//! Register image of the regulator and read-cycle bookkeeping.

use crate::protocol::{Decoded, Flags, ModeBits, Partition, Register, Zone, READ_PARTITIONS};
use std::collections::BTreeMap;

/// Raw values read from the regulator, plus the partitions still missing from
/// the current read cycle.
///
/// Only the worker mutates the store, so it needs no locking.
#[derive(Debug, Clone)]
pub struct RegisterStore {
    values: BTreeMap<u16, u16>,
    partitions: &'static [Partition],
    done: Vec<bool>,
}

impl Default for RegisterStore {
    fn default() -> Self {
        Self::new(&READ_PARTITIONS)
    }
}

impl RegisterStore {
    pub fn new(partitions: &'static [Partition]) -> Self {
        Self {
            values: BTreeMap::new(),
            partitions,
            done: vec![false; partitions.len()],
        }
    }

    /// Partitions not yet read in the current cycle, in read order.
    pub fn pending(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .zip(&self.done)
            .filter(|(_, done)| !**done)
            .map(|(partition, _)| *partition)
            .collect()
    }

    /// Stores the answer for `partition` and marks it read.
    pub fn complete(&mut self, partition: Partition, values: BTreeMap<u16, u16>) {
        self.values.extend(values);
        if let Some(index) = self.partitions.iter().position(|p| *p == partition) {
            self.done[index] = true;
        }
    }

    /// Every partition was read since the last [`RegisterStore::start_cycle`].
    pub fn cycle_complete(&self) -> bool {
        self.done.iter().all(|done| *done)
    }

    pub fn start_cycle(&mut self) {
        self.done.iter_mut().for_each(|done| *done = false);
    }

    /// Forgets every value and restarts the read cycle.
    pub fn invalidate(&mut self) {
        self.values.clear();
        self.start_cycle();
    }

    /// Applies a write acknowledged by the regulator, so that a later
    /// read-modify-write sees it before the next cycle.
    pub fn update(&mut self, start: u16, values: &[u16]) {
        for (offset, value) in values.iter().enumerate() {
            self.values.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    pub fn raw(&self, register: Register) -> Option<u16> {
        self.values.get(&register.address()).copied()
    }

    pub fn decode(&self, register: Register) -> Option<Decoded> {
        self.raw(register).map(|raw| register.decode(raw))
    }

    pub fn integer(&self, register: Register) -> Option<u16> {
        match self.decode(register)? {
            Decoded::Integer(value) => Some(value),
            _ => None,
        }
    }

    /// A tenths register, `None` when unread or when its sensor is absent.
    pub fn tenths(&self, register: Register) -> Option<f32> {
        match self.decode(register)? {
            Decoded::Tenths(value) => value,
            _ => None,
        }
    }

    pub fn flags(&self, register: Register) -> Option<Flags> {
        match self.decode(register)? {
            Decoded::Flags(flags) => Some(flags),
            _ => None,
        }
    }

    pub fn mode(&self, register: Register) -> Option<ModeBits> {
        match self.decode(register)? {
            Decoded::Mode(bits) => Some(bits),
            _ => None,
        }
    }

    /// A zone is in use when its room sensor reports a temperature.
    pub fn zone_in_use(&self, zone: Zone) -> bool {
        self.tenths(zone.room_temp_register()).is_some()
    }

    /// The zone whose mode register also carries the hot-water mode.
    pub fn hot_water_zone(&self) -> Zone {
        if self.zone_in_use(Zone::B) {
            Zone::B
        } else {
            Zone::C
        }
    }
}
