//! Domain attributes published after each completed read cycle.

use crate::protocol::{Flags, Register, Zone};
use crate::store::RegisterStore;
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

/// Fan speed at full burner power, in rpm.
const FAN_SPEED_MAX: f32 = 5900.0;

pub const ONLINE: &str = "Online";
pub const OFFLINE: &str = "Offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Group {
    Boiler,
    HotWater,
    Zone(Zone),
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Boiler => write!(f, "boiler"),
            Group::HotWater => write!(f, "hotwater"),
            Group::Zone(Zone::B) => write!(f, "zone_b"),
            Group::Zone(Zone::C) => write!(f, "zone_c"),
        }
    }
}

/// What an attribute measures, for consumers that need a unit or a widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AttributeKind {
    Status,
    Timestamp,
    Integer,
    /// °C
    Temperature,
    /// bar
    Pressure,
    /// %
    Power,
    /// µA
    Current,
    /// rpm
    Speed,
    /// on/off
    Binary,
    Mode,
    Text,
}

impl AttributeKind {
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            AttributeKind::Temperature => Some("°C"),
            AttributeKind::Pressure => Some("bar"),
            AttributeKind::Power => Some("%"),
            AttributeKind::Current => Some("µA"),
            AttributeKind::Speed => Some("rpm"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f32),
    Text(String),
    DateTime(NaiveDateTime),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(true) => write!(f, "ON"),
            AttributeValue::Bool(false) => write!(f, "OFF"),
            AttributeValue::Integer(value) => write!(f, "{value}"),
            AttributeValue::Float(value) => write!(f, "{value:.1}"),
            AttributeValue::Text(value) => write!(f, "{value}"),
            AttributeValue::DateTime(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// One published value. `value` is `None` when it is unknown or its sensor is absent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Attribute {
    pub name: &'static str,
    pub value: Option<AttributeValue>,
    pub kind: AttributeKind,
    pub group: Group,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: ", self.group, self.name)?;
        match &self.value {
            Some(value) => write!(f, "{value}")?,
            None => write!(f, "-")?,
        }
        if let (Some(_), Some(unit)) = (&self.value, self.kind.unit()) {
            write!(f, " {unit}")?;
        }
        Ok(())
    }
}

/// Text of a regulator alarm code.
pub fn alarm_text(code: u16) -> &'static str {
    match code {
        0 => "OK",
        10 => "Return sensor fault",
        21 => "Low water pressure",
        26 => "Ignition fault",
        27 => "Parasite flame",
        28 => "Boiler safety thermostat",
        30 => "Control box reset",
        31 => "Smoke sensor fault",
        _ => "Unknown fault",
    }
}

struct Builder<'a> {
    store: &'a RegisterStore,
    group: Group,
    out: Vec<Attribute>,
}

impl Builder<'_> {
    fn group(&mut self, group: Group) -> &mut Self {
        self.group = group;
        self
    }

    fn push(
        &mut self,
        name: &'static str,
        kind: AttributeKind,
        value: Option<AttributeValue>,
    ) -> &mut Self {
        self.out.push(Attribute {
            name,
            value,
            kind,
            group: self.group,
        });
        self
    }

    fn tenths(&mut self, name: &'static str, kind: AttributeKind, register: Register) -> &mut Self {
        let value = self.store.tenths(register).map(AttributeValue::Float);
        self.push(name, kind, value)
    }

    fn integer(
        &mut self,
        name: &'static str,
        kind: AttributeKind,
        register: Register,
    ) -> &mut Self {
        let value = self
            .store
            .integer(register)
            .map(|value| AttributeValue::Integer(value.into()));
        self.push(name, kind, value)
    }

    fn flag(&mut self, name: &'static str, register: Register, mask: u16) -> &mut Self {
        let value = self
            .store
            .flags(register)
            .map(|flags| AttributeValue::Bool(flags.is_set(mask)));
        self.push(name, AttributeKind::Binary, value)
    }
}

fn regulator_datetime(store: &RegisterStore) -> Option<NaiveDateTime> {
    let year = store.integer(Register::Year)?;
    let month = store.integer(Register::Month)?;
    let day = store.integer(Register::Day)?;
    let hour = store.integer(Register::Hour)?;
    let minute = store.integer(Register::Minute)?;
    NaiveDate::from_ymd_opt(i32::from(year) + 2000, month.into(), day.into())?
        .and_hms_opt(hour.into(), minute.into(), 0)
}

fn burner_power(store: &RegisterStore) -> Option<i64> {
    let fan_speed = store.integer(Register::FanSpeed)?;
    let ionization = store.tenths(Register::IonizationCurrent)?;
    if ionization > 0.0 {
        Some((f32::from(fan_speed) / FAN_SPEED_MAX * 100.0).round() as i64)
    } else {
        Some(0)
    }
}

fn zone_pump(store: &RegisterStore, zone: Zone) -> Option<bool> {
    match zone {
        Zone::C => store
            .flags(Register::BaseEcs)
            .map(|flags| flags.is_set(Flags::ZONE_C_PUMP)),
        Zone::B => store
            .flags(Register::OptionsBC)
            .map(|flags| flags.is_set(Flags::ZONE_B_PUMP)),
    }
}

fn pump_power(store: &RegisterStore) -> Option<i64> {
    if store.zone_in_use(Zone::C) && zone_pump(store, Zone::C)? {
        store.integer(Register::PumpPower).map(i64::from)
    } else {
        Some(0)
    }
}

fn zone(builder: &mut Builder<'_>, zone: Zone) {
    use AttributeKind::*;
    let store = builder.store;
    builder.group(Group::Zone(zone));
    builder.tenths("temp", Temperature, zone.room_temp_register());
    if store.zone_in_use(zone) {
        let mode = store
            .mode(zone.mode_register())
            .and_then(|bits| bits.zone_mode())
            .map(|mode| AttributeValue::Text(mode.to_string()));
        builder
            .push("mode", Mode, mode)
            .push("pump", Binary, zone_pump(store, zone).map(AttributeValue::Bool))
            .tenths("day_temp", Temperature, zone.day_target_register())
            .tenths("night_temp", Temperature, zone.night_target_register())
            .tenths("antifreeze_temp", Temperature, zone.antifreeze_target_register());
    } else {
        builder
            .push("mode", Mode, None)
            .push("pump", Binary, None)
            .push("day_temp", Temperature, None)
            .push("night_temp", Temperature, None)
            .push("antifreeze_temp", Temperature, None);
    }
}

/// Derives every attribute from the register image.
pub fn derive(store: &RegisterStore) -> Vec<Attribute> {
    use AttributeKind::*;
    let mut builder = Builder {
        store,
        group: Group::Boiler,
        out: Vec::new(),
    };

    let alarm = store.integer(Register::Alarm);
    builder
        .push("status", Status, Some(AttributeValue::Text(ONLINE.to_string())))
        .push("date", Timestamp, regulator_datetime(store).map(AttributeValue::DateTime))
        .integer("type", Integer, Register::BoilerType)
        .integer("ctrl", Integer, Register::Ctrl)
        .tenths("ext_temp", Temperature, Register::OutsideTemp)
        .tenths("temp", Temperature, Register::BoilerTemp)
        .tenths("target_temp", Temperature, Register::ZoneCCalcTemp)
        .tenths("return_temp", Temperature, Register::ReturnTemp)
        .tenths("water_pressure", Pressure, Register::WaterPressure)
        .push("power", Power, burner_power(store).map(AttributeValue::Integer))
        .tenths("smoke_temp", Temperature, Register::SmokeTemp)
        .tenths("ionization_current", Current, Register::IonizationCurrent)
        .integer("fan_speed", Speed, Register::FanSpeed)
        .flag("burner_status", Register::BaseEcs, Flags::BURNER)
        .push("pump_power", Power, pump_power(store).map(AttributeValue::Integer))
        .integer("alarm_id", Integer, Register::Alarm)
        .push(
            "alarm",
            Text,
            alarm.map(|code| AttributeValue::Text(alarm_text(code).to_string())),
        );

    let hot_water_mode = store
        .mode(store.hot_water_zone().mode_register())
        .and_then(|bits| bits.hot_water_mode())
        .map(|mode| AttributeValue::Text(mode.to_string()));
    builder
        .group(Group::HotWater)
        .flag("pump", Register::BaseEcs, Flags::HOT_WATER_PUMP)
        .tenths("temp", Temperature, Register::HotWaterTemp)
        .push("mode", Mode, hot_water_mode)
        .tenths("day_temp", Temperature, Register::HotWaterDayTarget)
        .tenths("night_temp", Temperature, Register::HotWaterNightTarget);

    zone(&mut builder, Zone::C);
    zone(&mut builder, Zone::B);
    builder.out
}

/// The attribute set published when the regulator cannot be reached:
/// `status` is offline and every other value is unknown.
pub fn invalidated() -> Vec<Attribute> {
    let mut attributes = derive(&RegisterStore::default());
    for attribute in &mut attributes {
        attribute.value = None;
    }
    if let Some(status) = attributes.first_mut() {
        status.value = Some(AttributeValue::Text(OFFLINE.to_string()));
    }
    attributes
}
