//! Register model of the Diematic 3 regulator.
//!
//! Every register the bridge knows about is a variant of [`Register`], tagged
//! with the [`DecodeKind`] that turns its raw 16-bit value into a domain
//! quantity. Write-side encoders clamp and quantize physical values the way the
//! regulator's own room unit does.

use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Unknown register address {0}")]
    UnknownRegister(u16),
    #[error("Register {0} is read-only")]
    ReadOnly(Register),
    #[error("Value {0} is not a finite number")]
    NotFinite(f32),
    #[error("Unknown mode '{0}'")]
    UnknownMode(String),
    #[error("Invalid mode code 0x{0:04X}")]
    InvalidModeCode(u16),
    #[error("A register set must hold between 1 and 123 values, got {0}")]
    RegisterSetLength(usize),
}

/// How the raw value of a register is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    /// The raw value as-is.
    Integer,
    /// Bit 15 is the sign, the low 15 bits are tenths. `0xFFFF` means no sensor.
    Tenths,
    /// Sixteen independent flags.
    Bitfield,
    /// A zone mode and a hot-water mode merged into one register.
    ModeBitfield,
}

/// A raw register value decoded according to its [`DecodeKind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Integer(u16),
    /// `None` when the sensor is absent.
    Tenths(Option<f32>),
    Flags(Flags),
    Mode(ModeBits),
}

impl DecodeKind {
    pub fn decode(&self, raw: u16) -> Decoded {
        match self {
            DecodeKind::Integer => Decoded::Integer(raw),
            DecodeKind::Tenths => Decoded::Tenths(decode_tenths(raw)),
            DecodeKind::Bitfield => Decoded::Flags(Flags(raw)),
            DecodeKind::ModeBitfield => Decoded::Mode(ModeBits(raw)),
        }
    }
}

/// Raw value reported for an absent sensor.
pub const SENSOR_ABSENT: u16 = 0xFFFF;

/// Decodes a signed tenths value: bit 15 is the sign, the rest the magnitude.
pub fn decode_tenths(raw: u16) -> Option<f32> {
    if raw == SENSOR_ABSENT {
        return None;
    }
    let magnitude = f32::from(raw & 0x7FFF);
    if raw & 0x8000 != 0 {
        Some(-magnitude / 10.0)
    } else {
        Some(magnitude / 10.0)
    }
}

macro_rules! registers {
    ($($variant:ident = $address:literal, $name:literal, $kind:ident;)+) => {
        /// A regulator holding register.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u16)]
        pub enum Register {
            $($variant = $address,)+
        }

        impl Register {
            /// All known registers, sorted by address.
            pub const ALL: &'static [Register] = &[$(Register::$variant,)+];

            pub const fn kind(self) -> DecodeKind {
                match self {
                    $(Register::$variant => DecodeKind::$kind,)+
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Register::$variant => $name,)+
                }
            }
        }
    };
}

registers! {
    Ctrl = 3, "CTRL", Integer;
    Hour = 4, "HOUR", Integer;
    Minute = 5, "MINUTE", Integer;
    Weekday = 6, "WEEKDAY", Integer;
    OutsideTemp = 7, "OUTSIDE_TEMP", Tenths;
    AntifreezeDays = 13, "ANTIFREEZE_DAYS", Integer;
    ZoneBDayTarget = 23, "ZONE_B_DAY_TARGET", Tenths;
    ZoneBNightTarget = 24, "ZONE_B_NIGHT_TARGET", Tenths;
    ZoneBAntifreezeTarget = 25, "ZONE_B_ANTIFREEZE_TARGET", Tenths;
    ZoneBMode = 26, "ZONE_B_MODE", ModeBitfield;
    ZoneBRoomTemp = 27, "ZONE_B_ROOM_TEMP", Tenths;
    ZoneBCalcTemp = 32, "ZONE_B_CALC_TEMP", Tenths;
    ZoneCDayTarget = 35, "ZONE_C_DAY_TARGET", Tenths;
    ZoneCNightTarget = 36, "ZONE_C_NIGHT_TARGET", Tenths;
    ZoneCAntifreezeTarget = 37, "ZONE_C_ANTIFREEZE_TARGET", Tenths;
    ZoneCMode = 38, "ZONE_C_MODE", ModeBitfield;
    ZoneCRoomTemp = 39, "ZONE_C_ROOM_TEMP", Tenths;
    ZoneCCalcTemp = 44, "ZONE_C_CALC_TEMP", Tenths;
    HotWaterDayTarget = 59, "HOT_WATER_DAY_TARGET", Tenths;
    HotWaterTemp = 62, "HOT_WATER_TEMP", Tenths;
    BoilerTemp = 75, "BOILER_TEMP", Tenths;
    BaseEcs = 89, "BASE_ECS", Bitfield;
    OptionsBC = 90, "OPTIONS_B_C", Bitfield;
    HotWaterNightTarget = 96, "HOT_WATER_NIGHT_TARGET", Tenths;
    Day = 108, "DAY", Integer;
    Month = 109, "MONTH", Integer;
    Year = 110, "YEAR", Integer;
    FanSpeed = 307, "FAN_SPEED", Integer;
    BoilerType = 308, "BOILER_TYPE", Integer;
    IonizationCurrent = 451, "IONIZATION_CURRENT", Tenths;
    ReturnTemp = 453, "RETURN_TEMP", Tenths;
    SmokeTemp = 454, "SMOKE_TEMP", Tenths;
    WaterPressure = 456, "WATER_PRESSURE", Tenths;
    PumpPower = 463, "PUMP_POWER", Integer;
    Alarm = 465, "ALARM", Integer;
}

impl Register {
    pub const fn address(self) -> u16 {
        self as u16
    }

    pub fn from_address(address: u16) -> Option<Register> {
        Register::ALL
            .binary_search_by_key(&address, |register| register.address())
            .ok()
            .map(|index| Register::ALL[index])
    }

    pub fn decode(self, raw: u16) -> Decoded {
        self.kind().decode(raw)
    }

    /// What an external actor may write into this register.
    pub const fn domain(self) -> Domain {
        match self {
            Register::HotWaterDayTarget | Register::HotWaterNightTarget => Domain::HotWaterTarget,
            Register::ZoneBDayTarget
            | Register::ZoneBNightTarget
            | Register::ZoneCDayTarget
            | Register::ZoneCNightTarget => Domain::ZoneTarget,
            Register::ZoneBAntifreezeTarget | Register::ZoneCAntifreezeTarget => {
                Domain::AntifreezeTarget
            }
            Register::ZoneBMode => Domain::Mode(Zone::B),
            Register::ZoneCMode => Domain::Mode(Zone::C),
            _ => Domain::ReadOnly,
        }
    }

    pub const fn descriptor(self) -> RegisterDescriptor {
        RegisterDescriptor {
            register: self,
            address: self.address(),
            kind: self.kind(),
            domain: self.domain(),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.address())
    }
}

/// Static description of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub register: Register,
    pub address: u16,
    pub kind: DecodeKind,
    pub domain: Domain,
}

/// Write-side domain of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    ReadOnly,
    /// [`HOT_WATER_TARGET`]
    HotWaterTarget,
    /// [`Limits::zone_target`]
    ZoneTarget,
    /// [`Limits::antifreeze_target`]
    AntifreezeTarget,
    Mode(Zone),
}

/// One contiguous block of registers read in a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub start: u16,
    pub count: u16,
}

impl Partition {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.start..self.start + self.count).contains(&address)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.start, self.start + self.count - 1)
    }
}

/// Register blocks making up one full read cycle. Each one fits into the
/// transaction timeout at 9600 baud.
pub const READ_PARTITIONS: [Partition; 4] = [
    Partition::new(307, 2),
    Partition::new(451, 15),
    Partition::new(1, 63),
    Partition::new(64, 64),
];

/// A 16-bit register of independent flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    /// `BASE_ECS`: burner running.
    pub const BURNER: u16 = 0x08;
    /// `BASE_ECS`: zone C pump running.
    pub const ZONE_C_PUMP: u16 = 0x10;
    /// `BASE_ECS`: hot-water pump running.
    pub const HOT_WATER_PUMP: u16 = 0x20;
    /// `OPTIONS_B_C`: zone B pump running.
    pub const ZONE_B_PUMP: u16 = 0x10;

    pub fn is_set(&self, mask: u16) -> bool {
        self.0 & mask != 0
    }
}

/// Bits of a mode register owned by the zone mode.
pub const ZONE_MODE_MASK: u16 = 0x2F;
/// Bits of a mode register owned by the hot-water mode.
pub const HOT_WATER_MODE_MASK: u16 = 0x50;

/// Raw value of a mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeBits(pub u16);

impl ModeBits {
    pub fn zone_mode(&self) -> Option<ZoneMode> {
        ZoneMode::decode(self.0)
    }

    pub fn hot_water_mode(&self) -> Option<HotWaterMode> {
        HotWaterMode::decode(self.0)
    }
}

/// Heating zone driven by the regulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Zone {
    B,
    C,
}

impl Zone {
    pub const fn mode_register(self) -> Register {
        match self {
            Zone::B => Register::ZoneBMode,
            Zone::C => Register::ZoneCMode,
        }
    }

    pub const fn room_temp_register(self) -> Register {
        match self {
            Zone::B => Register::ZoneBRoomTemp,
            Zone::C => Register::ZoneCRoomTemp,
        }
    }

    pub const fn day_target_register(self) -> Register {
        match self {
            Zone::B => Register::ZoneBDayTarget,
            Zone::C => Register::ZoneCDayTarget,
        }
    }

    pub const fn night_target_register(self) -> Register {
        match self {
            Zone::B => Register::ZoneBNightTarget,
            Zone::C => Register::ZoneCNightTarget,
        }
    }

    pub const fn antifreeze_target_register(self) -> Register {
        match self {
            Zone::B => Register::ZoneBAntifreezeTarget,
            Zone::C => Register::ZoneCAntifreezeTarget,
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::B => write!(f, "zone B"),
            Zone::C => write!(f, "zone C"),
        }
    }
}

fn normalize_label(s: &str) -> String {
    s.trim().to_ascii_uppercase().replace(['-', '_'], " ")
}

/// Operating mode of a heating zone, stored under [`ZONE_MODE_MASK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum ZoneMode {
    Auto = 8,
    TempDay = 36,
    TempNight = 34,
    PermDay = 4,
    PermNight = 2,
    Antifreeze = 1,
}

impl ZoneMode {
    pub const ALL: [ZoneMode; 6] = [
        ZoneMode::Auto,
        ZoneMode::TempDay,
        ZoneMode::TempNight,
        ZoneMode::PermDay,
        ZoneMode::PermNight,
        ZoneMode::Antifreeze,
    ];

    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Extracts the zone mode from a mode register value.
    pub fn decode(raw: u16) -> Option<ZoneMode> {
        ZoneMode::try_from(raw & ZONE_MODE_MASK).ok()
    }

    /// Replaces the zone sub-field of `current`, keeping the hot-water bits.
    pub fn merge_into(self, current: u16) -> u16 {
        (current & HOT_WATER_MODE_MASK) | self.code()
    }
}

impl TryFrom<u16> for ZoneMode {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        ZoneMode::ALL
            .into_iter()
            .find(|mode| mode.code() == code)
            .ok_or(Error::InvalidModeCode(code))
    }
}

impl FromStr for ZoneMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = normalize_label(s);
        ZoneMode::ALL
            .into_iter()
            .find(|mode| mode.to_string() == label)
            .ok_or_else(|| Error::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for ZoneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ZoneMode::Auto => "AUTO",
            ZoneMode::TempDay => "TEMP DAY",
            ZoneMode::TempNight => "TEMP NIGHT",
            ZoneMode::PermDay => "PERM DAY",
            ZoneMode::PermNight => "PERM NIGHT",
            ZoneMode::Antifreeze => "ANTIFREEZE",
        };
        write!(f, "{label}")
    }
}

/// Hot-water production mode, stored under [`HOT_WATER_MODE_MASK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum HotWaterMode {
    Auto = 0x00,
    Temp = 0x50,
    Perm = 0x10,
}

impl HotWaterMode {
    pub const ALL: [HotWaterMode; 3] = [HotWaterMode::Auto, HotWaterMode::Temp, HotWaterMode::Perm];

    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn decode(raw: u16) -> Option<HotWaterMode> {
        HotWaterMode::try_from(raw & HOT_WATER_MODE_MASK).ok()
    }

    /// Replaces the hot-water sub-field of `current`, keeping the zone bits.
    pub fn merge_into(self, current: u16) -> u16 {
        (current & ZONE_MODE_MASK) | self.code()
    }
}

impl TryFrom<u16> for HotWaterMode {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        HotWaterMode::ALL
            .into_iter()
            .find(|mode| mode.code() == code)
            .ok_or(Error::InvalidModeCode(code))
    }
}

impl FromStr for HotWaterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = normalize_label(s);
        HotWaterMode::ALL
            .into_iter()
            .find(|mode| mode.to_string() == label)
            .ok_or_else(|| Error::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for HotWaterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HotWaterMode::Auto => "AUTO",
            HotWaterMode::Temp => "TEMP",
            HotWaterMode::Perm => "PERM",
        };
        write!(f, "{label}")
    }
}

/// Clamp range and quantization step of a target temperature in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl TargetRange {
    pub const fn new(min: f32, max: f32, step: f32) -> Self {
        Self { min, max, step }
    }

    /// Quantizes `celsius` to the nearest step, clamps it and converts it to
    /// register tenths.
    pub fn encode(&self, celsius: f32) -> Result<u16, Error> {
        if !celsius.is_finite() {
            return Err(Error::NotFinite(celsius));
        }
        let quantized = (celsius / self.step).round() * self.step;
        let clamped = quantized.clamp(self.min, self.max);
        Ok((clamped * 10.0).round() as u16)
    }
}

/// Hot-water targets: 10..=80 °C in 5 °C steps.
pub const HOT_WATER_TARGET: TargetRange = TargetRange::new(10.0, 80.0, 5.0);
/// Nominal zone targets: 5..=30 °C in 0.5 °C steps.
pub const ZONE_TARGET: TargetRange = TargetRange::new(5.0, 30.0, 0.5);

/// Configurable interior temperature bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Limits {
    pub zone_target: TargetRange,
    pub antifreeze_target: TargetRange,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            zone_target: ZONE_TARGET,
            antifreeze_target: ZONE_TARGET,
        }
    }
}

impl Limits {
    /// Encodes a physical target for `register`, `None` when the register
    /// does not hold a target temperature.
    pub fn encode_target(&self, register: Register, celsius: f32) -> Option<Result<u16, Error>> {
        let range = match register.domain() {
            Domain::HotWaterTarget => HOT_WATER_TARGET,
            Domain::ZoneTarget => self.zone_target,
            Domain::AntifreezeTarget => self.antifreeze_target,
            Domain::ReadOnly | Domain::Mode(_) => return None,
        };
        Some(range.encode(celsius))
    }
}

/// An ordered block of register values to write in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    pub start: u16,
    pub values: Vec<u16>,
}

impl RegisterSet {
    pub fn new(start: u16, values: Vec<u16>) -> Result<Self, Error> {
        if values.is_empty() || values.len() > crate::frame::MAX_WRITE_REGISTERS {
            return Err(Error::RegisterSetLength(values.len()));
        }
        Ok(Self { start, values })
    }

    pub fn single(register: Register, value: u16) -> Self {
        Self {
            start: register.address(),
            values: vec![value],
        }
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg {} data {:?}", self.start, self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn tenths_decoding() {
        assert_eq!(decode_tenths(0xFFFF), None);
        assert_eq!(decode_tenths(0x0384), Some(90.0));
        // Sign and magnitude, not two's complement.
        assert_eq!(decode_tenths(0x8384), Some(-90.0));
        assert_eq!(decode_tenths(0x00D7), Some(21.5));
        assert_eq!(decode_tenths(0x8005), Some(-0.5));
        assert_eq!(decode_tenths(0x0000), Some(0.0));
    }

    #[test]
    fn register_table_is_sorted_and_addressable() {
        assert!(Register::ALL.windows(2).all(|w| w[0].address() < w[1].address()));
        for register in Register::ALL {
            assert_eq!(Register::from_address(register.address()), Some(*register));
        }
        assert_eq!(Register::from_address(0), None);
        assert_eq!(Register::from_address(59), Some(Register::HotWaterDayTarget));
    }

    #[test]
    fn partitions_cover_every_register() {
        for register in Register::ALL {
            assert!(
                READ_PARTITIONS.iter().any(|p| p.contains(register.address())),
                "{register} not covered"
            );
        }
    }

    #[test]
    fn register_kinds() {
        assert_eq!(Register::ZoneCMode.kind(), DecodeKind::ModeBitfield);
        assert_eq!(Register::BaseEcs.kind(), DecodeKind::Bitfield);
        assert_eq!(Register::OutsideTemp.kind(), DecodeKind::Tenths);
        assert_eq!(Register::FanSpeed.kind(), DecodeKind::Integer);
        assert_eq!(
            Register::OutsideTemp.decode(0xFFFF),
            Decoded::Tenths(None)
        );
        assert_eq!(Register::Alarm.decode(21), Decoded::Integer(21));
    }

    #[test]
    fn zone_modes_round_trip_under_mask() {
        for mode in ZoneMode::ALL {
            for hot_water in HotWaterMode::ALL {
                let raw = mode.merge_into(hot_water.code() | 0x80);
                assert_eq!(ZoneMode::decode(raw), Some(mode));
                assert_eq!(HotWaterMode::decode(raw), Some(hot_water));
            }
        }
    }

    #[test]
    fn hot_water_modes_round_trip_under_mask() {
        for hot_water in HotWaterMode::ALL {
            for mode in ZoneMode::ALL {
                let raw = hot_water.merge_into(mode.code());
                assert_eq!(HotWaterMode::decode(raw), Some(hot_water));
                assert_eq!(ZoneMode::decode(raw), Some(mode));
            }
        }
    }

    #[test]
    fn mode_labels() {
        assert_eq!("temp-day".parse::<ZoneMode>(), Ok(ZoneMode::TempDay));
        assert_eq!("PERM NIGHT".parse::<ZoneMode>(), Ok(ZoneMode::PermNight));
        assert_eq!("antifreeze".parse::<ZoneMode>(), Ok(ZoneMode::Antifreeze));
        assert_matches!("holiday".parse::<ZoneMode>(), Err(Error::UnknownMode(..)));
        assert_eq!("Perm".parse::<HotWaterMode>(), Ok(HotWaterMode::Perm));
        assert_matches!(ZoneMode::try_from(3), Err(Error::InvalidModeCode(3)));
        assert_eq!(ZoneMode::decode(0x03), None);
    }

    #[test]
    fn hot_water_target_encoding() {
        assert_eq!(HOT_WATER_TARGET.encode(55.0), Ok(550));
        assert_eq!(HOT_WATER_TARGET.encode(47.0), Ok(450));
        assert_eq!(HOT_WATER_TARGET.encode(48.0), Ok(500));
        assert_eq!(HOT_WATER_TARGET.encode(83.0), Ok(800));
        assert_eq!(HOT_WATER_TARGET.encode(3.0), Ok(100));
        assert_matches!(HOT_WATER_TARGET.encode(f32::NAN), Err(Error::NotFinite(..)));
    }

    #[test]
    fn zone_target_encoding() {
        assert_eq!(ZONE_TARGET.encode(21.3), Ok(215));
        assert_eq!(ZONE_TARGET.encode(19.0), Ok(190));
        assert_eq!(ZONE_TARGET.encode(19.2), Ok(190));
        assert_eq!(ZONE_TARGET.encode(40.0), Ok(300));
        assert_eq!(ZONE_TARGET.encode(-4.0), Ok(50));
    }

    #[test]
    fn limits_pick_range_by_register() {
        let limits = Limits {
            antifreeze_target: TargetRange::new(5.0, 20.0, 0.5),
            ..Limits::default()
        };
        assert_eq!(
            limits.encode_target(Register::ZoneBAntifreezeTarget, 25.0),
            Some(Ok(200))
        );
        assert_eq!(
            limits.encode_target(Register::ZoneBDayTarget, 25.0),
            Some(Ok(250))
        );
        assert_eq!(
            limits.encode_target(Register::HotWaterNightTarget, 42.0),
            Some(Ok(400))
        );
        assert_eq!(limits.encode_target(Register::BoilerTemp, 25.0), None);
        assert_eq!(limits.encode_target(Register::ZoneCMode, 8.0), None);
    }

    #[test]
    fn register_set_length() {
        assert_matches!(
            RegisterSet::new(4, vec![]),
            Err(Error::RegisterSetLength(0))
        );
        assert!(RegisterSet::new(4, vec![1, 2, 3]).is_ok());
    }
}
