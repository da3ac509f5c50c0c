use anyhow::{Context, Result, bail};
use diematic_lib::{
    bridge::{BridgeSettings, DEFAULT_SLAVE},
    protocol::{Limits, TargetRange, ZONE_TARGET},
    transaction::Timings,
    transport::{DEFAULT_BAUD_RATE, LineSettings},
    watchdog::DEFAULT_PERIOD,
};
use directories_next::ProjectDirs;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Modbus address of the regulator.
    #[serde(default = "default_address")]
    pub address: u8,
    #[serde(default = "default_frame_gap", with = "humantime_serde")]
    pub frame_gap: Duration,
}

fn default_device() -> String {
    LineSettings::default().device
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_address() -> u8 {
    DEFAULT_SLAVE
}

fn default_frame_gap() -> Duration {
    LineSettings::default().frame_gap
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            address: default_address(),
            frame_gap: default_frame_gap(),
        }
    }
}

/// A target temperature bound in °C, quantized in half degrees.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TargetBounds {
    pub min: f32,
    pub max: f32,
}

impl TargetBounds {
    fn range(&self) -> Result<TargetRange> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min > self.max {
            bail!("Invalid target range {}..={} °C", self.min, self.max);
        }
        // Targets are sent as unsigned tenths of a degree.
        if self.min < 0.0 {
            bail!("Target range {}..={} °C goes below zero", self.min, self.max);
        }
        Ok(TargetRange::new(self.min, self.max, ZONE_TARGET.step))
    }
}

fn default_bounds() -> TargetBounds {
    TargetBounds {
        min: ZONE_TARGET.min,
        max: ZONE_TARGET.max,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoilerConfig {
    /// Refresh period of the published values.
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    #[serde(default = "default_bounds")]
    pub zone_target: TargetBounds,
    #[serde(default = "default_bounds")]
    pub antifreeze_target: TargetBounds,
}

fn default_period() -> Duration {
    DEFAULT_PERIOD
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            zone_target: default_bounds(),
            antifreeze_target: default_bounds(),
        }
    }
}

#[cfg_attr(not(feature = "mqtt"), allow(dead_code))]
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Quality of service code to use
    #[serde(default = "default_qos")]
    qos: u8,
}

fn default_client_id() -> String {
    String::from("diematic")
}

fn default_topic_prefix() -> String {
    String::from("diematic")
}

fn default_qos() -> u8 {
    0
}

#[cfg_attr(not(feature = "mqtt"), allow(dead_code))]
impl MqttConfig {
    pub fn qos(&self) -> i32 {
        i32::from(self.qos.min(2))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub boiler: BoilerConfig,
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            device: self.modbus.device.clone(),
            baud_rate: self.modbus.baud_rate,
            frame_gap: self.modbus.frame_gap,
        }
    }

    pub fn bridge_settings(&self) -> Result<BridgeSettings> {
        let limits = Limits {
            zone_target: self.boiler.zone_target.range().context("zone_target")?,
            antifreeze_target: self
                .boiler
                .antifreeze_target
                .range()
                .context("antifreeze_target")?,
        };
        Ok(BridgeSettings {
            slave: self.modbus.address,
            period: self.boiler.period,
            limits,
            timings: Timings::default(),
        })
    }
}

/// Loads the configuration, falling back to the defaults when no file exists
/// and none was given explicitly.
pub fn get_config(explicit: Option<&Path>) -> Result<Config> {
    let Some(path) = get_config_file_path(explicit) else {
        log::debug!("No config file found, using defaults");
        return Ok(Config::default());
    };
    log::debug!("Loading config file from {path:?}");
    let config_file =
        File::open(&path).with_context(|| format!("Cannot open config file {path:?}"))?;
    let config: Config = serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Cannot parse config file {path:?}"))?;
    Ok(config)
}

fn get_config_file_path(explicit: Option<&Path>) -> Option<PathBuf> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    match (explicit, get_user_dir_path()) {
        (Some(config), _) => Some(config.to_path_buf()),
        (None, _) if default_file.exists() => Some(default_file.to_path_buf()),
        (None, Some(config)) if config.exists() => Some(config),
        _ => None,
    }
}

fn get_user_dir_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "diematic", "diematic-bridge")
        .map(|project_dirs| project_dirs.config_dir().join(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_for_missing_sections() {
        let config: Config = serde_yaml::from_str("modbus:\n  device: /dev/ttyAMA0\n").unwrap();
        assert_eq!(config.modbus.device, "/dev/ttyAMA0");
        assert_eq!(config.modbus.address, 0x0A);
        assert_eq!(config.boiler.period, Duration::from_secs(60));
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn durations_and_bounds() {
        let yaml = "\
modbus:
  frame_gap: 30ms
boiler:
  period: 2m
  antifreeze_target:
    min: 5
    max: 20
mqtt:
  url: tcp://localhost:1883
  qos: 1
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.modbus.frame_gap, Duration::from_millis(30));
        let settings = config.bridge_settings().unwrap();
        assert_eq!(settings.period, Duration::from_secs(120));
        assert_eq!(settings.limits.antifreeze_target.max, 20.0);
        assert_eq!(settings.limits.zone_target.max, 30.0);
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.qos(), 1);
        assert_eq!(mqtt.topic_prefix, "diematic");
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let yaml = "boiler:\n  zone_target:\n    min: 30\n    max: 5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.bridge_settings().is_err());
    }

    #[test]
    fn negative_bounds_are_rejected() {
        let yaml = "boiler:\n  antifreeze_target:\n    min: -5\n    max: 20\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let error = config.bridge_settings().unwrap_err();
        assert!(error.to_string().contains("below zero"), "{error}");
    }
}
