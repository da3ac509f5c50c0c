//! MQTT output of the daemon.
//!
//! Attributes are published retained under `<prefix>/<group>/<name>`, write
//! requests arrive on `<prefix>/<group>/<name>/set`.

use crate::config::{Config, MqttConfig};
use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use diematic_lib::{
    attributes::Attribute,
    bridge::{Bridge, Publisher},
    protocol::{self as proto, HotWaterMode, Register, Zone, ZoneMode},
    queue::WriteHandle,
    transport::SerialLine,
};
use log::*;
use paho_mqtt as mqtt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MQTT_APPENDIX_AVAILABILITY: &str = "availability";
const MQTT_APPENDIX_SET: &str = "set";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn get_topic(prefix: &str, appendix: &str) -> String {
    format!("{prefix}/{appendix}")
}

struct MqttPublisher {
    client: mqtt::Client,
    prefix: String,
    qos: i32,
}

impl Publisher for MqttPublisher {
    fn publish(&mut self, attributes: &[Attribute]) {
        for attribute in attributes {
            let topic = get_topic(&self.prefix, &format!("{}/{}", attribute.group, attribute.name));
            let payload = attribute
                .value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            let msg = mqtt::Message::new_retained(topic, payload, self.qos);
            if let Err(error) = self.client.publish(msg) {
                warn!("Cannot publish {}/{}: {error}", attribute.group, attribute.name);
            }
        }
    }
}

/// A write request received from the broker.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    ZoneMode(Zone, ZoneMode),
    HotWaterMode(HotWaterMode),
    Target(Register, f32),
    DateTime(NaiveDateTime),
}

impl Command {
    fn apply(self, writes: &WriteHandle) -> Result<(), proto::Error> {
        match self {
            Command::ZoneMode(zone, mode) => writes.set_zone_mode(zone, mode),
            Command::HotWaterMode(mode) => writes.set_hot_water_mode(mode),
            Command::Target(register, celsius) => writes.set_target(register, celsius)?,
            Command::DateTime(datetime) => writes.set_datetime(datetime),
        }
        Ok(())
    }
}

fn parse_zone(group: &str) -> Option<Zone> {
    match group {
        "zone_b" => Some(Zone::B),
        "zone_c" => Some(Zone::C),
        _ => None,
    }
}

fn parse_celsius(payload: &str) -> Result<f32> {
    payload
        .trim()
        .parse::<f32>()
        .with_context(|| format!("Invalid temperature '{payload}'"))
}

/// Maps `<prefix>/<group>/<name>/set` and its payload to a write request.
fn parse_command(prefix: &str, topic: &str, payload: &str) -> Result<Command> {
    let path = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_suffix(MQTT_APPENDIX_SET))
        .and_then(|rest| rest.strip_suffix('/'))
        .with_context(|| format!("Unexpected topic {topic}"))?;
    let Some((group, name)) = path.split_once('/') else {
        bail!("Unexpected topic {topic}");
    };

    Ok(match (group, name) {
        ("boiler", "date") => {
            let datetime = if payload.trim().eq_ignore_ascii_case("now") {
                chrono::Local::now().naive_local()
            } else {
                NaiveDateTime::parse_from_str(payload.trim(), DATETIME_FORMAT)
                    .with_context(|| format!("Invalid date '{payload}'"))?
            };
            Command::DateTime(datetime)
        }
        ("hotwater", "mode") => Command::HotWaterMode(payload.parse()?),
        ("hotwater", "day_temp") => {
            Command::Target(Register::HotWaterDayTarget, parse_celsius(payload)?)
        }
        ("hotwater", "night_temp") => {
            Command::Target(Register::HotWaterNightTarget, parse_celsius(payload)?)
        }
        (zone, name) => {
            let zone = parse_zone(zone).with_context(|| format!("Unknown group {group}"))?;
            match name {
                "mode" => Command::ZoneMode(zone, payload.parse()?),
                "day_temp" => Command::Target(zone.day_target_register(), parse_celsius(payload)?),
                "night_temp" => {
                    Command::Target(zone.night_target_register(), parse_celsius(payload)?)
                }
                "antifreeze_temp" => {
                    Command::Target(zone.antifreeze_target_register(), parse_celsius(payload)?)
                }
                _ => bail!("{group}/{name} is not writable"),
            }
        }
    })
}

fn connect(client: &mqtt::Client, config: &MqttConfig) -> Result<()> {
    let availability = get_topic(&config.topic_prefix, MQTT_APPENDIX_AVAILABILITY);
    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(Duration::from_secs(20))
        .clean_session(true)
        .will_message(mqtt::Message::new_retained(
            availability,
            "offline",
            config.qos(),
        ));
    if let Some(user_name) = &config.username {
        conn_builder = conn_builder.user_name(user_name)
    }
    if let Some(password) = &config.password {
        conn_builder = conn_builder.password(password)
    }
    client
        .connect(conn_builder.finalize())
        .with_context(|| format!("Mqtt client unable to connect to {}", config.url))?;
    subscribe(client, config)
}

fn subscribe(client: &mqtt::Client, config: &MqttConfig) -> Result<()> {
    let topic = get_topic(&config.topic_prefix, &format!("+/+/{MQTT_APPENDIX_SET}"));
    client
        .subscribe(topic, config.qos())
        .with_context(|| "Cannot subscribe to write requests")?;
    Ok(())
}

fn set_availability(client: &mqtt::Client, config: &MqttConfig, online: bool) -> Result<()> {
    let msg = mqtt::Message::new_retained(
        get_topic(&config.topic_prefix, MQTT_APPENDIX_AVAILABILITY),
        if online { "online" } else { "offline" },
        config.qos(),
    );
    client
        .publish(msg)
        .with_context(|| "Cannot publish mqtt message")
}

fn handle_message(config: &MqttConfig, writes: &WriteHandle, msg: &mqtt::Message) {
    let payload = msg.payload_str();
    debug!("Received {}: {payload}", msg.topic());
    let result = parse_command(&config.topic_prefix, msg.topic(), &payload)
        .and_then(|command| Ok(command.apply(writes)?));
    if let Err(error) = result {
        warn!("Ignoring write request on {}: {error:#}", msg.topic());
    }
}

/// Runs the bridge with MQTT output until `running` is cleared or the
/// worker fails.
pub fn run_daemon(line: SerialLine, config: &Config, running: &AtomicBool) -> Result<()> {
    let mqtt_config = config
        .mqtt
        .as_ref()
        .context("The config file has no mqtt section")?;

    let create_options = mqtt::CreateOptionsBuilder::new()
        .server_uri(mqtt_config.url.clone())
        .client_id(mqtt_config.client_id.clone())
        .finalize();
    let mut client =
        mqtt::Client::new(create_options).with_context(|| "Error creating mqtt client")?;
    // Use 5sec timeouts for sync calls.
    client.set_timeout(Duration::from_secs(5));
    let messages = client.start_consuming();
    connect(&client, mqtt_config)?;
    set_availability(&client, mqtt_config, true)?;

    let publisher = MqttPublisher {
        client: client.clone(),
        prefix: mqtt_config.topic_prefix.clone(),
        qos: mqtt_config.qos(),
    };
    let bridge = Bridge::new(line, config.bridge_settings()?, publisher);
    let writes = bridge.write_handle();
    let worker = bridge.spawn().context("Cannot start bridge worker")?;

    while running.load(Ordering::SeqCst) && !worker.is_finished() {
        match messages.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(msg)) => handle_message(mqtt_config, &writes, &msg),
            Ok(None) => {
                warn!("Lost connection to the broker, reconnecting");
                let reconnected = client
                    .reconnect()
                    .map_err(anyhow::Error::from)
                    .and_then(|_| subscribe(&client, mqtt_config));
                if let Err(error) = reconnected {
                    warn!("Reconnect failed: {error:#}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
            Err(_) => {}
        }
    }

    info!("Stopping...");
    let result = worker.stop().context("Bridge worker failed");
    set_availability(&client, mqtt_config, false)?;
    client
        .disconnect(None)
        .with_context(|| "Error disconnect mqtt client")?;
    result
}
