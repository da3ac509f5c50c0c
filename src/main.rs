//! Diematic bridge CLI
//!
//! Runs a bridge between a De Dietrich Diematic 3 heating regulator and the
//! outside world, sharing the regulator's RS-485 bus with its room unit.
//!
//! This tool allows users to:
//! - Run the bridge in daemon mode and either print the regulator values to
//!   the console or publish them to an MQTT broker (feature `mqtt`), where
//!   write requests for targets and modes are accepted as well.
//! - Sniff the bus and print the decoded traffic without ever transmitting.
//!
//! The CLI leverages the `diematic_lib` crate for the protocol and the bridge worker.

use anyhow::{Context, Result};
use clap::Parser;
use diematic_lib::{
    attributes::Attribute,
    bridge::Bridge,
    frame::{self, ParsedRequest},
    protocol::Register,
    transaction::Timings,
    transport::{SerialLine, Transport},
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod commandline;
mod config;
#[cfg(feature = "mqtt")]
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Sets the returned flag to `false` on Ctrl-C or SIGTERM.
fn running_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        trace!("Received Ctrl-C")
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(running)
}

fn open_line(config: &config::Config) -> Result<SerialLine> {
    let settings = config.line_settings();
    SerialLine::open(settings.clone())
        .with_context(|| format!("Cannot open serial port {}", settings.device))
}

fn print_attributes(attributes: &[Attribute]) {
    println!("---");
    for attribute in attributes {
        println!("{attribute}");
    }
}

fn handle_daemon_console(config: &config::Config, running: &AtomicBool) -> Result<()> {
    let bridge = Bridge::new(
        open_line(config)?,
        config.bridge_settings()?,
        print_attributes,
    );
    let worker = bridge.spawn().context("Cannot start bridge worker")?;
    while running.load(Ordering::SeqCst) && !worker.is_finished() {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("Stopping...");
    worker.stop().context("Bridge worker failed")
}

/// Prints the registers of a read answer, by name where the register is known.
fn print_answer(values: &std::collections::BTreeMap<u16, u16>) {
    for (address, raw) in values {
        match Register::from_address(*address) {
            Some(register) => println!("  {register} = 0x{raw:04X} {:?}", register.decode(*raw)),
            None => println!("  {address} = 0x{raw:04X}"),
        }
    }
}

fn handle_sniff(
    config: &config::Config,
    duration: Option<Duration>,
    running: &AtomicBool,
) -> Result<()> {
    let mut line = open_line(config)?;
    let listen = Timings::default().listen;
    let started = Instant::now();
    let mut last_read: Option<(u8, u16, u16)> = None;
    info!("Sniffing on {}", line.settings().device);

    while running.load(Ordering::SeqCst)
        && duration.is_none_or(|duration| started.elapsed() < duration)
    {
        let received = line.receive(listen).context("Cannot read serial line")?;
        if received.is_empty() {
            continue;
        }
        match frame::parse_slave_request(&received) {
            Ok(request) => {
                println!("Request {request}");
                if let ParsedRequest::Write { values, .. } = &request {
                    print_answer(values);
                }
                last_read = match request {
                    ParsedRequest::Read {
                        slave,
                        start,
                        count,
                    } => Some((slave, start, count)),
                    ParsedRequest::Write { .. } => None,
                };
                continue;
            }
            Err(error) => trace!("Not a request: {error}"),
        }
        let answer = last_read.take().and_then(|(slave, start, count)| {
            frame::parse_answer(&received, slave, frame::READ_HOLDING_REGISTERS, start, count).ok()
        });
        match answer {
            Some(values) => {
                println!("Answer:");
                print_answer(&values);
            }
            None => println!("Frame {received:02X?}"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Diematic bridge started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Configuration, with the command line taking precedence
    let mut config = config::get_config(args.config.as_deref())?;
    if let Some(device) = &args.device {
        config.modbus.device = device.clone();
    }
    trace!("Config: {config:?}");

    let running = running_flag()?;

    // 3. Execute the command
    match &args.command {
        commandline::CliCommands::Daemon { output } => {
            info!("Starting daemon mode: output={output:?}");
            match output {
                commandline::DaemonOutput::Console => handle_daemon_console(&config, &running)?,
                #[cfg(feature = "mqtt")]
                commandline::DaemonOutput::Mqtt => {
                    let line = open_line(&config)?;
                    mqtt::run_daemon(line, &config, &running)?;
                }
            }
        }
        commandline::CliCommands::Sniff { duration } => {
            handle_sniff(&config, *duration, &running)?;
        }
    }

    Ok(())
}
