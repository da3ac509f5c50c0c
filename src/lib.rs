//! A library for sharing the RS-485 bus of a De Dietrich Diematic 3 heating
//! regulator with its wired room unit.
//!
//! The regulator is a Modbus RTU slave, and the room unit is already a master
//! on the same half-duplex line. This crate listens to the line, waits until
//! the room unit has gone quiet, and only then reads and writes regulator
//! registers itself.
//!
//! ## Building blocks
//!
//! - [`frame`]: Modbus RTU frames and CRC-16 for Read Holding Registers and
//!   Write Multiple Registers.
//! - [`protocol`]: the regulator's register table, decoders, mode bitfields
//!   and target encoders.
//! - [`transport`]: the serial line ([`transport::SerialLine`]) behind the
//!   [`transport::Transport`] trait.
//! - [`transaction`]: blocking read/write exchanges and the mode-update sequence.
//! - [`arbiter`]: the INIT/SLAVE/MASTER bus-sharing state machine.
//! - [`queue`]: write intents submitted from other threads.
//! - [`watchdog`]: invalidation of stale data.
//! - [`bridge`]: the worker loop that ties everything together.
//!
//! ## Quick Start
//!
//! ```no_run
//! use diematic_lib::{
//!     attributes::Attribute,
//!     bridge::{Bridge, BridgeSettings},
//!     protocol::{Zone, ZoneMode},
//!     transport::{LineSettings, SerialLine},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let line = SerialLine::open(LineSettings::default())?;
//!     let bridge = Bridge::new(line, BridgeSettings::default(), |attributes: &[Attribute]| {
//!         for attribute in attributes {
//!             println!("{attribute}");
//!         }
//!     });
//!     let writes = bridge.write_handle();
//!     let worker = bridge.spawn()?;
//!
//!     writes.set_zone_mode(Zone::C, ZoneMode::PermDay);
//!     std::thread::sleep(std::time::Duration::from_secs(120));
//!
//!     worker.stop()?;
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod attributes;
pub mod bridge;
pub mod clock;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod transaction;
pub mod transport;
pub mod watchdog;
