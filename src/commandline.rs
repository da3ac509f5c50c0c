use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every published attribute set to the standard output (console).
    Console,
    /// Publish attributes to an MQTT broker and accept write requests from it.
    /// The broker is configured in the `mqtt` section of the config file.
    #[cfg(feature = "mqtt")]
    #[clap(verbatim_doc_comment)]
    Mqtt,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the bridge: share the bus with the room unit, read the regulator
    /// periodically and forward write requests to it.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Passively listen to the bus and print the decoded frames.
    /// Never transmits, so it is safe to run next to the room unit.
    #[clap(verbatim_doc_comment)]
    Sniff {
        /// Stop after this long (e.g., "30s", "5m"). Runs until Ctrl-C otherwise.
        #[arg(value_parser = humantime::parse_duration, short = 't', long, verbatim_doc_comment)]
        duration: Option<Duration>,
    },
}

const fn about_text() -> &'static str {
    "Diematic bridge - Share the RS-485 bus of a Diematic 3 regulator with its room unit."
}

#[derive(Parser, Debug)]
#[command(
    name = "diematic",
    author,
    version,
    about = about_text(),
    long_about = None,
    propagate_version = true
)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Configuration file.
    /// Defaults to "./config.yml", then the user configuration directory.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Serial port device name, overrides the config file.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,
}
