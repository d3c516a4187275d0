//! # Command-Line Interface Module
//!
//! Argument parsing for the broker binary, using the `clap` derive API.
//! The only required argument is the configuration file path; everything
//! else tweaks logging or overrides the configured listen endpoint.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Run with a configuration file
//! nsb-broker nsb.toml
//!
//! # Override the listen endpoint and raise log verbosity
//! nsb-broker nsb.toml --listen-port 50000 -vv
//!
//! # Script-friendly: quiet stdout, detailed log on stderr
//! nsb-broker nsb.toml -q --log-file stderr
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

use crate::config::BrokerConfig;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the broker configuration file (TOML)
    ///
    /// The file carries the system mode (pull/push), the simulator
    /// topology, and the optional payload-store connection details. A
    /// missing or unparsable file is a fatal startup error.
    pub config: PathBuf,

    /// Override the configured listen address
    #[arg(long, help_heading = "Endpoint")]
    pub listen_address: Option<String>,

    /// Override the configured listen port
    #[arg(long, help_heading = "Endpoint")]
    pub listen_port: Option<u16>,

    /// Silence user-facing informational output on stdout
    ///
    /// Diagnostic logs still go to the log file (or stderr).
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times to increase detail:
    ///  (default): info
    ///  -v: debug
    ///  -vv: trace
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Detailed log destination: a file path, or the literal "stderr"
    ///
    /// Defaults to a daily-rolling nsb_broker.log in the working
    /// directory.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

impl Args {
    /// Apply command-line endpoint overrides to a loaded configuration
    pub fn apply_overrides(&self, config: &mut BrokerConfig) {
        if let Some(address) = &self.listen_address {
            config.listen_address = address.clone();
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
    }
}
