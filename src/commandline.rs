use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use jkbms_lib::config::EngineConfig;
use std::time::Duration;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Connect to the configured devices and periodically print their latest data
    Monitor {
        /// Interval for printing the collected data (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Reassemble hex encoded notification chunks and print the decoded frame
    Decode {
        /// One hex string per notification (e.g., 55AAEB9002...)
        #[arg(required = true)]
        chunks: Vec<String>,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Print the command frame for a register write
    Encode {
        /// Register address (e.g., 0x1D)
        #[arg(value_parser = maybe_hex::<u8>)]
        register: u8,
        /// Value to write (e.g., 1 or 0x01)
        #[arg(value_parser = maybe_hex::<u32>)]
        value: u32,
        /// Length parameter of the command
        #[arg(long, short, value_parser = maybe_hex::<u8>, default_value = "4")]
        length: u8,
    },
}

const fn about_text() -> &'static str {
    "jk bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Configuration file (YAML)
    #[arg(short, long, default_value_t = EngineConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config_file: String,

    /// Device address to connect to (e.g., c8:47:80:31:9b:02), can be repeated
    #[arg(short, long)]
    pub device: Vec<String>,

    #[command(subcommand)]
    pub command: CliCommands,
}
