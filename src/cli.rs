//! CLI arguments and subcommands for herakles-latency-monitor.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }
}

/// Configuration format options for output
#[derive(Debug, Clone, Default, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug, Default)]
#[command(
    name = "herakles-latency-monitor",
    about = "Continuous fping latency monitor with rolling statistics and InfluxDB export",
    long_about = "Continuous fping latency monitor with rolling statistics and InfluxDB export.\n\n\
                  Drives fping in loop mode against a set of targets, keeps rolling min/avg/max \
                  per target over configurable windows, writes per-sample and per-run summary \
                  records to InfluxDB v2 and restarts fping on sustained packet loss.",
    author = "Michael Moll <exporter@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/cansp-dev/herakles-latency-monitor — More info: https://www.herakles.now"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Print line protocol to stdout instead of writing to InfluxDB
    #[arg(long)]
    pub dry_run: bool,

    /// Log every sample and summary
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Additional target (repeatable)
    #[arg(short = 't', long = "target")]
    pub target: Vec<String>,

    /// Override fping binary path
    #[arg(long)]
    pub fping_path: Option<PathBuf>,

    /// Loss percentage counted as high loss
    #[arg(long)]
    pub restart_threshold: Option<u32>,

    /// High-loss readings in a row before fping is restarted
    #[arg(long)]
    pub consecutive_threshold: Option<u32>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration, fping and targets
    Check,

    /// Generate configuration files
    Config {
        /// Output file path ("-" for stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Parse captured fping output and print the records it would produce
    Parse {
        /// Input file (stdin if omitted)
        input: Option<PathBuf>,

        /// Print events as JSON instead of line protocol
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repeated_targets() {
        let args = Args::parse_from([
            "herakles-latency-monitor",
            "-t",
            "10.0.0.1",
            "--target",
            "gw.example.net",
            "--restart-threshold",
            "50",
        ]);
        assert_eq!(args.target, vec!["10.0.0.1", "gw.example.net"]);
        assert_eq!(args.restart_threshold, Some(50));
        assert_eq!(args.log_level, LogLevel::Info);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_parse_subcommand() {
        let args = Args::parse_from(["herakles-latency-monitor", "parse", "capture.txt", "--json"]);
        match args.command {
            Some(Commands::Parse { input, json }) => {
                assert_eq!(input, Some(PathBuf::from("capture.txt")));
                assert!(json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level_from_name() {
        assert_eq!(LogLevel::from_name("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_name("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_name("loud"), None);
    }
}
