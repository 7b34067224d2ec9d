//! CLI command implementations for herakles-latency-monitor.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: Configuration, fping and target validation
//! - `config`: Configuration file generation
//! - `parse`: Offline parsing of captured fping output

pub mod check;
pub mod config;
pub mod parse;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use parse::command_parse;
