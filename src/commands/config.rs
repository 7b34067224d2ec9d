//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;

use herakles_latency_monitor::cli::ConfigFormat;
use herakles_latency_monitor::config::{render_config, Config};

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("herakles-latency-monitor.yaml"),
    };

    let mut content = render_config(&config, &format)?;
    if commented && matches!(format, ConfigFormat::Yaml) {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles Latency Monitor Configuration
# ======================================
#
# Monitor
# -------
# monitor:
#   window_sizes: ["60s", "5m", "1hr"]  # Rolling windows (humantime syntax)
#   source_host: null                   # "source" tag (null = hostname)
#   working_dir: null                   # Working directory for fping
#   status_interval_seconds: 300        # Agent status log interval (0 = off)
#
# Logging
# -------
# logging:
#   verbose: false               # Log every sample and summary at info level
#   log_file: null               # Log file path (null = stdout)
#   log_level: null              # off, error, warn, info, debug, trace
#
# InfluxDB v2
# -----------
# influxdb:
#   host: ""                     # Empty = print line protocol to stdout
#   port: 8086
#   scheme: "https"              # "http" or "https"
#   org: ""
#   bucket: ""
#   measurement: "latency"       # Summaries go to "<measurement>_summary"
#   token: ""
#   batch_size: 20               # Points per write request
#   flush_interval_ms: 1000      # Periodic flush
#   retry_interval_ms: 5000      # Pause between retries of a failed batch
#   max_retries: 5               # Retries before a batch is dropped
#   queue_capacity: 10000        # Points buffered before new ones are dropped
#
# fping
# -----
# fping:
#   path: "/usr/bin/fping"
#   args: ["-l", "-D", "-e"]     # Placed before the target list
#   restart_threshold: 30        # Loss percentage counted as high loss
#   consecutive_threshold: 3     # High-loss readings in a row before restart
#   restart_grace_ms: 1000       # Pause between stopping and relaunching fping
#
# Targets
# -------
# targets:
#   hosts: ["10.0.0.1", "gw.example.net"]
#   file: "/etc/herakles/targets.txt"  # One target per line, # comments
"#;

    format!("{comments}\n{yaml}")
}
