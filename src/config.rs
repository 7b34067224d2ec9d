//! Configuration management for herakles-latency-monitor.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// Default configuration constants
pub const DEFAULT_FPING_PATH: &str = "/usr/bin/fping";
pub const DEFAULT_INFLUX_PORT: u16 = 8086;
pub const DEFAULT_MEASUREMENT: &str = "latency";
pub const DEFAULT_RESTART_THRESHOLD: u32 = 30;
pub const DEFAULT_CONSECUTIVE_THRESHOLD: u32 = 3;

/// Default config file locations, searched in order.
pub const DEFAULT_CONFIG_PATHS: [&str; 4] = [
    "/etc/herakles/latency-monitor.yaml",
    "/etc/herakles/latency-monitor.yml",
    "./herakles-latency-monitor.yaml",
    "./herakles-latency-monitor.yml",
];

/// General monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Rolling windows, e.g. "60s", "5m", "1hr".
    #[serde(alias = "window-sizes")]
    pub window_sizes: Vec<String>,
    /// Value of the `source` tag; defaults to the hostname.
    #[serde(alias = "source-host")]
    pub source_host: Option<String>,
    /// Working directory for fping.
    #[serde(alias = "working-dir")]
    pub working_dir: Option<PathBuf>,
    /// Interval of the agent status log line (0 = off).
    #[serde(alias = "status-interval-seconds")]
    pub status_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_sizes: vec!["60s".into(), "5m".into(), "1hr".into()],
            source_host: None,
            working_dir: None,
            status_interval_seconds: 300,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log every sample and summary at info level.
    #[serde(alias = "enabled")]
    pub verbose: bool,
    /// Append logs to this file instead of stdout.
    #[serde(alias = "logfile", alias = "log-file")]
    pub log_file: Option<PathBuf>,
    /// off, error, warn, info, debug, trace
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,
}

/// InfluxDB v2 sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxDbConfig {
    /// Empty host disables the sink; records are printed instead.
    pub host: String,
    pub port: u16,
    /// "https" or "http"
    pub scheme: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub token: String,
    #[serde(alias = "batch-size")]
    pub batch_size: usize,
    #[serde(alias = "flush-interval-ms")]
    pub flush_interval_ms: u64,
    #[serde(alias = "retry-interval-ms")]
    pub retry_interval_ms: u64,
    #[serde(alias = "max-retries")]
    pub max_retries: u32,
    #[serde(alias = "queue-capacity")]
    pub queue_capacity: usize,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_INFLUX_PORT,
            scheme: "https".into(),
            org: String::new(),
            bucket: String::new(),
            measurement: DEFAULT_MEASUREMENT.into(),
            token: String::new(),
            batch_size: 20,
            flush_interval_ms: 1000,
            retry_interval_ms: 5000,
            max_retries: 5,
            queue_capacity: 10_000,
        }
    }
}

impl InfluxDbConfig {
    pub fn enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

/// fping invocation and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpingConfig {
    pub path: PathBuf,
    /// Arguments placed before the target list.
    pub args: Vec<String>,
    /// Loss percentage counted as high loss.
    #[serde(alias = "restart-threshold")]
    pub restart_threshold: u32,
    /// High-loss readings in a row before fping is restarted.
    #[serde(alias = "consecutive-threshold")]
    pub consecutive_threshold: u32,
    /// Pause between stopping and relaunching fping.
    #[serde(alias = "restart-grace-ms")]
    pub restart_grace_ms: u64,
}

impl Default for FpingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_FPING_PATH),
            args: vec!["-l".into(), "-D".into(), "-e".into()],
            restart_threshold: DEFAULT_RESTART_THRESHOLD,
            consecutive_threshold: DEFAULT_CONSECUTIVE_THRESHOLD,
            restart_grace_ms: 1000,
        }
    }
}

/// Targets to probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    pub hosts: Vec<String>,
    /// Optional file with one target per line.
    pub file: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "bupamon")]
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
    pub influxdb: InfluxDbConfig,
    pub fping: FpingConfig,
    pub targets: TargetsConfig,
}

impl Config {
    /// Parsed windows, ascending and without duplicates.
    pub fn windows(&self) -> Result<Vec<Duration>, Box<dyn std::error::Error>> {
        parse_windows(&self.monitor.window_sizes)
    }

    /// Configured source host, or the machine hostname.
    pub fn source_host(&self) -> String {
        match self.monitor.source_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Parses a window size such as "60s", "5m", "1h30m" or "1hr".
pub fn parse_window(s: &str) -> Result<Duration, String> {
    let d = humantime::parse_duration(s.trim())
        .map_err(|e| format!("Invalid window size '{}': {}", s, e))?;
    if d.is_zero() {
        return Err(format!("Invalid window size '{}': must be positive", s));
    }
    Ok(d)
}

pub fn parse_windows(sizes: &[String]) -> Result<Vec<Duration>, Box<dyn std::error::Error>> {
    let mut windows = sizes
        .iter()
        .map(|s| parse_window(s))
        .collect::<Result<Vec<_>, _>>()?;
    windows.sort();
    windows.dedup();
    Ok(windows)
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.fping.path.as_os_str().is_empty() {
        return Err("fping.path must not be empty".into());
    }

    cfg.windows()?;

    if cfg.fping.restart_threshold > 100 {
        return Err(format!(
            "fping.restart_threshold must be a percentage (0-100), got {}",
            cfg.fping.restart_threshold
        )
        .into());
    }
    if cfg.fping.consecutive_threshold == 0 {
        return Err("fping.consecutive_threshold must be at least 1".into());
    }

    if cfg.influxdb.enabled() {
        let influx = &cfg.influxdb;
        if influx.org.trim().is_empty() {
            return Err("influxdb.org must be set when influxdb.host is set".into());
        }
        if influx.bucket.trim().is_empty() {
            return Err("influxdb.bucket must be set when influxdb.host is set".into());
        }
        if !matches!(influx.scheme.as_str(), "http" | "https") {
            return Err(format!(
                "Invalid influxdb.scheme '{}', expected 'http' or 'https'",
                influx.scheme
            )
            .into());
        }
        if influx.batch_size == 0 {
            return Err("influxdb.batch_size must be at least 1".into());
        }
    }

    if cfg.influxdb.measurement.trim().is_empty() {
        return Err("influxdb.measurement must not be empty".into());
    }

    if let Some(level) = cfg.logging.log_level.as_deref() {
        if !matches!(level, "off" | "error" | "warn" | "info" | "debug" | "trace") {
            return Err(format!("Invalid logging.log_level '{}'", level).into());
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(path) = &args.fping_path {
        config.fping.path = path.clone();
    }
    if let Some(n) = args.restart_threshold {
        config.fping.restart_threshold = n;
    }
    if let Some(n) = args.consecutive_threshold {
        config.fping.consecutive_threshold = n;
    }

    // Extra targets are appended to the configured hosts
    config.targets.hosts.extend(args.target.iter().cloned());

    if args.verbose {
        config.logging.verbose = true;
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(format!("Config file not found: {}", p.display()).into());
            }
            p.to_path_buf()
        }
        None => match DEFAULT_CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
            Some(p) => p.to_path_buf(),
            None => return Ok(Config::default()),
        },
    };

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Renders configuration in the requested format.
pub fn render_config(
    config: &Config,
    format: &ConfigFormat,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", render_config(config, &format)?);
    Ok(())
}
