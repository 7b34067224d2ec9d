//! herakles-latency-monitor - version 0.1.0
//!
//! Continuous fping latency monitor with tracing logging.
//! This is the main entry point that starts the supervisor and handles subcommands.

mod commands;

use anyhow::{anyhow, Context};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};

use herakles_latency_monitor::cli::{Args, Commands, LogLevel};
use herakles_latency_monitor::config::{
    resolve_config, show_config, validate_effective_config, Config,
};
use herakles_latency_monitor::sink::{InfluxWriter, MetricSink, StdoutSink};
use herakles_latency_monitor::startup_checks;
use herakles_latency_monitor::targets::resolve_targets;
use herakles_latency_monitor::{
    AgentStats, MetricEmitter, ProbeSettings, ProbeSupervisor, TargetRegistry,
};

use commands::{command_check, command_config, command_parse};

/// Bound on the final InfluxDB flush during shutdown.
const SINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Effective log level: the CLI wins unless it was left at its default.
fn effective_log_level(config: &Config, args: &Args) -> LogLevel {
    if args.log_level != LogLevel::default() {
        return args.log_level.clone();
    }
    config
        .logging
        .log_level
        .as_deref()
        .and_then(LogLevel::from_name)
        .unwrap_or_default()
}

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config, args: &Args) {
    let level = effective_log_level(config, args);
    let filter = match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let log_file = config.logging.log_file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("⚠️  Cannot open log file {}: {} - logging to stdout", path.display(), e);
                None
            }
        }
    });

    let result = match log_file {
        Some(file) => tracing::subscriber::set_global_default(
            builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
        ),
        None => tracing::subscriber::set_global_default(builder.finish()),
    };
    if let Err(e) = result {
        eprintln!("⚠️  Failed to set tracing subscriber: {}", e);
    }

    info!("Logging initialized with level: {:?}", level);
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Periodic agent status line.
fn spawn_status_logger(stats: Arc<AgentStats>, interval_secs: u64) {
    if interval_secs == 0 {
        debug!("Status logging disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let s = stats.snapshot();
            info!(
                uptime_seconds = s.uptime_seconds,
                samples = s.samples_parsed,
                summaries = s.summaries_parsed,
                ignored = s.lines_ignored,
                unknown_targets = s.unknown_targets,
                high_loss = s.high_loss_readings,
                restarts = s.restarts,
                unexpected_exits = s.unexpected_exits,
                points_written = s.points_written,
                points_dropped = s.points_dropped,
                write_failures = s.write_failures,
                write_ms_avg = s.write_duration_ms_avg,
                "Agent status"
            );
        }
    });
}

/// Resolves until SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Runs the monitor until a shutdown signal arrives.
async fn run_monitor(config: Config, args: &Args) -> anyhow::Result<()> {
    info!("Starting herakles-latency-monitor");

    // Validate runtime requirements, warn only
    if let Err(e) = startup_checks::validate_requirements(&config) {
        error!("❌ Startup validation failed: {}", e);
        error!("   The monitor will start but fping may not run correctly!");
    }

    let (targets, file_error) = resolve_targets(&config);
    if let (Some(path), Some(e)) = (config.targets.file.as_ref(), file_error) {
        let e = anyhow::Error::new(e)
            .context(format!("failed to load targets from {}", path.display()));
        warn!("{:#} - continuing with configured hosts", e);
    }
    if targets.is_empty() {
        return Err(anyhow!(
            "no targets configured (targets.hosts, targets.file or --target)"
        ));
    }

    let windows = config
        .windows()
        .map_err(|e| anyhow!("invalid window sizes: {}", e))?;
    if windows.is_empty() {
        warn!("No window sizes configured - samples are never pruned and memory grows without bound");
    }
    info!(
        targets = targets.len(),
        windows = ?windows,
        "Monitoring targets"
    );

    let stats = Arc::new(AgentStats::new());

    let influx = if args.dry_run || !config.influxdb.enabled() {
        if !args.dry_run {
            warn!("influxdb.host not set - printing records to stdout");
        }
        None
    } else {
        let writer = InfluxWriter::new(&config.influxdb, Arc::clone(&stats))
            .context("failed to create InfluxDB writer")?;
        Some(Arc::new(writer))
    };
    let sink: Arc<dyn MetricSink> = match &influx {
        Some(writer) => Arc::clone(writer) as Arc<dyn MetricSink>,
        None => Arc::new(StdoutSink),
    };

    let registry = Arc::new(TargetRegistry::new(targets, &windows));
    let emitter = MetricEmitter::new(sink, config.influxdb.measurement.as_str(), config.source_host());
    let supervisor = ProbeSupervisor::new(
        ProbeSettings::from_config(&config),
        registry,
        emitter,
        Arc::clone(&stats),
    );

    supervisor.start().context("failed to start fping")?;
    spawn_status_logger(Arc::clone(&stats), config.monitor.status_interval_seconds);

    shutdown_signal().await;

    supervisor.shutdown().await;
    if let Some(writer) = influx {
        if let Err(e) = writer.shutdown(SINK_SHUTDOWN_TIMEOUT).await {
            warn!("Final InfluxDB flush failed: {}", e);
        }
    }

    let s = stats.snapshot();
    info!(
        samples = s.samples_parsed,
        summaries = s.summaries_parsed,
        restarts = s.restarts,
        points_written = s.points_written,
        "herakles-latency-monitor stopped gracefully"
    );
    Ok(())
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format.clone());
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        if let Commands::Config {
            output,
            format,
            commented,
        } = command
        {
            return command_config(output.clone(), format.clone(), *commented);
        }

        let config = load_validated_config(&args)?;

        return match command {
            Commands::Check => command_check(&config),
            Commands::Parse { input, json } => command_parse(input.clone(), *json, &config),
            Commands::Config { .. } => unreachable!("Config handled above"),
        };
    }

    // Load configuration for monitor mode
    let config = load_validated_config(&args)?;

    setup_logging(&config, &args);

    run_monitor(config, &args).await?;
    Ok(())
}
