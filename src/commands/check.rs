//! Check command implementation.
//!
//! Validates configuration, the fping binary and the target list.

use herakles_latency_monitor::config::{validate_effective_config, Config};
use herakles_latency_monitor::startup_checks::check_fping_binary;
use herakles_latency_monitor::targets::resolve_targets;

/// Validates configuration and runtime requirements.
pub fn command_check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Herakles Latency Monitor - System Check");
    println!("==========================================");

    let mut all_ok = true;

    // Check configuration
    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => {
            println!("   ✅ Configuration is valid");
        }
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    match config.windows() {
        Ok(windows) if windows.is_empty() => {
            println!("   ⚠️  No window sizes configured - samples are kept without pruning");
        }
        Ok(windows) => {
            let names: Vec<String> = windows
                .iter()
                .map(|w| humantime::format_duration(*w).to_string())
                .collect();
            println!("   ✅ Windows: {}", names.join(", "));
        }
        Err(_) => {}
    }

    if config.influxdb.enabled() {
        println!(
            "   ✅ InfluxDB sink: {}://{}:{} (org={}, bucket={})",
            config.influxdb.scheme,
            config.influxdb.host,
            config.influxdb.port,
            config.influxdb.org,
            config.influxdb.bucket
        );
    } else {
        println!("   ⚠️  influxdb.host not set - records will be printed to stdout");
    }

    // Check fping binary
    println!("\n📡 Checking fping...");
    match check_fping_binary(&config.fping.path) {
        Ok(_) => println!("   ✅ {} is executable", config.fping.path.display()),
        Err(e) => {
            println!("   ❌ {}", e);
            all_ok = false;
        }
    }

    if nix::unistd::geteuid().is_root() {
        println!("   ✅ Running as root");
    } else {
        println!("   ⚠️  Not running as root - fping needs cap_net_raw or setuid root");
    }

    // Check targets
    println!("\n🎯 Checking targets...");
    let (targets, file_error) = resolve_targets(config);
    if let (Some(path), Some(e)) = (config.targets.file.as_ref(), file_error) {
        println!("   ⚠️  Cannot read target file {}: {}", path.display(), e);
    }
    if targets.is_empty() {
        println!("   ❌ No targets configured");
        all_ok = false;
    } else {
        println!("   ✅ {} targets", targets.len());
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - monitor is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}
