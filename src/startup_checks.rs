//! Startup requirement validation for herakles-latency-monitor.
//!
//! This module validates that the fping binary is usable and that the monitor
//! has the privileges ICMP probing needs before starting.

use nix::unistd::geteuid;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Validate all runtime requirements
pub fn validate_requirements(config: &Config) -> Result<(), ValidationError> {
    info!("🔍 Validating runtime requirements...");

    check_fping_binary(&config.fping.path)?;
    check_user_privileges();

    if let Some(dir) = &config.monitor.working_dir {
        check_working_dir(dir)?;
    }

    info!("✅ All runtime requirements validated");
    Ok(())
}

/// Check that the probe binary exists and carries an execute bit
pub fn check_fping_binary(path: &Path) -> Result<(), ValidationError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!("❌ fping not found at {}", path.display());
            error!("   Solution: install fping or set fping.path / --fping-path");
            return Err(ValidationError::FpingNotFound(path.display().to_string()));
        }
        Err(e) => {
            error!("❌ Cannot access {}: {}", path.display(), e);
            return Err(ValidationError::FpingNotAccessible(e.to_string()));
        }
    };

    if !metadata.is_file() {
        error!("❌ {} is not a regular file", path.display());
        return Err(ValidationError::FpingNotExecutable(path.display().to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o111 == 0 {
            error!("❌ {} is not executable", path.display());
            return Err(ValidationError::FpingNotExecutable(path.display().to_string()));
        }
        // setuid root fping can open raw sockets for unprivileged users
        if mode & 0o4000 != 0 {
            debug!("fping has the setuid bit set");
        }
    }

    info!("✅ fping found at {}", path.display());
    Ok(())
}

/// Check if running with sufficient privileges
fn check_user_privileges() {
    if !geteuid().is_root() {
        warn!("⚠️  Not running as root - fping needs raw socket access for ICMP");
        warn!("   Recommendation: run as root, or grant fping cap_net_raw / setuid root");
        // Not an error - continue but warn
    } else {
        info!("✅ Running as root (uid=0)");
    }
}

fn check_working_dir(dir: &Path) -> Result<(), ValidationError> {
    if dir.is_dir() {
        debug!("Working directory {} exists", dir.display());
        Ok(())
    } else {
        error!("❌ Working directory {} does not exist", dir.display());
        Err(ValidationError::WorkingDirMissing(dir.display().to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("fping binary not found: {0}")]
    FpingNotFound(String),

    #[error("fping binary not accessible: {0}")]
    FpingNotAccessible(String),

    #[error("fping binary not executable: {0}")]
    FpingNotExecutable(String),

    #[error("working directory not found: {0}")]
    WorkingDirMissing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_fping_binary(&dir.path().join("fping")).unwrap_err();
        assert!(matches!(err, ValidationError::FpingNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_binary() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile::NamedTempFile::new().unwrap();
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_fping_binary(file.path()).unwrap_err();
        assert!(matches!(err, ValidationError::FpingNotExecutable(_)));

        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check_fping_binary(file.path()).is_ok());
    }

    #[test]
    fn test_directory_is_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_fping_binary(dir.path()).unwrap_err();
        assert!(matches!(err, ValidationError::FpingNotExecutable(_)));
    }

    #[test]
    fn test_missing_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.fping.path = "/bin/sh".into();
        cfg.monitor.working_dir = Some(dir.path().join("nope"));
        assert!(matches!(
            validate_requirements(&cfg),
            Err(ValidationError::WorkingDirMissing(_))
        ));
    }
}
