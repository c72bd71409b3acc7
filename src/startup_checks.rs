//! Startup requirement validation for iobrake.
//!
//! This module validates that the monitor can reach its counter sources
//! before the control loop starts.

use std::path::Path;
use tracing::{error, info, warn};

use crate::collectors::{cpustat, diskstats, fsusage, mounts, netdev};

/// Validate all runtime requirements for the given watch path
pub fn validate_requirements(watch_path: &Path) -> Result<(), ValidationError> {
    info!("🔍 Validating runtime requirements...");

    check_disk_counters()?;
    check_mount_table()?;
    check_cpu_counters();
    check_network_counters();
    check_watch_path(watch_path)?;

    info!("✅ All runtime requirements validated");
    Ok(())
}

/// Device write counters are the core signal; nothing works without them.
fn check_disk_counters() -> Result<(), ValidationError> {
    match diskstats::read_diskstats() {
        Ok(devices) => {
            info!("✅ /proc/diskstats: {} devices visible", devices.len());
            Ok(())
        }
        Err(e) => {
            error!("❌ Cannot read /proc/diskstats: {}", e);
            error!("   Throttling detection needs per-device write counters");
            Err(ValidationError::CounterSourceUnavailable(e))
        }
    }
}

/// Volume resolution walks the mount table on every cache refresh.
fn check_mount_table() -> Result<(), ValidationError> {
    match mounts::read_mounts() {
        Ok(entries) => {
            info!("✅ /proc/mounts: {} mount points visible", entries.len());
            Ok(())
        }
        Err(e) => {
            error!("❌ Cannot read /proc/mounts: {}", e);
            error!("   Paths cannot be mapped to their backing devices");
            Err(ValidationError::CounterSourceUnavailable(e))
        }
    }
}

fn check_cpu_counters() {
    match cpustat::read_cpu_times() {
        Ok(_) => info!("✅ /proc/stat: CPU counters readable"),
        Err(e) => {
            warn!("⚠️  Could not read /proc/stat: {}", e);
            warn!("   iowait will be reported as 0");
        }
    }
}

fn check_network_counters() {
    match netdev::read_netdev_stats() {
        Ok(stats) => info!("✅ /proc/net/dev: {} interfaces visible", stats.len()),
        Err(e) => {
            warn!("⚠️  Could not read /proc/net/dev: {}", e);
            warn!("   Network volumes will fall back to system-wide metrics");
        }
    }
}

fn check_watch_path(path: &Path) -> Result<(), ValidationError> {
    if !path.exists() {
        error!("❌ Watch path does not exist: {}", path.display());
        error!("   Pass an existing download directory with --path");
        return Err(ValidationError::WatchPathUnusable(format!(
            "{} does not exist",
            path.display()
        )));
    }

    match fsusage::read_fs_usage(path) {
        Ok(usage) => {
            info!(
                "✅ Watch path {}: {:.1}% of filesystem used",
                path.display(),
                usage.used_percent()
            );
        }
        Err(e) => {
            warn!("⚠️  statvfs failed for {}: {}", path.display(), e);
            warn!("   Disk usage will be reported as 0");
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Counter source unavailable: {0}")]
    CounterSourceUnavailable(String),

    #[error("Watch path unusable: {0}")]
    WatchPathUnusable(String),
}
