//! Check command implementation.
//!
//! Validates counter sources, volume resolution, and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use iobrake::collectors::{cpustat, diskstats, fsusage, mounts, netdev};
use iobrake::config::{validate_effective_config, Config, DEFAULT_WATCH_PATH};
use iobrake::volume::{StorageType, VolumeDetector};

/// Validates system requirements and configuration.
pub fn command_check(
    volume: bool,
    counters: bool,
    all: bool,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 iobrake - System Check");
    println!("=========================");

    // Bare `check` runs everything
    let check_all = all || (!volume && !counters);
    let mut all_ok = true;

    let watch_path = config
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WATCH_PATH));

    // Check kernel counter sources
    if counters || check_all {
        println!("\n📁 Checking kernel counter sources...");

        match diskstats::read_diskstats() {
            Ok(devices) => {
                println!("   ✅ /proc/diskstats: {} devices", devices.len());
            }
            Err(e) => {
                println!("   ❌ /proc/diskstats: {}", e);
                all_ok = false;
            }
        }

        match mounts::read_mounts() {
            Ok(entries) => {
                println!("   ✅ /proc/mounts: {} mount points", entries.len());
            }
            Err(e) => {
                println!("   ❌ /proc/mounts: {}", e);
                all_ok = false;
            }
        }

        match cpustat::read_cpu_times() {
            Ok(_) => println!("   ✅ /proc/stat: CPU counters readable"),
            Err(e) => println!("   ⚠️  /proc/stat: {} (iowait reported as 0)", e),
        }

        match netdev::read_netdev_stats() {
            Ok(stats) => println!("   ✅ /proc/net/dev: {} interfaces", stats.len()),
            Err(e) => println!("   ⚠️  /proc/net/dev: {} (network fallback disabled)", e),
        }
    }

    // Check volume resolution for the watch path
    if volume || check_all {
        println!("\n💾 Checking volume resolution...");

        if !watch_path.exists() {
            println!("   ❌ Watch path does not exist: {}", watch_path.display());
            all_ok = false;
        } else {
            let detector = Arc::new(VolumeDetector::new());
            let info = detector.detect_volume(&watch_path);

            println!("   ✅ Path: {}", info.path.display());
            println!("      ├─ Device: {}", info.device);
            println!("      ├─ Mountpoint: {}", info.mountpoint.display());
            println!("      ├─ Filesystem: {}", info.fstype);
            println!("      ├─ Storage type: {}", info.storage_type);
            println!(
                "      └─ Remote: {}",
                if info.is_remote { "yes" } else { "no" }
            );

            if info.storage_type == StorageType::Unknown {
                println!("   ⚠️  Storage type unknown - system-wide fallback will be used");
            }

            match &info.device_name {
                Some(device) => match diskstats::read_device_counters(device) {
                    Ok(_) => {
                        println!("   ✅ Write counters available for device '{}'", device);
                    }
                    Err(e) => {
                        println!("   ⚠️  No write counters for '{}': {}", device, e);
                        println!("      Throttling detection falls back to system metrics");
                    }
                },
                None => {
                    if info.is_remote {
                        println!("   ℹ️  Remote volume - network metrics will be used");
                    } else {
                        println!("   ⚠️  No block device behind this path");
                        println!("      Throttling detection falls back to system metrics");
                    }
                }
            }

            match fsusage::disk_usage_percent(&watch_path) {
                Ok(percent) => println!("   ✅ Filesystem usage: {:.1}%", percent),
                Err(e) => println!("   ⚠️  statvfs failed: {}", e),
            }
        }
    }

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

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - system is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}
