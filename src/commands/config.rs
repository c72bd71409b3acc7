//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use iobrake::config::Config;

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("iobrake.yaml"),
    };

    let content = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&config)?,
        ConfigFormat::Toml => toml::to_string_pretty(&config)?,
        ConfigFormat::Yaml => {
            let mut content = serde_yaml::to_string(&config)?;
            if commented {
                content = add_config_comments(content);
            }
            content
        }
    };

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
    let comments = r#"# iobrake Configuration
# =====================
#
# Watch Target
# ------------
# path: "."                          # Download directory to watch
#
# Feature Flags
# -------------
# enable_volume_specific_monitoring: true  # Resolve paths to their backing volume
# enable_dynamic_throttling: true          # Per-device detection instead of static thresholds
#
# Sampling
# --------
# sample_interval_seconds: 5.0       # Control loop cadence
#
# Speed Bounds (bytes per second)
# -------------------------------
# min_speed_bytes_per_sec: 1048576         # Download floor (1 MB/s)
# max_speed_bytes_per_sec: 0               # Download ceiling (0 = unlimited)
# min_upload_speed_bytes_per_sec: 5242880  # Upload floor (5 MB/s)
# max_upload_speed_bytes_per_sec: 0        # Upload ceiling (0 = unlimited)
#
# Static Stress Thresholds (values <= 0 exclude a factor)
# -------------------------------------------------------
# iowait_threshold_percent: 30.0     # System iowait considered saturated
# write_rate_threshold_mbps: 100.0   # Write throughput considered saturated
# disk_usage_threshold_percent: 90.0 # Filesystem usage considered saturated
# network_latency_threshold_ms: 100.0 # Storage server RTT considered saturated
#
# Volume Cache
# ------------
# volume_cache_ttl_seconds: 30       # How long path->volume mappings are reused
#
# Logging
# -------
# log_level: "info"                  # off, error, warn, info, debug, trace
#
# Throttle Detection Tuning
# -------------------------
# throttle:
#   latency_spike_multiplier: 2.0    # Latency above baseline x this = spike
#   busy_threshold_percent: 80.0     # Busy time above this = saturated sample
#   busy_window_samples: 3           # Samples checked for sustained busy time
#   queue_congestion_factor: 0.5     # In-flight above depth x this = congestion
#   default_max_queue_depth: 128     # Assumed depth when sysfs has none
#   low_activity_write_mbps: 10.0    # Below this the device counts as idle
#   low_activity_busy_percent: 20.0  # Below this the device counts as idle
#   baseline_update_interval_seconds: 10  # Min seconds between baseline updates
#   history_window_samples: 30       # Samples kept per device for trends
"#;

    format!("{comments}\n{yaml}")
}
