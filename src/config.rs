//! Configuration management for iobrake.
//!
//! This module handles loading and validating configuration from files.
//! It supports YAML, JSON, and TOML formats. Merging CLI arguments over
//! the file configuration happens in the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// Default configuration constants
pub const DEFAULT_WATCH_PATH: &str = ".";
pub const DEFAULT_SAMPLE_INTERVAL_SECONDS: f64 = 5.0;
pub const DEFAULT_MIN_SPEED: u64 = 1_048_576;
pub const DEFAULT_MIN_UPLOAD_SPEED: u64 = 5_242_880;
pub const DEFAULT_VOLUME_CACHE_TTL: u64 = 30;
pub const DEFAULT_IOWAIT_THRESHOLD_PERCENT: f64 = 30.0;
pub const DEFAULT_WRITE_RATE_THRESHOLD_MBPS: f64 = 100.0;
pub const DEFAULT_DISK_USAGE_THRESHOLD_PERCENT: f64 = 90.0;
pub const DEFAULT_NETWORK_LATENCY_THRESHOLD_MS: f64 = 100.0;

/// Throttle detection tuning for per-device observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Latency must exceed the baseline by this factor to count as a spike (default: 2.0)
    #[serde(default = "default_latency_spike_multiplier")]
    pub latency_spike_multiplier: f64,

    /// Busy-time percentage above which a sample counts as saturated (default: 80.0)
    #[serde(default = "default_busy_threshold_percent")]
    pub busy_threshold_percent: f64,

    /// Recent samples inspected for sustained busy time (default: 3)
    #[serde(default = "default_busy_window_samples")]
    pub busy_window_samples: usize,

    /// Fraction of queue depth above which in-flight IO counts as congestion (default: 0.5)
    #[serde(default = "default_queue_congestion_factor")]
    pub queue_congestion_factor: f64,

    /// Queue depth assumed when sysfs does not expose one (default: 128)
    #[serde(default = "default_max_queue_depth")]
    pub default_max_queue_depth: u64,

    /// Write rate in MB/s below which a device counts as idle for baseline updates (default: 10.0)
    #[serde(default = "default_low_activity_write_mbps")]
    pub low_activity_write_mbps: f64,

    /// Busy percentage below which a device counts as idle for baseline updates (default: 20.0)
    #[serde(default = "default_low_activity_busy_percent")]
    pub low_activity_busy_percent: f64,

    /// Minimum seconds between baseline latency updates (default: 10)
    #[serde(default = "default_baseline_update_interval")]
    pub baseline_update_interval_seconds: u64,

    /// Samples retained per device for trend analysis (default: 30)
    #[serde(default = "default_history_window_samples")]
    pub history_window_samples: usize,
}

fn default_latency_spike_multiplier() -> f64 {
    2.0
}
fn default_busy_threshold_percent() -> f64 {
    80.0
}
fn default_busy_window_samples() -> usize {
    3
}
fn default_queue_congestion_factor() -> f64 {
    0.5
}
fn default_max_queue_depth() -> u64 {
    128
}
fn default_low_activity_write_mbps() -> f64 {
    10.0
}
fn default_low_activity_busy_percent() -> f64 {
    20.0
}
fn default_baseline_update_interval() -> u64 {
    10
}
fn default_history_window_samples() -> usize {
    30
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            latency_spike_multiplier: default_latency_spike_multiplier(),
            busy_threshold_percent: default_busy_threshold_percent(),
            busy_window_samples: default_busy_window_samples(),
            queue_congestion_factor: default_queue_congestion_factor(),
            default_max_queue_depth: default_max_queue_depth(),
            low_activity_write_mbps: default_low_activity_write_mbps(),
            low_activity_busy_percent: default_low_activity_busy_percent(),
            baseline_update_interval_seconds: default_baseline_update_interval(),
            history_window_samples: default_history_window_samples(),
        }
    }
}

/// User-facing configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path observed in watch mode (defaults to the current directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    // Feature flags
    #[serde(
        alias = "enable-volume-specific-monitoring",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_volume_specific_monitoring: Option<bool>,
    #[serde(
        alias = "enable-dynamic-throttling",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_dynamic_throttling: Option<bool>,

    // Sampling cadence
    #[serde(
        alias = "sample-interval-seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub sample_interval_seconds: Option<f64>,

    // Speed bounds in bytes per second; a max of 0 means unlimited
    #[serde(
        alias = "min-speed-bytes-per-sec",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_speed_bytes_per_sec: Option<u64>,
    #[serde(
        alias = "max-speed-bytes-per-sec",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_speed_bytes_per_sec: Option<u64>,
    #[serde(
        alias = "min-upload-speed-bytes-per-sec",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_upload_speed_bytes_per_sec: Option<u64>,
    #[serde(
        alias = "max-upload-speed-bytes-per-sec",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_upload_speed_bytes_per_sec: Option<u64>,

    // Static stress thresholds; values <= 0 exclude the factor
    #[serde(
        alias = "iowait-threshold-percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub iowait_threshold_percent: Option<f64>,
    #[serde(
        alias = "write-rate-threshold-mbps",
        skip_serializing_if = "Option::is_none"
    )]
    pub write_rate_threshold_mbps: Option<f64>,
    #[serde(
        alias = "disk-usage-threshold-percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_usage_threshold_percent: Option<f64>,
    #[serde(
        alias = "network-latency-threshold-ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_latency_threshold_ms: Option<f64>,

    // Volume cache
    #[serde(
        alias = "volume-cache-ttl-seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_cache_ttl_seconds: Option<u64>,

    /// Top-level shortcut for throttle.history_window_samples
    #[serde(
        alias = "history-window-samples",
        skip_serializing_if = "Option::is_none"
    )]
    pub history_window_samples: Option<usize>,

    // Logging
    #[serde(alias = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    // Throttle detection tuning
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            enable_volume_specific_monitoring: Some(true),
            enable_dynamic_throttling: Some(true),
            sample_interval_seconds: Some(DEFAULT_SAMPLE_INTERVAL_SECONDS),
            min_speed_bytes_per_sec: Some(DEFAULT_MIN_SPEED),
            max_speed_bytes_per_sec: Some(0),
            min_upload_speed_bytes_per_sec: Some(DEFAULT_MIN_UPLOAD_SPEED),
            max_upload_speed_bytes_per_sec: Some(0),
            iowait_threshold_percent: Some(DEFAULT_IOWAIT_THRESHOLD_PERCENT),
            write_rate_threshold_mbps: Some(DEFAULT_WRITE_RATE_THRESHOLD_MBPS),
            disk_usage_threshold_percent: Some(DEFAULT_DISK_USAGE_THRESHOLD_PERCENT),
            network_latency_threshold_ms: Some(DEFAULT_NETWORK_LATENCY_THRESHOLD_MS),
            volume_cache_ttl_seconds: Some(DEFAULT_VOLUME_CACHE_TTL),
            history_window_samples: None,
            log_level: Some("info".into()),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Resolved runtime configuration fed to the monitoring engine.
///
/// Every optional user-facing value is flattened to a concrete one here,
/// so the engine never has to reason about absent settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enable_volume_specific_monitoring: bool,
    pub enable_dynamic_throttling: bool,
    pub sample_interval_seconds: f64,
    pub min_speed_bytes_per_sec: u64,
    pub max_speed_bytes_per_sec: u64,
    pub min_upload_speed_bytes_per_sec: u64,
    pub max_upload_speed_bytes_per_sec: u64,
    pub iowait_threshold_percent: f64,
    pub write_rate_threshold_mbps: f64,
    pub disk_usage_threshold_percent: f64,
    pub network_latency_threshold_ms: f64,
    pub volume_cache_ttl_seconds: u64,
    pub throttle: ThrottleConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Config::default().to_monitor_config()
    }
}

impl Config {
    /// Flattens the optional fields into the concrete engine configuration.
    /// The top-level history_window_samples shortcut wins over the nested
    /// throttle table when both are present.
    pub fn to_monitor_config(&self) -> MonitorConfig {
        let mut throttle = self.throttle.clone();
        if let Some(samples) = self.history_window_samples {
            throttle.history_window_samples = samples;
        }

        MonitorConfig {
            enable_volume_specific_monitoring: self
                .enable_volume_specific_monitoring
                .unwrap_or(true),
            enable_dynamic_throttling: self.enable_dynamic_throttling.unwrap_or(true),
            sample_interval_seconds: self
                .sample_interval_seconds
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECONDS),
            min_speed_bytes_per_sec: self.min_speed_bytes_per_sec.unwrap_or(DEFAULT_MIN_SPEED),
            max_speed_bytes_per_sec: self.max_speed_bytes_per_sec.unwrap_or(0),
            min_upload_speed_bytes_per_sec: self
                .min_upload_speed_bytes_per_sec
                .unwrap_or(DEFAULT_MIN_UPLOAD_SPEED),
            max_upload_speed_bytes_per_sec: self.max_upload_speed_bytes_per_sec.unwrap_or(0),
            iowait_threshold_percent: self
                .iowait_threshold_percent
                .unwrap_or(DEFAULT_IOWAIT_THRESHOLD_PERCENT),
            write_rate_threshold_mbps: self
                .write_rate_threshold_mbps
                .unwrap_or(DEFAULT_WRITE_RATE_THRESHOLD_MBPS),
            disk_usage_threshold_percent: self
                .disk_usage_threshold_percent
                .unwrap_or(DEFAULT_DISK_USAGE_THRESHOLD_PERCENT),
            network_latency_threshold_ms: self
                .network_latency_threshold_ms
                .unwrap_or(DEFAULT_NETWORK_LATENCY_THRESHOLD_MS),
            volume_cache_ttl_seconds: self
                .volume_cache_ttl_seconds
                .unwrap_or(DEFAULT_VOLUME_CACHE_TTL),
            throttle,
        }
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = cfg.to_monitor_config();

    if resolved.max_speed_bytes_per_sec > 0
        && resolved.min_speed_bytes_per_sec > resolved.max_speed_bytes_per_sec
    {
        return Err(format!(
            "min_speed_bytes_per_sec ({}) exceeds max_speed_bytes_per_sec ({})",
            resolved.min_speed_bytes_per_sec, resolved.max_speed_bytes_per_sec
        )
        .into());
    }

    if resolved.max_upload_speed_bytes_per_sec > 0
        && resolved.min_upload_speed_bytes_per_sec > resolved.max_upload_speed_bytes_per_sec
    {
        return Err(format!(
            "min_upload_speed_bytes_per_sec ({}) exceeds max_upload_speed_bytes_per_sec ({})",
            resolved.min_upload_speed_bytes_per_sec, resolved.max_upload_speed_bytes_per_sec
        )
        .into());
    }

    if !resolved.sample_interval_seconds.is_finite() || resolved.sample_interval_seconds <= 0.0 {
        return Err(format!(
            "sample_interval_seconds must be positive, got {}",
            resolved.sample_interval_seconds
        )
        .into());
    }

    // Static stress thresholds may be disabled with values <= 0, but NaN
    // would poison every comparison downstream.
    for (name, value) in [
        ("iowait_threshold_percent", resolved.iowait_threshold_percent),
        (
            "write_rate_threshold_mbps",
            resolved.write_rate_threshold_mbps,
        ),
        (
            "disk_usage_threshold_percent",
            resolved.disk_usage_threshold_percent,
        ),
        (
            "network_latency_threshold_ms",
            resolved.network_latency_threshold_ms,
        ),
    ] {
        if value.is_nan() {
            return Err(format!("{} must be a number", name).into());
        }
    }

    let throttle = &resolved.throttle;

    if !throttle.latency_spike_multiplier.is_finite() || throttle.latency_spike_multiplier < 1.0 {
        return Err(format!(
            "throttle.latency_spike_multiplier must be at least 1.0, got {}",
            throttle.latency_spike_multiplier
        )
        .into());
    }

    if !(throttle.busy_threshold_percent > 0.0 && throttle.busy_threshold_percent <= 100.0) {
        return Err(format!(
            "throttle.busy_threshold_percent must be in (0, 100], got {}",
            throttle.busy_threshold_percent
        )
        .into());
    }

    if throttle.busy_window_samples == 0 {
        return Err("throttle.busy_window_samples must be at least 1".into());
    }

    if !(throttle.queue_congestion_factor > 0.0 && throttle.queue_congestion_factor <= 1.0) {
        return Err(format!(
            "throttle.queue_congestion_factor must be in (0, 1], got {}",
            throttle.queue_congestion_factor
        )
        .into());
    }

    if throttle.default_max_queue_depth == 0 {
        return Err("throttle.default_max_queue_depth must be at least 1".into());
    }

    // Write-stall detection compares the newest three samples against up to
    // three earlier ones, so anything below six can never trend.
    if throttle.history_window_samples < 6 {
        return Err(format!(
            "throttle.history_window_samples must be at least 6, got {}",
            throttle.history_window_samples
        )
        .into());
    }

    Ok(())
}

/// Configuration loading with multiple format support
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        // Try default locations
        let defaults = [
            "/etc/iobrake/iobrake.yaml",
            "/etc/iobrake/iobrake.yml",
            "/etc/iobrake/iobrake.json",
            "./iobrake.yaml",
            "./iobrake.yml",
            "./iobrake.json",
        ];

        defaults
            .iter()
            .find(|p| Path::new(p).exists())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(""))
    };

    if !path.exists() || path.to_string_lossy().is_empty() {
        return Ok(Config::default());
    }

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
