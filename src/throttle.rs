//! Device-level write throttling detection.
//!
//! Each device accumulates a rolling history of write metrics plus a
//! self-calibrating baseline latency learned during quiet periods. Four
//! independent indicators (latency spike, sustained busy time, queue
//! congestion, write stalls) are folded into a single severity score in
//! [0, 1] and mapped to a recommended action. Detection never fails:
//! when a path cannot be tied to a block device the detector reports
//! "no throttling" rather than guessing.

use crate::collectors::diskstats::{self, DiskCounters};
use crate::config::ThrottleConfig;
use crate::volume::VolumeDetector;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// EMA weights for the baseline latency: heavy on the old value so a
/// single quiet-but-slow window cannot drag the baseline around.
const BASELINE_KEEP_WEIGHT: f64 = 0.9;
const BASELINE_SAMPLE_WEIGHT: f64 = 0.1;

/// Severity weights per indicator. They sum to 1.0.
const LATENCY_SPIKE_WEIGHT: f64 = 0.4;
const BUSY_TIME_WEIGHT: f64 = 0.3;
const QUEUE_CONGESTION_WEIGHT: f64 = 0.2;
const WRITE_STALL_WEIGHT: f64 = 0.1;

/// A latency 5x over baseline saturates the spike term.
const LATENCY_RATIO_SCALE: f64 = 5.0;

/// Fraction of the busy window that must exceed the busy threshold.
const BUSY_QUORUM: f64 = 0.8;

/// Stall shape: latency grew by more than 50% while throughput grew by
/// less than 20%.
const STALL_LATENCY_GROWTH: f64 = 1.5;
const STALL_RATE_GROWTH_CAP: f64 = 1.2;

/// Severity above which a device counts as throttling.
const THROTTLING_THRESHOLD: f64 = 0.1;

/// Floor between raw counter samples. Several detection calls can land
/// within one control tick; re-deriving rates over a near-zero window
/// would flood the history with empty samples, so rapid calls evaluate
/// the existing history instead.
const MIN_SAMPLE_INTERVAL_MS: i64 = 1000;

/// One timestamped write-activity sample for a device.
///
/// Rates and latency are derived from the delta against the previous
/// raw counter sample; the first sample for a device carries zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    /// Cumulative completed writes since boot.
    pub write_count: u64,
    /// Cumulative bytes written since boot.
    pub write_bytes: u64,
    /// Cumulative milliseconds spent writing since boot.
    pub write_time_ms: u64,
    /// Cumulative milliseconds the device was busy since boot.
    pub busy_time_ms: u64,
    pub avg_write_latency_ms: f64,
    pub write_rate_mbps: f64,
    /// Busy time over the sampling window, clamped to [0, 100].
    pub busy_percent: f64,
    /// Requests currently in flight (gauge, not a counter).
    pub in_flight_io: u64,
}

impl DeviceMetrics {
    /// Derives a sample from raw counters and the previous raw sample.
    pub fn from_counters(
        device_name: &str,
        counters: &DiskCounters,
        previous: Option<(&DiskCounters, DateTime<Utc>)>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut metrics = DeviceMetrics {
            device_name: device_name.to_string(),
            timestamp,
            write_count: counters.writes_completed,
            write_bytes: counters.bytes_written(),
            write_time_ms: counters.time_writing_ms,
            busy_time_ms: counters.time_io_ms,
            avg_write_latency_ms: 0.0,
            write_rate_mbps: 0.0,
            busy_percent: 0.0,
            in_flight_io: counters.ios_in_progress,
        };

        if let Some((prev, prev_at)) = previous {
            let elapsed_secs = (timestamp - prev_at).num_milliseconds() as f64 / 1000.0;
            if elapsed_secs > 0.0 {
                let delta_writes = counters.writes_completed.saturating_sub(prev.writes_completed);
                let delta_bytes = counters.bytes_written().saturating_sub(prev.bytes_written());
                let delta_write_ms = counters.time_writing_ms.saturating_sub(prev.time_writing_ms);
                let delta_busy_ms = counters.time_io_ms.saturating_sub(prev.time_io_ms);

                if delta_writes > 0 {
                    metrics.avg_write_latency_ms = delta_write_ms as f64 / delta_writes as f64;
                }
                metrics.write_rate_mbps = delta_bytes as f64 / elapsed_secs / (1024.0 * 1024.0);
                metrics.busy_percent =
                    (delta_busy_ms as f64 / (elapsed_secs * 1000.0) * 100.0).min(100.0);
            }
        }

        metrics
    }
}

/// What the caller should do with its transfer speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleAction {
    Continue,
    ReduceSpeed,
    Pause,
}

impl fmt::Display for ThrottleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThrottleAction::Continue => "continue",
            ThrottleAction::ReduceSpeed => "reduce_speed",
            ThrottleAction::Pause => "pause",
        };
        write!(f, "{}", label)
    }
}

/// Verdict for one detection pass over a device's history.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottlingStatus {
    pub is_throttling: bool,
    /// Weighted indicator sum in [0, 1].
    pub severity: f64,
    pub latency_spike: bool,
    pub high_busy_time: bool,
    pub queue_congestion: bool,
    pub write_stalls: bool,
    pub current_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_latency_ms: Option<f64>,
    pub busy_percent: f64,
    pub in_flight_io: u64,
    pub max_queue_depth: u64,
    pub recommended_action: ThrottleAction,
    /// Fraction of the configured ceiling the caller should keep.
    pub recommended_speed_factor: f64,
}

impl ThrottlingStatus {
    /// Default verdict when throttling cannot be assessed.
    fn no_assessment(max_queue_depth: u64) -> Self {
        ThrottlingStatus {
            is_throttling: false,
            severity: 0.0,
            latency_spike: false,
            high_busy_time: false,
            queue_congestion: false,
            write_stalls: false,
            current_latency_ms: 0.0,
            baseline_latency_ms: None,
            busy_percent: 0.0,
            in_flight_io: 0,
            max_queue_depth,
            recommended_action: ThrottleAction::Continue,
            recommended_speed_factor: 1.0,
        }
    }
}

/// Mutable sampling state for one device.
struct DeviceState {
    last_sample: Option<(DiskCounters, DateTime<Utc>)>,
    history: VecDeque<DeviceMetrics>,
    baseline_latency_ms: Option<f64>,
    baseline_updated_at: Option<DateTime<Utc>>,
    max_queue_depth: Option<u64>,
}

impl DeviceState {
    fn new() -> Self {
        DeviceState {
            last_sample: None,
            history: VecDeque::new(),
            baseline_latency_ms: None,
            baseline_updated_at: None,
            max_queue_depth: None,
        }
    }
}

/// Per-device throttling detector.
///
/// Devices are tracked independently in a concurrent map; all
/// read-modify-write of a device's history and baseline happens under
/// that device's map entry, so concurrent callers cannot interleave
/// partial updates.
pub struct ThrottleDetector {
    volume_detector: Arc<VolumeDetector>,
    config: ThrottleConfig,
    devices: DashMap<String, DeviceState>,
}

impl ThrottleDetector {
    pub fn new(volume_detector: Arc<VolumeDetector>, config: ThrottleConfig) -> Self {
        ThrottleDetector {
            volume_detector,
            config,
            devices: DashMap::new(),
        }
    }

    /// Samples the device backing `path` and evaluates its indicators.
    ///
    /// Paths without a resolvable block device (network mounts, tmpfs,
    /// unknown volumes) yield the no-throttling default; so do counter
    /// read failures. Never fails.
    pub fn detect_throttling(&self, path: &Path) -> ThrottlingStatus {
        let volume = self.volume_detector.detect_volume(path);
        let device_name = match volume.device_name {
            Some(name) => name,
            None => {
                debug!(
                    "No block device behind {}, throttling not assessable",
                    path.display()
                );
                return ThrottlingStatus::no_assessment(self.config.default_max_queue_depth);
            }
        };

        if let Err(e) = self.sample_device(&device_name) {
            debug!("Failed to sample device {}: {}", device_name, e);
            return ThrottlingStatus::no_assessment(self.config.default_max_queue_depth);
        }

        self.evaluate_device(&device_name)
    }

    /// Severity only, for callers that fold it into a stress score.
    pub fn throttling_score(&self, path: &Path) -> f64 {
        self.detect_throttling(path).severity
    }

    /// Injects an externally produced sample into a device's history.
    ///
    /// Used by synthetic replay; applies the same history bounding and
    /// baseline EMA rules as live sampling, keyed on the sample's own
    /// timestamp so recorded data behaves identically on every run.
    pub fn record_sample(&self, metrics: DeviceMetrics) {
        let mut state = self
            .devices
            .entry(metrics.device_name.clone())
            .or_insert_with(DeviceState::new);
        Self::integrate_sample(&mut state, metrics, &self.config);
    }

    /// Evaluates the current history of `device_name` without taking a
    /// fresh sample. Unknown devices and empty histories yield the
    /// no-throttling default.
    pub fn evaluate_device(&self, device_name: &str) -> ThrottlingStatus {
        let state = match self.devices.get(device_name) {
            Some(state) => state,
            None => return ThrottlingStatus::no_assessment(self.config.default_max_queue_depth),
        };
        let current = match state.history.back() {
            Some(sample) => sample,
            None => return ThrottlingStatus::no_assessment(self.config.default_max_queue_depth),
        };

        let max_queue_depth = state
            .max_queue_depth
            .unwrap_or(self.config.default_max_queue_depth);
        let baseline = state.baseline_latency_ms;

        let latency_spike = match baseline {
            Some(base) => {
                current.avg_write_latency_ms > 0.0
                    && current.avg_write_latency_ms > base * self.config.latency_spike_multiplier
            }
            None => false,
        };

        let busy_window = self.config.busy_window_samples.max(1);
        let high_busy_time = if state.history.len() >= busy_window {
            let exceeding = state
                .history
                .iter()
                .rev()
                .take(busy_window)
                .filter(|m| m.busy_percent > self.config.busy_threshold_percent)
                .count();
            exceeding as f64 / busy_window as f64 >= BUSY_QUORUM
        } else {
            false
        };

        let queue_congestion = (current.in_flight_io as f64)
            > (max_queue_depth as f64 * self.config.queue_congestion_factor);

        let write_stalls = detect_write_stall(&state.history);

        let mut severity = 0.0;
        if latency_spike {
            if let Some(base) = baseline {
                let ratio = current.avg_write_latency_ms / base;
                severity += LATENCY_SPIKE_WEIGHT * (ratio / LATENCY_RATIO_SCALE).min(1.0);
            }
        }
        if high_busy_time {
            severity += BUSY_TIME_WEIGHT * (current.busy_percent / 100.0).min(1.0);
        }
        if queue_congestion {
            severity += QUEUE_CONGESTION_WEIGHT
                * (current.in_flight_io as f64 / max_queue_depth as f64).min(1.0);
        }
        if write_stalls {
            severity += WRITE_STALL_WEIGHT;
        }
        let severity = severity.min(1.0);

        let (recommended_action, recommended_speed_factor) = severity_to_action(severity);

        let status = ThrottlingStatus {
            is_throttling: severity > THROTTLING_THRESHOLD,
            severity,
            latency_spike,
            high_busy_time,
            queue_congestion,
            write_stalls,
            current_latency_ms: current.avg_write_latency_ms,
            baseline_latency_ms: baseline,
            busy_percent: current.busy_percent,
            in_flight_io: current.in_flight_io,
            max_queue_depth,
            recommended_action,
            recommended_speed_factor,
        };

        if status.is_throttling {
            warn!(
                "Write throttling on {}: severity {:.2} (spike={} busy={} queue={} stall={}), action {}",
                device_name,
                status.severity,
                status.latency_spike,
                status.high_busy_time,
                status.queue_congestion,
                status.write_stalls,
                status.recommended_action
            );
        }

        status
    }

    /// Reads fresh counters for `device_name` and folds the derived
    /// sample into its history.
    fn sample_device(&self, device_name: &str) -> Result<(), String> {
        let counters = diskstats::read_device_counters(device_name)?;
        let now = Utc::now();

        let mut state = self
            .devices
            .entry(device_name.to_string())
            .or_insert_with(DeviceState::new);

        if let Some((_, at)) = &state.last_sample {
            if (now - *at).num_milliseconds() < MIN_SAMPLE_INTERVAL_MS {
                return Ok(());
            }
        }

        if state.max_queue_depth.is_none() {
            state.max_queue_depth = Some(
                read_max_queue_depth(device_name).unwrap_or(self.config.default_max_queue_depth),
            );
        }

        let metrics = DeviceMetrics::from_counters(
            device_name,
            &counters,
            state.last_sample.as_ref().map(|(c, at)| (c, *at)),
            now,
        );
        state.last_sample = Some((counters, now));

        Self::integrate_sample(&mut state, metrics, &self.config);
        Ok(())
    }

    /// Applies baseline EMA rules and appends to the bounded history.
    fn integrate_sample(state: &mut DeviceState, metrics: DeviceMetrics, config: &ThrottleConfig) {
        // The baseline only learns from quiet windows that still saw
        // completed writes; zero-latency idle windows carry no signal.
        let low_activity = metrics.write_rate_mbps < config.low_activity_write_mbps
            && metrics.busy_percent < config.low_activity_busy_percent;
        if low_activity && metrics.avg_write_latency_ms > 0.0 {
            let due = match state.baseline_updated_at {
                None => true,
                Some(at) => (metrics.timestamp - at).num_seconds()
                    >= config.baseline_update_interval_seconds as i64,
            };
            if due {
                state.baseline_latency_ms = Some(match state.baseline_latency_ms {
                    Some(baseline) => {
                        baseline * BASELINE_KEEP_WEIGHT
                            + metrics.avg_write_latency_ms * BASELINE_SAMPLE_WEIGHT
                    }
                    None => metrics.avg_write_latency_ms,
                });
                state.baseline_updated_at = Some(metrics.timestamp);
            }
        }

        let capacity = config.history_window_samples.max(1);
        while state.history.len() >= capacity {
            state.history.pop_front();
        }
        state.history.push_back(metrics);
    }
}

/// Maps a severity score to the recommended action and speed factor.
fn severity_to_action(severity: f64) -> (ThrottleAction, f64) {
    if severity >= 0.7 {
        (ThrottleAction::Pause, 0.0)
    } else if severity >= 0.5 {
        (ThrottleAction::ReduceSpeed, 0.3)
    } else if severity >= 0.3 {
        (ThrottleAction::ReduceSpeed, 0.5)
    } else if severity >= 0.1 {
        (ThrottleAction::ReduceSpeed, 0.7)
    } else {
        (ThrottleAction::Continue, 1.0)
    }
}

/// Compares the newest 3 samples against the up-to-3 before them.
/// Requires at least 5 samples and positive older means.
fn detect_write_stall(history: &VecDeque<DeviceMetrics>) -> bool {
    if history.len() < 5 {
        return false;
    }

    let newest: Vec<&DeviceMetrics> = history.iter().rev().take(3).collect();
    let older: Vec<&DeviceMetrics> = history.iter().rev().skip(3).take(3).collect();

    let recent_latency = mean_of(&newest, |m| m.avg_write_latency_ms);
    let older_latency = mean_of(&older, |m| m.avg_write_latency_ms);
    let recent_rate = mean_of(&newest, |m| m.write_rate_mbps);
    let older_rate = mean_of(&older, |m| m.write_rate_mbps);

    if older_latency <= 0.0 || older_rate <= 0.0 {
        return false;
    }

    recent_latency / older_latency > STALL_LATENCY_GROWTH
        && recent_rate / older_rate < STALL_RATE_GROWTH_CAP
}

fn mean_of(samples: &[&DeviceMetrics], value: impl Fn(&DeviceMetrics) -> f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|m| value(m)).sum::<f64>() / samples.len() as f64
}

/// Queue depth from sysfs for the whole disk, if exposed.
fn read_max_queue_depth(device_name: &str) -> Option<u64> {
    let path = format!("/sys/block/{}/queue/nr_requests", device_name);
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
