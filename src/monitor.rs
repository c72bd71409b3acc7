//! Unified I/O monitoring and speed-limit calculation.
//!
//! `IoMonitor` resolves a path to its volume, collects the most
//! specific metrics the volume supports (network counters for remote
//! mounts, per-device counters for local disks, system-wide aggregates
//! as the fallback) and condenses them into a stress level in [0, 1].
//! The stress level feeds piecewise speed-limit schedules and the
//! pause/resume decisions of the control loop.
//!
//! Every collection strategy degrades to the next lower-fidelity one on
//! failure; `get_current_metrics` itself never fails.

use crate::collectors::cpustat::IowaitTracker;
use crate::collectors::diskstats::{self, DiskCounters};
use crate::collectors::fsusage;
use crate::collectors::netdev::{self, TransmitTotals};
use crate::config::MonitorConfig;
use crate::throttle::{DeviceMetrics, ThrottleAction, ThrottleDetector};
use crate::volume::{self, StorageType, VolumeDetector, VolumeInfo};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Reference ceiling used in place of "unlimited" when a throttled
/// speed has to be interpolated against something finite.
pub const UNLIMITED_SPEED_REFERENCE: u64 = 500 * 1024 * 1024;

/// Stress at or below which `wait_for_io_recovery` considers the
/// device recovered, unless the caller overrides it.
pub const DEFAULT_RECOVERY_TARGET_STRESS: f64 = 0.5;
pub const DEFAULT_RECOVERY_MAX_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECOVERY_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Unlimited ceilings impose no cap while stress stays below this.
const UNLIMITED_IDLE_STRESS: f64 = 0.1;

/// Snapshot of I/O conditions for one path.
#[derive(Debug, Clone, Serialize)]
pub struct IoMetrics {
    /// System-wide iowait. Zero on the network-specific path, which has
    /// no meaningful iowait signal.
    pub iowait_percent: f64,
    pub write_bytes_per_sec: f64,
    pub write_count_per_sec: f64,
    pub disk_usage_percent: f64,
    /// Combined stress in [0, 1].
    pub io_stress_level: f64,
    pub volume: VolumeInfo,
    /// False when the system-wide fallback produced this snapshot.
    pub is_volume_specific: bool,
    /// TCP connect time to the storage server, network volumes only.
    pub network_latency_ms: Option<f64>,
}

/// One observed value paired with its configured threshold.
#[derive(Debug, Clone, Copy)]
pub struct StressFactor {
    pub value: f64,
    pub threshold: f64,
}

/// Strategy for condensing observations into a stress level.
pub trait StressModel: Send + Sync {
    fn stress_level(&self, path: &Path, factors: &[StressFactor]) -> f64;
}

/// Legacy model: the worst normalized factor wins. Factors with a
/// non-positive threshold are excluded rather than divided by zero.
pub struct StaticStressModel;

impl StressModel for StaticStressModel {
    fn stress_level(&self, _path: &Path, factors: &[StressFactor]) -> f64 {
        factors
            .iter()
            .filter(|f| f.threshold > 0.0)
            .map(|f| (f.value / f.threshold).clamp(0.0, 1.0))
            .fold(0.0, f64::max)
    }
}

/// Dynamic model: stress is the throttle detector's severity score.
pub struct DynamicStressModel {
    detector: Arc<ThrottleDetector>,
}

impl StressModel for DynamicStressModel {
    fn stress_level(&self, path: &Path, _factors: &[StressFactor]) -> f64 {
        self.detector.throttling_score(path)
    }
}

/// Write totals summed over physical whole-disk devices. Partitions
/// and mapper devices are skipped, they would double-count the disk
/// underneath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DiskTotals {
    bytes: u64,
    writes: u64,
}

fn sum_disk_totals(table: &AHashMap<String, DiskCounters>) -> DiskTotals {
    let mut totals = DiskTotals::default();
    for (name, counters) in table {
        if !diskstats::is_whole_disk(name) {
            continue;
        }
        totals.bytes += counters.bytes_written();
        totals.writes += counters.writes_completed;
    }
    totals
}

/// Keeps the previous sample of a cumulative counter set so rates can
/// be derived from consecutive observations.
struct DeltaTracker<T> {
    previous: RwLock<Option<(T, Instant)>>,
}

impl<T> DeltaTracker<T> {
    fn new() -> Self {
        DeltaTracker {
            previous: RwLock::new(None),
        }
    }

    /// Swaps in `current` and returns the previous sample with the
    /// elapsed seconds since it was taken. First call returns `None`.
    fn advance(&self, current: T) -> Option<(T, f64)> {
        let now = Instant::now();
        let mut guard = self.previous.write().ok()?;
        let prev = guard.replace((current, now));
        prev.map(|(value, at)| (value, now.duration_since(at).as_secs_f64()))
    }
}

/// Path-oriented I/O monitor.
///
/// Owns its own per-device sampling state, separate from any
/// `ThrottleDetector`, because the two may run on different cadences
/// and rate derivation requires strictly consecutive samples.
pub struct IoMonitor {
    config: MonitorConfig,
    volume_detector: Arc<VolumeDetector>,
    throttle_detector: Option<Arc<ThrottleDetector>>,
    stress_model: Box<dyn StressModel>,
    volume_cache: DashMap<PathBuf, (VolumeInfo, Instant)>,
    device_samples: DashMap<String, (DiskCounters, DateTime<Utc>)>,
    iowait_tracker: IowaitTracker,
    disk_tracker: DeltaTracker<DiskTotals>,
    net_tracker: DeltaTracker<TransmitTotals>,
}

impl IoMonitor {
    /// Builds a monitor. With dynamic throttling enabled the monitor
    /// owns a `ThrottleDetector` sharing `volume_detector`; otherwise
    /// the legacy static stress model is used.
    pub fn new(config: MonitorConfig, volume_detector: Arc<VolumeDetector>) -> Self {
        let throttle_detector = if config.enable_dynamic_throttling {
            Some(Arc::new(ThrottleDetector::new(
                Arc::clone(&volume_detector),
                config.throttle.clone(),
            )))
        } else {
            None
        };

        let stress_model: Box<dyn StressModel> = match &throttle_detector {
            Some(detector) => Box::new(DynamicStressModel {
                detector: Arc::clone(detector),
            }),
            None => Box::new(StaticStressModel),
        };

        IoMonitor {
            config,
            volume_detector,
            throttle_detector,
            stress_model,
            volume_cache: DashMap::new(),
            device_samples: DashMap::new(),
            iowait_tracker: IowaitTracker::new(),
            disk_tracker: DeltaTracker::new(),
            net_tracker: DeltaTracker::new(),
        }
    }

    /// Monitor with a caller-supplied stress model, for exercising the
    /// decision paths against known stress values.
    #[cfg(test)]
    pub(crate) fn with_stress_model(
        config: MonitorConfig,
        volume_detector: Arc<VolumeDetector>,
        stress_model: Box<dyn StressModel>,
    ) -> Self {
        IoMonitor {
            config,
            volume_detector,
            throttle_detector: None,
            stress_model,
            volume_cache: DashMap::new(),
            device_samples: DashMap::new(),
            iowait_tracker: IowaitTracker::new(),
            disk_tracker: DeltaTracker::new(),
            net_tracker: DeltaTracker::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The detector backing dynamic throttling, absent in legacy mode.
    pub fn throttle_detector(&self) -> Option<&Arc<ThrottleDetector>> {
        self.throttle_detector.as_ref()
    }

    /// Current I/O conditions for `path`. Never fails; each collection
    /// strategy falls back to the system-wide aggregate on error.
    pub fn get_current_metrics(&self, path: &Path) -> IoMetrics {
        let volume = self.volume_for(path);

        if self.config.enable_volume_specific_monitoring {
            match volume.storage_type {
                StorageType::NetworkFs => match self.collect_network_metrics(path, &volume) {
                    Ok(metrics) => return metrics,
                    Err(e) => {
                        debug!(
                            "Network metrics failed for {}: {}, using system-wide fallback",
                            path.display(),
                            e
                        );
                    }
                },
                StorageType::LocalDisk | StorageType::BlockDevice => {
                    if let Some(device) = volume.device_name.clone() {
                        match self.collect_device_metrics(path, &volume, &device) {
                            Ok(metrics) => return metrics,
                            Err(e) => {
                                debug!(
                                    "Device metrics failed for {}: {}, using system-wide fallback",
                                    device, e
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        self.collect_system_metrics(path, volume)
    }

    /// Speed cap for downloads landing on `path`.
    ///
    /// Returns `(bytes_per_sec, stress)`; a cap of 0 means "no explicit
    /// limit". `max_speed == 0` declares the ceiling unlimited.
    pub fn calculate_download_speed_limit(
        &self,
        metrics: Option<&IoMetrics>,
        min_speed: u64,
        max_speed: u64,
        path: &Path,
    ) -> (u64, f64) {
        let owned;
        let metrics = match metrics {
            Some(m) => m,
            None => {
                owned = self.get_current_metrics(path);
                &owned
            }
        };
        let stress = metrics.io_stress_level;
        let unlimited = max_speed == 0;

        // An idle disk with no ceiling gets no artificial cap at all.
        if unlimited && stress < UNLIMITED_IDLE_STRESS {
            return (0, stress);
        }

        if let Some(detector) = &self.throttle_detector {
            let status = detector.detect_throttling(path);
            if status.is_throttling {
                let effective_max = if unlimited {
                    UNLIMITED_SPEED_REFERENCE
                } else {
                    max_speed
                };
                let speed = min_speed as f64
                    + effective_max.saturating_sub(min_speed) as f64
                        * status.recommended_speed_factor;
                return (clamp_speed(speed as u64, min_speed, max_speed), stress);
            }
            return (max_speed, stress);
        }

        let effective_max = if unlimited {
            UNLIMITED_SPEED_REFERENCE
        } else {
            max_speed
        };
        let speed = banded_download_speed(stress, min_speed, effective_max);
        (clamp_speed(speed as u64, min_speed, max_speed), stress)
    }

    /// Upload counterpart of `calculate_download_speed_limit`; uploads
    /// keep a higher floor and back off later, their volume is small
    /// compared to the download stream.
    pub fn calculate_upload_speed_limit(
        &self,
        metrics: Option<&IoMetrics>,
        min_speed: u64,
        max_speed: u64,
        path: &Path,
    ) -> (u64, f64) {
        let owned;
        let metrics = match metrics {
            Some(m) => m,
            None => {
                owned = self.get_current_metrics(path);
                &owned
            }
        };
        let stress = metrics.io_stress_level;
        let unlimited = max_speed == 0;

        if unlimited && stress < UNLIMITED_IDLE_STRESS {
            return (0, stress);
        }

        if let Some(detector) = &self.throttle_detector {
            let status = detector.detect_throttling(path);
            if status.is_throttling {
                let effective_max = if unlimited {
                    UNLIMITED_SPEED_REFERENCE
                } else {
                    max_speed
                };
                let speed = min_speed as f64
                    + effective_max.saturating_sub(min_speed) as f64
                        * status.recommended_speed_factor;
                return (clamp_speed(speed as u64, min_speed, max_speed), stress);
            }
            return (max_speed, stress);
        }

        if stress < 0.3 {
            // Full ceiling, whatever it is.
            return (max_speed, stress);
        }

        let effective_max = if unlimited {
            UNLIMITED_SPEED_REFERENCE
        } else {
            max_speed
        };
        let speed = banded_upload_speed(stress, min_speed, effective_max);
        (clamp_speed(speed as u64, min_speed, max_speed), stress)
    }

    /// Whether downloads should pause entirely.
    pub fn should_pause_downloads(&self, metrics: Option<&IoMetrics>, path: &Path) -> bool {
        if let Some(detector) = &self.throttle_detector {
            return detector.detect_throttling(path).recommended_action == ThrottleAction::Pause;
        }

        let stress = match metrics {
            Some(m) => m.io_stress_level,
            None => self.get_current_metrics(path).io_stress_level,
        };
        stress >= 0.95
    }

    /// Blocks until stress drops to `target_stress` or `max_wait`
    /// elapses. Returns true on recovery. This is the engine's only
    /// deliberately blocking call; keep it off latency-sensitive paths.
    pub fn wait_for_io_recovery(
        &self,
        path: &Path,
        target_stress: f64,
        max_wait: Duration,
        check_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            let stress = self.get_current_metrics(path).io_stress_level;
            if stress <= target_stress {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(check_interval.min(deadline - now));
        }
    }

    /// VolumeInfo per path, cached with the configured TTL.
    fn volume_for(&self, path: &Path) -> VolumeInfo {
        let key = path.to_path_buf();

        if let Some(cached) = self.volume_cache.get(&key) {
            let (info, at) = cached.value();
            if at.elapsed().as_secs() < self.config.volume_cache_ttl_seconds {
                return info.clone();
            }
        }

        let info = self.volume_detector.detect_volume(path);
        self.volume_cache.insert(key, (info.clone(), Instant::now()));
        info
    }

    /// Network-volume path: interface transmit deltas approximate the
    /// write stream. Per-mount network I/O is not observable from
    /// standard counters, so totals across physical interfaces stand in
    /// for it.
    fn collect_network_metrics(
        &self,
        path: &Path,
        volume: &VolumeInfo,
    ) -> Result<IoMetrics, String> {
        let stats = netdev::read_netdev_stats()?;
        let totals = netdev::physical_transmit_totals(&stats);

        let (write_bytes_per_sec, write_count_per_sec) = match self.net_tracker.advance(totals) {
            Some((prev, elapsed)) if elapsed > 0.0 => (
                totals.bytes.saturating_sub(prev.bytes) as f64 / elapsed,
                totals.packets.saturating_sub(prev.packets) as f64 / elapsed,
            ),
            _ => (0.0, 0.0),
        };

        let network_latency_ms = probe_network_latency(&volume.device, &volume.fstype);
        let disk_usage_percent = fsusage::disk_usage_percent(&volume.mountpoint).unwrap_or_else(|e| {
            debug!("Disk usage unavailable for {}: {}", volume.mountpoint.display(), e);
            0.0
        });

        let write_rate_mbps = write_bytes_per_sec / (1024.0 * 1024.0);
        let factors = [
            StressFactor {
                value: network_latency_ms.unwrap_or(0.0),
                threshold: self.config.network_latency_threshold_ms,
            },
            // Network storage saturates well below local-disk rates.
            StressFactor {
                value: write_rate_mbps,
                threshold: self.config.write_rate_threshold_mbps / 2.0,
            },
            StressFactor {
                value: disk_usage_percent,
                threshold: self.config.disk_usage_threshold_percent,
            },
        ];
        let io_stress_level = self.stress_model.stress_level(path, &factors);

        Ok(IoMetrics {
            iowait_percent: 0.0,
            write_bytes_per_sec,
            write_count_per_sec,
            disk_usage_percent,
            io_stress_level,
            volume: volume.clone(),
            is_volume_specific: true,
            network_latency_ms,
        })
    }

    /// Local-device path: per-device counter deltas plus system iowait.
    fn collect_device_metrics(
        &self,
        path: &Path,
        volume: &VolumeInfo,
        device: &str,
    ) -> Result<IoMetrics, String> {
        let counters = diskstats::read_device_counters(device)?;
        let now = Utc::now();
        let previous = self.device_samples.insert(device.to_string(), (counters, now));

        let sample = DeviceMetrics::from_counters(
            device,
            &counters,
            previous.as_ref().map(|(c, at)| (c, *at)),
            now,
        );
        let write_count_per_sec = match &previous {
            Some((prev, at)) => {
                let elapsed = (now - *at).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    counters.writes_completed.saturating_sub(prev.writes_completed) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        let iowait_percent = self.iowait_tracker.iowait_percent().unwrap_or_else(|e| {
            debug!("Failed to read iowait: {}", e);
            0.0
        });
        let disk_usage_percent = fsusage::disk_usage_percent(&volume.mountpoint).unwrap_or_else(|e| {
            debug!("Disk usage unavailable for {}: {}", volume.mountpoint.display(), e);
            0.0
        });

        let mut write_rate_threshold = self.config.write_rate_threshold_mbps;
        if volume::is_high_performance_storage(volume) {
            write_rate_threshold *= 2.0;
        }

        let factors = [
            StressFactor {
                value: iowait_percent,
                threshold: self.config.iowait_threshold_percent,
            },
            StressFactor {
                value: sample.write_rate_mbps,
                threshold: write_rate_threshold,
            },
            StressFactor {
                value: disk_usage_percent,
                threshold: self.config.disk_usage_threshold_percent,
            },
        ];
        let io_stress_level = self.stress_model.stress_level(path, &factors);

        Ok(IoMetrics {
            iowait_percent,
            write_bytes_per_sec: sample.write_rate_mbps * 1024.0 * 1024.0,
            write_count_per_sec,
            disk_usage_percent,
            io_stress_level,
            volume: volume.clone(),
            is_volume_specific: true,
            network_latency_ms: None,
        })
    }

    /// System-wide fallback. Infallible; unreadable sources zero their
    /// contribution.
    fn collect_system_metrics(&self, path: &Path, volume: VolumeInfo) -> IoMetrics {
        let iowait_percent = self.iowait_tracker.iowait_percent().unwrap_or_else(|e| {
            debug!("Failed to read iowait: {}", e);
            0.0
        });

        let (write_bytes_per_sec, write_count_per_sec) = match diskstats::read_diskstats() {
            Ok(table) => {
                let totals = sum_disk_totals(&table);
                match self.disk_tracker.advance(totals) {
                    Some((prev, elapsed)) if elapsed > 0.0 => (
                        totals.bytes.saturating_sub(prev.bytes) as f64 / elapsed,
                        totals.writes.saturating_sub(prev.writes) as f64 / elapsed,
                    ),
                    _ => (0.0, 0.0),
                }
            }
            Err(e) => {
                debug!("Failed to read disk totals: {}", e);
                (0.0, 0.0)
            }
        };

        let disk_usage_percent = fsusage::disk_usage_percent(&volume.mountpoint).unwrap_or_else(|e| {
            debug!("Disk usage unavailable for {}: {}", volume.mountpoint.display(), e);
            0.0
        });

        let factors = [
            StressFactor {
                value: iowait_percent,
                threshold: self.config.iowait_threshold_percent,
            },
            StressFactor {
                value: write_bytes_per_sec / (1024.0 * 1024.0),
                threshold: self.config.write_rate_threshold_mbps,
            },
            StressFactor {
                value: disk_usage_percent,
                threshold: self.config.disk_usage_threshold_percent,
            },
        ];
        let io_stress_level = self.stress_model.stress_level(path, &factors);

        IoMetrics {
            iowait_percent,
            write_bytes_per_sec,
            write_count_per_sec,
            disk_usage_percent,
            io_stress_level,
            volume,
            is_volume_specific: false,
            network_latency_ms: None,
        }
    }
}

/// Five-band download schedule over the legacy stress level.
fn banded_download_speed(stress: f64, min_speed: u64, effective_max: u64) -> f64 {
    let min = min_speed as f64;
    let range = effective_max.saturating_sub(min_speed) as f64;

    if stress >= 0.9 {
        min
    } else if stress >= 0.7 {
        min + range * 0.2 * ((0.9 - stress) / 0.2)
    } else if stress >= 0.5 {
        min + range * 0.5 * ((0.7 - stress) / 0.2)
    } else {
        min + range * (1.0 - stress)
    }
}

/// Four-band upload schedule; the sub-0.3 full-speed band is handled by
/// the caller, so this covers stress >= 0.3.
fn banded_upload_speed(stress: f64, min_speed: u64, effective_max: u64) -> f64 {
    let min = min_speed as f64;
    let range = effective_max.saturating_sub(min_speed) as f64;

    if stress >= 0.9 {
        min
    } else if stress >= 0.7 {
        min + range * 0.2 * ((0.9 - stress) / 0.2)
    } else if stress >= 0.5 {
        min + range * 0.5 * ((0.7 - stress) / 0.2)
    } else {
        min + range * 0.75
    }
}

/// Clamps into [min, max] for finite ceilings; unlimited ceilings only
/// enforce the floor.
fn clamp_speed(speed: u64, min_speed: u64, max_speed: u64) -> u64 {
    if max_speed > 0 {
        speed.max(min_speed.min(max_speed)).min(max_speed)
    } else {
        speed.max(min_speed)
    }
}

/// Best-effort TCP connect probe to the storage server named by a
/// network mount's device string. DNS resolution is not bounded by the
/// connect timeout.
fn probe_network_latency(device: &str, fstype: &str) -> Option<f64> {
    let host = extract_server_host(device)?;
    let port = match fstype {
        "nfs" | "nfs4" => 2049,
        f if f.contains("cifs") || f.contains("smb") => 445,
        _ => 111,
    };

    let addr = (host.as_str(), port).to_socket_addrs().ok()?.next()?;
    let started = Instant::now();
    match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        Ok(_) => Some(started.elapsed().as_secs_f64() * 1000.0),
        Err(_) => None,
    }
}

/// Server component of an NFS (`server:/export`) or SMB (`//server/share`)
/// device string.
fn extract_server_host(device: &str) -> Option<String> {
    let host = if let Some(unc) = device.strip_prefix("//") {
        unc.split('/').next()?
    } else {
        device.split(':').next()?
    };

    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(host.to_string())
}
