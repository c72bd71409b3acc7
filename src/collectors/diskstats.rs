//! Disk I/O counter collector.
//!
//! This module reads cumulative per-device I/O counters from /proc/diskstats.
//! The throttle detector diffs consecutive snapshots of these counters to
//! derive write latency, write throughput, and device busy time.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;

/// /proc/diskstats reports sector counts in 512-byte units regardless of the
/// device's physical sector size.
pub const SECTOR_SIZE_BYTES: u64 = 512;

/// Matches whole-disk device names (sda, vdb, xvda, nvme0n1, mmcblk0) as
/// opposed to partitions (sda1, nvme0n1p2) or stacked devices (dm-0, md0).
static WHOLE_DISK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[shv]d[a-z]+|xvd[a-z]+|nvme\d+n\d+|mmcblk\d+)$").unwrap());

/// Cumulative I/O counters for a single device, as reported by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskCounters {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    /// Milliseconds spent writing (field 8 of the stats block).
    pub time_writing_ms: u64,
    /// I/Os currently in flight. The only gauge in the block; all other
    /// fields increase monotonically.
    pub ios_in_progress: u64,
    /// Milliseconds during which the device had I/O in flight.
    pub time_io_ms: u64,
}

impl DiskCounters {
    pub fn bytes_written(&self) -> u64 {
        self.sectors_written * SECTOR_SIZE_BYTES
    }

    pub fn bytes_read(&self) -> u64 {
        self.sectors_read * SECTOR_SIZE_BYTES
    }
}

/// Reads I/O counters for all devices from /proc/diskstats.
///
/// Returns a map from device name to its counters.
/// Format: major minor name read_ios read_merges read_sectors read_ticks write_ios write_merges write_sectors write_ticks ios_in_progress time_in_queue weighted_time_in_queue
pub fn read_diskstats() -> Result<AHashMap<String, DiskCounters>, String> {
    let content = fs::read_to_string("/proc/diskstats")
        .map_err(|e| format!("Failed to read /proc/diskstats: {}", e))?;

    Ok(parse_diskstats(&content))
}

/// Parses /proc/diskstats content into per-device counters.
pub fn parse_diskstats(content: &str) -> AHashMap<String, DiskCounters> {
    let mut stats = AHashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue; // Skip malformed lines
        }

        let device = parts[2].to_string();

        // Ram disks carry no meaningful throttling signal. Loop devices stay:
        // downloads can legitimately land on loop-backed storage.
        if device.starts_with("ram") {
            continue;
        }

        let counters = DiskCounters {
            reads_completed: parts[3].parse().unwrap_or(0),
            sectors_read: parts[5].parse().unwrap_or(0),
            writes_completed: parts[7].parse().unwrap_or(0),
            sectors_written: parts[9].parse().unwrap_or(0),
            time_writing_ms: parts[10].parse().unwrap_or(0),
            ios_in_progress: parts[11].parse().unwrap_or(0),
            time_io_ms: parts[12].parse().unwrap_or(0),
        };

        stats.insert(device, counters);
    }

    stats
}

/// Reads the counters of a single device.
pub fn read_device_counters(device: &str) -> Result<DiskCounters, String> {
    let mut table = read_diskstats()?;
    table
        .remove(device)
        .ok_or_else(|| format!("Device {} not present in /proc/diskstats", device))
}

/// Whether a device name denotes a whole physical disk.
///
/// Partitions and stacked devices (device-mapper, md raid) are excluded so
/// that summing whole-disk counters does not double-count the same write.
pub fn is_whole_disk(device: &str) -> bool {
    WHOLE_DISK_PATTERN.is_match(device)
}
