//! System-wide CPU iowait collector.
//!
//! This module reads the aggregate CPU line from /proc/stat and derives the
//! iowait percentage from deltas between consecutive reads. iowait feeds the
//! system-wide fallback stress computation when no device-level counters are
//! available.

use std::fs;
use std::sync::RwLock;

/// Aggregate CPU time counters from the first line of /proc/stat.
#[derive(Debug, Clone, Copy)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// Total CPU time across all fields.
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }
}

/// Reads the aggregate CPU counters from /proc/stat.
pub fn read_cpu_times() -> Result<CpuTimes, String> {
    let content = fs::read_to_string("/proc/stat")
        .map_err(|e| format!("Failed to read /proc/stat: {}", e))?;

    parse_cpu_times(&content)
}

/// Parses the aggregate "cpu " line out of /proc/stat content.
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes, String> {
    for line in content.lines() {
        // The aggregate line is "cpu  ..."; per-core lines are "cpu0", "cpu1", ...
        if !line.starts_with("cpu ") {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(format!(
                "Invalid /proc/stat cpu line: expected at least 8 fields, got {}",
                parts.len()
            ));
        }

        return Ok(CpuTimes {
            user: parts[1].parse().unwrap_or(0),
            nice: parts[2].parse().unwrap_or(0),
            system: parts[3].parse().unwrap_or(0),
            idle: parts[4].parse().unwrap_or(0),
            iowait: parts[5].parse().unwrap_or(0),
            irq: parts[6].parse().unwrap_or(0),
            softirq: parts[7].parse().unwrap_or(0),
            steal: if parts.len() > 8 {
                parts[8].parse().unwrap_or(0)
            } else {
                0
            },
        });
    }

    Err("No aggregate cpu line found in /proc/stat".to_string())
}

/// Tracks consecutive CPU samples and computes the iowait percentage from
/// their delta.
///
/// The first call has no previous sample and reports 0.
pub struct IowaitTracker {
    previous: RwLock<Option<CpuTimes>>,
}

impl IowaitTracker {
    pub fn new() -> Self {
        Self {
            previous: RwLock::new(None),
        }
    }

    /// Reads current CPU counters and returns the iowait percentage since
    /// the previous call.
    pub fn iowait_percent(&self) -> Result<f64, String> {
        let current = read_cpu_times()?;
        self.advance(current)
    }

    /// Computes the iowait percentage against the stored sample and replaces
    /// it with `current`.
    fn advance(&self, current: CpuTimes) -> Result<f64, String> {
        let mut guard = self
            .previous
            .write()
            .map_err(|e| format!("Failed to acquire lock: {}", e))?;

        let percent = match guard.as_ref() {
            Some(previous) => {
                let delta_total = current.total().saturating_sub(previous.total());
                let delta_iowait = current.iowait.saturating_sub(previous.iowait);

                if delta_total > 0 {
                    (delta_iowait as f64 / delta_total as f64) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        *guard = Some(current);
        Ok(percent)
    }
}

impl Default for IowaitTracker {
    fn default() -> Self {
        Self::new()
    }
}
