//! Network interface statistics collector.
//!
//! This module reads cumulative per-interface counters from /proc/net/dev.
//! For downloads landing on network filesystems there is no per-mount I/O
//! counter, so the monitor approximates write throughput from the transmit
//! counters of the physical interfaces.

use ahash::AHashMap;
use std::fs;

/// Cumulative traffic counters for a single network interface.
#[derive(Debug, Clone, Copy)]
pub struct NetDevStats {
    pub receive_bytes: u64,
    pub receive_packets: u64,
    pub transmit_bytes: u64,
    pub transmit_packets: u64,
}

/// Transmit counters summed over all physical interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitTotals {
    pub bytes: u64,
    pub packets: u64,
}

/// Reads network interface statistics from /proc/net/dev.
///
/// Returns a map from interface name to its counters.
pub fn read_netdev_stats() -> Result<AHashMap<String, NetDevStats>, String> {
    let content = fs::read_to_string("/proc/net/dev")
        .map_err(|e| format!("Failed to read /proc/net/dev: {}", e))?;

    Ok(parse_netdev_stats(&content))
}

/// Parses /proc/net/dev content into per-interface counters.
pub fn parse_netdev_stats(content: &str) -> AHashMap<String, NetDevStats> {
    let mut stats = AHashMap::new();

    for (idx, line) in content.lines().enumerate() {
        // Skip the first two header lines
        if idx < 2 {
            continue;
        }

        // Split by ':' to separate interface name from counters
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 2 {
            continue;
        }

        let interface = parts[0].trim().to_string();

        let values: Vec<&str> = parts[1].split_whitespace().collect();
        if values.len() < 16 {
            continue; // Skip malformed lines
        }

        let net_stat = NetDevStats {
            receive_bytes: values[0].parse().unwrap_or(0),
            receive_packets: values[1].parse().unwrap_or(0),
            transmit_bytes: values[8].parse().unwrap_or(0),
            transmit_packets: values[9].parse().unwrap_or(0),
        };

        stats.insert(interface, net_stat);
    }

    stats
}

/// Sums transmit counters over the physical interfaces.
///
/// Loopback, veth pairs, bridges, and tunnel devices carry no storage
/// traffic and would double-count what the physical uplink already shows.
pub fn physical_transmit_totals(stats: &AHashMap<String, NetDevStats>) -> TransmitTotals {
    let mut totals = TransmitTotals::default();

    for (interface, stat) in stats {
        if is_virtual_interface(interface) {
            continue;
        }
        totals.bytes += stat.transmit_bytes;
        totals.packets += stat.transmit_packets;
    }

    totals
}

/// Whether an interface name denotes a virtual device.
fn is_virtual_interface(name: &str) -> bool {
    name == "lo"
        || name.starts_with("veth")
        || name.starts_with("docker")
        || name.starts_with("br-")
        || name.starts_with("virbr")
        || name.starts_with("tun")
        || name.starts_with("tap")
}
