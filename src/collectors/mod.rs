//! Collectors module for system metrics.
//!
//! This module contains the low-level readers the throttling engine is
//! built on: disk I/O counters, mount tables, CPU iowait, network
//! interface statistics, and filesystem usage.

pub mod cpustat;
pub mod diskstats;
pub mod fsusage;
pub mod mounts;
pub mod netdev;
