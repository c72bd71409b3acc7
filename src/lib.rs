//! iobrake - adaptive I/O throttling for download clients
//!
//! This library watches the storage behind a download path, detects device
//! throttling from kernel write counters, and derives download/upload speed
//! limits that back off before the disk stalls. It is transfer-engine
//! agnostic: callers plug their own rate limiter into the control loop.
//!
//! # Features
//!
//! - **Volume Detection**: Resolve any path to its backing device and storage type
//! - **Throttling Detection**: Latency, busy-time, queue and write-stall indicators
//!   derived from /proc/diskstats
//! - **Adaptive Speed Limits**: Download/upload caps interpolated from observed stress
//! - **Control Loop**: Drives a `SpeedLimiter` implementation on a fixed cadence
//!
//! # Usage
//!
//! ```rust
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use iobrake::config::MonitorConfig;
//! use iobrake::monitor::IoMonitor;
//! use iobrake::volume::VolumeDetector;
//!
//! let detector = Arc::new(VolumeDetector::new());
//! let monitor = IoMonitor::new(MonitorConfig::default(), detector);
//!
//! let metrics = monitor.get_current_metrics(Path::new("."));
//! println!(
//!     "stress {:.2} on {} ({})",
//!     metrics.io_stress_level, metrics.volume.device, metrics.volume.storage_type
//! );
//!
//! let (limit, stress) = monitor.calculate_download_speed_limit(
//!     Some(&metrics),
//!     1_048_576, // floor: 1 MB/s
//!     0,         // ceiling: unlimited
//!     Path::new("."),
//! );
//! assert!((0.0..=1.0).contains(&stress));
//! # let _ = limit;
//! ```

pub mod collectors;
pub mod config;
pub mod control;
pub mod monitor;
pub mod startup_checks;
pub mod throttle;
pub mod volume;

// Re-export main types for convenience
pub use config::{Config, MonitorConfig, ThrottleConfig};
pub use control::{ControlDecision, LimiterError, LogSpeedLimiter, SpeedControlLoop, SpeedLimiter};
pub use monitor::{IoMetrics, IoMonitor};
pub use throttle::{DeviceMetrics, ThrottleAction, ThrottleDetector, ThrottlingStatus};
pub use volume::{StorageType, VolumeDetector, VolumeInfo};
