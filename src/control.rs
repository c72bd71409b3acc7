//! Speed control loop and the limiter boundary.
//!
//! The engine never moves bytes itself. `SpeedLimiter` is the seam to
//! whatever does (a download manager, a transfer daemon); the
//! `SpeedControlLoop` periodically observes I/O conditions through an
//! `IoMonitor` and drives the limiter: pause under severe stress,
//! resume on recovery, and otherwise keep the advertised speed caps in
//! step with the current stress level.

use crate::monitor::{IoMonitor, DEFAULT_RECOVERY_TARGET_STRESS};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Stress at which a paused transfer may resume.
const RESUME_STRESS: f64 = DEFAULT_RECOVERY_TARGET_STRESS;

/// Stress above which the loop reports the throttled state.
const THROTTLED_STATE_STRESS: f64 = 0.1;

/// Errors surfaced by a speed-limiter backend.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("limiter backend unavailable: {0}")]
    Unavailable(String),
    #[error("limiter rejected command: {0}")]
    Rejected(String),
}

/// Commands the engine issues to the transfer layer.
///
/// A limit of 0 bytes/sec means "no explicit cap", not "stopped";
/// stopping is expressed through `pause_transfers`.
pub trait SpeedLimiter: Send + Sync {
    fn set_download_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError>;
    fn set_upload_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError>;
    fn pause_transfers(&self) -> Result<(), LimiterError>;
    fn resume_transfers(&self) -> Result<(), LimiterError>;
}

/// Outcome of one control cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDecision {
    pub stress: f64,
    pub paused: bool,
    /// Download cap in bytes/sec, 0 meaning uncapped.
    pub download_limit: u64,
    pub upload_limit: u64,
}

struct ControlState {
    paused: bool,
    throttled: bool,
    applied_download_limit: Option<u64>,
    applied_upload_limit: Option<u64>,
}

/// Observe -> decide -> apply cycle for one watched path.
pub struct SpeedControlLoop {
    monitor: Arc<IoMonitor>,
    limiter: Box<dyn SpeedLimiter>,
    path: PathBuf,
    interval: Duration,
    min_speed: u64,
    max_speed: u64,
    min_upload_speed: u64,
    max_upload_speed: u64,
    state: Mutex<ControlState>,
}

impl SpeedControlLoop {
    /// Builds a control loop over `monitor`'s configuration (sampling
    /// interval and speed bounds come from there).
    pub fn new(monitor: Arc<IoMonitor>, limiter: Box<dyn SpeedLimiter>, path: PathBuf) -> Self {
        let config = monitor.config();
        let interval = Duration::from_secs_f64(config.sample_interval_seconds.max(0.1));
        let min_speed = config.min_speed_bytes_per_sec;
        let max_speed = config.max_speed_bytes_per_sec;
        let min_upload_speed = config.min_upload_speed_bytes_per_sec;
        let max_upload_speed = config.max_upload_speed_bytes_per_sec;

        SpeedControlLoop {
            monitor,
            limiter,
            path,
            interval,
            min_speed,
            max_speed,
            min_upload_speed,
            max_upload_speed,
            state: Mutex::new(ControlState {
                paused: false,
                throttled: false,
                applied_download_limit: None,
                applied_upload_limit: None,
            }),
        }
    }

    /// One observe -> decide -> apply cycle.
    ///
    /// Pausing takes precedence over limit changes; a paused transfer
    /// receives no limit updates until it resumes. Limits are re-sent
    /// to the limiter only when they actually change.
    pub fn tick(&self) -> Result<ControlDecision, LimiterError> {
        let metrics = self.monitor.get_current_metrics(&self.path);
        let stress = metrics.io_stress_level;

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let throttled_now = stress > THROTTLED_STATE_STRESS;
        if throttled_now != state.throttled {
            if throttled_now {
                warn!(
                    "I/O throttling engaged on {} (stress {:.2})",
                    self.path.display(),
                    stress
                );
            } else {
                info!(
                    "I/O throttling released on {} (stress {:.2})",
                    self.path.display(),
                    stress
                );
            }
            state.throttled = throttled_now;
        }

        if state.paused {
            if stress <= RESUME_STRESS {
                self.limiter.resume_transfers()?;
                state.paused = false;
                info!(
                    "I/O recovered on {} (stress {:.2}), resuming transfers",
                    self.path.display(),
                    stress
                );
            } else {
                return Ok(ControlDecision {
                    stress,
                    paused: true,
                    download_limit: state.applied_download_limit.unwrap_or(0),
                    upload_limit: state.applied_upload_limit.unwrap_or(0),
                });
            }
        } else if self.monitor.should_pause_downloads(Some(&metrics), &self.path) {
            self.limiter.pause_transfers()?;
            state.paused = true;
            warn!(
                "Pausing transfers on {} (stress {:.2})",
                self.path.display(),
                stress
            );
            return Ok(ControlDecision {
                stress,
                paused: true,
                download_limit: state.applied_download_limit.unwrap_or(0),
                upload_limit: state.applied_upload_limit.unwrap_or(0),
            });
        }

        let (download_limit, _) = self.monitor.calculate_download_speed_limit(
            Some(&metrics),
            self.min_speed,
            self.max_speed,
            &self.path,
        );
        let (upload_limit, _) = self.monitor.calculate_upload_speed_limit(
            Some(&metrics),
            self.min_upload_speed,
            self.max_upload_speed,
            &self.path,
        );

        if state.applied_download_limit != Some(download_limit) {
            self.limiter.set_download_limit(download_limit)?;
            state.applied_download_limit = Some(download_limit);
            info!("Download limit set to {}", format_speed(download_limit));
        }
        if state.applied_upload_limit != Some(upload_limit) {
            self.limiter.set_upload_limit(upload_limit)?;
            state.applied_upload_limit = Some(upload_limit);
            info!("Upload limit set to {}", format_speed(upload_limit));
        }

        Ok(ControlDecision {
            stress,
            paused: false,
            download_limit,
            upload_limit,
        })
    }

    /// Runs `tick` on the configured interval until the future is
    /// dropped. Callers select! this against their shutdown signal.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick() {
                error!("Speed limiter command failed: {}", e);
            }
        }
    }
}

/// Limiter that only logs the commands it receives. Backs watch mode
/// when no transfer layer is attached.
pub struct LogSpeedLimiter;

impl SpeedLimiter for LogSpeedLimiter {
    fn set_download_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError> {
        info!("limiter: download limit -> {}", format_speed(bytes_per_sec));
        Ok(())
    }

    fn set_upload_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError> {
        info!("limiter: upload limit -> {}", format_speed(bytes_per_sec));
        Ok(())
    }

    fn pause_transfers(&self) -> Result<(), LimiterError> {
        info!("limiter: pause transfers");
        Ok(())
    }

    fn resume_transfers(&self) -> Result<(), LimiterError> {
        info!("limiter: resume transfers");
        Ok(())
    }
}

/// Human-readable speed, with 0 rendered as "unlimited".
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "unlimited".to_string();
    }
    let mb = bytes_per_sec as f64 / (1024.0 * 1024.0);
    if mb >= 1.0 {
        format!("{:.1} MB/s", mb)
    } else {
        format!("{:.0} KB/s", bytes_per_sec as f64 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::{StressFactor, StressModel};
    use crate::volume::VolumeDetector;
    use std::path::Path;

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        Download(u64),
        Upload(u64),
        Pause,
        Resume,
    }

    struct RecordingLimiter {
        commands: Arc<Mutex<Vec<Command>>>,
    }

    impl SpeedLimiter for RecordingLimiter {
        fn set_download_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError> {
            self.commands.lock().unwrap().push(Command::Download(bytes_per_sec));
            Ok(())
        }

        fn set_upload_limit(&self, bytes_per_sec: u64) -> Result<(), LimiterError> {
            self.commands.lock().unwrap().push(Command::Upload(bytes_per_sec));
            Ok(())
        }

        fn pause_transfers(&self) -> Result<(), LimiterError> {
            self.commands.lock().unwrap().push(Command::Pause);
            Ok(())
        }

        fn resume_transfers(&self) -> Result<(), LimiterError> {
            self.commands.lock().unwrap().push(Command::Resume);
            Ok(())
        }
    }

    /// Reports whatever stress the test dials in.
    struct AdjustableStress(Arc<Mutex<f64>>);

    impl StressModel for AdjustableStress {
        fn stress_level(&self, _path: &Path, _factors: &[StressFactor]) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    fn controlled_loop(
        stress: Arc<Mutex<f64>>,
    ) -> (SpeedControlLoop, Arc<Mutex<Vec<Command>>>) {
        let config = MonitorConfig {
            enable_dynamic_throttling: false,
            min_speed_bytes_per_sec: 10_000_000,
            max_speed_bytes_per_sec: 100_000_000,
            min_upload_speed_bytes_per_sec: 5_000_000,
            max_upload_speed_bytes_per_sec: 50_000_000,
            ..MonitorConfig::default()
        };
        let monitor = IoMonitor::with_stress_model(
            config,
            Arc::new(VolumeDetector::new()),
            Box::new(AdjustableStress(stress)),
        );

        let commands = Arc::new(Mutex::new(Vec::new()));
        let limiter = RecordingLimiter {
            commands: Arc::clone(&commands),
        };
        let control = SpeedControlLoop::new(Arc::new(monitor), Box::new(limiter), PathBuf::from("."));
        (control, commands)
    }

    #[test]
    fn test_limits_applied_only_on_change() {
        let stress = Arc::new(Mutex::new(0.0));
        let (control, commands) = controlled_loop(Arc::clone(&stress));

        let decision = control.tick().unwrap();
        assert!(!decision.paused);
        assert_eq!(decision.download_limit, 100_000_000);
        assert_eq!(decision.upload_limit, 50_000_000);
        assert_eq!(
            *commands.lock().unwrap(),
            vec![Command::Download(100_000_000), Command::Upload(50_000_000)]
        );

        // Same stress, same limits: nothing new is sent.
        control.tick().unwrap();
        assert_eq!(commands.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_limits_follow_stress_changes() {
        let stress = Arc::new(Mutex::new(0.0));
        let (control, commands) = controlled_loop(Arc::clone(&stress));

        control.tick().unwrap();
        commands.lock().unwrap().clear();

        *stress.lock().unwrap() = 0.92;
        let decision = control.tick().unwrap();
        assert_eq!(decision.download_limit, 10_000_000);
        assert_eq!(decision.upload_limit, 5_000_000);
        assert_eq!(commands.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_pause_takes_precedence_and_resume_follows() {
        let stress = Arc::new(Mutex::new(0.97));
        let (control, commands) = controlled_loop(Arc::clone(&stress));

        let decision = control.tick().unwrap();
        assert!(decision.paused);
        // No limit commands while pausing.
        assert_eq!(*commands.lock().unwrap(), vec![Command::Pause]);

        // Still stressed: stays paused, no further commands.
        *stress.lock().unwrap() = 0.8;
        let decision = control.tick().unwrap();
        assert!(decision.paused);
        assert_eq!(commands.lock().unwrap().len(), 1);

        // Recovered: resume, then fresh limits in the same cycle.
        *stress.lock().unwrap() = 0.2;
        let decision = control.tick().unwrap();
        assert!(!decision.paused);
        let recorded = commands.lock().unwrap().clone();
        assert_eq!(recorded[1], Command::Resume);
        assert!(matches!(recorded[2], Command::Download(_)));
        assert!(matches!(recorded[3], Command::Upload(_)));
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0), "unlimited");
        assert_eq!(format_speed(512_000), "500 KB/s");
        assert_eq!(format_speed(10 * 1024 * 1024), "10.0 MB/s");
    }
}
