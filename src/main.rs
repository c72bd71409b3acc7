//! iobrake - version 0.1.0
//!
//! Adaptive I/O throttling monitor with tracing logging.
//! This is the main entry point that initializes the control loop and
//! handles subcommands.

mod cli;
mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

use iobrake::config::{load_config, validate_effective_config, Config, DEFAULT_WATCH_PATH};
use iobrake::control::{LogSpeedLimiter, SpeedControlLoop};
use iobrake::monitor::IoMonitor;
use iobrake::startup_checks;
use iobrake::volume::VolumeDetector;

use cli::{Args, Commands, ConfigFormat, LogLevel};
use commands::{command_check, command_config, command_generate_testdata, command_test};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config, args: &Args) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| match config.log_level.as_deref() {
            Some("off") => LogLevel::Off,
            Some("error") => LogLevel::Error,
            Some("warn") => LogLevel::Warn,
            Some("debug") => LogLevel::Debug,
            Some("trace") => LogLevel::Trace,
            _ => LogLevel::Info,
        });

    let log_level = match level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", level);
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    // Override with CLI args
    if let Some(path) = &args.path {
        config.path = Some(path.clone());
    }
    if let Some(interval) = args.interval {
        config.sample_interval_seconds = Some(interval);
    }
    if let Some(min_speed) = args.min_speed {
        config.min_speed_bytes_per_sec = Some(min_speed);
    }
    if let Some(max_speed) = args.max_speed {
        config.max_speed_bytes_per_sec = Some(max_speed);
    }
    if let Some(min_upload) = args.min_upload_speed {
        config.min_upload_speed_bytes_per_sec = Some(min_upload);
    }
    if let Some(max_upload) = args.max_upload_speed {
        config.max_upload_speed_bytes_per_sec = Some(max_upload);
    }

    // Feature flags
    if args.disable_volume_monitoring {
        config.enable_volume_specific_monitoring = Some(false);
    }
    if args.disable_dynamic_throttling {
        config.enable_dynamic_throttling = Some(false);
    }

    Ok(config)
}

/// Shows configuration in requested format
fn show_config(config: &Config, format: &ConfigFormat) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };

    println!("{output}");
    Ok(())
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        if args.show_config {
            return show_config(&config, &args.config_format);
        }
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        // GenerateTestdata doesn't need config validation
        if let Commands::GenerateTestdata {
            output,
            device,
            samples_per_phase,
            interval_seconds,
        } = command
        {
            return command_generate_testdata(
                output.clone(),
                device.clone(),
                *samples_per_phase,
                *interval_seconds,
            );
        }

        return match command {
            // Check reports validation problems itself instead of
            // dying before its diagnostics can print
            Commands::Check {
                volume,
                counters,
                all,
            } => {
                let config = resolve_config(&args)?;
                command_check(*volume, *counters, *all, &config)
            }

            Commands::Config {
                output,
                format,
                commented,
            } => command_config(output.clone(), format.clone(), *commented),

            Commands::Test {
                iterations,
                interval_ms,
                testdata,
                verbose,
                format,
            } => {
                let config = load_validated_config(&args)?;
                command_test(
                    *iterations,
                    *interval_ms,
                    testdata.clone(),
                    *verbose,
                    format.clone(),
                    &config,
                )
            }

            Commands::GenerateTestdata { .. } => unreachable!("GenerateTestdata handled above"),
        };
    }

    // Load configuration for watch mode
    let config = resolve_config(&args)?;

    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config, &args);

    info!(
        "Starting iobrake v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_BUILD_TIMESTAMP")
    );

    let watch_path = config
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WATCH_PATH));

    // Validate runtime requirements BEFORE starting the loop
    if let Err(e) = startup_checks::validate_requirements(&watch_path) {
        error!("❌ Startup validation failed: {}", e);
        error!("   The monitor will start but may not function correctly!");
        // Continue anyway - don't fail hard
    }

    let monitor_config = config.to_monitor_config();

    info!(
        "Watching {} every {:.1}s (volume-specific: {}, dynamic throttling: {})",
        watch_path.display(),
        monitor_config.sample_interval_seconds,
        monitor_config.enable_volume_specific_monitoring,
        monitor_config.enable_dynamic_throttling
    );

    let volume_detector = Arc::new(VolumeDetector::new());
    let volume = volume_detector.detect_volume(&watch_path);
    info!(
        "Resolved {} -> {} ({}) mounted at {}",
        watch_path.display(),
        volume.device,
        volume.storage_type,
        volume.mountpoint.display()
    );

    let monitor = Arc::new(IoMonitor::new(monitor_config, volume_detector));
    let control_loop = SpeedControlLoop::new(
        Arc::clone(&monitor),
        Box::new(LogSpeedLimiter),
        watch_path.clone(),
    );

    // Setup graceful shutdown signal handlers
    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    tokio::select! {
        _ = control_loop.run() => {
            error!("Control loop exited unexpectedly");
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received, exiting...");
        }
    }

    info!("iobrake stopped gracefully");
    Ok(())
}
