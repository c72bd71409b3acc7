//! CLI arguments and subcommands for iobrake.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "iobrake",
    about = "Adaptive I/O throttling monitor for download directories",
    long_about = "Adaptive I/O throttling monitor for download directories.\n\n\
                  Watches the block device or network share behind a download path, \
                  detects storage throttling from kernel write counters, and derives \
                  download/upload speed limits that back off before the disk stalls.",
    author = "Michael Moll <iobrake@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/cansp-dev/iobrake — More info: https://www.herakles.now — Support: iobrake@herakles.now"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Download directory to watch
    #[arg(short = 'p', long)]
    pub path: Option<PathBuf>,

    /// Sampling interval in seconds
    #[arg(short = 'i', long)]
    pub interval: Option<f64>,

    /// Minimum download speed in bytes per second
    #[arg(long)]
    pub min_speed: Option<u64>,

    /// Maximum download speed in bytes per second (0 = unlimited)
    #[arg(long)]
    pub max_speed: Option<u64>,

    /// Minimum upload speed in bytes per second
    #[arg(long)]
    pub min_upload_speed: Option<u64>,

    /// Maximum upload speed in bytes per second (0 = unlimited)
    #[arg(long)]
    pub max_upload_speed: Option<u64>,

    /// Log level (overrides the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Always use system-wide metrics instead of per-volume monitoring
    #[arg(long)]
    pub disable_volume_monitoring: bool,

    /// Use static thresholds instead of dynamic throttling detection
    #[arg(long)]
    pub disable_dynamic_throttling: bool,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and system requirements
    Check {
        /// Check volume resolution for the watch path
        #[arg(long)]
        volume: bool,

        /// Check kernel counter sources
        #[arg(long)]
        counters: bool,

        /// Check all system requirements
        #[arg(long)]
        all: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Test throttling detection against live counters or recorded samples
    Test {
        /// Number of sampling iterations
        #[arg(short = 'n', long, default_value_t = 5)]
        iterations: usize,

        /// Milliseconds between live sampling iterations
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Replay recorded device samples from a JSON file instead of live counters
        #[arg(short = 't', long)]
        testdata: Option<PathBuf>,

        /// Show per-sample detail
        #[arg(long)]
        verbose: bool,

        /// Output format for the final report
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate synthetic device sample JSON file
    GenerateTestdata {
        /// Output file path
        #[arg(short = 'o', long, default_value = "testdata.json")]
        output: PathBuf,

        /// Device name used in generated samples
        #[arg(long, default_value = "sda")]
        device: String,

        /// Samples per phase (calm, busy, spike, stall)
        #[arg(long, default_value_t = 10)]
        samples_per_phase: usize,

        /// Seconds between consecutive samples
        #[arg(long, default_value_t = 5)]
        interval_seconds: u64,
    },
}
