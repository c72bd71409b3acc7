//! Generate testdata command implementation.
//!
//! Generates synthetic device sample JSON files for replay testing.

use chrono::{Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use iobrake::throttle::DeviceMetrics;

// Assumed size of one write request when deriving op counts from throughput
const AVG_WRITE_BYTES: u64 = 512 * 1024;

// Latency cap for the stall phase; hung I/O plateaus rather than growing forever
const MAX_STALL_LATENCY_MS: f64 = 5_000.0;

/// Sample phases in playback order. Calm establishes the latency
/// baseline, the later phases trip one indicator after another.
const PHASES: [&str; 4] = ["calm", "busy", "spike", "stall"];

/// Root structure for test data JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestData {
    pub version: String,
    pub generated_at: String,
    pub samples: Vec<DeviceMetrics>,
}

/// Load test data from JSON file.
pub fn load_test_data_from_file(path: &Path) -> Result<TestData, String> {
    debug!("Loading test data from: {}", path.display());

    if !path.exists() {
        return Err(format!("Test data file not found: {}", path.display()));
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read test data file: {}", e))?;
    let test_data: TestData = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse test data JSON: {}", e))?;

    info!(
        "Loaded test data version {} from {}",
        test_data.version, test_data.generated_at
    );

    Ok(test_data)
}

/// Generates a synthetic device sample JSON file for replay testing.
pub fn command_generate_testdata(
    output: PathBuf,
    device: String,
    samples_per_phase: usize,
    interval_seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    debug!(
        "Generating test data: device={}, samples_per_phase={}, interval={}s, output={}",
        device,
        samples_per_phase,
        interval_seconds,
        output.display()
    );

    let mut rng = rand::thread_rng();
    let mut samples: Vec<DeviceMetrics> = Vec::new();

    // Cumulative counters carried across phases so the stream reads as
    // one uninterrupted device history
    let mut write_count: u64 = 50_000;
    let mut write_bytes: u64 = 20 * 1024 * 1024 * 1024;
    let mut write_time_ms: u64 = 35_000;
    let mut busy_time_ms: u64 = 120_000;

    let total_samples = PHASES.len() * samples_per_phase;
    let mut timestamp =
        Utc::now() - Duration::seconds(total_samples as i64 * interval_seconds as i64);
    let mut stall_latency_ms = 0.0;

    for phase in PHASES {
        for step in 0..samples_per_phase {
            let (latency_ms, rate_mbps, busy_percent, in_flight) = match phase {
                // Light background writes. The low-activity gate keeps
                // updating the latency baseline here.
                "calm" => (
                    rng.gen_range(0.4..0.8),
                    rng.gen_range(3.0..8.0),
                    rng.gen_range(2.0..10.0),
                    rng.gen_range(0..3_u64),
                ),
                // Heavy but healthy: busy time saturates while latency
                // stays near the baseline
                "busy" => (
                    rng.gen_range(0.5..0.9),
                    rng.gen_range(80.0..150.0),
                    rng.gen_range(85.0..95.0),
                    rng.gen_range(10..30_u64),
                ),
                // Latency spikes and the queue backs up
                "spike" => (
                    rng.gen_range(6.0..15.0),
                    rng.gen_range(20.0..40.0),
                    rng.gen_range(85.0..99.0),
                    rng.gen_range(70..110_u64),
                ),
                // Latency climbs sample over sample while throughput
                // stays flat, the signature of a stalling device
                "stall" => {
                    if step == 0 {
                        stall_latency_ms = rng.gen_range(8.0..12.0);
                    } else {
                        stall_latency_ms = (stall_latency_ms * 1.4).min(MAX_STALL_LATENCY_MS);
                    }
                    (
                        stall_latency_ms,
                        rng.gen_range(11.0..13.0),
                        rng.gen_range(90.0..99.0),
                        rng.gen_range(80..120_u64),
                    )
                }
                _ => unreachable!("unknown phase"),
            };

            let delta_bytes = (rate_mbps * 1_048_576.0 * interval_seconds as f64) as u64;
            let delta_count = (delta_bytes / AVG_WRITE_BYTES).max(1);
            write_bytes += delta_bytes;
            write_count += delta_count;
            write_time_ms += (latency_ms * delta_count as f64) as u64;
            busy_time_ms += (busy_percent / 100.0 * interval_seconds as f64 * 1000.0) as u64;

            samples.push(DeviceMetrics {
                device_name: device.clone(),
                timestamp,
                write_count,
                write_bytes,
                write_time_ms,
                busy_time_ms,
                avg_write_latency_ms: latency_ms,
                write_rate_mbps: rate_mbps,
                busy_percent,
                in_flight_io: in_flight,
            });

            timestamp += Duration::seconds(interval_seconds as i64);
        }

        debug!("Generated {} '{}' samples", samples_per_phase, phase);
    }

    let test_data = TestData {
        version: "1.0".to_string(),
        generated_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        samples,
    };

    let json_content = serde_json::to_string_pretty(&test_data)?;
    fs::write(&output, &json_content)?;

    println!(
        "✅ Generated test data: {} samples for device '{}' in {}",
        test_data.samples.len(),
        device,
        output.display()
    );

    Ok(())
}
