//! Integration tests for throttling detection over recorded workloads.
//!
//! Each test replays a synthetic sample stream through the public
//! replay API and checks the assessment the detector settles on.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use iobrake::config::ThrottleConfig;
use iobrake::throttle::{DeviceMetrics, ThrottleAction, ThrottleDetector};
use iobrake::volume::VolumeDetector;

fn detector() -> ThrottleDetector {
    ThrottleDetector::new(Arc::new(VolumeDetector::new()), ThrottleConfig::default())
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn sample(
    device: &str,
    at: DateTime<Utc>,
    latency_ms: f64,
    rate_mbps: f64,
    busy: f64,
    in_flight: u64,
) -> DeviceMetrics {
    DeviceMetrics {
        device_name: device.to_string(),
        timestamp: at,
        write_count: 0,
        write_bytes: 0,
        write_time_ms: 0,
        busy_time_ms: 0,
        avg_write_latency_ms: latency_ms,
        write_rate_mbps: rate_mbps,
        busy_percent: busy,
        in_flight_io: in_flight,
    }
}

/// Feeds `(latency_ms, rate_mbps, busy_percent, in_flight)` tuples into
/// the detector, 5 seconds apart starting at `start`. Returns the
/// timestamp after the last sample.
fn feed(
    det: &ThrottleDetector,
    device: &str,
    start: DateTime<Utc>,
    specs: &[(f64, f64, f64, u64)],
) -> DateTime<Utc> {
    let mut at = start;
    for &(latency, rate, busy, in_flight) in specs {
        det.record_sample(sample(device, at, latency, rate, busy, in_flight));
        at += Duration::seconds(5);
    }
    at
}

#[test]
fn test_calm_workload_reports_no_throttling() {
    let det = detector();
    feed(&det, "replay0", base_time(), &[(0.5, 5.0, 5.0, 1); 10]);

    let status = det.evaluate_device("replay0");

    assert!(!status.is_throttling);
    assert_eq!(status.severity, 0.0);
    assert_eq!(status.recommended_action, ThrottleAction::Continue);
    assert_eq!(status.recommended_speed_factor, 1.0);
    // All ten samples were quiet, so the baseline learned from them
    assert_eq!(status.baseline_latency_ms, Some(0.5));
}

#[test]
fn test_latency_spike_after_calm_baseline() {
    let det = detector();
    let after_calm = feed(&det, "replay1", base_time(), &[(0.5, 5.0, 5.0, 1); 5]);

    // A 10x latency jump under moderate load; rate rises with it, so
    // this is a spike, not a stall
    det.record_sample(sample("replay1", after_calm, 5.0, 50.0, 50.0, 10));
    let status = det.evaluate_device("replay1");

    assert!(status.latency_spike);
    assert!(!status.high_busy_time);
    assert!(!status.queue_congestion);
    assert!(!status.write_stalls);
    // Ratio 10 saturates the latency term: 0.4 * min(10/5, 1)
    assert!((status.severity - 0.4).abs() < 1e-9);
    assert!(status.is_throttling);
    assert_eq!(status.recommended_action, ThrottleAction::ReduceSpeed);
    assert_eq!(status.recommended_speed_factor, 0.5);
    // The busy spike sample itself must not have moved the baseline
    assert_eq!(status.baseline_latency_ms, Some(0.5));
}

#[test]
fn test_sustained_busy_device_reduces_speed() {
    let det = detector();
    feed(&det, "replay2", base_time(), &[(0.5, 100.0, 90.0, 20); 6]);

    let status = det.evaluate_device("replay2");

    assert!(status.high_busy_time);
    assert!(!status.latency_spike);
    assert!(!status.write_stalls);
    // Busy is the only indicator: 0.3 * 90/100
    assert!((status.severity - 0.27).abs() < 1e-9);
    assert_eq!(status.recommended_action, ThrottleAction::ReduceSpeed);
    assert_eq!(status.recommended_speed_factor, 0.7);
    // Heavy traffic never feeds the baseline
    assert_eq!(status.baseline_latency_ms, None);
}

#[test]
fn test_escalation_arc_ends_in_pause() {
    let det = detector();
    let device = "replay3";

    let t = feed(&det, device, base_time(), &[(0.5, 5.0, 5.0, 1); 5]);
    let calm = det.evaluate_device(device);

    let t = feed(&det, device, t, &[(0.5, 100.0, 90.0, 20); 3]);
    let busy = det.evaluate_device(device);

    feed(&det, device, t, &[(6.0, 30.0, 95.0, 80); 2]);
    let saturated = det.evaluate_device(device);

    // Severity must climb with each phase of the workload
    assert_eq!(calm.severity, 0.0);
    assert!(busy.severity > calm.severity);
    assert!(saturated.severity > busy.severity);

    // The last phase trips all four indicators at once: a spike over
    // the calm baseline, a full busy window, queue pressure past 64
    // and latency growth while throughput falls
    assert!(saturated.latency_spike);
    assert!(saturated.high_busy_time);
    assert!(saturated.queue_congestion);
    assert!(saturated.write_stalls);
    assert!(saturated.severity >= 0.7);
    assert_eq!(saturated.recommended_action, ThrottleAction::Pause);
    assert_eq!(saturated.recommended_speed_factor, 0.0);
    assert!(saturated.is_throttling);
}

#[test]
fn test_severity_tracks_queue_pressure() {
    let det = detector();
    let t = base_time();

    // Identical load on two devices except for queue depth usage
    det.record_sample(sample("replay-a", t, 0.5, 50.0, 50.0, 70));
    det.record_sample(sample("replay-b", t, 0.5, 50.0, 50.0, 100));

    let lighter = det.evaluate_device("replay-a");
    let heavier = det.evaluate_device("replay-b");

    assert!(lighter.queue_congestion);
    assert!(heavier.queue_congestion);
    assert!(
        heavier.severity > lighter.severity,
        "more in-flight I/O must score higher: {} vs {}",
        heavier.severity,
        lighter.severity
    );
    assert_eq!(lighter.recommended_action, ThrottleAction::ReduceSpeed);
    assert_eq!(heavier.recommended_action, ThrottleAction::ReduceSpeed);
}

#[test]
fn test_replay_is_deterministic() {
    let workload: Vec<(f64, f64, f64, u64)> = vec![
        (0.5, 5.0, 5.0, 1),
        (0.5, 5.0, 5.0, 1),
        (0.6, 8.0, 9.0, 2),
        (0.5, 120.0, 92.0, 25),
        (4.0, 40.0, 96.0, 90),
        (8.0, 12.0, 97.0, 110),
    ];

    let first = detector();
    feed(&first, "replay4", base_time(), &workload);
    let a = first.evaluate_device("replay4");

    let second = detector();
    feed(&second, "replay4", base_time(), &workload);
    let b = second.evaluate_device("replay4");

    assert_eq!(a.severity, b.severity);
    assert_eq!(a.is_throttling, b.is_throttling);
    assert_eq!(a.latency_spike, b.latency_spike);
    assert_eq!(a.high_busy_time, b.high_busy_time);
    assert_eq!(a.queue_congestion, b.queue_congestion);
    assert_eq!(a.write_stalls, b.write_stalls);
    assert_eq!(a.recommended_action, b.recommended_action);
    assert_eq!(a.recommended_speed_factor, b.recommended_speed_factor);
}

#[test]
fn test_live_detection_stays_in_bounds() {
    let det = detector();

    // Whatever the host is doing, the assessment must be well formed
    let status = det.detect_throttling(Path::new("/"));

    assert!((0.0..=1.0).contains(&status.severity));
    assert!((0.0..=1.0).contains(&status.recommended_speed_factor));
    assert!(status.max_queue_depth >= 1);
}
