//! Integration tests for volume detection.
//!
//! These tests resolve live paths through the detector and verify the
//! classification surface downstream monitoring relies on.

use std::path::Path;
use std::time::Duration;

use iobrake::volume::{StorageType, VolumeDetector};

#[test]
fn test_detect_root_volume() {
    let detector = VolumeDetector::new();
    let info = detector.detect_volume(Path::new("/"));

    assert_eq!(
        info.mountpoint,
        Path::new("/"),
        "no mountpoint is a longer prefix of / than / itself"
    );
    assert!(!info.device.is_empty(), "mount table device column missing");
    assert!(!info.fstype.is_empty(), "mount table fstype column missing");
}

#[test]
fn test_temp_dir_resolves_consistently() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let detector = VolumeDetector::new();

    let first = detector.detect_volume(dir.path());
    assert!(first.path.is_absolute());
    assert!(!first.mountpoint.as_os_str().is_empty());

    // Repeat lookup goes through the mount cache and must agree
    let second = detector.detect_volume(dir.path());
    assert_eq!(first.storage_type, second.storage_type);
    assert_eq!(first.device, second.device);
    assert_eq!(first.mountpoint, second.mountpoint);
}

#[test]
fn test_relative_path_is_absolutized() {
    let detector = VolumeDetector::new();
    let info = detector.detect_volume(Path::new("."));

    assert!(
        info.path.is_absolute(),
        "relative lookup path should be absolutized, got {:?}",
        info.path
    );
}

#[test]
fn test_nonexistent_path_matches_enclosing_mount() {
    let detector = VolumeDetector::new();

    // A path that cannot be canonicalized still prefix-matches the
    // root mount instead of failing
    let info = detector.detect_volume(Path::new("/nonexistent/iobrake-probe"));
    let root = detector.detect_volume(Path::new("/"));

    assert_eq!(info.mountpoint, root.mountpoint);
    assert_eq!(info.storage_type, root.storage_type);
}

#[test]
fn test_dev_shm_classified_as_tmpfs() {
    let shm = Path::new("/dev/shm");
    if !shm.exists() {
        // Not every environment mounts it
        return;
    }

    let detector = VolumeDetector::new();
    let info = detector.detect_volume(shm);

    // Only assert when the lookup actually landed on the tmpfs mount;
    // some containers overlay /dev differently
    if info.fstype == "tmpfs" {
        assert_eq!(info.storage_type, StorageType::Tmpfs);
        assert!(!info.is_remote);
        assert!(
            info.device_name.is_none(),
            "tmpfs has no physical device to collect counters from"
        );
    }
}

#[test]
fn test_zero_ttl_still_resolves() {
    // TTL zero forces a fresh /proc/mounts read on every lookup
    let detector = VolumeDetector::with_cache_ttl(Duration::from_secs(0));

    let first = detector.detect_volume(Path::new("/"));
    let second = detector.detect_volume(Path::new("/"));

    assert_eq!(first.mountpoint, second.mountpoint);
    assert_eq!(first.device, second.device);
}

#[test]
fn test_remote_flag_matches_storage_type() {
    let detector = VolumeDetector::new();
    let info = detector.detect_volume(Path::new("/"));

    match info.storage_type {
        StorageType::NetworkFs => assert!(info.is_remote),
        _ => assert!(!info.is_remote),
    }
}
