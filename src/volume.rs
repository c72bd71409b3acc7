//! Volume detection and storage classification.
//!
//! Maps a filesystem path to the mount that backs it and classifies the
//! mount by storage technology. The classification drives everything
//! downstream: network shares are sampled via interface counters, block
//! devices via `/proc/diskstats`, and unknown volumes fall back to
//! system-wide metrics.

use crate::collectors::diskstats;
use crate::collectors::mounts::{self, MountEntry};
use ahash::AHashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a mount-table snapshot stays valid before it is re-read.
const MOUNT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Filesystem types served over the network.
static NETWORK_FSTYPES: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        "nfs",
        "nfs4",
        "cifs",
        "smb",
        "smbfs",
        "smb2",
        "afs",
        "glusterfs",
        "lustre",
        "fuse.sshfs",
        "fuse.glusterfs",
        "fuse.cephfs",
        "fuse.s3fs",
    ]
    .into_iter()
    .collect()
});

/// Memory-backed filesystems; writes to these never touch a disk.
static MEMORY_FSTYPES: Lazy<AHashSet<&'static str>> =
    Lazy::new(|| ["tmpfs", "ramfs", "devtmpfs"].into_iter().collect());

/// Union/stacked filesystems where the real backing device is hidden.
static OVERLAY_FSTYPES: Lazy<AHashSet<&'static str>> =
    Lazy::new(|| ["overlay", "aufs", "devicemapper", "zfs"].into_iter().collect());

/// Conventional on-disk filesystems.
static LOCAL_FSTYPES: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    ["ext2", "ext3", "ext4", "xfs", "btrfs", "ntfs", "vfat"]
        .into_iter()
        .collect()
});

/// Device path prefixes for NVMe, Xen, virtio and loop block devices.
const BLOCK_DEVICE_PREFIXES: [&str; 4] = ["/dev/nvme", "/dev/xvd", "/dev/vd", "/dev/loop"];

/// Partition suffix on nvme/mmcblk devices (nvme0n1p2, mmcblk0p1).
static PARTITION_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"p\d+$").expect("invalid partition suffix pattern")
});

/// Broad storage technology categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// SATA/IDE disks and anything with a conventional on-disk fstype.
    LocalDisk,
    /// NVMe, Xen/virtio virtual disks, loop devices.
    BlockDevice,
    /// NFS, CIFS and friends; writes leave the machine over the network.
    NetworkFs,
    /// tmpfs/ramfs; cannot cause disk I/O pressure.
    Tmpfs,
    /// Overlay/union filesystems; the backing device is not visible.
    Overlay,
    Unknown,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StorageType::LocalDisk => "local disk",
            StorageType::BlockDevice => "block device",
            StorageType::NetworkFs => "network filesystem",
            StorageType::Tmpfs => "memory-backed",
            StorageType::Overlay => "overlay",
            StorageType::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Snapshot describing the volume that backs a path.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    /// The (absolutized) path the lookup was performed for.
    pub path: PathBuf,
    /// Device column from the mount table, e.g. `/dev/nvme0n1p2` or
    /// `server:/export`.
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub storage_type: StorageType,
    /// True exactly when the volume is a network filesystem.
    pub is_remote: bool,
    /// Whole-disk kernel device name (`sda`, `nvme0n1`) suitable as a
    /// `/proc/diskstats` key. `None` for remote and virtual devices.
    pub device_name: Option<String>,
}

/// Resolves paths to volumes using `/proc/mounts`.
///
/// The mount table is cached for a short interval; a lookup that finds
/// no matching mountpoint forces one refresh before giving up, so
/// freshly mounted volumes are still resolved correctly.
pub struct VolumeDetector {
    cache: RwLock<MountCache>,
    cache_ttl: Duration,
}

struct MountCache {
    entries: Vec<MountEntry>,
    refreshed_at: Option<Instant>,
}

impl Default for VolumeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeDetector {
    pub fn new() -> Self {
        Self::with_cache_ttl(MOUNT_CACHE_TTL)
    }

    pub fn with_cache_ttl(cache_ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(MountCache {
                entries: Vec::new(),
                refreshed_at: None,
            }),
            cache_ttl,
        }
    }

    /// Detects the volume backing `path`.
    ///
    /// Never fails: when the mount table cannot be read or no mount
    /// matches, an `Unknown` volume rooted at `/` is returned and the
    /// cause is logged at debug level.
    pub fn detect_volume(&self, path: &Path) -> VolumeInfo {
        let abs_path = absolutize(path);

        let entries = self.mount_entries(false);
        if let Some(volume) = Self::resolve(&entries, &abs_path) {
            return volume;
        }

        // A new mount may not be in the cached snapshot yet.
        let entries = self.mount_entries(true);
        if let Some(volume) = Self::resolve(&entries, &abs_path) {
            return volume;
        }

        debug!("No mount entry matches {}, treating volume as unknown", abs_path.display());
        unknown_volume(abs_path)
    }

    fn resolve(entries: &[MountEntry], abs_path: &Path) -> Option<VolumeInfo> {
        let entry = best_mount_match(entries, abs_path)?;
        let storage_type = classify(&entry.device, &entry.fstype);
        let is_remote = storage_type == StorageType::NetworkFs;
        let device_name = if is_remote {
            None
        } else {
            normalize_device_name(&entry.device)
        };

        Some(VolumeInfo {
            path: abs_path.to_path_buf(),
            device: entry.device.clone(),
            mountpoint: PathBuf::from(&entry.mountpoint),
            fstype: entry.fstype.clone(),
            storage_type,
            is_remote,
            device_name,
        })
    }

    /// Returns the cached mount table, re-reading `/proc/mounts` when the
    /// snapshot is stale or `force_refresh` is set.
    fn mount_entries(&self, force_refresh: bool) -> Vec<MountEntry> {
        if !force_refresh {
            if let Ok(cache) = self.cache.read() {
                if let Some(at) = cache.refreshed_at {
                    if at.elapsed() < self.cache_ttl {
                        return cache.entries.clone();
                    }
                }
            }
        }

        match mounts::read_mounts() {
            Ok(entries) => {
                if let Ok(mut cache) = self.cache.write() {
                    cache.entries = entries.clone();
                    cache.refreshed_at = Some(Instant::now());
                }
                entries
            }
            Err(e) => {
                debug!("Failed to read mount table: {}", e);
                // Stale entries beat no entries.
                self.cache
                    .read()
                    .map(|cache| cache.entries.clone())
                    .unwrap_or_default()
            }
        }
    }
}

/// True for storage fast enough that write-rate thresholds should be
/// relaxed: NVMe/SSD/flash by device name, or any virtual block device.
pub fn is_high_performance_storage(info: &VolumeInfo) -> bool {
    if info.storage_type == StorageType::BlockDevice {
        return true;
    }
    let device = info.device.to_lowercase();
    device.contains("nvme") || device.contains("ssd") || device.contains("flash")
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Nonexistent paths (e.g. a download target created later) still
    // need to resolve against the mount table.
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Picks the mount with the longest mountpoint that is a prefix of
/// `path`, comparing whole path components. Ties go to the entry listed
/// later, matching kernel mount-shadowing order.
fn best_mount_match<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    entries
        .iter()
        .filter(|entry| path.starts_with(Path::new(&entry.mountpoint)))
        .max_by_key(|entry| Path::new(&entry.mountpoint).components().count())
}

fn classify(device: &str, fstype: &str) -> StorageType {
    if NETWORK_FSTYPES.contains(fstype) {
        return StorageType::NetworkFs;
    }
    if MEMORY_FSTYPES.contains(fstype) {
        return StorageType::Tmpfs;
    }
    if OVERLAY_FSTYPES.contains(fstype) {
        return StorageType::Overlay;
    }
    if BLOCK_DEVICE_PREFIXES.iter().any(|p| device.starts_with(p)) {
        return StorageType::BlockDevice;
    }
    if device.starts_with("/dev/sd") || device.starts_with("/dev/hd") || LOCAL_FSTYPES.contains(fstype)
    {
        return StorageType::LocalDisk;
    }
    StorageType::Unknown
}

/// Reduces a mount-table device path to the whole-disk name used as a
/// `/proc/diskstats` key. Partition suffixes are stripped only when the
/// result is a recognized whole-disk name, so `loop0` and `dm-0` pass
/// through unchanged.
fn normalize_device_name(device: &str) -> Option<String> {
    let bare = device.strip_prefix("/dev/")?;

    let stripped = if bare.starts_with("nvme") || bare.starts_with("mmcblk") {
        PARTITION_SUFFIX.replace(bare, "").into_owned()
    } else {
        bare.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
    };

    if diskstats::is_whole_disk(&stripped) {
        Some(stripped)
    } else {
        Some(bare.to_string())
    }
}

fn unknown_volume(path: PathBuf) -> VolumeInfo {
    VolumeInfo {
        path,
        device: "unknown".to_string(),
        mountpoint: PathBuf::from("/"),
        fstype: "unknown".to_string(),
        storage_type: StorageType::Unknown,
        is_remote: false,
        device_name: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(device: &str, mountpoint: &str, fstype: &str) -> MountEntry {
        MountEntry {
            device: device.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: fstype.to_string(),
        }
    }

    #[test]
    fn test_classify_network_filesystems() {
        assert_eq!(classify("server:/export", "nfs4"), StorageType::NetworkFs);
        assert_eq!(classify("//nas/share", "cifs"), StorageType::NetworkFs);
        assert_eq!(classify("sshfs#host:", "fuse.sshfs"), StorageType::NetworkFs);
    }

    #[test]
    fn test_classify_memory_and_overlay() {
        assert_eq!(classify("tmpfs", "tmpfs"), StorageType::Tmpfs);
        assert_eq!(classify("overlay", "overlay"), StorageType::Overlay);
        assert_eq!(classify("tank/data", "zfs"), StorageType::Overlay);
    }

    #[test]
    fn test_classify_block_devices_before_local() {
        // NVMe carries an ext4 fstype but the device prefix wins.
        assert_eq!(classify("/dev/nvme0n1p2", "ext4"), StorageType::BlockDevice);
        assert_eq!(classify("/dev/xvda1", "xfs"), StorageType::BlockDevice);
        assert_eq!(classify("/dev/vda1", "ext4"), StorageType::BlockDevice);
        assert_eq!(classify("/dev/loop3", "squashfs"), StorageType::BlockDevice);
    }

    #[test]
    fn test_classify_local_disks() {
        assert_eq!(classify("/dev/sda1", "ext4"), StorageType::LocalDisk);
        assert_eq!(classify("/dev/hdb2", "ext3"), StorageType::LocalDisk);
        // Mapper devices fall through to the fstype check.
        assert_eq!(classify("/dev/mapper/vg-root", "ext4"), StorageType::LocalDisk);
        assert_eq!(classify("/dev/disk/by-uuid/abc", "btrfs"), StorageType::LocalDisk);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify("proc", "proc"), StorageType::Unknown);
        assert_eq!(classify("cgroup2", "cgroup2"), StorageType::Unknown);
    }

    #[test]
    fn test_normalize_device_name() {
        assert_eq!(normalize_device_name("/dev/sda1"), Some("sda".to_string()));
        assert_eq!(normalize_device_name("/dev/sdb"), Some("sdb".to_string()));
        assert_eq!(normalize_device_name("/dev/nvme0n1p2"), Some("nvme0n1".to_string()));
        assert_eq!(normalize_device_name("/dev/nvme1n1"), Some("nvme1n1".to_string()));
        assert_eq!(normalize_device_name("/dev/mmcblk0p1"), Some("mmcblk0".to_string()));
        assert_eq!(normalize_device_name("/dev/xvda1"), Some("xvda".to_string()));
    }

    #[test]
    fn test_normalize_device_name_keeps_unpartitioned_names() {
        // Stripping digits from these would name a device that does not
        // exist in /proc/diskstats.
        assert_eq!(normalize_device_name("/dev/loop0"), Some("loop0".to_string()));
        assert_eq!(normalize_device_name("/dev/dm-0"), Some("dm-0".to_string()));
        assert_eq!(normalize_device_name("/dev/md127"), Some("md127".to_string()));
    }

    #[test]
    fn test_normalize_device_name_non_dev() {
        assert_eq!(normalize_device_name("tmpfs"), None);
        assert_eq!(normalize_device_name("server:/export"), None);
        assert_eq!(normalize_device_name("overlay"), None);
    }

    #[test]
    fn test_best_mount_match_prefers_longest() {
        let entries = vec![
            entry("/dev/sda1", "/", "ext4"),
            entry("/dev/sdb1", "/home", "ext4"),
            entry("server:/export", "/home/media", "nfs4"),
        ];

        let m = best_mount_match(&entries, Path::new("/home/media/downloads")).unwrap();
        assert_eq!(m.mountpoint, "/home/media");

        let m = best_mount_match(&entries, Path::new("/home/user")).unwrap();
        assert_eq!(m.mountpoint, "/home");

        let m = best_mount_match(&entries, Path::new("/var/tmp")).unwrap();
        assert_eq!(m.mountpoint, "/");
    }

    #[test]
    fn test_best_mount_match_is_component_aware() {
        let entries = vec![
            entry("/dev/sda1", "/", "ext4"),
            entry("/dev/sdb1", "/data", "ext4"),
        ];

        // /database is not under /data.
        let m = best_mount_match(&entries, Path::new("/database/files")).unwrap();
        assert_eq!(m.mountpoint, "/");
    }

    #[test]
    fn test_best_mount_match_last_entry_shadows() {
        let entries = vec![
            entry("/dev/sda1", "/mnt", "ext4"),
            entry("/dev/sdb1", "/mnt", "xfs"),
        ];

        let m = best_mount_match(&entries, Path::new("/mnt/file")).unwrap();
        assert_eq!(m.device, "/dev/sdb1");
    }

    #[test]
    fn test_resolve_network_volume_has_no_device_name() {
        let entries = vec![entry("server:/vol", "/mnt/nas", "nfs4")];
        let info = VolumeDetector::resolve(&entries, Path::new("/mnt/nas/file")).unwrap();

        assert_eq!(info.storage_type, StorageType::NetworkFs);
        assert!(info.is_remote);
        assert_eq!(info.device_name, None);
        assert_eq!(info.device, "server:/vol");
    }

    #[test]
    fn test_detect_volume_live() {
        let detector = VolumeDetector::new();
        let info = detector.detect_volume(Path::new("."));

        // Whatever the host looks like, the lookup must produce a
        // consistent snapshot rather than an error.
        assert!(info.path.is_absolute());
        assert!(!info.device.is_empty());
        assert_eq!(info.is_remote, info.storage_type == StorageType::NetworkFs);
    }

    #[test]
    fn test_high_performance_storage() {
        let mut info = unknown_volume(PathBuf::from("/"));
        assert!(!is_high_performance_storage(&info));

        info.device = "/dev/nvme0n1p1".to_string();
        assert!(is_high_performance_storage(&info));

        info.device = "/dev/sda1".to_string();
        info.storage_type = StorageType::BlockDevice;
        assert!(is_high_performance_storage(&info));
    }
}
