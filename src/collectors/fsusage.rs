//! Filesystem usage collector.
//!
//! This module reads capacity and free-space figures for a mounted
//! filesystem via libc statvfs. Disk usage is one of the static stress
//! factors: a nearly full volume slows writes long before the device
//! itself saturates.

use std::path::Path;

/// Capacity figures for the filesystem backing a path.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

impl FsUsage {
    /// Used space as a percentage of what is reachable for unprivileged
    /// writers (used + available, which excludes the root reserve).
    pub fn used_percent(&self) -> f64 {
        let reachable = self.used_bytes + self.available_bytes;
        if reachable == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / reachable as f64) * 100.0
    }
}

/// Reads filesystem usage for `path` using libc statvfs.
pub fn read_fs_usage(path: &Path) -> Result<FsUsage, String> {
    use std::ffi::CString;
    use std::mem;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| format!("Invalid path {}: {}", path.display(), e))?;

    unsafe {
        let mut stat: libc::statvfs = mem::zeroed();
        let result = libc::statvfs(c_path.as_ptr(), &mut stat);

        if result != 0 {
            return Err(format!("statvfs failed for {}", path.display()));
        }

        let block_size = stat.f_frsize as u64;
        let total_bytes = block_size * stat.f_blocks;
        let available_bytes = block_size * stat.f_bavail;
        let used_bytes = total_bytes.saturating_sub(block_size * stat.f_bfree);

        Ok(FsUsage {
            total_bytes,
            available_bytes,
            used_bytes,
        })
    }
}

/// Disk usage percentage for the filesystem backing `path`.
pub fn disk_usage_percent(path: &Path) -> Result<f64, String> {
    Ok(read_fs_usage(path)?.used_percent())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_percent() {
        let usage = FsUsage {
            total_bytes: 100 * 1024 * 1024 * 1024,
            available_bytes: 25 * 1024 * 1024 * 1024,
            used_bytes: 75 * 1024 * 1024 * 1024,
        };
        assert!((usage.used_percent() - 75.0).abs() < 0.001);
    }

    #[test]
    fn test_used_percent_empty_filesystem() {
        let usage = FsUsage {
            total_bytes: 0,
            available_bytes: 0,
            used_bytes: 0,
        };
        assert_eq!(usage.used_percent(), 0.0);
    }

    #[test]
    fn test_read_fs_usage_live() {
        let result = read_fs_usage(Path::new("/"));
        assert!(result.is_ok(), "Failed to stat root: {:?}", result);

        let usage = result.unwrap();
        assert!(usage.total_bytes > 0, "Root filesystem reports zero size");
        let percent = usage.used_percent();
        assert!((0.0..=100.0).contains(&percent), "got {}", percent);
    }

    #[test]
    fn test_read_fs_usage_missing_path() {
        let result = read_fs_usage(Path::new("/nonexistent/iobrake/test/path"));
        assert!(result.is_err());
    }
}
