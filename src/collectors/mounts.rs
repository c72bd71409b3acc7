//! Mount table collector.
//!
//! This module reads the mount table from /proc/mounts. Volume detection
//! matches download paths against these entries to find the backing device
//! and filesystem type.

use std::fs;

/// One mounted filesystem as listed in /proc/mounts.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
}

/// Reads all mounted filesystems from /proc/mounts.
pub fn read_mounts() -> Result<Vec<MountEntry>, String> {
    let content = fs::read_to_string("/proc/mounts")
        .map_err(|e| format!("Failed to read /proc/mounts: {}", e))?;

    Ok(parse_mounts(&content))
}

/// Parses /proc/mounts content into mount entries.
///
/// Format: device mountpoint fstype options dump pass
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    let mut mounts = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue; // Skip malformed lines
        }

        mounts.push(MountEntry {
            device: parts[0].to_string(),
            mountpoint: decode_octal_escapes(parts[1]),
            fstype: parts[2].to_string(),
        });
    }

    mounts
}

/// Decodes the octal escapes the kernel emits for special characters in
/// mount points: `\040` (space), `\011` (tab), `\012` (newline), `\134`
/// (backslash). Anything else is passed through unchanged.
fn decode_octal_escapes(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(value) = s
                .get(i + 1..i + 4)
                .and_then(|octal| u8::from_str_radix(octal, 8).ok())
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/nvme0n1p2 /data xfs rw,noatime 0 0
tmpfs /dev/shm tmpfs rw,nosuid,nodev 0 0
fileserver:/exports/media /mnt/media nfs4 rw,vers=4.2 0 0
/dev/sdb1 /mnt/my\\040disk ext4 rw 0 0
broken-line";

    #[test]
    fn test_parse_mounts_fields() {
        let mounts = parse_mounts(SAMPLE);
        assert_eq!(mounts.len(), 5);

        assert_eq!(mounts[0].device, "/dev/sda1");
        assert_eq!(mounts[0].mountpoint, "/");
        assert_eq!(mounts[0].fstype, "ext4");

        assert_eq!(mounts[3].device, "fileserver:/exports/media");
        assert_eq!(mounts[3].mountpoint, "/mnt/media");
        assert_eq!(mounts[3].fstype, "nfs4");
    }

    #[test]
    fn test_parse_mounts_decodes_escaped_spaces() {
        let mounts = parse_mounts(SAMPLE);
        assert_eq!(mounts[4].mountpoint, "/mnt/my disk");
    }

    #[test]
    fn test_decode_octal_escapes() {
        assert_eq!(decode_octal_escapes("/plain/path"), "/plain/path");
        assert_eq!(decode_octal_escapes("/with\\040space"), "/with space");
        assert_eq!(decode_octal_escapes("/tab\\011here"), "/tab\there");
        // Trailing backslash without a full escape is kept verbatim
        assert_eq!(decode_octal_escapes("/odd\\"), "/odd\\");
    }

    #[test]
    fn test_read_mounts_live() {
        let result = read_mounts();
        assert!(result.is_ok(), "Failed to read mounts: {:?}", result);

        let mounts = result.unwrap();
        assert!(!mounts.is_empty(), "No mounted filesystems found");

        let has_root = mounts.iter().any(|m| m.mountpoint == "/");
        assert!(has_root, "Root filesystem not found");
    }
}
