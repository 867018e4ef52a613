//! System probing: which disk are we booted from, and what is mounted on it.
//!
//! [`SystemProbe`] is a capability set rather than a class hierarchy; the
//! real implementation reads the kernel's live mount table and `lsblk`,
//! and tests substitute a fixed-data fake. The probe is strictly the read
//! side of the pipeline and never fails hard: unreadable system state
//! degrades to the [`FALLBACK_BOOT_DISK`] sentinel or an empty partition
//! list, which later safety checks will refuse to act on.

use std::fs;
use std::process::Command;

use crate::device::base_disk;

/// Sentinel source name used when the boot device cannot be determined.
pub const FALLBACK_BOOT_DISK: &str = "booted-disk";

/// A partition belonging to a disk, possibly mounted.
///
/// `mountpoint` is empty for unmounted partitions discovered through the
/// "sync all" mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPartition {
    pub device: String,
    pub mountpoint: String,
}

pub trait SystemProbe {
    /// The block device backing `/`, or [`FALLBACK_BOOT_DISK`] when the
    /// mount table is unreadable.
    fn boot_disk(&self) -> String;

    /// Mounted partitions whose base disk equals `disk`. Empty on probe
    /// failure.
    fn mounted_partitions(&self, disk: &str) -> Vec<MountedPartition>;

    /// All partitions of `disk`, mounted or not; unmounted entries carry an
    /// empty mountpoint.
    fn all_partitions(&self, disk: &str) -> Vec<MountedPartition>;
}

/// Probe backed by the local OS (`/proc/self/mounts` and `lsblk`).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProbe;

impl LocalProbe {
    pub fn new() -> Self {
        LocalProbe
    }
}

impl SystemProbe for LocalProbe {
    fn boot_disk(&self) -> String {
        match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => {
                parse_root_device(&mounts).unwrap_or_else(|| FALLBACK_BOOT_DISK.to_string())
            }
            Err(_) => FALLBACK_BOOT_DISK.to_string(),
        }
    }

    fn mounted_partitions(&self, disk: &str) -> Vec<MountedPartition> {
        match fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => parse_mounted_partitions(&mounts, disk),
            Err(_) => Vec::new(),
        }
    }

    fn all_partitions(&self, disk: &str) -> Vec<MountedPartition> {
        let base = base_disk(disk);
        let base = base.trim_start_matches("/dev/").to_string();
        let output = match Command::new("lsblk")
            .args(["-nr", "-o", "NAME,MOUNTPOINT,TYPE"])
            .output()
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
            _ => return Vec::new(),
        };
        parse_all_partitions(&output, &base)
    }
}

/// Find the device mounted at `/` in `/proc/self/mounts` content.
pub fn parse_root_device(mounts: &str) -> Option<String> {
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        if let Some("/") = fields.next() {
            return Some(device.to_string());
        }
    }
    None
}

/// Mount table entries whose device belongs to `disk`.
pub fn parse_mounted_partitions(mounts: &str, disk: &str) -> Vec<MountedPartition> {
    let mut result = Vec::new();
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let (device, mountpoint) = (fields[0], fields[1]);
        if base_disk(device) == disk {
            result.push(MountedPartition {
                device: device.to_string(),
                mountpoint: mountpoint.to_string(),
            });
        }
    }
    result
}

/// Entries of type `part` under the disk's basename in `lsblk -nr
/// -o NAME,MOUNTPOINT,TYPE` output. lsblk prints `-` (or nothing) for
/// unmounted partitions; both normalise to an empty mountpoint.
pub fn parse_all_partitions(listing: &str, base: &str) -> Vec<MountedPartition> {
    let mut result = Vec::new();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (name, mountpoint, kind) = match fields.as_slice() {
            [name, mountpoint, kind] => (*name, *mountpoint, *kind),
            [name, kind] => (*name, "", *kind),
            _ => continue,
        };
        if kind != "part" || !name.starts_with(base) {
            continue;
        }
        let mountpoint = if mountpoint == "-" { "" } else { mountpoint };
        result.push(MountedPartition {
            device: format!("/dev/{}", name),
            mountpoint: mountpoint.to_string(),
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/mmcblk0p2 / ext4 rw,noatime 0 0
devtmpfs /dev devtmpfs rw,relatime 0 0
/dev/mmcblk0p1 /boot vfat rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid 0 0
/dev/sda1 /media/usb ext4 rw 0 0
";

    #[test]
    fn test_parse_root_device() {
        assert_eq!(
            parse_root_device(MOUNTS).as_deref(),
            Some("/dev/mmcblk0p2")
        );
        assert_eq!(parse_root_device("tmpfs /run tmpfs rw 0 0\n"), None);
    }

    #[test]
    fn test_parse_mounted_partitions_filters_by_disk() {
        let parts = parse_mounted_partitions(MOUNTS, "/dev/mmcblk0");
        assert_eq!(
            parts,
            vec![
                MountedPartition {
                    device: "/dev/mmcblk0p2".to_string(),
                    mountpoint: "/".to_string(),
                },
                MountedPartition {
                    device: "/dev/mmcblk0p1".to_string(),
                    mountpoint: "/boot".to_string(),
                },
            ]
        );
        assert!(parse_mounted_partitions(MOUNTS, "/dev/sdb").is_empty());
    }

    #[test]
    fn test_parse_all_partitions() {
        let listing = "\
mmcblk0  disk
mmcblk0p1 /boot part
mmcblk0p2 / part
mmcblk0p3 - part
sda  disk
sda1 /media/usb part
";
        let parts = parse_all_partitions(listing, "mmcblk0");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].device, "/dev/mmcblk0p3");
        assert_eq!(parts[2].mountpoint, "");
    }
}
