//! Read-only block device queries.
//!
//! Thin wrappers over `lsblk` and `findmnt`. These are probe-style reads,
//! not state changes, so they bypass the logged [`crate::process::Cmd`]
//! path and stay conservative: on any failure they report "unknown" rather
//! than aborting the run.

use std::process::Command;

use crate::device::ensure_dev_prefix;

fn query(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Size of a block device in bytes, via `lsblk -b -dn -o SIZE`.
pub fn disk_size_bytes(dev: &str) -> Option<u64> {
    let dev = ensure_dev_prefix(dev);
    let out = query("lsblk", &["-b", "-dn", "-o", "SIZE", &dev])?;
    out.trim().parse().ok()
}

/// PARTUUID of a partition device, when the partition table provides one.
pub fn partition_uuid(dev: &str) -> Option<String> {
    let dev = ensure_dev_prefix(dev);
    let out = query("lsblk", &["-no", "PARTUUID", &dev])?;
    let uuid = out.trim().to_string();
    if uuid.is_empty() {
        None
    } else {
        Some(uuid)
    }
}

/// Filesystem type on the device as reported by `lsblk -no FSTYPE`.
pub fn detect_filesystem(dev: &str) -> Option<String> {
    let dev = ensure_dev_prefix(dev);
    let out = query("lsblk", &["-no", "FSTYPE", &dev])?;
    let fstype = out.trim().to_string();
    if fstype.is_empty() {
        None
    } else {
        Some(fstype)
    }
}

/// Where the device itself is mounted, if anywhere.
///
/// `findmnt` exits non-zero for unmounted devices; that is reported as
/// `None`, not an error.
pub fn device_mountpoint(dev: &str) -> Option<String> {
    let dev = ensure_dev_prefix(dev);
    let out = query("findmnt", &["-n", "-o", "TARGET", &dev])?;
    let target = out.trim().to_string();
    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}

/// Mounted child partitions of a disk, rendered as `/dev/<name> -> <target>`.
pub fn mounted_partitions_of(disk: &str) -> Vec<String> {
    let base = ensure_dev_prefix(disk);
    let base = base.trim_start_matches("/dev/");
    match query("lsblk", &["-nr", "-o", "NAME,MOUNTPOINT"]) {
        Some(out) => parse_mounted_children(&out, base),
        None => Vec::new(),
    }
}

fn parse_mounted_children(listing: &str, base: &str) -> Vec<String> {
    let mut mounted = Vec::new();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            continue;
        }
        let (name, target) = (fields[0], fields[1]);
        if target.is_empty() || target == "-" {
            continue;
        }
        if name.starts_with(base) && name != base {
            mounted.push(format!("/dev/{} -> {}", name, target));
        }
    }
    mounted
}
