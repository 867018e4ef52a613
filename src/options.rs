//! Resolved clone options.
//!
//! The command-line front end (or any other embedder) resolves user input
//! into a [`PlanOptions`] record once per invocation; everything downstream
//! treats it as frozen.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CloneError;

/// Default mount point under which destination partitions are mounted.
pub const DEFAULT_DEST_ROOT: &str = "/mnt/clone";

/// How the destination partition table is prepared when initialising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionStrategy {
    /// Copy the source partition table verbatim (`sfdisk -d | sfdisk`).
    #[default]
    CloneTable,
    /// Fresh DOS label: FAT32 boot partition plus Linux root.
    NewLayout,
    /// Fresh GPT: FAT32 boot partition (boot flag set) plus ext4 root.
    NewLayoutGpt,
}

impl PartitionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStrategy::CloneTable => "clone-table",
            PartitionStrategy::NewLayout => "new-layout",
            PartitionStrategy::NewLayoutGpt => "new-layout-gpt",
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionStrategy {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "clone-table" => Ok(PartitionStrategy::CloneTable),
            "new-layout" => Ok(PartitionStrategy::NewLayout),
            "new-layout-gpt" => Ok(PartitionStrategy::NewLayoutGpt),
            other => Err(CloneError::InvalidInput(format!(
                "unknown partition strategy {:?} (expected clone-table, new-layout or new-layout-gpt)",
                other
            ))),
        }
    }
}

/// Resolved inputs for a clone run.
///
/// Mirrors the user-facing CLI surface at a high level; see the field
/// comments for the corresponding flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    /// Destination whole-disk device, e.g. `sda` or `/dev/sda`.
    pub destination: String,
    /// Directory under which destination partitions are mounted
    /// (`--dest-root`, default `/mnt/clone`).
    pub dest_root: PathBuf,
    /// Recreate the destination partition table and filesystems (`-f`).
    pub initialize: bool,
    /// Limit initialisation to partitions 1-2 (`-f2`).
    pub force_two_partitions: bool,
    /// Grow the last initialised partition to fill the disk (`--expand-root`).
    pub expand_last_partition: bool,
    /// rsync `--delete` for non-root partitions (`--delete-dest`).
    pub delete_dest: bool,
    /// rsync `--delete` for the root partition (`--delete-root`).
    pub delete_root: bool,
    /// Allow a destination smaller than the source (`-F`).
    pub force_sync: bool,
    /// Target size for partition 1 after table preparation, in bytes
    /// (`-p1-size`); 0 means no resize.
    pub p1_size_bytes: u64,
    /// Partition table strategy when initialising.
    pub strategy: PartitionStrategy,
    /// Extra rsync `--exclude` patterns (`--exclude`).
    pub exclude_patterns: Vec<String>,
    /// Extra rsync `--exclude-from` files (`--exclude-from`).
    pub exclude_from_files: Vec<String>,
    /// New hostname for the clone (`--hostname`).
    pub hostname: Option<String>,
    /// Disk-name prefix for fstab rewriting (`-e` / `--edit-fstab`).
    pub edit_fstab_name: Option<String>,
    /// Keep the SD-card cmdline.txt untouched (`-l`).
    pub leave_sd_usb: bool,
    /// Point fstab/cmdline at destination PARTUUIDs
    /// (`--convert-fstab-to-partuuid`).
    pub convert_to_partuuid: bool,
    /// Label pattern `<base>` or `<base>#` for ext partitions (`-L`).
    pub label_partitions: Option<String>,
    /// Include unmounted source partitions (`-a`).
    pub all_sync: bool,
    /// Restrict sync to these mountpoints, root always included (`-m`).
    pub mount_dirs: Vec<String>,
    /// Arguments for the post-clone `klon-setup` hook (`-s`, repeatable).
    pub setup_args: Vec<String>,
    /// Run the setup hook outside a chroot with `KLON_DEST_ROOT` set
    /// (`--setup-no-chroot`).
    pub setup_no_chroot: bool,
    /// Run `grub-install` on the clone (`--grub-auto`).
    pub grub_auto: bool,
    /// Quiet mode, implies unattended (`-q`).
    pub quiet: bool,
    /// Unattended when not initialising (`-u`).
    pub unattended: bool,
    /// Unattended even when initialising (`-U`).
    pub unattended_init: bool,
    /// Skip the final confirmation (`--auto-approve`).
    pub auto_approve: bool,
    /// Verbose plan output (`-v`).
    pub verbose: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            destination: String::new(),
            dest_root: PathBuf::from(DEFAULT_DEST_ROOT),
            initialize: false,
            force_two_partitions: false,
            expand_last_partition: false,
            delete_dest: false,
            delete_root: false,
            force_sync: false,
            p1_size_bytes: 0,
            strategy: PartitionStrategy::default(),
            exclude_patterns: Vec::new(),
            exclude_from_files: Vec::new(),
            hostname: None,
            edit_fstab_name: None,
            leave_sd_usb: false,
            convert_to_partuuid: false,
            label_partitions: None,
            all_sync: false,
            mount_dirs: Vec::new(),
            setup_args: Vec::new(),
            setup_no_chroot: false,
            grub_auto: false,
            quiet: false,
            unattended: false,
            unattended_init: false,
            auto_approve: false,
            verbose: false,
        }
    }
}

impl PlanOptions {
    /// Options for the given destination disk with everything else at its
    /// default.
    pub fn new(destination: &str) -> Self {
        PlanOptions {
            destination: destination.to_string(),
            ..Default::default()
        }
    }
}

/// Parse a size argument: plain bytes, or a number with an `M` (MiB) or
/// `G` (GiB) suffix, as accepted by `-p1-size`.
pub fn parse_size_bytes(value: &str) -> Result<u64, CloneError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CloneError::InvalidInput("size value is empty".to_string()));
    }

    let (digits, multiplier) = match value.chars().next_back().map(|c| c.to_ascii_uppercase()) {
        Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let number: u64 = digits.parse().map_err(|_| {
        CloneError::InvalidInput(format!(
            "cannot parse size {:?}: expected bytes or a number with an M/G suffix",
            value
        ))
    })?;

    Ok(number * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip() {
        for s in ["clone-table", "new-layout", "new-layout-gpt"] {
            let strategy: PartitionStrategy = s.parse().unwrap();
            assert_eq!(strategy.to_string(), s);
        }
        // Empty means "use the default".
        assert_eq!(
            "".parse::<PartitionStrategy>().unwrap(),
            PartitionStrategy::CloneTable
        );
        assert!("lvm".parse::<PartitionStrategy>().is_err());
    }

    #[test]
    fn test_parse_size_bytes() {
        assert_eq!(parse_size_bytes("314572800").unwrap(), 314572800);
        assert_eq!(parse_size_bytes("300M").unwrap(), 300 * 1024 * 1024);
        assert_eq!(parse_size_bytes("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_bytes("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size_bytes("").is_err());
        assert!(parse_size_bytes("12X").is_err());
        assert!(parse_size_bytes("M").is_err());
    }

    #[test]
    fn test_default_dest_root() {
        let opts = PlanOptions::new("sda");
        assert_eq!(opts.dest_root, PathBuf::from("/mnt/clone"));
        assert_eq!(opts.destination, "sda");
    }
}
