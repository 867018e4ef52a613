//! Partition table preparation commands.
//!
//! Builders for the `sfdisk`/`parted` command lines behind the
//! `prepare-disk`, `resize-p1` and `grow-partition` operations. Building is
//! separated from execution so the exact command text is testable.

use crate::device::ensure_dev_prefix;
use crate::error::CloneError;
use crate::options::PartitionStrategy;
use crate::steps::{ExecutionStep, Operation};

/// Boot partition size used by the fresh-layout strategies when no
/// `-p1-size` was given.
pub const DEFAULT_BOOT_PARTITION_MIB: u64 = 256;

/// Boot partition size in whole MiB: the requested byte count rounded up,
/// or the default when no size was requested.
pub fn boot_partition_size_mib(size_bytes: u64) -> u64 {
    if size_bytes == 0 {
        DEFAULT_BOOT_PARTITION_MIB
    } else {
        size_bytes.div_ceil(1024 * 1024)
    }
}

/// Shell command implementing a `prepare-disk` step.
pub fn build_prepare_disk_command(
    step: &ExecutionStep,
    strategy: PartitionStrategy,
) -> Result<String, CloneError> {
    if step.operation != Operation::PrepareDisk {
        return Err(CloneError::InvalidInput(format!(
            "cannot build a partition command for operation {}",
            step.operation
        )));
    }
    if step.destination_disk.is_empty() {
        return Err(CloneError::InvalidInput(
            "prepare-disk requires a destination disk".to_string(),
        ));
    }

    let source = ensure_dev_prefix(&step.source_device);
    let target = ensure_dev_prefix(&step.destination_disk);
    let boot_mib = boot_partition_size_mib(step.size_bytes);

    let command = match strategy {
        PartitionStrategy::CloneTable => {
            format!("sfdisk -d {} | sfdisk {}", source, target)
        }
        PartitionStrategy::NewLayout => {
            // DOS label: FAT32 LBA boot partition (type c), Linux rest.
            format!(
                "printf 'label: dos\\n,{}M,c\\n,,L\\n' | sfdisk {}",
                boot_mib, target
            )
        }
        PartitionStrategy::NewLayoutGpt => {
            let boot_end = 1 + boot_mib;
            format!(
                "parted -s {} mklabel gpt mkpart ESP fat32 1MiB {}MiB set 1 boot on mkpart primary ext4 {}MiB 100%",
                target, boot_end, boot_end
            )
        }
    };
    Ok(command)
}

/// `parted` command implementing a `resize-p1` step.
pub fn build_resize_p1_command(destination_disk: &str, size_bytes: u64) -> String {
    format!(
        "parted -s {} resizepart 1 {}B",
        ensure_dev_prefix(destination_disk),
        size_bytes
    )
}

/// `parted` command growing a partition to the end of the disk.
pub fn build_grow_partition_command(destination_disk: &str, index: u32) -> String {
    format!(
        "parted -s {} resizepart {} 100%",
        ensure_dev_prefix(destination_disk),
        index
    )
}
