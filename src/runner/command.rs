//! The subprocess-driving runner.
//!
//! Executes each [`ExecutionStep`] by invoking the system tools
//! (`sfdisk`, `parted`, `mkfs.*`, `rsync`, `mount`). The runner is bound to
//! one destination disk at construction and refuses any step that names a
//! different one, so a corrupted step stream can never reach a third disk.

use std::fs;

use tempfile::TempDir;

use super::{partition, sync, Runner};
use crate::blkdev;
use crate::device::{ensure_dev_prefix, partition_device};
use crate::error::CloneError;
use crate::mount::MountGuard;
use crate::options::{PartitionStrategy, PlanOptions};
use crate::process::Cmd;
use crate::steps::{ExecutionStep, Operation};

pub struct CommandRunner {
    dest_root: std::path::PathBuf,
    strategy: PartitionStrategy,
    exclude_patterns: Vec<String>,
    exclude_from_files: Vec<String>,
    dest_disk: String,
    delete_dest: bool,
    delete_root: bool,
}

impl CommandRunner {
    pub fn new(opts: &PlanOptions) -> Self {
        CommandRunner {
            dest_root: opts.dest_root.clone(),
            strategy: opts.strategy,
            exclude_patterns: opts.exclude_patterns.clone(),
            exclude_from_files: opts.exclude_from_files.clone(),
            dest_disk: ensure_dev_prefix(&opts.destination),
            delete_dest: opts.delete_dest,
            delete_root: opts.delete_root,
        }
    }

    fn prepare_disk(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        let command = partition::build_prepare_disk_command(step, self.strategy)?;
        Cmd::shell(&command)
            .error_msg("partition table preparation failed")
            .run()
            .map_err(|err| CloneError::step(Operation::PrepareDisk, &self.dest_disk, err))?;

        if step.size_bytes > 0 {
            // Resize partition 1 right away so mkfs and sync see the final
            // layout.
            self.resize_p1(step)?;
        }
        Ok(())
    }

    fn resize_p1(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        if step.size_bytes == 0 {
            return Err(CloneError::step(
                Operation::ResizeP1,
                &self.dest_disk,
                "missing target size",
            ));
        }
        let command = partition::build_resize_p1_command(&step.destination_disk, step.size_bytes);
        Cmd::shell(&command)
            .error_msg("parted failed")
            .run()
            .map_err(|err| CloneError::step(Operation::ResizeP1, &self.dest_disk, err))?;
        Ok(())
    }

    fn grow_partition(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        if step.partition_index == 0 {
            return Err(CloneError::step(
                Operation::GrowPartition,
                &self.dest_disk,
                "missing partition index",
            ));
        }
        let part = partition_device(&step.destination_disk, step.partition_index);

        let command =
            partition::build_grow_partition_command(&step.destination_disk, step.partition_index);
        Cmd::shell(&command)
            .error_msg("parted failed; ensure no partitions are mounted and the disk is healthy")
            .run()
            .map_err(|err| CloneError::step(Operation::GrowPartition, &self.dest_disk, err))?;

        // resize2fs recommends a non-interactive fsck first; its exit status
        // is advisory.
        let _ = Cmd::new("e2fsck").args(["-f", "-p"]).arg(&part).allow_fail().run();

        Cmd::new("resize2fs")
            .arg(&part)
            .error_msg("resize2fs failed")
            .run()
            .map_err(|err| CloneError::step(Operation::GrowPartition, &part, err))?;
        Ok(())
    }

    fn initialize_partition(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        if step.source_device.is_empty() || step.partition_index == 0 {
            return Err(CloneError::step(
                Operation::InitializePartition,
                &self.dest_disk,
                "missing source device or partition index",
            ));
        }

        let fstype = blkdev::detect_filesystem(&step.source_device).ok_or_else(|| {
            CloneError::step(
                Operation::InitializePartition,
                &self.dest_disk,
                format!("cannot detect filesystem type of {}", step.source_device),
            )
        })?;

        let part = partition_device(&step.destination_disk, step.partition_index);
        let command = if fstype.starts_with("ext") {
            Cmd::new("mkfs.ext4").arg("-F").arg(&part)
        } else if fstype == "vfat" || fstype.starts_with("fat") {
            Cmd::new("mkfs.vfat").arg(&part)
        } else if fstype == "swap" {
            Cmd::new("mkswap").arg(&part)
        } else {
            return Err(CloneError::InvalidInput(format!(
                "unsupported filesystem type {:?} on {}",
                fstype, step.source_device
            )));
        };

        command
            .error_msg("filesystem creation failed")
            .run()
            .map_err(|err| CloneError::step(Operation::InitializePartition, &part, err))?;
        Ok(())
    }

    fn sync_filesystem(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        let step_err = |reason: String| {
            CloneError::step(Operation::SyncFilesystem, &self.dest_disk, reason)
        };

        if step.mountpoint.is_empty() && step.source_device.is_empty() {
            return Err(step_err(
                "source mountpoint empty and no source device to mount".to_string(),
            ));
        }

        let dest_path = sync::destination_dir(&self.dest_root, &step.mountpoint);
        fs::create_dir_all(&dest_path).map_err(|err| {
            step_err(format!(
                "cannot create destination dir {}: {}",
                dest_path.display(),
                err
            ))
        })?;

        let dest_part = partition_device(&step.destination_disk, step.partition_index);
        let _dest_mount = MountGuard::mount(&dest_part, &dest_path).map_err(|err| {
            step_err(format!(
                "failed to mount {} on {}: {}. Is the device busy or missing drivers?",
                dest_part,
                dest_path.display(),
                err
            ))
        })?;

        // Destination usage before and after gives the user a progress
        // anchor on long clones.
        let _ = Cmd::new("df").arg("-h").arg_path(&dest_path).allow_fail().run();

        // Unmounted sources get a read-only scratch mount for the duration
        // of the sync. Unmount (guard) before the directory is removed
        // (tempdir), hence the field order.
        let mut scratch: Option<(MountGuard, TempDir)> = None;
        let source_dir = if step.mountpoint.is_empty() {
            let dir = tempfile::Builder::new()
                .prefix("klon-src-")
                .tempdir()
                .map_err(|err| step_err(format!("cannot create scratch mount dir: {}", err)))?;
            let guard = MountGuard::mount_readonly(
                &ensure_dev_prefix(&step.source_device),
                dir.path(),
            )
            .map_err(|err| {
                step_err(format!(
                    "failed to mount source {} on {}: {}",
                    step.source_device,
                    dir.path().display(),
                    err
                ))
            })?;
            let path = dir.path().display().to_string();
            scratch = Some((guard, dir));
            path
        } else {
            step.mountpoint.clone()
        };

        if step.mountpoint == "/" {
            let flags = sync::build_rsync_flags(
                true,
                self.delete_root,
                &self.dest_root,
                &self.exclude_patterns,
                &self.exclude_from_files,
            );
            let jobs = sync::build_parallel_sync_jobs(&flags, &dest_path);
            sync::run_parallel_jobs(&jobs)
                .map_err(|err| CloneError::step(Operation::SyncFilesystem, &dest_part, err))?;
        } else {
            let mut args = sync::build_rsync_flags(
                false,
                self.delete_dest,
                &self.dest_root,
                &self.exclude_patterns,
                &self.exclude_from_files,
            );
            args.push(format!("{}/", source_dir.trim_end_matches('/')));
            args.push(format!("{}/", dest_path.display()));
            sync::run_rsync(&args, false)
                .map_err(|err| CloneError::step(Operation::SyncFilesystem, &dest_part, err))?;
        }

        let _ = Cmd::new("df").arg("-h").arg_path(&dest_path).allow_fail().run();
        drop(scratch);
        Ok(())
    }
}

impl Runner for CommandRunner {
    fn run(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        if !step.destination_disk.is_empty() {
            let actual = ensure_dev_prefix(&step.destination_disk);
            if actual != self.dest_disk {
                return Err(CloneError::step(
                    step.operation,
                    actual,
                    format!(
                        "refusing to run on unexpected destination (runner is bound to {})",
                        self.dest_disk
                    ),
                ));
            }
        }

        match step.operation {
            Operation::PrepareDisk => self.prepare_disk(step),
            Operation::ResizeP1 => self.resize_p1(step),
            Operation::InitializePartition => self.initialize_partition(step),
            Operation::SyncFilesystem => self.sync_filesystem(step),
            Operation::GrowPartition => self.grow_partition(step),
        }
    }
}
