//! Post-clone sanity verification.
//!
//! Remounts the clone and checks that the things a bootable Raspberry Pi
//! style system cannot live without are actually there, runs advisory
//! `fsck -n` passes, and exercises a trivial chroot. Verification never
//! repairs anything.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::device::partition_device;
use crate::error::CloneError;
use crate::mount::MountGuard;
use crate::options::PlanOptions;
use crate::plan::PlanResult;
use crate::process::Cmd;

/// Mount the clone and run the sanity checks.
pub fn verify_clone(plan: &PlanResult, opts: &PlanOptions) -> Result<(), CloneError> {
    verify_inner(plan, opts).map_err(CloneError::verify)
}

fn verify_inner(plan: &PlanResult, opts: &PlanOptions) -> Result<()> {
    let dest_root = opts.dest_root.as_path();
    if dest_root.as_os_str().is_empty() {
        bail!("destination root is empty");
    }
    if opts.destination.is_empty() {
        bail!("destination disk is empty");
    }

    let root = plan
        .root_partition()
        .context("no root partition in plan")?;

    // Newer Raspberry Pi OS images mount the firmware partition on
    // /boot/firmware instead of /boot.
    let boot = plan
        .partitions
        .iter()
        .find(|p| p.mountpoint == "/boot" || p.mountpoint == "/boot/firmware");

    fs::create_dir_all(dest_root)
        .with_context(|| format!("creating destination root {}", dest_root.display()))?;

    let root_part = partition_device(&opts.destination, root.index);
    let _root_mount = MountGuard::mount(&root_part, dest_root)
        .with_context(|| format!("mounting cloned root {}", root_part))?;

    let mut boot_dir: Option<PathBuf> = None;
    let mut boot_part: Option<String> = None;
    let mut _boot_mount = None;
    if let Some(boot) = boot {
        let dir = dest_root.join(boot.mountpoint.trim_start_matches('/'));
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating boot dir {}", dir.display()))?;
        let part = partition_device(&opts.destination, boot.index);
        _boot_mount = Some(
            MountGuard::mount(&part, &dir)
                .with_context(|| format!("mounting cloned boot {}", part))?,
        );
        boot_dir = Some(dir);
        boot_part = Some(part);
    }

    check_required_layout(dest_root, boot_dir.as_deref())?;

    // Advisory only: a dirty flag right after a live clone is common.
    let _ = Cmd::new("fsck").arg("-n").arg(&root_part).allow_fail().run();
    if let Some(part) = &boot_part {
        let _ = Cmd::new("fsck").arg("-n").arg(part).allow_fail().run();
    }

    Cmd::new("chroot")
        .arg_path(dest_root)
        .arg("/bin/true")
        .error_msg("chroot sanity check failed")
        .run()?;

    Ok(())
}

/// Check the minimal file layout a bootable clone must have.
fn check_required_layout(dest_root: &Path, boot_dir: Option<&Path>) -> Result<()> {
    for file in ["etc/os-release", "etc/fstab", "boot/cmdline.txt", "bin/sh"] {
        let path = dest_root.join(file);
        let meta = fs::metadata(&path)
            .with_context(|| format!("required file {} is missing", path.display()))?;
        if meta.is_dir() {
            bail!("expected file but found directory at {}", path.display());
        }
    }

    for dir in ["usr/bin"] {
        let path = dest_root.join(dir);
        let meta = fs::metadata(&path)
            .with_context(|| format!("required directory {} is missing", path.display()))?;
        if !meta.is_dir() {
            bail!("expected directory but found file at {}", path.display());
        }
    }

    if let Some(boot_dir) = boot_dir {
        let config = boot_dir.join("config.txt");
        match fs::metadata(&config) {
            Ok(meta) if !meta.is_dir() => {}
            _ => bail!("boot config.txt not found or not a file at {}", config.display()),
        }

        let overlays = boot_dir.join("overlays");
        match fs::metadata(&overlays) {
            Ok(meta) if meta.is_dir() => {}
            _ => bail!("boot overlays directory not found at {}", overlays.display()),
        }

        if !has_kernel_image(boot_dir)? {
            bail!("no kernel image found under {}", boot_dir.display());
        }
    }

    Ok(())
}

/// Whether the boot directory contains a `kernel*.img` or `vmlinuz-*`
/// image.
fn has_kernel_image(boot_dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(boot_dir)
        .with_context(|| format!("listing {}", boot_dir.display()))?
    {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if (name.starts_with("kernel") && name.ends_with(".img")) || name.starts_with("vmlinuz-") {
            return Ok(true);
        }
    }
    Ok(false)
}
