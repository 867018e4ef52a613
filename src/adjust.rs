//! Post-clone identity adjustments.
//!
//! After apply, the clone still carries the source's identity: its fstab
//! and kernel command line point at the source devices and PARTUUIDs, and
//! its hostname is the source's. This module mounts the cloned root (and
//! boot, when separate) and rewrites those identity-bearing files, then
//! optionally labels partitions, installs grub, and runs the `klon-setup`
//! hook. All file edits are write-then-replace; all mounts are released on
//! every exit path.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::blkdev;
use crate::device::{ensure_dev_prefix, partition_device, partition_index};
use crate::error::CloneError;
use crate::mount::MountGuard;
use crate::options::PlanOptions;
use crate::plan::PlanResult;
use crate::process::Cmd;

/// Environment variable handed to the setup hook when it runs outside a
/// chroot.
pub const DEST_ROOT_ENV: &str = "KLON_DEST_ROOT";

/// Name of the post-clone setup hook executable.
pub const SETUP_HOOK: &str = "klon-setup";

/// Mount the clone and adjust its identity-bearing files.
pub fn adjust_system(plan: &PlanResult, opts: &PlanOptions) -> Result<(), CloneError> {
    adjust_inner(plan, opts).map_err(CloneError::adjust)
}

fn adjust_inner(plan: &PlanResult, opts: &PlanOptions) -> Result<()> {
    let dest_root = opts.dest_root.as_path();
    if dest_root.as_os_str().is_empty() {
        bail!("destination root is empty");
    }
    if opts.destination.is_empty() {
        bail!("destination disk is empty");
    }

    // Without a root mountpoint in the plan there is nothing to adjust.
    let root = match plan.root_partition() {
        Some(root) => root,
        None => return Ok(()),
    };

    fs::create_dir_all(dest_root)
        .with_context(|| format!("creating destination root {}", dest_root.display()))?;

    let root_dev = partition_device(&opts.destination, root.index);
    let _root_mount = MountGuard::mount(&root_dev, dest_root)
        .with_context(|| format!("mounting cloned root {}", root_dev))?;

    let mut _boot_mount = None;
    if let Some(boot) = plan.boot_partition() {
        let boot_dir = dest_root.join("boot");
        fs::create_dir_all(&boot_dir)
            .with_context(|| format!("creating boot dir {}", boot_dir.display()))?;
        let boot_dev = partition_device(&opts.destination, boot.index);
        _boot_mount = Some(
            MountGuard::mount(&boot_dev, &boot_dir)
                .with_context(|| format!("mounting cloned boot {}", boot_dev))?,
        );
    }

    adjust_fstab(plan, opts, dest_root)?;
    if !opts.leave_sd_usb {
        adjust_cmdline(plan, opts, dest_root)?;
    }
    if let Some(hostname) = &opts.hostname {
        adjust_hostname(hostname, dest_root)?;
    }
    if let Some(label) = &opts.label_partitions {
        apply_labels(label, plan, opts)?;
    }
    if opts.grub_auto {
        Cmd::shell(&format!(
            "grub-install --root-directory={} {}",
            dest_root.display(),
            ensure_dev_prefix(&opts.destination)
        ))
        .error_msg("grub-install failed")
        .run()?;
    }
    if !opts.setup_args.is_empty() {
        run_setup_hook(opts, dest_root)?;
    }

    Ok(())
}

/// Source-to-destination device mapping for every planned partition.
fn device_mappings(plan: &PlanResult, destination: &str) -> Vec<(String, String)> {
    plan.partitions
        .iter()
        .filter(|p| !p.device.is_empty())
        .map(|p| {
            (
                ensure_dev_prefix(&p.device),
                partition_device(destination, p.index),
            )
        })
        .collect()
}

/// PARTUUID mapping for every device pair where both sides report one.
fn partuuid_mappings(device_map: &[(String, String)]) -> Vec<(String, String)> {
    device_map
        .iter()
        .filter_map(|(src, dst)| {
            match (blkdev::partition_uuid(src), blkdev::partition_uuid(dst)) {
                (Some(src_uuid), Some(dst_uuid)) => Some((src_uuid, dst_uuid)),
                _ => None,
            }
        })
        .collect()
}

fn adjust_fstab(plan: &PlanResult, opts: &PlanOptions, dest_root: &Path) -> Result<()> {
    let path = dest_root.join("etc/fstab");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    let device_map = device_mappings(plan, &opts.destination);
    let uuid_map = partuuid_mappings(&device_map);
    let rewritten = rewrite_fstab(
        &content,
        &device_map,
        &uuid_map,
        opts.convert_to_partuuid,
        opts.edit_fstab_name.as_deref(),
    );

    replace_file(&path, &rewritten).with_context(|| format!("writing {}", path.display()))
}

/// Rewrite fstab content against the device and PARTUUID mappings.
///
/// `convert_to_partuuid` switches only the PARTUUID references; an
/// `edit_fstab_name` prefix redirects device paths onto that disk name and
/// still applies the PARTUUID mapping; otherwise both mappings apply.
fn rewrite_fstab(
    content: &str,
    device_map: &[(String, String)],
    uuid_map: &[(String, String)],
    convert_to_partuuid: bool,
    edit_fstab_name: Option<&str>,
) -> String {
    let mut content = content.to_string();

    if convert_to_partuuid {
        for (src, dst) in uuid_map {
            content = content.replace(
                &format!("PARTUUID={}", src),
                &format!("PARTUUID={}", dst),
            );
        }
        return content;
    }

    if let Some(prefix) = edit_fstab_name {
        for (src, dst) in device_map {
            let index = partition_index(dst);
            let new_dev = if index == 0 {
                format!("/dev/{}", prefix)
            } else {
                partition_device(prefix, index)
            };
            content = content.replace(src, &new_dev);
        }
    } else {
        for (src, dst) in device_map {
            content = content.replace(src, dst);
        }
    }
    for (src, dst) in uuid_map {
        content = content.replace(
            &format!("PARTUUID={}", src),
            &format!("PARTUUID={}", dst),
        );
    }
    content
}

fn adjust_cmdline(plan: &PlanResult, opts: &PlanOptions, dest_root: &Path) -> Result<()> {
    let path = dest_root.join("boot/cmdline.txt");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };

    let root = match plan.root_partition() {
        Some(root) if !root.device.is_empty() && root.index > 0 => root,
        _ => return Ok(()),
    };
    let src_dev = ensure_dev_prefix(&root.device);
    let dst_dev = partition_device(&opts.destination, root.index);

    let rewritten = rewrite_cmdline(
        &content,
        &src_dev,
        &dst_dev,
        blkdev::partition_uuid(&src_dev).as_deref(),
        blkdev::partition_uuid(&dst_dev).as_deref(),
        opts.convert_to_partuuid,
    );

    replace_file(&path, &rewritten).with_context(|| format!("writing {}", path.display()))
}

/// Rewrite the kernel command line's root references.
fn rewrite_cmdline(
    content: &str,
    src_dev: &str,
    dst_dev: &str,
    src_uuid: Option<&str>,
    dst_uuid: Option<&str>,
    convert_to_partuuid: bool,
) -> String {
    if convert_to_partuuid {
        if let Some(dst_uuid) = dst_uuid {
            return replace_root_param(content, &format!("PARTUUID={}", dst_uuid));
        }
        return content.to_string();
    }

    let mut content = content.replace(src_dev, dst_dev);
    if let (Some(src_uuid), Some(dst_uuid)) = (src_uuid, dst_uuid) {
        content = content.replace(
            &format!("PARTUUID={}", src_uuid),
            &format!("PARTUUID={}", dst_uuid),
        );
    }
    content
}

/// Replace the value of the `root=` token, leaving the rest of the command
/// line untouched.
fn replace_root_param(content: &str, value: &str) -> String {
    content
        .split_whitespace()
        .map(|field| {
            if field.starts_with("root=") {
                format!("root={}", value)
            } else {
                field.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Overwrite `/etc/hostname` and rename the old host in `/etc/hosts`.
fn adjust_hostname(new_host: &str, dest_root: &Path) -> Result<()> {
    let hostname_path = dest_root.join("etc/hostname");
    let old_host = match fs::read_to_string(&hostname_path) {
        Ok(content) => content.trim().to_string(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", hostname_path.display()))
        }
    };
    replace_file(&hostname_path, &format!("{}\n", new_host))
        .with_context(|| format!("writing {}", hostname_path.display()))?;

    let hosts_path = dest_root.join("etc/hosts");
    let hosts = match fs::read_to_string(&hosts_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", hosts_path.display())),
    };
    if !old_host.is_empty() {
        let rewritten = hosts.replace(&old_host, new_host);
        replace_file(&hosts_path, &rewritten)
            .with_context(|| format!("writing {}", hosts_path.display()))?;
    }
    Ok(())
}

/// Label destination partitions: `<base>#` labels every planned partition
/// as `<base><index>`, a bare `<base>` labels only the root partition.
fn apply_labels(label: &str, plan: &PlanResult, opts: &PlanOptions) -> Result<()> {
    let label_all = label.ends_with('#');
    let base = label.trim_end_matches('#');

    for part in &plan.partitions {
        let text = if label_all {
            format!("{}{}", base, part.index)
        } else if part.mountpoint == "/" {
            base.to_string()
        } else {
            continue;
        };

        let dest_dev = partition_device(&opts.destination, part.index);
        Cmd::new("e2label")
            .arg(&dest_dev)
            .arg(&text)
            .error_msg("e2label failed")
            .run()
            .with_context(|| format!("labelling {} as {}", dest_dev, text))?;
    }
    Ok(())
}

fn run_setup_hook(opts: &PlanOptions, dest_root: &Path) -> Result<()> {
    if opts.setup_no_chroot {
        Cmd::new(SETUP_HOOK)
            .args(opts.setup_args.iter().cloned())
            .env(DEST_ROOT_ENV, &dest_root.display().to_string())
            .error_msg("setup hook failed (non-chroot)")
            .run()?;
    } else {
        Cmd::new("chroot")
            .arg_path(dest_root)
            .arg(SETUP_HOOK)
            .args(opts.setup_args.iter().cloned())
            .error_msg("setup hook failed inside chroot")
            .run()?;
    }
    Ok(())
}

/// Write `content` next to `path` and atomically move it into place.
fn replace_file(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rewrite_fstab_replaces_devices_and_partuuids() {
        let fstab = "\
PARTUUID=aabbccdd-01 /boot vfat defaults 0 2
/dev/mmcblk0p2 / ext4 defaults,noatime 0 1
";
        let device_map = vec![(
            "/dev/mmcblk0p2".to_string(),
            "/dev/sda2".to_string(),
        )];
        let uuid_map = vec![("aabbccdd-01".to_string(), "eeff0011-01".to_string())];

        let out = rewrite_fstab(fstab, &device_map, &uuid_map, false, None);
        assert!(out.contains("/dev/sda2 / ext4"));
        assert!(out.contains("PARTUUID=eeff0011-01 /boot"));
        assert!(!out.contains("mmcblk0p2"));
    }

    #[test]
    fn test_rewrite_fstab_partuuid_only_mode() {
        let fstab = "/dev/mmcblk0p2 / ext4 defaults 0 1\nPARTUUID=aabbccdd-02 /x ext4 d 0 2\n";
        let device_map = vec![(
            "/dev/mmcblk0p2".to_string(),
            "/dev/sda2".to_string(),
        )];
        let uuid_map = vec![("aabbccdd-02".to_string(), "eeff0011-02".to_string())];

        let out = rewrite_fstab(fstab, &device_map, &uuid_map, true, None);
        // Device paths stay untouched in convert mode.
        assert!(out.contains("/dev/mmcblk0p2"));
        assert!(out.contains("PARTUUID=eeff0011-02"));
    }

    #[test]
    fn test_rewrite_fstab_with_disk_name_prefix() {
        let fstab = "/dev/mmcblk0p2 / ext4 defaults 0 1\n";
        let device_map = vec![(
            "/dev/mmcblk0p2".to_string(),
            "/dev/sda2".to_string(),
        )];

        let out = rewrite_fstab(fstab, &device_map, &[], false, Some("nvme0n1"));
        assert!(out.contains("/dev/nvme0n1p2 / ext4"));
    }

    #[test]
    fn test_rewrite_cmdline_device_mode() {
        let cmdline = "console=serial0,115200 root=/dev/mmcblk0p2 rootfstype=ext4 fsck.repair=yes\n";
        let out = rewrite_cmdline(cmdline, "/dev/mmcblk0p2", "/dev/sda2", None, None, false);
        assert!(out.contains("root=/dev/sda2"));
        assert!(out.contains("console=serial0,115200"));
    }

    #[test]
    fn test_rewrite_cmdline_partuuid_mode() {
        let cmdline = "console=tty1 root=PARTUUID=aabbccdd-02 rw rootwait";
        let out = rewrite_cmdline(
            cmdline,
            "/dev/mmcblk0p2",
            "/dev/sda2",
            Some("aabbccdd-02"),
            Some("eeff0011-02"),
            true,
        );
        assert!(out.contains("root=PARTUUID=eeff0011-02"));
        assert!(out.contains("rootwait"));
    }

    #[test]
    fn test_replace_root_param_touches_only_root_token() {
        let out = replace_root_param("a=1 root=/dev/old b=2", "PARTUUID=x");
        assert_eq!(out, "a=1 root=PARTUUID=x b=2");
    }

    #[test]
    fn test_adjust_hostname_rewrites_hosts_file() {
        let dir = TempDir::new().unwrap();
        let etc = dir.path().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("hostname"), "oldpi\n").unwrap();
        fs::write(etc.join("hosts"), "127.0.0.1 localhost\n127.0.1.1 oldpi\n").unwrap();

        adjust_hostname("newpi", dir.path()).unwrap();

        assert_eq!(
            fs::read_to_string(etc.join("hostname")).unwrap(),
            "newpi\n"
        );
        let hosts = fs::read_to_string(etc.join("hosts")).unwrap();
        assert!(hosts.contains("127.0.1.1 newpi"));
        assert!(!hosts.contains("oldpi"));
    }

    #[test]
    fn test_adjust_hostname_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();

        adjust_hostname("newpi", dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/hostname")).unwrap(),
            "newpi\n"
        );
    }

    #[test]
    fn test_replace_file_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fstab");
        fs::write(&path, "before").unwrap();

        replace_file(&path, "after").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "after");
    }
}
