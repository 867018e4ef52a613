//! Scoped mount ownership.
//!
//! Every mount the pipeline performs (sync destinations, scratch source
//! mounts, adjust/verify roots) is owned by a [`MountGuard`] that unmounts
//! on drop, including error paths and unwinding. Unmount failures are
//! demoted to warnings so cleanup always continues.

use std::path::{Path, PathBuf};

use log::warn;

use crate::process::{Cmd, CommandError};

/// An active mount, released when the guard goes out of scope.
#[derive(Debug)]
pub struct MountGuard {
    target: PathBuf,
}

impl MountGuard {
    /// Mount `device` read-write on `target`.
    pub fn mount(device: &str, target: &Path) -> Result<Self, CommandError> {
        Cmd::new("mount")
            .arg(device)
            .arg_path(target)
            .error_msg("mount failed")
            .run()?;
        Ok(MountGuard {
            target: target.to_path_buf(),
        })
    }

    /// Mount `device` read-only on `target` (used for unmounted source
    /// partitions).
    pub fn mount_readonly(device: &str, target: &Path) -> Result<Self, CommandError> {
        Cmd::new("mount")
            .args(["-o", "ro"])
            .arg(device)
            .arg_path(target)
            .error_msg("read-only mount failed")
            .run()?;
        Ok(MountGuard {
            target: target.to_path_buf(),
        })
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        let result = Cmd::new("umount").arg_path(&self.target).run();
        if let Err(err) = result {
            warn!("failed to unmount {}: {}", self.target.display(), err);
        }
    }
}
