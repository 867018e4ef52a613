//! rsync command construction and the parallel root sync.
//!
//! Root syncs split the work across the known large subtrees (`/usr`,
//! `/var`, `/home`, `/opt`) plus a final "rest" pass, run by a pool of at
//! most [`MAX_PARALLEL_RSYNC`] concurrent rsync children. The bound is a
//! design constant for slow SD/USB media; do not lift it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use log::warn;

use crate::process::{Cmd, CommandError};

/// Subtrees synced by dedicated parallel jobs during a root sync.
pub const PARALLEL_SYNC_SUBTREES: &[&str] = &["usr", "var", "home", "opt"];

/// At most this many rsync children run at once.
pub const MAX_PARALLEL_RSYNC: usize = 2;

/// Pseudo-filesystems and volatile trees never copied from a live root.
pub const ROOT_SYNC_EXCLUDES: &[&str] = &[
    "/proc/**",
    "/sys/**",
    "/dev/**",
    "/run/**",
    "/tmp/**",
    "/mnt/**",
    "/media/**",
    "/var/cache/**",
    "/var/tmp/**",
    "/var/log/journal/**",
    "/home/*/.cache/**",
];

/// Where a source mountpoint lands under the destination root.
pub fn destination_dir(dest_root: &Path, mountpoint: &str) -> PathBuf {
    if mountpoint == "/" || mountpoint.is_empty() {
        dest_root.to_path_buf()
    } else {
        dest_root.join(mountpoint.trim_start_matches('/'))
    }
}

/// rsync argument vector without the trailing source/destination paths.
pub fn build_rsync_flags(
    root_scope: bool,
    delete: bool,
    dest_root: &Path,
    extra_excludes: &[String],
    exclude_from_files: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-aAXH".to_string(),
        "--numeric-ids".to_string(),
        "--whole-file".to_string(),
    ];
    if delete {
        args.push("--delete".to_string());
    }
    if root_scope {
        args.push("--one-file-system".to_string());
        for pattern in ROOT_SYNC_EXCLUDES {
            args.push("--exclude".to_string());
            args.push((*pattern).to_string());
        }
        // Never copy the clone into itself.
        args.push("--exclude".to_string());
        args.push(format!("{}/**", dest_root.display()));
    }
    for pattern in extra_excludes {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    for file in exclude_from_files {
        args.push("--exclude-from".to_string());
        args.push(file.clone());
    }
    args
}

/// The job list for a parallel root sync: one job per subtree, then a
/// "rest" job covering `/` with the subtrees excluded so nothing is copied
/// twice.
pub fn build_parallel_sync_jobs(base_flags: &[String], dest_root: &Path) -> Vec<Vec<String>> {
    let mut jobs = Vec::with_capacity(PARALLEL_SYNC_SUBTREES.len() + 1);

    for subtree in PARALLEL_SYNC_SUBTREES {
        let mut args = base_flags.to_vec();
        args.push(format!("/{}/", subtree));
        args.push(format!("{}/", dest_root.join(subtree).display()));
        jobs.push(args);
    }

    let mut rest = base_flags.to_vec();
    for subtree in PARALLEL_SYNC_SUBTREES {
        rest.push("--exclude".to_string());
        rest.push(format!("/{}/", subtree));
    }
    rest.push("/".to_string());
    rest.push(format!("{}/", dest_root.display()));
    jobs.push(rest);

    jobs
}

/// Whether a finished rsync counts as successful.
///
/// Exit code 23 (partial transfer) is tolerated on root-scope syncs, where
/// files vanishing under a live system are expected.
pub(crate) fn rsync_exit_ok(success: bool, code: Option<i32>, tolerate_partial: bool) -> bool {
    success || (tolerate_partial && code == Some(23))
}

/// Run one rsync invocation.
pub fn run_rsync(args: &[String], tolerate_partial: bool) -> Result<(), CommandError> {
    let output = Cmd::new("rsync")
        .args(args.iter().cloned())
        .allow_fail()
        .error_msg("rsync failed")
        .run()?;

    if rsync_exit_ok(output.success(), output.code(), tolerate_partial) {
        if !output.success() {
            warn!(
                "rsync exited with code 23 (partial transfer); volatile files under live pseudo-filesystems are expected, continuing"
            );
        }
        return Ok(());
    }
    Err(output.into_error())
}

/// Run the parallel sync jobs with the bounded worker pool, returning the
/// first error observed. Remaining queued jobs are skipped once a job has
/// failed.
pub fn run_parallel_jobs(jobs: &[Vec<String>]) -> Result<(), CommandError> {
    let next = AtomicUsize::new(0);
    let first_error: Mutex<Option<CommandError>> = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..MAX_PARALLEL_RSYNC {
            scope.spawn(|| loop {
                if first_error.lock().unwrap().is_some() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= jobs.len() {
                    break;
                }
                if let Err(err) = run_rsync(&jobs[index], true) {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    break;
                }
            });
        }
    });

    match first_error.into_inner().unwrap() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
