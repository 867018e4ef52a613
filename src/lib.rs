//! Clone a running Linux single-board computer's boot disk onto a second
//! block device, producing a bootable copy.
//!
//! The pipeline is file-level, never block-level: the destination gets a
//! fresh partition table and filesystems (when initialising), the data is
//! carried over by `rsync`, and the clone's identity (`/etc/fstab`,
//! `/boot/cmdline.txt`, hostname, PARTUUID references, labels) is rewritten
//! afterwards so the copy boots on its own.
//!
//! # Architecture
//!
//! ```text
//! SystemProbe ──> plan ──> safety gate ──> steps ──> Runner
//!   (read side)   (pure)   (refuses bad      (pure)   (subprocesses:
//!                           plans early)              sfdisk, mkfs, rsync)
//!                                                        │
//!                                  adjust ──> verify <───┘
//!                            (fstab, cmdline,  (layout checks,
//!                             hostname, grub)   fsck -n, chroot)
//! ```
//!
//! Every phase is recorded in an append-only state log (`kln.state`).
//! [`SystemProbe`] and [`Runner`] are capability traits so tests can run
//! the whole pipeline against fixed probe data and a recording or no-op
//! runner.
//!
//! The crate is the orchestration core only: command-line parsing, the
//! interactive wizard and output styling live in the embedding binary,
//! which hands over a resolved [`PlanOptions`] record.

pub mod adjust;
pub mod blkdev;
pub mod device;
pub mod error;
pub mod mount;
pub mod options;
pub mod plan;
pub mod probe;
pub mod process;
pub mod run;
pub mod runner;
pub mod safety;
pub mod state_log;
pub mod steps;
pub mod verify;

pub use adjust::adjust_system;
pub use error::CloneError;
pub use options::{parse_size_bytes, PartitionStrategy, PlanOptions, DEFAULT_DEST_ROOT};
pub use plan::{plan_with_probe, PartitionPlan, PlanAction, PlanResult};
pub use probe::{LocalProbe, MountedPartition, SystemProbe};
pub use run::{run_clone, ConsoleInteraction, Interaction, RunnerChoice};
pub use runner::{apply, CommandRunner, NoopRunner, Runner};
pub use safety::{check_prerequisites, validate_clone_safety};
pub use state_log::{append_state_log, Phase, STATE_LOG_FILE};
pub use steps::{build_execution_steps, ExecutionStep, Operation};
pub use verify::verify_clone;
