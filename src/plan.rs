//! Clone planning.
//!
//! The planner inspects probe output and the resolved options and produces
//! an immutable [`PlanResult`]: source disk, destination disk, and one
//! [`PartitionPlan`] per partition with an explicit action tag. It is a
//! pure function of its inputs (identical probe data and options always
//! yield an identical plan), which the step builder and the tests rely on.
//! Filesystem types and sizes are deliberately not resolved here; the
//! executor looks those up at run time.

use std::fmt;

use crate::device::{base_disk, partition_index};
use crate::error::CloneError;
use crate::options::{PartitionStrategy, PlanOptions};
use crate::probe::SystemProbe;

/// What will be done with one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// File-level sync onto the existing destination partition.
    Sync,
    /// Recreate the destination partition and filesystem, then sync.
    InitializeSync(PartitionStrategy),
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Sync => f.write_str("sync"),
            PlanAction::InitializeSync(strategy) => {
                write!(f, "initialize+sync[{}]", strategy)
            }
        }
    }
}

/// One partition in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// 1-based partition index, preserved between source and destination.
    pub index: u32,
    /// Source partition device; empty in the stub fallback plan.
    pub device: String,
    /// Source mountpoint; empty for unmounted partitions.
    pub mountpoint: String,
    pub action: PlanAction,
}

/// A complete clone plan, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    pub source_disk: String,
    pub destination_disk: String,
    pub partitions: Vec<PartitionPlan>,
}

impl PlanResult {
    /// The plan entry for the root filesystem, when present.
    pub fn root_partition(&self) -> Option<&PartitionPlan> {
        self.partitions.iter().find(|p| p.mountpoint == "/")
    }

    /// The plan entry for a separate `/boot` partition, when present.
    pub fn boot_partition(&self) -> Option<&PartitionPlan> {
        self.partitions.iter().find(|p| p.mountpoint == "/boot")
    }
}

impl fmt::Display for PlanResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Clone plan: {} -> {}",
            self.source_disk, self.destination_disk
        )?;
        for part in &self.partitions {
            let mut label = format!("partition {}", part.index);
            if !part.device.is_empty() {
                label.push_str(&format!(" ({}", part.device));
                if !part.mountpoint.is_empty() {
                    label.push_str(&format!(" mounted on {}", part.mountpoint));
                }
                label.push(')');
            }
            writeln!(f, "  - {}: {}", label, part.action)?;
        }
        Ok(())
    }
}

/// Compute the clone plan for the given probe and options.
pub fn plan_with_probe(
    probe: &dyn SystemProbe,
    opts: &PlanOptions,
) -> Result<PlanResult, CloneError> {
    if opts.destination.is_empty() {
        return Err(CloneError::InvalidInput(
            "destination disk cannot be empty".to_string(),
        ));
    }

    let source_disk = base_disk(&probe.boot_disk());
    let mut probed = probe.mounted_partitions(&source_disk);

    if opts.all_sync {
        for part in probe.all_partitions(&source_disk) {
            let already_known = probed.iter().any(|p| p.device == part.device);
            if part.mountpoint.is_empty() && !already_known {
                probed.push(part);
            }
        }
    }

    let mut partitions: Vec<PartitionPlan> = probed
        .iter()
        .enumerate()
        .map(|(position, part)| {
            // Preserve the real on-disk index; fall back to the probe
            // position for devices that do not encode one.
            let mut index = partition_index(&part.device);
            if index == 0 {
                index = position as u32 + 1;
            }
            PartitionPlan {
                index,
                device: part.device.clone(),
                mountpoint: part.mountpoint.clone(),
                action: PlanAction::Sync,
            }
        })
        .collect();

    // With nothing probed, keep planning well-defined with a two-partition
    // stub (boot + root).
    if partitions.is_empty() {
        partitions = vec![
            PartitionPlan {
                index: 1,
                device: String::new(),
                mountpoint: String::new(),
                action: PlanAction::Sync,
            },
            PartitionPlan {
                index: 2,
                device: String::new(),
                mountpoint: String::new(),
                action: PlanAction::Sync,
            },
        ];
    }

    if !opts.mount_dirs.is_empty() {
        partitions.retain(|p| {
            p.mountpoint == "/" || opts.mount_dirs.iter().any(|m| *m == p.mountpoint)
        });
    }

    if opts.initialize {
        for part in &mut partitions {
            part.action = PlanAction::InitializeSync(opts.strategy);
        }
        if opts.force_two_partitions {
            for part in &mut partitions {
                if part.index > 2 {
                    part.action = PlanAction::Sync;
                }
            }
        }
    }

    Ok(PlanResult {
        source_disk,
        destination_disk: opts.destination.clone(),
        partitions,
    })
}
