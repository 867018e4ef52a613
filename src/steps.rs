//! Lowering a plan into executable steps.
//!
//! [`build_execution_steps`] deterministically turns a [`PlanResult`] plus
//! the resolved options into the flat, ordered step list a [`crate::runner::Runner`]
//! consumes. The builder never touches the system.

use std::fmt;

use crate::options::PlanOptions;
use crate::plan::{PlanAction, PlanResult};

/// The closed set of operations a runner executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PrepareDisk,
    ResizeP1,
    InitializePartition,
    SyncFilesystem,
    GrowPartition,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PrepareDisk => "prepare-disk",
            Operation::ResizeP1 => "resize-p1",
            Operation::InitializePartition => "initialize-partition",
            Operation::SyncFilesystem => "sync-filesystem",
            Operation::GrowPartition => "grow-partition",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete action against the destination disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStep {
    pub operation: Operation,
    pub source_device: String,
    pub destination_disk: String,
    /// 1-based partition index; 0 for whole-disk operations.
    pub partition_index: u32,
    pub mountpoint: String,
    pub size_bytes: u64,
    pub description: String,
}

/// Lower a plan into the ordered step sequence.
///
/// Pure: identical inputs produce identical steps.
pub fn build_execution_steps(plan: &PlanResult, opts: &PlanOptions) -> Vec<ExecutionStep> {
    let mut steps = Vec::new();
    let destination = &plan.destination_disk;

    if opts.initialize {
        steps.push(ExecutionStep {
            operation: Operation::PrepareDisk,
            source_device: plan.source_disk.clone(),
            destination_disk: destination.clone(),
            partition_index: 0,
            mountpoint: String::new(),
            size_bytes: opts.p1_size_bytes,
            description: format!(
                "prepare partition table on {} from {} ({})",
                destination, plan.source_disk, opts.strategy
            ),
        });
    }

    for part in &plan.partitions {
        let source = if part.device.is_empty() {
            plan.source_disk.clone()
        } else {
            part.device.clone()
        };

        if part.action != PlanAction::Sync {
            steps.push(ExecutionStep {
                operation: Operation::InitializePartition,
                source_device: source.clone(),
                destination_disk: destination.clone(),
                partition_index: part.index,
                mountpoint: part.mountpoint.clone(),
                size_bytes: 0,
                description: format!(
                    "recreate filesystem on {} partition {} from {}",
                    destination, part.index, source
                ),
            });
        }

        let mut description = format!(
            "sync {} to {} partition {}",
            source, destination, part.index
        );
        if !part.mountpoint.is_empty() {
            description.push_str(&format!(" mounted on {}", part.mountpoint));
        }
        steps.push(ExecutionStep {
            operation: Operation::SyncFilesystem,
            source_device: source,
            destination_disk: destination.clone(),
            partition_index: part.index,
            mountpoint: part.mountpoint.clone(),
            size_bytes: 0,
            description,
        });
    }

    if opts.initialize && opts.expand_last_partition {
        // Grow the highest-index partition we actually re-created.
        let grow_target = plan
            .partitions
            .iter()
            .filter(|p| p.action != PlanAction::Sync)
            .max_by_key(|p| p.index);
        if let Some(part) = grow_target {
            steps.push(ExecutionStep {
                operation: Operation::GrowPartition,
                source_device: part.device.clone(),
                destination_disk: destination.clone(),
                partition_index: part.index,
                mountpoint: part.mountpoint.clone(),
                size_bytes: 0,
                description: format!(
                    "grow partition {} on {} to fill remaining space",
                    part.index, destination
                ),
            });
        }
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::base_disk;
    use crate::options::PartitionStrategy;
    use crate::plan::PartitionPlan;

    fn pi_plan(action: PlanAction) -> PlanResult {
        PlanResult {
            source_disk: "/dev/mmcblk0".to_string(),
            destination_disk: "sda".to_string(),
            partitions: vec![
                PartitionPlan {
                    index: 1,
                    device: "/dev/mmcblk0p1".to_string(),
                    mountpoint: "/boot".to_string(),
                    action,
                },
                PartitionPlan {
                    index: 2,
                    device: "/dev/mmcblk0p2".to_string(),
                    mountpoint: "/".to_string(),
                    action,
                },
            ],
        }
    }

    #[test]
    fn test_initialize_emits_prepare_then_per_partition_pairs() {
        let plan = pi_plan(PlanAction::InitializeSync(PartitionStrategy::CloneTable));
        let mut opts = PlanOptions::new("sda");
        opts.initialize = true;

        let steps = build_execution_steps(&plan, &opts);
        let tags: Vec<(Operation, u32)> = steps
            .iter()
            .map(|s| (s.operation, s.partition_index))
            .collect();
        assert_eq!(
            tags,
            vec![
                (Operation::PrepareDisk, 0),
                (Operation::InitializePartition, 1),
                (Operation::SyncFilesystem, 1),
                (Operation::InitializePartition, 2),
                (Operation::SyncFilesystem, 2),
            ]
        );
        assert_eq!(steps[0].source_device, "/dev/mmcblk0");
        assert_eq!(steps[1].source_device, "/dev/mmcblk0p1");
        assert_eq!(steps[2].mountpoint, "/boot");
        assert_eq!(steps[4].mountpoint, "/");
    }

    #[test]
    fn test_expand_last_partition_appends_grow_tail() {
        let plan = pi_plan(PlanAction::InitializeSync(PartitionStrategy::CloneTable));
        let mut opts = PlanOptions::new("sda");
        opts.initialize = true;
        opts.expand_last_partition = true;

        let steps = build_execution_steps(&plan, &opts);
        let last = steps.last().unwrap();
        assert_eq!(last.operation, Operation::GrowPartition);
        assert_eq!(last.partition_index, 2);
        assert_eq!(last.destination_disk, "sda");
    }

    #[test]
    fn test_plain_sync_emits_one_step_per_partition() {
        let plan = pi_plan(PlanAction::Sync);
        let steps = build_execution_steps(&plan, &PlanOptions::new("sda"));
        assert_eq!(steps.len(), 2);
        assert!(steps
            .iter()
            .all(|s| s.operation == Operation::SyncFilesystem));
        assert!(steps.iter().all(|s| !s.description.is_empty()));
    }

    #[test]
    fn test_every_step_targets_the_destination() {
        let plan = pi_plan(PlanAction::InitializeSync(PartitionStrategy::CloneTable));
        let mut opts = PlanOptions::new("sda");
        opts.initialize = true;
        opts.expand_last_partition = true;

        for step in build_execution_steps(&plan, &opts) {
            assert_eq!(base_disk(&step.destination_disk), opts.destination);
            assert_ne!(step.destination_disk, plan.source_disk);
        }
    }

    #[test]
    fn test_builder_is_deterministic() {
        let plan = pi_plan(PlanAction::InitializeSync(PartitionStrategy::CloneTable));
        let mut opts = PlanOptions::new("sda");
        opts.initialize = true;
        opts.p1_size_bytes = 314572800;

        assert_eq!(
            build_execution_steps(&plan, &opts),
            build_execution_steps(&plan, &opts)
        );
    }
}
