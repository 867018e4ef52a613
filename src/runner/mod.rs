//! Step execution.
//!
//! A [`Runner`] consumes the flat step sequence produced by
//! [`crate::steps::build_execution_steps`]. Two implementations exist: the
//! subprocess-driving [`CommandRunner`] and a [`NoopRunner`] that only logs
//! (used for CI and dry plan validation).

pub mod command;
pub mod partition;
pub mod sync;

pub use command::CommandRunner;

use log::info;

use crate::error::CloneError;
use crate::options::PlanOptions;
use crate::plan::PlanResult;
use crate::steps::{build_execution_steps, ExecutionStep};

pub trait Runner {
    /// Execute one step, returning a typed error on failure.
    fn run(&self, step: &ExecutionStep) -> Result<(), CloneError>;
}

/// Runner that logs each step without touching the system.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunner;

impl NoopRunner {
    pub fn new() -> Self {
        NoopRunner
    }
}

impl Runner for NoopRunner {
    fn run(&self, step: &ExecutionStep) -> Result<(), CloneError> {
        info!("NOOP: {} ({})", step.operation, step.description);
        Ok(())
    }
}

/// Build the steps for `plan` and run them in order, halting on the first
/// failure.
pub fn apply(
    plan: &PlanResult,
    opts: &PlanOptions,
    runner: &dyn Runner,
) -> Result<(), CloneError> {
    for step in build_execution_steps(plan, opts) {
        runner.run(&step)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PartitionPlan, PlanAction};
    use std::cell::RefCell;

    pub(crate) struct RecordingRunner {
        pub steps: RefCell<Vec<ExecutionStep>>,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            RecordingRunner {
                steps: RefCell::new(Vec::new()),
            }
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, step: &ExecutionStep) -> Result<(), CloneError> {
            self.steps.borrow_mut().push(step.clone());
            Ok(())
        }
    }

    fn two_partition_plan() -> PlanResult {
        PlanResult {
            source_disk: "/dev/mmcblk0".to_string(),
            destination_disk: "sda".to_string(),
            partitions: vec![
                PartitionPlan {
                    index: 1,
                    device: "/dev/mmcblk0p1".to_string(),
                    mountpoint: "/boot".to_string(),
                    action: PlanAction::Sync,
                },
                PartitionPlan {
                    index: 2,
                    device: "/dev/mmcblk0p2".to_string(),
                    mountpoint: "/".to_string(),
                    action: PlanAction::Sync,
                },
            ],
        }
    }

    #[test]
    fn test_apply_delegates_every_step_to_the_runner() {
        let plan = two_partition_plan();
        let opts = PlanOptions::new("sda");
        let runner = RecordingRunner::new();

        apply(&plan, &opts, &runner).unwrap();

        let steps = runner.steps.borrow();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.destination_disk == "sda"));
    }

    #[test]
    fn test_command_runner_rejects_foreign_destination() {
        let runner = CommandRunner::new(&PlanOptions::new("sda"));
        let mut steps = build_execution_steps(&two_partition_plan(), &PlanOptions::new("sda"));
        let mut step = steps.remove(0);
        step.destination_disk = "sdb".to_string();

        let err = runner.run(&step).unwrap_err();
        assert!(err.to_string().contains("unexpected destination"));
    }
}
