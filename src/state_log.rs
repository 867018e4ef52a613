//! Append-only state log.
//!
//! Every run appends a human-readable block per phase to `kln.state` in
//! the working directory: a `PLAN` block when the plan is computed, then
//! either `APPLY_SUCCESS` or `APPLY_FAILED` with the failing error. Writes
//! are append-only and deliberately unlocked; interleaved entries from
//! concurrent runs are acceptable for an audit log.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::CloneError;
use crate::options::PlanOptions;
use crate::plan::PlanResult;
use crate::steps::ExecutionStep;

/// Default state log file name, relative to the working directory.
pub const STATE_LOG_FILE: &str = "kln.state";

const HEADER: &str =
    "# Klon state log - each section describes a plan/apply run. Newest entries are at the bottom.\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    ApplySuccess,
    ApplyFailed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "PLAN",
            Phase::ApplySuccess => "APPLY_SUCCESS",
            Phase::ApplyFailed => "APPLY_FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append one phase entry to the state log, writing the fixed header first
/// when the file is empty.
pub fn append_state_log(
    path: &Path,
    plan: &PlanResult,
    opts: &PlanOptions,
    steps: &[ExecutionStep],
    phase: Phase,
    error: Option<&CloneError>,
) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    if file.metadata()?.len() == 0 {
        file.write_all(HEADER.as_bytes())?;
    }

    let entry = format_entry(plan, opts, steps, phase, error, &now_utc_rfc3339());
    file.write_all(entry.as_bytes())
}

fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string())
}

fn format_entry(
    plan: &PlanResult,
    opts: &PlanOptions,
    steps: &[ExecutionStep],
    phase: Phase,
    error: Option<&CloneError>,
    timestamp: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== {} {} ===\n", phase, timestamp));
    out.push_str(&format!("source: {}\n", plan.source_disk));
    out.push_str(&format!("destination: {}\n", opts.destination));
    out.push_str(&format!("initialize: {}\n", opts.initialize));
    out.push_str(&format!(
        "force_two_partitions: {}\n",
        opts.force_two_partitions
    ));
    out.push_str(&format!("strategy: {}\n", opts.strategy));
    out.push_str(&format!(
        "hostname: {}\n",
        opts.hostname.as_deref().unwrap_or("")
    ));
    out.push_str("steps:\n");
    for (index, step) in steps.iter().enumerate() {
        out.push_str(&format!(
            "  {}. {}: {}\n",
            index + 1,
            step.operation,
            step.description
        ));
    }
    match phase {
        Phase::Plan => out.push_str("result: PENDING APPLY\n\n"),
        Phase::ApplySuccess => out.push_str("result: SUCCESS\n\n"),
        Phase::ApplyFailed => {
            let reason = error.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string());
            out.push_str(&format!("result: FAILED: {}\n\n", reason));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{build_execution_steps, Operation};
    use crate::plan::{PartitionPlan, PlanAction};
    use std::fs;
    use tempfile::TempDir;

    fn sample() -> (PlanResult, PlanOptions) {
        let plan = PlanResult {
            source_disk: "/dev/mmcblk0".to_string(),
            destination_disk: "sda".to_string(),
            partitions: vec![PartitionPlan {
                index: 2,
                device: "/dev/mmcblk0p2".to_string(),
                mountpoint: "/".to_string(),
                action: PlanAction::Sync,
            }],
        };
        (plan, PlanOptions::new("sda"))
    }

    #[test]
    fn test_entry_layout() {
        let (plan, opts) = sample();
        let steps = build_execution_steps(&plan, &opts);
        let entry = format_entry(&plan, &opts, &steps, Phase::Plan, None, "2026-08-02T12:00:00Z");

        assert!(entry.starts_with("=== PLAN 2026-08-02T12:00:00Z ===\n"));
        assert!(entry.contains("source: /dev/mmcblk0\n"));
        assert!(entry.contains("destination: sda\n"));
        assert!(entry.contains("  1. sync-filesystem:"));
        assert!(entry.ends_with("result: PENDING APPLY\n\n"));
    }

    #[test]
    fn test_failed_entry_cites_the_failed_operation() {
        let (plan, opts) = sample();
        let steps = build_execution_steps(&plan, &opts);
        let err = CloneError::step(Operation::GrowPartition, "/dev/sda", "parted exited with 1");
        let entry = format_entry(
            &plan,
            &opts,
            &steps,
            Phase::ApplyFailed,
            Some(&err),
            "2026-08-02T12:00:00Z",
        );
        assert!(entry.contains("result: FAILED: grow-partition on /dev/sda"));
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kln.state");
        let (plan, opts) = sample();
        let steps = build_execution_steps(&plan, &opts);

        append_state_log(&path, &plan, &opts, &steps, Phase::Plan, None).unwrap();
        append_state_log(&path, &plan, &opts, &steps, Phase::ApplySuccess, None).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("# Klon state log").count(), 1);
        let plan_pos = content.find("=== PLAN").unwrap();
        let success_pos = content.find("=== APPLY_SUCCESS").unwrap();
        assert!(plan_pos < success_pos);
        assert!(content.contains("result: SUCCESS"));
    }
}
