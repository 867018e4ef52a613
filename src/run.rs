//! End-to-end orchestration of a clone run.
//!
//! The sequence is fixed: plan, record the plan in the state log, show it,
//! gate on safety and confirmation, apply the steps, adjust the clone's
//! identity, verify it, and record the terminal phase. Any fatal error is
//! written to the state log as `APPLY_FAILED` before it propagates.

use std::io::{self, BufRead, Write};
use std::path::Path;

use log::warn;

use crate::adjust::adjust_system;
use crate::device::ensure_dev_prefix;
use crate::error::CloneError;
use crate::options::PlanOptions;
use crate::plan::plan_with_probe;
use crate::probe::SystemProbe;
use crate::runner::{CommandRunner, NoopRunner, Runner};
use crate::safety::{check_prerequisites, validate_clone_safety};
use crate::state_log::{append_state_log, Phase};
use crate::steps::build_execution_steps;
use crate::verify::verify_clone;

/// Minimal user interaction needed by a run: plan output and the final
/// confirmation. The CLI front end provides a richer implementation; tests
/// use fakes.
pub trait Interaction {
    fn message(&mut self, text: &str);
    fn confirm(&mut self, prompt: &str) -> io::Result<bool>;
}

/// Interaction over stdin/stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleInteraction;

impl Interaction for ConsoleInteraction {
    fn message(&mut self, text: &str) {
        println!("{}", text);
    }

    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        print!("{} (yes/no): ", prompt);
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

/// Which runner drives the steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerChoice {
    #[default]
    Commands,
    /// Log steps without executing anything, skipping prerequisite and
    /// safety checks as well as adjust/verify. Meant for CI and dry plan
    /// validation only; enabling it against a real disk removes every
    /// safety net, so it must always be an explicit caller decision.
    Noop,
}

/// Whether the run must stop for a confirmation under these options.
pub fn confirmation_required(opts: &PlanOptions) -> bool {
    if opts.quiet || opts.auto_approve {
        return false;
    }
    if opts.initialize {
        !opts.unattended_init
    } else {
        !opts.unattended
    }
}

/// Run a complete clone: plan, check, apply, adjust, verify.
pub fn run_clone(
    probe: &dyn SystemProbe,
    opts: &PlanOptions,
    ui: &mut dyn Interaction,
    runner_choice: RunnerChoice,
    state_log_path: &Path,
) -> Result<(), CloneError> {
    if runner_choice == RunnerChoice::Commands {
        check_prerequisites()?;
    }

    let plan = plan_with_probe(probe, opts)?;
    let steps = build_execution_steps(&plan, opts);

    if let Err(err) = append_state_log(state_log_path, &plan, opts, &steps, Phase::Plan, None) {
        warn!(
            "cannot write state log {}: {}",
            state_log_path.display(),
            err
        );
    }

    if !opts.quiet {
        ui.message(&plan.to_string());
        if opts.verbose {
            ui.message("Planned execution steps:");
            for step in &steps {
                ui.message(&format!("  - {}: {}", step.operation, step.description));
            }
        }
    }

    if runner_choice == RunnerChoice::Noop {
        let runner = NoopRunner::new();
        for step in &steps {
            runner.run(step)?;
        }
        return Ok(());
    }

    validate_clone_safety(&plan, opts)?;

    if confirmation_required(opts) {
        let prompt = format!(
            "WARNING: this will ERASE ALL DATA on {} and recreate partitions cloned from {}. Continue?",
            ensure_dev_prefix(&opts.destination),
            plan.source_disk
        );
        if !ui.confirm(&prompt)? {
            return Err(CloneError::UserAbort);
        }
    }

    let record_failure = |err: &CloneError| {
        if let Err(log_err) =
            append_state_log(state_log_path, &plan, opts, &steps, Phase::ApplyFailed, Some(err))
        {
            warn!(
                "cannot write state log {}: {}",
                state_log_path.display(),
                log_err
            );
        }
    };

    let runner = CommandRunner::new(opts);
    for step in &steps {
        if let Err(err) = runner.run(step) {
            record_failure(&err);
            return Err(err);
        }
    }

    if let Err(err) = adjust_system(&plan, opts) {
        record_failure(&err);
        return Err(err);
    }
    if let Err(err) = verify_clone(&plan, opts) {
        record_failure(&err);
        return Err(err);
    }

    if let Err(err) =
        append_state_log(state_log_path, &plan, opts, &steps, Phase::ApplySuccess, None)
    {
        warn!(
            "cannot write state log {}: {}",
            state_log_path.display(),
            err
        );
    }

    if !opts.quiet {
        ui.message("Clone finished.");
        ui.message(&plan.to_string());
    }
    Ok(())
}
