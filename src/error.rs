//! Error taxonomy for the clone pipeline.
//!
//! Each variant corresponds to one failure kind a caller may want to react
//! to: bad input, missing prerequisites, a refused plan, a failed execution
//! step, a failed post-clone adjustment or verification, or a declined
//! confirmation. Probe failures never surface here; the probe degrades to
//! safe sentinels instead.

use thiserror::Error;

use crate::steps::Operation;

#[derive(Debug, Error)]
pub enum CloneError {
    /// Malformed or unusable caller input (empty destination, unknown
    /// strategy, bad size value, unsupported filesystem).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The process lacks privileges or a required external tool.
    #[error("prerequisite check failed: {0}")]
    Prerequisites(String),

    /// The plan was refused before any command ran.
    #[error("safety check failed: {0}")]
    Safety(String),

    /// An execution step failed, scoped by operation and target.
    #[error("{operation} on {target}: {reason}")]
    Step {
        operation: Operation,
        target: String,
        reason: String,
    },

    /// Post-clone adjustment (fstab/cmdline/hostname/labels/setup) failed.
    #[error("adjust failed: {0}")]
    Adjust(String),

    /// The cloned system did not pass verification.
    #[error("verify failed: {0}")]
    Verify(String),

    /// The user declined the final confirmation.
    #[error("apply cancelled by user")]
    UserAbort,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CloneError {
    /// A [`CloneError::Step`] scoped to the given operation and target.
    pub fn step(operation: Operation, target: impl ToString, reason: impl ToString) -> Self {
        CloneError::Step {
            operation,
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an adjuster failure, flattening the context chain.
    pub fn adjust(err: anyhow::Error) -> Self {
        CloneError::Adjust(format!("{:#}", err))
    }

    /// Wrap a verifier failure, flattening the context chain.
    pub fn verify(err: anyhow::Error) -> Self {
        CloneError::Verify(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_names_operation_and_target() {
        let err = CloneError::step(Operation::GrowPartition, "/dev/sda", "parted exited with 1");
        let text = err.to_string();
        assert!(text.contains("grow-partition"));
        assert!(text.contains("/dev/sda"));
        assert!(text.contains("parted"));
    }
}
