//! Logged subprocess execution.
//!
//! Every state-changing command the clone pipeline runs goes through
//! [`Cmd`]: the command line is logged before execution and its combined
//! output after, so a run can be reconstructed from the log alone. Composed
//! pipelines (`sfdisk -d SRC | sfdisk DST`) use [`Cmd::shell`]; everything
//! else is a direct argv invocation.

use std::path::Path;
use std::process::Command;

use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: `{command}` ({status})")]
    Failed {
        command: String,
        status: String,
        code: Option<i32>,
        output: String,
        context: String,
    },
}

impl CommandError {
    /// Exit code of the failed command, when it exited at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Failed { code, .. } => *code,
        }
    }
}

/// Builder for a single logged command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    shell: bool,
    allow_fail: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Cmd {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            shell: false,
            allow_fail: false,
            error_msg: None,
        }
    }

    /// A `sh -c` invocation for composed pipelines.
    pub fn shell(command_line: &str) -> Self {
        Cmd {
            program: command_line.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            shell: true,
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Treat a non-zero exit as a normal outcome instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Context message used when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// The command line as logged.
    pub fn command_line(&self) -> String {
        if self.shell || self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Execute the command, logging the command line and its combined
    /// stdout/stderr output.
    pub fn run(self) -> Result<CmdOutput, CommandError> {
        let command_line = self.command_line();
        info!("EXEC: {}", command_line);

        let mut command = if self.shell {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.program);
            c
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.args);
            c
        };
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let output = command.output().map_err(|source| CommandError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if !combined.trim().is_empty() {
            info!("OUTPUT: {}", combined.trim());
        }

        let result = CmdOutput {
            command: command_line,
            code: output.status.code(),
            success: output.status.success(),
            output: combined,
            context: self.error_msg.unwrap_or_else(|| "command failed".to_string()),
        };

        if !result.success && !self.allow_fail {
            return Err(result.into_error());
        }
        Ok(result)
    }
}

/// Outcome of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    command: String,
    code: Option<i32>,
    success: bool,
    output: String,
    context: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn text(&self) -> &str {
        &self.output
    }

    /// Turn this outcome into a [`CommandError::Failed`]. Used after
    /// `allow_fail` when the caller decides the exit was fatal after all.
    pub fn into_error(self) -> CommandError {
        let status = match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        CommandError::Failed {
            command: self.command,
            status,
            code: self.code,
            output: self.output,
            context: self.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_rendering() {
        let cmd = Cmd::new("parted").args(["-s", "/dev/sda", "resizepart", "1", "100%"]);
        assert_eq!(cmd.command_line(), "parted -s /dev/sda resizepart 1 100%");

        let pipe = Cmd::shell("sfdisk -d /dev/mmcblk0 | sfdisk /dev/sda");
        assert_eq!(pipe.command_line(), "sfdisk -d /dev/mmcblk0 | sfdisk /dev/sda");
    }

    #[test]
    fn test_run_captures_exit_code() {
        let out = Cmd::shell("exit 23").allow_fail().run().unwrap();
        assert!(!out.success());
        assert_eq!(out.code(), Some(23));
    }

    #[test]
    fn test_run_fails_on_nonzero_exit() {
        let err = Cmd::shell("exit 1").error_msg("doomed step").run().unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("doomed step"));
    }

    #[test]
    fn test_run_success_with_output() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.text().trim(), "hello");
    }
}
