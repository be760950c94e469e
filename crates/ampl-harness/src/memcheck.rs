use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::MemcheckConfig;
use crate::process::{CommandSpec, ExecutionResult, OutputSinks, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcheckOutcome {
    Clean,
    /// The checker exited with its reserved fault code.
    Fault,
    TimedOut,
    /// Some other non-zero exit. Subjects may exit non-zero on purpose, so
    /// this does not fail the check.
    Undetermined { exit_code: Option<i32> },
}

impl MemcheckOutcome {
    pub fn passed(self) -> bool {
        !matches!(self, MemcheckOutcome::Fault | MemcheckOutcome::TimedOut)
    }

    fn from_execution(result: &ExecutionResult, fault_exit_code: i32) -> Self {
        if result.timed_out {
            MemcheckOutcome::TimedOut
        } else if result.exit_code == Some(fault_exit_code) {
            MemcheckOutcome::Fault
        } else if result.exit_code == Some(0) {
            MemcheckOutcome::Clean
        } else {
            MemcheckOutcome::Undetermined {
                exit_code: result.exit_code,
            }
        }
    }
}

/// Re-runs a subject invocation under the memory checker.
pub struct MemoryChecker<'a> {
    runner: &'a ProcessRunner,
    config: &'a MemcheckConfig,
}

impl<'a> MemoryChecker<'a> {
    pub fn new(runner: &'a ProcessRunner, config: &'a MemcheckConfig) -> Self {
        Self { runner, config }
    }

    /// Wraps `subject` so that the checker receives the same arguments,
    /// stdin and working directory. The checker's own report goes to `log`.
    pub fn wrap(&self, subject: &CommandSpec, log: &Path) -> CommandSpec {
        let mut log_arg = OsString::from("--log-file=");
        log_arg.push(log.as_os_str());

        CommandSpec {
            program: self.config.program.clone(),
            args: self
                .config
                .args
                .iter()
                .map(OsString::from)
                .chain([log_arg, subject.program.clone().into_os_string()])
                .chain(subject.args.iter().cloned())
                .collect(),
            cwd: subject.cwd.clone(),
            stdin: subject.stdin.clone(),
        }
    }

    pub fn check(
        &self,
        subject: &CommandSpec,
        log: &Path,
        sinks: &OutputSinks,
        timeout: Duration,
    ) -> Result<MemcheckOutcome> {
        let cmd = self.wrap(subject, log);
        debug!(cmd = %cmd.display(), "memory check");
        let result = self.runner.run(&cmd, sinks, timeout)?;
        let outcome = MemcheckOutcome::from_execution(&result, self.config.fault_exit_code);
        if let MemcheckOutcome::Undetermined { exit_code } = outcome {
            info!(
                exit_code = ?exit_code,
                log = %log.display(),
                "memory check undetermined: checker exited non-zero without its fault code"
            );
        }
        Ok(outcome)
    }
}
