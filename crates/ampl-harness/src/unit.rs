use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::compare::OutputComparator;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::fixture::FixtureCase;
use crate::memcheck::{MemcheckOutcome, MemoryChecker};
use crate::module::{InvocationStyle, Module, Stream};
use crate::process::{absolute, CommandSpec, ExecutionResult, OutputSinks, ProcessRunner};

/// Which process or step of a unit a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Subject,
    Memcheck,
    Assembler,
    Runtime,
    Compare,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Subject => "subject",
            Stage::Memcheck => "memory checker",
            Stage::Assembler => "assembler",
            Stage::Runtime => "runtime",
            Stage::Compare => "compare",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reason a case failed. A case may collect several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout { stage: Stage },
    Crashed { stage: Stage, signal: i32 },
    MemcheckFault { log: PathBuf },
    MemcheckTimeout,
    Mismatch { stream: Stream, rendering: String },
    /// The secondary stage applied but the primary run did not exit 0.
    SecondStageBlocked {
        exit_code: Option<i32>,
        timed_out: bool,
    },
    ExecutionError { stage: Stage, message: String },
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::Crashed { .. } => "crashed",
            FailureReason::MemcheckFault { .. } => "memcheck_fault",
            FailureReason::MemcheckTimeout => "memcheck_timeout",
            FailureReason::Mismatch { .. } => "mismatch",
            FailureReason::SecondStageBlocked { .. } => "second_stage_blocked",
            FailureReason::ExecutionError { .. } => "execution_error",
        }
    }

    /// Rendered difference for mismatches.
    pub fn detail(&self) -> Option<&str> {
        match self {
            FailureReason::Mismatch { rendering, .. } => Some(rendering),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { stage } => write!(f, "{stage} timed out"),
            FailureReason::Crashed { stage, signal } => {
                write!(f, "{stage} killed by signal {signal}")
            }
            FailureReason::MemcheckFault { log } => {
                write!(f, "memory errors detected (see {})", log.display())
            }
            FailureReason::MemcheckTimeout => write!(f, "memory checker timed out"),
            FailureReason::Mismatch { stream, .. } => write!(f, "{stream} differs"),
            FailureReason::SecondStageBlocked {
                timed_out: true, ..
            } => write!(f, "second stage not run: subject timed out"),
            FailureReason::SecondStageBlocked {
                exit_code: Some(code),
                ..
            } => write!(f, "second stage not run: subject exited with {code}"),
            FailureReason::SecondStageBlocked { .. } => {
                write!(f, "second stage not run: subject did not exit normally")
            }
            FailureReason::ExecutionError { stage, message } => write!(f, "{stage}: {message}"),
        }
    }
}

/// Result of one fixture case. Passing means no reasons were recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub case: FixtureCase,
    pub reasons: Vec<FailureReason>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Runs execute, memory check and diff for single cases of one module.
pub struct TestUnit<'a> {
    module: Module,
    style: InvocationStyle,
    subject: PathBuf,
    work: PathBuf,
    config: &'a HarnessConfig,
    runner: &'a ProcessRunner,
    comparator: OutputComparator,
}

impl<'a> TestUnit<'a> {
    pub fn new(module: Module, config: &'a HarnessConfig, runner: &'a ProcessRunner) -> Self {
        Self {
            module,
            style: config.invocation_style(module),
            subject: config.subject(module),
            work: config.work_dir(module),
            config,
            runner,
            comparator: OutputComparator::new(config.side_by_side),
        }
    }

    pub fn module(&self) -> Module {
        self.module
    }

    /// Directory the case files of this module are written to. It must
    /// exist before [`TestUnit::execute`] runs.
    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    /// Runs one case and collects every failure it shows.
    ///
    /// Only [`HarnessError::Unkillable`] and [`HarnessError::Interrupted`]
    /// escape as errors; everything else becomes a [`FailureReason`].
    pub fn execute(&self, case: FixtureCase) -> Result<Verdict> {
        let mut reasons = Vec::new();
        let work = self.work.as_path();

        let cmd = self.primary_command(case)?;
        let sinks = OutputSinks::new(
            case.captured(work, Stream::Stdout),
            case.captured(work, Stream::Stderr),
        );
        debug!(module = self.module.as_str(), case = case.number, "executing");
        let primary = self.run_stage(Stage::Subject, &cmd, &sinks, &mut reasons)?;

        if let Some(result) = &primary {
            record_abnormal_exit(Stage::Subject, result, &mut reasons);
            if result.exited_normally() {
                self.memory_check(case, &cmd, &mut reasons)?;
            }
        }

        let secondary_ran = if self.second_stage_applies(case) {
            match &primary {
                Some(result) if result.success() => self.run_second_stage(case, &mut reasons)?,
                Some(result) => {
                    reasons.push(FailureReason::SecondStageBlocked {
                        exit_code: result.exit_code,
                        timed_out: result.timed_out,
                    });
                    false
                }
                None => false,
            }
        } else {
            false
        };

        if primary.is_some() {
            for &stream in self.style.streams() {
                if stream.is_secondary() && !secondary_ran {
                    continue;
                }
                self.diff(case, stream, &mut reasons);
            }
        }

        Ok(Verdict { case, reasons })
    }

    fn primary_command(&self, case: FixtureCase) -> Result<CommandSpec> {
        let input = case.input(&self.config.fixtures_root);
        let cmd = match self.style {
            InvocationStyle::Argument => CommandSpec::new(&self.subject).arg(input),
            InvocationStyle::Redirection => CommandSpec::new(&self.subject).stdin(input),
            // The subject drops `{n}.j` into its working directory.
            InvocationStyle::TwoStage => CommandSpec::new(absolute(&self.subject)?)
                .arg(absolute(&input)?)
                .cwd(&self.work),
        };
        Ok(cmd)
    }

    fn second_stage_applies(&self, case: FixtureCase) -> bool {
        self.style == InvocationStyle::TwoStage
            && self.config.second_stage
            && case.class_input(&self.config.fixtures_root).is_file()
    }

    /// Runs `cmd`, turning ordinary failures (missing executable, unwritable
    /// sink) into an execution error of `stage`.
    fn run_stage(
        &self,
        stage: Stage,
        cmd: &CommandSpec,
        sinks: &OutputSinks,
        reasons: &mut Vec<FailureReason>,
    ) -> Result<Option<ExecutionResult>> {
        match self.runner.run(cmd, sinks, self.config.timeout) {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.downcast_ref::<HarnessError>().is_some() => Err(err),
            Err(err) => {
                reasons.push(FailureReason::ExecutionError {
                    stage,
                    message: format!("{err:#}"),
                });
                Ok(None)
            }
        }
    }

    fn memory_check(
        &self,
        case: FixtureCase,
        cmd: &CommandSpec,
        reasons: &mut Vec<FailureReason>,
    ) -> Result<()> {
        let Some(memcheck) = &self.config.memcheck else {
            return Ok(());
        };
        let work = self.work.as_path();
        let log = case.memcheck_log(work);
        let sinks = OutputSinks::new(
            work.join(format!("{}.valgrind.out", case.number)),
            work.join(format!("{}.valgrind.err", case.number)),
        );

        let checker = MemoryChecker::new(self.runner, memcheck);
        let log_arg = absolute(&log)?;
        match checker.check(cmd, &log_arg, &sinks, self.config.timeout) {
            Ok(MemcheckOutcome::Fault) => reasons.push(FailureReason::MemcheckFault { log }),
            Ok(MemcheckOutcome::TimedOut) => reasons.push(FailureReason::MemcheckTimeout),
            Ok(_) => {}
            Err(err) if err.downcast_ref::<HarnessError>().is_some() => return Err(err),
            Err(err) => reasons.push(FailureReason::ExecutionError {
                stage: Stage::Memcheck,
                message: format!("{err:#}"),
            }),
        }
        Ok(())
    }

    /// Assembles `{n}.j` and runs the resulting class. Returns whether the
    /// runtime ran, i.e. whether its streams have something to compare.
    fn run_second_stage(
        &self,
        case: FixtureCase,
        reasons: &mut Vec<FailureReason>,
    ) -> Result<bool> {
        let work = self.work.as_path();
        let runtime = &self.config.runtime;
        let artifact = case.artifact(work);
        if !artifact.is_file() {
            reasons.push(FailureReason::ExecutionError {
                stage: Stage::Assembler,
                message: format!("subject produced no assembly: {}", artifact.display()),
            });
            return Ok(false);
        }

        let classes = case.classes_dir(work);
        if let Err(err) = fresh_dir(&classes) {
            reasons.push(FailureReason::ExecutionError {
                stage: Stage::Assembler,
                message: format!("{err:#}"),
            });
            return Ok(false);
        }

        let assemble = CommandSpec::new(&runtime.java)
            .arg("-jar")
            .arg(&runtime.jasmin_jar)
            .arg("-d")
            .arg(&classes)
            .arg(&artifact);
        let sinks = OutputSinks::new(
            case.assembler_log(work, "out"),
            case.assembler_log(work, "err"),
        );
        let Some(assembled) = self.run_stage(Stage::Assembler, &assemble, &sinks, reasons)? else {
            return Ok(false);
        };
        if !assembled.success() {
            record_abnormal_exit(Stage::Assembler, &assembled, reasons);
            if let Some(code) = assembled.exit_code {
                reasons.push(FailureReason::ExecutionError {
                    stage: Stage::Assembler,
                    message: format!(
                        "exited with {code} (see {})",
                        case.assembler_log(work, "err").display()
                    ),
                });
            }
            return Ok(false);
        }

        let class = match single_class(&classes) {
            Ok(class) => class,
            Err(err) => {
                reasons.push(FailureReason::ExecutionError {
                    stage: Stage::Assembler,
                    message: format!("{err:#}"),
                });
                return Ok(false);
            }
        };

        let run = CommandSpec::new(&runtime.java)
            .arg("-cp")
            .arg(&classes)
            .arg(class)
            .stdin(case.class_input(&self.config.fixtures_root));
        let sinks = OutputSinks::new(
            case.captured(work, Stream::ClassStdout),
            case.captured(work, Stream::ClassStderr),
        );
        let Some(result) = self.run_stage(Stage::Runtime, &run, &sinks, reasons)? else {
            return Ok(false);
        };
        record_abnormal_exit(Stage::Runtime, &result, reasons);
        Ok(true)
    }

    fn diff(&self, case: FixtureCase, stream: Stream, reasons: &mut Vec<FailureReason>) {
        let actual = case.captured(&self.work, stream);
        let expected = case.golden(&self.config.fixtures_root, stream);
        match self.comparator.compare(stream, &actual, &expected) {
            Ok(c) if c.matched => {}
            Ok(c) => reasons.push(FailureReason::Mismatch {
                stream,
                rendering: c.rendering.unwrap_or_default(),
            }),
            Err(err) => reasons.push(FailureReason::ExecutionError {
                stage: Stage::Compare,
                message: format!("{err:#}"),
            }),
        }
    }
}

fn record_abnormal_exit(stage: Stage, result: &ExecutionResult, reasons: &mut Vec<FailureReason>) {
    if result.timed_out {
        reasons.push(FailureReason::Timeout { stage });
    } else if let Some(signal) = result.signal {
        reasons.push(FailureReason::Crashed { stage, signal });
    }
}

fn fresh_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("remove: {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))
}

/// Name of the only class file the assembler wrote.
fn single_class(classes: &Path) -> Result<String> {
    let mut found = Vec::new();
    for entry in
        std::fs::read_dir(classes).with_context(|| format!("read dir: {}", classes.display()))?
    {
        let entry = entry.with_context(|| format!("read dir: {}", classes.display()))?;
        let name = entry.file_name();
        if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".class")) {
            found.push(stem.to_string());
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        n => anyhow::bail!(
            "expected one class file in {}, found {n}",
            classes.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        let reasons = [
            FailureReason::Timeout {
                stage: Stage::Subject,
            },
            FailureReason::Crashed {
                stage: Stage::Runtime,
                signal: 11,
            },
            FailureReason::MemcheckFault {
                log: PathBuf::from("temp/1.valgrind"),
            },
            FailureReason::MemcheckTimeout,
            FailureReason::Mismatch {
                stream: Stream::Stderr,
                rendering: String::new(),
            },
            FailureReason::SecondStageBlocked {
                exit_code: Some(1),
                timed_out: false,
            },
            FailureReason::ExecutionError {
                stage: Stage::Assembler,
                message: "boom".to_string(),
            },
        ];
        let codes: Vec<&str> = reasons.iter().map(FailureReason::code).collect();
        assert_eq!(
            codes,
            [
                "timeout",
                "crashed",
                "memcheck_fault",
                "memcheck_timeout",
                "mismatch",
                "second_stage_blocked",
                "execution_error"
            ]
        );
    }

    #[test]
    fn reason_messages() {
        assert_eq!(
            FailureReason::Crashed {
                stage: Stage::Subject,
                signal: 11
            }
            .to_string(),
            "subject killed by signal 11"
        );
        assert_eq!(
            FailureReason::SecondStageBlocked {
                exit_code: Some(2),
                timed_out: false
            }
            .to_string(),
            "second stage not run: subject exited with 2"
        );
        assert_eq!(
            FailureReason::Mismatch {
                stream: Stream::ClassStdout,
                rendering: "x".to_string()
            }
            .to_string(),
            "class stdout differs"
        );
    }

    #[test]
    fn verdict_passes_only_without_reasons() {
        let mut v = Verdict {
            case: FixtureCase::new(Module::Scanner, 1),
            reasons: Vec::new(),
        };
        assert!(v.passed());
        v.reasons.push(FailureReason::MemcheckTimeout);
        assert!(!v.passed());
    }

    #[test]
    fn abnormal_exits_are_recorded_per_stage() {
        let mut result = ExecutionResult {
            exit_code: Some(4),
            signal: None,
            timed_out: false,
            pid: 1,
            stdout: PathBuf::new(),
            stderr: PathBuf::new(),
            duration: std::time::Duration::ZERO,
        };
        let mut reasons = Vec::new();
        record_abnormal_exit(Stage::Subject, &result, &mut reasons);
        assert!(reasons.is_empty(), "non-zero exit is not a failure");

        result.exit_code = None;
        result.signal = Some(6);
        record_abnormal_exit(Stage::Runtime, &result, &mut reasons);
        result.signal = None;
        result.timed_out = true;
        record_abnormal_exit(Stage::Subject, &result, &mut reasons);
        assert_eq!(
            reasons,
            vec![
                FailureReason::Crashed {
                    stage: Stage::Runtime,
                    signal: 6
                },
                FailureReason::Timeout {
                    stage: Stage::Subject
                },
            ]
        );
    }

    #[test]
    fn single_class_requires_exactly_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(single_class(dir.path()).is_err());
        std::fs::write(dir.path().join("Prog.class"), b"").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"").expect("write");
        assert_eq!(single_class(dir.path()).expect("class"), "Prog");
        std::fs::write(dir.path().join("Other.class"), b"").expect("write");
        assert!(single_class(dir.path()).is_err());
    }
}
