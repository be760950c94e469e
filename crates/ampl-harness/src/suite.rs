use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::fixture::{self, CaseSelection, FixtureCase};
use crate::module::Module;
use crate::process::{self, CommandSpec, ExecutionResult, OutputSinks, ProcessRunner};
use crate::unit::{TestUnit, Verdict};

const BUILD_LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteStatus {
    Completed,
    /// No case ran. `exit_code` is `None` when the build tool could not be
    /// run to a normal exit.
    BuildFailed { exit_code: Option<i32> },
    /// The operator interrupted the run; `verdicts` holds the cases that
    /// finished before that.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    Failed { exit_code: Option<i32> },
}

/// Verdicts of one module, in ascending case order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub module: Module,
    pub status: SuiteStatus,
    pub verdicts: Vec<Verdict>,
}

impl SuiteReport {
    pub fn build_failed(module: Module, exit_code: Option<i32>) -> Self {
        Self {
            module,
            status: SuiteStatus::BuildFailed { exit_code },
            verdicts: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.verdicts.len()
    }

    pub fn passed(&self) -> usize {
        self.verdicts.iter().filter(|v| v.passed()).count()
    }

    /// Case numbers of the failed cases, ascending.
    pub fn failures(&self) -> Vec<u32> {
        self.verdicts
            .iter()
            .filter(|v| !v.passed())
            .map(|v| v.case.number)
            .collect()
    }

    /// `(1 - failures/total) * 100` over the cases that ran. `None` when the
    /// build failed; an empty completed suite counts as 100%.
    pub fn pass_percentage(&self) -> Option<f64> {
        if let SuiteStatus::BuildFailed { .. } = self.status {
            return None;
        }
        let total = self.total();
        if total == 0 {
            return Some(100.0);
        }
        Some((1.0 - self.failures().len() as f64 / total as f64) * 100.0)
    }

    pub fn is_success(&self) -> bool {
        self.status == SuiteStatus::Completed && self.verdicts.iter().all(Verdict::passed)
    }
}

/// Builds a module's subject and runs its cases one after another.
pub struct TestSuiteRunner {
    config: HarnessConfig,
    runner: ProcessRunner,
}

impl TestSuiteRunner {
    pub fn new(config: HarnessConfig, runner: ProcessRunner) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// True once the operator asked the run to stop.
    pub fn interrupted(&self) -> bool {
        self.runner.interrupt().requested()
    }

    /// Recreates the temp directory, dropping whatever a previous run left.
    pub fn prepare(&self) -> Result<()> {
        let temp = &self.config.temp_dir;
        if temp.exists() {
            std::fs::remove_dir_all(temp)
                .with_context(|| format!("remove stale temp dir: {}", temp.display()))?;
        }
        std::fs::create_dir_all(temp)
            .with_context(|| format!("create temp dir: {}", temp.display()))
    }

    /// Validates `selection` (empty means discover) against the fixture tree.
    pub fn resolve(&self, module: Module, selection: &CaseSelection) -> Result<Vec<FixtureCase>> {
        fixture::resolve_cases(&self.config.fixtures_root, module, selection)
    }

    /// Resolves the cases, builds the subject and runs every case.
    pub fn run(&self, module: Module, selection: &CaseSelection) -> Result<SuiteReport> {
        let cases = self.resolve(module, selection)?;
        self.run_cases(module, &cases)
    }

    /// Builds the subject and runs `cases` in order. An interrupt ends the
    /// suite early with [`SuiteStatus::Interrupted`] and the verdicts so far;
    /// an unkillable child is an error.
    pub fn run_cases(&self, module: Module, cases: &[FixtureCase]) -> Result<SuiteReport> {
        if let BuildOutcome::Failed { exit_code } = self.build(module)? {
            return Ok(SuiteReport::build_failed(module, exit_code));
        }
        if cases.is_empty() {
            warn!(module = module.as_str(), "no fixture cases to run");
        }

        let unit = TestUnit::new(module, &self.config, &self.runner);
        let work = unit.work_dir();
        std::fs::create_dir_all(work)
            .with_context(|| format!("create work dir: {}", work.display()))?;

        let mut verdicts = Vec::with_capacity(cases.len());
        let mut status = SuiteStatus::Completed;
        for &case in cases {
            info!(module = module.as_str(), case = case.number, "running case");
            match unit.execute(case) {
                Ok(verdict) => verdicts.push(verdict),
                Err(err)
                    if err.downcast_ref::<HarnessError>() == Some(&HarnessError::Interrupted) =>
                {
                    status = SuiteStatus::Interrupted;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        // The last case may have finished its checks after the signal arrived.
        if self.interrupted() {
            status = SuiteStatus::Interrupted;
        }
        if status == SuiteStatus::Interrupted {
            warn!(
                module = module.as_str(),
                finished = verdicts.len(),
                "interrupted; stopping the suite"
            );
        }
        Ok(SuiteReport {
            module,
            status,
            verdicts,
        })
    }

    /// `make clean` then `make test{module}` in the source directory.
    pub fn build(&self, module: Module) -> Result<BuildOutcome> {
        let temp = &self.config.temp_dir;
        let make = self.make_program()?;
        let target = module.build_target();
        info!(module = module.as_str(), make_target = %target, "building");

        let clean = CommandSpec::new(&make).arg("clean").cwd(&self.config.src_dir);
        let clean_sinks = OutputSinks::new(
            temp.join(format!("build-{module}.clean.out")),
            temp.join(format!("build-{module}.clean.err")),
        );
        match self.run_build_step(&clean, &clean_sinks)? {
            Some(r) if r.success() => {}
            Some(r) => warn!(
                module = module.as_str(),
                exit_code = ?r.exit_code,
                "clean step failed; building anyway"
            ),
            None => warn!(module = module.as_str(), "clean step could not run"),
        }

        let build = CommandSpec::new(&make).arg(&target).cwd(&self.config.src_dir);
        let sinks = OutputSinks::new(
            temp.join(format!("build-{module}.out")),
            temp.join(format!("build-{module}.err")),
        );
        let result = self.run_build_step(&build, &sinks)?;
        match result {
            Some(r) if r.success() => {
                info!(module = module.as_str(), "build succeeded");
                Ok(BuildOutcome::Built)
            }
            Some(r) => {
                let tail = log_tail(&sinks.stderr, BUILD_LOG_TAIL_LINES);
                warn!(
                    module = module.as_str(),
                    exit_code = ?r.exit_code,
                    timed_out = r.timed_out,
                    "build failed:\n{tail}"
                );
                Ok(BuildOutcome::Failed {
                    exit_code: r.exit_code,
                })
            }
            None => Ok(BuildOutcome::Failed { exit_code: None }),
        }
    }

    fn run_build_step(
        &self,
        cmd: &CommandSpec,
        sinks: &OutputSinks,
    ) -> Result<Option<ExecutionResult>> {
        match self.runner.run(cmd, sinks, self.config.build_timeout) {
            Ok(result) => Ok(Some(result)),
            Err(err) if err.downcast_ref::<HarnessError>().is_some() => Err(err),
            Err(err) => {
                warn!("build command failed: {err:#}");
                Ok(None)
            }
        }
    }

    /// Bare names are looked up on `PATH`; anything with a directory part is
    /// anchored here because the build runs in the source directory.
    fn make_program(&self) -> Result<PathBuf> {
        let make = &self.config.make;
        if make.components().count() > 1 {
            process::absolute(make)
        } else {
            Ok(make.clone())
        }
    }

    /// Discards the temp directory, or moves it to `save` (replacing what is
    /// there). Failures are logged and otherwise ignored.
    pub fn finish(&self, save: Option<&Path>) {
        let temp = &self.config.temp_dir;
        let outcome = match save {
            Some(dest) => save_dir(temp, dest),
            None => std::fs::remove_dir_all(temp)
                .with_context(|| format!("remove temp dir: {}", temp.display())),
        };
        if let Err(err) = outcome {
            warn!("cleanup failed: {err:#}");
        }
    }
}

fn save_dir(temp: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .with_context(|| format!("remove existing results dir: {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    if std::fs::rename(temp, dest).is_ok() {
        info!(dest = %dest.display(), "results saved");
        return Ok(());
    }
    // Rename fails across filesystems.
    copy_dir_all(temp, dest)?;
    std::fs::remove_dir_all(temp).with_context(|| format!("remove temp dir: {}", temp.display()))?;
    info!(dest = %dest.display(), "results saved");
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create dir: {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read dir: {}", src.display()))? {
        let entry = entry.with_context(|| format!("read dir: {}", src.display()))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
