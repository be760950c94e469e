use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::interrupt::Interrupt;
use crate::terminate::{self, ProcessGroup, Signal, TerminationState, Terminator};

/// What to run and what to feed it.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// File piped to stdin; stdin is `/dev/null` when absent.
    pub stdin: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for a in &self.args {
            out.push(' ');
            out.push_str(&a.to_string_lossy());
        }
        out
    }
}

/// Files the child's stdout and stderr are written to.
#[derive(Debug, Clone)]
pub struct OutputSinks {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl OutputSinks {
    pub fn new(stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of a normal exit. `None` on timeout or death by signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    /// Pid of the leader, which is also the process group id.
    pub pid: u32,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Exited on its own, whatever the exit code.
    pub fn exited_normally(&self) -> bool {
        !self.timed_out && self.exit_code.is_some()
    }

    /// Killed by a signal the harness did not send.
    pub fn crashed(&self) -> bool {
        !self.timed_out && self.signal.is_some()
    }
}

/// Spawns children in their own process group and bounds every wait.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
    interrupt: Interrupt,
}

impl ProcessRunner {
    pub fn new(grace: Duration, interrupt: Interrupt) -> Self {
        become_subreaper();
        Self { grace, interrupt }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Runs `cmd` to completion or until `timeout`, capturing both output
    /// streams to `sinks`.
    ///
    /// A timeout escalates SIGTERM then SIGKILL over the whole group and is
    /// reported as `timed_out`. A group that survives the escalation yields
    /// [`HarnessError::Unkillable`]; an operator interrupt yields
    /// [`HarnessError::Interrupted`] once the group is terminated.
    pub fn run(
        &self,
        cmd: &CommandSpec,
        sinks: &OutputSinks,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        if self.interrupt.requested() {
            return Err(HarnessError::Interrupted.into());
        }

        let start = Instant::now();
        let child = spawn_in_group(cmd, sinks)?;
        let pid = child.id();
        debug!(pid, cmd = %cmd.display(), "spawned");

        let mut group = ChildGroup::new(child);
        let deadline = start.checked_add(timeout);

        let (status, timed_out) = loop {
            if let Some(status) = group.try_reap()? {
                if Terminator::new(self.grace).force(&mut group) == TerminationState::Unkillable {
                    return Err(HarnessError::Unkillable { pid }.into());
                }
                break (Some(status), false);
            }

            if self.interrupt.requested() {
                warn!(pid, "interrupt received; terminating process group");
                if Terminator::new(self.grace).run(&mut group) == TerminationState::Unkillable {
                    warn!(pid, "process group could not be killed; children may be left running");
                }
                return Err(HarnessError::Interrupted.into());
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(pid, timeout_ms = timeout.as_millis() as u64, "timed out");
                match Terminator::new(self.grace).run(&mut group) {
                    TerminationState::Terminated => break (group.status, true),
                    _ => return Err(HarnessError::Unkillable { pid }.into()),
                }
            }

            std::thread::sleep(Duration::from_millis(5));
        };

        let (exit_code, signal) = match (status, timed_out) {
            (_, true) | (None, _) => (None, status.and_then(exit_signal)),
            (Some(status), false) => (status.code(), exit_signal(status)),
        };

        Ok(ExecutionResult {
            exit_code,
            signal,
            timed_out,
            pid,
            stdout: sinks.stdout.clone(),
            stderr: sinks.stderr.clone(),
            duration: start.elapsed(),
        })
    }
}

/// Anchors a relative path at the current directory, for commands that run
/// in another working directory.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("get current dir")?;
    Ok(cwd.join(path))
}

fn spawn_in_group(cmd: &CommandSpec, sinks: &OutputSinks) -> Result<Child> {
    let stdout = File::create(&sinks.stdout)
        .with_context(|| format!("create stdout sink: {}", sinks.stdout.display()))?;
    let stderr = File::create(&sinks.stderr)
        .with_context(|| format!("create stderr sink: {}", sinks.stderr.display()))?;
    let stdin = match &cmd.stdin {
        Some(path) => Stdio::from(
            File::open(path).with_context(|| format!("open stdin source: {}", path.display()))?,
        ),
        None => Stdio::null(),
    };

    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    command.stdin(stdin);
    command.stdout(Stdio::from(stdout));
    command.stderr(Stdio::from(stderr));
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    command
        .spawn()
        .with_context(|| format!("spawn: {}", cmd.program.display()))
}

fn exit_signal(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Orphaned grandchildren are re-parented to the harness so that they can be
/// reaped here; zombies still count as group members.
fn become_subreaper() {
    #[cfg(target_os = "linux")]
    unsafe {
        let _ = libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }
}

struct ChildGroup {
    child: Child,
    pgid: u32,
    status: Option<ExitStatus>,
}

impl ChildGroup {
    fn new(child: Child) -> Self {
        let pgid = child.id();
        Self {
            child,
            pgid,
            status: None,
        }
    }

    fn try_reap(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self.child.try_wait().context("try_wait child")?;
        }
        Ok(self.status)
    }

    /// Reaps exited group members that were re-parented to us.
    fn reap_orphans(&self) {
        #[cfg(unix)]
        {
            let Ok(pgid) = i32::try_from(self.pgid) else {
                return;
            };
            loop {
                let mut wstatus: libc::c_int = 0;
                let reaped = unsafe { libc::waitpid(-pgid, &mut wstatus, libc::WNOHANG) };
                if reaped <= 0 {
                    return;
                }
            }
        }
    }
}

impl ProcessGroup for ChildGroup {
    fn id(&self) -> u32 {
        self.pgid
    }

    fn signal(&mut self, sig: Signal) {
        terminate::signal_group(self.pgid, sig);
    }

    fn is_gone(&mut self) -> bool {
        match self.try_reap() {
            Ok(Some(_)) => {
                self.reap_orphans();
                terminate::group_is_empty(self.pgid)
            }
            Ok(None) => false,
            Err(err) => {
                warn!(pgid = self.pgid, "try_wait failed: {err:#}");
                false
            }
        }
    }
}
