//! Escalating termination of a child process group.
//!
//! The escalation is an explicit state machine:
//!
//! ```text
//! Running -> GraceRequested -> ForceRequested -> Terminated | Unkillable
//! ```
//!
//! `Unkillable` is terminal and is surfaced to the caller as
//! [`crate::error::HarnessError::Unkillable`]; nothing proceeds as if the
//! group were gone.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    GraceRequested { deadline: Instant },
    ForceRequested { deadline: Instant },
    Terminated,
    Unkillable,
}

/// The target of an escalation: a group leader and everything it forked.
pub trait ProcessGroup {
    fn id(&self) -> u32;

    /// Sends `sig` to every member of the group.
    fn signal(&mut self, sig: Signal);

    /// Reaps the leader if possible and reports whether the leader and every
    /// other member are gone.
    fn is_gone(&mut self) -> bool;
}

/// Drives a [`ProcessGroup`] from `Running` to a terminal state.
#[derive(Debug)]
pub struct Terminator {
    grace: Duration,
    poll: Duration,
    state: TerminationState,
}

impl Terminator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            poll: Duration::from_millis(10),
            state: TerminationState::Running,
        }
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Advances the machine by one transition.
    pub fn step<G: ProcessGroup + ?Sized>(&mut self, group: &mut G) -> TerminationState {
        let now = Instant::now();
        self.state = match self.state {
            TerminationState::Running => {
                if group.is_gone() {
                    TerminationState::Terminated
                } else {
                    debug!(pgid = group.id(), "sending SIGTERM to process group");
                    group.signal(Signal::Term);
                    TerminationState::GraceRequested {
                        deadline: now + self.grace,
                    }
                }
            }
            TerminationState::GraceRequested { deadline } => {
                if group.is_gone() {
                    TerminationState::Terminated
                } else if now >= deadline {
                    debug!(pgid = group.id(), "grace expired; sending SIGKILL to process group");
                    group.signal(Signal::Kill);
                    TerminationState::ForceRequested {
                        deadline: now + self.grace,
                    }
                } else {
                    self.state
                }
            }
            TerminationState::ForceRequested { deadline } => {
                if group.is_gone() {
                    TerminationState::Terminated
                } else if now >= deadline {
                    warn!(pgid = group.id(), "process group survived SIGKILL");
                    TerminationState::Unkillable
                } else {
                    self.state
                }
            }
            terminal => terminal,
        };
        self.state
    }

    /// Skips the grace step: SIGKILL at once, then one grace interval to die.
    /// For members a leader left behind after it exited on its own.
    pub fn force<G: ProcessGroup + ?Sized>(mut self, group: &mut G) -> TerminationState {
        if group.is_gone() {
            self.state = TerminationState::Terminated;
            return self.state;
        }
        debug!(pgid = group.id(), "sending SIGKILL to leftover group members");
        group.signal(Signal::Kill);
        self.state = TerminationState::ForceRequested {
            deadline: Instant::now() + self.grace,
        };
        self.run(group)
    }

    /// Runs the escalation to completion. Returns `Terminated` or `Unkillable`.
    pub fn run<G: ProcessGroup + ?Sized>(mut self, group: &mut G) -> TerminationState {
        loop {
            match self.step(group) {
                TerminationState::Terminated | TerminationState::Unkillable => return self.state,
                _ => std::thread::sleep(self.poll),
            }
        }
    }
}

/// Sends `sig` to the process group `pgid`. Errors such as `ESRCH` are ignored.
pub fn signal_group(pgid: u32, sig: Signal) {
    #[cfg(unix)]
    {
        let Ok(pgid) = i32::try_from(pgid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pgid, sig.raw());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, sig);
    }
}

/// True when no process is left in the group `pgid`.
pub fn group_is_empty(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pgid) = i32::try_from(pgid) else {
            return true;
        };
        unsafe {
            match libc::kill(-pgid, 0) {
                0 => false,
                _ => std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        true
    }
}
