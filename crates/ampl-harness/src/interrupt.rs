//! Operator interrupt latch.
//!
//! SIGINT and SIGTERM delivered to the harness only set a flag. Wait loops
//! poll it, terminate their in-flight process group, and return
//! [`crate::error::HarnessError::Interrupted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Where a wait loop looks for an interrupt request.
#[derive(Debug, Clone, Default)]
pub enum Interrupt {
    /// The process-wide SIGINT/SIGTERM latch.
    #[default]
    Signals,
    /// A flag owned by the caller.
    Flag(Arc<AtomicBool>),
}

impl Interrupt {
    /// Installs the SIGINT/SIGTERM handlers (once per process) and returns
    /// the matching source.
    pub fn install_signal_handlers() -> Self {
        INSTALL.call_once(|| {
            #[cfg(unix)]
            unsafe {
                let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
                let _ = libc::signal(libc::SIGINT, handler);
                let _ = libc::signal(libc::SIGTERM, handler);
            }
        });
        Interrupt::Signals
    }

    pub fn flag() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Interrupt::Flag(Arc::clone(&flag)), flag)
    }

    pub fn requested(&self) -> bool {
        match self {
            Interrupt::Signals => SIGNALLED.load(Ordering::SeqCst),
            Interrupt::Flag(flag) => flag.load(Ordering::SeqCst),
        }
    }
}
