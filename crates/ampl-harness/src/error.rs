use std::fmt;
use std::path::PathBuf;

/// Harness conditions a caller has to tell apart from ordinary I/O errors.
///
/// These travel inside `anyhow::Error`; recover them with `downcast_ref`.
/// Per-case failures are never errors, see [`crate::unit::FailureReason`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    UnknownModule(String),
    InvalidCaseSelection(String),
    MissingFixture {
        module: String,
        case: u32,
        path: PathBuf,
    },
    /// A process group survived both the graceful and the forced kill.
    Unkillable { pid: u32 },
    Interrupted,
}

impl HarnessError {
    /// True for errors raised while validating configuration, before any
    /// process was spawned.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HarnessError::UnknownModule(_)
                | HarnessError::InvalidCaseSelection(_)
                | HarnessError::MissingFixture { .. }
        )
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::UnknownModule(name) => write!(
                f,
                "unknown module {name:?} (expected one of: scanner, parser, hashtable, symboltable, typechecking, codegen)"
            ),
            HarnessError::InvalidCaseSelection(raw) => write!(
                f,
                "invalid case selection {raw:?} (expected integers or an inclusive range like 3..7)"
            ),
            HarnessError::MissingFixture { module, case, path } => write!(
                f,
                "{module}: fixture {case} has no input file: {}",
                path.display()
            ),
            HarnessError::Unkillable { pid } => write!(
                f,
                "process group {pid} survived SIGTERM and SIGKILL; operator intervention required"
            ),
            HarnessError::Interrupted => f.write_str("interrupted"),
        }
    }
}

impl std::error::Error for HarnessError {}
