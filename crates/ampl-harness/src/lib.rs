//! Execution engine for the AMPL compiler test harness.
//!
//! Builds a module's test executable, runs it against numbered fixtures in
//! isolated process groups, optionally re-runs it under a memory checker,
//! and diffs every captured stream against golden files.

pub mod compare;
pub mod config;
pub mod error;
pub mod fixture;
pub mod interrupt;
pub mod memcheck;
pub mod module;
pub mod process;
pub mod report;
pub mod suite;
pub mod terminate;
pub mod unit;

pub use config::{HarnessConfig, MemcheckConfig, RuntimeConfig};
pub use error::HarnessError;
pub use fixture::{CaseSelection, FixtureCase};
pub use interrupt::Interrupt;
pub use module::{InvocationStyle, Module, Stream};
pub use process::{CommandSpec, ExecutionResult, OutputSinks, ProcessRunner};
pub use suite::{SuiteReport, SuiteStatus, TestSuiteRunner};
pub use unit::{FailureReason, TestUnit, Verdict};
