use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::module::{Module, Stream};
use crate::suite::{SuiteReport, SuiteStatus};
use crate::unit::FailureReason;

pub const REPORT_SCHEMA_VERSION: &str = "ampl-test.report@0.1.0";

pub const EXIT_OK: u8 = 0;
pub const EXIT_CASE_FAILURES: u8 = 10;
pub const EXIT_BUILD_FAILED: u8 = 11;

/// Machine-readable summary of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub tool: ToolInfo,
    pub suites: Vec<SuiteEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteEntry {
    pub module: Module,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_exit_code: Option<i32>,
    pub total: usize,
    pub failed: usize,
    /// Absent when the build failed: no case ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_percentage: Option<f64>,
    pub cases: Vec<CaseEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseEntry {
    pub case: u32,
    pub pass: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<ReasonEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonEntry {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<Stream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReasonEntry {
    fn from_reason(reason: &FailureReason) -> Self {
        let stream = match reason {
            FailureReason::Mismatch { stream, .. } => Some(*stream),
            _ => None,
        };
        Self {
            code: reason.code().to_string(),
            message: reason.to_string(),
            stream,
            detail: reason.detail().map(str::to_string),
        }
    }
}

impl SuiteEntry {
    fn from_suite(suite: &SuiteReport) -> Self {
        let (status, build_exit_code) = match suite.status {
            SuiteStatus::Completed => ("completed", None),
            SuiteStatus::BuildFailed { exit_code } => ("build_failed", exit_code),
            SuiteStatus::Interrupted => ("interrupted", None),
        };
        Self {
            module: suite.module,
            status: status.to_string(),
            build_exit_code,
            total: suite.total(),
            failed: suite.failures().len(),
            pass_percentage: suite.pass_percentage(),
            cases: suite
                .verdicts
                .iter()
                .map(|v| CaseEntry {
                    case: v.case.number,
                    pass: v.passed(),
                    reasons: v.reasons.iter().map(ReasonEntry::from_reason).collect(),
                })
                .collect(),
        }
    }
}

impl RunReport {
    pub fn new(tool_name: &str, tool_version: &str, suites: &[SuiteReport]) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            tool: ToolInfo {
                name: tool_name.to_string(),
                version: tool_version.to_string(),
            },
            suites: suites.iter().map(SuiteEntry::from_suite).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)? + "\n")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create report dir: {}", parent.display()))?;
        }
        std::fs::write(path, self.to_json()?.as_bytes())
            .with_context(|| format!("write report: {}", path.display()))
    }
}

/// Process exit code for a finished run. Build failures win over case failures.
pub fn exit_code_for(suites: &[SuiteReport]) -> u8 {
    if suites
        .iter()
        .any(|s| matches!(s.status, SuiteStatus::BuildFailed { .. }))
    {
        return EXIT_BUILD_FAILED;
    }
    if suites.iter().any(|s| !s.is_success()) {
        return EXIT_CASE_FAILURES;
    }
    EXIT_OK
}

/// Operator-facing text for one suite: a line per case, the rendering of
/// every mismatching stream, then the summary.
pub fn render_console(suite: &SuiteReport) -> String {
    let mut out = String::new();
    let module = suite.module;

    if let SuiteStatus::BuildFailed { exit_code } = suite.status {
        match exit_code {
            Some(code) => {
                let _ = writeln!(out, "{module}: build failed (exit {code})");
            }
            None => {
                let _ = writeln!(out, "{module}: build failed (no exit status)");
            }
        }
        return out;
    }

    for v in &suite.verdicts {
        if v.passed() {
            let _ = writeln!(out, "PASS {}", v.case.number);
            continue;
        }
        let reasons: Vec<String> = v.reasons.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "FAIL {}: {}", v.case.number, reasons.join("; "));
        for reason in &v.reasons {
            if let FailureReason::Mismatch { stream, rendering } = reason {
                let _ = writeln!(out, "--- case {} {stream} ---", v.case.number);
                out.push_str(rendering);
                if !rendering.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
    }

    let _ = writeln!(
        out,
        "{module}: {}/{} passed ({:.1}%)",
        suite.passed(),
        suite.total(),
        suite.pass_percentage().unwrap_or_default()
    );
    let failures = suite.failures();
    if !failures.is_empty() {
        let _ = writeln!(out, "failed cases: {failures:?}");
    }
    if suite.status == SuiteStatus::Interrupted {
        let _ = writeln!(out, "{module}: interrupted; remaining cases not run");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::fixture::FixtureCase;
    use crate::unit::{Stage, Verdict};

    fn sample() -> SuiteReport {
        SuiteReport {
            module: Module::Scanner,
            status: SuiteStatus::Completed,
            verdicts: vec![
                Verdict {
                    case: FixtureCase::new(Module::Scanner, 1),
                    reasons: Vec::new(),
                },
                Verdict {
                    case: FixtureCase::new(Module::Scanner, 3),
                    reasons: vec![
                        FailureReason::Mismatch {
                            stream: Stream::Stdout,
                            rendering: "a | b\n".to_string(),
                        },
                        FailureReason::MemcheckFault {
                            log: PathBuf::from("temp/3.valgrind"),
                        },
                    ],
                },
                Verdict {
                    case: FixtureCase::new(Module::Scanner, 7),
                    reasons: vec![FailureReason::Timeout {
                        stage: Stage::Subject,
                    }],
                },
            ],
        }
    }

    #[test]
    fn console_lists_cases_and_summary() {
        let text = render_console(&sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "PASS 1");
        assert_eq!(
            lines[1],
            "FAIL 3: stdout differs; memory errors detected (see temp/3.valgrind)"
        );
        assert_eq!(lines[2], "--- case 3 stdout ---");
        assert_eq!(lines[3], "a | b");
        assert_eq!(lines[4], "FAIL 7: subject timed out");
        assert_eq!(lines[5], "scanner: 1/3 passed (33.3%)");
        assert_eq!(lines[6], "failed cases: [3, 7]");
    }

    #[test]
    fn console_build_failure_is_distinct() {
        let text = render_console(&SuiteReport::build_failed(Module::Parser, Some(2)));
        assert_eq!(text, "parser: build failed (exit 2)\n");
    }

    #[test]
    fn console_marks_interrupted_suite() {
        let mut suite = sample();
        suite.status = SuiteStatus::Interrupted;
        let text = render_console(&suite);
        assert!(text.contains("scanner: 1/3 passed (33.3%)\n"), "{text}");
        assert!(
            text.ends_with("scanner: interrupted; remaining cases not run\n"),
            "{text}"
        );

        let v = serde_json::to_value(RunReport::new("ampl-test", "0.1.0", &[suite])).expect("json");
        assert_eq!(v["suites"][0]["status"], "interrupted");
        assert_eq!(v["suites"][0]["total"], 3);
    }

    #[test]
    fn json_report_shape() {
        let report = RunReport::new(
            "ampl-test",
            "0.1.0",
            &[sample(), SuiteReport::build_failed(Module::Parser, Some(2))],
        );
        let v: serde_json::Value =
            serde_json::from_str(&report.to_json().expect("json")).expect("parse");

        assert_eq!(v["schema_version"], REPORT_SCHEMA_VERSION);
        assert_eq!(v["tool"]["name"], "ampl-test");
        let scanner = &v["suites"][0];
        assert_eq!(scanner["module"], "scanner");
        assert_eq!(scanner["status"], "completed");
        assert_eq!(scanner["failed"], 2);
        let pct = scanner["pass_percentage"].as_f64().expect("percentage");
        assert!((pct - 100.0 / 3.0).abs() < 1e-9, "{pct}");
        assert!(scanner.get("build_exit_code").is_none());
        assert_eq!(scanner["cases"][1]["reasons"][0]["code"], "mismatch");
        assert_eq!(scanner["cases"][1]["reasons"][0]["stream"], "stdout");
        assert_eq!(scanner["cases"][1]["reasons"][1]["code"], "memcheck_fault");
        assert!(scanner["cases"][0].get("reasons").is_none());

        let parser = &v["suites"][1];
        assert_eq!(parser["status"], "build_failed");
        assert_eq!(parser["build_exit_code"], 2);
        assert_eq!(parser["total"], 0);
        assert!(parser.get("pass_percentage").is_none(), "{parser}");
    }

    #[test]
    fn exit_codes() {
        let ok = SuiteReport {
            module: Module::Parser,
            status: SuiteStatus::Completed,
            verdicts: Vec::new(),
        };
        assert_eq!(exit_code_for(&[ok.clone()]), EXIT_OK);
        assert_eq!(exit_code_for(&[ok.clone(), sample()]), EXIT_CASE_FAILURES);
        assert_eq!(
            exit_code_for(&[sample(), SuiteReport::build_failed(Module::Codegen, None)]),
            EXIT_BUILD_FAILED
        );
    }
}
