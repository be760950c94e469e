use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::module::{InvocationStyle, Module};

pub const ENV_JASMIN_JAR: &str = "JASMIN_JAR";
pub const DEFAULT_JASMIN_JAR: &str = "/usr/local/lib/jasmin.jar";
pub const DEFAULT_CONFIG_FILE: &str = "ampl-test.json";

/// How the subject is re-run under the memory checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemcheckConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Exit code reserved by the checker for "fault detected".
    pub fault_exit_code: i32,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("valgrind"),
            args: vec![
                "--leak-check=full".to_string(),
                "--errors-for-leak-kinds=definite".to_string(),
                "--error-exitcode=255".to_string(),
            ],
            fault_exit_code: 255,
        }
    }
}

/// The codegen secondary stage: a Jasmin assembler and a JVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub java: PathBuf,
    pub jasmin_jar: PathBuf,
}

impl RuntimeConfig {
    /// Reads `JASMIN_JAR` once; falls back to [`DEFAULT_JASMIN_JAR`].
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var_os(ENV_JASMIN_JAR))
    }

    fn from_env_value(value: Option<OsString>) -> Self {
        let jasmin_jar = value
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_JASMIN_JAR));
        Self {
            java: PathBuf::from("java"),
            jasmin_jar,
        }
    }
}

/// Everything a suite run needs, fixed before the first process is spawned.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixtures_root: PathBuf,
    pub src_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub timeout: Duration,
    pub build_timeout: Duration,
    pub grace: Duration,
    pub make: PathBuf,
    pub memcheck: Option<MemcheckConfig>,
    pub side_by_side: bool,
    pub second_stage: bool,
    pub runtime: RuntimeConfig,
    /// Per-module overrides of [`Module::default_invocation_style`].
    pub invocation: BTreeMap<Module, InvocationStyle>,
}

impl HarnessConfig {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            fixtures_root: PathBuf::from("."),
            src_dir: PathBuf::from("../src"),
            bin_dir: PathBuf::from("../bin"),
            temp_dir: PathBuf::from("temp"),
            timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(300),
            grace: Duration::from_secs(1),
            make: PathBuf::from("make"),
            memcheck: None,
            side_by_side: false,
            second_stage: true,
            runtime,
            invocation: BTreeMap::new(),
        }
    }

    /// Path of the subject executable for `module`.
    pub fn subject(&self, module: Module) -> PathBuf {
        self.bin_dir.join(module.executable_name())
    }

    /// Where the cases of `module` leave their captures, logs and artifacts.
    pub fn work_dir(&self, module: Module) -> PathBuf {
        self.temp_dir.join(module.as_str())
    }

    pub fn invocation_style(&self, module: Module) -> InvocationStyle {
        self.invocation
            .get(&module)
            .copied()
            .unwrap_or_else(|| module.default_invocation_style())
    }

    /// Overlays every field the file sets.
    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.fixtures_root {
            self.fixtures_root = v;
        }
        if let Some(v) = file.src_dir {
            self.src_dir = v;
        }
        if let Some(v) = file.bin_dir {
            self.bin_dir = v;
        }
        if let Some(v) = file.temp_dir {
            self.temp_dir = v;
        }
        if let Some(v) = file.timeout_secs {
            self.timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.build_timeout_secs {
            self.build_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.grace_ms {
            self.grace = Duration::from_millis(v);
        }
        if let Some(v) = file.make {
            self.make = v;
        }
        if file.memcheck.is_some() {
            self.memcheck = file.memcheck;
        }
        if let Some(v) = file.side_by_side {
            self.side_by_side = v;
        }
        if let Some(v) = file.second_stage {
            self.second_stage = v;
        }
        if let Some(v) = file.java {
            self.runtime.java = v;
        }
        if let Some(v) = file.jasmin_jar {
            self.runtime.jasmin_jar = v;
        }
        if let Some(v) = file.invocation {
            self.invocation.extend(v);
        }
    }
}

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub fixtures_root: Option<PathBuf>,
    pub src_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub build_timeout_secs: Option<u64>,
    pub grace_ms: Option<u64>,
    pub make: Option<PathBuf>,
    pub memcheck: Option<MemcheckConfig>,
    pub side_by_side: Option<bool>,
    pub second_stage: Option<bool>,
    pub java: Option<PathBuf>,
    pub jasmin_jar: Option<PathBuf>,
    pub invocation: Option<BTreeMap<Module, InvocationStyle>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse JSON: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_defaults_when_env_unset_or_empty() {
        let rt = RuntimeConfig::from_env_value(None);
        assert_eq!(rt.jasmin_jar, PathBuf::from(DEFAULT_JASMIN_JAR));
        let rt = RuntimeConfig::from_env_value(Some(OsString::new()));
        assert_eq!(rt.jasmin_jar, PathBuf::from(DEFAULT_JASMIN_JAR));
        let rt = RuntimeConfig::from_env_value(Some(OsString::from("/opt/jasmin.jar")));
        assert_eq!(rt.jasmin_jar, PathBuf::from("/opt/jasmin.jar"));
    }

    #[test]
    fn file_overrides_only_what_it_sets() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"timeout_secs": 3, "memcheck": {}, "bin_dir": "out/bin", "jasmin_jar": "j.jar"}"#,
        )
        .expect("parse config");

        let mut cfg = HarnessConfig::new(RuntimeConfig::from_env_value(None));
        cfg.apply_file(file);

        assert_eq!(cfg.timeout, Duration::from_secs(3));
        assert_eq!(cfg.memcheck, Some(MemcheckConfig::default()));
        assert_eq!(cfg.subject(Module::Parser), PathBuf::from("out/bin/testparser"));
        assert_eq!(cfg.runtime.jasmin_jar, PathBuf::from("j.jar"));
        assert_eq!(cfg.src_dir, PathBuf::from("../src"));
        assert!(cfg.second_stage);
    }

    #[test]
    fn invocation_style_can_be_overridden_per_module() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"invocation": {"hashtable": "redirection"}}"#)
                .expect("parse config");
        let mut cfg = HarnessConfig::new(RuntimeConfig::from_env_value(None));
        assert_eq!(
            cfg.invocation_style(Module::Hashtable),
            InvocationStyle::Argument
        );

        cfg.apply_file(file);
        assert_eq!(
            cfg.invocation_style(Module::Hashtable),
            InvocationStyle::Redirection
        );
        assert_eq!(
            cfg.invocation_style(Module::Symboltable),
            InvocationStyle::Argument
        );
        assert_eq!(
            cfg.invocation_style(Module::Codegen),
            InvocationStyle::TwoStage
        );
        assert_eq!(cfg.work_dir(Module::Hashtable), PathBuf::from("temp/hashtable"));

        let err = serde_json::from_str::<ConfigFile>(r#"{"invocation": {"linker": "argument"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown variant"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<ConfigFile>(r#"{"timeout": 3}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn memcheck_fields_are_individually_optional() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"memcheck": {"fault_exit_code": 99}}"#).expect("parse");
        let mc = file.memcheck.expect("memcheck");
        assert_eq!(mc.fault_exit_code, 99);
        assert_eq!(mc.program, PathBuf::from("valgrind"));
    }
}
