#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use ampl_harness::{HarnessConfig, Interrupt, Module, ProcessRunner, RuntimeConfig};

pub const GRACE: Duration = Duration::from_millis(200);

pub fn write_bytes(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, bytes).expect("write file");
}

pub fn write_script(path: &Path, body: &str) {
    write_bytes(path, format!("#!/bin/sh\n{body}\n").as_bytes());
    let mut perms = std::fs::metadata(path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod script");
}

pub fn runner() -> ProcessRunner {
    runner_with_flag().0
}

pub fn runner_with_flag() -> (ProcessRunner, Arc<AtomicBool>) {
    let (interrupt, flag) = Interrupt::flag();
    (ProcessRunner::new(GRACE, interrupt), flag)
}

/// A throwaway fixture tree with a fake build tool and fake JVM:
///
/// ```text
/// root/fixtures/{module}/{n}.in ...
/// root/src/            (make runs here; `FAIL_BUILD` makes the build fail)
/// root/bin/test{module}
/// root/temp/build-{module}.out ...
/// root/temp/{module}/{n}.out ...
/// ```
pub struct Tree {
    pub dir: tempfile::TempDir,
}

impl Tree {
    pub fn new() -> Self {
        let tree = Self {
            dir: tempfile::tempdir().expect("tempdir"),
        };
        std::fs::create_dir_all(tree.src()).expect("mkdir src");
        std::fs::create_dir_all(tree.bin()).expect("mkdir bin");
        write_script(
            &tree.root().join("make"),
            r#"case "$1" in
  clean) echo cleaned; exit 0 ;;
  test*) if [ -f FAIL_BUILD ]; then echo "boom: $1" >&2; exit 2; fi; echo "built $1"; exit 0 ;;
esac
exit 1"#,
        );
        write_script(
            &tree.root().join("java"),
            r#"if [ "$1" = "-jar" ]; then
  mkdir -p "$4" && cp "$5" "$4/Prog.class" && exit 0
  exit 1
fi
if [ "$1" = "-cp" ]; then
  cat "$2/$3.class"
  while read -r line; do echo "in: $line"; done
  exit 0
fi
exit 9"#,
        );
        tree
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn fixtures(&self) -> PathBuf {
        self.root().join("fixtures")
    }

    pub fn src(&self) -> PathBuf {
        self.root().join("src")
    }

    pub fn bin(&self) -> PathBuf {
        self.root().join("bin")
    }

    pub fn temp(&self) -> PathBuf {
        self.root().join("temp")
    }

    pub fn work(&self, module: Module) -> PathBuf {
        self.temp().join(module.as_str())
    }

    pub fn fixture(&self, module: Module, name: &str, content: &str) {
        write_bytes(
            &self.fixtures().join(module.as_str()).join(name),
            content.as_bytes(),
        );
    }

    pub fn subject(&self, module: Module, body: &str) {
        write_script(&self.bin().join(module.executable_name()), body);
    }

    pub fn fail_build(&self) {
        write_bytes(&self.src().join("FAIL_BUILD"), b"");
    }

    pub fn config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::new(RuntimeConfig {
            java: self.root().join("java"),
            jasmin_jar: PathBuf::from("jasmin.jar"),
        });
        config.fixtures_root = self.fixtures();
        config.src_dir = self.src();
        config.bin_dir = self.bin();
        config.temp_dir = self.temp();
        config.make = self.root().join("make");
        config.timeout = Duration::from_secs(5);
        config.build_timeout = Duration::from_secs(10);
        config.grace = GRACE;
        config
    }
}
