use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use ampl_harness::config::{ConfigFile, DEFAULT_CONFIG_FILE};
use ampl_harness::fixture::parse_case_selection;
use ampl_harness::report::{self, RunReport};
use ampl_harness::{
    FixtureCase, HarnessConfig, HarnessError, Interrupt, MemcheckConfig, Module, ProcessRunner,
    RuntimeConfig, SuiteReport, SuiteStatus, TestSuiteRunner,
};
use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_UNKILLABLE: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "ampl-test")]
#[command(about = "Builds and runs the AMPL compiler test executables against golden fixtures.")]
#[command(version)]
#[command(group(
    ArgGroup::new("target")
        .required(true)
        .multiple(true)
        .args([
            "scanner",
            "parser",
            "hashtable",
            "symboltable",
            "typechecking",
            "codegen",
            "all",
            "module",
        ]),
))]
struct Cli {
    #[arg(long)]
    scanner: bool,
    #[arg(long)]
    parser: bool,
    #[arg(long)]
    hashtable: bool,
    #[arg(long)]
    symboltable: bool,
    #[arg(long)]
    typechecking: bool,
    #[arg(long)]
    codegen: bool,
    /// Every module, in pipeline order.
    #[arg(long)]
    all: bool,
    #[arg(long, value_name = "NAME")]
    module: Option<String>,

    /// Case numbers or inclusive ranges (`3..7`). Empty means every fixture.
    #[arg(value_name = "CASES")]
    cases: Vec<String>,

    /// Move the temp directory here afterwards, replacing it if present.
    #[arg(long, value_name = "DIR")]
    save: Option<PathBuf>,

    /// Re-run each subject under the memory checker.
    #[arg(long)]
    memcheck: bool,

    #[arg(long)]
    side_by_side: bool,

    /// Skip assembling and running codegen output.
    #[arg(long)]
    no_second_stage: bool,

    /// Per-process timeout in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, value_name = "DIR")]
    src_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    bin_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    fixtures_root: Option<PathBuf>,

    /// JSON config file. Defaults to `ampl-test.json` in the fixtures root,
    /// when present.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    report_out: Option<PathBuf>,

    /// Print the JSON report on stdout instead of the console summary.
    #[arg(long)]
    json: bool,

    /// Print the cases that would run and exit.
    #[arg(long)]
    list: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn modules(&self) -> Result<Vec<Module>> {
        if self.all {
            return Ok(Module::ALL.to_vec());
        }
        if let Some(name) = &self.module {
            return Ok(vec![name.parse::<Module>()?]);
        }
        let flags = [
            (self.scanner, Module::Scanner),
            (self.parser, Module::Parser),
            (self.hashtable, Module::Hashtable),
            (self.symboltable, Module::Symboltable),
            (self.typechecking, Module::Typechecking),
            (self.codegen, Module::Codegen),
        ];
        Ok(flags
            .into_iter()
            .filter_map(|(set, module)| set.then_some(module))
            .collect())
    }
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ampl-test: {err:#}");
            ExitCode::from(exit_code_for_error(&err))
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let modules = cli.modules()?;
    let selection = parse_case_selection(&cli.cases)?;
    let config = load_config(&cli)?;

    let interrupt = Interrupt::install_signal_handlers();
    let runner = ProcessRunner::new(config.grace, interrupt);
    let suites = TestSuiteRunner::new(config, runner);

    // Every module's fixtures are validated before anything is built.
    let plan = modules
        .iter()
        .map(|&module| Ok((module, suites.resolve(module, &selection)?)))
        .collect::<Result<Vec<(Module, Vec<FixtureCase>)>>>()?;

    if cli.list {
        for (module, cases) in &plan {
            let numbers: Vec<u32> = cases.iter().map(|c| c.number).collect();
            println!("{module}: {numbers:?}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    suites.prepare()?;
    let mut reports = Vec::with_capacity(plan.len());
    let mut outcome = run_plan(&suites, &plan, cli.json, &mut reports);
    if outcome.is_ok() && suites.interrupted() {
        outcome = Err(HarnessError::Interrupted.into());
    }
    suites.finish(cli.save.as_deref());

    let run_report = RunReport::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), &reports);
    if let Some(path) = &cli.report_out {
        if let Err(err) = run_report.write(path) {
            if outcome.is_ok() {
                return Err(err);
            }
            warn!("{err:#}");
        }
    }
    outcome?;

    if cli.json {
        print!("{}", run_report.to_json()?);
    }
    Ok(ExitCode::from(report::exit_code_for(&reports)))
}

/// Runs the suites in order. Build failures are recorded and the run goes
/// on; an unkillable child or an interrupt stops it. An interrupted suite
/// still lands in `reports` with the cases it finished.
fn run_plan(
    suites: &TestSuiteRunner,
    plan: &[(Module, Vec<FixtureCase>)],
    quiet: bool,
    reports: &mut Vec<SuiteReport>,
) -> Result<()> {
    for (module, cases) in plan {
        let report = suites.run_cases(*module, cases)?;
        if !quiet {
            print!("{}", report::render_console(&report));
        }
        let interrupted = report.status == SuiteStatus::Interrupted;
        reports.push(report);
        if interrupted {
            return Err(HarnessError::Interrupted.into());
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::new(RuntimeConfig::from_env());

    let root = cli
        .fixtures_root
        .clone()
        .unwrap_or_else(|| config.fixtures_root.clone());
    let file = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Some(root.join(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    if let Some(path) = file {
        let file = ConfigFile::load(&path)
            .with_context(|| format!("load config: {}", path.display()))?;
        config.apply_file(file);
    }

    apply_cli(&mut config, cli);
    Ok(config)
}

fn apply_cli(config: &mut HarnessConfig, cli: &Cli) {
    if let Some(dir) = &cli.fixtures_root {
        config.fixtures_root = dir.clone();
    }
    if let Some(dir) = &cli.src_dir {
        config.src_dir = dir.clone();
    }
    if let Some(dir) = &cli.bin_dir {
        config.bin_dir = dir.clone();
    }
    if let Some(secs) = cli.timeout {
        config.timeout = Duration::from_secs(secs);
    }
    if cli.memcheck && config.memcheck.is_none() {
        config.memcheck = Some(MemcheckConfig::default());
    }
    if cli.side_by_side {
        config.side_by_side = true;
    }
    if cli.no_second_stage {
        config.second_stage = false;
    }
}

fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::Unkillable { .. }) => EXIT_UNKILLABLE,
        Some(HarnessError::Interrupted) => EXIT_INTERRUPTED,
        _ => EXIT_CONFIG_ERROR,
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive_for_verbosity(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn directive_for_verbosity(v: u8) -> &'static str {
    match v {
        0 => "ampl_harness=info,ampl_test=info",
        1 => "ampl_harness=debug,ampl_test=debug",
        _ => "ampl_harness=trace,ampl_test=trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_directives() {
        assert_eq!(directive_for_verbosity(0), "ampl_harness=info,ampl_test=info");
        assert_eq!(directive_for_verbosity(1), "ampl_harness=debug,ampl_test=debug");
        assert_eq!(directive_for_verbosity(5), "ampl_harness=trace,ampl_test=trace");
    }

    #[test]
    fn module_flags_select_in_pipeline_order() {
        let cli = Cli::parse_from(["ampl-test", "--codegen", "--scanner", "1..2"]);
        assert_eq!(
            cli.modules().expect("modules"),
            vec![Module::Scanner, Module::Codegen]
        );
        assert_eq!(cli.cases, vec!["1..2"]);

        let cli = Cli::parse_from(["ampl-test", "--all"]);
        assert_eq!(cli.modules().expect("modules"), Module::ALL.to_vec());
    }

    #[test]
    fn unknown_module_name_is_a_config_error() {
        let cli = Cli::parse_from(["ampl-test", "--module", "linker"]);
        let err = cli.modules().unwrap_err();
        assert_eq!(exit_code_for_error(&err), EXIT_CONFIG_ERROR);
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::UnknownModule(_))
        ));
    }

    #[test]
    fn a_module_is_required() {
        assert!(Cli::try_parse_from(["ampl-test", "1"]).is_err());
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = Cli::parse_from([
            "ampl-test",
            "--parser",
            "--memcheck",
            "--no-second-stage",
            "--timeout",
            "4",
            "--bin-dir",
            "out",
        ]);
        let mut config = HarnessConfig::new(RuntimeConfig::from_env());
        apply_cli(&mut config, &cli);
        assert_eq!(config.timeout, Duration::from_secs(4));
        assert_eq!(config.memcheck, Some(MemcheckConfig::default()));
        assert!(!config.second_stage);
        assert_eq!(config.subject(Module::Parser), PathBuf::from("out/testparser"));
    }

    #[test]
    fn harness_errors_map_to_exit_codes() {
        let err = anyhow::Error::new(HarnessError::Interrupted).context("running scanner");
        assert_eq!(exit_code_for_error(&err), EXIT_INTERRUPTED);
        let err = anyhow::Error::new(HarnessError::Unkillable { pid: 7 });
        assert_eq!(exit_code_for_error(&err), EXIT_UNKILLABLE);
    }
}
