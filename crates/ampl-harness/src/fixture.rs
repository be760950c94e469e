use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::HarnessError;
use crate::module::{Module, Stream};

/// A numbered fixture of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FixtureCase {
    pub module: Module,
    pub number: u32,
}

impl FixtureCase {
    pub fn new(module: Module, number: u32) -> Self {
        Self { module, number }
    }

    pub fn input(&self, fixtures_root: &Path) -> PathBuf {
        module_dir(fixtures_root, self.module).join(format!("{}.in", self.number))
    }

    pub fn golden(&self, fixtures_root: &Path, stream: Stream) -> PathBuf {
        module_dir(fixtures_root, self.module).join(format!("{}.{}", self.number, stream.suffix()))
    }

    /// Stdin of the secondary stage. Its presence opts the case into that stage.
    pub fn class_input(&self, fixtures_root: &Path) -> PathBuf {
        module_dir(fixtures_root, self.module).join(format!("{}.class.in", self.number))
    }

    pub fn captured(&self, work_dir: &Path, stream: Stream) -> PathBuf {
        work_dir.join(format!("{}.{}", self.number, stream.suffix()))
    }

    pub fn memcheck_log(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}.valgrind", self.number))
    }

    /// Assembly the codegen subject leaves in its working directory.
    pub fn artifact(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}.j", self.number))
    }

    pub fn classes_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}.classes", self.number))
    }

    pub fn assembler_log(&self, work_dir: &Path, suffix: &str) -> PathBuf {
        work_dir.join(format!("{}.jasmin.{suffix}", self.number))
    }
}

pub fn module_dir(fixtures_root: &Path, module: Module) -> PathBuf {
    fixtures_root.join(module.as_str())
}

/// Operator case selection: inclusive ranges, sorted and merged. Empty
/// means every discovered fixture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseSelection {
    ranges: Vec<RangeInclusive<u32>>,
}

impl CaseSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of(numbers: &[u32]) -> Self {
        Self::from_ranges(numbers.iter().map(|&n| n..=n).collect())
    }

    fn from_ranges(mut ranges: Vec<RangeInclusive<u32>>) -> Self {
        ranges.sort_by_key(|r| (*r.start(), *r.end()));
        let mut merged: Vec<RangeInclusive<u32>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if let Some(last) = merged.last_mut() {
                if u64::from(*r.start()) <= u64::from(*last.end()) + 1 {
                    if r.end() > last.end() {
                        *last = *last.start()..=*r.end();
                    }
                    continue;
                }
            }
            merged.push(r);
        }
        Self { ranges: merged }
    }

    pub fn is_all(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[RangeInclusive<u32>] {
        &self.ranges
    }
}

/// Parses operator case arguments: integers and inclusive `a..b` ranges,
/// in any mix. Ranges stay ranges; nothing is expanded here.
pub fn parse_case_selection<S: AsRef<str>>(
    args: &[S],
) -> Result<CaseSelection, HarnessError> {
    let mut ranges = Vec::with_capacity(args.len());
    for raw in args {
        let raw = raw.as_ref().trim();
        let invalid = || HarnessError::InvalidCaseSelection(raw.to_string());
        if let Some((lo, hi)) = raw.split_once("..") {
            let lo: u32 = lo.trim().parse().map_err(|_| invalid())?;
            let hi: u32 = hi.trim().parse().map_err(|_| invalid())?;
            if lo > hi {
                return Err(invalid());
            }
            ranges.push(lo..=hi);
        } else {
            let n = raw.parse::<u32>().map_err(|_| invalid())?;
            ranges.push(n..=n);
        }
    }
    Ok(CaseSelection::from_ranges(ranges))
}

/// Sorted case numbers of the integer-named `.in` files in a module
/// directory. Secondary-stage `.class.in` files are not cases, and neither
/// are names like `007.in` that no case number maps back to.
pub fn discover_cases(fixtures_root: &Path, module: Module) -> Result<Vec<u32>> {
    Ok(scan_inputs(fixtures_root, module)?.into_iter().collect())
}

fn scan_inputs(fixtures_root: &Path, module: Module) -> Result<BTreeSet<u32>> {
    let dir = module_dir(fixtures_root, module);
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("read fixture dir: {}", dir.display()))?;

    let mut cases = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read fixture dir: {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".in") else {
            continue;
        };
        if let Ok(n) = stem.parse::<u32>() {
            if n.to_string() == stem {
                cases.insert(n);
            }
        }
    }
    Ok(cases)
}

/// Resolves the cases to run: the explicit selection, or discovery when
/// empty. Every selected case must have its `.in` file; ranges are checked
/// against the directory listing, so their width costs nothing.
pub fn resolve_cases(
    fixtures_root: &Path,
    module: Module,
    selection: &CaseSelection,
) -> Result<Vec<FixtureCase>> {
    let available = if selection.is_all() || module_dir(fixtures_root, module).is_dir() {
        scan_inputs(fixtures_root, module)?
    } else {
        BTreeSet::new()
    };
    if selection.is_all() {
        return Ok(available
            .into_iter()
            .map(|n| FixtureCase::new(module, n))
            .collect());
    }

    let mut cases = Vec::new();
    for range in selection.ranges() {
        let (lo, hi) = (*range.start(), *range.end());
        let present = available.range(lo..=hi).count() as u64;
        if present != u64::from(hi - lo) + 1 {
            let missing = (lo..=hi).find(|n| !available.contains(n)).unwrap_or(lo);
            let case = FixtureCase::new(module, missing);
            return Err(HarnessError::MissingFixture {
                module: module.as_str().to_string(),
                case: missing,
                path: case.input(fixtures_root),
            }
            .into());
        }
        cases.extend(available.range(lo..=hi).map(|&n| FixtureCase::new(module, n)));
    }
    Ok(cases)
}
