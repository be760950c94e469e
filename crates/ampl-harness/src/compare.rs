use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use similar::{DiffTag, TextDiff};

use crate::module::Stream;

const COLUMN_WIDTH: usize = 60;

/// Outcome of comparing one captured stream with its golden file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub stream: Stream,
    pub matched: bool,
    /// Human-readable difference, present only on mismatch.
    pub rendering: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputComparator {
    side_by_side: bool,
}

impl OutputComparator {
    pub fn new(side_by_side: bool) -> Self {
        Self { side_by_side }
    }

    /// Exact byte comparison. The rendering never affects `matched`.
    pub fn compare(&self, stream: Stream, actual: &Path, expected: &Path) -> Result<Comparison> {
        let Some(expected_bytes) = read_optional(expected, "read golden")? else {
            return Ok(Comparison {
                stream,
                matched: false,
                rendering: Some(format!("golden file missing: {}", expected.display())),
            });
        };
        let Some(actual_bytes) = read_optional(actual, "read captured output")? else {
            return Ok(Comparison {
                stream,
                matched: false,
                rendering: Some(format!("no output captured: {}", actual.display())),
            });
        };

        if actual_bytes == expected_bytes {
            return Ok(Comparison {
                stream,
                matched: true,
                rendering: None,
            });
        }

        let expected_text = String::from_utf8_lossy(&expected_bytes);
        let actual_text = String::from_utf8_lossy(&actual_bytes);
        let rendering = if self.side_by_side {
            render_side_by_side(&expected_text, &actual_text)
        } else {
            render_unified(expected, actual, &expected_text, &actual_text)
        };
        Ok(Comparison {
            stream,
            matched: false,
            rendering: Some(rendering),
        })
    }
}

fn read_optional(path: &Path, what: &str) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("{what}: {}", path.display())),
    }
}

fn render_unified(
    expected: &Path,
    actual: &Path,
    expected_text: &str,
    actual_text: &str,
) -> String {
    let expected_label = expected.display().to_string();
    let actual_label = actual.display().to_string();
    TextDiff::from_lines(expected_text, actual_text)
        .unified_diff()
        .header(&expected_label, &actual_label)
        .to_string()
}

/// Expected on the left, actual on the right; equal runs are omitted.
fn render_side_by_side(expected_text: &str, actual_text: &str) -> String {
    let diff = TextDiff::from_lines(expected_text, actual_text);
    let old = diff.old_slices();
    let new = diff.new_slices();

    let mut out = String::new();
    for op in diff.ops() {
        let left = &old[op.old_range()];
        let right = &new[op.new_range()];
        match op.tag() {
            DiffTag::Equal => {}
            DiffTag::Delete => {
                for l in left {
                    push_row(&mut out, l, '<', "");
                }
            }
            DiffTag::Insert => {
                for r in right {
                    push_row(&mut out, "", '>', r);
                }
            }
            DiffTag::Replace => {
                for i in 0..left.len().max(right.len()) {
                    match (left.get(i), right.get(i)) {
                        (Some(l), Some(r)) => push_row(&mut out, l, '|', r),
                        (Some(l), None) => push_row(&mut out, l, '<', ""),
                        (None, Some(r)) => push_row(&mut out, "", '>', r),
                        (None, None) => {}
                    }
                }
            }
        }
    }
    out
}

fn push_row(out: &mut String, left: &str, marker: char, right: &str) {
    let left = visible(left);
    let right = visible(right);
    let shown: String = left.chars().take(COLUMN_WIDTH).collect();
    let pad = COLUMN_WIDTH.saturating_sub(shown.chars().count());
    out.push_str(&shown);
    out.extend(std::iter::repeat(' ').take(pad));
    out.push(' ');
    out.push(marker);
    if !right.is_empty() {
        out.push(' ');
        out.push_str(&right);
    }
    out.push('\n');
}

/// Strips the line terminator and makes trailing whitespace and a missing
/// final newline visible, so whitespace-only differences do not render as
/// identical columns.
fn visible(line: &str) -> String {
    if line.is_empty() {
        return String::new();
    }
    let (body, terminated) = match line.strip_suffix('\n') {
        Some(body) => (body.strip_suffix('\r').unwrap_or(body), true),
        None => (line, false),
    };
    let trimmed = body.trim_end_matches([' ', '\t']);
    let mut out = String::from(trimmed);
    for c in body[trimmed.len()..].chars() {
        out.push(if c == '\t' { '→' } else { '·' });
    }
    if !terminated {
        out.push_str(" [no newline]");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn pair(actual: &str, expected: &str) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("1.out");
        let e = dir.path().join("1.expected");
        std::fs::write(&a, actual).expect("write actual");
        std::fs::write(&e, expected).expect("write expected");
        (dir, a, e)
    }

    #[test]
    fn identical_output_matches() {
        let (_dir, a, e) = pair("x\ny\n", "x\ny\n");
        let c = OutputComparator::new(true)
            .compare(Stream::Stdout, &a, &e)
            .expect("compare");
        assert!(c.matched);
        assert_eq!(c.rendering, None);
    }

    #[test]
    fn trailing_whitespace_is_a_mismatch() {
        let (_dir, a, e) = pair("token id\n", "token id \n");
        let c = OutputComparator::new(true)
            .compare(Stream::Stdout, &a, &e)
            .expect("compare");
        assert!(!c.matched);
        let rendering = c.rendering.expect("rendering");
        assert!(rendering.contains("token id·"), "{rendering}");
        assert!(rendering.contains('|'), "{rendering}");
    }

    #[test]
    fn missing_final_newline_is_a_mismatch() {
        let (_dir, a, e) = pair("a\nb", "a\nb\n");
        let c = OutputComparator::new(false)
            .compare(Stream::Stderr, &a, &e)
            .expect("compare");
        assert!(!c.matched);
        assert_eq!(c.stream, Stream::Stderr);
    }

    #[test]
    fn side_by_side_suppresses_common_lines() {
        let (_dir, a, e) = pair("same\nnew\nsame too\nextra\n", "same\nold\nsame too\n");
        let c = OutputComparator::new(true)
            .compare(Stream::Stdout, &a, &e)
            .expect("compare");
        let rendering = c.rendering.expect("rendering");
        assert!(!rendering.contains("same"), "{rendering}");
        let lines: Vec<&str> = rendering.lines().collect();
        assert_eq!(lines.len(), 2, "{rendering}");
        assert!(lines[0].starts_with("old") && lines[0].ends_with("| new"));
        assert!(lines[1].trim_start().starts_with("> extra"));
    }

    #[test]
    fn unified_rendering_names_both_files() {
        let (_dir, a, e) = pair("1\n2\n", "1\n3\n");
        let c = OutputComparator::new(false)
            .compare(Stream::Stdout, &a, &e)
            .expect("compare");
        let rendering = c.rendering.expect("rendering");
        assert!(rendering.contains("-3"), "{rendering}");
        assert!(rendering.contains("+2"), "{rendering}");
        assert!(rendering.contains("1.expected"), "{rendering}");
    }

    #[test]
    fn missing_golden_is_a_mismatch() {
        let (dir, a, _e) = pair("x\n", "x\n");
        let c = OutputComparator::new(false)
            .compare(Stream::ClassStdout, &a, &dir.path().join("absent.class.out"))
            .expect("compare");
        assert!(!c.matched);
        assert!(c
            .rendering
            .expect("rendering")
            .starts_with("golden file missing"));
    }
}
