use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// The compiler phase under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Scanner,
    Parser,
    Hashtable,
    Symboltable,
    Typechecking,
    Codegen,
}

/// How a subject receives its fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStyle {
    /// Fixture path is the sole argument.
    Argument,
    /// Fixture content is piped on stdin, no arguments.
    Redirection,
    /// Argument style, followed by assembling and running the emitted
    /// artifact on a second runtime.
    TwoStage,
}

/// A captured output stream compared against a golden file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
    ClassStdout,
    ClassStderr,
}

impl Stream {
    /// File suffix shared by the golden and the captured file.
    pub fn suffix(self) -> &'static str {
        match self {
            Stream::Stdout => "out",
            Stream::Stderr => "err",
            Stream::ClassStdout => "class.out",
            Stream::ClassStderr => "class.err",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::ClassStdout => "class stdout",
            Stream::ClassStderr => "class stderr",
        }
    }

    pub fn is_secondary(self) -> bool {
        matches!(self, Stream::ClassStdout | Stream::ClassStderr)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Module {
    pub const ALL: [Module; 6] = [
        Module::Scanner,
        Module::Parser,
        Module::Hashtable,
        Module::Symboltable,
        Module::Typechecking,
        Module::Codegen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Module::Scanner => "scanner",
            Module::Parser => "parser",
            Module::Hashtable => "hashtable",
            Module::Symboltable => "symboltable",
            Module::Typechecking => "typechecking",
            Module::Codegen => "codegen",
        }
    }

    /// Make target that builds the subject.
    pub fn build_target(self) -> String {
        format!("test{}", self.as_str())
    }

    /// File name of the subject executable inside the bin directory.
    pub fn executable_name(self) -> String {
        self.build_target()
    }

    /// Every driver takes the fixture path as its argument; codegen also
    /// emits an artifact for the second stage. Configuration may override it.
    pub fn default_invocation_style(self) -> InvocationStyle {
        match self {
            Module::Codegen => InvocationStyle::TwoStage,
            _ => InvocationStyle::Argument,
        }
    }
}

impl InvocationStyle {
    /// Streams compared for every case. Secondary streams are only compared
    /// when the secondary stage applies to a case.
    pub fn streams(self) -> &'static [Stream] {
        match self {
            InvocationStyle::TwoStage => &[
                Stream::Stdout,
                Stream::Stderr,
                Stream::ClassStdout,
                Stream::ClassStderr,
            ],
            InvocationStyle::Argument | InvocationStyle::Redirection => {
                &[Stream::Stdout, Stream::Stderr]
            }
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or(HarnessError::UnknownModule(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Scanner".parse::<Module>(), Ok(Module::Scanner));
        assert_eq!(" codegen ".parse::<Module>(), Ok(Module::Codegen));
        assert_eq!(
            "lexer".parse::<Module>(),
            Err(HarnessError::UnknownModule("lexer".to_string()))
        );
    }

    #[test]
    fn only_codegen_compares_secondary_streams() {
        for m in Module::ALL {
            let style = m.default_invocation_style();
            let has_secondary = style.streams().iter().any(|s| s.is_secondary());
            assert_eq!(has_secondary, m == Module::Codegen, "{m}");
        }
    }

    #[test]
    fn build_target_and_executable() {
        assert_eq!(Module::Symboltable.build_target(), "testsymboltable");
        assert_eq!(Module::Hashtable.executable_name(), "testhashtable");
        assert_eq!(
            Module::Hashtable.default_invocation_style(),
            InvocationStyle::Argument
        );
    }
}
