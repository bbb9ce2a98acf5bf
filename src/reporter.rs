use std::fmt;

use crate::token::Token;

/// Which stage of the pipeline a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile error"),
            Phase::Runtime => write!(f, "runtime error"),
        }
    }
}

/// One diagnostic, anchored to the line it came from. `line` is carried
/// separately from `Token` so runtime errors (which have no parser token
/// at hand, only a chunk offset) can produce the same shape of report.
#[derive(Debug)]
pub struct Report {
    pub phase: Phase,
    pub message: String,
    pub line: u32,
}

impl Report {
    pub fn compile(message: impl Into<String>, token: &Token) -> Self {
        Report {
            phase: Phase::Compile,
            message: message.into(),
            line: token.line,
        }
    }

    pub fn runtime(message: impl Into<String>, line: u32) -> Self {
        Report {
            phase: Phase::Runtime,
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}: {}", self.line, self.phase, self.message)
    }
}

/// Receives diagnostics as they're produced. The CLI implements this by
/// printing to stderr; tests implement it by collecting reports for
/// later assertions.
pub trait Reporter {
    fn report(&mut self, report: Report);
}

/// The reporter the binary actually uses: prints each diagnostic to
/// stderr as soon as it is produced, and keeps a running error count so
/// the caller can decide the process exit code.
pub struct CliReporter {
    pub error_count: usize,
}

impl CliReporter {
    pub fn new() -> Self {
        CliReporter { error_count: 0 }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for CliReporter {
    fn report(&mut self, report: Report) {
        eprintln!("{}", report);
        self.error_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingReporter {
        reports: Vec<Report>,
    }

    impl Reporter for CollectingReporter {
        fn report(&mut self, report: Report) {
            self.reports.push(report);
        }
    }

    #[test]
    fn report_formats_line_phase_and_message() {
        let token = Token::synthetic("x");
        let report = Report::compile("Unexpected token.", &token);
        assert_eq!(
            format!("{}", report),
            "[line 0] compile error: Unexpected token."
        );
    }

    #[test]
    fn collecting_reporter_accumulates_reports() {
        let mut reporter = CollectingReporter { reports: Vec::new() };
        reporter.report(Report::runtime("Undefined variable 'x'.", 3));
        assert_eq!(reporter.reports.len(), 1);
        assert_eq!(reporter.reports[0].line, 3);
    }
}
