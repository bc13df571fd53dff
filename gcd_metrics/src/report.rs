//! Diagnostic codes and the caller-owned run report.
//!
//! Code strings and their messages are part of the caller-facing
//! contract: report consumers match on them, so they never change once
//! published.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    E9007,
    E5201,
    E5102,
    W5101,
    W5201,
    W5202,
    W5204,
    W1103,
    W1304,
    W4001,
    W4002,
    W5001,
    W5002,
    W5003,
    W5004,
    W5005,
    W5006,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::E9007 => "E9007",
            Code::E5201 => "E5201",
            Code::E5102 => "E5102",
            Code::W5101 => "W5101",
            Code::W5201 => "W5201",
            Code::W5202 => "W5202",
            Code::W5204 => "W5204",
            Code::W1103 => "W1103",
            Code::W1304 => "W1304",
            Code::W4001 => "W4001",
            Code::W4002 => "W4002",
            Code::W5001 => "W5001",
            Code::W5002 => "W5002",
            Code::W5003 => "W5003",
            Code::W5004 => "W5004",
            Code::W5005 => "W5005",
            Code::W5006 => "W5006",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Code::E9007 => "missing cycle column",
            Code::E5201 => "window-clip-failed at representative cycle",
            Code::E5102 => "no current and no capacity columns",
            Code::W5101 => "capacity-column ΔQ fallback (reduced precision)",
            Code::W5201 => "effective metrics unavailable (too few points)",
            Code::W5202 => "window-clip-failed",
            Code::W5204 => "window-clip-failed at non-representative cycle",
            Code::W1103 => "R_turn unavailable (missing current)",
            Code::W1304 => "retention baseline invalid",
            Code::W4001 => "cycle marker before first data row ignored",
            Code::W4002 => "non-monotonic cycle marker clamped",
            Code::W5001 => "segment current sign unstable",
            Code::W5002 => "segment voltage not monotonic",
            Code::W5003 => "charge/discharge classification unstable",
            Code::W5004 => "current-sign mapping tie, default positive->charge",
            Code::W5005 => "main order unstable, decided from cycle 2",
            Code::W5006 => "first-cycle reverse segment dropped",
        }
    }

    pub fn severity(&self) -> Severity {
        if self.as_str().starts_with('E') {
            Severity::Error
        } else {
            Severity::Warning
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One report line: a code, its stable message, and ordered `key=value` context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub code: Code,
    pub context: Vec<(String, String)>,
}

impl Diagnostic {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            context: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.context.push((key.to_string(), value.to_string()));
        self
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &'static str {
        self.code.message()
    }

    pub fn is(&self, code: Code) -> bool {
        self.code == code
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.code.message())?;
        for (key, value) in &self.context {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Accumulates diagnostics across a run, in the order the caller feeds them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    entries: Vec<Diagnostic>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn extend<I>(&mut self, diagnostics: I)
    where
        I: IntoIterator<Item = Diagnostic>,
    {
        self.entries.extend(diagnostics);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity() == severity)
            .count()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(|d| d.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_code_message_and_context() {
        let line = Diagnostic::new(Code::W5204)
            .with("file_path", "GCD-1.txt")
            .with("cycle", 3)
            .to_string();
        assert_eq!(
            line,
            "W5204 window-clip-failed at non-representative cycle file_path=GCD-1.txt cycle=3"
        );
    }

    #[test]
    fn severity_follows_code_prefix() {
        assert_eq!(Code::E5201.severity(), Severity::Error);
        assert_eq!(Code::W1304.severity(), Severity::Warning);
    }

    #[test]
    fn run_report_counts_by_severity() {
        let mut report = RunReport::new();
        report.push(Diagnostic::new(Code::E5102));
        report.extend([Diagnostic::new(Code::W5101), Diagnostic::new(Code::W5201)]);
        assert_eq!(report.count(Severity::Error), 1);
        assert_eq!(report.count(Severity::Warning), 2);
        assert_eq!(report.lines()[0], "E5102 no current and no capacity columns");
    }
}
