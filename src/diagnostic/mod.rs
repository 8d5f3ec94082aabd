pub mod ansi;
pub mod json;

use crate::codegen::CompileError;
use crate::vm::{ParseFailure, Pos};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A renderable report built from any of the crate's error types. Codes
/// are stable: `PSN-B…` for build-time failures, `PSN-P…` for parse
/// failures.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub pos: Option<Pos>,
    pub expected: Vec<String>,
    pub notes: Vec<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            pos: None,
            expected: Vec::new(),
            notes: Vec::new(),
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Self::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_pos(mut self, pos: Pos) -> Self {
        self.pos = Some(pos);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Attach the parsed input so renderers can show the offending line.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the crate's error types ----

impl From<&ParseFailure> for Diagnostic {
    fn from(e: &ParseFailure) -> Self {
        let message = match &e.unexpected {
            Some(u) => format!("unexpected {u}"),
            None if !e.messages.is_empty() => e.messages.join("; "),
            None => "parse failed".to_string(),
        };
        let mut d = Diagnostic::error(message).with_code("PSN-P001").with_pos(e.pos);
        d.expected = e.expected.iter().cloned().collect();
        if e.unexpected.is_some() {
            for m in &e.messages {
                d = d.with_note(m.clone());
            }
        }
        d
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        let code = match e {
            CompileError::NonConsumingLoop { .. } => "PSN-B001",
            CompileError::UnboundParser => "PSN-B002",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}

impl From<&crate::Error> for Diagnostic {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::Build(b) => Diagnostic::from(b),
            crate::Error::Parse(p) => Diagnostic::from(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_failure() -> ParseFailure {
        ParseFailure {
            pos: Pos { offset: 5, line: 0, col: 5 },
            expected: BTreeSet::from(["\"a\"".to_string(), "digit".to_string()]),
            unexpected: Some("\"z\"".to_string()),
            messages: Vec::new(),
        }
    }

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.pos.is_none());
        assert!(d.expected.is_empty());
    }

    #[test]
    fn from_parse_failure() {
        let d = Diagnostic::from(&sample_failure());
        assert_eq!(d.code, Some("PSN-P001"));
        assert_eq!(d.message, "unexpected \"z\"");
        assert_eq!(d.pos.map(|p| p.col), Some(5));
        assert_eq!(d.expected, vec!["\"a\"", "digit"]);
    }

    #[test]
    fn from_parse_failure_with_message_only() {
        let e = ParseFailure {
            pos: Pos { offset: 0, line: 0, col: 0 },
            expected: BTreeSet::new(),
            unexpected: None,
            messages: vec!["number too large".to_string()],
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.message, "number too large");
    }

    #[test]
    fn from_compile_error() {
        let e = CompileError::NonConsumingLoop { combinator: "many" };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("PSN-B001"));
        assert!(d.message.contains("many"));
    }

    #[test]
    fn from_unbound_parser() {
        let d = Diagnostic::from(&CompileError::UnboundParser);
        assert_eq!(d.code, Some("PSN-B002"));
    }

    #[test]
    fn from_combined_error_dispatches() {
        let e = crate::Error::Parse(sample_failure());
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("PSN-P001"));
        let e = crate::Error::Build(CompileError::UnboundParser);
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("PSN-B002"));
    }
}
