//! Errors and warnings as presented to the user, independent of the
//! renderer. Every pipeline error converts into a [`Diagnostic`].

pub mod ansi;
pub mod json;

use serde::Serialize;

use crate::ast::Span;
use crate::vm::TraceFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// Source range the diagnostic points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable `QL-*` code
    pub code: Option<&'static str>,
    pub message: String,
    pub label: Option<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
    /// File the source came from; unset for inline programs
    pub origin: Option<String>,
    /// Call stack at a runtime fault, innermost first
    pub backtrace: Vec<TraceFrame>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            label: None,
            notes: Vec::new(),
            suggestion: None,
            source: None,
            origin: None,
            backtrace: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.label = Some(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_backtrace(mut self, backtrace: Vec<TraceFrame>) -> Self {
        self.backtrace = backtrace;
        self
    }
}

// ---- From impls for the pipeline's error types ----

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        let span = Span {
            start: e.position,
            end: e.position + e.snippet.len().max(1),
        };
        let mut d = Diagnostic::error(format!("unexpected token '{}'", e.snippet))
            .with_code("QL-L001")
            .with_span(span, "here");
        if !e.suggestion.is_empty() {
            d = d.with_suggestion(e.suggestion.clone());
        }
        d
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

impl From<&crate::vm::CompileError> for Diagnostic {
    fn from(e: &crate::vm::CompileError) -> Self {
        use crate::vm::CompileError;
        let d = Diagnostic::error(e.to_string()).with_code(e.code());
        match e {
            CompileError::BreakOutsideLoop | CompileError::ContinueOutsideLoop => {
                d.with_note("loop control is only valid inside a 'for' body")
            }
            CompileError::NestedFunction { .. } => d.with_suggestion("move the function to the top level"),
            _ => d,
        }
    }
}

impl From<&crate::vm::VmError> for Diagnostic {
    fn from(e: &crate::vm::VmError) -> Self {
        use crate::vm::VmError;
        let d = Diagnostic::error(e.to_string()).with_code(e.code());
        match e {
            VmError::UndefinedGlobal { name } if name == "main" => {
                d.with_suggestion("define an entry point: function main() { ... }")
            }
            VmError::CallDepthExceeded { .. } => d.with_note("raise the limit with --max-call-depth"),
            _ => d,
        }
    }
}

impl From<&crate::Error> for Diagnostic {
    fn from(e: &crate::Error) -> Self {
        match e {
            crate::Error::Lex(e) => e.into(),
            crate::Error::Parse(e) => e.into(),
            crate::Error::Compile(e) => e.into(),
            crate::Error::Runtime(e) => e.into(),
            crate::Error::Ast(e) => Diagnostic::error(format!("invalid syntax tree: {}", e)).with_code("QL-A001"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.label.is_none());
        assert!(d.backtrace.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_warning_builder() {
        let d = Diagnostic::warning("no main").with_code("QL-W001");
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.code, Some("QL-W001"));
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("bad token")
            .with_span(Span { start: 5, end: 8 }, "here");
        assert_eq!(d.label, Some(Label { span: Span { start: 5, end: 8 }, message: "here".to_string() }));
    }

    #[test]
    fn from_lex_error() {
        let e = crate::lexer::LexError {
            position: 3,
            snippet: "&".to_string(),
            suggestion: "Use the keywords 'and' / 'or' for logical operators".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("QL-L001"));
        assert!(d.message.contains('&'));
        assert_eq!(d.label.map(|l| l.span), Some(Span { start: 3, end: 4 }));
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_parse_error() {
        let e = crate::parser::ParseError {
            code: "QL-P002",
            position: 2,
            span: Span { start: 10, end: 15 },
            message: "expected Semi, got RBrace".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("QL-P002"));
        assert!(d.message.contains("expected Semi"));
        assert_eq!(d.label.map(|l| l.span), Some(Span { start: 10, end: 15 }));
    }

    #[test]
    fn from_compile_error() {
        let d = Diagnostic::from(&crate::vm::CompileError::BreakOutsideLoop);
        assert_eq!(d.message, "'break' outside of a loop");
        assert_eq!(d.code, Some("QL-C001"));
        assert_eq!(d.notes.len(), 1);
    }

    #[test]
    fn from_vm_error() {
        let e = crate::vm::VmError::UndefinedGlobal { name: "main".to_string() };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("main"));
        assert!(d.label.is_none());
        assert!(d.suggestion.unwrap().contains("function main()"));
    }

    #[test]
    fn backtrace_and_origin_builders() {
        let frame = TraceFrame { function: Some("main".to_string()), address: 6, op: "Divide" };
        let d = Diagnostic::from(&crate::vm::VmError::DivisionByZero)
            .with_origin("prog.ql")
            .with_backtrace(vec![frame.clone()]);
        assert_eq!(d.code, Some("QL-R002"));
        assert_eq!(d.origin.as_deref(), Some("prog.ql"));
        assert_eq!(d.backtrace, vec![frame]);
    }

    #[test]
    fn severity_names() {
        assert_eq!(Severity::Error.as_str(), "error");
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"warning\"");
    }
}
