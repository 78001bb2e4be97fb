use serde::Serialize;

use super::{Diagnostic, Severity};
use crate::ast::SourceMap;
use crate::vm::TraceFrame;

/// Wire shape of one diagnostic. Empty parts are omitted.
#[derive(Serialize)]
struct Report<'a> {
    severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span: Option<SpanReport<'a>>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
    #[serde(skip_serializing_if = "<[TraceFrame]>::is_empty")]
    backtrace: &'a [TraceFrame],
}

#[derive(Serialize)]
struct SpanReport<'a> {
    start: usize,
    end: usize,
    /// 1-based; only known when the source text is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    col: Option<usize>,
    label: &'a str,
}

/// Render as a single-line JSON object.
pub fn render(d: &Diagnostic) -> String {
    let span = d.label.as_ref().map(|label| {
        let position = d.source.as_deref().map(|source| SourceMap::new(source).lookup(label.span.start));
        SpanReport {
            start: label.span.start,
            end: label.span.end,
            line: position.map(|(line, _)| line),
            col: position.map(|(_, col)| col),
            label: &label.message,
        }
    });
    let report = Report {
        severity: d.severity,
        code: d.code,
        message: &d.message,
        origin: d.origin.as_deref(),
        span,
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
        backtrace: &d.backtrace,
    };
    serde_json::to_string(&report)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"diagnostic could not be encoded"}"#.to_string())
}
