use std::fmt::{self, Write};

use super::{Diagnostic, Severity};
use crate::ast::SourceMap;

#[derive(Clone, Copy)]
enum Style {
    Error,
    Warning,
    Accent,
    Strong,
    Muted,
}

impl Style {
    fn sgr(self) -> &'static str {
        match self {
            Style::Error => "1;31",
            Style::Warning => "1;33",
            Style::Accent => "36",
            Style::Strong => "1",
            Style::Muted => "2",
        }
    }

    fn for_severity(severity: Severity) -> Style {
        match severity {
            Severity::Error => Style::Error,
            Severity::Warning => Style::Warning,
        }
    }
}

/// Human-readable renderer for terminals.
///
/// Layout: a `severity[code]: message` header, the offending source line
/// with carets (prefixed by `origin:line:col`), then notes, help and the
/// runtime backtrace.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, style: Style, text: &str) -> String {
        if self.use_color {
            format!("\x1b[{}m{}\x1b[0m", style.sgr(), text)
        } else {
            text.to_string()
        }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();
        // A String sink never fails.
        let _ = self.write_to(&mut out, d);
        out
    }

    pub fn write_to(&self, out: &mut impl Write, d: &Diagnostic) -> fmt::Result {
        self.header(out, d)?;
        self.excerpt(out, d)?;
        self.footer(out, d)
    }

    fn header(&self, out: &mut impl Write, d: &Diagnostic) -> fmt::Result {
        let style = Style::for_severity(d.severity);
        write!(out, "{}", self.paint(style, d.severity.as_str()))?;
        if let Some(code) = d.code {
            write!(out, "[{}]", self.paint(style, code))?;
        }
        writeln!(out, ": {}", self.paint(Style::Strong, &d.message))
    }

    fn excerpt(&self, out: &mut impl Write, d: &Diagnostic) -> fmt::Result {
        let (Some(label), Some(source)) = (&d.label, &d.source) else {
            return Ok(());
        };
        let map = SourceMap::new(source);
        let (line, col) = map.lookup(label.span.start);
        let text = map.line_text(source, line);
        let location = match &d.origin {
            Some(origin) => format!("{}:{}:{}", origin, line, col),
            None => format!("{}:{}", line, col),
        };

        let width = line.to_string().len();
        let bar = self.paint(Style::Accent, "|");
        writeln!(out, "{:width$}{} {}", "", self.paint(Style::Accent, "-->"), location)?;
        writeln!(out, "{:width$} {}", "", bar)?;
        writeln!(out, "{} {} {}", self.paint(Style::Accent, &format!("{:>width$}", line)), bar, text)?;

        // Columns are byte offsets; carets line up by character.
        let start = (col - 1).min(text.len());
        let indent: String = text
            .get(..start)
            .unwrap_or("")
            .chars()
            .map(|c| if c == '\t' { '\t' } else { ' ' })
            .collect();
        let span_bytes = label.span.end.saturating_sub(label.span.start).min(text.len() - start);
        let span_chars = text.get(start..start + span_bytes).map_or(1, |s| s.chars().count()).max(1);
        let carets = self.paint(Style::for_severity(d.severity), &"^".repeat(span_chars));

        write!(out, "{:width$} {} {}{}", "", bar, indent, carets)?;
        if !label.message.is_empty() {
            write!(out, " {}", label.message)?;
        }
        writeln!(out)
    }

    fn footer(&self, out: &mut impl Write, d: &Diagnostic) -> fmt::Result {
        let eq = self.paint(Style::Muted, "=");
        for note in &d.notes {
            writeln!(out, "  {} note: {}", eq, note)?;
        }
        if let Some(help) = &d.suggestion {
            writeln!(out, "  {} help: {}", eq, help)?;
        }
        for frame in &d.backtrace {
            let function = frame.function.as_deref().unwrap_or("<entry>");
            writeln!(out, "  {} {:04} {} in {}", self.paint(Style::Muted, "at"), frame.address, frame.op, function)?;
        }
        Ok(())
    }
}
