//! Tiny builder for the legacy Markdown artifacts.

use std::fmt::Write;

#[derive(Debug, Default)]
pub(crate) struct MarkdownDoc {
    body: String,
}

impl MarkdownDoc {
    pub(crate) fn new(title: &str) -> Self {
        let mut doc = Self::default();
        let _ = writeln!(doc.body, "# {title}\n");
        doc
    }

    pub(crate) fn section(&mut self, heading: &str) -> &mut Self {
        let _ = writeln!(self.body, "## {heading}\n");
        self
    }

    pub(crate) fn line(&mut self, text: impl AsRef<str>) -> &mut Self {
        let _ = writeln!(self.body, "{}", text.as_ref());
        self
    }

    pub(crate) fn blank(&mut self) -> &mut Self {
        self.body.push('\n');
        self
    }

    /// A pipe table; `|` inside cells is escaped.
    pub(crate) fn table(&mut self, headers: &[&str], rows: &[Vec<String>]) -> &mut Self {
        let _ = writeln!(self.body, "| {} |", headers.join(" | "));
        let _ = writeln!(self.body, "|{}", "---|".repeat(headers.len()));
        for row in rows {
            let cells: Vec<String> = row.iter().map(|c| c.replace('|', "\\|")).collect();
            let _ = writeln!(self.body, "| {} |", cells.join(" | "));
        }
        self.body.push('\n');
        self
    }

    pub(crate) fn finish(self) -> String {
        self.body
    }
}
