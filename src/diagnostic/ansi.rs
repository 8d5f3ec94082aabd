use super::{Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "error[PSN-P001]: message"
        let severity_label = match d.severity {
            Severity::Error => self.bold_red("error"),
            Severity::Warning => self.bold(&self.cyan("warning")),
        };
        match d.code {
            Some(code) => out.push_str(&format!(
                "{}{}: {}\n",
                severity_label,
                self.dim(&format!("[{code}]")),
                self.bold(&d.message)
            )),
            None => out.push_str(&format!("{}: {}\n", severity_label, self.bold(&d.message))),
        }

        // Offending line with a caret, when we know where and have the input
        if let (Some(pos), Some(source)) = (d.pos, &d.source) {
            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), pos.line, pos.col));

            let line_text = source.lines().nth(pos.line).unwrap_or("");
            let gutter = pos.line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            out.push_str(&format!("{pad} {pipe}\n"));
            let line_num = self.cyan(&format!("{:>gutter$}", pos.line));
            out.push_str(&format!("{line_num} {pipe} {line_text}\n"));
            let indent = " ".repeat(pos.col);
            out.push_str(&format!("{pad} {pipe} {indent}{}\n", self.bold_red("^")));
            out.push_str(&format!("{pad} {pipe}\n"));
        } else if let Some(pos) = d.pos {
            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), pos.line, pos.col));
        }

        if !d.expected.is_empty() {
            out.push_str(&format!(
                "  {} expected: {}\n",
                self.dim("="),
                d.expected.join(" or ")
            ));
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Pos;

    fn make_diag(source: &str) -> Diagnostic {
        let mut d = Diagnostic::error("unexpected \"z\"")
            .with_code("PSN-P001")
            .with_pos(Pos { offset: 4, line: 0, col: 4 })
            .with_source(source.to_string())
            .with_note("while reading a number");
        d.expected = vec!["digit".to_string(), "\"-\"".to_string()];
        d
    }

    #[test]
    fn render_contains_error_label_and_code() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("12a4z"));
        assert!(out.contains("error[PSN-P001]:"), "missing header in:\n{out}");
        assert!(out.contains("unexpected \"z\""), "missing message in:\n{out}");
    }

    #[test]
    fn render_contains_location_and_source_line() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("12a4z"));
        assert!(out.contains("--> 0:4"), "missing location in:\n{out}");
        assert!(out.contains("12a4z"), "missing source line in:\n{out}");
        assert!(out.contains('^'), "missing caret in:\n{out}");
    }

    #[test]
    fn caret_indents_to_column() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("12a4z"));
        let caret_line = out.lines().find(|l| l.contains('^')).expect("caret line");
        assert_eq!(caret_line.find('^'), Some("  | ".len() + 4));
    }

    #[test]
    fn render_lists_expected_and_notes() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("12a4z"));
        assert!(out.contains("expected: digit or \"-\""), "missing expected in:\n{out}");
        assert!(out.contains("note: while reading a number"), "missing note in:\n{out}");
    }

    #[test]
    fn render_multiline_source_picks_failing_line() {
        let r = AnsiRenderer { use_color: false };
        let mut d = make_diag("ok line\nbad line");
        d.pos = Some(Pos { offset: 8, line: 1, col: 0 });
        let out = r.render(&d);
        assert!(out.contains("bad line"), "expected second line in:\n{out}");
        assert!(out.contains("--> 1:0"), "expected line 1 in:\n{out}");
    }

    #[test]
    fn render_no_source_still_works() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("something bad");
        let out = r.render(&d);
        assert!(out.contains("error: something bad"));
        assert!(!out.contains("-->"));
    }

    #[test]
    fn color_toggle_controls_ansi_codes() {
        let with = AnsiRenderer { use_color: true }.render(&make_diag("12a4z"));
        assert!(with.contains("\x1b["), "expected ANSI codes when use_color=true");
        let without = AnsiRenderer { use_color: false }.render(&make_diag("12a4z"));
        assert!(!without.contains("\x1b["), "unexpected ANSI codes when use_color=false");
    }
}
