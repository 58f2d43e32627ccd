use std::fmt::Write as _;

use owo_colors::OwoColorize;

use crate::exception::Exception;

/// Renders an uncaught exception against its source buffer.
///
/// The format is stable and consumed by tools and tests:
///
/// ```text
/// error: NameError: `zz` is not defined
///   --> main.naab:3:9
///    |
///  2 | let z = 1
///  3 | let y = zz + 1
///    |         ^
/// help: did you mean `z`?
/// ```
pub fn render_report(exc: &Exception, source: Option<&str>, color: bool) -> String {
    let mut out = String::new();

    let header = format!("{}: {}", exc.kind, exc.message);
    if color {
        let _ = writeln!(out, "{} {}", "error:".red().bold(), header.bold());
    } else {
        let _ = writeln!(out, "error: {header}");
    }

    let Some(loc) = &exc.location else {
        append_stack(&mut out, exc);
        append_help(&mut out, exc, color);
        return out;
    };
    if color {
        let _ = writeln!(
            out,
            "  {} {}",
            "-->".blue().bold(),
            format!("{}:{}:{}", loc.file, loc.line, loc.col)
        );
    } else {
        let _ = writeln!(out, "  --> {}:{}:{}", loc.file, loc.line, loc.col);
    }

    if let Some(source) = source {
        let lines: Vec<&str> = source.lines().collect();
        let line_no = loc.line as usize;
        let gutter_width = format!("{line_no}").len().max(2);
        let bar = format!("{:width$} |", "", width = gutter_width);
        let bar = if color {
            bar.blue().bold().to_string()
        } else {
            bar
        };
        let _ = writeln!(out, "{bar}");
        // two lines of context: the previous line and the error line
        for n in [line_no.saturating_sub(1), line_no] {
            if n == 0 || n > lines.len() {
                continue;
            }
            let gutter = format!("{n:gutter_width$} |");
            let gutter = if color {
                gutter.blue().bold().to_string()
            } else {
                gutter
            };
            let _ = writeln!(out, "{gutter} {}", lines[n - 1]);
        }
        let caret_pad = " ".repeat((loc.col as usize).saturating_sub(1));
        let caret = if color {
            "^".red().bold().to_string()
        } else {
            "^".to_owned()
        };
        let _ = writeln!(out, "{bar} {caret_pad}{caret}");
    }

    append_help(&mut out, exc, color);
    append_stack(&mut out, exc);
    out
}

fn append_help(out: &mut String, exc: &Exception, color: bool) {
    if let Some(help) = &exc.help {
        if color {
            let _ = writeln!(out, "{} {help}", "help:".cyan().bold());
        } else {
            let _ = writeln!(out, "help: {help}");
        }
    }
}

fn append_stack(out: &mut String, exc: &Exception) {
    if exc.stack.len() > 1 {
        for frame in &exc.stack {
            let _ = writeln!(out, "    {frame}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::CodeLoc;

    fn sample() -> Exception {
        let mut exc = Exception::new("NameError", "`zz` is not defined");
        exc.location = Some(CodeLoc {
            file: "main.naab".to_owned(),
            line: 2,
            col: 9,
        });
        exc.help = Some("did you mean `z`?".to_owned());
        exc
    }

    #[test]
    fn plain_report_format_is_stable() {
        let source = "let z = 1\nlet y = zz + 1\n";
        let report = render_report(&sample(), Some(source), false);
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "error: NameError: `zz` is not defined");
        assert_eq!(lines[1], "  --> main.naab:2:9");
        assert!(lines[2].ends_with('|'));
        assert!(lines[3].contains("let z = 1"));
        assert!(lines[4].contains("let y = zz + 1"));
        assert!(lines[5].contains('^'));
        assert_eq!(lines[6], "help: did you mean `z`?");
    }

    #[test]
    fn caret_is_under_the_column() {
        let source = "let z = 1\nlet y = zz + 1\n";
        let report = render_report(&sample(), Some(source), false);
        let caret_line = report.lines().nth(5).unwrap();
        let caret_col = caret_line.find('^').unwrap();
        let code_line = report.lines().nth(4).unwrap();
        let code_col = code_line.find("zz").unwrap();
        assert_eq!(caret_col, code_col);
    }

    #[test]
    fn missing_location_still_renders_header() {
        let exc = Exception::new("IOError", "disk unhappy");
        let report = render_report(&exc, None, false);
        assert!(report.starts_with("error: IOError: disk unhappy"));
    }
}
