use std::fmt::Write as _;
use std::io::Write as _;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::callback::CallbackHost;
use crate::polyglot::payload::{self, Payload};
use crate::polyglot::process::run_protocol;
use crate::polyglot::{
    check_process_failure, find_tool, indent, missing_tool, quote, BlockOutcome, LangId,
    RESULT_SENTINEL,
};
use crate::secure::SecureBuf;

const PRELUDE: &str = r#"import json as __naab_json
import sys as __naab_sys

def __naab_callback(__naab_id):
    def __naab_call(*args):
        print("__NAAB_CALL__" + __naab_json.dumps({"id": __naab_id, "args": list(args)}), flush=True)
        __naab_resp = __naab_json.loads(__naab_sys.stdin.readline())
        if "error" in __naab_resp:
            raise RuntimeError(__naab_resp["error"])
        return __naab_resp["value"]
    return __naab_call

__naab_result = None
"#;

fn return_stmt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*return\b").expect("static regex"))
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\s*(=[^=]|[+\-*/%]=)").expect("static regex")
    })
}

const STMT_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "with", "try", "except", "finally",
    "import", "from", "return", "pass", "break", "continue", "raise", "global", "nonlocal",
    "assert", "del",
];

/// Whether a final line can be captured as an expression.
fn is_expression_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    let first_word = trimmed
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or("");
    if STMT_KEYWORDS.contains(&first_word) {
        return false;
    }
    !assignment_re().is_match(trimmed)
}

/// Renders a payload as a Python literal. Callback bindings become stub
/// closures speaking the line protocol.
pub fn literal(payload: &Payload, out: &mut String) {
    match payload {
        Payload::Null => out.push_str("None"),
        Payload::Bool(true) => out.push_str("True"),
        Payload::Bool(false) => out.push_str("False"),
        Payload::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Payload::Float(f) => {
            if f.is_nan() {
                out.push_str("float('nan')");
            } else if f.is_infinite() {
                out.push_str(if *f > 0.0 { "float('inf')" } else { "float('-inf')" });
            } else {
                let _ = write!(out, "{f:?}");
            }
        }
        Payload::Str(s) => out.push_str(&quote(s)),
        Payload::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                literal(item, out);
            }
            out.push(']');
        }
        Payload::Dict(entries) => {
            out.push('{');
            for (i, (k, v)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&quote(k));
                out.push_str(": ");
                literal(v, out);
            }
            out.push('}');
        }
        Payload::Callback { id, .. } => {
            let _ = write!(out, "__naab_callback({id})");
        }
        Payload::Foreign { repr, .. } => out.push_str(&quote(repr)),
        Payload::Shell {
            exit_code,
            stdout,
            stderr,
        } => {
            let _ = write!(
                out,
                "{{\"exit_code\": {exit_code}, \"stdout\": {}, \"stderr\": {}}}",
                quote(stdout),
                quote(stderr)
            );
        }
    }
}

/// Builds the complete program handed to the interpreter.
///
/// Multi-line code containing a `return` statement is wrapped in a
/// function so the return value becomes the block's value; otherwise the
/// final non-empty line is captured when it is an expression.
pub fn wrap(code: &str, bindings: &[(String, Payload)]) -> String {
    let mut program = String::from(PRELUDE);
    for (name, value) in bindings {
        let _ = write!(program, "{name} = ");
        literal(value, &mut program);
        program.push('\n');
    }
    if return_stmt_re().is_match(code) {
        program.push_str("def __naab_wrapper():\n");
        program.push_str(&indent(code));
        program.push_str("    return None\n");
        program.push_str("__naab_result = __naab_wrapper()\n");
    } else {
        let lines: Vec<&str> = code.lines().collect();
        let last_idx = lines.iter().rposition(|l| !l.trim().is_empty());
        match last_idx {
            Some(idx) if is_expression_line(lines[idx]) => {
                for line in &lines[..idx] {
                    program.push_str(line);
                    program.push('\n');
                }
                let _ = writeln!(program, "__naab_result = {}", lines[idx].trim());
                for line in &lines[idx + 1..] {
                    program.push_str(line);
                    program.push('\n');
                }
            }
            _ => {
                program.push_str(code);
                program.push('\n');
            }
        }
    }
    let _ = write!(
        program,
        "print(\"{RESULT_SENTINEL}\" + __naab_json.dumps(__naab_result, default=lambda __o: {{\"__naab_handle__\": repr(__o)}}), flush=True)\n"
    );
    program
}

pub fn execute(
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
    host: &mut dyn CallbackHost,
) -> Result<BlockOutcome, SimpleError> {
    let tool = find_tool(&["python3", "python"])
        .ok_or_else(|| missing_tool(LangId::Python, &["python3", "python"]))?;
    let program = SecureBuf::from_string(wrap(code, bindings));

    let mut file = tempfile::Builder::new()
        .prefix("naab-py-")
        .suffix(".py")
        .tempfile()
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;
    file.write_all(program.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;

    let mut cmd = Command::new(tool);
    cmd.arg(file.path());
    let output = run_protocol(cmd, RESULT_SENTINEL, timeout, host)?;
    check_process_failure(LangId::Python, &output)?;

    let value = match &output.result_json {
        Some(json_text) => match serde_json::from_str(json_text) {
            Ok(json) => payload::from_json(&json, "python"),
            Err(err) => {
                return Err(SimpleError::new(
                    ExcKind::PolyglotError,
                    format!("malformed python result: {err}"),
                ));
            }
        },
        None => Payload::Null,
    };
    Ok(BlockOutcome {
        value,
        passthrough: output.stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_return_code_in_function() {
        let program = wrap("if x > 1:\n    return 2\nreturn 3", &[]);
        assert!(program.contains("def __naab_wrapper():"));
        assert!(program.contains("__naab_result = __naab_wrapper()"));
        assert!(program.contains("    if x > 1:"));
    }

    #[test]
    fn captures_final_expression() {
        let program = wrap("a = 1\na + 2", &[]);
        assert!(program.contains("__naab_result = a + 2"));
    }

    #[test]
    fn leaves_final_statement_alone() {
        let program = wrap("a = 1\nb = a + 2", &[]);
        assert!(!program.contains("__naab_result = b"));
        assert!(program.contains("b = a + 2"));
    }

    #[test]
    fn bindings_render_as_python_literals() {
        let bindings = vec![
            ("n".to_owned(), Payload::Int(3)),
            ("s".to_owned(), Payload::Str("a\"b".to_owned())),
            ("flag".to_owned(), Payload::Bool(true)),
            (
                "xs".to_owned(),
                Payload::List(vec![Payload::Null, Payload::Float(1.5)]),
            ),
        ];
        let program = wrap("n", &bindings);
        assert!(program.contains("n = 3"));
        assert!(program.contains("s = \"a\\\"b\""));
        assert!(program.contains("flag = True"));
        assert!(program.contains("xs = [None, 1.5]"));
    }

    #[test]
    fn callback_binding_renders_stub() {
        let bindings = vec![(
            "f".to_owned(),
            Payload::Callback {
                id: 2,
                name: "f".to_owned(),
            },
        )];
        let program = wrap("f(1)", &bindings);
        assert!(program.contains("f = __naab_callback(2)"));
    }
}
