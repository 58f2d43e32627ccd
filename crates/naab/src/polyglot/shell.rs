use std::fmt::Write as _;
use std::process::Command;
use std::time::Duration;

use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::payload::Payload;
use crate::polyglot::process::run_simple;
use crate::polyglot::{find_tool, missing_tool, BlockOutcome, LangId};

/// Characters that require a shell interpreter instead of a direct exec.
const METACHARS: &[char] = &[
    '|', '&', ';', '<', '>', '$', '`', '"', '\'', '\\', '*', '?', '~', '(', ')', '{', '}', '[',
    ']', '\n',
];

/// Single-quote escaping for POSIX shells.
fn sh_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn render(payload: &Payload, out: &mut String) {
    match payload {
        Payload::Null => out.push_str("''"),
        Payload::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Payload::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Payload::Float(f) => {
            let _ = write!(out, "{f}");
        }
        Payload::Str(s) => out.push_str(&sh_quote(s)),
        // structured bindings land as JSON text
        other => out.push_str(&sh_quote(
            &crate::polyglot::payload::to_json(other).to_string(),
        )),
    }
}

/// Executes a shell block.
///
/// With bindings or metacharacters present the command runs through `sh
/// -c`; a plain word sequence is exec'd directly. The block's value is
/// always the `{exit_code, stdout, stderr}` struct; a non-zero exit is
/// data, not an exception.
pub fn execute(
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
) -> Result<BlockOutcome, SimpleError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(SimpleError::new(ExcKind::PolyglotError, "empty shell block"));
    }
    let needs_shell = !bindings.is_empty() || code.contains(METACHARS);
    let cmd = if needs_shell {
        let shell =
            find_tool(&["sh", "bash"]).ok_or_else(|| missing_tool(LangId::Shell, &["sh", "bash"]))?;
        let mut script = String::new();
        for (name, value) in bindings {
            let _ = write!(script, "{name}=");
            render(value, &mut script);
            script.push('\n');
        }
        script.push_str(code);
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(script);
        cmd
    } else {
        let mut words = code.split_whitespace();
        let program = words.next().expect("non-empty shell block");
        let mut cmd = Command::new(program);
        cmd.args(words);
        cmd
    };

    let output = run_simple(cmd, None, timeout)?;
    if output.timed_out {
        return Err(SimpleError::new(
            ExcKind::TimeoutError,
            "shell block exceeded its time budget",
        ));
    }
    Ok(BlockOutcome {
        value: Payload::Shell {
            exit_code: i64::from(output.status.unwrap_or(-1)),
            stdout: output.stdout,
            stderr: output.stderr,
        },
        passthrough: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_available() -> bool {
        find_tool(&["sh"]).is_some()
    }

    #[test]
    fn captures_exit_code_and_streams() {
        if !sh_available() {
            return;
        }
        let outcome = execute("echo hi", &[], Duration::from_secs(10)).unwrap();
        let Payload::Shell {
            exit_code, stdout, ..
        } = outcome.value
        else {
            panic!("expected shell payload");
        };
        assert_eq!(exit_code, 0);
        assert_eq!(stdout, "hi\n");
    }

    #[test]
    fn metacharacters_run_through_a_shell() {
        if !sh_available() {
            return;
        }
        let outcome = execute("echo a && echo b", &[], Duration::from_secs(10)).unwrap();
        let Payload::Shell { stdout, .. } = outcome.value else {
            panic!("expected shell payload");
        };
        assert_eq!(stdout, "a\nb\n");
    }

    #[test]
    fn bindings_are_injected_as_variables() {
        if !sh_available() {
            return;
        }
        let bindings = vec![("msg".to_owned(), Payload::Str("it's here".to_owned()))];
        let outcome = execute("echo \"$msg\"", &bindings, Duration::from_secs(10)).unwrap();
        let Payload::Shell { stdout, .. } = outcome.value else {
            panic!("expected shell payload");
        };
        assert_eq!(stdout, "it's here\n");
    }

    #[test]
    fn nonzero_exit_is_data_not_error() {
        if !sh_available() {
            return;
        }
        let outcome = execute("exit 4", &[], Duration::from_secs(10)).unwrap();
        let Payload::Shell { exit_code, .. } = outcome.value else {
            panic!("expected shell payload");
        };
        assert_eq!(exit_code, 4);
    }
}
