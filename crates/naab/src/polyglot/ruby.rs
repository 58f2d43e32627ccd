use std::fmt::Write as _;
use std::io::Write as _;
use std::process::Command;
use std::time::Duration;

use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::callback::NoCallbacks;
use crate::polyglot::payload::{self, Payload};
use crate::polyglot::process::run_protocol;
use crate::polyglot::{
    check_process_failure, find_tool, missing_tool, quote, BlockOutcome, LangId, RESULT_SENTINEL,
};
use crate::secure::SecureBuf;

/// Renders a payload as a Ruby literal. Hashes use the `=>` form; `{"k":
/// v}` would create symbol keys.
pub fn literal(payload: &Payload, out: &mut String) {
    match payload {
        Payload::Null => out.push_str("nil"),
        Payload::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Payload::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Payload::Float(f) => {
            if f.is_nan() {
                out.push_str("Float::NAN");
            } else if f.is_infinite() {
                out.push_str(if *f > 0.0 {
                    "Float::INFINITY"
                } else {
                    "-Float::INFINITY"
                });
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
                out.push_str(" => ");
                literal(v, out);
            }
            out.push('}');
        }
        Payload::Callback { .. } => out.push_str("nil"),
        Payload::Foreign { repr, .. } => out.push_str(&quote(repr)),
        Payload::Shell {
            exit_code,
            stdout,
            stderr,
        } => {
            let _ = write!(
                out,
                "{{\"exit_code\" => {exit_code}, \"stdout\" => {}, \"stderr\" => {}}}",
                quote(stdout),
                quote(stderr)
            );
        }
    }
}

/// Builds the interpreter program: the user body runs inside `begin … end`
/// so its last expression becomes the block's value.
pub fn wrap(code: &str, bindings: &[(String, Payload)]) -> String {
    let mut program = String::from("require 'json'\n");
    for (name, value) in bindings {
        let _ = write!(program, "{name} = ");
        literal(value, &mut program);
        program.push('\n');
    }
    program.push_str("__naab_result = begin\n");
    program.push_str(code);
    program.push_str("\nend\n");
    program.push_str("begin\n  __naab_json = JSON.generate(__naab_result)\nrescue StandardError\n  __naab_json = JSON.generate({\"__naab_handle__\" => __naab_result.inspect})\nend\n");
    let _ = write!(
        program,
        "STDOUT.write(\"{RESULT_SENTINEL}\" + __naab_json + \"\\n\")\n"
    );
    program
}

pub fn execute(
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
) -> Result<BlockOutcome, SimpleError> {
    let tool = find_tool(&["ruby"]).ok_or_else(|| missing_tool(LangId::Ruby, &["ruby"]))?;
    let program = SecureBuf::from_string(wrap(code, bindings));

    let mut file = tempfile::Builder::new()
        .prefix("naab-rb-")
        .suffix(".rb")
        .tempfile()
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;
    file.write_all(program.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;

    let mut cmd = Command::new(tool);
    cmd.arg(file.path());
    let output = run_protocol(cmd, RESULT_SENTINEL, timeout, &mut NoCallbacks)?;
    check_process_failure(LangId::Ruby, &output)?;

    let value = match &output.result_json {
        Some(json_text) => match serde_json::from_str(json_text) {
            Ok(json) => payload::from_json(&json, "ruby"),
            Err(err) => {
                return Err(SimpleError::new(
                    ExcKind::PolyglotError,
                    format!("malformed ruby result: {err}"),
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
