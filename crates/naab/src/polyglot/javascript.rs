use std::fmt::Write as _;
use std::io::Write as _;
use std::process::Command;
use std::time::Duration;

use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::callback::CallbackHost;
use crate::polyglot::payload::{self, Payload};
use crate::polyglot::process::run_protocol;
use crate::polyglot::{
    check_process_failure, find_tool, missing_tool, quote, BlockOutcome, LangId, RESULT_SENTINEL,
};
use crate::secure::SecureBuf;

const PRELUDE: &str = r#"const __naab_fs = require('fs');
function __naab_callback(__naab_id) {
    return (...__naab_args) => {
        process.stdout.write("__NAAB_CALL__" + JSON.stringify({ id: __naab_id, args: __naab_args }) + "\n");
        let __naab_text = "";
        const __naab_buf = Buffer.alloc(65536);
        for (;;) {
            let __naab_n;
            try {
                __naab_n = __naab_fs.readSync(0, __naab_buf, 0, __naab_buf.length);
            } catch (err) {
                if (err.code === 'EAGAIN') { continue; }
                throw err;
            }
            if (__naab_n <= 0) { break; }
            __naab_text += __naab_buf.toString('utf8', 0, __naab_n);
            if (__naab_text.includes("\n")) { break; }
        }
        const __naab_resp = JSON.parse(__naab_text);
        if (__naab_resp.error !== undefined) { throw new Error(__naab_resp.error); }
        return __naab_resp.value;
    };
}
"#;

/// Renders a payload as a JavaScript literal; JSON syntax is valid JS for
/// everything but callbacks.
pub fn literal(payload: &Payload, out: &mut String) {
    match payload {
        Payload::Callback { id, .. } => {
            let _ = write!(out, "__naab_callback({id})");
        }
        Payload::Foreign { repr, .. } => out.push_str(&quote(repr)),
        other => out.push_str(&payload::to_json(other).to_string()),
    }
}

/// Builds the node program: bindings as `const` declarations, the user
/// body executed through `eval` inside an IIFE so the final statement's
/// completion value becomes the block's value. Embedding the body as a
/// JSON string keeps backticks and `${…}` in user code inert.
pub fn wrap(code: &str, bindings: &[(String, Payload)]) -> String {
    let mut program = String::from(PRELUDE);
    for (name, value) in bindings {
        let _ = write!(program, "const {name} = ");
        literal(value, &mut program);
        program.push_str(";\n");
    }
    let _ = writeln!(program, "const __naab_code = {};", quote(code));
    program.push_str("const __naab_result = (() => { return eval(__naab_code); })();\n");
    let _ = write!(
        program,
        "process.stdout.write(\"{RESULT_SENTINEL}\" + (JSON.stringify(__naab_result === undefined ? null : __naab_result, (__k, __v) => (typeof __v === 'function' || typeof __v === 'bigint') ? {{ __naab_handle__: String(__v) }} : __v) ?? \"null\") + \"\\n\");\n"
    );
    program
}

pub fn execute(
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
    host: &mut dyn CallbackHost,
) -> Result<BlockOutcome, SimpleError> {
    let tool = find_tool(&["node", "nodejs"])
        .ok_or_else(|| missing_tool(LangId::JavaScript, &["node", "nodejs"]))?;
    let program = SecureBuf::from_string(wrap(code, bindings));

    let mut file = tempfile::Builder::new()
        .prefix("naab-js-")
        .suffix(".js")
        .tempfile()
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;
    file.write_all(program.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;

    let mut cmd = Command::new(tool);
    cmd.arg(file.path());
    let output = run_protocol(cmd, RESULT_SENTINEL, timeout, host)?;
    check_process_failure(LangId::JavaScript, &output)?;

    let value = match &output.result_json {
        Some(json_text) => match serde_json::from_str(json_text) {
            Ok(json) => payload::from_json(&json, "javascript"),
            Err(err) => {
                return Err(SimpleError::new(
                    ExcKind::PolyglotError,
                    format!("malformed javascript result: {err}"),
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
    fn body_is_embedded_as_string() {
        let program = wrap("`template ${x}`", &[]);
        assert!(program.contains(r#"const __naab_code = "`template ${x}`";"#));
        assert!(program.contains("eval(__naab_code)"));
    }

    #[test]
    fn bindings_are_consts() {
        let bindings = vec![
            ("n".to_owned(), Payload::Int(7)),
            (
                "m".to_owned(),
                Payload::Dict(vec![("k".to_owned(), Payload::Str("v".to_owned()))]),
            ),
        ];
        let program = wrap("n", &bindings);
        assert!(program.contains("const n = 7;"));
        assert!(program.contains(r#"const m = {"k":"v"};"#));
    }
}
