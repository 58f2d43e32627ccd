use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::CodeCache;
use crate::exception::{ExcKind, SimpleError};
use crate::polyglot::payload::Payload;
use crate::polyglot::process::run_simple;
use crate::polyglot::{find_tool, missing_tool, BlockOutcome, LangId};
use crate::secure::SecureBuf;

/// Escaping dialect for string literals in the compiled languages.
#[derive(Clone, Copy)]
enum EscapeStyle {
    /// Octal escapes for non-printables; safe in C and C++.
    Octal,
    /// `\u{XX}` escapes (Rust).
    RustUnicode,
    /// `\uXXXX` escapes (Go, C#).
    Unicode4,
}

fn escape_str(text: &str, style: EscapeStyle, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => match style {
                EscapeStyle::Octal => {
                    let _ = write!(out, "\\{:03o}", c as u32);
                }
                EscapeStyle::RustUnicode => {
                    let _ = write!(out, "\\u{{{:x}}}", c as u32);
                }
                EscapeStyle::Unicode4 => {
                    let _ = write!(out, "\\u{:04x}", c as u32);
                }
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

fn json_text(payload: &Payload) -> String {
    crate::polyglot::payload::to_json(payload).to_string()
}

/// Splits out directive lines that must live above the generated `main`
/// scaffold (`#include`, `use`, `import`, `using`).
fn hoist_directives(code: &str, lang: LangId) -> (String, String) {
    let mut directives = String::new();
    let mut body = String::new();
    let mut in_go_import_block = false;
    for line in code.lines() {
        let trimmed = line.trim();
        let is_directive = match lang {
            LangId::Cpp => trimmed.starts_with("#include") || trimmed.starts_with("using "),
            LangId::Rust => trimmed.starts_with("use ") && trimmed.ends_with(';'),
            LangId::Go => {
                if in_go_import_block {
                    if trimmed == ")" {
                        in_go_import_block = false;
                    }
                    true
                } else if trimmed == "import (" {
                    in_go_import_block = true;
                    true
                } else {
                    trimmed.starts_with("import ")
                }
            }
            LangId::CSharp => trimmed.starts_with("using ") && trimmed.ends_with(';'),
            _ => false,
        };
        if is_directive {
            directives.push_str(trimmed);
            directives.push('\n');
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    (directives, body)
}

/// Appends `;` to statement-like C++ lines, so expression-oriented user
/// snippets compile without ceremony.
fn insert_semicolons(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 32);
    for line in body.lines() {
        let trimmed = line.trim_end();
        let t = trimmed.trim_start();
        out.push_str(trimmed);
        let keep = t.is_empty()
            || t.starts_with('#')
            || t.starts_with("//")
            || t.ends_with(';')
            || t.ends_with('{')
            || t.ends_with('}')
            || t.ends_with(':')
            || t.ends_with(',')
            || t.ends_with('\\');
        if !keep {
            out.push(';');
        }
        out.push('\n');
    }
    out
}

fn binding_decl(lang: LangId, name: &str, value: &Payload, out: &mut String) {
    match lang {
        LangId::Cpp => match value {
            Payload::Int(i) => {
                let _ = writeln!(out, "    const int64_t {name} = {i};");
            }
            Payload::Float(f) => {
                let _ = writeln!(out, "    const double {name} = {f:?};");
            }
            Payload::Bool(b) => {
                let _ = writeln!(out, "    const bool {name} = {b};");
            }
            Payload::Str(s) => {
                let _ = write!(out, "    const std::string {name} = ");
                escape_str(s, EscapeStyle::Octal, out);
                out.push_str(";\n");
            }
            other => {
                let _ = write!(out, "    const std::string {name} = ");
                escape_str(&json_text(other), EscapeStyle::Octal, out);
                out.push_str(";\n");
            }
        },
        LangId::Rust => match value {
            Payload::Int(i) => {
                let _ = writeln!(out, "    let {name}: i64 = {i};");
            }
            Payload::Float(f) => {
                let _ = writeln!(out, "    let {name}: f64 = {f:?};");
            }
            Payload::Bool(b) => {
                let _ = writeln!(out, "    let {name} = {b};");
            }
            Payload::Str(s) => {
                let _ = write!(out, "    let {name} = ");
                escape_str(s, EscapeStyle::RustUnicode, out);
                out.push_str(";\n");
            }
            other => {
                let _ = write!(out, "    let {name} = ");
                escape_str(&json_text(other), EscapeStyle::RustUnicode, out);
                out.push_str(";\n");
            }
        },
        LangId::Go => {
            match value {
                Payload::Int(i) => {
                    let _ = writeln!(out, "    {name} := int64({i})");
                }
                Payload::Float(f) => {
                    let _ = writeln!(out, "    {name} := float64({f:?})");
                }
                Payload::Bool(b) => {
                    let _ = writeln!(out, "    {name} := {b}");
                }
                Payload::Str(s) => {
                    let _ = write!(out, "    {name} := ");
                    escape_str(s, EscapeStyle::Unicode4, out);
                    out.push('\n');
                }
                other => {
                    let _ = write!(out, "    {name} := ");
                    escape_str(&json_text(other), EscapeStyle::Unicode4, out);
                    out.push('\n');
                }
            }
            // an unused variable is a compile error in Go
            let _ = writeln!(out, "    _ = {name}");
        }
        LangId::CSharp => match value {
            Payload::Int(i) => {
                let _ = writeln!(out, "        const long {name} = {i};");
            }
            Payload::Float(f) => {
                let _ = writeln!(out, "        const double {name} = {f:?};");
            }
            Payload::Bool(b) => {
                let _ = writeln!(out, "        const bool {name} = {b};");
            }
            Payload::Str(s) => {
                let _ = write!(out, "        const string {name} = ");
                escape_str(s, EscapeStyle::Unicode4, out);
                out.push_str(";\n");
            }
            other => {
                let _ = write!(out, "        const string {name} = ");
                escape_str(&json_text(other), EscapeStyle::Unicode4, out);
                out.push_str(";\n");
            }
        },
        _ => {}
    }
}

/// Wraps the user body in the language's obligatory `main` scaffold.
pub fn wrap(lang: LangId, code: &str, bindings: &[(String, Payload)]) -> String {
    let (directives, body) = hoist_directives(code, lang);
    let mut program = String::new();
    match lang {
        LangId::Cpp => {
            program.push_str("#include <cstdint>\n#include <iostream>\n#include <string>\n#include <vector>\n");
            program.push_str(&directives);
            program.push_str("\nint main() {\n");
            for (name, value) in bindings {
                binding_decl(lang, name, value, &mut program);
            }
            program.push_str(&insert_semicolons(&body));
            program.push_str("    return 0;\n}\n");
        }
        LangId::Rust => {
            program.push_str(&directives);
            program.push_str("\n#[allow(unused)]\nfn main() {\n");
            for (name, value) in bindings {
                binding_decl(lang, name, value, &mut program);
            }
            program.push_str(&body);
            program.push_str("}\n");
        }
        LangId::Go => {
            program.push_str("package main\n\n");
            program.push_str(&directives);
            program.push_str("\nfunc main() {\n");
            for (name, value) in bindings {
                binding_decl(lang, name, value, &mut program);
            }
            program.push_str(&body);
            program.push_str("}\n");
        }
        LangId::CSharp => {
            program.push_str("using System;\n");
            program.push_str(&directives);
            program.push_str("\nclass Program {\n    static void Main() {\n");
            for (name, value) in bindings {
                binding_decl(lang, name, value, &mut program);
            }
            program.push_str(&body);
            program.push_str("    }\n}\n");
        }
        _ => {}
    }
    program
}

fn source_ext(lang: LangId) -> &'static str {
    match lang {
        LangId::Cpp => "cpp",
        LangId::Rust => "rs",
        LangId::Go => "go",
        LangId::CSharp => "cs",
        _ => "txt",
    }
}

fn compiler_candidates(lang: LangId) -> &'static [&'static str] {
    match lang {
        LangId::Cpp => &["g++", "c++", "clang++"],
        LangId::Rust => &["rustc"],
        LangId::Go => &["go"],
        LangId::CSharp => &["mcs", "csc"],
        _ => &[],
    }
}

/// First line of the compiler's version output, cached per process; part
/// of the cache key so toolchain upgrades invalidate stored artifacts.
fn toolchain_fingerprint(lang: LangId, tool: &Path) -> String {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, String>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(found) = guard.get(tool) {
            return found.clone();
        }
    }
    let mut cmd = Command::new(tool);
    if matches!(lang, LangId::Go) {
        cmd.arg("version");
    } else {
        cmd.arg("--version");
    }
    let fingerprint = run_simple(cmd, None, Duration::from_secs(5))
        .ok()
        .and_then(|out| out.stdout.lines().next().map(str::to_owned))
        .unwrap_or_else(|| tool.display().to_string());
    if let Ok(mut guard) = cache.lock() {
        guard.insert(tool.to_path_buf(), fingerprint.clone());
    }
    fingerprint
}

/// Normalizes source for hashing: CRLF to LF, trailing whitespace
/// stripped per line.
pub fn normalize(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    for line in code.replace("\r\n", "\n").lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Content hash identifying a compiled artifact.
pub fn content_hash(lang: LangId, wrapped_source: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lang.name().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(wrapped_source).as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn compile_cmd(lang: LangId, tool: &Path, src: &Path, artifact: &Path) -> Command {
    let mut cmd = Command::new(tool);
    match lang {
        LangId::Cpp => {
            cmd.arg("-std=c++17").arg("-O2").arg("-o").arg(artifact).arg(src);
        }
        LangId::Rust => {
            cmd.arg("-O")
                .arg("--edition=2021")
                .arg("--crate-name")
                .arg("naab_block")
                .arg("-o")
                .arg(artifact)
                .arg(src);
        }
        LangId::Go => {
            cmd.arg("build").arg("-o").arg(artifact).arg(src);
            cmd.env("GO111MODULE", "off");
        }
        LangId::CSharp => {
            let mut out_flag = std::ffi::OsString::from("-out:");
            out_flag.push(artifact);
            cmd.arg(out_flag).arg(src);
        }
        _ => {}
    }
    cmd
}

fn run_cmd(lang: LangId, artifact: &Path) -> Result<Command, SimpleError> {
    if matches!(lang, LangId::CSharp) {
        let mono = find_tool(&["mono"]).ok_or_else(|| missing_tool(LangId::CSharp, &["mono"]))?;
        let mut cmd = Command::new(mono);
        cmd.arg(artifact);
        return Ok(cmd);
    }
    Ok(Command::new(artifact))
}

/// Compiles (or reuses a cached artifact for) a block and runs it.
///
/// The block's value is the captured stdout; compiled languages print
/// their result explicitly. Failed compilations are never cached.
pub fn execute(
    lang: LangId,
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
    cache: Option<&CodeCache>,
) -> Result<BlockOutcome, SimpleError> {
    let candidates = compiler_candidates(lang);
    let tool = find_tool(candidates).ok_or_else(|| missing_tool(lang, candidates))?;
    let wrapped = SecureBuf::from_string(wrap(lang, code, bindings));
    let fingerprint = toolchain_fingerprint(lang, &tool);
    let hash = content_hash(lang, wrapped.as_str(), &fingerprint);

    let cached = cache.and_then(|c| c.lookup(lang.name(), &hash));
    // keeps the scratch dir alive while a non-cached artifact runs
    let mut _scratch: Option<tempfile::TempDir> = None;
    let artifact = match cached {
        Some(path) => {
            debug!(lang = lang.name(), %hash, "inline-code cache hit");
            path
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("naab-build-")
                .tempdir()
                .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;
            let src = dir.path().join(format!("block.{}", source_ext(lang)));
            std::fs::write(&src, wrapped.as_bytes())
                .map_err(|err| SimpleError::new(ExcKind::IOError, err.to_string()))?;
            let artifact = dir.path().join(if matches!(lang, LangId::CSharp) {
                "block.exe"
            } else {
                "block.out"
            });
            let output = run_simple(compile_cmd(lang, &tool, &src, &artifact), None, timeout)?;
            if output.timed_out {
                return Err(SimpleError::new(
                    ExcKind::TimeoutError,
                    format!("{} compilation exceeded the block's time budget", lang.name()),
                ));
            }
            if output.status != Some(0) {
                return Err(SimpleError::new(
                    ExcKind::PolyglotError,
                    format!(
                        "{} compilation failed:\n{}",
                        lang.name(),
                        output.stderr.trim_end()
                    ),
                ));
            }
            match cache.and_then(|c| c.store(lang.name(), &hash, &artifact)) {
                Some(stored) => stored,
                None => {
                    _scratch = Some(dir);
                    artifact
                }
            }
        }
    };

    let output = run_simple(run_cmd(lang, &artifact)?, None, timeout)?;
    if output.timed_out {
        return Err(SimpleError::new(
            ExcKind::TimeoutError,
            format!("{} block exceeded its time budget", lang.name()),
        ));
    }
    if output.status != Some(0) {
        let detail = if output.stderr.trim().is_empty() {
            format!("exit status {:?}", output.status)
        } else {
            output.stderr.trim_end().to_owned()
        };
        return Err(SimpleError::new(ExcKind::PolyglotError, detail));
    }
    Ok(BlockOutcome {
        value: Payload::Str(output.stdout),
        passthrough: String::new(),
    })
}
