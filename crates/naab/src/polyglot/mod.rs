//! Per-language executors for inline polyglot blocks.
//!
//! Every adapter implements the same contract: inject bindings as
//! language-appropriate declarations, wrap the user code so its value can
//! be captured, execute in an isolated subprocess under a timeout, and
//! marshal the result back. Foreign failures never cross the boundary as
//! native exceptions; they surface as `PolyglotError` / `TimeoutError`.

pub mod callback;
pub mod compiled;
pub mod javascript;
pub mod payload;
pub mod process;
pub mod python;
pub mod ruby;
pub mod shell;

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CodeCache;
use crate::exception::{ExcKind, SimpleError};
use callback::CallbackHost;
use payload::Payload;

/// Sentinel prefix marking the wrapper-emitted result line on stdout.
pub const RESULT_SENTINEL: &str = "__NAAB_RESULT__";

/// Default per-block execution budget.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// The supported foreign languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LangId {
    Python,
    JavaScript,
    Shell,
    Ruby,
    Cpp,
    Rust,
    Go,
    CSharp,
}

impl LangId {
    /// Resolves a source-level language tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "python" | "py" => Some(Self::Python),
            "javascript" | "js" | "node" => Some(Self::JavaScript),
            "bash" | "sh" | "shell" => Some(Self::Shell),
            "ruby" | "rb" => Some(Self::Ruby),
            "cpp" | "c++" | "cxx" => Some(Self::Cpp),
            "rust" | "rs" => Some(Self::Rust),
            "go" => Some(Self::Go),
            "csharp" | "cs" | "c#" => Some(Self::CSharp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Shell => "shell",
            Self::Ruby => "ruby",
            Self::Cpp => "cpp",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::CSharp => "csharp",
        }
    }

    /// Compiled languages go through the inline-code cache.
    pub fn is_compiled(self) -> bool {
        matches!(self, Self::Cpp | Self::Rust | Self::Go | Self::CSharp)
    }

    /// Languages whose adapter can inject host functions as callback stubs.
    pub fn supports_callbacks(self) -> bool {
        matches!(self, Self::Python | Self::JavaScript)
    }
}

/// A block's execution result: the marshalled value plus any ordinary
/// stdout the foreign code produced, relayed to the host writer by the
/// caller (after write-back ordering for parallel groups).
#[derive(Debug)]
pub struct BlockOutcome {
    pub value: Payload,
    pub passthrough: String,
}

/// Executes a block whose bindings have already been snapshotted.
///
/// This function is free of interpreter state, so the parallel scheduler
/// can run it on worker threads; the sequential path calls it directly
/// with an interpreter-backed callback host.
pub fn execute_prepared(
    lang: LangId,
    code: &str,
    bindings: &[(String, Payload)],
    timeout: Duration,
    host: &mut dyn CallbackHost,
    cache: Option<&CodeCache>,
) -> Result<BlockOutcome, SimpleError> {
    match lang {
        LangId::Python => python::execute(code, bindings, timeout, host),
        LangId::JavaScript => javascript::execute(code, bindings, timeout, host),
        LangId::Shell => shell::execute(code, bindings, timeout),
        LangId::Ruby => ruby::execute(code, bindings, timeout),
        LangId::Cpp | LangId::Rust | LangId::Go | LangId::CSharp => {
            compiled::execute(lang, code, bindings, timeout, cache)
        }
    }
}

/// Locates a tool on `PATH`, trying candidates in order.
pub fn find_tool(candidates: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for candidate in candidates {
        for dir in std::env::split_paths(&path) {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

/// Error for a runtime whose interpreter/compiler is not installed.
pub fn missing_tool(lang: LangId, tools: &[&str]) -> SimpleError {
    SimpleError::new(
        ExcKind::PolyglotError,
        format!(
            "no {} runtime found (looked for {})",
            lang.name(),
            tools.join(", ")
        ),
    )
}

/// Converts a finished process into the common failure cases shared by the
/// interpreted adapters: timeout, then non-zero exit.
pub fn check_process_failure(
    lang: LangId,
    output: &process::ProcessOutput,
) -> Result<(), SimpleError> {
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
    Ok(())
}

/// Indents every line by four spaces, preserving blank lines.
pub fn indent(code: &str) -> String {
    let mut out = String::with_capacity(code.len() + 64);
    for line in code.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// JSON string escaping, shared by several adapters for which JSON string
/// literal syntax is valid source.
pub fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_resolve() {
        assert_eq!(LangId::from_tag("bash"), Some(LangId::Shell));
        assert_eq!(LangId::from_tag("py"), Some(LangId::Python));
        assert_eq!(LangId::from_tag("c++"), Some(LangId::Cpp));
        assert_eq!(LangId::from_tag("fortran"), None);
    }

    #[test]
    fn compiled_classification() {
        assert!(LangId::Rust.is_compiled());
        assert!(!LangId::Python.is_compiled());
        assert!(LangId::Python.supports_callbacks());
        assert!(!LangId::Shell.supports_callbacks());
    }
}
