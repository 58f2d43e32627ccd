//! The NAAb interpreter: a tree-walking evaluator for a dynamically
//! executed, statically annotated scripting language whose distinguishing
//! feature is inline polyglot blocks: foreign source text (Python,
//! JavaScript, Shell, C++, Rust, Ruby, Go, C#) embedded in host code,
//! variable-bound on entry, with values flowing back into host variables.
//!
//! The crate covers the execution core: values and environments, the
//! mark-and-sweep cycle collector, runtime type validation, the evaluator,
//! the per-language polyglot executors with a dependency-analyzed parallel
//! scheduler, the content-addressed inline-code cache, the module loader,
//! and the structured error reporter.
//!
//! ```no_run
//! use naab::{Config, Interpreter};
//!
//! let mut interp = Interpreter::new(Config::default());
//! interp
//!     .run_source("print(1 + 2)", "example.naab")
//!     .expect("script runs");
//! ```

mod builtins;
pub mod cache;
mod config;
mod env;
mod exception;
mod expressions;
mod heap;
mod interp;
mod io;
mod lexer;
mod modules;
mod parse;
pub mod polyglot;
pub mod report;
mod scheduler;
mod secure;
mod structs;
mod types;
mod value;

pub use crate::config::Config;
pub use crate::env::Environment;
pub use crate::exception::{CodeLoc, ExcKind, Exception, RunError, RunResult, SimpleError};
pub use crate::expressions::{CodeRange, Expr, ExprLoc, Node};
pub use crate::heap::{HeapStats, DEFAULT_GC_THRESHOLD};
pub use crate::interp::{Frame, Interpreter, NativeFn, STDLIB_MODULES};
pub use crate::io::{CollectPrint, PrintWriter, StdPrint};
pub use crate::lexer::SyntaxError;
pub use crate::secure::SecureBuf;
pub use crate::value::Value;

/// Parses a source buffer, producing the program AST.
pub fn parse_source(source: &str, file: &str) -> Result<Vec<Node>, Exception> {
    parse::parse_program(source).map_err(|err| syntax_exception(err, file))
}

/// Parses and statically checks a source buffer without evaluating it.
pub fn check_source(source: &str, file: &str) -> Result<(), Exception> {
    let nodes = parse_source(source, file)?;
    parse::check_program(&nodes).map_err(|err| syntax_exception(err, file))
}

fn syntax_exception(err: SyntaxError, file: &str) -> Exception {
    let mut exc = Exception::new(ExcKind::ParseError.to_string(), err.message);
    exc.location = Some(CodeLoc {
        file: file.to_owned(),
        line: err.line,
        col: err.col,
    });
    exc
}
