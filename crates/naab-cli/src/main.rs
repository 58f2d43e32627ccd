//! NAAb command-line front-end.
//!
//! Drives the interpreter crate: `run` evaluates a script, `check` parses
//! and statically checks without evaluating, `parse` prints the AST.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use naab::report::render_report;
use naab::{check_source, parse_source, Config, Exception, Interpreter};

const EXIT_OK: u8 = 0;
const EXIT_UNCAUGHT: u8 = 1;
const EXIT_PARSE: u8 = 2;
const EXIT_INTERNAL: u8 = 3;

#[derive(Parser)]
#[command(name = "naab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "NAAb interpreter - run polyglot scripts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and evaluate a script
    Run {
        /// Input .naab source file
        file: PathBuf,
    },

    /// Parse and statically check a script without evaluating it
    Check {
        /// Input .naab source file
        file: PathBuf,
    },

    /// Emit the parsed AST in a human-readable form
    Parse {
        /// Input .naab source file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { file } => cmd_run(&file),
        Commands::Check { file } => cmd_check(&file),
        Commands::Parse { file } => cmd_parse(&file),
    };
    ExitCode::from(code)
}

fn read_source(file: &Path) -> Result<String, u8> {
    std::fs::read_to_string(file).map_err(|err| {
        eprintln!("error: IOError: cannot read `{}`: {err}", file.display());
        EXIT_UNCAUGHT
    })
}

fn report(exc: &Exception, source: &str, config: &Config) {
    eprint!("{}", render_report(exc, Some(source), config.color));
}

fn cmd_run(file: &Path) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let config = Config::from_env();
    let file_name = file.display().to_string();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut interp = Interpreter::new(config.clone());
        interp.run_source(&source, &file_name)
    }));
    match outcome {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(exc)) => {
            report(&exc, &source, &config);
            if exc.kind == "ParseError" {
                EXIT_PARSE
            } else {
                EXIT_UNCAUGHT
            }
        }
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            eprintln!("error: internal invariant violation: {detail}");
            EXIT_INTERNAL
        }
    }
}

fn cmd_check(file: &Path) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let config = Config::from_env();
    match check_source(&source, &file.display().to_string()) {
        Ok(()) => EXIT_OK,
        Err(exc) => {
            report(&exc, &source, &config);
            EXIT_PARSE
        }
    }
}

fn cmd_parse(file: &Path) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let config = Config::from_env();
    match parse_source(&source, &file.display().to_string()) {
        Ok(nodes) => {
            println!("{nodes:#?}");
            EXIT_OK
        }
        Err(exc) => {
            report(&exc, &source, &config);
            EXIT_PARSE
        }
    }
}
