use std::path::{Path, PathBuf};

use ahash::AHashMap;
use indexmap::IndexMap;
use tracing::debug;

use crate::exception::{ExcKind, RunError, RunResult};
use crate::expressions::CodeRange;
use crate::heap::{HeapData, ModuleValue};
use crate::interp::Interpreter;
use crate::parse::parse_program;
use crate::value::Value;

/// Registry of loaded modules, keyed by resolved absolute path.
///
/// Re-importing a path reuses the cached module value (pointer identity),
/// so a module's top level evaluates exactly once per process.
#[derive(Debug)]
pub struct ModuleRegistry {
    loaded: AHashMap<PathBuf, Value>,
    /// Paths currently evaluating; a repeat request is a circular import.
    loading: Vec<PathBuf>,
    search_roots: Vec<PathBuf>,
}

impl ModuleRegistry {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self {
            loaded: AHashMap::new(),
            loading: Vec::new(),
            search_roots,
        }
    }

    /// Cached module values; they are GC roots for the process lifetime.
    pub fn root_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.loaded.values().copied()
    }

    fn user_dir() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".naab").join("modules"))
    }

    /// Resolves `use a.b.c`: first as a file path, then as a file with a
    /// trailing export member; relative to the importer, then the search
    /// roots, then the user-wide module directory.
    fn resolve(
        &self,
        segments: &[String],
        importer_dir: &Path,
    ) -> Option<(PathBuf, Option<String>)> {
        let mut bases: Vec<PathBuf> = vec![importer_dir.to_path_buf()];
        bases.extend(self.search_roots.iter().cloned());
        if let Some(user) = Self::user_dir() {
            bases.push(user);
        }
        for base in &bases {
            let full = base.join(segments.join("/")).with_extension("naab");
            if full.is_file() {
                return Some((full, None));
            }
        }
        if segments.len() > 1 {
            let (member, prefix) = segments.split_last()?;
            for base in &bases {
                let full = base.join(prefix.join("/")).with_extension("naab");
                if full.is_file() {
                    return Some((full, Some(member.clone())));
                }
            }
        }
        None
    }
}

impl Interpreter {
    pub(crate) fn exec_use(
        &mut self,
        path: &[String],
        alias: Option<&str>,
        range: CodeRange,
    ) -> RunResult<()> {
        let importer_dir = Path::new(self.current_file())
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let display = path.join(".");
        let Some((file, member)) = self.modules.resolve(path, &importer_dir) else {
            return Err(self.throw(
                ExcKind::ModuleError,
                format!("cannot resolve module `{display}`"),
                range,
            ));
        };
        let module = self.load_module(&file, &display, range)?;
        match member {
            None => {
                let leaf = alias
                    .map(str::to_owned)
                    .or_else(|| path.last().cloned())
                    .unwrap_or(display);
                self.env.define(leaf, module);
                Ok(())
            }
            Some(member) => {
                let exported = match module {
                    Value::Ref(id) => match self.heap.get(id) {
                        HeapData::Module(m) => m.exports.get(&member).copied(),
                        _ => None,
                    },
                    _ => None,
                };
                let Some(value) = exported else {
                    return Err(self.throw(
                        ExcKind::ModuleError,
                        format!(
                            "module `{}` has no export `{member}` (while importing `{display}`)",
                            file.display()
                        ),
                        range,
                    ));
                };
                let name = alias.map_or(member, str::to_owned);
                self.env.define(name, value);
                Ok(())
            }
        }
    }

    /// Loads (or reuses) the module at `file`. First use parses the file,
    /// evaluates its own imports depth-first (topological order), then
    /// runs every top-level statement in an isolated environment and
    /// collects the `export`-marked declarations.
    pub(crate) fn load_module(
        &mut self,
        file: &Path,
        display: &str,
        range: CodeRange,
    ) -> RunResult<Value> {
        let canonical = file.canonicalize().unwrap_or_else(|_| file.to_path_buf());
        if let Some(value) = self.modules.loaded.get(&canonical) {
            return Ok(*value);
        }
        if self.modules.loading.contains(&canonical) {
            let mut cycle: Vec<String> = self
                .modules
                .loading
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            cycle.push(canonical.display().to_string());
            return Err(self.throw(
                ExcKind::ModuleError,
                format!("circular import of `{display}`: {}", cycle.join(" -> ")),
                range,
            ));
        }

        let source = match std::fs::read_to_string(&canonical) {
            Ok(source) => source,
            Err(err) => {
                return Err(self.throw(
                    ExcKind::ModuleError,
                    format!("cannot read module `{}`: {err}", canonical.display()),
                    range,
                ));
            }
        };
        let nodes = match parse_program(&source) {
            Ok(nodes) => nodes,
            Err(err) => {
                return Err(self.throw(
                    ExcKind::ModuleError,
                    format!(
                        "failed to parse module `{}`: {} at {}:{}",
                        canonical.display(),
                        err.message,
                        err.line,
                        err.col
                    ),
                    range,
                ));
            }
        };

        debug!(module = %canonical.display(), "evaluating module");
        self.modules.loading.push(canonical.clone());
        self.file_stack.push(canonical.display().to_string());
        self.exports_stack.push(Vec::new());
        // modules never see the importer's bindings, only the globals
        let module_env = self.globals.child();
        let result = self.with_env(module_env, |i| i.exec_nodes(&nodes));
        let exports = self
            .exports_stack
            .pop()
            .expect("internal invariant violated: exports stack underflow");
        self.file_stack.pop();
        self.modules.loading.pop();

        match result {
            Ok(()) => {}
            Err(RunError::Exc(exc)) => return Err(RunError::Exc(exc)),
            Err(_) => {
                return Err(self.throw(
                    ExcKind::ModuleError,
                    format!("module `{display}` unwound with a control-flow signal"),
                    range,
                ));
            }
        }

        let leaf = canonical
            .file_stem()
            .map_or_else(|| display.to_owned(), |s| s.to_string_lossy().into_owned());
        let mut table: IndexMap<String, Value, ahash::RandomState> = IndexMap::default();
        for (name, value) in exports {
            table.insert(name, value);
        }
        let module = self.heap.alloc(HeapData::Module(ModuleValue {
            name: leaf,
            exports: table,
        }));
        self.modules.loaded.insert(canonical, module);
        Ok(module)
    }
}
