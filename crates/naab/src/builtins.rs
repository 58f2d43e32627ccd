use indexmap::IndexMap;

use crate::env::Environment;
use crate::exception::{ExcKind, RunResult};
use crate::expressions::CodeRange;
use crate::heap::{HeapData, ModuleValue};
use crate::interp::{Interpreter, NativeFn, NativeFnEntry};
use crate::value::{render_to_string, type_name, Builtin, NativeFnId, Value};

/// Binds the evaluator's lexical builtins into the global scope.
pub fn install(globals: &Environment) {
    globals.define("print", Value::Builtin(Builtin::Print));
    globals.define("typeof", Value::Builtin(Builtin::Typeof));
    globals.define("gc_collect", Value::Builtin(Builtin::GcCollect));
}

/// Dispatches a builtin call.
pub fn call(
    interp: &mut Interpreter,
    builtin: Builtin,
    args: Vec<Value>,
    range: CodeRange,
) -> RunResult<Value> {
    match builtin {
        Builtin::Print => {
            let mut line = String::new();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                let rendered = render_to_string(*arg, &interp.heap, &interp.structs, false)
                    .map_err(|err| interp.throw_simple(err, range))?;
                line.push_str(&rendered);
            }
            line.push('\n');
            if let Err(err) = interp.writer.write(&line) {
                return Err(interp.throw(ExcKind::IOError, err.to_string(), range));
            }
            Ok(Value::Null)
        }
        Builtin::Typeof => {
            if args.len() != 1 {
                return Err(interp.throw(
                    ExcKind::ArityError,
                    format!("`typeof` expects 1 argument, got {}", args.len()),
                    range,
                ));
            }
            let name = type_name(args[0], &interp.heap, &interp.structs);
            Ok(interp.heap.alloc_str(name))
        }
        Builtin::GcCollect => {
            if !args.is_empty() {
                return Err(interp.throw(
                    ExcKind::ArityError,
                    format!("`gc_collect` expects 0 arguments, got {}", args.len()),
                    range,
                ));
            }
            let freed = interp.collect_garbage();
            Ok(Value::Int(i64::try_from(freed).unwrap_or(i64::MAX)))
        }
    }
}

impl Interpreter {
    /// Registers a native module: a pre-registered callable table exposed
    /// to scripts as a global module value. This is the hook the external
    /// standard-library bindings use.
    pub fn register_native_module(&mut self, name: &str, functions: Vec<(String, NativeFn)>) {
        let mut exports: IndexMap<String, Value, ahash::RandomState> = IndexMap::default();
        for (fn_name, func) in functions {
            let id = NativeFnId(
                u32::try_from(self.native_fns.len()).expect("native function table overflow"),
            );
            self.native_fns.push(NativeFnEntry {
                name: format!("{name}.{fn_name}"),
                func,
            });
            exports.insert(fn_name, Value::NativeFn(id));
        }
        let module = self.heap.alloc(HeapData::Module(ModuleValue {
            name: name.to_owned(),
            exports,
        }));
        self.globals.define(name.to_owned(), module);
    }
}
