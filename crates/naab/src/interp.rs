use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::builtins;
use crate::cache::CodeCache;
use crate::config::Config;
use crate::env::Environment;
use crate::exception::{CodeLoc, ExcKind, Exception, RunError, RunResult, SimpleError};
use crate::expressions::{
    AssignTarget, BinaryOp, CatchClause, CodeRange, Expr, ExprLoc, FunctionDef, Literal, Node,
    PolyglotBlock, UnaryOp,
};
use crate::heap::{
    Dict, FunctionValue, Heap, HeapData, HeapStats, RangeValue, StructValue,
};
use crate::io::{PrintWriter, StdPrint};
use crate::modules::ModuleRegistry;
use crate::parse::parse_program;
use crate::polyglot::callback::{CallbackHost, CallbackRegistry};
use crate::polyglot::payload::{self, Payload};
use crate::polyglot::{execute_prepared, LangId};
use crate::scheduler;
use crate::structs::StructRegistry;
use crate::types::{value_matches, Type};
use crate::value::{self, dynamic_type, render_to_string, truthy, type_name, DictKey, Value};

/// Maximum host-function call depth.
pub const MAX_CALL_DEPTH: usize = 200;

/// Module names the reporter may suggest `use`-ing for a `NameError`.
pub const STDLIB_MODULES: &[&str] = &["math", "string", "json", "io", "os", "time"];

/// A call-stack frame: the callee's name plus the call site.
#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
}

/// Host-registered native function: the callable table entries of
/// pre-registered standard-library modules.
pub type NativeFn = fn(&mut Interpreter, Vec<Value>) -> RunResult<Value>;

#[derive(Debug)]
pub struct NativeFnEntry {
    pub name: String,
    pub func: NativeFn,
}

/// The tree-walking evaluator and owner of all runtime state.
pub struct Interpreter {
    pub(crate) heap: Heap,
    pub(crate) structs: StructRegistry,
    pub(crate) globals: Environment,
    pub(crate) env: Environment,
    /// Saved scope spine; every frame here is a GC root.
    pub(crate) env_stack: Vec<Environment>,
    /// Evaluator-local temporaries the GC must treat as roots.
    pub(crate) temp_roots: SmallVec<[Value; 16]>,
    pub(crate) call_stack: Vec<Frame>,
    pub(crate) file_stack: Vec<String>,
    pub(crate) writer: Box<dyn PrintWriter>,
    pub(crate) native_fns: Vec<NativeFnEntry>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) cache: Option<CodeCache>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) config: Config,
    /// Export collectors, one per module currently evaluating.
    pub(crate) exports_stack: Vec<Vec<(String, Value)>>,
}

impl Interpreter {
    pub fn new(config: Config) -> Self {
        Self::with_writer(config, Box::new(StdPrint))
    }

    pub fn with_writer(config: Config, writer: Box<dyn PrintWriter>) -> Self {
        let globals = Environment::new_global();
        builtins::install(&globals);
        let env = globals.child();
        let cache = config
            .cache_root
            .clone()
            .map(|root| CodeCache::new(root, config.cache_limit));
        Self {
            heap: Heap::new(config.gc_threshold),
            structs: StructRegistry::default(),
            globals,
            env,
            env_stack: Vec::new(),
            temp_roots: SmallVec::new(),
            call_stack: Vec::new(),
            file_stack: vec!["<main>".to_owned()],
            writer,
            native_fns: Vec::new(),
            modules: ModuleRegistry::new(config.module_paths.clone()),
            cache,
            callbacks: CallbackRegistry::default(),
            config,
            exports_stack: Vec::new(),
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Parses and evaluates a source buffer as the main script.
    pub fn run_source(&mut self, source: &str, file: &str) -> Result<(), Exception> {
        let nodes = parse_program(source).map_err(|err| {
            let mut exc = Exception::new(ExcKind::ParseError.to_string(), err.message);
            exc.location = Some(CodeLoc {
                file: file.to_owned(),
                line: err.line,
                col: err.col,
            });
            exc
        })?;
        self.file_stack = vec![file.to_owned()];
        match self.exec_nodes(&nodes) {
            Ok(()) => Ok(()),
            Err(RunError::Exc(value)) => Err(self.exception_from_value(value)),
            Err(RunError::Return(_)) => {
                Err(Exception::new("UserError", "`return` outside of a function"))
            }
            Err(RunError::Break | RunError::Continue) => Err(Exception::new(
                "UserError",
                "loop control statement outside of a loop",
            )),
        }
    }

    // ---- GC plumbing ----

    pub(crate) fn current_file(&self) -> &str {
        self.file_stack.last().map_or("<main>", String::as_str)
    }

    fn maybe_collect(&mut self) {
        if self.heap.gc_pending() {
            self.collect_garbage();
        }
    }

    /// Runs a full mark-and-sweep cycle; exposed to scripts as
    /// `gc_collect()`.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<Value> = self.temp_roots.to_vec();
        roots.extend(self.modules.root_values());
        roots.extend(self.callbacks.root_values());
        let mut envs: Vec<Environment> = Vec::with_capacity(self.env_stack.len() + 2);
        envs.push(self.globals.clone());
        envs.push(self.env.clone());
        envs.extend(self.env_stack.iter().cloned());
        self.heap.collect(&roots, &envs)
    }

    // ---- scope discipline ----

    fn in_child_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> RunResult<T>,
    ) -> RunResult<T> {
        self.env_stack.push(self.env.clone());
        self.env = self.env.child();
        let result = f(self);
        self.env = self
            .env_stack
            .pop()
            .expect("internal invariant violated: scope stack underflow");
        result
    }

    pub(crate) fn with_env<T>(
        &mut self,
        env: Environment,
        f: impl FnOnce(&mut Self) -> RunResult<T>,
    ) -> RunResult<T> {
        self.env_stack.push(self.env.clone());
        self.env = env;
        let result = f(self);
        self.env = self
            .env_stack
            .pop()
            .expect("internal invariant violated: scope stack underflow");
        result
    }

    // ---- exceptions ----

    fn build_stack(&self, range: CodeRange) -> Vec<String> {
        let mut frames = Vec::with_capacity(self.call_stack.len() + 1);
        let innermost = self
            .call_stack
            .last()
            .map_or("<main>", |frame| frame.name.as_str());
        frames.push(format!(
            "at {innermost} ({}:{}:{})",
            self.current_file(),
            range.line,
            range.col
        ));
        for i in (0..self.call_stack.len()).rev() {
            let caller = if i == 0 {
                "<main>"
            } else {
                self.call_stack[i - 1].name.as_str()
            };
            let frame = &self.call_stack[i];
            frames.push(format!(
                "at {caller} ({}:{}:{})",
                frame.file, frame.line, frame.col
            ));
        }
        frames
    }

    /// Materializes a `NaabError` dict value.
    pub(crate) fn make_error(
        &mut self,
        kind: ExcKind,
        message: &str,
        help: Option<String>,
        range: CodeRange,
    ) -> Value {
        let stack = self.build_stack(range);
        let mut dict = Dict::new();
        let message_v = self.heap.alloc_str(message);
        let type_v = self.heap.alloc_str(kind.to_string());
        let frames: Vec<Value> = stack
            .into_iter()
            .map(|frame| self.heap.alloc_str(frame))
            .collect();
        let stack_v = self.heap.alloc_list(frames);
        let file_v = self.heap.alloc_str(self.current_file().to_owned());
        dict.entries.insert(DictKey::Str("message".into()), message_v);
        dict.entries.insert(DictKey::Str("type".into()), type_v);
        dict.entries.insert(DictKey::Str("stack".into()), stack_v);
        dict.entries.insert(DictKey::Str("file".into()), file_v);
        dict.entries
            .insert(DictKey::Str("line".into()), Value::Int(i64::from(range.line)));
        dict.entries
            .insert(DictKey::Str("col".into()), Value::Int(i64::from(range.col)));
        if let Some(help) = help {
            let help_v = self.heap.alloc_str(help);
            dict.entries.insert(DictKey::Str("help".into()), help_v);
        }
        self.heap.alloc_dict(dict)
    }

    pub(crate) fn throw(
        &mut self,
        kind: ExcKind,
        message: impl AsRef<str>,
        range: CodeRange,
    ) -> RunError {
        RunError::Exc(self.make_error(kind, message.as_ref(), None, range))
    }

    pub(crate) fn throw_help(
        &mut self,
        kind: ExcKind,
        message: impl AsRef<str>,
        help: Option<String>,
        range: CodeRange,
    ) -> RunError {
        RunError::Exc(self.make_error(kind, message.as_ref(), help, range))
    }

    pub(crate) fn throw_simple(&mut self, err: SimpleError, range: CodeRange) -> RunError {
        self.throw(err.kind, err.message, range)
    }

    fn dict_str(&self, dict: &Dict, key: &str) -> Option<String> {
        match dict.entries.get(&DictKey::Str(key.to_owned()))? {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Str(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn dict_int(&self, dict: &Dict, key: &str) -> Option<i64> {
        match dict.entries.get(&DictKey::Str(key.to_owned()))? {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extracts the public exception form from an error dict, for the
    /// reporter and the CLI.
    pub fn exception_from_value(&self, value: Value) -> Exception {
        let fallback = || {
            let message = render_to_string(value, &self.heap, &self.structs, false)
                .unwrap_or_else(|_| "<unrenderable error value>".to_owned());
            Exception::new("UserError", message)
        };
        let Value::Ref(id) = value else {
            return fallback();
        };
        let HeapData::Dict(dict) = self.heap.get(id) else {
            return fallback();
        };
        let mut exc = Exception::new(
            self.dict_str(dict, "type").unwrap_or_else(|| "UserError".to_owned()),
            self.dict_str(dict, "message").unwrap_or_default(),
        );
        exc.help = self.dict_str(dict, "help");
        if let (Some(file), Some(line), Some(col)) = (
            self.dict_str(dict, "file"),
            self.dict_int(dict, "line"),
            self.dict_int(dict, "col"),
        ) {
            exc.location = Some(CodeLoc {
                file,
                line: u32::try_from(line).unwrap_or(0),
                col: u32::try_from(col).unwrap_or(0),
            });
        }
        if let Some(Value::Ref(stack_id)) =
            dict.entries.get(&DictKey::Str("stack".to_owned()))
        {
            if let HeapData::List(frames) = self.heap.get(*stack_id) {
                for frame in frames {
                    if let Value::Ref(fid) = frame {
                        if let HeapData::Str(s) = self.heap.get(*fid) {
                            exc.stack.push(s.clone());
                        }
                    }
                }
            }
        }
        exc
    }

    fn is_error_dict(&self, value: Value) -> bool {
        if let Value::Ref(id) = value {
            if let HeapData::Dict(dict) = self.heap.get(id) {
                return dict.entries.contains_key(&DictKey::Str("message".to_owned()))
                    && dict.entries.contains_key(&DictKey::Str("type".to_owned()));
            }
        }
        false
    }

    fn suggest_name(&self, name: &str) -> Option<String> {
        if STDLIB_MODULES.contains(&name) {
            return Some(format!("`{name}` is a standard module; add `use {name}`"));
        }
        let mut candidates = self.env.visible_names();
        candidates.extend(self.native_fns.iter().map(|f| f.name.clone()));
        let best = candidates
            .iter()
            .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
            .filter(|(distance, candidate)| *distance <= 2 && candidate.as_str() != name)
            .min_by_key(|(distance, _)| *distance)?;
        Some(format!("did you mean `{}`?", best.1))
    }

    fn name_error(&mut self, name: &str, range: CodeRange) -> RunError {
        let help = self.suggest_name(name);
        self.throw_help(
            ExcKind::NameError,
            format!("`{name}` is not defined"),
            help,
            range,
        )
    }

    // ---- statements ----

    pub(crate) fn exec_nodes(&mut self, nodes: &[Node]) -> RunResult<()> {
        let mut i = 0;
        while i < nodes.len() {
            let run_len = scheduler::polyglot_run_len(&nodes[i..]);
            if run_len >= 2 {
                scheduler::execute_run(self, &nodes[i..i + run_len])?;
                i += run_len;
            } else {
                self.exec_node(&nodes[i])?;
                i += 1;
            }
        }
        Ok(())
    }

    pub(crate) fn exec_node(&mut self, node: &Node) -> RunResult<()> {
        // statement boundaries are the GC's safe points: every live
        // temporary is rooted or bound here
        self.maybe_collect();
        match node {
            Node::Expr(expr) => {
                // evaluate-and-discard, including inline blocks at
                // statement position
                self.eval(expr)?;
                Ok(())
            }
            Node::Let {
                name,
                ty,
                value,
                range,
            } => {
                let v = self.eval(value)?;
                let v = self.check_binding(v, ty.as_ref(), name, *range)?;
                self.env.define(name.clone(), v);
                Ok(())
            }
            Node::Assign {
                target,
                value,
                range,
            } => self.exec_assign(target, value, *range),
            Node::Fn(def) => {
                let func = self.heap.alloc(HeapData::Function(FunctionValue {
                    def: Rc::clone(def),
                    env: self.env.clone(),
                }));
                let name = def.name.clone().unwrap_or_default();
                self.env.define(name, func);
                Ok(())
            }
            Node::Struct(decl) => match self.structs.declare(decl) {
                Ok(_) => Ok(()),
                Err(err) => Err(self.throw_simple(err, decl.range)),
            },
            Node::If {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.eval(cond)?;
                if truthy(c, &self.heap) {
                    self.in_child_scope(|i| i.exec_nodes(then_block))
                } else if let Some(else_block) = else_block {
                    self.in_child_scope(|i| i.exec_nodes(else_block))
                } else {
                    Ok(())
                }
            }
            Node::While { cond, body } => loop {
                let c = self.eval(cond)?;
                if !truthy(c, &self.heap) {
                    return Ok(());
                }
                match self.in_child_scope(|i| i.exec_nodes(body)) {
                    Ok(()) | Err(RunError::Continue) => {}
                    Err(RunError::Break) => return Ok(()),
                    Err(other) => return Err(other),
                }
            },
            Node::For {
                var,
                iter,
                body,
                range,
            } => self.exec_for(var, iter, body, *range),
            Node::Break(_) => Err(RunError::Break),
            Node::Continue(_) => Err(RunError::Continue),
            Node::Return { value, range: _ } => {
                let v = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Err(RunError::Return(v))
            }
            Node::Try {
                body,
                catch,
                finally,
            } => self.exec_try(body, catch.as_ref(), finally.as_deref()),
            Node::Throw { value, range } => {
                let v = self.eval(value)?;
                if self.is_error_dict(v) {
                    return Err(RunError::Exc(v));
                }
                let message = render_to_string(v, &self.heap, &self.structs, false)
                    .unwrap_or_else(|_| "<unrenderable value>".to_owned());
                Err(self.throw(ExcKind::UserError, message, *range))
            }
            Node::Use { path, alias, range } => self.exec_use(path, alias.as_deref(), *range),
            Node::Export(inner) => {
                self.exec_node(inner)?;
                let name = match inner.as_ref() {
                    Node::Let { name, .. } => Some(name.clone()),
                    Node::Fn(def) => def.name.clone(),
                    // struct definitions are registry-visible already
                    _ => None,
                };
                if let Some(name) = name {
                    if let Some(value) = self.env.lookup(&name) {
                        if let Some(exports) = self.exports_stack.last_mut() {
                            exports.push((name, value));
                        }
                    }
                }
                Ok(())
            }
            Node::Block(body) => self.in_child_scope(|i| i.exec_nodes(body)),
        }
    }

    pub(crate) fn check_binding(
        &mut self,
        v: Value,
        ty: Option<&Type>,
        name: &str,
        range: CodeRange,
    ) -> RunResult<Value> {
        let Some(ty) = ty else { return Ok(v) };
        if ty.is_unchecked() {
            return Ok(v);
        }
        if !value_matches(v, ty, &self.heap, &self.structs) {
            let actual = type_name(v, &self.heap, &self.structs);
            let help = coercion_hint(ty, &actual);
            return Err(self.throw_help(
                ExcKind::TypeError,
                format!("expected `{ty}` for `{name}`, got `{actual}`"),
                help,
                range,
            ));
        }
        // numeric widening at binding sites stores a real float
        if matches!(ty, Type::Float) {
            if let Value::Int(i) = v {
                return Ok(Value::Float(i as f64));
            }
        }
        Ok(v)
    }

    fn exec_assign(
        &mut self,
        target: &AssignTarget,
        value: &ExprLoc,
        range: CodeRange,
    ) -> RunResult<()> {
        match target {
            AssignTarget::Name(name) => {
                let v = self.eval(value)?;
                if !self.env.assign(name, v) {
                    return Err(self.name_error(name, range));
                }
                Ok(())
            }
            AssignTarget::Member { object, field } => {
                let obj = self.eval(object)?;
                let mark = self.temp_roots.len();
                self.temp_roots.push(obj);
                let result = self.eval(value);
                self.temp_roots.truncate(mark);
                let v = result?;
                let Value::Ref(id) = obj else {
                    let tn = type_name(obj, &self.heap, &self.structs);
                    return Err(self.throw(
                        ExcKind::TypeError,
                        format!("cannot assign field `{field}` on `{tn}`"),
                        range,
                    ));
                };
                let def_id = match self.heap.get(id) {
                    HeapData::Struct(sv) => sv.def,
                    other => {
                        let tn = other.kind_name().to_owned();
                        return Err(self.throw(
                            ExcKind::TypeError,
                            format!("cannot assign field `{field}` on `{tn}`"),
                            range,
                        ));
                    }
                };
                let def = Rc::clone(self.structs.def(def_id));
                let Some(index) = def.field_index(field) else {
                    return Err(self.throw(
                        ExcKind::NameError,
                        format!("struct `{}` has no field `{field}`", def.name),
                        range,
                    ));
                };
                let v = self.check_binding(v, Some(&def.fields[index].ty), field, range)?;
                if let HeapData::Struct(sv) = self.heap.get_mut(id) {
                    sv.fields[index] = v;
                }
                Ok(())
            }
            AssignTarget::Index { object, index } => {
                let obj = self.eval(object)?;
                let mark = self.temp_roots.len();
                self.temp_roots.push(obj);
                let idx = match self.eval(index) {
                    Ok(idx) => idx,
                    Err(err) => {
                        self.temp_roots.truncate(mark);
                        return Err(err);
                    }
                };
                self.temp_roots.push(idx);
                let result = self.eval(value);
                self.temp_roots.truncate(mark);
                let v = result?;
                self.assign_index(obj, idx, v, range)
            }
        }
    }

    fn assign_index(
        &mut self,
        obj: Value,
        idx: Value,
        v: Value,
        range: CodeRange,
    ) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            let tn = type_name(obj, &self.heap, &self.structs);
            return Err(self.throw(
                ExcKind::TypeError,
                format!("`{tn}` does not support subscript assignment"),
                range,
            ));
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let len = items.len();
                let Value::Int(i) = idx else {
                    return Err(self.throw(
                        ExcKind::TypeError,
                        "list indices must be integers",
                        range,
                    ));
                };
                if i < 0 || (i as usize) >= len {
                    return Err(self.throw(
                        ExcKind::RangeError,
                        format!("index {i} out of bounds for list of length {len}"),
                        range,
                    ));
                }
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items[i as usize] = v;
                }
                Ok(())
            }
            HeapData::Dict(_) => {
                let key = match DictKey::from_value(idx, &self.heap) {
                    Ok(key) => key,
                    Err(err) => return Err(self.throw_simple(err, range)),
                };
                if let HeapData::Dict(dict) = self.heap.get_mut(id) {
                    dict.entries.insert(key, v);
                }
                Ok(())
            }
            HeapData::Str(_) => Err(self.throw(
                ExcKind::TypeError,
                "strings are immutable; subscript assignment is not supported",
                range,
            )),
            other => {
                let tn = other.kind_name().to_owned();
                Err(self.throw(
                    ExcKind::TypeError,
                    format!("`{tn}` does not support subscript assignment"),
                    range,
                ))
            }
        }
    }

    fn exec_for(
        &mut self,
        var: &str,
        iter: &ExprLoc,
        body: &[Node],
        range: CodeRange,
    ) -> RunResult<()> {
        let iterable = self.eval(iter)?;
        let mark = self.temp_roots.len();
        self.temp_roots.push(iterable);
        let result = self.run_for_loop(var, iterable, body, range);
        self.temp_roots.truncate(mark);
        result
    }

    fn run_for_loop(
        &mut self,
        var: &str,
        iterable: Value,
        body: &[Node],
        range: CodeRange,
    ) -> RunResult<()> {
        enum Src {
            List(crate::heap::HeapId),
            Range(RangeValue),
            Chars(Vec<char>),
            Keys(Vec<DictKey>),
        }
        let src = match iterable {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(_) => Src::List(id),
                HeapData::Range(r) => Src::Range(*r),
                HeapData::Str(s) => Src::Chars(s.chars().collect()),
                HeapData::Dict(d) => Src::Keys(d.entries.keys().cloned().collect()),
                other => {
                    let tn = other.kind_name().to_owned();
                    return Err(self.throw(
                        ExcKind::TypeError,
                        format!("`{tn}` is not iterable"),
                        range,
                    ));
                }
            },
            other => {
                let tn = type_name(other, &self.heap, &self.structs);
                return Err(self.throw(
                    ExcKind::TypeError,
                    format!("`{tn}` is not iterable"),
                    range,
                ));
            }
        };
        let mut index = 0usize;
        loop {
            let item = match &src {
                Src::List(id) => {
                    // the list may shrink while iterating; re-check the
                    // live length each step
                    let HeapData::List(items) = self.heap.get(*id) else {
                        return Ok(());
                    };
                    match items.get(index) {
                        Some(item) => *item,
                        None => return Ok(()),
                    }
                }
                Src::Range(r) => {
                    let i = r.start + index as i64;
                    let done = if r.inclusive { i > r.end } else { i >= r.end };
                    if done {
                        return Ok(());
                    }
                    Value::Int(i)
                }
                Src::Chars(chars) => match chars.get(index) {
                    Some(c) => self.heap.alloc_str(c.to_string()),
                    None => return Ok(()),
                },
                Src::Keys(keys) => match keys.get(index).cloned() {
                    Some(key) => key.to_value(&mut self.heap),
                    None => return Ok(()),
                },
            };
            index += 1;
            let step = self.in_child_scope(|i| {
                i.env.define(var, item);
                i.exec_nodes(body)
            });
            match step {
                Ok(()) | Err(RunError::Continue) => {}
                Err(RunError::Break) => return Ok(()),
                Err(other) => return Err(other),
            }
        }
    }

    fn exec_try(
        &mut self,
        body: &[Node],
        catch: Option<&CatchClause>,
        finally: Option<&[Node]>,
    ) -> RunResult<()> {
        let mark = self.temp_roots.len();
        let body_result = self.in_child_scope(|i| i.exec_nodes(body));
        let handled = match body_result {
            Err(RunError::Exc(exc_value)) => match catch {
                Some(clause) => {
                    self.temp_roots.push(exc_value);
                    self.in_child_scope(|i| {
                        i.env.define(clause.name.clone(), exc_value);
                        i.exec_nodes(&clause.body)
                    })
                }
                None => Err(RunError::Exc(exc_value)),
            },
            other => other,
        };
        let result = match finally {
            Some(finally) => {
                // root the in-flight payload across the handler
                if let Err(RunError::Exc(v) | RunError::Return(v)) = &handled {
                    self.temp_roots.push(*v);
                }
                let finally_result = self.in_child_scope(|i| i.exec_nodes(finally));
                match finally_result {
                    // a signal raised in `finally` supersedes the in-flight one
                    Err(err) => Err(err),
                    Ok(()) => handled,
                }
            }
            None => handled,
        };
        self.temp_roots.truncate(mark);
        result
    }

    // ---- expressions ----

    pub(crate) fn eval(&mut self, expr: &ExprLoc) -> RunResult<Value> {
        let range = expr.range;
        match &expr.expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => self.heap.alloc_str(s.clone()),
            }),
            Expr::Ident(name) => match self.env.lookup(name) {
                Some(value) => Ok(value),
                None => Err(self.name_error(name, range)),
            },
            Expr::List(items) => {
                let values = self.eval_rooted(items)?;
                Ok(self.heap.alloc_list(values))
            }
            Expr::Dict(entries) => self.eval_dict(entries, range),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(v, &self.heap))),
                    UnaryOp::Neg => match v {
                        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => {
                            let tn = type_name(other, &self.heap, &self.structs);
                            Err(self.throw(
                                ExcKind::TypeError,
                                format!("cannot negate `{tn}`"),
                                range,
                            ))
                        }
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, range),
            Expr::Range {
                start,
                end,
                inclusive,
            } => {
                let s = self.eval(start)?;
                let e = self.eval(end)?;
                let (Value::Int(s), Value::Int(e)) = (s, e) else {
                    return Err(self.throw(
                        ExcKind::RangeError,
                        "range endpoints must be integers",
                        range,
                    ));
                };
                Ok(self.heap.alloc(HeapData::Range(RangeValue {
                    start: s,
                    end: e,
                    inclusive: *inclusive,
                })))
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, None, range),
            Expr::Pipeline { value, call } => {
                let piped = self.eval(value)?;
                let Expr::Call { callee, args } = &call.expr else {
                    return Err(self.throw(
                        ExcKind::TypeError,
                        "pipeline target must be a call",
                        call.range,
                    ));
                };
                // the callee's return signal is consumed inside the call;
                // it never leaks into the enclosing function's frame
                self.eval_call(callee, args, Some(piped), range)
            }
            Expr::Member { object, field } => self.eval_member(object, field, range),
            Expr::Index { object, index } => self.eval_index(object, index, range),
            Expr::Lambda(def) => Ok(self.heap.alloc(HeapData::Function(FunctionValue {
                def: Rc::clone(def),
                env: self.env.clone(),
            }))),
            Expr::StructLit {
                name,
                type_args,
                fields,
            } => self.eval_struct_lit(name, type_args, fields, range),
            Expr::Polyglot(block) => self.eval_polyglot(block),
        }
    }

    /// Evaluates a list of expressions, keeping every produced value
    /// rooted until all are evaluated.
    fn eval_rooted(&mut self, exprs: &[ExprLoc]) -> RunResult<Vec<Value>> {
        let mark = self.temp_roots.len();
        for expr in exprs {
            match self.eval(expr) {
                Ok(v) => self.temp_roots.push(v),
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            }
        }
        let values = self.temp_roots[mark..].to_vec();
        self.temp_roots.truncate(mark);
        Ok(values)
    }

    fn eval_dict(
        &mut self,
        entries: &[(ExprLoc, ExprLoc)],
        range: CodeRange,
    ) -> RunResult<Value> {
        let mark = self.temp_roots.len();
        let mut keys = Vec::with_capacity(entries.len());
        for (key_expr, value_expr) in entries {
            let key_v = match self.eval(key_expr) {
                Ok(v) => v,
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            };
            let key = match DictKey::from_value(key_v, &self.heap) {
                Ok(key) => key,
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(self.throw_simple(err, range));
                }
            };
            match self.eval(value_expr) {
                Ok(v) => {
                    self.temp_roots.push(v);
                    keys.push(key);
                }
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            }
        }
        let mut dict = Dict::new();
        for (key, value) in keys.into_iter().zip(self.temp_roots[mark..].iter()) {
            dict.entries.insert(key, *value);
        }
        self.temp_roots.truncate(mark);
        Ok(self.heap.alloc_dict(dict))
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &ExprLoc,
        rhs: &ExprLoc,
        range: CodeRange,
    ) -> RunResult<Value> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let l = self.eval(lhs)?;
            let l_truthy = truthy(l, &self.heap);
            let short_circuit = match op {
                BinaryOp::And => !l_truthy,
                _ => l_truthy,
            };
            if short_circuit {
                return Ok(Value::Bool(l_truthy));
            }
            let r = self.eval(rhs)?;
            return Ok(Value::Bool(truthy(r, &self.heap)));
        }
        let l = self.eval(lhs)?;
        let mark = self.temp_roots.len();
        self.temp_roots.push(l);
        let r = match self.eval(rhs) {
            Ok(r) => r,
            Err(err) => {
                self.temp_roots.truncate(mark);
                return Err(err);
            }
        };
        let result = value::binary(op, l, r, &mut self.heap, &self.structs);
        self.temp_roots.truncate(mark);
        result.map_err(|err| self.throw_simple(err, range))
    }

    fn eval_member(
        &mut self,
        object: &ExprLoc,
        field: &str,
        range: CodeRange,
    ) -> RunResult<Value> {
        let obj = self.eval(object)?;
        let Value::Ref(id) = obj else {
            let tn = type_name(obj, &self.heap, &self.structs);
            return Err(self.throw(
                ExcKind::TypeError,
                format!("cannot access field `{field}` on `{tn}`"),
                range,
            ));
        };
        match self.heap.get(id) {
            HeapData::Struct(sv) => {
                let def_id = sv.def;
                let def = self.structs.def(def_id);
                match def.field_index(field) {
                    Some(index) => {
                        let HeapData::Struct(sv) = self.heap.get(id) else {
                            unreachable!("struct slot changed kind");
                        };
                        Ok(sv.fields[index])
                    }
                    None => {
                        let name = def.name.clone();
                        Err(self.throw(
                            ExcKind::NameError,
                            format!("struct `{name}` has no field `{field}`"),
                            range,
                        ))
                    }
                }
            }
            HeapData::Module(module) => match module.exports.get(field) {
                Some(value) => Ok(*value),
                None => {
                    let name = module.name.clone();
                    Err(self.throw(
                        ExcKind::NameError,
                        format!("module `{name}` has no export `{field}`"),
                        range,
                    ))
                }
            },
            other => {
                let tn = other.kind_name().to_owned();
                Err(self.throw(
                    ExcKind::TypeError,
                    format!("cannot access field `{field}` on `{tn}`"),
                    range,
                ))
            }
        }
    }

    fn eval_index(
        &mut self,
        object: &ExprLoc,
        index: &ExprLoc,
        range: CodeRange,
    ) -> RunResult<Value> {
        let obj = self.eval(object)?;
        let mark = self.temp_roots.len();
        self.temp_roots.push(obj);
        let idx = match self.eval(index) {
            Ok(idx) => idx,
            Err(err) => {
                self.temp_roots.truncate(mark);
                return Err(err);
            }
        };
        self.temp_roots.truncate(mark);
        let Value::Ref(id) = obj else {
            let tn = type_name(obj, &self.heap, &self.structs);
            return Err(self.throw(
                ExcKind::TypeError,
                format!("`{tn}` does not support subscripts"),
                range,
            ));
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let len = items.len();
                let Value::Int(i) = idx else {
                    return Err(self.throw(
                        ExcKind::TypeError,
                        "list indices must be integers",
                        range,
                    ));
                };
                if i < 0 || (i as usize) >= len {
                    return Err(self.throw(
                        ExcKind::RangeError,
                        format!("index {i} out of bounds for list of length {len}"),
                        range,
                    ));
                }
                let HeapData::List(items) = self.heap.get(id) else {
                    unreachable!("list slot changed kind");
                };
                Ok(items[i as usize])
            }
            HeapData::Dict(dict) => {
                let key = match DictKey::from_value(idx, &self.heap) {
                    Ok(key) => key,
                    Err(err) => return Err(self.throw_simple(err, range)),
                };
                match dict.entries.get(&key) {
                    Some(value) => Ok(*value),
                    None => {
                        let mut repr = String::new();
                        key.render(true, &mut repr);
                        Err(self.throw(
                            ExcKind::KeyError,
                            format!("key {repr} not found"),
                            range,
                        ))
                    }
                }
            }
            HeapData::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let Value::Int(i) = idx else {
                    return Err(self.throw(
                        ExcKind::TypeError,
                        "string indices must be integers",
                        range,
                    ));
                };
                if i < 0 || (i as usize) >= chars.len() {
                    return Err(self.throw(
                        ExcKind::RangeError,
                        format!(
                            "index {i} out of bounds for string of length {}",
                            chars.len()
                        ),
                        range,
                    ));
                }
                let c = chars[i as usize].to_string();
                Ok(self.heap.alloc_str(c))
            }
            other => {
                let tn = other.kind_name().to_owned();
                Err(self.throw(
                    ExcKind::TypeError,
                    format!("`{tn}` does not support subscripts"),
                    range,
                ))
            }
        }
    }

    /// Shared call path for plain calls and pipelines: evaluates the
    /// callee and arguments with rooting, prepending `first` when piping.
    fn eval_call(
        &mut self,
        callee: &ExprLoc,
        args: &[ExprLoc],
        first: Option<Value>,
        range: CodeRange,
    ) -> RunResult<Value> {
        let mark = self.temp_roots.len();
        if let Some(first) = first {
            self.temp_roots.push(first);
        }
        let callee_v = match self.eval(callee) {
            Ok(v) => v,
            Err(err) => {
                self.temp_roots.truncate(mark);
                return Err(err);
            }
        };
        self.temp_roots.push(callee_v);
        let mut values = Vec::with_capacity(args.len() + usize::from(first.is_some()));
        if let Some(first) = first {
            values.push(first);
        }
        for arg in args {
            match self.eval(arg) {
                Ok(v) => {
                    self.temp_roots.push(v);
                    values.push(v);
                }
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            }
        }
        let result = self.call_value(callee_v, values, range);
        self.temp_roots.truncate(mark);
        result
    }

    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        range: CodeRange,
    ) -> RunResult<Value> {
        match callee {
            Value::Builtin(builtin) => builtins::call(self, builtin, args, range),
            Value::NativeFn(id) => {
                let Some(entry) = self.native_fns.get(id.0 as usize) else {
                    return Err(self.throw(
                        ExcKind::NameError,
                        "native function is not registered",
                        range,
                    ));
                };
                let func = entry.func;
                func(self, args)
            }
            Value::Ref(id) => {
                let (def, env) = match self.heap.get(id) {
                    HeapData::Function(fv) => (Rc::clone(&fv.def), fv.env.clone()),
                    other => {
                        let tn = other.kind_name().to_owned();
                        return Err(self.throw(
                            ExcKind::TypeError,
                            format!("`{tn}` is not callable"),
                            range,
                        ));
                    }
                };
                self.call_function(&def, &env, args, range)
            }
            other => {
                let tn = type_name(other, &self.heap, &self.structs);
                Err(self.throw(ExcKind::TypeError, format!("`{tn}` is not callable"), range))
            }
        }
    }

    pub(crate) fn call_function(
        &mut self,
        def: &Rc<FunctionDef>,
        captured: &Environment,
        args: Vec<Value>,
        range: CodeRange,
    ) -> RunResult<Value> {
        let display_name = def.name.clone().unwrap_or_else(|| "<lambda>".to_owned());
        if args.len() != def.params.len() {
            return Err(self.throw(
                ExcKind::ArityError,
                format!(
                    "`{display_name}` expects {} argument(s), got {}",
                    def.params.len(),
                    args.len()
                ),
                range,
            ));
        }
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(self.throw(
                ExcKind::RangeError,
                "maximum call depth exceeded",
                range,
            ));
        }

        // per-call generic specialization by argument inference
        let mut bindings: AHashMap<String, Type> = AHashMap::new();
        if !def.generics.is_empty() {
            for (param, arg) in def.params.iter().zip(args.iter()) {
                if let Type::Named(n) = &param.ty {
                    if def.generics.contains(n) && !bindings.contains_key(n) {
                        bindings.insert(n.clone(), dynamic_type(*arg, &self.heap, &self.structs));
                    }
                }
            }
        }

        let mut bound_args = Vec::with_capacity(args.len());
        for (param, arg) in def.params.iter().zip(args.into_iter()) {
            let ty = if bindings.is_empty() {
                param.ty.clone()
            } else {
                param.ty.substitute(&bindings)
            };
            if ty.is_unchecked() {
                bound_args.push(arg);
                continue;
            }
            if !value_matches(arg, &ty, &self.heap, &self.structs) {
                let actual = type_name(arg, &self.heap, &self.structs);
                return Err(self.throw(
                    ExcKind::TypeError,
                    format!(
                        "parameter `{}` of `{display_name}` expects `{ty}`, got `{actual}`",
                        param.name
                    ),
                    range,
                ));
            }
            let arg = if matches!(ty, Type::Float) {
                match arg {
                    Value::Int(i) => Value::Float(i as f64),
                    other => other,
                }
            } else {
                arg
            };
            bound_args.push(arg);
        }

        self.call_stack.push(Frame {
            name: display_name.clone(),
            file: self.current_file().to_owned(),
            line: range.line,
            col: range.col,
        });
        let fn_env = captured.child();
        for (param, arg) in def.params.iter().zip(bound_args) {
            fn_env.define(param.name.clone(), arg);
        }
        let body_result = self.with_env(fn_env, |i| i.exec_nodes(&def.body));
        self.call_stack.pop();

        // the return signal is consumed here, at the function frame
        let returned = match body_result {
            Ok(()) => Value::Null,
            Err(RunError::Return(v)) => v,
            Err(RunError::Break | RunError::Continue) => {
                return Err(self.throw(
                    ExcKind::UserError,
                    "loop control statement escaped its loop",
                    range,
                ));
            }
            Err(err) => return Err(err),
        };

        let ret_ty = if bindings.is_empty() {
            def.return_type.clone()
        } else {
            def.return_type.substitute(&bindings)
        };
        if ret_ty.is_unchecked() {
            return Ok(returned);
        }
        if !value_matches(returned, &ret_ty, &self.heap, &self.structs) {
            let actual = type_name(returned, &self.heap, &self.structs);
            return Err(self.throw(
                ExcKind::TypeError,
                format!("`{display_name}` must return `{ret_ty}`, got `{actual}`"),
                range,
            ));
        }
        if matches!(ret_ty, Type::Float) {
            if let Value::Int(i) = returned {
                return Ok(Value::Float(i as f64));
            }
        }
        Ok(returned)
    }

    fn eval_struct_lit(
        &mut self,
        name: &str,
        type_args: &[Type],
        fields: &[(String, ExprLoc)],
        range: CodeRange,
    ) -> RunResult<Value> {
        let Some(base_id) = self.structs.lookup(name) else {
            return Err(self.throw(
                ExcKind::NameError,
                format!("unknown struct `{name}`"),
                range,
            ));
        };
        let def_id = match self.structs.specialize(base_id, type_args) {
            Ok(id) => id,
            Err(err) => return Err(self.throw_simple(err, range)),
        };
        let def = Rc::clone(self.structs.def(def_id));
        for (field_name, _) in fields {
            if def.field_index(field_name).is_none() {
                return Err(self.throw(
                    ExcKind::TypeError,
                    format!("struct `{}` has no field `{field_name}`", def.name),
                    range,
                ));
            }
        }
        let mark = self.temp_roots.len();
        let mut values = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let provided = fields
                .iter()
                .find(|(fname, _)| fname == &field.name)
                .map(|(_, expr)| expr);
            let expr = match (provided, &field.default) {
                (Some(expr), _) => expr,
                (None, Some(default)) => default,
                (None, None) => {
                    self.temp_roots.truncate(mark);
                    return Err(self.throw(
                        ExcKind::TypeError,
                        format!("missing field `{}` for struct `{}`", field.name, def.name),
                        range,
                    ));
                }
            };
            let v = match self.eval(expr) {
                Ok(v) => v,
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            };
            let v = match self.check_binding(v, Some(&field.ty), &field.name, range) {
                Ok(v) => v,
                Err(err) => {
                    self.temp_roots.truncate(mark);
                    return Err(err);
                }
            };
            self.temp_roots.push(v);
            values.push(v);
        }
        self.temp_roots.truncate(mark);
        Ok(self.heap.alloc(HeapData::Struct(StructValue {
            def: def_id,
            fields: values,
        })))
    }

    // ---- polyglot ----

    /// Snapshots a block's binding list into isolated payloads, registering
    /// callback stubs for host functions where the language allows it.
    pub(crate) fn snapshot_bindings(
        &mut self,
        names: &[String],
        lang: LangId,
    ) -> Result<(Vec<(String, Payload)>, Vec<u32>), SimpleError> {
        let env = self.env.clone();
        let mut registered = Vec::new();
        let snapshot = env.snapshot(
            names,
            |name, value| {
                let is_function = matches!(
                    value,
                    Value::Ref(id) if matches!(self.heap.get(id), HeapData::Function(_))
                );
                if is_function {
                    if !lang.supports_callbacks() {
                        return Err(SimpleError::new(
                            ExcKind::PolyglotError,
                            format!(
                                "function `{name}` cannot be injected into a {} block",
                                lang.name()
                            ),
                        ));
                    }
                    let id = self.callbacks.register(value, name);
                    registered.push(id);
                    return Ok(Payload::Callback {
                        id,
                        name: name.to_owned(),
                    });
                }
                payload::from_value(value, &self.heap, &self.structs, 0)
            },
            |name| {
                SimpleError::new(ExcKind::NameError, format!("`{name}` is not defined"))
            },
        );
        match snapshot {
            Ok(bindings) => Ok((bindings, registered)),
            Err(err) => {
                for id in registered {
                    self.callbacks.release(id);
                }
                Err(err)
            }
        }
    }

    /// Invokes a registered callback on behalf of a running foreign block.
    pub(crate) fn service_callback(
        &mut self,
        id: u32,
        args: Vec<Payload>,
    ) -> Result<Payload, String> {
        let Some(entry) = self.callbacks.get(id) else {
            return Err(format!("no callback registered with id {id}"));
        };
        if !entry.valid.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(format!("callback `{}` is no longer valid", entry.name));
        }
        let Ok(_guard) = entry.lock.lock() else {
            return Err(format!("callback `{}` is poisoned", entry.name));
        };
        let Value::Ref(func_id) = entry.func else {
            return Err(format!("callback `{}` is not a function", entry.name));
        };
        let def = match self.heap.get(func_id) {
            HeapData::Function(fv) => Rc::clone(&fv.def),
            _ => return Err(format!("callback `{}` is not a function", entry.name)),
        };
        if args.len() != def.params.len() {
            return Err(format!(
                "callback `{}` expects {} argument(s), got {}",
                entry.name,
                def.params.len(),
                args.len()
            ));
        }
        let mark = self.temp_roots.len();
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            let v = payload::to_value(arg, &mut self.heap, &mut self.structs, "host");
            self.temp_roots.push(v);
            values.push(v);
        }
        for (param, v) in def.params.iter().zip(values.iter()) {
            if param.ty.is_unchecked() {
                continue;
            }
            if !value_matches(*v, &param.ty, &self.heap, &self.structs) {
                let actual = type_name(*v, &self.heap, &self.structs);
                self.temp_roots.truncate(mark);
                return Err(format!(
                    "callback `{}` parameter `{}` expects `{}`, got `{actual}`",
                    entry.name, param.name, param.ty
                ));
            }
        }
        let result = self.call_value(entry.func, values, def.range);
        let outcome = match result {
            Ok(v) => {
                self.temp_roots.push(v);
                payload::from_value(v, &self.heap, &self.structs, 0)
                    .map_err(|err| err.message)
            }
            Err(RunError::Exc(exc)) => {
                let exception = self.exception_from_value(exc);
                Err(format!("{}: {}", exception.kind, exception.message))
            }
            Err(_) => Err("callback unwound with a control-flow signal".to_owned()),
        };
        self.temp_roots.truncate(mark);
        outcome
    }

    /// Executes a single inline block on the evaluator thread.
    pub(crate) fn eval_polyglot(&mut self, block: &PolyglotBlock) -> RunResult<Value> {
        let range = block.range;
        let Some(lang) = LangId::from_tag(&block.lang) else {
            return Err(self.throw(
                ExcKind::PolyglotError,
                format!("unknown inline language tag `{}`", block.lang),
                range,
            ));
        };
        let (bindings, callback_ids) = match self.snapshot_bindings(&block.bindings, lang) {
            Ok(snapshot) => snapshot,
            Err(err) => return Err(self.throw_simple(err, range)),
        };
        let timeout = self.config.timeout;
        let outcome = if lang.is_compiled() {
            execute_prepared(
                lang,
                &block.code,
                &bindings,
                timeout,
                &mut crate::polyglot::callback::NoCallbacks,
                self.cache.as_ref(),
            )
        } else {
            let mut host = InterpHost { interp: &mut *self };
            execute_prepared(lang, &block.code, &bindings, timeout, &mut host, None)
        };
        for id in callback_ids {
            self.callbacks.release(id);
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.throw_simple(err, range)),
        };
        if !outcome.passthrough.is_empty() {
            if let Err(err) = self.writer.write(&outcome.passthrough) {
                return Err(self.throw(ExcKind::IOError, err.to_string(), range));
            }
        }
        Ok(payload::to_value(
            &outcome.value,
            &mut self.heap,
            &mut self.structs,
            lang.name(),
        ))
    }
}

/// Callback host backed directly by the interpreter; used on the
/// sequential execution path.
pub(crate) struct InterpHost<'a> {
    pub interp: &'a mut Interpreter,
}

impl CallbackHost for InterpHost<'_> {
    fn invoke(&mut self, id: u32, args: Vec<Payload>) -> Result<Payload, String> {
        self.interp.service_callback(id, args)
    }
}

fn coercion_hint(expected: &Type, actual: &str) -> Option<String> {
    match (expected, actual) {
        (Type::Int, "float") => Some("floats do not narrow implicitly; round or truncate first".to_owned()),
        (Type::Str, _) => Some("only `string` values bind here; render the value first".to_owned()),
        (Type::Float, "string") | (Type::Int, "string") => {
            Some("parse the string into a number before binding it".to_owned())
        }
        _ => None,
    }
}
