use std::cell::RefCell;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::polyglot::payload::Payload;
use crate::value::Value;

/// A chained scope: a local symbol table plus an optional parent pointer
/// forming a spine from innermost to global.
///
/// `Environment` is a shared handle; cloning it aliases the frame, which is
/// how closures share mutable state with their defining scope.
#[derive(Debug, Clone)]
pub struct Environment(Rc<RefCell<Frame>>);

#[derive(Debug)]
struct Frame {
    vars: AHashMap<String, Value>,
    parent: Option<Environment>,
}

impl Environment {
    pub fn new_global() -> Self {
        Self(Rc::new(RefCell::new(Frame {
            vars: AHashMap::new(),
            parent: None,
        })))
    }

    /// Creates a child scope whose lookups fall through to `self`.
    pub fn child(&self) -> Self {
        Self(Rc::new(RefCell::new(Frame {
            vars: AHashMap::new(),
            parent: Some(self.clone()),
        })))
    }

    /// Binds a name in this frame, shadowing any outer binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().vars.insert(name.into(), value);
    }

    /// Looks a name up, walking parent-ward.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let frame = self.0.borrow();
        if let Some(value) = frame.vars.get(name) {
            return Some(*value);
        }
        frame.parent.as_ref().and_then(|p| p.lookup(name))
    }

    /// Mutates an existing binding wherever it is first found walking
    /// parent-ward. Returns false if the name is unbound.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut frame = self.0.borrow_mut();
        if let Some(slot) = frame.vars.get_mut(name) {
            *slot = value;
            return true;
        }
        match &frame.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    /// All names visible from this scope, innermost first. Used for
    /// `NameError` suggestions.
    pub fn visible_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut seen = AHashSet::new();
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let frame = env.0.borrow();
            for name in frame.vars.keys() {
                if seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
            current = frame.parent.clone();
        }
        names
    }

    /// Deep-copies the named bindings into isolated payloads for the
    /// parallel scheduler and the polyglot adapters.
    ///
    /// `convert` performs the per-value deep copy (and decides what to do
    /// with function values); `missing` produces the error for an unbound
    /// name.
    pub fn snapshot<E>(
        &self,
        names: &[String],
        mut convert: impl FnMut(&str, Value) -> Result<Payload, E>,
        mut missing: impl FnMut(&str) -> E,
    ) -> Result<Vec<(String, Payload)>, E> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.lookup(name) {
                Some(value) => out.push((name.clone(), convert(name, value)?)),
                None => return Err(missing(name)),
            }
        }
        Ok(out)
    }

    /// Stable address of the frame, used to de-duplicate GC traversal.
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Visits every value bound in this frame and its parents, skipping
    /// frames already in `visited`. The GC uses this to treat scope spines
    /// (including closure-captured frames) as roots.
    pub fn for_each_value(&self, visited: &mut AHashSet<usize>, f: &mut impl FnMut(Value)) {
        let mut current = Some(self.clone());
        while let Some(env) = current {
            if !visited.insert(env.ptr_id()) {
                break;
            }
            let frame = env.0.borrow();
            for value in frame.vars.values() {
                f(*value);
            }
            current = frame.parent.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_lookup_walk_parents() {
        let global = Environment::new_global();
        global.define("x", Value::Int(1));
        let inner = global.child();
        assert!(matches!(inner.lookup("x"), Some(Value::Int(1))));
        inner.define("x", Value::Int(2));
        assert!(matches!(inner.lookup("x"), Some(Value::Int(2))));
        assert!(matches!(global.lookup("x"), Some(Value::Int(1))));
    }

    #[test]
    fn assign_mutates_where_first_found() {
        let global = Environment::new_global();
        global.define("x", Value::Int(1));
        let inner = global.child();
        assert!(inner.assign("x", Value::Int(9)));
        assert!(matches!(global.lookup("x"), Some(Value::Int(9))));
        assert!(!inner.assign("missing", Value::Null));
    }

    #[test]
    fn shared_frames_alias() {
        let global = Environment::new_global();
        let a = global.child();
        let b = a.clone();
        a.define("n", Value::Int(5));
        assert!(matches!(b.lookup("n"), Some(Value::Int(5))));
    }
}
