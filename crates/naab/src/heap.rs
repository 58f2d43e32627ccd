use std::rc::Rc;

use ahash::AHashSet;
use indexmap::IndexMap;
use tracing::debug;

use crate::env::Environment;
use crate::expressions::FunctionDef;
use crate::value::{DictKey, Value};

/// Default number of allocations between collection cycles.
/// Overridable via `NAAB_GC_THRESHOLD`.
pub const DEFAULT_GC_THRESHOLD: usize = 1000;

/// Handle to a heap slot. Copying the handle aliases the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Keyed mapping with insertion-order iteration.
#[derive(Debug, Default)]
pub struct Dict {
    pub entries: IndexMap<DictKey, Value, ahash::RandomState>,
}

impl Dict {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::default(),
        }
    }
}

/// A struct instance: definition back-reference plus one value per field.
#[derive(Debug)]
pub struct StructValue {
    pub def: crate::structs::StructDefId,
    pub fields: Vec<Value>,
}

/// A closure: shared definition plus the captured environment frame.
///
/// Closures created in the same scope share the same frame, so they observe
/// each other's mutations.
#[derive(Debug)]
pub struct FunctionValue {
    pub def: Rc<FunctionDef>,
    pub env: Environment,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
    pub inclusive: bool,
}

impl RangeValue {
    pub fn len(&self) -> i64 {
        let upper = if self.inclusive { self.end + 1 } else { self.end };
        (upper - self.start).max(0)
    }
}

/// A loaded module: leaf name plus its exports table.
#[derive(Debug)]
pub struct ModuleValue {
    pub name: String,
    pub exports: IndexMap<String, Value, ahash::RandomState>,
}

/// Opaque stand-in for a foreign object that could not be marshalled.
#[derive(Debug)]
pub struct ForeignHandle {
    pub lang: String,
    pub repr: String,
}

/// Heap-resident payload of a `Value::Ref`.
#[derive(Debug)]
pub enum HeapData {
    Str(String),
    List(Vec<Value>),
    Dict(Dict),
    Struct(StructValue),
    Function(FunctionValue),
    Range(RangeValue),
    Module(ModuleValue),
    Foreign(ForeignHandle),
}

impl HeapData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Struct(_) => "struct",
            Self::Function(_) => "function",
            Self::Range(_) => "range",
            Self::Module(_) => "module",
            Self::Foreign(_) => "foreign",
        }
    }
}

/// Counts reported by [`Heap::stats`], used by tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    pub allocations: u64,
    pub collections: u64,
}

/// The slot-arena heap.
///
/// The arena doubles as the GC's weak registry: every live allocation
/// occupies a slot, so collection can enumerate all objects without any
/// handle keeping them alive. `collect` is a plain mark-and-sweep; marking
/// is iterative (explicit worklist) so arbitrarily deep object graphs
/// cannot overflow the stack.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapData>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    since_gc: usize,
    threshold: usize,
    gc_pending: bool,
    allocations: u64,
    collections: u64,
}

impl Heap {
    pub fn new(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            since_gc: 0,
            threshold: threshold.max(1),
            gc_pending: false,
            allocations: 0,
            collections: 0,
        }
    }

    /// Allocates a heap object and returns the referencing value.
    ///
    /// Once the allocation counter crosses the threshold a collection is
    /// requested; the evaluator performs it at its next safe point, where
    /// every live temporary is either rooted or reachable from a scope.
    pub fn alloc(&mut self, data: HeapData) -> Value {
        self.allocations += 1;
        self.since_gc += 1;
        if self.since_gc >= self.threshold {
            self.gc_pending = true;
        }
        let id = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(data);
                HeapId(idx)
            }
            None => {
                self.slots.push(Some(data));
                self.marks.push(false);
                HeapId(u32::try_from(self.slots.len() - 1).expect("heap slot count overflow"))
            }
        };
        Value::Ref(id)
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        self.alloc(HeapData::Str(s.into()))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapData::List(items))
    }

    pub fn alloc_dict(&mut self, dict: Dict) -> Value {
        self.alloc(HeapData::Dict(dict))
    }

    /// Panics on a vacant slot: values never outlive their slot while
    /// reachable, so a vacant access is an internal invariant violation.
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()]
            .as_ref()
            .expect("internal invariant violated: access to collected heap slot")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()]
            .as_mut()
            .expect("internal invariant violated: access to collected heap slot")
    }

    pub fn gc_pending(&self) -> bool {
        self.gc_pending
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.slots.iter().filter(|s| s.is_some()).count(),
            free_slots: self.free.len(),
            total_slots: self.slots.len(),
            allocations: self.allocations,
            collections: self.collections,
        }
    }

    /// Mark-and-sweep over the weak registry.
    ///
    /// Roots are every value in `root_values` (the evaluator's temporary
    /// root set, module registry, and in-flight error values) plus every
    /// binding reachable from `root_envs` (the active scope spine and all
    /// saved frames). Returns the number of objects freed.
    pub fn collect(&mut self, root_values: &[Value], root_envs: &[Environment]) -> usize {
        let mut worklist: Vec<HeapId> = Vec::new();
        let mut visited_envs: AHashSet<usize> = AHashSet::new();
        let mut pending_envs: Vec<Environment> = Vec::new();

        for value in root_values {
            if let Value::Ref(id) = value {
                worklist.push(*id);
            }
        }
        for env in root_envs {
            pending_envs.push(env.clone());
        }

        loop {
            while let Some(env) = pending_envs.pop() {
                env.for_each_value(&mut visited_envs, &mut |value| {
                    if let Value::Ref(id) = value {
                        worklist.push(id);
                    }
                });
            }
            let Some(id) = worklist.pop() else {
                if pending_envs.is_empty() {
                    break;
                }
                continue;
            };
            let idx = id.index();
            if self.marks[idx] {
                continue;
            }
            let Some(data) = self.slots[idx].as_ref() else {
                continue;
            };
            self.marks[idx] = true;
            match data {
                HeapData::Str(_) | HeapData::Range(_) | HeapData::Foreign(_) => {}
                HeapData::List(items) => {
                    for item in items {
                        if let Value::Ref(child) = item {
                            worklist.push(*child);
                        }
                    }
                }
                HeapData::Dict(dict) => {
                    for value in dict.entries.values() {
                        if let Value::Ref(child) = value {
                            worklist.push(*child);
                        }
                    }
                }
                HeapData::Struct(sv) => {
                    for field in &sv.fields {
                        if let Value::Ref(child) = field {
                            worklist.push(*child);
                        }
                    }
                }
                HeapData::Function(fv) => {
                    pending_envs.push(fv.env.clone());
                }
                HeapData::Module(module) => {
                    for value in module.exports.values() {
                        if let Value::Ref(child) = value {
                            worklist.push(*child);
                        }
                    }
                }
            }
        }

        let mut freed = 0;
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() && !self.marks[idx] {
                self.slots[idx] = None;
                self.free.push(idx as u32);
                freed += 1;
            }
            self.marks[idx] = false;
        }
        self.since_gc = 0;
        self.gc_pending = false;
        self.collections += 1;
        debug!(freed, live = self.slots.len() - self.free.len(), "gc cycle");
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;

    #[test]
    fn alloc_and_reuse_slots() {
        let mut heap = Heap::new(1000);
        let _a = heap.alloc_str("a");
        let b = heap.alloc_str("b");
        let env = Environment::new_global();
        // keep only `b` alive via the environment
        env.define("keep", b);
        let freed = heap.collect(&[], &[env]);
        assert_eq!(freed, 1);
        assert_eq!(heap.stats().live_objects, 1);
        // the freed slot is reused
        let _c = heap.alloc_str("c");
        assert_eq!(heap.stats().total_slots, 2);
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new(1000);
        let a = heap.alloc_list(vec![]);
        let b = heap.alloc_list(vec![a]);
        if let Value::Ref(a_id) = a {
            if let HeapData::List(items) = heap.get_mut(a_id) {
                items.push(b);
            }
        }
        // a <-> b cycle, unreachable from any root
        let freed = heap.collect(&[], &[]);
        assert_eq!(freed, 2);
    }

    #[test]
    fn rooted_values_survive() {
        let mut heap = Heap::new(1000);
        let a = heap.alloc_list(vec![]);
        let freed = heap.collect(&[a], &[]);
        assert_eq!(freed, 0);
    }

    #[test]
    fn threshold_requests_collection() {
        let mut heap = Heap::new(3);
        heap.alloc_str("x");
        heap.alloc_str("y");
        assert!(!heap.gc_pending());
        heap.alloc_str("z");
        assert!(heap.gc_pending());
        heap.collect(&[], &[]);
        assert!(!heap.gc_pending());
    }
}
