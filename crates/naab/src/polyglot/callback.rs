use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::value::Value;

/// Sentinel prefix a foreign stub writes to stdout to request a host
/// callback invocation: `__NAAB_CALL__{"id": n, "args": […]}`.
pub const CALL_SENTINEL: &str = "__NAAB_CALL__";

/// One registered host function, invocable from a running foreign block.
///
/// Invocations are serialized through `lock`; `valid` is flipped when the
/// owning block settles so a late request from a straggling process is
/// rejected instead of touching a stale function value.
#[derive(Debug)]
pub struct CallbackEntry {
    pub func: Value,
    pub name: String,
    pub valid: AtomicBool,
    pub lock: Mutex<()>,
}

/// Registry of live callbacks, owned by the interpreter.
///
/// Entries hold host function values and are therefore GC roots for as
/// long as they are valid.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: Vec<Option<Rc<CallbackEntry>>>,
}

impl CallbackRegistry {
    pub fn register(&mut self, func: Value, name: impl Into<String>) -> u32 {
        let entry = Rc::new(CallbackEntry {
            func,
            name: name.into(),
            valid: AtomicBool::new(true),
            lock: Mutex::new(()),
        });
        self.entries.push(Some(entry));
        u32::try_from(self.entries.len() - 1).expect("callback table overflow")
    }

    pub fn get(&self, id: u32) -> Option<Rc<CallbackEntry>> {
        self.entries.get(id as usize).and_then(Clone::clone)
    }

    /// Invalidates and drops a callback once its owning block has settled.
    pub fn release(&mut self, id: u32) {
        if let Some(slot) = self.entries.get_mut(id as usize) {
            if let Some(entry) = slot.take() {
                entry.valid.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Function values of all live callbacks; treated as GC roots.
    pub fn root_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries
            .iter()
            .flatten()
            .map(|entry| entry.func)
    }
}

/// Services callback requests surfacing from a running foreign block.
///
/// The sequential execution path is backed directly by the interpreter;
/// the parallel scheduler substitutes a channel-backed host that forwards
/// requests to the evaluator thread.
pub trait CallbackHost {
    /// Invokes callback `id` with marshalled arguments. Errors are returned
    /// as plain messages and re-raised inside the foreign runtime; they
    /// never cross the boundary as host exceptions.
    fn invoke(
        &mut self,
        id: u32,
        args: Vec<super::payload::Payload>,
    ) -> Result<super::payload::Payload, String>;
}

/// Host for blocks with no function bindings: any request is a protocol
/// violation.
pub struct NoCallbacks;

impl CallbackHost for NoCallbacks {
    fn invoke(
        &mut self,
        id: u32,
        _args: Vec<super::payload::Payload>,
    ) -> Result<super::payload::Payload, String> {
        Err(format!("no callback registered with id {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_invalidates() {
        let mut registry = CallbackRegistry::default();
        let id = registry.register(Value::Null, "f");
        let entry = registry.get(id).unwrap();
        assert!(entry.valid.load(Ordering::SeqCst));
        registry.release(id);
        assert!(!entry.valid.load(Ordering::SeqCst));
        assert!(registry.get(id).is_none());
    }
}
