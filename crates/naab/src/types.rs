use std::fmt;

use ahash::AHashMap;

use crate::heap::{Heap, HeapData};
use crate::structs::StructRegistry;
use crate::value::Value;

/// A declared type descriptor.
///
/// `Named` covers struct names and, inside generic definitions, the generic
/// parameter names themselves; which one a name means is decided when the
/// surrounding definition is specialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Any,
    Void,
    Int,
    Float,
    Str,
    Bool,
    List(Box<Type>),
    Dict(Box<Type>, Box<Type>),
    Function { params: Vec<Type>, ret: Box<Type> },
    Named(String),
    Union(Vec<Type>),
    Nullable(Box<Type>),
}

impl Type {
    /// Canonical rendering, used in `TypeError` messages and specialized
    /// struct names.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Replaces generic parameter names with their bound types.
    ///
    /// Names without a binding are left untouched so struct names survive.
    pub fn substitute(&self, bindings: &AHashMap<String, Type>) -> Type {
        match self {
            Self::Named(name) => bindings.get(name).cloned().unwrap_or_else(|| self.clone()),
            Self::List(elem) => Self::List(Box::new(elem.substitute(bindings))),
            Self::Dict(k, v) => Self::Dict(
                Box::new(k.substitute(bindings)),
                Box::new(v.substitute(bindings)),
            ),
            Self::Function { params, ret } => Self::Function {
                params: params.iter().map(|p| p.substitute(bindings)).collect(),
                ret: Box::new(ret.substitute(bindings)),
            },
            Self::Union(members) => {
                Self::Union(members.iter().map(|m| m.substitute(bindings)).collect())
            }
            Self::Nullable(inner) => Self::Nullable(Box::new(inner.substitute(bindings))),
            _ => self.clone(),
        }
    }

    /// Whether a value of this declared type may be bound without a check.
    pub fn is_unchecked(&self) -> bool {
        matches!(self, Self::Any | Self::Void)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Void => write!(f, "void"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Str => write!(f, "string"),
            Self::Bool => write!(f, "bool"),
            Self::List(elem) => write!(f, "list<{elem}>"),
            Self::Dict(k, v) => write!(f, "dict<{k}, {v}>"),
            Self::Function { params, ret } => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {ret}")
            }
            Self::Named(name) => write!(f, "{name}"),
            Self::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
            Self::Nullable(inner) => write!(f, "{inner}?"),
        }
    }
}

/// Checks a runtime value against a declared type.
///
/// Rules: `any` matches everything; `T?` matches `null` or whatever `T`
/// matches; unions match any-of; `list<T>` and `dict<K, V>` check every
/// element/entry; a struct name matches the exact definition or any
/// specialization whose internal name begins with `name_`; `fn` types match
/// any function value (signatures are not checked at runtime). An `int`
/// value matches a declared `float` (numeric widening at binding sites).
pub fn value_matches(value: Value, ty: &Type, heap: &Heap, structs: &StructRegistry) -> bool {
    match ty {
        Type::Any => true,
        // A void annotation only ever holds the implicit null.
        Type::Void => matches!(value, Value::Null),
        Type::Int => matches!(value, Value::Int(_)),
        Type::Float => matches!(value, Value::Int(_) | Value::Float(_)),
        Type::Bool => matches!(value, Value::Bool(_)),
        Type::Str => matches!(value, Value::Ref(id) if matches!(heap.get(id), HeapData::Str(_))),
        Type::Nullable(inner) => {
            matches!(value, Value::Null) || value_matches(value, inner, heap, structs)
        }
        Type::Union(members) => members.iter().any(|m| value_matches(value, m, heap, structs)),
        Type::List(elem) => match value {
            Value::Ref(id) => match heap.get(id) {
                HeapData::List(items) => items
                    .iter()
                    .all(|item| value_matches(*item, elem, heap, structs)),
                _ => false,
            },
            _ => false,
        },
        Type::Dict(kt, vt) => match value {
            Value::Ref(id) => match heap.get(id) {
                HeapData::Dict(dict) => dict
                    .entries
                    .iter()
                    .all(|(k, v)| k.matches(kt) && value_matches(*v, vt, heap, structs)),
                _ => false,
            },
            _ => false,
        },
        Type::Function { .. } => match value {
            Value::Builtin(_) | Value::NativeFn(_) => true,
            Value::Ref(id) => matches!(heap.get(id), HeapData::Function(_)),
            _ => false,
        },
        Type::Named(name) => match value {
            Value::Ref(id) => match heap.get(id) {
                HeapData::Struct(sv) => {
                    let def = structs.def(sv.def);
                    def.name == *name || def.name.starts_with(&format!("{name}_"))
                }
                _ => false,
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::structs::StructRegistry;

    fn heap() -> (Heap, StructRegistry) {
        (Heap::new(1000), StructRegistry::default())
    }

    #[test]
    fn primitives_match_their_tag() {
        let (mut h, s) = heap();
        assert!(value_matches(Value::Int(3), &Type::Int, &h, &s));
        assert!(!value_matches(Value::Int(3), &Type::Bool, &h, &s));
        assert!(value_matches(Value::Float(1.5), &Type::Float, &h, &s));
        let sid = h.alloc_str("hi");
        assert!(value_matches(sid, &Type::Str, &h, &s));
    }

    #[test]
    fn int_widens_to_float() {
        let (h, s) = heap();
        assert!(value_matches(Value::Int(3), &Type::Float, &h, &s));
        assert!(!value_matches(Value::Float(3.0), &Type::Int, &h, &s));
    }

    #[test]
    fn nullable_accepts_null_and_base() {
        let (h, s) = heap();
        let ty = Type::Nullable(Box::new(Type::Int));
        assert!(value_matches(Value::Null, &ty, &h, &s));
        assert!(value_matches(Value::Int(1), &ty, &h, &s));
        assert!(!value_matches(Value::Bool(true), &ty, &h, &s));
        assert!(!value_matches(Value::Null, &Type::Int, &h, &s));
    }

    #[test]
    fn union_matches_any_member() {
        let (h, s) = heap();
        let ty = Type::Union(vec![Type::Int, Type::Str]);
        assert!(value_matches(Value::Int(1), &ty, &h, &s));
        assert!(!value_matches(Value::Float(1.0), &ty, &h, &s));
    }

    #[test]
    fn list_checks_every_element() {
        let (mut h, s) = heap();
        let ok = h.alloc_list(vec![Value::Int(1), Value::Int(2)]);
        let bad = h.alloc_list(vec![Value::Int(1), Value::Bool(true)]);
        let ty = Type::List(Box::new(Type::Int));
        assert!(value_matches(ok, &ty, &h, &s));
        assert!(!value_matches(bad, &ty, &h, &s));
    }

    #[test]
    fn canonical_rendering() {
        assert_eq!(Type::List(Box::new(Type::Int)).canonical(), "list<int>");
        assert_eq!(
            Type::Nullable(Box::new(Type::Str)).canonical(),
            "string?"
        );
        assert_eq!(
            Type::Union(vec![Type::Int, Type::Str]).canonical(),
            "int | string"
        );
    }
}
