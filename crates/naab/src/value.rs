use std::fmt::Write as _;

use crate::exception::{ExcKind, SimpleError};
use crate::expressions::BinaryOp;
use crate::heap::{Heap, HeapData, HeapId};
use crate::structs::StructRegistry;
use crate::types::Type;

/// Maximum traversal depth for structural operations (equality, rendering,
/// marshalling). Bounds recursion over pathological or cyclic data.
pub const MAX_DATA_DEPTH: usize = 64;

/// Primary runtime value.
///
/// Small immediate values are stored inline; everything heap-allocated
/// (strings, lists, dicts, structs, closures, ranges, modules, foreign
/// handles) lives in the arena and is referenced via `Ref(HeapId)`.
/// `Value` is `Copy`: copying a `Ref` aliases the underlying object, which
/// is exactly the sharing the language exposes for lists and dicts.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ref(HeapId),
    Builtin(Builtin),
    NativeFn(NativeFnId),
}

/// Builtins that are part of the evaluator's lexical environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Typeof,
    GcCollect,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Typeof => "typeof",
            Self::GcCollect => "gc_collect",
        }
    }
}

/// Index into the interpreter's table of host-registered native functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFnId(pub u32);

/// A dict key. Only primitives and strings have defined hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Float keys hash by bit pattern.
    Float(u64),
    Str(String),
}

impl DictKey {
    pub fn from_value(value: Value, heap: &Heap) -> Result<Self, SimpleError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Int(i) => Ok(Self::Int(i)),
            Value::Float(f) => Ok(Self::Float(f.to_bits())),
            Value::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => Ok(Self::Str(s.clone())),
                other => Err(SimpleError::new(
                    ExcKind::TypeError,
                    format!("{} is not hashable as a dict key", other.kind_name()),
                )),
            },
            Value::Builtin(_) | Value::NativeFn(_) => Err(SimpleError::new(
                ExcKind::TypeError,
                "function is not hashable as a dict key",
            )),
        }
    }

    /// Rematerializes the key as a value; string keys allocate.
    pub fn to_value(&self, heap: &mut Heap) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Self::Str(s) => heap.alloc_str(s.clone()),
        }
    }

    /// Type check for dict keys, mirroring `value_matches` for the subset
    /// of value shapes a key can take.
    pub fn matches(&self, ty: &Type) -> bool {
        match ty {
            Type::Any => true,
            Type::Nullable(inner) => matches!(self, Self::Null) || self.matches(inner),
            Type::Union(members) => members.iter().any(|m| self.matches(m)),
            Type::Int => matches!(self, Self::Int(_)),
            Type::Float => matches!(self, Self::Int(_) | Self::Float(_)),
            Type::Bool => matches!(self, Self::Bool(_)),
            Type::Str => matches!(self, Self::Str(_)),
            _ => false,
        }
    }

    pub fn render(&self, repr: bool, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(bits) => push_float(f64::from_bits(*bits), out),
            Self::Str(s) => {
                if repr {
                    push_str_repr(s, out);
                } else {
                    out.push_str(s);
                }
            }
        }
    }
}

/// Truthiness: non-zero numerics, non-empty strings/lists/dicts, `true`,
/// and every other non-null object are truthy.
pub fn truthy(value: Value, heap: &Heap) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Int(i) => i != 0,
        Value::Float(f) => f != 0.0,
        Value::Builtin(_) | Value::NativeFn(_) => true,
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => !s.is_empty(),
            HeapData::List(items) => !items.is_empty(),
            HeapData::Dict(d) => !d.entries.is_empty(),
            _ => true,
        },
    }
}

/// The value's dynamic type name, as shown by `typeof` and in `TypeError`
/// messages. Structs report their (possibly specialized) definition name.
pub fn type_name(value: Value, heap: &Heap, structs: &StructRegistry) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(_) => "bool".to_owned(),
        Value::Int(_) => "int".to_owned(),
        Value::Float(_) => "float".to_owned(),
        Value::Builtin(_) | Value::NativeFn(_) => "function".to_owned(),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(_) => "string".to_owned(),
            HeapData::List(_) => "list".to_owned(),
            HeapData::Dict(_) => "dict".to_owned(),
            HeapData::Struct(sv) => structs.def(sv.def).name.clone(),
            HeapData::Function(_) => "function".to_owned(),
            HeapData::Range(_) => "range".to_owned(),
            HeapData::Module(_) => "module".to_owned(),
            HeapData::Foreign(_) => "foreign".to_owned(),
        },
    }
}

/// The value's dynamic type descriptor, used for call-site generic
/// inference. Container element types are not inspected.
pub fn dynamic_type(value: Value, heap: &Heap, structs: &StructRegistry) -> Type {
    match value {
        Value::Null => Type::Any,
        Value::Bool(_) => Type::Bool,
        Value::Int(_) => Type::Int,
        Value::Float(_) => Type::Float,
        Value::Builtin(_) | Value::NativeFn(_) => Type::Function {
            params: vec![],
            ret: Box::new(Type::Any),
        },
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(_) => Type::Str,
            HeapData::List(_) => Type::List(Box::new(Type::Any)),
            HeapData::Dict(_) => Type::Dict(Box::new(Type::Any), Box::new(Type::Any)),
            HeapData::Struct(sv) => Type::Named(structs.def(sv.def).name.clone()),
            HeapData::Function(_) => Type::Function {
                params: vec![],
                ret: Box::new(Type::Any),
            },
            _ => Type::Any,
        },
    }
}

fn numeric_pair(lhs: Value, rhs: Value) -> Option<(f64, f64, bool)> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some((a as f64, b as f64, true)),
        (Value::Int(a), Value::Float(b)) => Some((a as f64, b, false)),
        (Value::Float(a), Value::Int(b)) => Some((a, b as f64, false)),
        (Value::Float(a), Value::Float(b)) => Some((a, b, false)),
        _ => None,
    }
}

fn operand_error(
    op: BinaryOp,
    lhs: Value,
    rhs: Value,
    heap: &Heap,
    structs: &StructRegistry,
) -> SimpleError {
    SimpleError::new(
        ExcKind::TypeError,
        format!(
            "unsupported operands for `{}`: {} and {}",
            op.symbol(),
            type_name(lhs, heap, structs),
            type_name(rhs, heap, structs),
        ),
    )
}

/// Evaluates an arithmetic or comparison operator.
///
/// `&&` and `||` never reach here; the evaluator short-circuits them.
/// Arithmetic follows "if either operand is float, the result is float";
/// `+` additionally concatenates two strings or two lists. Integer
/// arithmetic wraps on overflow.
pub fn binary(
    op: BinaryOp,
    lhs: Value,
    rhs: Value,
    heap: &mut Heap,
    structs: &StructRegistry,
) -> Result<Value, SimpleError> {
    match op {
        BinaryOp::Add => {
            if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
                return Ok(Value::Int(a.wrapping_add(b)));
            }
            if let Some((a, b, _)) = numeric_pair(lhs, rhs) {
                return Ok(Value::Float(a + b));
            }
            if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
                match (heap.get(a), heap.get(b)) {
                    (HeapData::Str(x), HeapData::Str(y)) => {
                        let joined = format!("{x}{y}");
                        return Ok(heap.alloc_str(joined));
                    }
                    (HeapData::List(x), HeapData::List(y)) => {
                        let mut joined = x.clone();
                        joined.extend_from_slice(y);
                        return Ok(heap.alloc_list(joined));
                    }
                    _ => {}
                }
            }
            Err(operand_error(op, lhs, rhs, heap, structs))
        }
        BinaryOp::Sub | BinaryOp::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match op {
                BinaryOp::Sub => a.wrapping_sub(b),
                _ => a.wrapping_mul(b),
            })),
            _ => match numeric_pair(lhs, rhs) {
                Some((a, b, _)) => Ok(Value::Float(match op {
                    BinaryOp::Sub => a - b,
                    _ => a * b,
                })),
                None => Err(operand_error(op, lhs, rhs, heap, structs)),
            },
        },
        BinaryOp::Div => match numeric_pair(lhs, rhs) {
            Some((_, b, _)) if b == 0.0 => {
                Err(SimpleError::new(ExcKind::DivisionByZero, "division by zero"))
            }
            Some((a, b, both_int)) => {
                if both_int {
                    let (Value::Int(x), Value::Int(y)) = (lhs, rhs) else {
                        return Ok(Value::Float(a / b));
                    };
                    Ok(Value::Int(x.wrapping_div(y)))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            None => Err(operand_error(op, lhs, rhs, heap, structs)),
        },
        BinaryOp::Mod => match numeric_pair(lhs, rhs) {
            Some((_, b, _)) if b == 0.0 => {
                Err(SimpleError::new(ExcKind::DivisionByZero, "modulo by zero"))
            }
            Some((a, b, both_int)) => {
                if both_int {
                    let (Value::Int(x), Value::Int(y)) = (lhs, rhs) else {
                        return Ok(Value::Float(a % b));
                    };
                    Ok(Value::Int(x.wrapping_rem(y)))
                } else {
                    Ok(Value::Float(a % b))
                }
            }
            None => Err(operand_error(op, lhs, rhs, heap, structs)),
        },
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs, heap, 0)?)),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(lhs, rhs, heap, 0)?)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ord = if let Some((a, b, _)) = numeric_pair(lhs, rhs) {
                a.partial_cmp(&b)
            } else if let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) {
                match (heap.get(a), heap.get(b)) {
                    (HeapData::Str(x), HeapData::Str(y)) => Some(x.cmp(y)),
                    _ => return Err(operand_error(op, lhs, rhs, heap, structs)),
                }
            } else {
                return Err(operand_error(op, lhs, rhs, heap, structs));
            };
            let Some(ord) = ord else {
                // NaN comparisons are always false.
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::LtEq => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => Err(operand_error(op, lhs, rhs, heap, structs)),
    }
}

/// Structural equality.
///
/// Primitives, strings, lists and dicts compare by content (dicts are
/// order-insensitive); structs compare field-wise when they share a
/// definition and by identity otherwise; functions, modules and foreign
/// handles compare by identity. Numeric comparison crosses the int/float
/// boundary.
pub fn values_equal(lhs: Value, rhs: Value, heap: &Heap, depth: usize) -> Result<bool, SimpleError> {
    if depth > MAX_DATA_DEPTH {
        return Err(SimpleError::new(
            ExcKind::TypeError,
            "comparison exceeded maximum depth (cyclic data?)",
        ));
    }
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::Builtin(a), Value::Builtin(b)) => Ok(a == b),
        (Value::NativeFn(a), Value::NativeFn(b)) => Ok(a == b),
        (Value::Ref(a), Value::Ref(b)) => {
            if a == b {
                return Ok(true);
            }
            match (heap.get(a), heap.get(b)) {
                (HeapData::Str(x), HeapData::Str(y)) => Ok(x == y),
                (HeapData::List(x), HeapData::List(y)) => {
                    if x.len() != y.len() {
                        return Ok(false);
                    }
                    for (xv, yv) in x.iter().zip(y.iter()) {
                        if !values_equal(*xv, *yv, heap, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                (HeapData::Dict(x), HeapData::Dict(y)) => {
                    if x.entries.len() != y.entries.len() {
                        return Ok(false);
                    }
                    for (k, xv) in &x.entries {
                        match y.entries.get(k) {
                            Some(yv) => {
                                if !values_equal(*xv, *yv, heap, depth + 1)? {
                                    return Ok(false);
                                }
                            }
                            None => return Ok(false),
                        }
                    }
                    Ok(true)
                }
                (HeapData::Struct(x), HeapData::Struct(y)) => {
                    if x.def != y.def {
                        return Ok(false);
                    }
                    for (xv, yv) in x.fields.iter().zip(y.fields.iter()) {
                        if !values_equal(*xv, *yv, heap, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                (HeapData::Range(x), HeapData::Range(y)) => {
                    Ok(x.start == y.start && x.end == y.end && x.inclusive == y.inclusive)
                }
                // Functions, modules and foreign handles: identity only,
                // and `a == b` was already ruled out above.
                _ => Ok(false),
            }
        }
        _ => match numeric_pair(lhs, rhs) {
            Some((a, b, _)) => Ok(a == b),
            None => Ok(false),
        },
    }
}

fn push_float(f: f64, out: &mut String) {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        let _ = write!(out, "{f:.1}");
    } else {
        let _ = write!(out, "{f}");
    }
}

fn push_str_repr(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

/// Renders a value. `repr` quotes strings; `print` uses the bare form for
/// the top-level value and the quoted form inside containers.
pub fn render(
    value: Value,
    heap: &Heap,
    structs: &StructRegistry,
    repr: bool,
    depth: usize,
    out: &mut String,
) -> Result<(), SimpleError> {
    if depth > MAX_DATA_DEPTH {
        return Err(SimpleError::new(
            ExcKind::TypeError,
            "rendering exceeded maximum depth (cyclic data?)",
        ));
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => push_float(f, out),
        Value::Builtin(b) => {
            let _ = write!(out, "<builtin {}>", b.name());
        }
        Value::NativeFn(_) => out.push_str("<native fn>"),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => {
                if repr {
                    push_str_repr(s, out);
                } else {
                    out.push_str(s);
                }
            }
            HeapData::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    render(*item, heap, structs, true, depth + 1, out)?;
                }
                out.push(']');
            }
            HeapData::Dict(d) => {
                out.push('{');
                for (i, (k, v)) in d.entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.render(true, out);
                    out.push_str(": ");
                    render(*v, heap, structs, true, depth + 1, out)?;
                }
                out.push('}');
            }
            HeapData::Struct(sv) => {
                let def = structs.def(sv.def);
                let _ = write!(out, "{} {{ ", def.name);
                for (i, (field, v)) in def.fields.iter().zip(sv.fields.iter()).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}: ", field.name);
                    render(*v, heap, structs, true, depth + 1, out)?;
                }
                out.push_str(" }");
            }
            HeapData::Function(fv) => match &fv.def.name {
                Some(name) => {
                    let _ = write!(out, "<fn {name}>");
                }
                None => out.push_str("<fn>"),
            },
            HeapData::Range(r) => {
                let _ = write!(
                    out,
                    "{}{}{}",
                    r.start,
                    if r.inclusive { "..=" } else { ".." },
                    r.end
                );
            }
            HeapData::Module(m) => {
                let _ = write!(out, "<module {}>", m.name);
            }
            HeapData::Foreign(h) => {
                let _ = write!(out, "<foreign {}: {}>", h.lang, h.repr);
            }
        },
    }
    Ok(())
}

/// Convenience wrapper returning the rendered string.
pub fn render_to_string(
    value: Value,
    heap: &Heap,
    structs: &StructRegistry,
    repr: bool,
) -> Result<String, SimpleError> {
    let mut out = String::new();
    render(value, heap, structs, repr, 0, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn setup() -> (Heap, StructRegistry) {
        (Heap::new(10_000), StructRegistry::default())
    }

    #[test]
    fn int_arithmetic_stays_int() {
        let (mut h, s) = setup();
        let v = binary(BinaryOp::Add, Value::Int(2), Value::Int(3), &mut h, &s).unwrap();
        assert!(matches!(v, Value::Int(5)));
        let v = binary(BinaryOp::Div, Value::Int(7), Value::Int(2), &mut h, &s).unwrap();
        assert!(matches!(v, Value::Int(3)));
    }

    #[test]
    fn float_contaminates() {
        let (mut h, s) = setup();
        let v = binary(BinaryOp::Mul, Value::Int(2), Value::Float(1.5), &mut h, &s).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 3.0));
    }

    #[test]
    fn division_by_zero_raises() {
        let (mut h, s) = setup();
        let err = binary(BinaryOp::Div, Value::Int(1), Value::Int(0), &mut h, &s).unwrap_err();
        assert_eq!(err.kind, ExcKind::DivisionByZero);
        let err =
            binary(BinaryOp::Div, Value::Float(1.0), Value::Float(0.0), &mut h, &s).unwrap_err();
        assert_eq!(err.kind, ExcKind::DivisionByZero);
    }

    #[test]
    fn string_concat_and_mismatch() {
        let (mut h, s) = setup();
        let a = h.alloc_str("foo");
        let b = h.alloc_str("bar");
        let joined = binary(BinaryOp::Add, a, b, &mut h, &s).unwrap();
        assert_eq!(render_to_string(joined, &h, &s, false).unwrap(), "foobar");
        let err = binary(BinaryOp::Add, a, Value::Int(1), &mut h, &s).unwrap_err();
        assert_eq!(err.kind, ExcKind::TypeError);
    }

    #[test]
    fn structural_equality_for_lists() {
        let (mut h, _s) = setup();
        let a = h.alloc_list(vec![Value::Int(1), Value::Int(2)]);
        let b = h.alloc_list(vec![Value::Int(1), Value::Int(2)]);
        let c = h.alloc_list(vec![Value::Int(1)]);
        assert!(values_equal(a, b, &h, 0).unwrap());
        assert!(!values_equal(a, c, &h, 0).unwrap());
    }

    #[test]
    fn floats_render_with_decimal_point() {
        let (h, s) = setup();
        assert_eq!(
            render_to_string(Value::Float(3.0), &h, &s, false).unwrap(),
            "3.0"
        );
        assert_eq!(
            render_to_string(Value::Float(2.5), &h, &s, false).unwrap(),
            "2.5"
        );
    }

    #[test]
    fn truthiness() {
        let (mut h, _s) = setup();
        assert!(!truthy(Value::Null, &h));
        assert!(!truthy(Value::Int(0), &h));
        assert!(truthy(Value::Int(-1), &h));
        let empty = h.alloc_str("");
        assert!(!truthy(empty, &h));
        let full = h.alloc_list(vec![Value::Null]);
        assert!(truthy(full, &h));
    }
}
