use serde_json::{Map, Number, Value as Json};

use crate::exception::{ExcKind, SimpleError};
use crate::heap::{Dict, Heap, HeapData};
use crate::structs::StructRegistry;
use crate::value::{DictKey, Value, MAX_DATA_DEPTH};

/// A self-contained, thread-safe copy of a host value.
///
/// Snapshots hand these to worker threads so each block observes a stable,
/// isolated view of its bindings; adapters render them into foreign
/// declarations and parse foreign returns back into them. Conversion to and
/// from the heap happens only on the evaluator thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Payload>),
    Dict(Vec<(String, Payload)>),
    /// A host function injected as an RPC stub; the id indexes the
    /// interpreter's callback registry.
    Callback { id: u32, name: String },
    /// A foreign object that could not be marshalled; carried back to the
    /// host as an opaque handle.
    Foreign { lang: String, repr: String },
    /// The three-field result of a shell block.
    Shell {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
}

/// Deep-copies a host value into a payload.
///
/// Functions are rejected here; the snapshot layer intercepts them first
/// and registers callback stubs where the target language supports them.
pub fn from_value(
    value: Value,
    heap: &Heap,
    structs: &StructRegistry,
    depth: usize,
) -> Result<Payload, SimpleError> {
    if depth > MAX_DATA_DEPTH {
        return Err(SimpleError::new(
            ExcKind::PolyglotError,
            "cannot marshal cyclic or too deeply nested data into a foreign block",
        ));
    }
    match value {
        Value::Null => Ok(Payload::Null),
        Value::Bool(b) => Ok(Payload::Bool(b)),
        Value::Int(i) => Ok(Payload::Int(i)),
        Value::Float(f) => Ok(Payload::Float(f)),
        Value::Builtin(_) | Value::NativeFn(_) => Err(SimpleError::new(
            ExcKind::PolyglotError,
            "builtin functions cannot be injected into a foreign block",
        )),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Ok(Payload::Str(s.clone())),
            HeapData::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(from_value(*item, heap, structs, depth + 1)?);
                }
                Ok(Payload::List(out))
            }
            HeapData::Dict(dict) => {
                let mut out = Vec::with_capacity(dict.entries.len());
                for (k, v) in &dict.entries {
                    let mut key = String::new();
                    k.render(false, &mut key);
                    out.push((key, from_value(*v, heap, structs, depth + 1)?));
                }
                Ok(Payload::Dict(out))
            }
            HeapData::Struct(sv) => {
                // structs cross the boundary as field dicts
                let def = structs.def(sv.def);
                let mut out = Vec::with_capacity(sv.fields.len());
                for (field, v) in def.fields.iter().zip(sv.fields.iter()) {
                    out.push((field.name.clone(), from_value(*v, heap, structs, depth + 1)?));
                }
                Ok(Payload::Dict(out))
            }
            HeapData::Range(r) => {
                let mut out = Vec::new();
                let mut i = r.start;
                while if r.inclusive { i <= r.end } else { i < r.end } {
                    out.push(Payload::Int(i));
                    i += 1;
                }
                Ok(Payload::List(out))
            }
            HeapData::Foreign(h) => Ok(Payload::Foreign {
                lang: h.lang.clone(),
                repr: h.repr.clone(),
            }),
            HeapData::Function(_) => Err(SimpleError::new(
                ExcKind::PolyglotError,
                "functions can only be injected into python and javascript blocks",
            )),
            HeapData::Module(_) => Err(SimpleError::new(
                ExcKind::PolyglotError,
                "modules cannot be injected into a foreign block",
            )),
        },
    }
}

/// Materializes a payload as a host value. Shell results become the
/// adapter-defined `ShellResult` struct.
pub fn to_value(
    payload: &Payload,
    heap: &mut Heap,
    structs: &mut StructRegistry,
    lang: &str,
) -> Value {
    match payload {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Int(i) => Value::Int(*i),
        Payload::Float(f) => Value::Float(*f),
        Payload::Str(s) => heap.alloc_str(s.clone()),
        Payload::List(items) => {
            let values: Vec<Value> = items
                .iter()
                .map(|p| to_value(p, heap, structs, lang))
                .collect();
            heap.alloc_list(values)
        }
        Payload::Dict(entries) => {
            let mut dict = Dict::new();
            for (k, v) in entries {
                let value = to_value(v, heap, structs, lang);
                dict.entries.insert(DictKey::Str(k.clone()), value);
            }
            heap.alloc_dict(dict)
        }
        Payload::Callback { name, .. } => heap.alloc(HeapData::Foreign(crate::heap::ForeignHandle {
            lang: lang.to_owned(),
            repr: format!("callback {name}"),
        })),
        Payload::Foreign { lang, repr } => heap.alloc(HeapData::Foreign(crate::heap::ForeignHandle {
            lang: lang.clone(),
            repr: repr.clone(),
        })),
        Payload::Shell {
            exit_code,
            stdout,
            stderr,
        } => {
            let def = structs.shell_result();
            let out = heap.alloc_str(stdout.clone());
            let err = heap.alloc_str(stderr.clone());
            heap.alloc(HeapData::Struct(crate::heap::StructValue {
                def,
                fields: vec![Value::Int(*exit_code), out, err],
            }))
        }
    }
}

/// Parses a foreign JSON return into a payload.
///
/// Objects carrying the `__naab_handle__` marker come back as foreign
/// handles; integers that fit i64 stay integers.
pub fn from_json(json: &Json, lang: &str) -> Payload {
    match json {
        Json::Null => Payload::Null,
        Json::Bool(b) => Payload::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Payload::Int(i)
            } else {
                Payload::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Payload::Str(s.clone()),
        Json::Array(items) => Payload::List(items.iter().map(|j| from_json(j, lang)).collect()),
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some(Json::String(repr)) = map.get("__naab_handle__") {
                    return Payload::Foreign {
                        lang: lang.to_owned(),
                        repr: repr.clone(),
                    };
                }
            }
            Payload::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), from_json(v, lang)))
                    .collect(),
            )
        }
    }
}

/// Renders a payload as JSON, used for callback arguments and replies.
pub fn to_json(payload: &Payload) -> Json {
    match payload {
        Payload::Null | Payload::Callback { .. } => Json::Null,
        Payload::Bool(b) => Json::Bool(*b),
        Payload::Int(i) => Json::Number(Number::from(*i)),
        Payload::Float(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Payload::Str(s) | Payload::Foreign { repr: s, .. } => Json::String(s.clone()),
        Payload::List(items) => Json::Array(items.iter().map(to_json).collect()),
        Payload::Dict(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), to_json(v));
            }
            Json::Object(map)
        }
        Payload::Shell {
            exit_code,
            stdout,
            stderr,
        } => {
            let mut map = Map::new();
            map.insert("exit_code".to_owned(), Json::Number(Number::from(*exit_code)));
            map.insert("stdout".to_owned(), Json::String(stdout.clone()));
            map.insert("stderr".to_owned(), Json::String(stderr.clone()));
            Json::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_keeps_ints() {
        let json: Json = serde_json::from_str(r#"{"a": 1, "b": [1.5, "x", null]}"#).unwrap();
        let payload = from_json(&json, "python");
        assert_eq!(
            payload,
            Payload::Dict(vec![
                ("a".into(), Payload::Int(1)),
                (
                    "b".into(),
                    Payload::List(vec![
                        Payload::Float(1.5),
                        Payload::Str("x".into()),
                        Payload::Null
                    ])
                ),
            ])
        );
    }

    #[test]
    fn handle_marker_becomes_foreign() {
        let json: Json = serde_json::from_str(r#"{"__naab_handle__": "<object at 0x1>"}"#).unwrap();
        let payload = from_json(&json, "python");
        assert!(matches!(payload, Payload::Foreign { repr, .. } if repr == "<object at 0x1>"));
    }

    #[test]
    fn shell_payload_materializes_as_struct() {
        let mut heap = Heap::new(1000);
        let mut structs = StructRegistry::default();
        let value = to_value(
            &Payload::Shell {
                exit_code: 0,
                stdout: "hi\n".into(),
                stderr: String::new(),
            },
            &mut heap,
            &mut structs,
            "bash",
        );
        let Value::Ref(id) = value else {
            panic!("expected ref");
        };
        let HeapData::Struct(sv) = heap.get(id) else {
            panic!("expected struct");
        };
        assert_eq!(structs.def(sv.def).name, "ShellResult");
        assert!(matches!(sv.fields[0], Value::Int(0)));
    }

    #[test]
    fn cyclic_data_fails_to_marshal() {
        let mut heap = Heap::new(1000);
        let a = heap.alloc_list(vec![]);
        let Value::Ref(a_id) = a else { unreachable!() };
        if let HeapData::List(items) = heap.get_mut(a_id) {
            items.push(a);
        }
        let structs = StructRegistry::default();
        assert!(from_value(a, &heap, &structs, 0).is_err());
    }
}
