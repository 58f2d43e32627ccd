use std::rc::Rc;

use ahash::AHashMap;

use crate::exception::{ExcKind, SimpleError};
use crate::expressions::{ExprLoc, StructDecl};
use crate::types::Type;

/// Index into the process-wide struct definition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructDefId(u32);

/// A runtime struct definition.
///
/// For a specialization, `name` is the internal `Base_T1_T2…` form, `base`
/// is the generic template's name, and the field types have the generic
/// parameters substituted away.
#[derive(Debug)]
pub struct StructDef {
    pub name: String,
    pub base: String,
    pub generics: Vec<String>,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
    pub default: Option<ExprLoc>,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Registry of struct definitions.
///
/// Definitions live for the duration of the process and are shared by all
/// instances. Specialized forms are cached by internal name, so repeated
/// instantiation with the same type arguments yields the same definition.
#[derive(Debug, Default)]
pub struct StructRegistry {
    defs: Vec<Rc<StructDef>>,
    by_name: AHashMap<String, StructDefId>,
}

impl StructRegistry {
    pub fn def(&self, id: StructDefId) -> &Rc<StructDef> {
        &self.defs[id.0 as usize]
    }

    pub fn lookup(&self, name: &str) -> Option<StructDefId> {
        self.by_name.get(name).copied()
    }

    fn insert(&mut self, def: StructDef) -> StructDefId {
        let id = StructDefId(u32::try_from(self.defs.len()).expect("struct table overflow"));
        self.by_name.insert(def.name.clone(), id);
        self.defs.push(Rc::new(def));
        id
    }

    /// Registers a declaration. Redeclaring a name rebinds it; existing
    /// instances keep the definition they were built with.
    pub fn declare(&mut self, decl: &StructDecl) -> Result<StructDefId, SimpleError> {
        let mut seen = AHashMap::new();
        for field in &decl.fields {
            if seen.insert(field.name.clone(), ()).is_some() {
                return Err(SimpleError::new(
                    ExcKind::TypeError,
                    format!(
                        "duplicate field `{}` in struct `{}`",
                        field.name, decl.name
                    ),
                ));
            }
        }
        Ok(self.insert(StructDef {
            name: decl.name.clone(),
            base: decl.name.clone(),
            generics: decl.generics.clone(),
            fields: decl
                .fields
                .iter()
                .map(|f| FieldDef {
                    name: f.name.clone(),
                    ty: f.ty.clone(),
                    default: f.default.clone(),
                })
                .collect(),
        }))
    }

    /// Produces (or reuses) the specialization of a generic struct for the
    /// given type arguments. The internal name is `Base_T1_T2…`.
    pub fn specialize(
        &mut self,
        base_id: StructDefId,
        type_args: &[Type],
    ) -> Result<StructDefId, SimpleError> {
        let base = self.def(base_id).clone();
        if base.generics.len() != type_args.len() {
            return Err(SimpleError::new(
                ExcKind::TypeError,
                format!(
                    "struct `{}` expects {} type argument(s), got {}",
                    base.name,
                    base.generics.len(),
                    type_args.len()
                ),
            ));
        }
        if type_args.is_empty() {
            return Ok(base_id);
        }
        let mut internal = base.name.clone();
        for arg in type_args {
            internal.push('_');
            internal.push_str(&arg.canonical().replace(' ', ""));
        }
        if let Some(existing) = self.by_name.get(&internal) {
            return Ok(*existing);
        }
        let bindings: AHashMap<String, Type> = base
            .generics
            .iter()
            .cloned()
            .zip(type_args.iter().cloned())
            .collect();
        let fields = base
            .fields
            .iter()
            .map(|f| FieldDef {
                name: f.name.clone(),
                ty: f.ty.substitute(&bindings),
                default: f.default.clone(),
            })
            .collect();
        Ok(self.insert(StructDef {
            name: internal,
            base: base.name.clone(),
            generics: Vec::new(),
            fields,
        }))
    }

    /// The struct definition used for shell-block results.
    pub fn shell_result(&mut self) -> StructDefId {
        if let Some(id) = self.lookup("ShellResult") {
            return id;
        }
        self.insert(StructDef {
            name: "ShellResult".to_owned(),
            base: "ShellResult".to_owned(),
            generics: Vec::new(),
            fields: vec![
                FieldDef {
                    name: "exit_code".to_owned(),
                    ty: Type::Int,
                    default: None,
                },
                FieldDef {
                    name: "stdout".to_owned(),
                    ty: Type::Str,
                    default: None,
                },
                FieldDef {
                    name: "stderr".to_owned(),
                    ty: Type::Str,
                    default: None,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::{CodeRange, FieldDecl, StructDecl};

    fn decl(name: &str, generics: Vec<&str>, fields: Vec<(&str, Type)>) -> StructDecl {
        StructDecl {
            name: name.to_owned(),
            generics: generics.into_iter().map(str::to_owned).collect(),
            fields: fields
                .into_iter()
                .map(|(n, ty)| FieldDecl {
                    name: n.to_owned(),
                    ty,
                    default: None,
                })
                .collect(),
            range: CodeRange::point(1, 1),
        }
    }

    #[test]
    fn specialization_is_cached() {
        let mut reg = StructRegistry::default();
        let base = reg
            .declare(&decl("Box", vec!["T"], vec![("v", Type::Named("T".into()))]))
            .unwrap();
        let a = reg.specialize(base, &[Type::Int]).unwrap();
        let b = reg.specialize(base, &[Type::Int]).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.def(a).name, "Box_int");
        assert_eq!(reg.def(a).fields[0].ty, Type::Int);
        let c = reg.specialize(base, &[Type::Str]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn wrong_arity_is_an_error() {
        let mut reg = StructRegistry::default();
        let base = reg
            .declare(&decl("Pair", vec!["A", "B"], vec![]))
            .unwrap();
        assert!(reg.specialize(base, &[Type::Int]).is_err());
    }

    #[test]
    fn duplicate_field_rejected() {
        let mut reg = StructRegistry::default();
        let bad = decl("P", vec![], vec![("x", Type::Int), ("x", Type::Int)]);
        assert!(reg.declare(&bad).is_err());
    }
}
