//! Types, fields, and worksheet definitions.
//!
//! A `Definition` is the schema of one worksheet type: fields addressed both
//! by name and by a stable integer index (the persistence column key). Two
//! indices are reserved on every definition: `-2` for the id and `-1` for
//! the version.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::ast::Expr;
use crate::definitions::ComputedBy;
use crate::error::SchemaError;

/// Reserved field index of the worksheet id.
pub const INDEX_ID: i32 = -2;

/// Reserved field index of the worksheet version.
pub const INDEX_VERSION: i32 = -1;

/// The type of a field or value.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Undefined,
    Text,
    Bool,
    Number(u8),
    Enum(Arc<EnumType>),
    Slice(Box<Type>),
    /// A worksheet type, referred to by name. Names are unique within one
    /// `Definitions`, so name equality is definition identity.
    Definition(String),
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Undefined => write!(f, "undefined"),
            Type::Text => write!(f, "text"),
            Type::Bool => write!(f, "bool"),
            Type::Number(scale) => write!(f, "number[{}]", scale),
            Type::Enum(e) => write!(f, "{}", e.name),
            Type::Slice(elem) => write!(f, "[]{}", elem),
            Type::Definition(name) => write!(f, "{}", name),
        }
    }
}

/// An enumeration of text literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub members: BTreeSet<String>,
}

/// How a field's value comes to be: a compiled expression, an `external`
/// declaration awaiting a plugin, or an attached plugin.
#[derive(Clone)]
pub enum Computed {
    Expr(Expr),
    External,
    Plugin(Arc<dyn ComputedBy>),
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Computed::Expr(e) => f.debug_tuple("Expr").field(e).finish(),
            Computed::External => write!(f, "External"),
            Computed::Plugin(_) => write!(f, "Plugin(..)"),
        }
    }
}

/// One step of the parent walk a dependent recomputation performs: follow
/// `parents[def_name][field_index]` upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpStep {
    pub def_name: String,
    pub field_index: i32,
}

/// A computed field that must be recomputed when this field changes. `up`
/// is the chain of parent hops from the written worksheet to the worksheets
/// holding the computed field; an empty chain means the same worksheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub index: i32,
    pub up: Vec<UpStep>,
}

/// A single field of a definition.
#[derive(Debug, Clone)]
pub struct Field {
    pub index: i32,
    pub name: String,
    pub typ: Type,
    pub computed: Option<Computed>,
    pub constrained: Option<Computed>,
    pub dependents: Vec<Dependent>,
}

impl Field {
    pub fn new(index: i32, name: impl Into<String>, typ: Type) -> Field {
        Field {
            index,
            name: name.into(),
            typ,
            computed: None,
            constrained: None,
            dependents: Vec::new(),
        }
    }

    pub fn is_computed(&self) -> bool {
        self.computed.is_some()
    }

    pub fn is_slice(&self) -> bool {
        matches!(self.typ, Type::Slice(_))
    }
}

/// The schema of one worksheet type.
#[derive(Debug, Clone)]
pub struct Definition {
    name: String,
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    by_index: HashMap<i32, usize>,
}

impl Definition {
    /// Creates a definition carrying only the reserved `id` and `version`
    /// fields.
    pub fn new(name: impl Into<String>) -> Definition {
        let mut def = Definition {
            name: name.into(),
            fields: Vec::new(),
            by_name: HashMap::new(),
            by_index: HashMap::new(),
        };
        def.add_field(Field::new(INDEX_ID, "id", Type::Text))
            .expect("fresh definition accepts reserved fields");
        def.add_field(Field::new(INDEX_VERSION, "version", Type::Number(0)))
            .expect("fresh definition accepts reserved fields");
        def
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_field(&mut self, field: Field) -> Result<(), SchemaError> {
        if self.by_name.contains_key(&field.name) {
            return Err(SchemaError::DuplicateField {
                worksheet: self.name.clone(),
                field: field.name,
            });
        }
        if self.by_index.contains_key(&field.index) {
            return Err(SchemaError::DuplicateIndex { worksheet: self.name.clone(), index: field.index });
        }
        let slot = self.fields.len();
        self.by_name.insert(field.name.clone(), slot);
        self.by_index.insert(field.index, slot);
        self.fields.push(field);
        Ok(())
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_by_index(&self, index: i32) -> Option<&Field> {
        self.by_index.get(&index).map(|&i| &self.fields[i])
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    /// Number of fields including the reserved id and version.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = &mut Field> {
        self.fields.iter_mut()
    }

    pub(crate) fn field_mut_by_index(&mut self, index: i32) -> Option<&mut Field> {
        let slot = *self.by_index.get(&index)?;
        Some(&mut self.fields[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_fields_are_present() {
        let def = Definition::new("simple");
        assert_eq!(def.field_count(), 2);
        assert_eq!(def.field_by_name("id").unwrap().index, INDEX_ID);
        assert_eq!(def.field_by_name("version").unwrap().index, INDEX_VERSION);
        assert_eq!(def.field_by_index(INDEX_VERSION).unwrap().typ, Type::Number(0));
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let mut def = Definition::new("simple");
        def.add_field(Field::new(1, "name", Type::Text)).unwrap();
        let err = def.add_field(Field::new(2, "name", Type::Text)).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { .. }));
        let err = def.add_field(Field::new(1, "other", Type::Text)).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateIndex { .. }));
    }

    #[test]
    fn type_display() {
        assert_eq!(Type::Number(5).to_string(), "number[5]");
        assert_eq!(Type::Slice(Box::new(Type::Bool)).to_string(), "[]bool");
        assert_eq!(Type::Definition("simple".into()).to_string(), "simple");
    }
}
