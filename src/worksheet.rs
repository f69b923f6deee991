//! The worksheet runtime: typed assignment, slice editing, computed-field
//! propagation, and back-reference maintenance.
//!
//! A `Worksheet` is a cheap-clone handle over shared interior state. The
//! runtime is not internally synchronized: a worksheet must only be mutated
//! from one thread at a time (definitions, by contrast, are immutable and
//! freely shared). Back-references are held weakly so the `parents` index
//! never keeps a graph alive.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use crate::error::{ConstraintViolation, TypeError, UsageError, WorksheetError};
use crate::eval;
use crate::types::{Computed, Definition, Field, Type, UpStep, INDEX_ID, INDEX_VERSION};
use crate::value::{Slice, Value};

/// parents[parent def name][parent field index][parent id] -> parent
type ParentIndex = HashMap<String, HashMap<i32, HashMap<Uuid, Weak<RefCell<WsInner>>>>>;

pub(crate) struct WsInner {
    def: Arc<Definition>,
    data: BTreeMap<i32, Value>,
    orig: BTreeMap<i32, Value>,
    parents: ParentIndex,
}

/// A versioned, typed document instance.
#[derive(Clone)]
pub struct Worksheet {
    inner: Rc<RefCell<WsInner>>,
}

impl fmt::Debug for Worksheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => write!(f, "Worksheet({})", inner.def.name()),
            Err(_) => write!(f, "Worksheet(<in use>)"),
        }
    }
}

impl Worksheet {
    /// A worksheet with no data at all; the store wires its fields in.
    pub(crate) fn uninitialized(def: Arc<Definition>) -> Worksheet {
        Worksheet {
            inner: Rc::new(RefCell::new(WsInner {
                def,
                data: BTreeMap::new(),
                orig: BTreeMap::new(),
                parents: HashMap::new(),
            })),
        }
    }

    /// A fresh worksheet: new id, version 1, computed fields initialized.
    pub(crate) fn create(def: Arc<Definition>) -> Result<Worksheet, WorksheetError> {
        let ws = Worksheet::uninitialized(def);
        {
            let mut inner = ws.inner.borrow_mut();
            inner.data.insert(INDEX_ID, Value::Text(Uuid::new_v4().to_string()));
            inner.data.insert(INDEX_VERSION, Value::int(1));
        }
        ws.init_computed()?;
        Ok(ws)
    }

    fn init_computed(&self) -> Result<(), WorksheetError> {
        let def = self.def();
        for field in def.fields() {
            if field.computed.is_some() {
                let value = self.compute_field(field)?;
                if !value.is_undefined() {
                    self.set_field(field, value)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        let inner = self.inner.borrow();
        match inner.data.get(&INDEX_ID) {
            Some(Value::Text(id)) => {
                Uuid::parse_str(id).expect("worksheet id holds a valid uuid")
            }
            _ => panic!("worksheet is missing its id"),
        }
    }

    pub fn version(&self) -> i32 {
        let inner = self.inner.borrow();
        match inner.data.get(&INDEX_VERSION) {
            Some(Value::Number(n)) if n.scale() == 0 => n.mantissa() as i32,
            _ => panic!("worksheet is missing its version"),
        }
    }

    pub fn name(&self) -> String {
        self.inner.borrow().def.name().to_string()
    }

    pub fn def(&self) -> Arc<Definition> {
        self.inner.borrow().def.clone()
    }

    /// Identity of the underlying document, not of the handle.
    pub fn same_as(&self, other: &Worksheet) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn is_set(&self, name: &str) -> Result<bool, WorksheetError> {
        let field = self.lookup(name)?;
        Ok(self.inner.borrow().data.contains_key(&field.index))
    }

    pub fn get(&self, name: &str) -> Result<Value, WorksheetError> {
        let field = self.lookup(name)?;
        if field.is_slice() {
            return Err(UsageError::GetOnSlice { name: name.to_string() }.into());
        }
        Ok(self.read_index(field.index))
    }

    pub fn get_slice(&self, name: &str) -> Result<Vec<Value>, WorksheetError> {
        let field = self.lookup(name)?;
        if !field.is_slice() {
            return Err(UsageError::GetSliceOnNonSlice { name: name.to_string() }.into());
        }
        match self.read_index(field.index) {
            Value::Slice(s) => Ok(s.elements().iter().map(|e| e.value.clone()).collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Field read for the evaluator: slices come back whole.
    pub(crate) fn read_field_value(&self, name: &str) -> Result<Value, WorksheetError> {
        let field = self.lookup(name)?;
        Ok(self.read_index(field.index))
    }

    fn read_index(&self, index: i32) -> Value {
        self.inner.borrow().data.get(&index).cloned().unwrap_or(Value::Undefined)
    }

    fn lookup(&self, name: &str) -> Result<Field, WorksheetError> {
        let inner = self.inner.borrow();
        inner
            .def
            .field_by_name(name)
            .cloned()
            .ok_or_else(|| UsageError::UnknownField { name: name.to_string() }.into())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub fn set(&self, name: &str, value: Value) -> Result<(), WorksheetError> {
        let field = self.lookup(name)?;
        if field.is_computed() {
            return Err(UsageError::ComputedField { name: name.to_string() }.into());
        }
        if field.is_slice() {
            return Err(UsageError::SetOnSlice { name: name.to_string() }.into());
        }
        self.set_field(&field, value)
    }

    pub fn unset(&self, name: &str) -> Result<(), WorksheetError> {
        self.set(name, Value::Undefined)
    }

    pub fn append(&self, name: &str, value: Value) -> Result<(), WorksheetError> {
        let field = self.lookup(name)?;
        if field.is_computed() {
            return Err(UsageError::ComputedField { name: name.to_string() }.into());
        }
        let Type::Slice(elem_type) = &field.typ else {
            return Err(UsageError::AppendOnNonSlice { name: name.to_string() }.into());
        };
        if !value.assignable_to(elem_type) {
            return Err(TypeError::NotAssignable {
                value: value.to_string(),
                typ: elem_type.to_string(),
            }
            .into());
        }

        let old = self.read_index(field.index);
        let mut slice = match &old {
            Value::Slice(s) => s.clone(),
            _ => Slice::new((**elem_type).clone()),
        };
        slice.push(value);
        let new = Value::Slice(slice);

        self.write_raw(field.index, new.clone());
        self.update_parent_refs(field.index, &old, &new);
        self.propagate(&field)
    }

    pub fn del(&self, name: &str, index: usize) -> Result<(), WorksheetError> {
        let field = self.lookup(name)?;
        if !field.is_slice() {
            return Err(UsageError::DelOnNonSlice { name: name.to_string() }.into());
        }
        let old = self.read_index(field.index);
        let mut slice = match &old {
            Value::Slice(s) if index < s.len() => s.clone(),
            _ => return Err(UsageError::IndexOutOfRange { name: name.to_string(), index }.into()),
        };
        slice.elements.remove(index);
        let new = Value::Slice(slice);

        self.write_raw(field.index, new.clone());
        self.update_parent_refs(field.index, &old, &new);
        self.propagate(&field)
    }

    fn set_field(&self, field: &Field, value: Value) -> Result<(), WorksheetError> {
        if !value.assignable_to(&field.typ) {
            return Err(TypeError::NotAssignable {
                value: value.to_string(),
                typ: field.typ.to_string(),
            }
            .into());
        }

        let old = self.read_index(field.index);
        if old.equal(&value) {
            return Ok(());
        }

        // tentative write, then check the constraint and roll back on failure
        self.write_raw(field.index, value.clone());
        if let Some(constraint) = &field.constrained {
            let verdict = self.run_computed(constraint);
            let holds = matches!(verdict, Ok(Value::Bool(true)));
            if !holds {
                self.write_raw(field.index, old);
                return match verdict {
                    Err(err) => Err(err),
                    Ok(_) => Err(ConstraintViolation {
                        field: field.name.clone(),
                        value: value.to_string(),
                    }
                    .into()),
                };
            }
        }

        self.update_parent_refs(field.index, &old, &value);
        self.propagate(field)
    }

    fn write_raw(&self, index: i32, value: Value) {
        let mut inner = self.inner.borrow_mut();
        if value.is_undefined() {
            inner.data.remove(&index);
        } else {
            inner.data.insert(index, value);
        }
    }

    // ------------------------------------------------------------------------
    // Computed fields
    // ------------------------------------------------------------------------

    pub(crate) fn compute_field(&self, field: &Field) -> Result<Value, WorksheetError> {
        let computed = field.computed.as_ref().expect("field is computed");
        self.run_computed(computed)
    }

    fn run_computed(&self, computed: &Computed) -> Result<Value, WorksheetError> {
        match computed {
            Computed::Expr(expr) => eval::eval(expr, Some(self)),
            Computed::Plugin(plugin) => {
                let args = eval::plugin_args(self, &plugin.args())?;
                Ok(plugin.compute(&args))
            }
            Computed::External => Err(crate::error::EvalError::UnboundExternal.into()),
        }
    }

    /// Recomputes every dependent of `field`, in the same worksheet or in
    /// parents reached through the inverse reference index.
    fn propagate(&self, field: &Field) -> Result<(), WorksheetError> {
        for dependent in &field.dependents {
            for target in self.walk_up(&dependent.up) {
                let target_def = target.def();
                let computed = target_def
                    .field_by_index(dependent.index)
                    .expect("dependent index resolves in its definition");
                trace!(
                    worksheet = %target.name(),
                    field = %computed.name,
                    "recomputing dependent field"
                );
                let value = target.compute_field(computed)?;
                target.set_field(computed, value)?;
            }
        }
        Ok(())
    }

    fn walk_up(&self, up: &[UpStep]) -> Vec<Worksheet> {
        let mut current = vec![self.clone()];
        for step in up {
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for ws in &current {
                let inner = ws.inner.borrow();
                let Some(by_index) = inner.parents.get(&step.def_name) else { continue };
                let Some(by_id) = by_index.get(&step.field_index) else { continue };
                for (id, weak) in by_id {
                    if let Some(rc) = weak.upgrade() {
                        if seen.insert(*id) {
                            next.push(Worksheet { inner: rc });
                        }
                    }
                }
            }
            current = next;
        }
        current
    }

    // ------------------------------------------------------------------------
    // Parent references
    // ------------------------------------------------------------------------

    /// After a value at `index` changed from `old` to `new`, fixes the
    /// `parents` entries of every child worksheet gained or lost.
    fn update_parent_refs(&self, index: i32, old: &Value, new: &Value) {
        let old_children = extract_child_worksheets(old);
        let new_children = extract_child_worksheets(new);
        let old_ids: HashSet<Uuid> = old_children.iter().map(Worksheet::id).collect();
        let new_ids: HashSet<Uuid> = new_children.iter().map(Worksheet::id).collect();

        let writer_name = self.name();
        let writer_id = self.id();

        for child in &old_children {
            if !new_ids.contains(&child.id()) {
                child.remove_parent(&writer_name, index, writer_id);
            }
        }
        for child in &new_children {
            if !old_ids.contains(&child.id()) {
                child.add_parent(&writer_name, index, writer_id, self);
            }
        }
    }

    fn add_parent(&self, def_name: &str, index: i32, parent_id: Uuid, parent: &Worksheet) {
        let weak = Rc::downgrade(&parent.inner);
        let mut inner = self.inner.borrow_mut();
        inner
            .parents
            .entry(def_name.to_string())
            .or_default()
            .entry(index)
            .or_default()
            .insert(parent_id, weak);
    }

    fn remove_parent(&self, def_name: &str, index: i32, parent_id: Uuid) {
        let mut inner = self.inner.borrow_mut();
        let Some(by_index) = inner.parents.get_mut(def_name) else { return };
        let Some(by_id) = by_index.get_mut(&index) else { return };
        by_id.remove(&parent_id);
        if by_id.is_empty() {
            by_index.remove(&index);
        }
        if by_index.is_empty() {
            inner.parents.remove(def_name);
        }
    }

    /// True when `parent` is registered as referencing this worksheet at
    /// `index`.
    pub fn has_parent(&self, parent: &Worksheet, index: i32) -> bool {
        let inner = self.inner.borrow();
        inner
            .parents
            .get(&parent.name())
            .and_then(|by_index| by_index.get(&index))
            .and_then(|by_id| by_id.get(&parent.id()))
            .and_then(Weak::upgrade)
            .is_some_and(|rc| Rc::ptr_eq(&rc, &parent.inner))
    }

    // ------------------------------------------------------------------------
    // Store integration
    // ------------------------------------------------------------------------

    pub(crate) fn data_snapshot(&self) -> BTreeMap<i32, Value> {
        self.inner.borrow().data.clone()
    }

    pub(crate) fn orig_snapshot(&self) -> BTreeMap<i32, Value> {
        self.inner.borrow().orig.clone()
    }

    pub(crate) fn orig_is_empty(&self) -> bool {
        self.inner.borrow().orig.is_empty()
    }

    /// Snapshots `data` into `orig`; called only after a successful
    /// save/update or load.
    pub(crate) fn mark_saved(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.orig = inner.data.clone();
    }

    /// Inserts a loaded value without propagation, rebuilding parent
    /// references as it goes.
    pub(crate) fn load_insert(&self, index: i32, value: Value) -> Result<(), WorksheetError> {
        if self.inner.borrow().def.field_by_index(index).is_none() {
            return Err(crate::error::StorageError::UnknownFieldIndex { id: self.id_or_nil(), index }
                .into());
        }
        self.write_raw(index, value.clone());
        self.update_parent_refs(index, &Value::Undefined, &value);
        Ok(())
    }

    pub(crate) fn has_id(&self) -> bool {
        self.inner.borrow().data.contains_key(&INDEX_ID)
    }

    fn id_or_nil(&self) -> Uuid {
        if self.has_id() {
            self.id()
        } else {
            Uuid::nil()
        }
    }

    pub(crate) fn set_version_raw(&self, version: i32) {
        self.inner
            .borrow_mut()
            .data
            .insert(INDEX_VERSION, Value::int(version as i64));
    }
}

/// Collects every worksheet a value holds, recursing into slices and
/// pinned references.
pub(crate) fn extract_child_worksheets(value: &Value) -> Vec<Worksheet> {
    match value {
        Value::Ws(ws) => vec![ws.clone()],
        Value::WsRef(r) => vec![r.worksheet().clone()],
        Value::Slice(s) => s
            .elements()
            .iter()
            .flat_map(|e| extract_child_worksheets(&e.value))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Definitions;

    fn defs(src: &str) -> Definitions {
        Definitions::new(src).unwrap()
    }

    fn simple() -> Definitions {
        defs("worksheet simple {83:name text 91:age number[0]}")
    }

    #[test]
    fn fresh_worksheet_has_id_and_version() {
        let ws = simple().new_worksheet("simple").unwrap();
        assert_eq!(ws.version(), 1);
        assert_eq!(ws.name(), "simple");
        // the id round-trips through the data map
        assert_eq!(ws.get("id").unwrap(), Value::Text(ws.id().to_string()));
    }

    #[test]
    fn set_get_unset() {
        let ws = simple().new_worksheet("simple").unwrap();
        assert!(!ws.is_set("name").unwrap());
        assert_eq!(ws.get("name").unwrap(), Value::Undefined);

        ws.set("name", Value::text("Alice")).unwrap();
        assert!(ws.is_set("name").unwrap());
        assert_eq!(ws.get("name").unwrap(), Value::text("Alice"));

        ws.unset("name").unwrap();
        assert!(!ws.is_set("name").unwrap());
    }

    #[test]
    fn set_rejects_unknown_and_untyped() {
        let ws = simple().new_worksheet("simple").unwrap();
        let err = ws.set("nope", Value::text("x")).unwrap_err();
        assert_eq!(err.to_string(), "unknown field nope");

        let err = ws.set("age", Value::text("old")).unwrap_err();
        assert_eq!(err.to_string(), "cannot assign \"old\" to number[0]");

        let err = ws.set("age", Value::number(105, 1)).unwrap_err();
        assert_eq!(err.to_string(), "cannot assign 10.5 to number[0]");
    }

    #[test]
    fn set_rejects_computed_fields() {
        let d = defs(
            "worksheet person {1:age number[0] 2:next_age number[0] computed_by { return age + 1 }}",
        );
        let ws = d.new_worksheet("person").unwrap();
        let err = ws.set("next_age", Value::int(7)).unwrap_err();
        assert_eq!(err.to_string(), "cannot set computed field next_age");
    }

    #[test]
    fn computed_fields_follow_their_arguments() {
        let d = defs(
            "worksheet person {1:age number[0] 2:next_age number[0] computed_by { return age + 1 }}",
        );
        let ws = d.new_worksheet("person").unwrap();
        assert_eq!(ws.get("next_age").unwrap(), Value::Undefined);

        ws.set("age", Value::int(41)).unwrap();
        assert_eq!(ws.get("next_age").unwrap(), Value::int(42));

        ws.unset("age").unwrap();
        assert_eq!(ws.get("next_age").unwrap(), Value::Undefined);
    }

    #[test]
    fn computed_chain_within_one_worksheet() {
        let d = defs(
            "worksheet w {1:a number[0] 2:b number[0] computed_by { return a * 2 } 3:c number[0] computed_by { return b + 1 }}",
        );
        let ws = d.new_worksheet("w").unwrap();
        ws.set("a", Value::int(10)).unwrap();
        assert_eq!(ws.get("b").unwrap(), Value::int(20));
        assert_eq!(ws.get("c").unwrap(), Value::int(21));
    }

    #[test]
    fn constrained_field_rolls_back() {
        let d = defs(
            "worksheet w {1:age number[0] constrained_by { return age >= 0 }}",
        );
        let ws = d.new_worksheet("w").unwrap();
        ws.set("age", Value::int(7)).unwrap();

        let err = ws.set("age", Value::int(-1)).unwrap_err();
        assert_eq!(err.to_string(), "constraint violation: cannot set age to -1");
        assert_eq!(ws.get("age").unwrap(), Value::int(7));
    }

    #[test]
    fn constraint_allows_conforming_writes() {
        let d = defs("worksheet w {1:age number[0] constrained_by { return age < 150 }}");
        let ws = d.new_worksheet("w").unwrap();
        ws.set("age", Value::int(120)).unwrap();
        assert_eq!(ws.get("age").unwrap(), Value::int(120));
    }

    #[test]
    fn slice_append_and_del() {
        let d = defs("worksheet w {1:names []text}");
        let ws = d.new_worksheet("w").unwrap();
        assert_eq!(ws.get_slice("names").unwrap(), Vec::<Value>::new());

        ws.append("names", Value::text("a")).unwrap();
        ws.append("names", Value::text("b")).unwrap();
        ws.append("names", Value::text("c")).unwrap();
        assert_eq!(
            ws.get_slice("names").unwrap(),
            vec![Value::text("a"), Value::text("b"), Value::text("c")]
        );

        ws.del("names", 1).unwrap();
        assert_eq!(ws.get_slice("names").unwrap(), vec![Value::text("a"), Value::text("c")]);

        let err = ws.del("names", 5).unwrap_err();
        assert_eq!(err.to_string(), "index 5 out of range for field names");
    }

    #[test]
    fn slice_guards() {
        let d = defs("worksheet w {1:names []text 2:title text}");
        let ws = d.new_worksheet("w").unwrap();
        assert_eq!(
            ws.set("names", Value::text("x")).unwrap_err().to_string(),
            "cannot set slice field names, use append"
        );
        assert_eq!(
            ws.get("names").unwrap_err().to_string(),
            "cannot get slice field names, use get_slice"
        );
        assert_eq!(
            ws.append("title", Value::text("x")).unwrap_err().to_string(),
            "cannot append to non-slice field title"
        );
        assert_eq!(
            ws.append("names", Value::int(5)).unwrap_err().to_string(),
            "cannot assign 5 to text"
        );
    }

    #[test]
    fn len_over_slice_is_computed() {
        let d = defs(
            "worksheet w {1:names []text 2:count number[0] computed_by { return len(names) }}",
        );
        let ws = d.new_worksheet("w").unwrap();
        ws.append("names", Value::text("a")).unwrap();
        ws.append("names", Value::text("b")).unwrap();
        assert_eq!(ws.get("count").unwrap(), Value::int(2));
        ws.del("names", 0).unwrap();
        assert_eq!(ws.get("count").unwrap(), Value::int(1));
    }

    #[test]
    fn enum_fields_accept_members_only() {
        let d = defs(
            "enum color {\"red\",\"blue\",} worksheet w {1:favorite color}",
        );
        let ws = d.new_worksheet("w").unwrap();
        ws.set("favorite", Value::text("red")).unwrap();
        let err = ws.set("favorite", Value::text("green")).unwrap_err();
        assert_eq!(err.to_string(), "cannot assign \"green\" to color");
    }

    #[test]
    fn equal_write_is_a_no_op() {
        // writing an equal value (even at another scale) changes nothing
        let d = defs("worksheet w {1:v number[4]}");
        let ws = d.new_worksheet("w").unwrap();
        ws.set("v", Value::number(1, 0)).unwrap();
        assert_eq!(ws.get("v").unwrap(), Value::number(1, 0));
        ws.set("v", Value::number(10000, 4)).unwrap();
        // still the originally written representation
        assert_eq!(ws.get("v").unwrap(), Value::number(1, 0));
    }
}
