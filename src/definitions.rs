//! Parsing and resolution of worksheet definitions.
//!
//! `Definitions` is the entry point into the runtime: it parses a source
//! unit, ties forward type references to their definitions, installs
//! plugins on `external` fields, and wires the dependency graph that drives
//! computed-field propagation. A `Definitions` value is immutable once
//! built and safe to share.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::ast::Selector;
use crate::error::{SchemaError, WorksheetError};
use crate::parser::{parse_source, Decl};
use crate::types::{Computed, Definition, Dependent, EnumType, Type, UpStep};
use crate::value::Value;
use crate::worksheet::Worksheet;

/// An externally computed field: a set of selector dependencies and a pure
/// function over their resolved values. Plugins must not mutate worksheets.
pub trait ComputedBy: Send + Sync {
    /// Dotted selector paths this plugin consumes, e.g. `["loan.amount"]`.
    fn args(&self) -> Vec<String>;

    /// Computes the field value from the resolved arguments.
    fn compute(&self, args: &[Value]) -> Value;
}

/// Construction options: plugins per worksheet name per field name.
#[derive(Default)]
pub struct Options {
    pub plugins: HashMap<String, HashMap<String, Arc<dyn ComputedBy>>>,
}

/// A resolved, immutable set of worksheet definitions.
#[derive(Debug, Clone)]
pub struct Definitions {
    defs: HashMap<String, Arc<Definition>>,
    enums: HashMap<String, Arc<EnumType>>,
}

impl Definitions {
    /// Parses and resolves a source unit without plugins.
    pub fn new(source: &str) -> Result<Definitions, WorksheetError> {
        Definitions::new_with_options(source, Options::default())
    }

    /// Parses and resolves a source unit, attaching the given plugins to
    /// fields declared `external`.
    pub fn new_with_options(source: &str, opts: Options) -> Result<Definitions, WorksheetError> {
        let decls = parse_source(source)?;

        let mut defs: HashMap<String, Definition> = HashMap::new();
        let mut enums: HashMap<String, Arc<EnumType>> = HashMap::new();
        for decl in decls {
            match decl {
                Decl::Worksheet(def) => {
                    let name = def.name().to_string();
                    if defs.contains_key(&name) || enums.contains_key(&name) {
                        return Err(SchemaError::DuplicateType { name }.into());
                    }
                    defs.insert(name, def);
                }
                Decl::Enum(e) => {
                    let name = e.name.clone();
                    if defs.contains_key(&name) || enums.contains_key(&name) {
                        return Err(SchemaError::DuplicateType { name }.into());
                    }
                    enums.insert(name, Arc::new(e));
                }
            }
        }

        resolve_types(&mut defs, &enums)?;
        install_plugins(&mut defs, opts)?;
        reject_unbound_externals(&defs)?;
        wire_dependents(&mut defs)?;
        detect_cycles(&defs)?;

        debug!(worksheets = defs.len(), enums = enums.len(), "resolved definitions");

        Ok(Definitions {
            defs: defs.into_iter().map(|(name, def)| (name, Arc::new(def))).collect(),
            enums,
        })
    }

    pub fn def(&self, name: &str) -> Option<Arc<Definition>> {
        self.defs.get(name).cloned()
    }

    pub fn enum_type(&self, name: &str) -> Option<Arc<EnumType>> {
        self.enums.get(name).cloned()
    }

    pub fn worksheet_names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }

    /// Instantiates a worksheet of the named type: fresh id, version 1,
    /// computed fields initialized.
    pub fn new_worksheet(&self, name: &str) -> Result<Worksheet, WorksheetError> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| SchemaError::UnknownWorksheet { name: name.to_string() })?;
        Worksheet::create(def.clone())
    }
}

// ============================================================================
// Resolution passes
// ============================================================================

/// Rewrites named type references into enums or checks they name a
/// definition.
fn resolve_types(
    defs: &mut HashMap<String, Definition>,
    enums: &HashMap<String, Arc<EnumType>>,
) -> Result<(), SchemaError> {
    let def_names: HashSet<String> = defs.keys().cloned().collect();
    for def in defs.values_mut() {
        for field in def.fields_mut() {
            field.typ = resolve_type(&field.typ, &def_names, enums)?;
        }
    }
    Ok(())
}

fn resolve_type(
    typ: &Type,
    def_names: &HashSet<String>,
    enums: &HashMap<String, Arc<EnumType>>,
) -> Result<Type, SchemaError> {
    match typ {
        Type::Slice(elem) => Ok(Type::Slice(Box::new(resolve_type(elem, def_names, enums)?))),
        Type::Definition(name) => {
            if let Some(e) = enums.get(name) {
                Ok(Type::Enum(e.clone()))
            } else if def_names.contains(name) {
                Ok(Type::Definition(name.clone()))
            } else {
                Err(SchemaError::UnknownType { name: name.clone() })
            }
        }
        other => Ok(other.clone()),
    }
}

fn install_plugins(defs: &mut HashMap<String, Definition>, opts: Options) -> Result<(), WorksheetError> {
    for (ws_name, plugins) in opts.plugins {
        if !defs.contains_key(&ws_name) {
            return Err(SchemaError::PluginUnknownWorksheet { name: ws_name }.into());
        }
        for (field_name, plugin) in plugins {
            let args = plugin.args();
            if args.is_empty() {
                return Err(SchemaError::PluginNoDependencies {
                    worksheet: ws_name,
                    field: field_name,
                }
                .into());
            }
            // validate dependencies against the declaring worksheet
            for arg in &args {
                let sel = Selector(arg.split('.').map(str::to_string).collect());
                if resolve_dependency(defs, &ws_name, &sel).is_err() {
                    return Err(SchemaError::PluginBadArg {
                        worksheet: ws_name,
                        field: field_name,
                        arg: arg.clone(),
                    }
                    .into());
                }
            }

            let def = defs.get_mut(&ws_name).expect("worksheet presence checked above");
            let found_index = def.fields().find(|f| f.name == field_name).map(|f| f.index);
            let Some(field) = found_index.and_then(|index| def.field_mut_by_index(index)) else {
                return Err(SchemaError::PluginUnknownField {
                    worksheet: ws_name,
                    field: field_name,
                }
                .into());
            };
            match (&field.computed, &field.constrained) {
                (Some(Computed::External), _) => field.computed = Some(Computed::Plugin(plugin)),
                (_, Some(Computed::External)) => field.constrained = Some(Computed::Plugin(plugin)),
                _ => {
                    return Err(SchemaError::PluginNotExternal {
                        worksheet: ws_name,
                        field: field_name,
                    }
                    .into())
                }
            }
        }
    }
    Ok(())
}

fn reject_unbound_externals(defs: &HashMap<String, Definition>) -> Result<(), SchemaError> {
    for def in defs.values() {
        for field in def.fields() {
            let unbound = matches!(field.computed, Some(Computed::External))
                || matches!(field.constrained, Some(Computed::External));
            if unbound {
                return Err(SchemaError::MissingPlugin {
                    worksheet: def.name().to_string(),
                    field: field.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// A field along a dependency path that must carry a dependent entry.
struct Mark {
    def_name: String,
    field_index: i32,
    up: Vec<UpStep>,
}

/// Resolves one dependency selector from `start`, returning every field
/// visited along the path together with the parent chain that climbs back
/// to the declaring worksheet.
fn resolve_dependency(
    defs: &HashMap<String, Definition>,
    start: &str,
    sel: &Selector,
) -> Result<Vec<Mark>, SchemaError> {
    let unresolvable = || SchemaError::UnresolvableSelector {
        worksheet: start.to_string(),
        selector: sel.to_string(),
    };

    let segments = sel.segments();
    if segments.is_empty() {
        return Err(unresolvable());
    }

    let mut marks = Vec::new();
    let mut cur = start.to_string();
    let mut up: Vec<UpStep> = Vec::new();

    for (pos, segment) in segments.iter().enumerate() {
        let def = defs.get(&cur).ok_or_else(unresolvable)?;
        let field = def.field_by_name(segment).ok_or_else(unresolvable)?;
        marks.push(Mark { def_name: cur.clone(), field_index: field.index, up: up.clone() });

        if pos + 1 == segments.len() {
            break;
        }
        match strip_slices(&field.typ) {
            Type::Definition(next) => {
                let mut next_up = vec![UpStep { def_name: cur.clone(), field_index: field.index }];
                next_up.extend(up);
                up = next_up;
                cur = next.clone();
            }
            _ => return Err(unresolvable()),
        }
    }
    Ok(marks)
}

fn strip_slices(typ: &Type) -> &Type {
    match typ {
        Type::Slice(elem) => strip_slices(elem),
        other => other,
    }
}

/// Builds the inverse dependency graph: every field along a computed
/// field's argument paths learns it has that computed field as a
/// dependent. Constraints are validated but add nothing; they are only
/// rechecked on direct writes.
fn wire_dependents(defs: &mut HashMap<String, Definition>) -> Result<(), WorksheetError> {
    struct Job {
        target_def: String,
        target_index: i32,
        deps: Vec<Selector>,
    }

    let mut jobs = Vec::new();
    for def in defs.values() {
        for field in def.fields() {
            if let Some(computed) = &field.computed {
                let deps = computed_selectors(computed);
                if deps.is_empty() {
                    return Err(SchemaError::ComputedNoArgs {
                        worksheet: def.name().to_string(),
                        field: field.name.clone(),
                    }
                    .into());
                }
                jobs.push(Job {
                    target_def: def.name().to_string(),
                    target_index: field.index,
                    deps,
                });
            }
            if let Some(constraint) = &field.constrained {
                // resolvable or the definition is rejected
                for sel in computed_selectors(constraint) {
                    resolve_dependency(defs, def.name(), &sel)?;
                }
            }
        }
    }

    let mut marks: Vec<(Mark, i32)> = Vec::new();
    for job in &jobs {
        for sel in &job.deps {
            for mark in resolve_dependency(defs, &job.target_def, sel)? {
                marks.push((mark, job.target_index));
            }
        }
    }

    for (mark, target_index) in marks {
        let def = defs.get_mut(&mark.def_name).expect("marked definition exists");
        let field = def
            .field_mut_by_index(mark.field_index)
            .expect("marked field exists");
        let dependent = Dependent { index: target_index, up: mark.up };
        if !field.dependents.contains(&dependent) {
            field.dependents.push(dependent);
        }
    }
    Ok(())
}

fn computed_selectors(computed: &Computed) -> Vec<Selector> {
    match computed {
        Computed::Expr(expr) => {
            let mut out = Vec::new();
            expr.collect_selectors(&mut out);
            out
        }
        Computed::Plugin(plugin) => plugin
            .args()
            .iter()
            .map(|arg| Selector(arg.split('.').map(str::to_string).collect()))
            .collect(),
        Computed::External => Vec::new(),
    }
}

/// Rejects definitions whose computed fields form a recomputation cycle.
fn detect_cycles(defs: &HashMap<String, Definition>) -> Result<(), SchemaError> {
    type Node = (String, i32);

    let mut edges: HashMap<Node, Vec<Node>> = HashMap::new();
    for def in defs.values() {
        for field in def.fields() {
            let from = (def.name().to_string(), field.index);
            for dep in &field.dependents {
                let target_def = dep
                    .up
                    .last()
                    .map(|step| step.def_name.clone())
                    .unwrap_or_else(|| def.name().to_string());
                edges.entry(from.clone()).or_default().push((target_def, dep.index));
            }
        }
    }

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state: HashMap<Node, u8> = HashMap::new();
    fn visit(
        node: &(String, i32),
        edges: &HashMap<(String, i32), Vec<(String, i32)>>,
        state: &mut HashMap<(String, i32), u8>,
        defs: &HashMap<String, Definition>,
    ) -> Result<(), SchemaError> {
        match state.get(node) {
            Some(1) => {
                let field = defs
                    .get(&node.0)
                    .and_then(|d| d.field_by_index(node.1))
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| node.1.to_string());
                return Err(SchemaError::CyclicDependency { worksheet: node.0.clone(), field });
            }
            Some(2) => return Ok(()),
            _ => {}
        }
        state.insert(node.clone(), 1);
        if let Some(nexts) = edges.get(node) {
            for next in nexts {
                visit(next, edges, state, defs)?;
            }
        }
        state.insert(node.clone(), 2);
        Ok(())
    }

    let nodes: Vec<Node> = edges.keys().cloned().collect();
    for node in nodes {
        visit(&node, &edges, &mut state, defs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FullName;

    impl ComputedBy for FullName {
        fn args(&self) -> Vec<String> {
            vec!["first_name".to_string(), "last_name".to_string()]
        }

        fn compute(&self, args: &[Value]) -> Value {
            match (&args[0], &args[1]) {
                (Value::Text(first), Value::Text(last)) => {
                    Value::Text(format!("{} {}", first, last))
                }
                _ => Value::Undefined,
            }
        }
    }

    fn person_src() -> &'static str {
        "worksheet person {1:first_name text 2:last_name text 3:full_name text computed_by { external }}"
    }

    fn with_plugin(plugin: Arc<dyn ComputedBy>) -> Options {
        let mut fields: HashMap<String, Arc<dyn ComputedBy>> = HashMap::new();
        fields.insert("full_name".to_string(), plugin);
        let mut plugins = HashMap::new();
        plugins.insert("person".to_string(), fields);
        Options { plugins }
    }

    #[test]
    fn parses_multiple_declarations() {
        let defs = Definitions::new(
            "worksheet simple {83:name text 91:age number[0]} worksheet with_refs {87:simple simple}",
        )
        .unwrap();
        assert!(defs.def("simple").is_some());
        assert!(defs.def("with_refs").is_some());
        assert_eq!(defs.def("simple").unwrap().field_count(), 4);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Definitions::new("worksheet a {} worksheet a {}").unwrap_err();
        assert_eq!(err.to_string(), "duplicate type name a");
        let err = Definitions::new("enum a {} worksheet a {}").unwrap_err();
        assert_eq!(err.to_string(), "duplicate type name a");
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = Definitions::new("worksheet a {1:b missing_type}").unwrap_err();
        assert_eq!(err.to_string(), "unknown type missing_type");
    }

    #[test]
    fn scale_limit_is_enforced() {
        let err = Definitions::new("worksheet a {1:v number[33]}").unwrap_err();
        assert_eq!(err.to_string(), "scale cannot be greater than 32");
    }

    #[test]
    fn enum_types_resolve() {
        let defs =
            Definitions::new("enum color {\"red\",\"blue\",} worksheet w {1:c color}").unwrap();
        let def = defs.def("w").unwrap();
        assert!(matches!(def.field_by_name("c").unwrap().typ, Type::Enum(_)));
    }

    #[test]
    fn plugin_binding_works_end_to_end() {
        let defs =
            Definitions::new_with_options(person_src(), with_plugin(Arc::new(FullName))).unwrap();
        let ws = defs.new_worksheet("person").unwrap();
        ws.set("first_name", Value::text("Ada")).unwrap();
        ws.set("last_name", Value::text("Lovelace")).unwrap();
        assert_eq!(ws.get("full_name").unwrap(), Value::text("Ada Lovelace"));
    }

    #[test]
    fn plugin_errors() {
        struct NoDeps;
        impl ComputedBy for NoDeps {
            fn args(&self) -> Vec<String> {
                Vec::new()
            }
            fn compute(&self, _: &[Value]) -> Value {
                Value::Undefined
            }
        }
        struct BadArg;
        impl ComputedBy for BadArg {
            fn args(&self) -> Vec<String> {
                vec!["nope".to_string()]
            }
            fn compute(&self, _: &[Value]) -> Value {
                Value::Undefined
            }
        }

        // unknown worksheet
        let mut plugins: HashMap<String, HashMap<String, Arc<dyn ComputedBy>>> = HashMap::new();
        plugins.insert("nope".to_string(), HashMap::new());
        let err = Definitions::new_with_options(person_src(), Options { plugins }).unwrap_err();
        assert_eq!(err.to_string(), "plugins: unknown worksheet(nope)");

        // unknown field
        let mut fields: HashMap<String, Arc<dyn ComputedBy>> = HashMap::new();
        fields.insert("nope".to_string(), Arc::new(FullName));
        let mut plugins = HashMap::new();
        plugins.insert("person".to_string(), fields);
        let err = Definitions::new_with_options(person_src(), Options { plugins }).unwrap_err();
        assert_eq!(err.to_string(), "plugins: unknown field person.nope");

        // field not external
        let mut fields: HashMap<String, Arc<dyn ComputedBy>> = HashMap::new();
        fields.insert("first_name".to_string(), Arc::new(FullName));
        let mut plugins = HashMap::new();
        plugins.insert("person".to_string(), fields);
        let err = Definitions::new_with_options(person_src(), Options { plugins }).unwrap_err();
        assert_eq!(err.to_string(), "plugins: field person.first_name not externally defined");

        // no dependencies
        let err =
            Definitions::new_with_options(person_src(), with_plugin(Arc::new(NoDeps))).unwrap_err();
        assert_eq!(err.to_string(), "plugins: person.full_name plugin has no dependencies");

        // bad argument
        let err =
            Definitions::new_with_options(person_src(), with_plugin(Arc::new(BadArg))).unwrap_err();
        assert_eq!(err.to_string(), "plugins: person.full_name plugin has incorrect arg nope");

        // missing plugin entirely
        let err = Definitions::new(person_src()).unwrap_err();
        assert_eq!(err.to_string(), "plugins: missing plugin for person.full_name");
    }

    #[test]
    fn computed_field_needs_arguments() {
        let err = Definitions::new(
            "worksheet w {1:v number[0] computed_by { return 1 + 2 }}",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "computed field w.v has no arguments");
    }

    #[test]
    fn unresolvable_dependency_is_rejected() {
        let err = Definitions::new(
            "worksheet w {1:a text 2:b text computed_by { return missing }}",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "selector missing does not resolve in worksheet w");

        // descending through a non-reference field
        let err = Definitions::new(
            "worksheet w {1:a text 2:b text computed_by { return a.x }}",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "selector a.x does not resolve in worksheet w");
    }

    #[test]
    fn cyclic_computed_fields_are_rejected() {
        let err = Definitions::new(
            "worksheet w {1:a number[0] computed_by { return b + 1 } 2:b number[0] computed_by { return a + 1 }}",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorksheetError::Schema(SchemaError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn dependents_are_wired_along_the_whole_path() {
        let defs = Definitions::new(
            "worksheet child {5:amount number[0]} \
             worksheet parent {7:kid child 9:total number[0] computed_by { return kid.amount + 1 }}",
        )
        .unwrap();

        // the reference field itself is an ascendant
        let parent = defs.def("parent").unwrap();
        let kid_field = parent.field_by_name("kid").unwrap();
        assert_eq!(kid_field.dependents, vec![Dependent { index: 9, up: vec![] }]);

        // and so is the child field, with the climb back to the parent
        let child = defs.def("child").unwrap();
        let amount = child.field_by_name("amount").unwrap();
        assert_eq!(
            amount.dependents,
            vec![Dependent {
                index: 9,
                up: vec![UpStep { def_name: "parent".to_string(), field_index: 7 }]
            }]
        );
    }

    #[test]
    fn constraints_do_not_add_dependents() {
        let defs = Definitions::new(
            "worksheet w {1:a number[0] 2:b number[0] constrained_by { return a > 0 }}",
        )
        .unwrap();
        let def = defs.def("w").unwrap();
        assert!(def.field_by_name("a").unwrap().dependents.is_empty());
    }
}
