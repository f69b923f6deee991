//! Error taxonomy for the worksheets runtime.
//!
//! Each layer of the system has its own error enum; `WorksheetError` is the
//! top-level type most public functions return. Messages are stable and are
//! part of the API: tests assert on them and the parser errors quote the
//! offending token verbatim.

use thiserror::Error;

/// Top-level error returned by most public entry points.
#[derive(Error, Debug)]
pub enum WorksheetError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Malformed DSL source.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("expecting {what}: `{run}` did not match patterns")]
    NoMatch { what: String, run: String },

    #[error("number must terminate with percent if present")]
    PercentPlacement,
}

impl ParseError {
    pub(crate) fn unexpected(expected: impl Into<String>, found: impl Into<String>) -> Self {
        ParseError::Unexpected { expected: expected.into(), found: found.into() }
    }

    pub(crate) fn no_match(what: impl Into<String>, run: impl Into<String>) -> Self {
        ParseError::NoMatch { what: what.into(), run: run.into() }
    }
}

/// Definition-level problems detected while resolving a schema.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("scale cannot be greater than 32")]
    ScaleTooLarge,

    #[error("duplicate type name {name}")]
    DuplicateType { name: String },

    #[error("duplicate field {worksheet}.{field}")]
    DuplicateField { worksheet: String, field: String },

    #[error("duplicate field index {index} in worksheet {worksheet}")]
    DuplicateIndex { worksheet: String, index: i32 },

    #[error("unknown type {name}")]
    UnknownType { name: String },

    #[error("unknown worksheet {name}")]
    UnknownWorksheet { name: String },

    #[error("plugins: unknown worksheet({name})")]
    PluginUnknownWorksheet { name: String },

    #[error("plugins: unknown field {worksheet}.{field}")]
    PluginUnknownField { worksheet: String, field: String },

    #[error("plugins: field {worksheet}.{field} not externally defined")]
    PluginNotExternal { worksheet: String, field: String },

    #[error("plugins: {worksheet}.{field} plugin has no dependencies")]
    PluginNoDependencies { worksheet: String, field: String },

    #[error("plugins: {worksheet}.{field} plugin has incorrect arg {arg}")]
    PluginBadArg { worksheet: String, field: String, arg: String },

    #[error("plugins: missing plugin for {worksheet}.{field}")]
    MissingPlugin { worksheet: String, field: String },

    #[error("computed field {worksheet}.{field} has no arguments")]
    ComputedNoArgs { worksheet: String, field: String },

    #[error("selector {selector} does not resolve in worksheet {worksheet}")]
    UnresolvableSelector { worksheet: String, selector: String },

    #[error("cyclic dependency involving {worksheet}.{field}")]
    CyclicDependency { worksheet: String, field: String },
}

/// A value that does not fit the field it was written to.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TypeError {
    #[error("cannot assign {value} to {typ}")]
    NotAssignable { value: String, typ: String },

    #[error("cannot convert {from} to {to}")]
    CannotConvert { from: String, to: String },

    #[error("cannot convert {from} to {to}, value out of range")]
    ValueOutOfRange { from: String, to: String },
}

/// The wrong operation for a field's kind.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("unknown field {name}")]
    UnknownField { name: String },

    #[error("cannot set computed field {name}")]
    ComputedField { name: String },

    #[error("cannot set slice field {name}, use append")]
    SetOnSlice { name: String },

    #[error("cannot append to non-slice field {name}")]
    AppendOnNonSlice { name: String },

    #[error("cannot delete from non-slice field {name}")]
    DelOnNonSlice { name: String },

    #[error("cannot get slice field {name}, use get_slice")]
    GetOnSlice { name: String },

    #[error("field {name} is not a slice")]
    GetSliceOnNonSlice { name: String },

    #[error("index {index} out of range for field {name}")]
    IndexOutOfRange { name: String, index: usize },
}

/// A constrained field rejected a write; the rollback already happened.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("constraint violation: cannot set {field} to {value}")]
pub struct ConstraintViolation {
    pub field: String,
    pub value: String,
}

/// Expression evaluation failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("division is inexact, a rounding mode is required")]
    InexactDivision,

    #[error("number overflow")]
    Overflow,

    #[error("scale cannot be greater than 32")]
    ScaleTooLarge,

    #[error("cannot compare {lhs} with {rhs}")]
    Incomparable { lhs: String, rhs: String },

    #[error("cannot apply {op} to {value}")]
    BadOperand { op: String, value: String },

    #[error("avg requires a rounding mode")]
    AvgNeedsRound,

    #[error("unknown function {name}")]
    UnknownFunction { name: String },

    #[error("selector {selector} used outside of a worksheet")]
    SelectorWithoutWorksheet { selector: String },

    #[error("external field has no plugin attached")]
    UnboundExternal,

    #[error("plugin failed: {message}")]
    Plugin { message: String },
}

/// Persistence failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("version conflict on worksheet {id}: expected {expected}, found {found}")]
    Conflict { id: uuid::Uuid, expected: i32, found: i32 },

    #[error("worksheet {id} not found")]
    NotFound { id: uuid::Uuid },

    #[error("corrupt persisted literal `{literal}`")]
    CorruptLiteral { literal: String },

    #[error("value present for unknown field index {index} of worksheet {id}")]
    UnknownFieldIndex { id: uuid::Uuid, index: i32 },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
