//! Runtime values.
//!
//! `Value` is the sum type every field holds. Its `Display` form is
//! canonical: it is used in error messages and is byte-for-byte the literal
//! the store persists (references render as `*:<id>`, slices as
//! `[rank:lit,…]`).

use std::fmt;

use crate::error::TypeError;
use crate::number::Number;
use crate::types::Type;
use crate::worksheet::Worksheet;

/// A reference pinned to the version it was loaded at. Pinned references
/// serve historical reads; unlike live references they never cascade a
/// save or update.
#[derive(Debug, Clone)]
pub struct PinnedRef {
    pub(crate) ws: Worksheet,
    pub(crate) version: i32,
}

impl PinnedRef {
    pub fn worksheet(&self) -> &Worksheet {
        &self.ws
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

/// One element of a slice. Ranks are opaque, unique, and monotonically
/// assigned on append; they survive deletes so siblings never renumber.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceElement {
    pub rank: i64,
    pub value: Value,
}

/// An ordered collection of values of one element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub(crate) elem_type: Type,
    pub(crate) elements: Vec<SliceElement>,
}

impl Slice {
    pub fn new(elem_type: Type) -> Slice {
        Slice { elem_type, elements: Vec::new() }
    }

    pub fn elements(&self) -> &[SliceElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elem_type(&self) -> &Type {
        &self.elem_type
    }

    /// Appends with a rank greater than every existing rank.
    pub(crate) fn push(&mut self, value: Value) {
        let rank = self.elements.last().map_or(1, |e| e.rank + 1);
        self.elements.push(SliceElement { rank, value });
    }

    pub(crate) fn push_ranked(&mut self, rank: i64, value: Value) {
        self.elements.push(SliceElement { rank, value });
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Text(String),
    Bool(bool),
    Number(Number),
    Slice(Slice),
    /// A live, owning reference into the in-memory graph.
    Ws(Worksheet),
    /// A reference loaded for a specific historical version.
    WsRef(PinnedRef),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    pub fn number(mantissa: i128, scale: u8) -> Value {
        Value::Number(Number::new(mantissa, scale))
    }

    pub fn int(value: i64) -> Value {
        Value::Number(Number::from_int(value))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// The type this value carries.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Undefined => Type::Undefined,
            Value::Text(_) => Type::Text,
            Value::Bool(_) => Type::Bool,
            Value::Number(n) => Type::Number(n.scale()),
            Value::Slice(s) => Type::Slice(Box::new(s.elem_type.clone())),
            Value::Ws(ws) => Type::Definition(ws.name()),
            Value::WsRef(r) => Type::Definition(r.ws.name()),
        }
    }

    /// The assignability relation every write is checked against.
    pub fn assignable_to(&self, typ: &Type) -> bool {
        match (self, typ) {
            (Value::Undefined, _) => true,
            (Value::Text(_), Type::Text) => true,
            (Value::Text(s), Type::Enum(e)) => e.members.contains(s),
            (Value::Bool(_), Type::Bool) => true,
            // scale widens, never narrows
            (Value::Number(n), Type::Number(scale)) => n.scale() <= *scale,
            (Value::Slice(s), Type::Slice(elem)) => {
                s.elements.iter().all(|e| e.value.assignable_to(elem))
            }
            (Value::Ws(ws), Type::Definition(name)) => ws.name() == name.as_str(),
            (Value::WsRef(r), Type::Definition(name)) => r.ws.name() == name.as_str(),
            _ => false,
        }
    }

    /// Structural equality with scale-insensitive numbers; worksheet
    /// references compare by identity.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.equal(b),
            (Value::Slice(a), Value::Slice(b)) => {
                a.elements.len() == b.elements.len()
                    && a.elements
                        .iter()
                        .zip(&b.elements)
                        .all(|(x, y)| x.rank == y.rank && x.value.equal(&y.value))
            }
            (Value::Ws(a), Value::Ws(b)) => a.id() == b.id(),
            (Value::WsRef(a), Value::WsRef(b)) => {
                a.ws.id() == b.ws.id() && a.version == b.version
            }
            _ => false,
        }
    }
}

// Strict structural equality, used by parser tests; `equal` above is the
// semantic relation (1.00 == 1), this one is not.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                a.mantissa() == b.mantissa() && a.scale() == b.scale()
            }
            (Value::Slice(a), Value::Slice(b)) => a == b,
            (Value::Ws(a), Value::Ws(b)) => a.id() == b.id(),
            (Value::WsRef(a), Value::WsRef(b)) => {
                a.ws.id() == b.ws.id() && a.version == b.version
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Text(s) => write!(f, "{}", quote_str(s)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Slice(s) => {
                write!(f, "[")?;
                for (i, e) in s.elements.iter().enumerate() {
                    if i != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", e.rank, e.value)?;
                }
                write!(f, "]")
            }
            Value::Ws(ws) => write!(f, "*:{}", ws.id()),
            Value::WsRef(r) => write!(f, "*:{}", r.ws.id()),
        }
    }
}

// ============================================================================
// Host conversions (used by the struct mapper)
// ============================================================================

impl Value {
    pub fn as_text(&self) -> Result<String, TypeError> {
        match self {
            Value::Text(s) => Ok(s.clone()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(cannot_convert(other, "text")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, TypeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(cannot_convert(other, "bool")),
        }
    }

    /// Numbers convert to integers only at scale 0 and when in range.
    pub fn as_i64(&self) -> Result<i64, TypeError> {
        match self {
            Value::Number(n) if n.scale() == 0 => i64::try_from(n.mantissa()).map_err(|_| {
                TypeError::ValueOutOfRange { from: self.to_string(), to: "i64".to_string() }
            }),
            other => Err(cannot_convert(other, "i64")),
        }
    }

    pub fn as_f64(&self) -> Result<f64, TypeError> {
        match self {
            Value::Number(n) => n
                .to_string()
                .parse::<f64>()
                .map_err(|_| cannot_convert(self, "f64")),
            other => Err(cannot_convert(other, "f64")),
        }
    }

    pub fn as_worksheet(&self) -> Result<Worksheet, TypeError> {
        match self {
            Value::Ws(ws) => Ok(ws.clone()),
            Value::WsRef(r) => Ok(r.ws.clone()),
            other => Err(cannot_convert(other, "worksheet")),
        }
    }
}

fn cannot_convert(value: &Value, to: &str) -> TypeError {
    TypeError::CannotConvert { from: value.type_of().to_string(), to: to.to_string() }
}

// ============================================================================
// Text quoting
// ============================================================================

/// Quotes a string in the canonical double-quoted, backslash-escaped form.
pub(crate) fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Reverses `quote_str`. Returns `None` when the input is not a well-formed
/// quoted literal.
pub(crate) fn unquote_str(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            // an unescaped quote can only terminate the literal
            return None;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            _ => return None,
        }
    }
    Some(out)
}
