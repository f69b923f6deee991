//! Wire codec for persisted value literals.
//!
//! Encoding is simply the canonical `Display` form of a value. Decoding
//! stops one step short of a `Value`: references decode to the child's id
//! and are resolved by the session against its identity map once every
//! reachable worksheet is materialized.

use uuid::Uuid;

use crate::error::StorageError;
use crate::number::{Number, MAX_SCALE};
use crate::value::{unquote_str, Value};

/// A decoded literal; `Ref` and nested refs inside `Slice` still need the
/// session to resolve them into worksheets.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Loaded {
    Value(Value),
    Ref(Uuid),
    Slice(Vec<(i64, Loaded)>),
}

impl Loaded {
    /// Ids of every reference this literal mentions.
    pub(crate) fn collect_refs(&self, out: &mut Vec<Uuid>) {
        match self {
            Loaded::Value(_) => {}
            Loaded::Ref(id) => out.push(*id),
            Loaded::Slice(elems) => {
                for (_, elem) in elems {
                    elem.collect_refs(out);
                }
            }
        }
    }
}

pub(crate) fn encode(value: &Value) -> String {
    value.to_string()
}

pub(crate) fn decode(literal: &str) -> Result<Loaded, StorageError> {
    let corrupt = || StorageError::CorruptLiteral { literal: literal.to_string() };

    if let Some(rest) = literal.strip_prefix("*:") {
        let id = Uuid::parse_str(rest).map_err(|_| corrupt())?;
        return Ok(Loaded::Ref(id));
    }
    if literal.starts_with('[') {
        return decode_slice(literal).ok_or_else(corrupt);
    }
    match literal {
        "true" => return Ok(Loaded::Value(Value::Bool(true))),
        "false" => return Ok(Loaded::Value(Value::Bool(false))),
        _ => {}
    }
    if literal.starts_with('"') {
        let text = unquote_str(literal).ok_or_else(corrupt)?;
        return Ok(Loaded::Value(Value::Text(text)));
    }
    decode_number(literal).map(Loaded::Value).ok_or_else(corrupt)
}

fn decode_number(literal: &str) -> Option<Value> {
    let (sign, body) = match literal.strip_prefix('-') {
        Some(rest) => (-1i128, rest),
        None => (1i128, literal),
    };
    if body.is_empty() {
        return None;
    }
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if body.contains('.') && (frac_part.is_empty() || !frac_part.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    if frac_part.len() > MAX_SCALE as usize {
        return None;
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa = sign * digits.parse::<i128>().ok()?;
    Some(Value::Number(Number::new(mantissa, frac_part.len() as u8)))
}

/// Parses `[rank:lit,rank:lit,…]`, respecting quoting and nesting inside
/// element literals.
fn decode_slice(literal: &str) -> Option<Loaded> {
    let inner = literal.strip_prefix('[')?.strip_suffix(']')?;
    let mut elements = Vec::new();
    let mut rest = inner;
    while !rest.is_empty() {
        let colon = rest.find(':')?;
        let rank = rest[..colon].parse::<i64>().ok()?;
        rest = &rest[colon + 1..];
        let end = element_end(rest)?;
        let (lit, remainder) = rest.split_at(end);
        elements.push((rank, decode(lit).ok()?));
        rest = match remainder.strip_prefix(',') {
            Some(next) => next,
            None if remainder.is_empty() => remainder,
            None => return None,
        };
    }
    Some(Loaded::Slice(elements))
}

/// Index one past the end of the first element literal in `s`: the first
/// top-level comma, or the end of input.
fn element_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => depth = depth.checked_sub(1)?,
            b',' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    if in_string || depth != 0 {
        None
    } else {
        Some(s.len())
    }
}
