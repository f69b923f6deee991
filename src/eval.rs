//! Expression evaluation over a worksheet environment.
//!
//! Arithmetic with an `Undefined` operand yields `Undefined`; `&&` and `||`
//! short-circuit before the right-hand side is evaluated, so `true || 6/0`
//! never divides. Selectors descend through references and flatten across
//! slices.

use crate::ast::{BinaryOp, Expr, Round, Selector, UnaryOp};
use crate::error::{EvalError, WorksheetError};
use crate::number::Number;
use crate::types::Type;
use crate::value::{Slice, Value};
use crate::worksheet::Worksheet;

/// Evaluates an expression. `env` is the worksheet selectors resolve
/// against; constant expressions evaluate without one.
pub(crate) fn eval(expr: &Expr, env: Option<&Worksheet>) -> Result<Value, WorksheetError> {
    match expr {
        Expr::Literal(lit) => Ok(lit.value()),
        Expr::Return(inner) => eval(inner, env),
        Expr::External => Err(EvalError::UnboundExternal.into()),
        Expr::Selector(sel) => resolve_selector(env, sel),
        Expr::Unop { op, expr } => eval_unop(*op, expr, env),
        Expr::Binop { op, lhs, rhs, round } => eval_binop(*op, lhs, rhs, *round, env),
        Expr::Call { callee, args, round } => eval_call(callee, args, *round, env),
    }
}

/// Resolves a plugin's declared dependencies to argument values.
pub(crate) fn plugin_args(ws: &Worksheet, deps: &[String]) -> Result<Vec<Value>, WorksheetError> {
    deps.iter()
        .map(|dep| {
            let sel = Selector(dep.split('.').map(str::to_string).collect());
            resolve_selector(Some(ws), &sel)
        })
        .collect()
}

// ============================================================================
// Selectors
// ============================================================================

fn resolve_selector(env: Option<&Worksheet>, sel: &Selector) -> Result<Value, WorksheetError> {
    let Some(ws) = env else {
        return Err(EvalError::SelectorWithoutWorksheet { selector: sel.to_string() }.into());
    };
    resolve_value(Value::Ws(ws.clone()), sel.segments())
}

fn resolve_value(value: Value, path: &[String]) -> Result<Value, WorksheetError> {
    if path.is_empty() {
        return Ok(value);
    }
    match value {
        Value::Undefined => Ok(Value::Undefined),
        Value::Ws(ws) => {
            let next = ws.read_field_value(&path[0])?;
            resolve_value(next, &path[1..])
        }
        Value::WsRef(r) => {
            let next = r.worksheet().read_field_value(&path[0])?;
            resolve_value(next, &path[1..])
        }
        Value::Slice(slice) => {
            // traverse element-wise and flatten into a slice of the
            // next-level field
            let mut collected = Vec::new();
            for elem in slice.elements() {
                let resolved = resolve_value(elem.value.clone(), path)?;
                match resolved {
                    Value::Slice(inner) => {
                        collected.extend(inner.elements().iter().map(|e| e.value.clone()));
                    }
                    other => collected.push(other),
                }
            }
            let elem_type = collected
                .iter()
                .find(|v| !v.is_undefined())
                .map(Value::type_of)
                .unwrap_or(Type::Undefined);
            let mut out = Slice::new(elem_type);
            for v in collected {
                out.push(v);
            }
            Ok(Value::Slice(out))
        }
        other => Err(EvalError::BadOperand {
            op: format!(".{}", path[0]),
            value: other.to_string(),
        }
        .into()),
    }
}

// ============================================================================
// Operators
// ============================================================================

fn eval_unop(op: UnaryOp, expr: &Expr, env: Option<&Worksheet>) -> Result<Value, WorksheetError> {
    let value = eval(expr, env)?;
    match (op, value) {
        (_, Value::Undefined) => Ok(Value::Undefined),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(n.checked_neg()?)),
        (UnaryOp::Not, other) => {
            Err(EvalError::BadOperand { op: "!".into(), value: other.to_string() }.into())
        }
        (UnaryOp::Neg, other) => {
            Err(EvalError::BadOperand { op: "-".into(), value: other.to_string() }.into())
        }
    }
}

fn eval_binop(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    round: Option<Round>,
    env: Option<&Worksheet>,
) -> Result<Value, WorksheetError> {
    // logic operators evaluate lazily
    match op {
        BinaryOp::Or => return eval_or(lhs, rhs, env),
        BinaryOp::And => return eval_and(lhs, rhs, env),
        _ => {}
    }

    let left = eval(lhs, env)?;
    let right = eval(rhs, env)?;

    let result = match op {
        BinaryOp::Eq | BinaryOp::Ne => {
            if left.is_undefined() || right.is_undefined() {
                Value::Undefined
            } else if !comparable(&left, &right) {
                return Err(EvalError::Incomparable {
                    lhs: left.to_string(),
                    rhs: right.to_string(),
                }
                .into());
            } else {
                let eq = left.equal(&right);
                Value::Bool(if op == BinaryOp::Eq { eq } else { !eq })
            }
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            match (&left, &right) {
                (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
                (Value::Number(a), Value::Number(b)) => {
                    let ord = a.compare(b);
                    let verdict = match op {
                        BinaryOp::Lt => ord.is_lt(),
                        BinaryOp::Le => ord.is_le(),
                        BinaryOp::Gt => ord.is_gt(),
                        BinaryOp::Ge => ord.is_ge(),
                        _ => unreachable!(),
                    };
                    Value::Bool(verdict)
                }
                _ => {
                    return Err(EvalError::Incomparable {
                        lhs: left.to_string(),
                        rhs: right.to_string(),
                    }
                    .into())
                }
            }
        }
        BinaryOp::Add => match (&left, &right) {
            (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
            (Value::Number(a), Value::Number(b)) => Value::Number(a.checked_add(b)?),
            (Value::Text(a), Value::Text(b)) => Value::Text(format!("{}{}", a, b)),
            _ => return Err(bad_arith(op, &left, &right)),
        },
        BinaryOp::Sub => match (&left, &right) {
            (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
            (Value::Number(a), Value::Number(b)) => Value::Number(a.checked_sub(b)?),
            _ => return Err(bad_arith(op, &left, &right)),
        },
        BinaryOp::Mul => match (&left, &right) {
            (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
            (Value::Number(a), Value::Number(b)) => Value::Number(a.checked_mul(b)?),
            _ => return Err(bad_arith(op, &left, &right)),
        },
        BinaryOp::Div => match (&left, &right) {
            (Value::Undefined, _) | (_, Value::Undefined) => Value::Undefined,
            (Value::Number(a), Value::Number(b)) => match round {
                Some(r) => Value::Number(a.div_round(b, r.mode, r.scale)?),
                None => Value::Number(a.div_exact(b)?),
            },
            _ => return Err(bad_arith(op, &left, &right)),
        },
        BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
    };

    // division consumed its clause; everything else rounds the result
    if op != BinaryOp::Div {
        if let Some(r) = round {
            return apply_round(result, r);
        }
    }
    Ok(result)
}

fn eval_or(lhs: &Expr, rhs: &Expr, env: Option<&Worksheet>) -> Result<Value, WorksheetError> {
    let left = eval(lhs, env)?;
    match left {
        Value::Bool(true) => Ok(Value::Bool(true)),
        Value::Bool(false) | Value::Undefined => {
            let right = eval(rhs, env)?;
            match (left, right) {
                (_, Value::Bool(true)) => Ok(Value::Bool(true)),
                (Value::Bool(false), Value::Bool(false)) => Ok(Value::Bool(false)),
                (_, Value::Bool(_)) | (_, Value::Undefined) => Ok(Value::Undefined),
                (_, other) => {
                    Err(EvalError::BadOperand { op: "||".into(), value: other.to_string() }.into())
                }
            }
        }
        other => Err(EvalError::BadOperand { op: "||".into(), value: other.to_string() }.into()),
    }
}

fn eval_and(lhs: &Expr, rhs: &Expr, env: Option<&Worksheet>) -> Result<Value, WorksheetError> {
    let left = eval(lhs, env)?;
    match left {
        Value::Bool(false) => Ok(Value::Bool(false)),
        Value::Bool(true) | Value::Undefined => {
            let right = eval(rhs, env)?;
            match (left, right) {
                (_, Value::Bool(false)) => Ok(Value::Bool(false)),
                (Value::Bool(true), Value::Bool(true)) => Ok(Value::Bool(true)),
                (_, Value::Bool(_)) | (_, Value::Undefined) => Ok(Value::Undefined),
                (_, other) => {
                    Err(EvalError::BadOperand { op: "&&".into(), value: other.to_string() }.into())
                }
            }
        }
        other => Err(EvalError::BadOperand { op: "&&".into(), value: other.to_string() }.into()),
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Text(_), Value::Text(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::Slice(_), Value::Slice(_))
            | (Value::Ws(_) | Value::WsRef(_), Value::Ws(_) | Value::WsRef(_))
    )
}

fn bad_arith(op: BinaryOp, left: &Value, right: &Value) -> WorksheetError {
    let offender = if matches!(left, Value::Number(_)) { right } else { left };
    EvalError::BadOperand { op: op.symbol().to_string(), value: offender.to_string() }.into()
}

fn apply_round(value: Value, round: Round) -> Result<Value, WorksheetError> {
    match value {
        Value::Undefined => Ok(Value::Undefined),
        Value::Number(n) => Ok(Value::Number(n.round(round.mode, round.scale)?)),
        other => Err(EvalError::BadOperand { op: "round".into(), value: other.to_string() }.into()),
    }
}

// ============================================================================
// Builtin calls
// ============================================================================

fn eval_call(
    callee: &Selector,
    args: &[Expr],
    round: Option<Round>,
    env: Option<&Worksheet>,
) -> Result<Value, WorksheetError> {
    let segments = callee.segments();
    let name = segments.last().expect("selector has segments").as_str();

    // method style: the receiver prefix becomes the first argument
    let mut values = Vec::with_capacity(args.len() + 1);
    if segments.len() > 1 {
        let receiver = Selector(segments[..segments.len() - 1].to_vec());
        values.push(resolve_selector(env, &receiver)?);
    }
    for arg in args {
        values.push(eval(arg, env)?);
    }

    let result = match name {
        "len" => builtin_len(&values)?,
        "sum" => builtin_sum(&values)?,
        "avg" => return builtin_avg(&values, round),
        "first_of" => values
            .iter()
            .find(|v| !v.is_undefined())
            .cloned()
            .unwrap_or(Value::Undefined),
        other => return Err(EvalError::UnknownFunction { name: other.to_string() }.into()),
    };

    match round {
        Some(r) => apply_round(result, r),
        None => Ok(result),
    }
}

fn builtin_len(args: &[Value]) -> Result<Value, WorksheetError> {
    match args {
        [Value::Undefined] => Ok(Value::Undefined),
        [Value::Slice(s)] => Ok(Value::int(s.len() as i64)),
        [other] => {
            Err(EvalError::BadOperand { op: "len".into(), value: other.to_string() }.into())
        }
        _ => Err(EvalError::BadOperand { op: "len".into(), value: format!("{} arguments", args.len()) }
            .into()),
    }
}

/// Flattens numeric arguments; slices contribute their elements. Returns
/// `None` when any operand is undefined.
fn flatten_numbers(args: &[Value], op: &str) -> Result<Option<Vec<Number>>, WorksheetError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Value::Undefined => return Ok(None),
            Value::Number(n) => out.push(*n),
            Value::Slice(s) => {
                let inner: Vec<Value> = s.elements().iter().map(|e| e.value.clone()).collect();
                match flatten_numbers(&inner, op)? {
                    Some(nested) => out.extend(nested),
                    None => return Ok(None),
                }
            }
            other => {
                return Err(
                    EvalError::BadOperand { op: op.to_string(), value: other.to_string() }.into()
                )
            }
        }
    }
    Ok(Some(out))
}

fn builtin_sum(args: &[Value]) -> Result<Value, WorksheetError> {
    let Some(numbers) = flatten_numbers(args, "sum")? else {
        return Ok(Value::Undefined);
    };
    let mut total = Number::from_int(0);
    for n in numbers {
        total = total.checked_add(&n)?;
    }
    Ok(Value::Number(total))
}

fn builtin_avg(args: &[Value], round: Option<Round>) -> Result<Value, WorksheetError> {
    let Some(r) = round else {
        return Err(EvalError::AvgNeedsRound.into());
    };
    let Some(numbers) = flatten_numbers(args, "avg")? else {
        return Ok(Value::Undefined);
    };
    if numbers.is_empty() {
        return Err(EvalError::DivisionByZero.into());
    }
    let mut total = Number::from_int(0);
    for n in &numbers {
        total = total.checked_add(n)?;
    }
    let count = Number::from_int(numbers.len() as i64);
    Ok(Value::Number(total.div_round(&count, r.mode, r.scale)?))
}
