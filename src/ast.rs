//! Expression AST for `computed_by` and `constrained_by` bodies.
//!
//! Literals are scalars only (`Lit`), which keeps the AST and every
//! resolved `Definitions` freely shareable across threads.

use std::fmt;

use crate::number::{Number, RoundingMode};
use crate::value::Value;

/// A scalar literal appearing in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Undefined,
    Text(String),
    Bool(bool),
    Number(Number),
}

impl Lit {
    /// The runtime value this literal denotes.
    pub fn value(&self) -> Value {
        match self {
            Lit::Undefined => Value::Undefined,
            Lit::Text(s) => Value::Text(s.clone()),
            Lit::Bool(b) => Value::Bool(*b),
            Lit::Number(n) => Value::Number(*n),
        }
    }
}

/// A dotted identifier path, e.g. `loan.payments.amount`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector(pub Vec<String>);

impl Selector {
    pub fn single(name: impl Into<String>) -> Selector {
        Selector(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// An explicit rounding clause: `round up 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub mode: RoundingMode,
    pub scale: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Binding strength, low to high. Division binds tighter than
    /// multiplication so an undecorated `a * b / c round m n` rounds the
    /// division.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul => 5,
            BinaryOp::Div => 6,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn from_token(tok: &str) -> Option<BinaryOp> {
        Some(match tok {
            "||" => BinaryOp::Or,
            "&&" => BinaryOp::And,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            _ => return None,
        })
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Lit),
    Selector(Selector),
    Call {
        callee: Selector,
        args: Vec<Expr>,
        round: Option<Round>,
    },
    Unop {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binop {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        round: Option<Round>,
    },
    Return(Box<Expr>),
    /// Parse-time sentinel for `external`; resolved to a plugin or rejected.
    External,
}

impl Expr {
    pub(crate) fn binop(op: BinaryOp, lhs: Expr, rhs: Expr, round: Option<Round>) -> Expr {
        Expr::Binop { op, lhs: Box::new(lhs), rhs: Box::new(rhs), round }
    }

    /// Collects every selector this expression depends on. A call whose
    /// callee has more than one segment is method-style, so the receiver
    /// prefix counts as a dependency; a single-segment callee is a function
    /// name, not a field.
    pub fn collect_selectors(&self, out: &mut Vec<Selector>) {
        match self {
            Expr::Literal(_) | Expr::External => {}
            Expr::Selector(sel) => out.push(sel.clone()),
            Expr::Call { callee, args, .. } => {
                if callee.segments().len() > 1 {
                    out.push(Selector(callee.segments()[..callee.segments().len() - 1].to_vec()));
                }
                for arg in args {
                    arg.collect_selectors(out);
                }
            }
            Expr::Unop { expr, .. } => expr.collect_selectors(out),
            Expr::Binop { lhs, rhs, .. } => {
                lhs.collect_selectors(out);
                rhs.collect_selectors(out);
            }
            Expr::Return(inner) => inner.collect_selectors(out),
        }
    }
}
