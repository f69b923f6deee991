//! Recursive-descent parser for worksheet definitions and expressions.
//!
//! Expressions fold with a precedence climb over an operand/operator stack.
//! Division binds tighter than multiplication so that each carries its own
//! rounding clause. A `round` clause attaches to the most recently folded
//! binary operator of its precedence class; a clause with nothing to attach
//! to waits for the next fold, and one left over after a bare primary wraps
//! it as `e + 0` with the rounding on the plus.

use std::collections::VecDeque;

use crate::ast::{BinaryOp, Expr, Lit, Round, Selector, UnaryOp};
use crate::error::{ParseError, SchemaError, WorksheetError};
use crate::lexer::{tokenize, INDEX_RE, NAME_RE, NUMBER_RE};
use crate::number::{Number, RoundingMode, MAX_SCALE};
use crate::types::{Computed, Definition, EnumType, Field, Type};
use crate::value::{unquote_str, Value};

const KEYWORDS: [&str; 16] = [
    "worksheet",
    "enum",
    "text",
    "bool",
    "number",
    "undefined",
    "true",
    "false",
    "external",
    "computed_by",
    "constrained_by",
    "round",
    "up",
    "down",
    "half",
    "return",
];

// Builtins whose signature includes the rounding: the call absorbs one
// postfix clause. For every other call a trailing clause rounds the result
// through the surrounding expression instead.
const FNS_WITH_ROUND: [&str; 1] = ["avg"];

/// A top-level declaration.
#[derive(Debug)]
pub(crate) enum Decl {
    Worksheet(Definition),
    Enum(EnumType),
}

/// Parses a whole source unit.
pub(crate) fn parse_source(src: &str) -> Result<Vec<Decl>, WorksheetError> {
    let mut p = Parser::new(src)?;
    let mut decls = Vec::new();
    while let Some(tok) = p.peek() {
        match tok {
            "worksheet" => {
                p.bump();
                let name = p.expect_name()?;
                decls.push(Decl::Worksheet(p.parse_worksheet(&name)?));
            }
            "enum" => {
                p.bump();
                let name = p.expect_name()?;
                decls.push(Decl::Enum(p.parse_enum(&name)?));
            }
            other => {
                return Err(ParseError::unexpected("worksheet or enum", other).into());
            }
        }
    }
    Ok(decls)
}

pub(crate) struct Parser {
    toks: Vec<String>,
    pos: usize,
}

impl Parser {
    pub(crate) fn new(src: &str) -> Result<Parser, ParseError> {
        Ok(Parser { toks: tokenize(src)?, pos: 0 })
    }

    pub(crate) fn peek(&self) -> Option<&str> {
        self.toks.get(self.pos).map(String::as_str)
    }

    fn bump(&mut self) -> Option<String> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn found(&self) -> String {
        self.peek().unwrap_or("<eof>").to_string()
    }

    fn expect(&mut self, tok: &str) -> Result<(), ParseError> {
        if self.peek() == Some(tok) {
            self.bump();
            Ok(())
        } else {
            Err(ParseError::unexpected(tok, self.found()))
        }
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(tok) if NAME_RE.is_match(tok) && !KEYWORDS.contains(&tok) => {
                Ok(self.bump().unwrap())
            }
            _ => Err(ParseError::unexpected("name", self.found())),
        }
    }

    // ------------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------------

    /// Parses a worksheet body `{ fieldDecl* }`; the name has already been
    /// consumed by the caller.
    pub(crate) fn parse_worksheet(&mut self, name: &str) -> Result<Definition, WorksheetError> {
        self.expect("{")?;
        let mut def = Definition::new(name);
        loop {
            match self.peek() {
                Some("}") => {
                    self.bump();
                    return Ok(def);
                }
                Some(_) => {
                    let field = self.parse_field()?;
                    def.add_field(field)?;
                }
                None => return Err(ParseError::unexpected("index", "<eof>").into()),
            }
        }
    }

    fn parse_field(&mut self) -> Result<Field, WorksheetError> {
        let index = match self.peek() {
            Some(tok) if INDEX_RE.is_match(tok) => {
                let tok = self.bump().unwrap();
                tok.parse::<i32>()
                    .map_err(|_| ParseError::unexpected("index", tok.clone()))?
            }
            _ => return Err(ParseError::unexpected("index", self.found()).into()),
        };
        self.expect(":")?;
        let name = self.expect_name()?;
        let typ = self.parse_type_literal()?;

        let mut field = Field::new(index, name, typ);
        match self.peek() {
            Some("computed_by") => {
                self.bump();
                field.computed = Some(self.parse_computed_block()?);
            }
            Some("constrained_by") => {
                self.bump();
                field.constrained = Some(self.parse_computed_block()?);
            }
            _ => {}
        }
        Ok(field)
    }

    fn parse_computed_block(&mut self) -> Result<Computed, WorksheetError> {
        self.expect("{")?;
        let stmt = self.parse_statement()?;
        self.expect("}")?;
        Ok(match stmt {
            Expr::External => Computed::External,
            other => Computed::Expr(other),
        })
    }

    /// Parses an enum body `{ "a", "b", }`; every element requires a
    /// trailing comma.
    pub(crate) fn parse_enum(&mut self, name: &str) -> Result<EnumType, WorksheetError> {
        self.expect("{")?;
        let mut members = std::collections::BTreeSet::new();
        loop {
            match self.peek() {
                Some("}") => {
                    self.bump();
                    return Ok(EnumType { name: name.to_string(), members });
                }
                Some(tok) if tok.starts_with('"') => {
                    let tok = self.bump().unwrap();
                    let lit = unquote_str(&tok)
                        .ok_or_else(|| ParseError::unexpected("text", tok.clone()))?;
                    self.expect(",")?;
                    members.insert(lit);
                }
                _ => return Err(ParseError::unexpected("text", self.found()).into()),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Type literals
    // ------------------------------------------------------------------------

    pub(crate) fn parse_type_literal(&mut self) -> Result<Type, WorksheetError> {
        match self.peek() {
            Some("undefined") => {
                self.bump();
                Ok(Type::Undefined)
            }
            Some("text") => {
                self.bump();
                Ok(Type::Text)
            }
            Some("bool") => {
                self.bump();
                Ok(Type::Bool)
            }
            Some("number") => {
                self.bump();
                self.expect("[")?;
                let scale = self.parse_scale()?;
                self.expect("]")?;
                Ok(Type::Number(scale))
            }
            Some("[") => {
                self.bump();
                self.expect("]")?;
                let elem = self.parse_type_literal()?;
                Ok(Type::Slice(Box::new(elem)))
            }
            Some(tok) if NAME_RE.is_match(tok) && !KEYWORDS.contains(&tok) => {
                let name = self.bump().unwrap();
                Ok(Type::Definition(name))
            }
            _ => Err(ParseError::unexpected("type", self.found()).into()),
        }
    }

    fn parse_scale(&mut self) -> Result<u8, WorksheetError> {
        match self.peek() {
            Some(tok) if INDEX_RE.is_match(tok) => {
                let tok = self.bump().unwrap();
                match tok.parse::<u128>() {
                    Ok(scale) if scale <= MAX_SCALE as u128 => Ok(scale as u8),
                    _ => Err(SchemaError::ScaleTooLarge.into()),
                }
            }
            _ => Err(ParseError::unexpected("index", self.found()).into()),
        }
    }

    // ------------------------------------------------------------------------
    // Statements and expressions
    // ------------------------------------------------------------------------

    pub(crate) fn parse_statement(&mut self) -> Result<Expr, WorksheetError> {
        match self.peek() {
            Some("external") => {
                self.bump();
                Ok(Expr::External)
            }
            Some("return") => {
                self.bump();
                Ok(Expr::Return(Box::new(self.parse_expression()?)))
            }
            _ => Err(ParseError::unexpected("statement", self.found()).into()),
        }
    }

    pub(crate) fn parse_expression(&mut self) -> Result<Expr, WorksheetError> {
        let mut exps: Vec<Expr> = vec![self.parse_unary()?];
        let mut ops: Vec<BinaryOp> = Vec::new();
        let mut pending: VecDeque<Round> = VecDeque::new();
        let mut last_folded: Option<usize> = None;

        loop {
            let Some(tok) = self.peek() else { break };

            if tok == "round" {
                self.bump();
                let clause = self.parse_round_clause()?;
                let mut attached = false;
                if pending.is_empty() {
                    if let Some(slot) = last_folded {
                        if let Expr::Binop { op, round, .. } = &mut exps[slot] {
                            let same_class = ops
                                .last()
                                .is_none_or(|top| top.precedence() == op.precedence());
                            if round.is_none() && same_class {
                                *round = Some(clause);
                                attached = true;
                            }
                        }
                    }
                }
                if !attached {
                    pending.push_back(clause);
                }
                continue;
            }

            let Some(op) = BinaryOp::from_token(tok) else { break };
            self.bump();

            let mut folded = false;
            while ops.last().is_some_and(|top| top.precedence() >= op.precedence()) {
                fold(&mut exps, &mut ops, &mut pending, &mut last_folded);
                folded = true;
            }
            // a clause that could not reach a fold rounds the bare operand
            if !folded {
                if let Some(clause) = pending.pop_front() {
                    wrap_with_round(&mut exps, clause);
                }
            }
            ops.push(op);
            exps.push(self.parse_unary()?);
        }

        while !ops.is_empty() {
            fold(&mut exps, &mut ops, &mut pending, &mut last_folded);
        }
        while let Some(clause) = pending.pop_front() {
            wrap_with_round(&mut exps, clause);
        }

        debug_assert_eq!(exps.len(), 1);
        Ok(exps.pop().expect("expression parse leaves one operand"))
    }

    fn parse_round_clause(&mut self) -> Result<Round, WorksheetError> {
        let mode = match self.peek() {
            Some("up") => RoundingMode::Up,
            Some("down") => RoundingMode::Down,
            Some("half") => RoundingMode::Half,
            _ => return Err(ParseError::unexpected("up, down, or half", self.found()).into()),
        };
        self.bump();
        let scale = self.parse_scale()?;
        Ok(Round { mode, scale })
    }

    fn parse_unary(&mut self) -> Result<Expr, WorksheetError> {
        match self.peek() {
            Some("!") => {
                self.bump();
                Ok(Expr::Unop { op: UnaryOp::Not, expr: Box::new(self.parse_unary()?) })
            }
            Some("-") => {
                self.bump();
                match self.peek() {
                    Some(tok) if NUMBER_RE.is_match(tok) => {
                        let tok = self.bump().unwrap();
                        Ok(Expr::Literal(number_from_token(&tok, true)?))
                    }
                    _ => Ok(Expr::Unop { op: UnaryOp::Neg, expr: Box::new(self.parse_unary()?) }),
                }
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, WorksheetError> {
        let Some(tok) = self.peek().map(str::to_string) else {
            return Err(ParseError::no_match("expression", "").into());
        };

        if tok == "(" {
            self.bump();
            let expr = self.parse_expression()?;
            self.expect(")")?;
            return Ok(expr);
        }

        if let Some(value) = self.try_parse_scalar_literal()? {
            return Ok(Expr::Literal(value));
        }

        // selectors, possibly a call
        let segments: Vec<&str> = tok.split('.').collect();
        let is_selector = !segments.is_empty()
            && segments.iter().all(|s| NAME_RE.is_match(s))
            && !(segments.len() == 1 && KEYWORDS.contains(&segments[0]));
        if !is_selector {
            if tok.contains('%') && tok.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(ParseError::PercentPlacement.into());
            }
            return Err(ParseError::no_match("expression", tok).into());
        }
        self.bump();
        let callee = Selector(segments.into_iter().map(str::to_string).collect());

        if self.peek() != Some("(") {
            return Ok(Expr::Selector(callee));
        }
        self.bump();

        let mut args = Vec::new();
        if self.peek() == Some(")") {
            self.bump();
        } else {
            loop {
                args.push(self.parse_expression()?);
                match self.peek() {
                    Some(",") => {
                        self.bump();
                        // trailing comma
                        if self.peek() == Some(")") {
                            self.bump();
                            break;
                        }
                    }
                    Some(")") => {
                        self.bump();
                        break;
                    }
                    _ => return Err(ParseError::no_match(", or )", self.found()).into()),
                }
            }
        }

        let absorbs_round = callee
            .segments()
            .last()
            .is_some_and(|name| FNS_WITH_ROUND.contains(&name.as_str()));
        let round = if absorbs_round && self.peek() == Some("round") {
            self.bump();
            Some(self.parse_round_clause()?)
        } else {
            None
        };

        Ok(Expr::Call { callee, args, round })
    }

    fn try_parse_scalar_literal(&mut self) -> Result<Option<Lit>, WorksheetError> {
        let Some(tok) = self.peek() else { return Ok(None) };
        let value = match tok {
            "undefined" => {
                self.bump();
                Lit::Undefined
            }
            "true" => {
                self.bump();
                Lit::Bool(true)
            }
            "false" => {
                self.bump();
                Lit::Bool(false)
            }
            _ if tok.starts_with('"') => {
                let tok = self.bump().unwrap();
                let text = unquote_str(&tok)
                    .ok_or_else(|| ParseError::no_match("expression", tok.clone()))?;
                Lit::Text(text)
            }
            _ if NUMBER_RE.is_match(tok) => {
                let tok = self.bump().unwrap();
                number_from_token(&tok, false)?
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Parses one scalar literal. Negative numbers are literals here; a `%`
    /// separated from the number by a space stays in the token stream.
    pub(crate) fn parse_literal(&mut self) -> Result<Lit, WorksheetError> {
        if self.peek() == Some("-") {
            self.bump();
            return match self.peek() {
                Some(tok) if NUMBER_RE.is_match(tok) => {
                    let tok = self.bump().unwrap();
                    number_from_token(&tok, true)
                }
                Some(tok) if tok.contains('%') && tok.starts_with(|c: char| c.is_ascii_digit()) => {
                    Err(ParseError::PercentPlacement.into())
                }
                Some(tok) => Err(ParseError::no_match("expression", tok).into()),
                None => Err(ParseError::no_match("expression", "").into()),
            };
        }
        match self.try_parse_scalar_literal()? {
            Some(value) => Ok(value),
            None => {
                let run = self.found();
                let run = if run == "<eof>" { String::new() } else { run };
                if run.contains('%') && run.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(ParseError::PercentPlacement.into());
                }
                Err(ParseError::no_match("expression", run).into())
            }
        }
    }
}

fn fold(
    exps: &mut Vec<Expr>,
    ops: &mut Vec<BinaryOp>,
    pending: &mut VecDeque<Round>,
    last_folded: &mut Option<usize>,
) {
    let rhs = exps.pop().expect("fold rhs");
    let lhs = exps.pop().expect("fold lhs");
    let op = ops.pop().expect("fold op");
    exps.push(Expr::binop(op, lhs, rhs, pending.pop_front()));
    *last_folded = Some(exps.len() - 1);
}

fn wrap_with_round(exps: &mut Vec<Expr>, clause: Round) {
    let expr = exps.pop().expect("operand to round");
    exps.push(Expr::binop(
        BinaryOp::Add,
        expr,
        Expr::Literal(Lit::Number(Number::new(0, 0))),
        Some(clause),
    ));
}

/// Converts a number token to a literal. A trailing `%` divides by 100 by
/// adding two to the scale.
fn number_from_token(tok: &str, negative: bool) -> Result<Lit, WorksheetError> {
    if !NUMBER_RE.is_match(tok) {
        if tok.contains('%') {
            return Err(ParseError::PercentPlacement.into());
        }
        return Err(ParseError::no_match("expression", tok).into());
    }
    let (body, percent) = match tok.strip_suffix('%') {
        Some(body) => (body, true),
        None => (tok, false),
    };
    let cleaned: String = body.chars().filter(|c| *c != '_').collect();
    let (int_part, frac_part) = match cleaned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (cleaned.as_str(), ""),
    };
    let mut scale = frac_part.len();
    if percent {
        scale += 2;
    }
    if scale > MAX_SCALE as usize {
        return Err(SchemaError::ScaleTooLarge.into());
    }
    let digits = format!("{}{}", int_part, frac_part);
    let mut mantissa = digits
        .parse::<i128>()
        .map_err(|_| ParseError::no_match("expression", tok))?;
    if negative {
        mantissa = -mantissa;
    }
    Ok(Lit::Number(Number::new(mantissa, scale as u8)))
}

impl Value {
    /// Parses a value from its canonical scalar literal, e.g. `"Alice"`,
    /// `120`, `-1.25`, `6%`, `true`, `undefined`.
    pub fn parse(input: &str) -> Result<Value, WorksheetError> {
        let mut p = Parser::new(input)?;
        let lit = p.parse_literal()?;
        if !p.is_eof() {
            return Err(ParseError::unexpected("<eof>", p.found()).into());
        }
        Ok(lit.value())
    }
}
