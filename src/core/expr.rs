//! NF-004: Restricted expression language for config strings.
//!
//! Config strings such as `"nn.Linear"`, `"width * 2"` or
//! `"lambda x: x + 1"` are parsed into an [`Expr`] tree by a small
//! recursive-descent parser and evaluated against an [`Env`]. Only
//! arithmetic, comparisons, indexing, attribute access, calls to values
//! already in scope, and a fixed set of builtins are available. A string
//! starting with [`LITERAL_PREFIX`] is returned verbatim instead.

use super::error::{Error, Result};
use super::lexer::{tokenize, Tok, Token};
use super::types::LITERAL_PREFIX;
use super::value::{DictKey, Env, Function, Kwargs, NativeFunction, Value};
use crate::graph::module::BoundBuilder;
use crate::nn::tensor::{checked_numel, Tensor, MAX_NUMEL};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Value),
    Name(String),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c`.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    Lambda(Vec<String>, Arc<Expr>),
    Call(Box<Expr>, Vec<Expr>, Vec<(String, Expr)>),
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

const KEYWORDS: &[&str] = &[
    "lambda", "if", "else", "or", "and", "not", "in", "None", "True", "False",
];

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    current: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self> {
        Ok(Self {
            src,
            tokens: tokenize(src)?,
            current: 0,
        })
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.current.min(self.tokens.len() - 1)].tok
    }

    fn pos(&self) -> usize {
        self.tokens[self.current.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if tok != Tok::Eof {
            self.current += 1;
        }
        tok
    }

    fn check_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Tok::Sym(s) if *s == sym)
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn match_sym(&mut self, sym: &str) -> bool {
        let hit = self.check_sym(sym);
        if hit {
            self.current += 1;
        }
        hit
    }

    fn match_kw(&mut self, kw: &str) -> bool {
        let hit = self.check_kw(kw);
        if hit {
            self.current += 1;
        }
        hit
    }

    fn consume_sym(&mut self, sym: &str) -> Result<()> {
        if self.match_sym(sym) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", sym)))
        }
    }

    fn error(&self, msg: &str) -> Error {
        let found = match self.peek() {
            Tok::Eof => "end of input".to_string(),
            Tok::Sym(s) => format!("'{}'", s),
            Tok::Name(n) => format!("'{}'", n),
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(s) => format!("{:?}", s),
        };
        Error::Resolution(format!(
            "{} at {} in {:?}, found {}",
            msg,
            self.pos(),
            self.src,
            found
        ))
    }

    /// Whole input; a bare top-level `a, b` is a tuple.
    fn parse_all(&mut self) -> Result<Expr> {
        let first = self.expression()?;
        let expr = if self.check_sym(",") {
            let mut items = vec![first];
            while self.match_sym(",") {
                if matches!(self.peek(), Tok::Eof) {
                    break;
                }
                items.push(self.expression()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        if !matches!(self.peek(), Tok::Eof) {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn expression(&mut self) -> Result<Expr> {
        if self.match_kw("lambda") {
            return self.lambda();
        }
        let expr = self.or()?;
        if self.match_kw("if") {
            let cond = self.or()?;
            if !self.match_kw("else") {
                return Err(self.error("expected 'else'"));
            }
            let other = self.expression()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(expr),
                other: Box::new(other),
            });
        }
        Ok(expr)
    }

    fn lambda(&mut self) -> Result<Expr> {
        let mut params = Vec::new();
        while !self.check_sym(":") {
            match self.advance() {
                Tok::Name(n) if !KEYWORDS.contains(&n.as_str()) => {
                    if params.contains(&n) {
                        return Err(self.error(&format!("duplicate lambda parameter '{}'", n)));
                    }
                    params.push(n);
                }
                _ => return Err(self.error("expected lambda parameter name")),
            }
            if !self.match_sym(",") {
                break;
            }
        }
        self.consume_sym(":")?;
        let body = self.expression()?;
        Ok(Expr::Lambda(params, Arc::new(body)))
    }

    fn or(&mut self) -> Result<Expr> {
        let mut expr = self.and()?;
        while self.match_kw("or") {
            let right = self.and()?;
            expr = Expr::Or(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut expr = self.not()?;
        while self.match_kw("and") {
            let right = self.not()?;
            expr = Expr::And(Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.match_kw("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = if self.match_sym("==") {
                CmpOp::Eq
            } else if self.match_sym("!=") {
                CmpOp::Ne
            } else if self.match_sym("<=") {
                CmpOp::Le
            } else if self.match_sym(">=") {
                CmpOp::Ge
            } else if self.match_sym("<") {
                CmpOp::Lt
            } else if self.match_sym(">") {
                CmpOp::Gt
            } else if self.match_kw("in") {
                CmpOp::In
            } else if self.check_kw("not")
                && matches!(self.tokens.get(self.current + 1).map(|t| &t.tok), Some(Tok::Name(n)) if n == "in")
            {
                self.current += 2;
                CmpOp::NotIn
            } else {
                break;
            };
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.match_sym("+") {
                BinOp::Add
            } else if self.match_sym("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.match_sym("*") {
                BinOp::Mul
            } else if self.match_sym("//") {
                BinOp::FloorDiv
            } else if self.match_sym("/") {
                BinOp::Div
            } else if self.match_sym("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(right));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.match_sym("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.match_sym("+") {
            return Ok(Expr::Pos(Box::new(self.unary()?)));
        }
        self.power()
    }

    // `-2 ** 2` is `-(2 ** 2)`; the exponent may itself be unary.
    fn power(&mut self) -> Result<Expr> {
        let base = self.postfix()?;
        if self.match_sym("**") {
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.match_sym("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call(Box::new(expr), args, kwargs);
            } else if self.match_sym("[") {
                let index = self.expression()?;
                self.consume_sym("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.match_sym(".") {
                match self.advance() {
                    Tok::Name(n) => expr = Expr::Attr(Box::new(expr), n),
                    _ => return Err(self.error("expected attribute name")),
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check_sym(")") {
            let is_kwarg = matches!(self.peek(), Tok::Name(_))
                && matches!(self.tokens.get(self.current + 1).map(|t| &t.tok), Some(Tok::Sym("=")));
            if is_kwarg {
                let Tok::Name(name) = self.advance() else {
                    return Err(self.error("expected keyword name"));
                };
                self.current += 1;
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(&format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.match_sym(",") {
                break;
            }
        }
        self.consume_sym(")")?;
        Ok((args, kwargs))
    }

    fn sequence(&mut self, close: &str) -> Result<(Vec<Expr>, bool)> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        while !self.check_sym(close) {
            items.push(self.expression()?);
            trailing_comma = self.match_sym(",");
            if !trailing_comma {
                break;
            }
        }
        self.consume_sym(close)?;
        Ok((items, trailing_comma))
    }

    fn atom(&mut self) -> Result<Expr> {
        let pos = self.current;
        match self.advance() {
            Tok::Int(i) => Ok(Expr::Lit(Value::Int(i))),
            Tok::Float(f) => Ok(Expr::Lit(Value::Float(f))),
            Tok::Str(s) => Ok(Expr::Lit(Value::Str(s))),
            Tok::Name(n) => match n.as_str() {
                "None" => Ok(Expr::Lit(Value::None)),
                "True" => Ok(Expr::Lit(Value::Bool(true))),
                "False" => Ok(Expr::Lit(Value::Bool(false))),
                kw if KEYWORDS.contains(&kw) => {
                    self.current = pos;
                    Err(self.error("unexpected keyword"))
                }
                _ => Ok(Expr::Name(n.clone())),
            },
            Tok::Sym("(") => {
                let (items, trailing_comma) = self.sequence(")")?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Expr::Tuple(Vec::new())))
                } else {
                    Ok(Expr::Tuple(items))
                }
            }
            Tok::Sym("[") => Ok(Expr::List(self.sequence("]")?.0)),
            Tok::Sym("{") => {
                let mut entries = Vec::new();
                while !self.check_sym("}") {
                    let key = self.expression()?;
                    self.consume_sym(":")?;
                    entries.push((key, self.expression()?));
                    if !self.match_sym(",") {
                        break;
                    }
                }
                self.consume_sym("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => {
                self.current = pos;
                Err(self.error("expected expression"))
            }
        }
    }
}

/// Parse an expression string.
pub fn parse(src: &str) -> Result<Expr> {
    Parser::new(src)?.parse_all()
}

/// Parse and evaluate `src` against `env`.
pub fn evaluate(src: &str, env: &Env) -> Result<Value> {
    eval(&parse(src)?, env)
}

/// Return the text after the literal marker verbatim, otherwise evaluate.
pub fn eval_string(src: &str, env: &Env) -> Result<Value> {
    match src.strip_prefix(LITERAL_PREFIX) {
        Some(rest) => Ok(Value::Str(rest.to_string())),
        None => evaluate(src, env),
    }
}

/// Strings are evaluated, everything else passes through unchanged.
pub fn resolve_value(value: &Value, env: &Env) -> Result<Value> {
    match value {
        Value::Str(s) => eval_string(s, env),
        other => Ok(other.clone()),
    }
}

/// A `lambda` written in a config expression, closed over its defining env.
pub struct Lambda {
    params: Vec<String>,
    body: Arc<Expr>,
    env: Env,
}

impl Function for Lambda {
    fn name(&self) -> &str {
        "<lambda>"
    }

    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        if args.len() > self.params.len() {
            return Err(Error::Arity(format!(
                "<lambda> takes {} positional arguments but {} were given",
                self.params.len(),
                args.len()
            )));
        }
        let mut bound: IndexMap<&str, Value> = IndexMap::new();
        for (name, arg) in self.params.iter().zip(args) {
            bound.insert(name.as_str(), arg);
        }
        for (name, arg) in kwargs {
            let Some(param) = self.params.iter().find(|p| **p == name) else {
                return Err(Error::Arity(format!(
                    "<lambda> got an unexpected keyword argument '{}'",
                    name
                )));
            };
            if bound.insert(param.as_str(), arg).is_some() {
                return Err(Error::Arity(format!(
                    "<lambda> got multiple values for argument '{}'",
                    name
                )));
            }
        }

        let mut scope = self.env.clone();
        for param in &self.params {
            let value = bound.swap_remove(param.as_str()).ok_or_else(|| {
                Error::Arity(format!("<lambda> missing required argument '{}'", param))
            })?;
            scope.insert(param.clone(), value);
        }
        eval(&self.body, &scope)
    }
}

/// Evaluate a parsed expression. Never mutates `env`.
pub fn eval(expr: &Expr, env: &Env) -> Result<Value> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Name(n) => lookup(n, env),
        Expr::Neg(e) => negate(eval(e, env)?),
        Expr::Pos(e) => match eval(e, env)? {
            v @ (Value::Int(_) | Value::Float(_) | Value::Tensor(_)) => Ok(v),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            v => Err(type_error("unary +", &v, None)),
        },
        Expr::Not(e) => Ok(Value::Bool(!eval(e, env)?.is_truthy())),
        Expr::And(a, b) => {
            let left = eval(a, env)?;
            if left.is_truthy() {
                eval(b, env)
            } else {
                Ok(left)
            }
        }
        Expr::Or(a, b) => {
            let left = eval(a, env)?;
            if left.is_truthy() {
                Ok(left)
            } else {
                eval(b, env)
            }
        }
        Expr::Binary(op, a, b) => binary(*op, &eval(a, env)?, &eval(b, env)?),
        Expr::Compare(first, rest) => {
            let mut left = eval(first, env)?;
            for (op, e) in rest {
                let right = eval(e, env)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::IfElse { cond, then, other } => {
            if eval(cond, env)?.is_truthy() {
                eval(then, env)
            } else {
                eval(other, env)
            }
        }
        Expr::Lambda(params, body) => Ok(Value::Function(Arc::new(Lambda {
            params: params.clone(),
            body: Arc::clone(body),
            env: env.clone(),
        }))),
        Expr::Call(callee, args, kwargs) => {
            let callee = eval(callee, env)?;
            let args = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>>>()?;
            let mut kw = Kwargs::new();
            for (k, e) in kwargs {
                kw.insert(k.clone(), eval(e, env)?);
            }
            call(&callee, args, kw)
        }
        Expr::Index(target, index) => index_value(&eval(target, env)?, &eval(index, env)?),
        Expr::Attr(target, name) => attribute(&eval(target, env)?, name),
        Expr::List(items) => Ok(Value::List(
            items.iter().map(|e| eval(e, env)).collect::<Result<_>>()?,
        )),
        Expr::Tuple(items) => Ok(Value::Tuple(
            items.iter().map(|e| eval(e, env)).collect::<Result<_>>()?,
        )),
        Expr::Dict(entries) => {
            let mut dict = IndexMap::new();
            for (k, v) in entries {
                dict.insert(DictKey::from_value(&eval(k, env)?)?, eval(v, env)?);
            }
            Ok(Value::Dict(dict))
        }
    }
}

fn lookup(name: &str, env: &Env) -> Result<Value> {
    if let Some(v) = env.get(name) {
        return Ok(v.clone());
    }
    builtin(name).ok_or_else(|| Error::Resolution(format!("name '{}' is not defined", name)))
}

/// Invoke a callable value. Calling a module constructor binds arguments
/// for a later build instead of instantiating.
pub fn call(callee: &Value, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
    match callee {
        Value::Function(f) => f.call(args, kwargs),
        Value::Builder(b) => Ok(Value::Builder(Arc::new(BoundBuilder::new(
            Arc::clone(b),
            args,
            kwargs,
        )))),
        other => Err(Error::Resolution(format!(
            "'{}' object is not callable",
            other.type_name()
        ))),
    }
}

fn type_error(op: &str, a: &Value, b: Option<&Value>) -> Error {
    match b {
        Some(b) => Error::Resolution(format!(
            "unsupported operand types for {}: '{}' and '{}'",
            op,
            a.type_name(),
            b.type_name()
        )),
        None => Error::Resolution(format!(
            "bad operand type for {}: '{}'",
            op,
            a.type_name()
        )),
    }
}

#[derive(Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

fn num(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::I(*i)),
        Value::Bool(b) => Some(Num::I(*b as i64)),
        Value::Float(f) => Some(Num::F(*f)),
        _ => None,
    }
}

fn negate(v: Value) -> Result<Value> {
    match v {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| Error::Resolution("integer overflow in negation".to_string())),
        Value::Bool(b) => Ok(Value::Int(-(b as i64))),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Tensor(t) => Ok(Value::Tensor(t.map(|x| -x))),
        other => Err(type_error("unary -", &other, None)),
    }
}

fn symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    }
}

/// Apply an arithmetic operator with Python semantics.
pub fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return match (x, y) {
            (Num::I(x), Num::I(y)) => int_binary(op, x, y),
            (x, y) => float_binary(op, as_f64(x), as_f64(y)).map(Value::Float),
        };
    }
    if matches!(a, Value::Tensor(_)) || matches!(b, Value::Tensor(_)) {
        return tensor_binary(op, a, b);
    }
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            Ok(Value::List(x.iter().chain(y).cloned().collect()))
        }
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            Ok(Value::Tuple(x.iter().chain(y).cloned().collect()))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            let n = repeat_count(s.len(), *n)?;
            Ok(Value::Str(s.repeat(n)))
        }
        (BinOp::Mul, Value::List(v), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::List(v)) => {
            Ok(Value::List(repeat(v, *n)?))
        }
        (BinOp::Mul, Value::Tuple(v), Value::Int(n))
        | (BinOp::Mul, Value::Int(n), Value::Tuple(v)) => Ok(Value::Tuple(repeat(v, *n)?)),
        _ => Err(type_error(symbol(op), a, Some(b))),
    }
}

/// Longest sequence or string an expression may produce.
pub const MAX_SEQUENCE_LEN: usize = 1 << 24;

fn too_large(what: &str) -> Error {
    Error::Resolution(format!(
        "{} result exceeds {} elements",
        what, MAX_SEQUENCE_LEN
    ))
}

/// Repetition count for `seq * n`, bounded by [`MAX_SEQUENCE_LEN`].
fn repeat_count(len: usize, n: i64) -> Result<usize> {
    let n = usize::try_from(n).unwrap_or(0);
    match len.checked_mul(n) {
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(n),
        _ => Err(too_large("'*'")),
    }
}

fn repeat(items: &[Value], n: i64) -> Result<Vec<Value>> {
    let n = repeat_count(items.len(), n)?;
    let mut out = Vec::with_capacity(items.len() * n);
    for _ in 0..n {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn as_f64(n: Num) -> f64 {
    match n {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    }
}

fn overflow(op: BinOp) -> Error {
    Error::Resolution(format!("integer overflow in '{}'", symbol(op)))
}

fn zero_division() -> Error {
    Error::Resolution("division by zero".to_string())
}

/// Floor division rounding toward negative infinity.
pub fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Remainder carrying the sign of the divisor.
pub fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn int_binary(op: BinOp, x: i64, y: i64) -> Result<Value> {
    let out = match op {
        BinOp::Add => x.checked_add(y),
        BinOp::Sub => x.checked_sub(y),
        BinOp::Mul => x.checked_mul(y),
        BinOp::Div => {
            if y == 0 {
                return Err(zero_division());
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv | BinOp::Mod => {
            if y == 0 {
                return Err(zero_division());
            }
            if op == BinOp::FloorDiv {
                floor_div(x, y)
            } else {
                floor_mod(x, y)
            }
        }
        BinOp::Pow => {
            if y < 0 {
                return float_binary(op, x as f64, y as f64).map(Value::Float);
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
    };
    out.map(Value::Int).ok_or_else(|| overflow(op))
}

fn float_binary(op: BinOp, x: f64, y: f64) -> Result<f64> {
    Ok(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if y == 0.0 => return Err(zero_division()),
        BinOp::Div => x / y,
        BinOp::FloorDiv => (x / y).floor(),
        BinOp::Mod => x - y * (x / y).floor(),
        BinOp::Pow => x.powf(y),
    })
}

fn tensor_binary(op: BinOp, a: &Value, b: &Value) -> Result<Value> {
    let f = move |x: f32, y: f32| -> f32 {
        match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::FloorDiv => (x / y).floor(),
            BinOp::Mod => x - y * (x / y).floor(),
            BinOp::Pow => x.powf(y),
        }
    };
    let out = match (a, b) {
        (Value::Tensor(x), Value::Tensor(y)) => x.zip_with(y, f)?,
        (Value::Tensor(x), s) => {
            let y = num(s).ok_or_else(|| type_error(symbol(op), a, Some(b)))?;
            let y = as_f64(y) as f32;
            x.map(|v| f(v, y))
        }
        (s, Value::Tensor(y)) => {
            let x = num(s).ok_or_else(|| type_error(symbol(op), a, Some(b)))?;
            let x = as_f64(x) as f32;
            y.map(|v| f(x, v))
        }
        _ => return Err(type_error(symbol(op), a, Some(b))),
    };
    Ok(Value::Tensor(out))
}

fn order(a: &Value, b: &Value) -> Result<Ordering> {
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return as_f64(x)
            .partial_cmp(&as_f64(y))
            .ok_or_else(|| Error::Resolution("cannot order NaN".to_string()));
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (l, r) in x.iter().zip(y) {
                let o = order(l, r)?;
                if o != Ordering::Equal {
                    return Ok(o);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(Error::Resolution(format!(
            "'<' not supported between '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(type_error("in", other, Some(container))),
        },
        Value::List(v) | Value::Tuple(v) => Ok(v.contains(item)),
        Value::Dict(d) => Ok(DictKey::from_value(item).is_ok_and(|k| d.contains_key(&k))),
        Value::Namespace(ns) => Ok(item.as_str().is_some_and(|k| ns.members.contains_key(k))),
        other => Err(Error::Resolution(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool> {
    Ok(match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => order(a, b)? == Ordering::Less,
        CmpOp::Le => order(a, b)? != Ordering::Greater,
        CmpOp::Gt => order(a, b)? == Ordering::Greater,
        CmpOp::Ge => order(a, b)? != Ordering::Less,
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
    })
}

fn index_value(target: &Value, index: &Value) -> Result<Value> {
    match (target, index) {
        (Value::List(_) | Value::Tuple(_), Value::Int(i)) => target.index(*i),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<Value> = s.chars().map(|c| Value::Str(c.to_string())).collect();
            Value::List(chars).index(*i)
        }
        (Value::Dict(d), key) => {
            let k = DictKey::from_value(key)?;
            d.get(&k)
                .cloned()
                .ok_or_else(|| Error::Index(format!("key {:?} not found", key)))
        }
        _ => Err(Error::Resolution(format!(
            "'{}' object is not subscriptable by '{}'",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn attribute(target: &Value, name: &str) -> Result<Value> {
    let found = match target {
        Value::Namespace(ns) => ns.members.get(name).cloned(),
        Value::Dict(d) => d.get(&DictKey::Str(name.to_string())).cloned(),
        Value::Tensor(t) => match name {
            "shape" => Some(Value::Tuple(
                t.shape().iter().map(|&d| Value::Int(d as i64)).collect(),
            )),
            "ndim" => Some(Value::Int(t.ndim() as i64)),
            _ => None,
        },
        _ => None,
    };
    found.ok_or_else(|| {
        Error::Resolution(format!(
            "'{}' object has no attribute '{}'",
            target.type_name(),
            name
        ))
    })
}

fn iterate(v: &Value) -> Result<Vec<Value>> {
    match v {
        Value::List(items) | Value::Tuple(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(d) => Ok(d.keys().map(|k| k.to_value()).collect()),
        other => Err(Error::Resolution(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        return Err(Error::Arity(format!(
            "{}() takes {}..={} arguments, got {}",
            name,
            min,
            max,
            args.len()
        )));
    }
    Ok(())
}

fn int_arg(name: &str, v: &Value) -> Result<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(Error::Resolution(format!(
            "{}() expects int, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

fn shape_arg(name: &str, args: &[Value]) -> Result<Vec<usize>> {
    let dims = match args {
        [Value::List(v)] | [Value::Tuple(v)] => v.as_slice(),
        dims => dims,
    };
    let shape = dims
        .iter()
        .map(|d| {
            let d = int_arg(name, d)?;
            usize::try_from(d)
                .map_err(|_| Error::Resolution(format!("{}() got negative dimension {}", name, d)))
        })
        .collect::<Result<Vec<_>>>()?;
    if checked_numel(&shape).is_none() {
        return Err(Error::Resolution(format!(
            "{}() shape {:?} exceeds {} elements",
            name, shape, MAX_NUMEL
        )));
    }
    Ok(shape)
}

fn extreme(name: &str, args: Vec<Value>, want: Ordering) -> Result<Value> {
    let items = if args.len() == 1 {
        iterate(&args[0])?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| Error::Resolution(format!("{}() arg is an empty sequence", name)))?;
    for item in iter {
        if order(&item, &best)? == want {
            best = item;
        }
    }
    Ok(best)
}

fn builtin(name: &str) -> Option<Value> {
    let v = match name {
        "len" => NativeFunction::value("len", |args, _| {
            expect_args("len", &args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(v) | Value::Tuple(v) => v.len(),
                Value::Dict(d) => d.len(),
                Value::Tensor(t) => t.shape().first().copied().unwrap_or(0),
                other => {
                    return Err(Error::Resolution(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(n as i64))
        }),
        "range" => NativeFunction::value("range", |args, _| {
            expect_args("range", &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|a| int_arg("range", a))
                .collect::<Result<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(Error::Resolution("range() arg 3 must not be zero".to_string()));
            }
            let mut out = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                if out.len() == MAX_SEQUENCE_LEN {
                    return Err(too_large("range()"));
                }
                out.push(Value::Int(i));
                match i.checked_add(step) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            Ok(Value::List(out))
        }),
        "list" => NativeFunction::value("list", |args, _| {
            expect_args("list", &args, 0, 1)?;
            Ok(Value::List(match args.first() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            }))
        }),
        "tuple" => NativeFunction::value("tuple", |args, _| {
            expect_args("tuple", &args, 0, 1)?;
            Ok(Value::Tuple(match args.first() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            }))
        }),
        "int" => NativeFunction::value("int", |args, _| {
            expect_args("int", &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                Value::Str(s) => s.trim().parse().map(Value::Int).map_err(|_| {
                    Error::Resolution(format!("invalid literal for int(): {:?}", s))
                }),
                other => Err(type_error("int()", other, None)),
            }
        }),
        "float" => NativeFunction::value("float", |args, _| {
            expect_args("float", &args, 1, 1)?;
            match &args[0] {
                Value::Str(s) => s.trim().parse().map(Value::Float).map_err(|_| {
                    Error::Resolution(format!("could not convert string to float: {:?}", s))
                }),
                other => num(other)
                    .map(|n| Value::Float(as_f64(n)))
                    .ok_or_else(|| type_error("float()", other, None)),
            }
        }),
        "str" => NativeFunction::value("str", |args, _| {
            expect_args("str", &args, 0, 1)?;
            Ok(Value::Str(
                args.first().map(|v| v.to_string()).unwrap_or_default(),
            ))
        }),
        "bool" => NativeFunction::value("bool", |args, _| {
            expect_args("bool", &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
        }),
        "min" => NativeFunction::value("min", |args, _| extreme("min", args, Ordering::Less)),
        "max" => NativeFunction::value("max", |args, _| extreme("max", args, Ordering::Greater)),
        "abs" => NativeFunction::value("abs", |args, _| {
            expect_args("abs", &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Error::Resolution("integer overflow in abs()".to_string())),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Tensor(t) => Ok(Value::Tensor(t.map(f32::abs))),
                other => Err(type_error("abs()", other, None)),
            }
        }),
        "sum" => NativeFunction::value("sum", |args, kwargs| {
            expect_args("sum", &args, 1, 2)?;
            let mut total = args
                .get(1)
                .or_else(|| kwargs.get("start"))
                .cloned()
                .unwrap_or(Value::Int(0));
            for item in iterate(&args[0])? {
                total = binary(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }),
        "zeros" => NativeFunction::value("zeros", |args, _| {
            Ok(Value::Tensor(Tensor::zeros(&shape_arg("zeros", &args)?)))
        }),
        "ones" => NativeFunction::value("ones", |args, _| {
            Ok(Value::Tensor(Tensor::ones(&shape_arg("ones", &args)?)))
        }),
        _ => return None,
    };
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ev(src: &str) -> Value {
        evaluate(src, &Env::new()).unwrap()
    }

    fn env_with(pairs: &[(&str, Value)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nf004_literal_prefix() {
        let env = Env::new();
        assert_eq!(
            eval_string("~undefined + name", &env).unwrap(),
            Value::from("undefined + name")
        );
        assert_eq!(eval_string("~", &env).unwrap(), Value::from(""));
    }

    #[test]
    fn test_nf004_non_strings_pass_through() {
        let env = Env::new();
        let v = Value::List(vec![Value::from("not evaluated")]);
        assert_eq!(resolve_value(&v, &env).unwrap(), v);
        assert_eq!(resolve_value(&Value::Int(3), &env).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_nf004_arithmetic_precedence() {
        assert_eq!(ev("1 + 2 * 3"), Value::Int(7));
        assert_eq!(ev("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(ev("2 ** 3 ** 2"), Value::Int(512));
        assert_eq!(ev("-2 ** 2"), Value::Int(-4));
        assert_eq!(ev("2 ** -1"), Value::Float(0.5));
        assert_eq!(ev("7 / 2"), Value::Float(3.5));
    }

    #[test]
    fn test_nf004_floor_semantics() {
        assert_eq!(ev("-7 // 2"), Value::Int(-4));
        assert_eq!(ev("-7 % 2"), Value::Int(1));
        assert_eq!(ev("7 % -2"), Value::Int(-1));
        assert_eq!(ev("7.5 // 2"), Value::Float(3.0));
    }

    #[test]
    fn test_nf004_errors() {
        let env = Env::new();
        assert!(matches!(evaluate("1 / 0", &env), Err(Error::Resolution(_))));
        assert!(matches!(evaluate("missing", &env), Err(Error::Resolution(_))));
        assert!(matches!(evaluate("1 +", &env), Err(Error::Resolution(_))));
        assert!(matches!(
            evaluate("9223372036854775807 + 1", &env),
            Err(Error::Resolution(_))
        ));
        assert!(matches!(evaluate("'a' - 1", &env), Err(Error::Resolution(_))));
    }

    #[test]
    fn test_nf004_collections() {
        assert_eq!(ev("[1, 2][-1]"), Value::Int(2));
        assert_eq!(ev("(1,)"), Value::Tuple(vec![Value::Int(1)]));
        assert_eq!(ev("(1)"), Value::Int(1));
        assert_eq!(ev("1, 2"), Value::Tuple(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(ev("{'a': 1}['a']"), Value::Int(1));
        assert_eq!(ev("{'a': 1}.a"), Value::Int(1));
        assert_eq!(ev("[0] * 3"), Value::List(vec![Value::Int(0); 3]));
        assert_eq!(ev("'ab' + 'c'"), Value::from("abc"));
    }

    #[test]
    fn test_nf004_logic_and_comparison() {
        assert_eq!(ev("1 < 2 <= 2"), Value::Bool(true));
        assert_eq!(ev("1 < 2 > 3"), Value::Bool(false));
        assert_eq!(ev("2 in [1, 2]"), Value::Bool(true));
        assert_eq!(ev("3 not in [1, 2]"), Value::Bool(true));
        assert_eq!(ev("not 0"), Value::Bool(true));
        assert_eq!(ev("0 or 'x'"), Value::from("x"));
        assert_eq!(ev("'yes' if 1 == 1.0 else 'no'"), Value::from("yes"));
        // Short circuit: the unbound name is never evaluated.
        assert_eq!(ev("False and undefined"), Value::Bool(false));
    }

    #[test]
    fn test_nf004_names_and_env_untouched() {
        let env = env_with(&[("width", Value::Int(16))]);
        let before = env.clone();
        assert_eq!(evaluate("width * 2", &env).unwrap(), Value::Int(32));
        assert_eq!(env.len(), before.len());
        assert_eq!(env["width"], Value::Int(16));
    }

    #[test]
    fn test_nf004_lambda_closure() {
        let env = env_with(&[("k", Value::Int(10))]);
        let f = evaluate("lambda x, y: x * k + y", &env).unwrap();
        let out = call(&f, vec![Value::Int(2)], {
            let mut kw = Kwargs::new();
            kw.insert("y".into(), Value::Int(1));
            kw
        })
        .unwrap();
        assert_eq!(out, Value::Int(21));
        assert_eq!(
            evaluate("(lambda: 5)()", &Env::new()).unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn test_nf004_lambda_arity() {
        let f = ev("lambda x: x");
        assert!(matches!(call(&f, vec![], Kwargs::new()), Err(Error::Arity(_))));
        assert!(matches!(
            call(&f, vec![Value::Int(1), Value::Int(2)], Kwargs::new()),
            Err(Error::Arity(_))
        ));
    }

    #[test]
    fn test_nf004_builtins() {
        assert_eq!(ev("len([1, 2, 3])"), Value::Int(3));
        assert_eq!(
            ev("range(1, 7, 2)"),
            Value::List(vec![Value::Int(1), Value::Int(3), Value::Int(5)])
        );
        assert_eq!(ev("max(3, 9, 4)"), Value::Int(9));
        assert_eq!(ev("min([3, 9, 4])"), Value::Int(3));
        assert_eq!(ev("sum([1, 2, 3])"), Value::Int(6));
        assert_eq!(ev("int('42') + int(2.9)"), Value::Int(44));
        assert_eq!(ev("str(1.5)"), Value::from("1.5"));
        assert_eq!(ev("abs(-3)"), Value::Int(3));
        assert_eq!(ev("zeros(2, 3).shape"), ev("(2, 3)"));
        assert_eq!(ev("ones([4]).ndim"), Value::Int(1));
    }

    #[test]
    fn test_nf004_builtin_shadowed_by_env() {
        let env = env_with(&[("len", Value::Int(7))]);
        assert_eq!(evaluate("len", &env).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_nf004_tensor_arithmetic() {
        let v = ev("ones(2) * 3 + 1");
        let Value::Tensor(t) = v else {
            panic!("expected tensor");
        };
        assert_eq!(t.data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_nf004_oversized_results_are_errors() {
        let env = Env::new();
        for src in [
            "[1] * 9223372036854775807",
            "'ab' * 9223372036854775807",
            "(1, 2) * 9223372036854775807",
            "range(20000000)",
            "zeros(4294967296, 4294967296)",
            "ones([65536, 65536, 65536])",
        ] {
            assert!(
                matches!(evaluate(src, &env), Err(Error::Resolution(_))),
                "{} should fail to resolve",
                src
            );
        }
        assert_eq!(ev("'ab' * -3"), Value::from(""));
        assert_eq!(ev("[1] * 0"), Value::List(vec![]));
    }

    #[test]
    fn test_nf004_range_stops_at_integer_limit() {
        let v = ev("range(9223372036854775800, 9223372036854775807, 100)");
        assert_eq!(v, Value::List(vec![Value::Int(9223372036854775800)]));
        let v = ev("range(-9223372036854775800, -9223372036854775807, -5)");
        assert_eq!(v.as_seq().map(<[Value]>::len), Some(2));
        assert_eq!(ev("range(0, 10, 4)"), Value::List(vec![0.into(), 4.into(), 8.into()]));
    }

    #[test]
    fn test_nf004_syntax_error_position() {
        let err = evaluate("a + * b", &Env::new()).unwrap_err();
        assert!(err.to_string().contains("at 4"), "{}", err);
    }

    proptest! {
        #[test]
        fn prop_nf004_floor_div_mod_identity(a in -10_000i64..10_000, b in -100i64..100) {
            prop_assume!(b != 0);
            let q = floor_div(a, b).unwrap();
            let r = floor_mod(a, b).unwrap();
            prop_assert_eq!(q * b + r, a);
            prop_assert!(r == 0 || (r < 0) == (b < 0));
        }

        #[test]
        fn prop_nf004_int_literals_roundtrip(n in 0i64..1_000_000) {
            let env = Env::new();
            prop_assert_eq!(evaluate(&n.to_string(), &env).unwrap(), Value::Int(n));
            prop_assert_eq!(evaluate(&format!("-{}", n), &env).unwrap(), Value::Int(-n));
        }
    }
}
