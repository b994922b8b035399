#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use qc_columnar::{ArithmeticOp, BitMask, Column, ColumnError, ComparisonOp};
use qc_frame::TimeFrame;
use qc_types::{clock_seconds, elapsed_seconds, epoch_seconds};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── AST ────────────────────────────────────────────────────────────────

/// Built-in time signals, derived from the frame index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeKeyword {
    /// Seconds since the first timestamp.
    Elapsed,
    /// Seconds since midnight.
    Clock,
    /// Seconds since the Unix epoch.
    Epoch,
}

impl TimeKeyword {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ELAPSED_TIME" => Some(Self::Elapsed),
            "CLOCK_TIME" => Some(Self::Clock),
            "EPOCH_TIME" => Some(Self::Epoch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Abs,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
}

impl Function {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Self::Abs),
            "sqrt" => Some(Self::Sqrt),
            "exp" => Some(Self::Exp),
            "log" => Some(Self::Log),
            "sin" => Some(Self::Sin),
            "cos" => Some(Self::Cos),
            "tan" => Some(Self::Tan),
            _ => None,
        }
    }

    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Abs => value.abs(),
            Self::Sqrt => value.sqrt(),
            Self::Exp => value.exp(),
            Self::Log => value.ln(),
            Self::Sin => value.sin(),
            Self::Cos => value.cos(),
            Self::Tan => value.tan(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// A time keyword, column, translation group or constant, resolved in
    /// that order.
    Ref {
        name: String,
    },
    Literal {
        value: f64,
    },
    Arith {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg {
        expr: Box<Expr>,
    },
    Func {
        func: Function,
        arg: Box<Expr>,
    },
    Compare {
        op: ComparisonOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
}

impl Expr {
    #[must_use]
    pub fn reference(name: impl Into<String>) -> Self {
        Self::Ref { name: name.into() }
    }

    #[must_use]
    pub fn lit(value: f64) -> Self {
        Self::Literal { value }
    }

    #[must_use]
    pub fn arith(self, op: ArithmeticOp, rhs: Self) -> Self {
        Self::Arith {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn compare(self, op: ComparisonOp, rhs: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn call(func: Function, arg: Self) -> Self {
        Self::Func {
            func,
            arg: Box::new(arg),
        }
    }

    #[must_use]
    pub fn and(self, rhs: Self) -> Self {
        Self::And {
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn or(self, rhs: Self) -> Self {
        Self::Or {
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    #[must_use]
    pub fn not(self) -> Self {
        Self::Not {
            expr: Box::new(self),
        }
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Self) -> Self::Output {
        self.arith(ArithmeticOp::Add, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Self) -> Self::Output {
        self.arith(ArithmeticOp::Sub, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Self) -> Self::Output {
        self.arith(ArithmeticOp::Mul, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Self) -> Self::Output {
        self.arith(ArithmeticOp::Div, rhs)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Self::Output {
        Self::Neg {
            expr: Box::new(self),
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unknown reference: {0}")]
    UnknownReference(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("cannot combine {left} columns with {right} columns")]
    ShapeMismatch { left: usize, right: usize },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Value of an evaluated expression. Column signals are aligned with the
/// frame index.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Number(f64),
    Numeric(Vec<Column>),
    Boolean(Vec<BitMask>),
}

impl Signal {
    fn kind(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Numeric(_) => "numeric columns",
            Self::Boolean(_) => "boolean columns",
        }
    }

    /// Numeric columns, a lone number broadcast to one column of `len` rows.
    pub fn into_columns(self, len: usize) -> Result<Vec<Column>, ExprError> {
        match self {
            Self::Number(v) => Ok(vec![Column::new(vec![v; len])]),
            Self::Numeric(cols) => Ok(cols),
            Self::Boolean(_) => Err(ExprError::TypeMismatch(
                "expected a numeric expression, found a condition".to_owned(),
            )),
        }
    }

    pub fn into_masks(self) -> Result<Vec<BitMask>, ExprError> {
        match self {
            Self::Boolean(masks) => Ok(masks),
            other => Err(ExprError::TypeMismatch(format!(
                "expected a condition, found {}",
                other.kind()
            ))),
        }
    }
}

/// Names an expression can see besides the frame's own columns.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    frame: &'a TimeFrame,
    groups: Option<&'a BTreeMap<String, Vec<String>>>,
    constants: Option<&'a BTreeMap<String, f64>>,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub fn new(frame: &'a TimeFrame) -> Self {
        Self {
            frame,
            groups: None,
            constants: None,
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: &'a BTreeMap<String, Vec<String>>) -> Self {
        self.groups = Some(groups);
        self
    }

    #[must_use]
    pub fn with_constants(mut self, constants: &'a BTreeMap<String, f64>) -> Self {
        self.constants = Some(constants);
        self
    }

    fn resolve(&self, name: &str) -> Result<Signal, ExprError> {
        let labels = self.frame.index().labels();
        if let Some(keyword) = TimeKeyword::from_name(name) {
            let values = match keyword {
                TimeKeyword::Elapsed => elapsed_seconds(labels, 0.0),
                TimeKeyword::Clock => labels.iter().map(clock_seconds).collect(),
                TimeKeyword::Epoch => labels.iter().map(epoch_seconds).collect(),
            };
            return Ok(Signal::Numeric(vec![Column::new(values)]));
        }
        if let Some(column) = self.frame.column(name) {
            return Ok(Signal::Numeric(vec![column.clone()]));
        }
        if let Some(members) = self.groups.and_then(|groups| groups.get(name)) {
            let columns = members
                .iter()
                .map(|member| {
                    self.frame
                        .column(member)
                        .cloned()
                        .ok_or_else(|| ExprError::UnknownReference(member.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Signal::Numeric(columns));
        }
        if let Some(value) = self.constants.and_then(|constants| constants.get(name)) {
            return Ok(Signal::Number(*value));
        }
        Err(ExprError::UnknownReference(name.to_owned()))
    }
}

/// Pair up `n` left and `m` right items: equal counts match element-wise,
/// a single item broadcasts against any count.
fn broadcast<L, R, T>(
    left: &[L],
    right: &[R],
    mut func: impl FnMut(&L, &R) -> Result<T, ExprError>,
) -> Result<Vec<T>, ExprError> {
    let n = match (left.len(), right.len()) {
        (l, r) if l == r => l,
        (1, r) => r,
        (l, 1) => l,
        (l, r) => return Err(ExprError::ShapeMismatch { left: l, right: r }),
    };
    (0..n)
        .map(|i| {
            let l = &left[if left.len() == 1 { 0 } else { i }];
            let r = &right[if right.len() == 1 { 0 } else { i }];
            func(l, r)
        })
        .collect()
}

fn operand_error(what: &str, left: &Signal, right: &Signal) -> ExprError {
    ExprError::TypeMismatch(format!(
        "{what} requires numeric operands, found {} and {}",
        left.kind(),
        right.kind()
    ))
}

fn arith(op: ArithmeticOp, left: Signal, right: Signal) -> Result<Signal, ExprError> {
    Ok(match (left, right) {
        (Signal::Number(l), Signal::Number(r)) => Signal::Number(op.apply(l, r)),
        (Signal::Numeric(cols), Signal::Number(r)) => {
            Signal::Numeric(cols.iter().map(|c| c.scalar_op(r, op, false)).collect())
        }
        (Signal::Number(l), Signal::Numeric(cols)) => {
            Signal::Numeric(cols.iter().map(|c| c.scalar_op(l, op, true)).collect())
        }
        (Signal::Numeric(l), Signal::Numeric(r)) => {
            Signal::Numeric(broadcast(&l, &r, |a, b| Ok(a.binary_op(b, op)?))?)
        }
        (left, right) => return Err(operand_error("arithmetic", &left, &right)),
    })
}

fn compare(op: ComparisonOp, left: Signal, right: Signal, len: usize) -> Result<Signal, ExprError> {
    Ok(match (left, right) {
        (Signal::Number(l), Signal::Number(r)) => Signal::Boolean(vec![if op.apply(l, r) {
            BitMask::all_true(len)
        } else {
            BitMask::all_false(len)
        }]),
        (Signal::Numeric(cols), Signal::Number(r)) => {
            Signal::Boolean(cols.iter().map(|c| c.compare_scalar(r, op)).collect())
        }
        (Signal::Number(l), Signal::Numeric(cols)) => Signal::Boolean(
            cols.iter()
                .map(|c| c.compare_scalar(l, op.reversed()))
                .collect(),
        ),
        (Signal::Numeric(l), Signal::Numeric(r)) => {
            Signal::Boolean(broadcast(&l, &r, |a, b| Ok(a.compare(b, op)?))?)
        }
        (left, right) => return Err(operand_error("comparison", &left, &right)),
    })
}

fn logical(
    left: Signal,
    right: Signal,
    combine: fn(&BitMask, &BitMask) -> BitMask,
) -> Result<Signal, ExprError> {
    let (Signal::Boolean(l), Signal::Boolean(r)) = (&left, &right) else {
        return Err(ExprError::TypeMismatch(format!(
            "logical operators require conditions, found {} and {}",
            left.kind(),
            right.kind()
        )));
    };
    Ok(Signal::Boolean(broadcast(l, r, |a, b| Ok(combine(a, b)))?))
}

pub fn evaluate(expr: &Expr, context: &EvalContext<'_>) -> Result<Signal, ExprError> {
    let len = context.frame.len();
    match expr {
        Expr::Ref { name } => context.resolve(name),
        Expr::Literal { value } => Ok(Signal::Number(*value)),
        Expr::Arith { op, left, right } => {
            arith(*op, evaluate(left, context)?, evaluate(right, context)?)
        }
        Expr::Neg { expr } => arith(
            ArithmeticOp::Mul,
            Signal::Number(-1.0),
            evaluate(expr, context)?,
        ),
        Expr::Func { func, arg } => match evaluate(arg, context)? {
            Signal::Number(v) => Ok(Signal::Number(func.apply(v))),
            Signal::Numeric(cols) => Ok(Signal::Numeric(
                cols.iter().map(|c| c.map(|v| func.apply(v))).collect(),
            )),
            Signal::Boolean(_) => Err(ExprError::TypeMismatch(
                "functions require numeric arguments".to_owned(),
            )),
        },
        Expr::Compare { op, left, right } => compare(
            *op,
            evaluate(left, context)?,
            evaluate(right, context)?,
            len,
        ),
        Expr::And { left, right } => logical(
            evaluate(left, context)?,
            evaluate(right, context)?,
            BitMask::and_mask,
        ),
        Expr::Or { left, right } => logical(
            evaluate(left, context)?,
            evaluate(right, context)?,
            BitMask::or_mask,
        ),
        Expr::Not { expr } => match evaluate(expr, context)? {
            Signal::Boolean(masks) => Ok(Signal::Boolean(
                masks.iter().map(BitMask::not_mask).collect(),
            )),
            other => Err(ExprError::TypeMismatch(format!(
                "'not' requires a condition, found {}",
                other.kind()
            ))),
        },
    }
}

// ── Formula parsing ────────────────────────────────────────────────────
//
// or      := and ("or" and)*
// and     := not ("and" not)*
// not     := "not" not | compare
// compare := sum (cmp_op sum)?
// sum     := product (("+" | "-") product)*
// product := unary (("*" | "/") unary)*
// unary   := "-" unary | atom
// atom    := number | "{" name "}" | ident "(" or ")" | ident | "(" or ")"

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Braced(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{v}"),
            Self::Braced(name) => write!(f, "{{{name}}}"),
            Self::Ident(name) => write!(f, "{name}"),
            Self::Op(op) => write!(f, "{op}"),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
        }
    }
}

const OPERATORS: [&str; 13] = [
    ">=", "<=", "==", "!=", ">", "<", "+", "-", "*", "/", "&", "|", "~",
];

fn parse_error(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Parse {
        offset,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;
        if c == b'(' {
            tokens.push((start, Token::LParen));
            pos += 1;
        } else if c == b')' {
            tokens.push((start, Token::RParen));
            pos += 1;
        } else if c == b'{' {
            let close = source[pos + 1..]
                .find('}')
                .ok_or_else(|| parse_error(start, "unterminated '{'"))?;
            let name = source[pos + 1..pos + 1 + close].trim();
            if name.is_empty() {
                return Err(parse_error(start, "empty reference"));
            }
            tokens.push((start, Token::Braced(name.to_owned())));
            pos += close + 2;
        } else if c.is_ascii_digit() || c == b'.' {
            pos += 1;
            while pos < bytes.len() {
                let d = bytes[pos];
                let exponent_sign = (d == b'+' || d == b'-')
                    && matches!(bytes[pos - 1], b'e' | b'E');
                if d.is_ascii_digit() || d == b'.' || d == b'e' || d == b'E' || exponent_sign {
                    pos += 1;
                } else {
                    break;
                }
            }
            let text = &source[start..pos];
            let value = text
                .parse::<f64>()
                .map_err(|_| parse_error(start, format!("invalid number '{text}'")))?;
            tokens.push((start, Token::Number(value)));
        } else if c.is_ascii_alphabetic() || c == b'_' {
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            tokens.push((start, Token::Ident(source[start..pos].to_owned())));
        } else if let Some(op) = OPERATORS
            .iter()
            .find(|op| source[pos..].starts_with(**op))
        {
            tokens.push((start, Token::Op(*op)));
            pos += op.len();
        } else {
            let ch = source[pos..].chars().next().unwrap_or('?');
            return Err(parse_error(start, format!("unexpected character '{ch}'")));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(offset, _)| *offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        self.pos += 1;
        token
    }

    fn eat_word(&mut self, word: &str, symbol: &str) -> bool {
        let hit = match self.peek() {
            Some(Token::Ident(ident)) => ident == word,
            Some(Token::Op(op)) => *op == symbol,
            _ => false,
        };
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.and()?;
        while self.eat_word("or", "|") {
            expr = expr.or(self.and()?);
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.not()?;
        while self.eat_word("and", "&") {
            expr = expr.and(self.not()?);
        }
        Ok(expr)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.eat_word("not", "~") {
            return Ok(self.not()?.not());
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let left = self.sum()?;
        let op = match self.peek() {
            Some(Token::Op(">")) => ComparisonOp::Gt,
            Some(Token::Op("<")) => ComparisonOp::Lt,
            Some(Token::Op(">=")) => ComparisonOp::Ge,
            Some(Token::Op("<=")) => ComparisonOp::Le,
            Some(Token::Op("==")) => ComparisonOp::Eq,
            Some(Token::Op("!=")) => ComparisonOp::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        Ok(left.compare(op, self.sum()?))
    }

    fn sum(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => ArithmeticOp::Add,
                Some(Token::Op("-")) => ArithmeticOp::Sub,
                _ => return Ok(expr),
            };
            self.pos += 1;
            expr = expr.arith(op, self.product()?);
        }
    }

    fn product(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => ArithmeticOp::Mul,
                Some(Token::Op("/")) => ArithmeticOp::Div,
                _ => return Ok(expr),
            };
            self.pos += 1;
            expr = expr.arith(op, self.unary()?);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Op("-")) {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.atom()
    }

    fn expect_rparen(&mut self) -> Result<(), ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(parse_error(offset, format!("expected ')', found '{other}'"))),
            None => Err(parse_error(offset, "expected ')'")),
        }
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::lit(value)),
            Some(Token::Braced(name)) => Ok(Expr::reference(name)),
            Some(Token::LParen) => {
                let expr = self.or()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::reference(name));
                }
                let func =
                    Function::from_name(&name).ok_or(ExprError::UnknownFunction(name))?;
                self.pos += 1;
                let arg = self.or()?;
                self.expect_rparen()?;
                Ok(Expr::call(func, arg))
            }
            Some(other) => Err(parse_error(offset, format!("unexpected '{other}'"))),
            None => Err(parse_error(offset, "unexpected end of formula")),
        }
    }
}

/// Parse a formula such as `abs({Wave} - sin({CLOCK_TIME} / 3600))`.
///
/// Names in braces may contain spaces; bare identifiers are references
/// unless followed by `(`.
pub fn parse_formula(source: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
        end: source.len(),
    };
    let expr = parser.or()?;
    if let Some(token) = parser.peek() {
        return Err(parse_error(
            parser.offset(),
            format!("unexpected trailing '{token}'"),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use qc_columnar::{ArithmeticOp, BitMask, Column, ComparisonOp};
    use qc_frame::TimeFrame;
    use qc_index::TimeIndex;

    use super::{EvalContext, Expr, ExprError, Function, Signal, evaluate, parse_formula};

    fn frame() -> TimeFrame {
        let index = TimeIndex::new(
            (0..3)
                .map(|h| {
                    NaiveDate::from_ymd_opt(2015, 1, 1)
                        .and_then(|d| d.and_hms_opt(h, 0, 0))
                        .expect("valid timestamp")
                })
                .collect(),
        );
        TimeFrame::from_values(
            index,
            vec![
                ("A", vec![1.0, 2.0, 3.0]),
                ("Wave C", vec![-1.0, 0.0, 1.0]),
                ("D", vec![4.0, 5.0, f64::NAN]),
            ],
        )
        .expect("frame")
    }

    fn groups() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            "Wave".to_owned(),
            vec!["Wave C".to_owned(), "D".to_owned()],
        )])
    }

    #[test]
    fn precedence_follows_arithmetic_rules() {
        let expr = parse_formula("1 + 2 * {A} - -3").expect("parse");
        let expected = (Expr::lit(1.0) + Expr::lit(2.0) * Expr::reference("A")) - -Expr::lit(3.0);
        assert_eq!(expr, expected);
        let frame = frame();
        let out = evaluate(&expr, &EvalContext::new(&frame)).expect("eval");
        assert_eq!(out, Signal::Numeric(vec![Column::new(vec![6.0, 8.0, 10.0])]));
    }

    #[test]
    fn logical_keywords_and_symbols_parse_alike() {
        let words = parse_formula("not {A} > 1 and {A} < 3 or {A} == 3").expect("words");
        let symbols = parse_formula("~ {A} > 1 & {A} < 3 | {A} == 3").expect("symbols");
        assert_eq!(words, symbols);
        let frame = frame();
        let out = evaluate(&words, &EvalContext::new(&frame))
            .and_then(Signal::into_masks)
            .expect("eval");
        assert_eq!(out, vec![BitMask::from_bools(&[true, false, true])]);
    }

    #[test]
    fn groups_broadcast_against_single_columns() {
        let frame = frame();
        let groups = groups();
        let context = EvalContext::new(&frame).with_groups(&groups);
        let expr = parse_formula("abs({Wave} - {A})").expect("parse");
        let out = evaluate(&expr, &context)
            .and_then(|s| s.into_columns(frame.len()))
            .expect("eval");
        assert_eq!(
            out,
            vec![
                Column::new(vec![2.0, 2.0, 2.0]),
                Column::new(vec![3.0, 3.0, f64::NAN]),
            ]
        );
    }

    #[test]
    fn time_keywords_and_constants_resolve() {
        let frame = frame();
        let constants = BTreeMap::from([("scale".to_owned(), 2.0)]);
        let context = EvalContext::new(&frame).with_constants(&constants);
        let expr = parse_formula("{ELAPSED_TIME} / 3600 * scale").expect("parse");
        assert_eq!(
            evaluate(&expr, &context).expect("eval"),
            Signal::Numeric(vec![Column::new(vec![0.0, 2.0, 4.0])])
        );
        let expr = parse_formula("{CLOCK_TIME} >= 3600").expect("parse");
        assert_eq!(
            evaluate(&expr, &context).and_then(Signal::into_masks),
            Ok(vec![BitMask::from_bools(&[false, true, true])])
        );
    }

    #[test]
    fn columns_shadow_groups_and_constants() {
        let frame = frame();
        let groups = BTreeMap::from([("A".to_owned(), vec!["D".to_owned()])]);
        let constants = BTreeMap::from([("A".to_owned(), 100.0)]);
        let context = EvalContext::new(&frame)
            .with_groups(&groups)
            .with_constants(&constants);
        assert_eq!(
            evaluate(&Expr::reference("A"), &context),
            Ok(Signal::Numeric(vec![Column::new(vec![1.0, 2.0, 3.0])]))
        );
    }

    #[test]
    fn lone_numbers_broadcast_to_a_column() {
        let frame = frame();
        let out = evaluate(&parse_formula("2 * 3").expect("parse"), &EvalContext::new(&frame))
            .and_then(|s| s.into_columns(3))
            .expect("eval");
        assert_eq!(out, vec![Column::new(vec![6.0; 3])]);
    }

    #[test]
    fn evaluation_errors_are_typed() {
        let frame = frame();
        let groups = groups();
        let context = EvalContext::new(&frame).with_groups(&groups);
        assert_eq!(
            evaluate(&Expr::reference("missing"), &context),
            Err(ExprError::UnknownReference("missing".to_owned()))
        );
        let three = BTreeMap::from([(
            "Three".to_owned(),
            vec!["A".to_owned(), "D".to_owned(), "Wave C".to_owned()],
        )]);
        let context3 = EvalContext::new(&frame).with_groups(&three);
        let expr = Expr::reference("Three") + Expr::reference("Three");
        assert!(evaluate(&expr, &context3).is_ok());
        let mut both = groups.clone();
        both.extend(three);
        let context = EvalContext::new(&frame).with_groups(&both);
        assert_eq!(
            evaluate(&(Expr::reference("Wave") + Expr::reference("Three")), &context),
            Err(ExprError::ShapeMismatch { left: 2, right: 3 })
        );
        let cond = Expr::reference("A").compare(ComparisonOp::Gt, Expr::lit(1.0));
        assert!(matches!(
            evaluate(&cond.clone().arith(ArithmeticOp::Add, Expr::lit(1.0)), &context),
            Err(ExprError::TypeMismatch(_))
        ));
        assert!(matches!(
            evaluate(&Expr::reference("A").and(cond), &context),
            Err(ExprError::TypeMismatch(_))
        ));
    }

    #[test]
    fn parse_errors_report_offsets() {
        assert!(matches!(
            parse_formula("{A} +"),
            Err(ExprError::Parse { offset: 5, .. })
        ));
        assert!(matches!(
            parse_formula("({A}"),
            Err(ExprError::Parse { offset: 4, .. })
        ));
        assert!(matches!(
            parse_formula("{A"),
            Err(ExprError::Parse { offset: 0, .. })
        ));
        assert!(matches!(
            parse_formula("{A} {B}"),
            Err(ExprError::Parse { offset: 4, .. })
        ));
        assert_eq!(
            parse_formula("median({A})"),
            Err(ExprError::UnknownFunction("median".to_owned()))
        );
        assert_eq!(
            parse_formula("sqrt(1e2)"),
            Ok(Expr::call(Function::Sqrt, Expr::lit(100.0)))
        );
    }

    #[test]
    fn expressions_serialize_with_kind_tags() {
        let expr = parse_formula("{A} > 1").expect("parse");
        let json = serde_json::to_value(&expr).expect("serialize");
        assert_eq!(json["kind"], "compare");
        assert_eq!(json["op"], "gt");
        let back: Expr = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, expr);
    }
}
