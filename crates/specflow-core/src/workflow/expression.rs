//! Condition expressions: the small language behind `condition`, `failWhen`,
//! `source` and `input`.
//!
//! ```text
//! review.hasActionableIssues
//! tasks.length === 0
//! !analysis.skip && (mode == "full" || retries < 3)
//! ```
//!
//! Paths resolve through a [`Scope`]; a missing path evaluates to `null`.
//! Expressions are parsed once at validation time (syntax only) and again
//! when a step runs.

use serde_json::Value;

use crate::error::ExpressionError;
use crate::workflow::template::Scope;

/// Comparison operators. `==`/`===` and `!=`/`!==` are equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Not,
    And,
    Or,
    Op(CompareOp),
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Path(p) => p.clone(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Num(n) => n.to_string(),
            Token::True => "true".into(),
            Token::False => "false".into(),
            Token::Null => "null".into(),
            Token::Not => "!".into(),
            Token::And => "&&".into(),
            Token::Or => "||".into(),
            Token::Op(op) => format!("{:?}", op),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

fn is_path_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '@' || c == '$'
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '$' | '-' | '.')
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += if next2 == Some('=') { 3 } else { 2 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += if next2 == Some('=') { 3 } else { 2 };
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' => {
                if next == Some('=') {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if next == Some('=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                out.push(*escaped);
                                i += 2;
                            } else {
                                return Err(ExpressionError::UnterminatedString);
                            }
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            out.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.map(|n| n.is_ascii_digit()).unwrap_or(false)) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if is_path_start(c) => {
                let start = i;
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.ends_with('.') || word.contains("..") {
                    return Err(ExpressionError::UnexpectedToken(word));
                }
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_unary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            None => Err(ExpressionError::UnexpectedEnd),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Parse an expression string.
pub fn parse(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ExpressionError::UnexpectedToken(extra.describe()));
    }
    Ok(expr)
}

/// Parse and evaluate in one go.
pub fn evaluate_str(src: &str, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    Ok(parse(src)?.evaluate(scope))
}

/// Parse, evaluate and coerce to a boolean.
pub fn evaluate_truthy(src: &str, scope: &dyn Scope) -> Result<bool, ExpressionError> {
    Ok(is_truthy(&evaluate_str(src, scope)?))
}

impl Expr {
    pub fn evaluate(&self, scope: &dyn Scope) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(p) => scope.lookup(p).unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(scope))),
            Expr::And(l, r) => {
                Value::Bool(is_truthy(&l.evaluate(scope)) && is_truthy(&r.evaluate(scope)))
            }
            Expr::Or(l, r) => {
                Value::Bool(is_truthy(&l.evaluate(scope)) || is_truthy(&r.evaluate(scope)))
            }
            Expr::Compare(op, l, r) => Value::Bool(compare(*op, &l.evaluate(scope), &r.evaluate(scope))),
        }
    }
}

/// JavaScript-like truthiness, except that empty arrays and objects are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Ne => !values_equal(a, b),
        _ => {
            let ordering = match (a, b) {
                (Value::Number(x), Value::Number(y)) => {
                    x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
                }
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            }
        }
    }
}
