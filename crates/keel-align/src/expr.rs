//! Sandboxed enforcement-expression interpreter.
//!
//! Grammar (recursive descent, no function calls, no loops):
//!
//! ```text
//! expr    := and ( "or" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | cmp
//! cmp     := operand ( ("==" | "!=" | "<" | "<=" | ">" | ">=" | "contains") operand )?
//! operand := ident ("." ident)* | string | number | "true" | "false" | "(" expr ")"
//! ```
//!
//! Evaluation happens against a flat context of turn variables plus the
//! generated `response` text.

use std::collections::HashMap;

use keel_core::FieldValue;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        left: Operand,
        op: &'static str,
        right: Operand,
    },
    Truthy(Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Field(Vec<String>),
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Missing,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token")]
    UnexpectedToken,
    #[error("function calls are not permitted")]
    CallNotPermitted,
    #[error("type mismatch in comparison")]
    TypeMismatch,
}

/// Evaluation context: turn variables plus the generated response.
#[derive(Debug, Default)]
pub struct EvalContext {
    values: HashMap<String, EvalValue>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, response: &str) -> Self {
        self.values
            .insert("response".to_string(), EvalValue::Str(response.to_string()));
        self
    }

    pub fn set_field(mut self, name: &str, value: &FieldValue) -> Self {
        let v = match value {
            FieldValue::Str(s) => EvalValue::Str(s.clone()),
            FieldValue::Int(i) => EvalValue::Num(*i as f64),
            FieldValue::Float(f) => EvalValue::Num(*f),
            FieldValue::Bool(b) => EvalValue::Bool(*b),
            FieldValue::Timestamp(ts) => EvalValue::Str(ts.to_rfc3339()),
            FieldValue::Json(j) => EvalValue::Str(j.to_string()),
        };
        self.values.insert(name.to_string(), v);
        self
    }

    fn lookup(&self, path: &[String]) -> EvalValue {
        // Dotted access flattens to a joined key; the context is flat.
        let key = path.join(".");
        self.values.get(&key).cloned().unwrap_or(EvalValue::Missing)
    }
}

/// Parse and evaluate an enforcement expression. Missing fields compare as
/// unequal to everything and falsy on their own.
pub fn evaluate(expression: &str, ctx: &EvalContext) -> Result<bool, ExprError> {
    let tokens = lex(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::UnexpectedToken);
    }
    Ok(eval(&expr, ctx)?)
}

fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(ExprError::UnterminatedString);
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar(c, i));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar(c, i));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedChar(c, start))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::Op("and")),
                    "or" => tokens.push(Token::Op("or")),
                    "not" => tokens.push(Token::Op("not")),
                    "contains" => tokens.push(Token::Op("contains")),
                    "true" => tokens.push(Token::Ident("true".into())),
                    "false" => tokens.push(Token::Ident("false".into())),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => return Err(ExprError::UnexpectedChar(c, i)),
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

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op("or")) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::Op("and")) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Op("not")) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(ExprError::UnexpectedToken);
            }
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Op(op))
                if matches!(*op, "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains") =>
            {
                let op = *op;
                self.next();
                op
            }
            _ => return Ok(Expr::Truthy(left)),
        };
        let right = self.parse_operand()?;
        Ok(Expr::Cmp { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Ident(word)) => {
                // A following '(' would be a call: forbidden by design.
                if self.peek() == Some(&Token::LParen) {
                    return Err(ExprError::CallNotPermitted);
                }
                match word.as_str() {
                    "true" => Ok(Operand::Bool(true)),
                    "false" => Ok(Operand::Bool(false)),
                    _ => Ok(Operand::Field(
                        word.split('.').map(|s| s.to_string()).collect(),
                    )),
                }
            }
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            Some(_) => Err(ExprError::UnexpectedToken),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

fn eval(expr: &Expr, ctx: &EvalContext) -> Result<bool, ExprError> {
    match expr {
        Expr::Or(a, b) => Ok(eval(a, ctx)? || eval(b, ctx)?),
        Expr::And(a, b) => Ok(eval(a, ctx)? && eval(b, ctx)?),
        Expr::Not(inner) => Ok(!eval(inner, ctx)?),
        Expr::Truthy(operand) => Ok(match resolve(operand, ctx) {
            EvalValue::Bool(b) => b,
            EvalValue::Num(n) => n != 0.0,
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Missing => false,
        }),
        Expr::Cmp { left, op, right } => {
            let l = resolve(left, ctx);
            let r = resolve(right, ctx);
            compare(&l, op, &r)
        }
    }
}

fn resolve(operand: &Operand, ctx: &EvalContext) -> EvalValue {
    match operand {
        Operand::Field(path) => ctx.lookup(path),
        Operand::Str(s) => EvalValue::Str(s.clone()),
        Operand::Num(n) => EvalValue::Num(*n),
        Operand::Bool(b) => EvalValue::Bool(*b),
    }
}

fn compare(left: &EvalValue, op: &str, right: &EvalValue) -> Result<bool, ExprError> {
    use EvalValue::*;
    match op {
        "==" => Ok(loose_eq(left, right)),
        "!=" => Ok(!loose_eq(left, right)),
        "contains" => match (left, right) {
            (Str(haystack), Str(needle)) => {
                Ok(haystack.to_lowercase().contains(&needle.to_lowercase()))
            }
            (Missing, _) => Ok(false),
            _ => Err(ExprError::TypeMismatch),
        },
        "<" | "<=" | ">" | ">=" => match (left, right) {
            (Num(a), Num(b)) => Ok(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            }),
            (Missing, _) | (_, Missing) => Ok(false),
            _ => Err(ExprError::TypeMismatch),
        },
        _ => Err(ExprError::UnexpectedToken),
    }
}

fn loose_eq(left: &EvalValue, right: &EvalValue) -> bool {
    use EvalValue::*;
    match (left, right) {
        (Str(a), Str(b)) => a == b,
        (Num(a), Num(b)) => a == b,
        (Bool(a), Bool(b)) => a == b,
        (Missing, Missing) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalContext {
        EvalContext::new()
            .with_response("Your limit is 40 dollars")
            .set_field("amount", &FieldValue::Int(42))
            .set_field("tier", &FieldValue::Str("gold".into()))
            .set_field("verified", &FieldValue::Bool(true))
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate("amount <= 50", &ctx()).unwrap());
        assert!(!evaluate("amount < 42", &ctx()).unwrap());
        assert!(evaluate("amount >= 42", &ctx()).unwrap());
        assert!(evaluate("amount != 41", &ctx()).unwrap());
    }

    #[test]
    fn string_equality_and_contains() {
        assert!(evaluate("tier == \"gold\"", &ctx()).unwrap());
        assert!(evaluate("response contains \"limit\"", &ctx()).unwrap());
        assert!(evaluate("response contains \"LIMIT\"", &ctx()).unwrap());
        assert!(!evaluate("response contains \"refund\"", &ctx()).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        assert!(evaluate("amount <= 50 and tier == \"gold\"", &ctx()).unwrap());
        assert!(evaluate("amount > 100 or verified", &ctx()).unwrap());
        assert!(evaluate("not (amount > 100)", &ctx()).unwrap());
    }

    #[test]
    fn missing_fields_are_falsy_and_unequal() {
        assert!(!evaluate("unknown_field", &ctx()).unwrap());
        assert!(!evaluate("unknown_field == \"x\"", &ctx()).unwrap());
        assert!(!evaluate("unknown_field > 3", &ctx()).unwrap());
    }

    #[test]
    fn function_calls_are_rejected() {
        assert_eq!(
            evaluate("len(response) > 3", &ctx()).unwrap_err(),
            ExprError::CallNotPermitted
        );
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(evaluate("amount <", &ctx()).is_err());
        assert!(evaluate("\"unterminated", &ctx()).is_err());
        assert!(evaluate("amount = 5", &ctx()).is_err());
    }
}
